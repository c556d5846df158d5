//! KS stream states and the allowed transitions between them

use super::error::StreamError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel-streaming pin state
///
/// Ordered so that `Stop < Acquire < Pause < Run`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum KsState {
    #[default]
    Stop,
    Acquire,
    Pause,
    Run,
}

impl KsState {
    fn rank(self) -> i32 {
        match self {
            KsState::Stop => 0,
            KsState::Acquire => 1,
            KsState::Pause => 2,
            KsState::Run => 3,
        }
    }

    /// Whether the state machine permits moving from `self` to `to`
    ///
    /// Permitted: staying put, one step up or down, `Acquire -> Run`, and
    /// any state back to `Stop`.
    ///
    /// # Example
    /// ```
    /// use sysvad_core::wavert::KsState;
    ///
    /// assert!(KsState::Pause.can_transition_to(KsState::Run));
    /// assert!(KsState::Run.can_transition_to(KsState::Stop));
    /// assert!(!KsState::Stop.can_transition_to(KsState::Run));
    /// ```
    pub fn can_transition_to(self, to: KsState) -> bool {
        if to == KsState::Stop || to == self {
            return true;
        }
        if self == KsState::Acquire && to == KsState::Run {
            return true;
        }
        (self.rank() - to.rank()).abs() == 1
    }

    /// Same as [`can_transition_to`](Self::can_transition_to) but as a status
    pub fn check_transition(self, to: KsState) -> Result<(), StreamError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(StreamError::InvalidDeviceState)
        }
    }
}

impl fmt::Display for KsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KsState::Stop => "STOP",
            KsState::Acquire => "ACQUIRE",
            KsState::Pause => "PAUSE",
            KsState::Run => "RUN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [KsState; 4] = [KsState::Stop, KsState::Acquire, KsState::Pause, KsState::Run];

    #[test]
    fn test_ordering() {
        assert!(KsState::Stop < KsState::Acquire);
        assert!(KsState::Acquire < KsState::Pause);
        assert!(KsState::Pause < KsState::Run);
    }

    #[test]
    fn test_any_state_can_stop() {
        for s in ALL {
            assert!(s.can_transition_to(KsState::Stop), "{s} -> STOP must be allowed");
        }
    }

    #[test]
    fn test_transition_table() {
        use KsState::*;
        let allowed = [
            (Stop, Acquire),
            (Acquire, Pause),
            (Pause, Run),
            (Run, Pause),
            (Pause, Acquire),
            (Acquire, Run),
        ];
        let rejected = [(Stop, Pause), (Stop, Run), (Run, Acquire)];
        for (from, to) in allowed {
            assert!(from.check_transition(to).is_ok(), "{from} -> {to}");
        }
        for (from, to) in rejected {
            assert_eq!(
                from.check_transition(to),
                Err(StreamError::InvalidDeviceState),
                "{from} -> {to}"
            );
        }
    }
}
