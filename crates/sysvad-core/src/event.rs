//! Client notification events
//!
//! A [`NotificationEvent`] is a cloneable auto-reset event. Clones refer to
//! the same underlying event, and identity comparisons use the shared
//! allocation, so a client can register a clone with a stream and later
//! unregister it with another clone.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct EventInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Auto-reset synchronization event signaled by streams and APOs
#[derive(Debug, Clone, Default)]
pub struct NotificationEvent {
    inner: Arc<EventInner>,
}

impl NotificationEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake one waiter
    ///
    /// Never blocks beyond the short internal lock, so it is safe to call
    /// from timer callbacks.
    pub fn signal(&self) {
        let mut signaled = match self.inner.signaled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *signaled = true;
        self.inner.cond.notify_one();
    }

    /// Wait until signaled or the timeout elapses
    ///
    /// Returns `true` if the event was signaled. The event is reset on
    /// a successful wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = match self.inner.signaled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            signaled = match self.inner.cond.wait_timeout(signaled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *signaled = false;
        true
    }

    /// Whether the event is currently set (does not reset it)
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.lock().map(|s| *s).unwrap_or(false)
    }

    /// Consume a pending signal without waiting
    ///
    /// Returns `true` if the event was set.
    pub fn try_take(&self) -> bool {
        if let Ok(mut signaled) = self.inner.signaled.lock() {
            let was = *signaled;
            *signaled = false;
            return was;
        }
        false
    }

    /// Clear the event
    pub fn reset(&self) {
        if let Ok(mut signaled) = self.inner.signaled.lock() {
            *signaled = false;
        }
    }

    /// Whether two handles refer to the same event
    pub fn same_as(&self, other: &NotificationEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for NotificationEvent {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for NotificationEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_then_wait() {
        let event = NotificationEvent::new();
        event.signal();
        assert!(event.is_signaled());
        assert!(event.wait_timeout(Duration::from_millis(1)));
        assert!(!event.is_signaled(), "successful wait should auto-reset");
    }

    #[test]
    fn test_wait_times_out() {
        let event = NotificationEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_clone_identity() {
        let a = NotificationEvent::new();
        let b = a.clone();
        let c = NotificationEvent::new();
        assert_eq!(a, b);
        assert_ne!(a, c);
        b.signal();
        assert!(a.try_take());
        assert!(!a.try_take());
    }

    #[test]
    fn test_cross_thread_wake() {
        let event = NotificationEvent::new();
        let signaler = event.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });
        assert!(event.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
