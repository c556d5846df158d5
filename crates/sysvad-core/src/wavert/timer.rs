//! Periodic notification timer
//!
//! Emulates the hardware interrupt that drives buffer completion. The
//! contract that matters is [`NotificationTimer::cancel`]: it returns only
//! after any in-flight callback has finished, so once a stream leaves Run
//! no callback can observe state reset by a later Stop.
//!
//! - [`ThreadTimer`]: dedicated thread with drift-free deadlines
//! - [`ManualTimer`]: fired by hand from tests and simulations

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// What the timer should do after a callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Continue,
    /// Disarm the timer; used when the final buffer has been rendered
    Cancel,
}

/// Callback run on every timer expiry
pub type TimerCallback = Arc<dyn Fn() -> TimerAction + Send + Sync>;

/// Cancellable periodic timer
pub trait NotificationTimer: Send + Sync {
    /// Arm the timer; the first expiry is one period from now
    ///
    /// Re-arming replaces any previous callback.
    fn set(&self, period: Duration, callback: TimerCallback);

    /// Disarm the timer and wait for an in-flight callback to finish
    fn cancel(&self);

    /// Whether the timer is currently armed
    fn is_armed(&self) -> bool;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct TimerState {
    armed: bool,
    /// Bumped on every set/cancel so a stale expiry never fires
    generation: u64,
    period: Duration,
    next_deadline: Instant,
    callback: Option<TimerCallback>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    /// Held while a callback runs; cancel acquires it to wait the callback out
    gate: Mutex<()>,
}

/// Timer backed by a dedicated thread
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl ThreadTimer {
    /// Spawn the timer thread
    ///
    /// # Arguments
    /// * `name` - Thread name, shown in debuggers and panic messages
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                armed: false,
                generation: 0,
                period: Duration::from_millis(1),
                next_deadline: Instant::now(),
                callback: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            gate: Mutex::new(()),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&worker))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            shared,
            thread: Some(thread),
            thread_id,
        })
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut st = lock(&shared.state);
    loop {
        if st.shutdown {
            return;
        }
        if !st.armed {
            st = match shared.cond.wait(st) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            continue;
        }

        let now = Instant::now();
        if now < st.next_deadline {
            let wait = st.next_deadline - now;
            st = match shared.cond.wait_timeout(st, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            continue;
        }

        let generation = st.generation;
        let Some(callback) = st.callback.clone() else {
            st.armed = false;
            continue;
        };
        let period = st.period;
        st.next_deadline += period;
        if st.next_deadline <= now {
            // Fell behind by more than a period; skip the missed expiries
            st.next_deadline = now + period;
        }
        drop(st);

        {
            let _gate = lock(&shared.gate);
            let live = {
                let s = lock(&shared.state);
                s.armed && s.generation == generation
            };
            if live {
                let action = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback()
                })) {
                    Ok(action) => action,
                    Err(_) => {
                        tracing::error!("Notification timer callback PANICKED, disarming");
                        TimerAction::Cancel
                    }
                };
                if action == TimerAction::Cancel {
                    let mut s = lock(&shared.state);
                    if s.generation == generation {
                        s.armed = false;
                        s.callback = None;
                    }
                }
            }
        }

        st = lock(&shared.state);
    }
}

impl NotificationTimer for ThreadTimer {
    fn set(&self, period: Duration, callback: TimerCallback) {
        let period = period.max(Duration::from_micros(100));
        let mut st = lock(&self.shared.state);
        st.armed = true;
        st.generation = st.generation.wrapping_add(1);
        st.period = period;
        st.next_deadline = Instant::now() + period;
        st.callback = Some(callback);
        self.shared.cond.notify_all();
    }

    fn cancel(&self) {
        {
            let mut st = lock(&self.shared.state);
            st.armed = false;
            st.generation = st.generation.wrapping_add(1);
            st.callback = None;
            self.shared.cond.notify_all();
        }
        // From inside a callback the gate is already ours
        if std::thread::current().id() != self.thread_id {
            drop(lock(&self.shared.gate));
        }
    }

    fn is_armed(&self) -> bool {
        lock(&self.shared.state).armed
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.shared.state);
            st.shutdown = true;
            st.armed = false;
            st.callback = None;
            self.shared.cond.notify_all();
        }
        if let Some(h) = self.thread.take() {
            if h.thread().id() != std::thread::current().id() {
                if h.join().is_err() {
                    tracing::error!("Notification timer thread panicked");
                }
            }
        }
    }
}

#[derive(Default)]
struct ManualState {
    period: Option<Duration>,
    callback: Option<TimerCallback>,
    fired: u64,
}

/// Timer that only expires when [`fire`](ManualTimer::fire) is called
///
/// Clones share state, so a test keeps one handle and gives the other to
/// the stream.
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one expiry; returns false if the timer was not armed
    pub fn fire(&self) -> bool {
        let callback = {
            let st = lock(&self.state);
            match &st.callback {
                Some(cb) => Arc::clone(cb),
                None => return false,
            }
        };
        let action = callback();
        let mut st = lock(&self.state);
        st.fired += 1;
        if action == TimerAction::Cancel {
            st.callback = None;
            st.period = None;
        }
        true
    }

    /// Period the timer was last armed with
    pub fn period(&self) -> Option<Duration> {
        lock(&self.state).period
    }

    /// Number of expiries run so far
    pub fn fired(&self) -> u64 {
        lock(&self.state).fired
    }
}

impl NotificationTimer for ManualTimer {
    fn set(&self, period: Duration, callback: TimerCallback) {
        let mut st = lock(&self.state);
        st.period = Some(period);
        st.callback = Some(callback);
    }

    fn cancel(&self) {
        let mut st = lock(&self.state);
        st.period = None;
        st.callback = None;
    }

    fn is_armed(&self) -> bool {
        lock(&self.state).callback.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_thread_timer_fires_periodically() {
        let timer = ThreadTimer::new("test-timer").unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        timer.set(
            Duration::from_millis(1),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                TimerAction::Continue
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        timer.cancel();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 5, "expected several expiries in 50ms, got {fired}");

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), fired, "no expiry after cancel");
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_cancel_waits_for_in_flight_callback() {
        let timer = ThreadTimer::new("test-timer-wait").unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (e, f) = (Arc::clone(&entered), Arc::clone(&finished));
        timer.set(
            Duration::from_millis(1),
            Arc::new(move || {
                e.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                f.store(true, Ordering::SeqCst);
                TimerAction::Continue
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_micros(200));
        }
        assert!(entered.load(Ordering::SeqCst), "callback never started");
        timer.cancel();
        assert!(
            finished.load(Ordering::SeqCst),
            "cancel returned while callback still running"
        );
    }

    #[test]
    fn test_callback_cancel_action_disarms() {
        let timer = ThreadTimer::new("test-timer-self-cancel").unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        timer.set(
            Duration::from_millis(1),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                TimerAction::Cancel
            }),
        );
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_manual_timer() {
        let timer = ManualTimer::new();
        assert!(!timer.fire(), "unarmed timer must not run");

        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let handle = timer.clone();
        handle.set(
            Duration::from_millis(1),
            Arc::new(move || {
                if c.fetch_add(1, Ordering::SeqCst) == 2 {
                    TimerAction::Cancel
                } else {
                    TimerAction::Continue
                }
            }),
        );
        assert_eq!(timer.period(), Some(Duration::from_millis(1)));
        while timer.fire() {}
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(timer.fired(), 3);
        assert!(!handle.is_armed());
    }
}
