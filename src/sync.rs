//! Blocking primitives shared between callers and the transport's completion context.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn relock<'a, T>(r: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    r.unwrap_or_else(PoisonError::into_inner)
}

/// A lock which can give up after a timeout.
///
/// The protected value is moved out of the slot while locked and moved back when the
/// guard is dropped, so waiters only ever see an empty or a full slot.
pub(crate) struct TimedMutex<T> {
    slot: Mutex<Option<T>>,
    freed: Condvar,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        TimedMutex { slot: Mutex::new(Some(value)), freed: Condvar::new() }
    }

    /// Lock, waiting at most `timeout`. Returns None if the lock was not obtained.
    pub fn lock_timeout(&self, timeout: Duration) -> Option<TimedGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = relock(self.slot.lock());
        loop {
            if let Some(value) = slot.take() {
                return Some(TimedGuard { lock: self, value: Some(value) });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .freed
                .wait_timeout(slot, deadline - now)
                .map(|(slot, _)| slot)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

pub(crate) struct TimedGuard<'a, T> {
    lock: &'a TimedMutex<T>,
    value: Option<T>,
}

impl<'a, T> Deref for TimedGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value present while locked")
    }
}

impl<'a, T> DerefMut for TimedGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value present while locked")
    }
}

impl<'a, T> Drop for TimedGuard<'a, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            *relock(self.lock.slot.lock()) = Some(value);
            self.lock.freed.notify_one();
        }
    }
}

/// Identifies one issued operation on an [`EventHandle`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Token(u64);

#[derive(Debug, Default)]
struct CompletionState {
    /// Token of the operation currently awaited.
    armed: u64,
    done: bool,
}

/// Latched completion flag.
#[derive(Debug, Default)]
struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

/// Handle used by a transport to report that a deferred operation has finished.
///
/// Every issued operation is given a new [`Token`]. A transport which may complete
/// after the engine has given up on an operation should capture [`EventHandle::token`]
/// when the operation starts and report with [`EventHandle::signal_for`], so that a
/// late completion is dropped instead of ending whichever operation is now awaited.
///
/// Cloning the handle is cheap; all clones refer to the same event.
#[derive(Clone, Debug, Default)]
pub struct EventHandle(Arc<Completion>);

impl EventHandle {
    pub fn new() -> Self {
        EventHandle::default()
    }

    /// Token of the most recently issued operation.
    pub fn token(&self) -> Token {
        Token(relock(self.0.state.lock()).armed)
    }

    /// Report completion of the most recently issued operation.
    pub fn signal(&self) {
        let mut state = relock(self.0.state.lock());
        state.done = true;
        self.0.cond.notify_one();
    }

    /// Report completion of the operation identified by `token`.
    ///
    /// Ignored if another operation has been issued since.
    pub fn signal_for(&self, token: Token) {
        let mut state = relock(self.0.state.lock());
        if state.armed != token.0 {
            log::trace!("Dropping stale completion {:?}, awaiting {}", token, state.armed);
            return;
        }
        state.done = true;
        self.0.cond.notify_one();
    }

    /// Start a new operation, discarding any pending completion.
    pub(crate) fn arm(&self) -> Token {
        let mut state = relock(self.0.state.lock());
        state.armed = state.armed.wrapping_add(1);
        state.done = false;
        Token(state.armed)
    }

    /// Block until signalled or until `timeout` elapses.
    ///
    /// Returns true if the event was signalled, consuming the signal.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = relock(self.0.state.lock());
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .0
                .cond
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        state.done = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_signalled_before_wait_is_latched() {
        let event = EventHandle::new();
        event.signal();
        assert!(event.wait(Duration::from_millis(1)));
        // The signal is consumed by the first wait.
        assert!(!event.wait(Duration::from_millis(1)));
    }

    #[test]
    fn event_rearm_discards_pending_signal() {
        let event = EventHandle::new();
        event.signal();
        event.arm();
        assert!(!event.wait(Duration::from_millis(5)));
    }

    #[test]
    fn stale_token_does_not_signal() {
        let event = EventHandle::new();
        let first = event.arm();
        assert_eq!(event.token(), first);
        let second = event.arm();
        assert_ne!(first, second);

        // Completion for an abandoned operation arrives after the next was issued.
        event.signal_for(first);
        assert!(!event.wait(Duration::from_millis(5)));
        event.signal_for(second);
        assert!(event.wait(Duration::from_millis(1)));
    }

    #[test]
    fn stale_token_from_other_thread_is_dropped() {
        let event = EventHandle::new();
        let stale = event.arm();
        let remote = event.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal_for(stale);
        });
        event.arm();
        assert!(!event.wait(Duration::from_millis(60)));
        t.join().unwrap();
    }

    #[test]
    fn event_signalled_from_other_thread() {
        let event = EventHandle::new();
        let remote = event.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        assert!(event.wait(Duration::from_secs(5)));
        t.join().unwrap();
    }

    #[test]
    fn event_wait_times_out() {
        let event = EventHandle::new();
        let t0 = Instant::now();
        assert!(!event.wait(Duration::from_millis(20)));
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn timed_mutex_excludes_and_releases() {
        let lock = TimedMutex::new(5u32);
        {
            let mut guard = lock.lock_timeout(Duration::from_millis(1)).unwrap();
            *guard += 1;
            assert!(lock.lock_timeout(Duration::from_millis(10)).is_none());
        }
        assert_eq!(*lock.lock_timeout(Duration::from_millis(1)).unwrap(), 6);
    }

    #[test]
    fn timed_mutex_wakes_waiter_on_release() {
        let lock = Arc::new(TimedMutex::new(()));
        let guard = lock.lock_timeout(Duration::from_millis(1)).unwrap();
        let other = Arc::clone(&lock);
        let t = thread::spawn(move || other.lock_timeout(Duration::from_secs(5)).is_some());
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(t.join().unwrap());
    }
}
