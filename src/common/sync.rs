//! Manual-reset event used for the `not_full` / `is_empty` array signals and the
//! per-segment wake events.
//!
//! An `Event` stays signaled until `reset()` is called; every waiter blocked in
//! `wait()` is released by `set()`. A waiter that arrives while the event is
//! already signaled returns immediately.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Debug)]
struct EventState {
    is_set: bool,
    /// Bumped on every `set()` so waiters can tell a fresh signal from a stale one.
    signal_count: u64,
}

impl Event {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                is_set: initially_set,
                signal_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        if !state.is_set {
            state.is_set = true;
            state.signal_count += 1;
            self.cond.notify_all();
        }
    }

    /// Resets the event and returns the signal count observed at reset time.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.is_set = false;
        state.signal_count
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().is_set
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        let count = state.signal_count;
        while !state.is_set && state.signal_count == count {
            self.cond.wait(&mut state);
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(false)
    }
}
