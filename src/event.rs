//! Barrier events for the frame pipeline
//!
//! The pipeline choreography needs nothing more than "signal once, wait
//! once" per frame with prompt shutdown, so a tiny purpose-built primitive is
//! used instead of hand-wrapping condition variables at every site: a
//! single-consumer event whose `wait` consumes the signal, plus a sticky
//! `stop` flag that wakes and permanently releases any waiter.

use std::sync::{Condvar, Mutex};

/// Returned by [`SignalEvent::wait`] once the event has been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

#[derive(Debug)]
struct EventState {
    signaled: bool,
    stopped: bool,
}

/// A single-producer, single-consumer barrier event with stop semantics.
#[derive(Debug)]
pub struct SignalEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl SignalEvent {
    /// A fresh, unsignaled event.
    pub fn new() -> Self {
        Self::with_signaled(false)
    }

    /// An event that starts in the signaled state.
    ///
    /// The coordinator's end event starts signaled so the very first frame's
    /// `wait_end` on the ingest side falls straight through.
    pub fn with_signaled(signaled: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                signaled,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Raise the event, waking the waiter.
    pub fn signal(&self) {
        let mut st = self.state.lock().unwrap();
        st.signaled = true;
        drop(st);
        self.cond.notify_all();
    }

    /// Block until signaled, consuming the signal.
    ///
    /// Returns `Err(Stopped)` immediately (or as soon as `stop` lands) once
    /// the event is stopped; the signal flag is left untouched in that case.
    pub fn wait(&self) -> Result<(), Stopped> {
        let mut st = self.state.lock().unwrap();
        while !st.signaled && !st.stopped {
            st = self.cond.wait(st).unwrap();
        }
        if st.stopped {
            return Err(Stopped);
        }
        st.signaled = false;
        Ok(())
    }

    /// Permanently release this event; every current and future `wait`
    /// returns `Err(Stopped)`.
    pub fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stopped = true;
        drop(st);
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

impl Default for SignalEvent {
    fn default() -> Self {
        Self::new()
    }
}
