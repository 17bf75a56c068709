//! Timed Events
//!
//! A single background thread that fires callbacks after a delay. Timers
//! and delays use it to add conditions to, or wake, logical threads. The
//! callbacks run on the timer thread without any queue lock held, so they
//! must be short.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle used to cancel a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken {
    due: Instant,
    id: u64,
}

struct TimerState {
    events: BTreeMap<(Instant, u64), Callback>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Delayed callback queue.
pub struct TimedEventQueue {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimedEventQueue {
    /// Starts the timer thread.
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                events: BTreeMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("actiontree-timers".to_string())
            .spawn(move || run(runner))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Runs `callback` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let due = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.events.insert((due, id), Box::new(callback));
        drop(state);
        self.shared.changed.notify_one();
        debug!("Timed event {} scheduled in {:?}", id, delay);
        TimerToken { due, id }
    }

    /// Cancels a pending event; false if it already fired or was cancelled.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let removed = self
            .shared
            .state
            .lock()
            .events
            .remove(&(token.due, token.id))
            .is_some();
        if removed {
            self.shared.changed.notify_one();
        }
        removed
    }

    /// Number of events waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// Stops the timer thread, dropping pending events.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.events)
        };
        drop(dropped);
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            // The last owner may be a callback running on the timer thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
            info!("Timer thread stopped");
        }
    }
}

impl Drop for TimedEventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next_due = state.events.keys().next().map(|(due, _)| *due);
        match next_due {
            None => shared.changed.wait(&mut state),
            Some(due) if due > Instant::now() => {
                shared.changed.wait_until(&mut state, due);
            }
            Some(_) => {
                if let Some((_, callback)) = state.events.pop_first() {
                    drop(state);
                    callback();
                    state = shared.state.lock();
                }
            }
        }
    }
}
