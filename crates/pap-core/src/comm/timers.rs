//! Named timeout registry.
//!
//! One manager serves one request kind, so every timer it holds shares the
//! same wait; the pending list is therefore always ordered by deadline and
//! expirations fire in registration order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

/// Handler invoked with the timer's key when it expires.
pub type TimeoutHandler = Box<dyn FnOnce(&str) + Send + 'static>;

/// Cancellation handle for a registered timer.
#[derive(Debug, Clone)]
pub struct Timer {
    key: String,
    cancelled: Arc<AtomicBool>,
}

impl Timer {
    /// Disarm the timer. A cancelled timer never fires.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        trace!(key = %self.key, "timer cancelled");
    }

    /// The key this timer was registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct TimerEntry {
    key: String,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    handler: TimeoutHandler,
}

struct TimerState {
    entries: VecDeque<TimerEntry>,
    running: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Registry of single-shot timeouts with a shared wait, serviced by one
/// background worker.
///
/// Several timers may share a key; each registration is independent and
/// callers replace older timers by cancelling them.
pub struct TimerManager {
    name: String,
    max_wait: Duration,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    /// Create the manager and start its worker thread.
    #[must_use]
    pub fn new(name: impl Into<String>, max_wait: Duration) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                entries: VecDeque::new(),
                running: true,
            }),
            changed: Condvar::new(),
        });

        let worker = {
            let name = name.clone();
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("timers-{name}"))
                .spawn(move || run_worker(&name, &shared))
                .expect("failed to spawn timer worker")
        };

        Self {
            name,
            max_wait,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// This manager's name, used in log tags.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wait applied to every timer registered here.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Schedule `handler(key)` to run after the configured wait.
    pub fn register(&self, key: impl Into<String>, handler: TimeoutHandler) -> Timer {
        let key = key.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = Timer {
            key: key.clone(),
            cancelled: Arc::clone(&cancelled),
        };

        let mut state = self.shared.state.lock().expect("lock poisoned");
        if state.running {
            state.entries.push_back(TimerEntry {
                key,
                deadline: Instant::now() + self.max_wait,
                cancelled,
                handler,
            });
            self.shared.changed.notify_one();
        } else {
            debug!(manager = %self.name, key = %timer.key, "manager stopped; timer will never fire");
        }

        timer
    }

    /// Stop the worker; pending timers are dropped without firing.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.running = false;
            state.entries.clear();
            self.shared.changed.notify_all();
        }

        if let Some(worker) = self.worker.lock().expect("lock poisoned").take()
            && worker.join().is_err()
        {
            error!(manager = %self.name, "timer worker panicked");
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, shared: &Shared) {
    loop {
        let entry = {
            let mut state = shared.state.lock().expect("lock poisoned");
            loop {
                if !state.running {
                    return;
                }

                match state.entries.front() {
                    None => {
                        state = shared.changed.wait(state).expect("lock poisoned");
                    }
                    Some(head) => {
                        let now = Instant::now();
                        if head.deadline <= now {
                            break state.entries.pop_front().expect("head checked above");
                        }
                        let wait = head.deadline - now;
                        let (next, _timeout) = shared
                            .changed
                            .wait_timeout(state, wait)
                            .expect("lock poisoned");
                        state = next;
                    }
                }
            }
        };

        if entry.cancelled.load(Ordering::SeqCst) {
            continue;
        }

        trace!(manager = %name, key = %entry.key, "timer expired");
        (entry.handler)(&entry.key);
    }
}
