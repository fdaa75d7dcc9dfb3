//! Single-writer pump from the token queue to the bus sink.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::bus::BusSink;
use super::token::QueueToken;

/// How long the worker backs off after a transport failure.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Error raised when enqueueing with the publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// The publisher has been stopped.
    #[error("publisher for {0} is stopped")]
    Stopped(String),
}

struct QueueState {
    tokens: VecDeque<Arc<QueueToken>>,
    running: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
}

/// Publishes token messages to one topic, in enqueue order, from a single
/// background worker.
///
/// Enqueueing never blocks. A token whose slot was emptied before the worker
/// reaches it is discarded silently. A transport failure keeps the message
/// at the head of the queue and retries after a short delay, so nothing is
/// lost while the bus is down.
pub struct Publisher {
    topic: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Create the publisher and start its worker thread.
    #[must_use]
    pub fn new(topic: impl Into<String>, sink: Arc<dyn BusSink>) -> Self {
        let topic = topic.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tokens: VecDeque::new(),
                running: true,
            }),
            changed: Condvar::new(),
        });

        let worker = {
            let topic = topic.clone();
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("publisher-{topic}"))
                .spawn(move || run_worker(&topic, &shared, sink.as_ref()))
                .expect("failed to spawn publisher worker")
        };

        Self {
            topic,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The topic this publisher writes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a token to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::Stopped`] after [`stop`](Self::stop).
    pub fn enqueue(&self, token: Arc<QueueToken>) -> Result<(), PublisherError> {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        if !state.running {
            return Err(PublisherError::Stopped(self.topic.clone()));
        }

        state.tokens.push_back(token);
        self.shared.changed.notify_one();
        Ok(())
    }

    /// Stop the worker and reject further enqueues. Queued, un-sent messages
    /// are dropped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.running = false;
            self.shared.changed.notify_all();
        }

        if let Some(worker) = self.worker.lock().expect("lock poisoned").take()
            && worker.join().is_err()
        {
            error!(topic = %self.topic, "publisher worker panicked");
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(topic: &str, shared: &Shared, sink: &dyn BusSink) {
    loop {
        let token = {
            let mut state = shared.state.lock().expect("lock poisoned");
            loop {
                if !state.running {
                    return;
                }
                if let Some(token) = state.tokens.pop_front() {
                    break token;
                }
                state = shared.changed.wait(state).expect("lock poisoned");
            }
        };

        // taking the message empties the slot, so later replace_item calls
        // know they must enqueue a fresh token
        let Some(message) = token.replace_item(None) else {
            debug!(topic, "skipping cancelled token");
            continue;
        };

        let payload = match serde_json::to_string(message.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                error!(topic, error = %err, "dropping unserializable message");
                continue;
            }
        };

        if let Err(err) = sink.send(topic, &payload) {
            warn!(topic, error = %err, "bus send failed; will retry");

            // put the message back at the head and back off briefly
            let retry = Arc::new(QueueToken::new(message));
            let mut state = shared.state.lock().expect("lock poisoned");
            state.tokens.push_front(retry);
            let (next, _timeout) = shared
                .changed
                .wait_timeout(state, SEND_RETRY_DELAY)
                .expect("lock poisoned");
            drop(next);
        }
    }
}
