//! One outbound request's full lifecycle: enqueue, await response, match,
//! retry, replace.
//!
//! A request is publishing iff it holds a registered response listener, a
//! live timer and a queue token; the three are created and released together
//! under the modify lock. UPDATE and STATE-CHANGE requests share this state
//! machine and differ only in response validation, same-content equality and
//! priority.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::dispatch::RequestIdDispatcher;
use super::publisher::{Publisher, PublisherError};
use super::timers::{Timer, TimerManager};
use super::token::QueueToken;
use crate::messages::{PdpMessage, PdpStatus};
use crate::policy::{PolicyIdentifier, ToscaPolicy};

/// Request subtype tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// STATE-CHANGE request; performed before pending updates.
    StateChange,

    /// UPDATE request.
    Update,
}

impl RequestKind {
    /// Priority value; lower runs first when both kinds are pending.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::StateChange => 0,
            Self::Update => 1,
        }
    }

    /// Kind of a message.
    #[must_use]
    pub const fn of(message: &PdpMessage) -> Self {
        match message {
            PdpMessage::Update(_) => Self::Update,
            PdpMessage::StateChange(_) => Self::StateChange,
        }
    }
}

/// Error raised by request operations.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// `start_publishing` before the handler was installed.
    #[error("request handler has not been set")]
    HandlerNotSet,

    /// `reconfigure` with a message of the other subtype.
    #[error("expecting {expected} instead of {actual}")]
    WrongMessageType {
        /// Subtype this request was built for.
        expected: &'static str,

        /// Subtype that was offered.
        actual: &'static str,
    },

    /// The publisher rejected the enqueue (shutdown).
    #[error(transparent)]
    Publisher(#[from] PublisherError),
}

/// Outcome of [`Request::process_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// The response matched; `pdp_name` is the effective responder.
    Success {
        /// Responding PDP.
        pdp_name: String,
    },

    /// The response disagreed with the request.
    Mismatch {
        /// Responding PDP, when it named itself.
        pdp_name: Option<String>,

        /// Human-readable disagreement.
        reason: String,
    },

    /// The request was not publishing; the response was dropped.
    Ignored,
}

/// Outcome of [`Request::handle_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDisposition {
    /// The request was re-published (retries left, or never sent).
    Republished,

    /// The retry budget is exhausted.
    Exhausted,

    /// The request was not publishing; the timeout was stale.
    Ignored,
}

/// Collaborators and bounds shared by all requests of one kind.
pub struct RequestParams {
    /// Publisher for the PDP topic.
    pub publisher: Arc<Publisher>,

    /// Dispatcher routing inbound responses.
    pub dispatcher: Arc<RequestIdDispatcher>,

    /// Timeout registry for this request kind.
    pub timers: Arc<TimerManager>,

    /// Re-publish budget after timeouts.
    pub max_retry_count: u32,
}

/// Callbacks a request registers while publishing.
///
/// Both re-enter the owning map, which re-acquires the modify lock; a
/// request never starts publishing without them.
#[derive(Clone)]
pub struct RequestHandler {
    /// Invoked by the dispatcher with the correlated response.
    pub on_response: Arc<dyn Fn(&PdpStatus) + Send + Sync>,

    /// Invoked by the timer manager with the expired request id.
    pub on_timeout: Arc<dyn Fn(&str) + Send + Sync>,
}

/// A single outbound request to one PDP.
pub struct Request {
    name: String,
    kind: RequestKind,
    message: Arc<PdpMessage>,
    params: Arc<RequestParams>,
    handler: Option<RequestHandler>,
    retry_count: u32,
    token: Option<Arc<QueueToken>>,
    timer: Option<Timer>,
    publishing: bool,
}

impl Request {
    /// Wrap a message addressed to `pdp_name`.
    #[must_use]
    pub fn new(params: Arc<RequestParams>, pdp_name: &str, message: PdpMessage) -> Self {
        let name = format!("{pdp_name} {}", message.type_name());
        Self {
            name,
            kind: RequestKind::of(&message),
            message: Arc::new(message),
            params,
            handler: None,
            retry_count: 0,
            token: None,
            timer: None,
            publishing: false,
        }
    }

    /// Log tag, e.g. `pdp_1 PdpUpdate`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This request's subtype.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Priority value; see [`RequestKind::priority`].
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.kind.priority()
    }

    /// The current message.
    #[must_use]
    pub fn message(&self) -> &PdpMessage {
        &self.message
    }

    /// Consume the request, yielding its message.
    #[must_use]
    pub fn into_message(self) -> PdpMessage {
        Arc::try_unwrap(self.message).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Current retry count.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether the request is between `start_publishing` and completion.
    #[must_use]
    pub const fn is_publishing(&self) -> bool {
        self.publishing
    }

    /// Install the response/timeout callbacks. Must precede
    /// [`start_publishing`](Self::start_publishing).
    pub fn set_handler(&mut self, handler: RequestHandler) {
        self.handler = Some(handler);
    }

    /// Reset the retry count to zero.
    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    /// Bump the retry count.
    ///
    /// Returns `false`, leaving the count unchanged, once the limit is
    /// reached.
    pub fn bump_retry_count(&mut self) -> bool {
        if self.retry_count >= self.params.max_retry_count {
            return false;
        }

        self.retry_count += 1;
        true
    }

    /// Register the response listener and timer and enqueue the message.
    ///
    /// Idempotent while publishing. When `preferred_token` is given and this
    /// request has no token yet, the message is swapped into it, superseding
    /// whatever it held; a redundant preferred token is cancelled instead.
    ///
    /// # Errors
    ///
    /// [`RequestError::HandlerNotSet`] if the handler was never installed;
    /// [`RequestError::Publisher`] if the publisher is stopped.
    pub fn start_publishing(
        &mut self,
        preferred_token: Option<Arc<QueueToken>>,
    ) -> Result<(), RequestError> {
        if self.handler.is_none() {
            return Err(RequestError::HandlerNotSet);
        }

        self.adopt_token(preferred_token);

        if self.publishing {
            return Ok(());
        }
        self.publishing = true;

        self.register_listener();
        self.register_timer();
        self.enqueue()?;

        debug!(request = %self.name, "publishing");
        Ok(())
    }

    /// Replace the message, re-registering listener, timer and token when
    /// publishing.
    ///
    /// Returns whether the message type changed.
    ///
    /// # Errors
    ///
    /// [`RequestError::WrongMessageType`] if `new_message` is of the other
    /// subtype; [`RequestError::Publisher`] if re-enqueueing fails.
    pub fn reconfigure(
        &mut self,
        new_message: PdpMessage,
        replacement_token: Option<Arc<QueueToken>>,
    ) -> Result<bool, RequestError> {
        if RequestKind::of(&new_message) != self.kind {
            return Err(RequestError::WrongMessageType {
                expected: self.message.type_name(),
                actual: new_message.type_name(),
            });
        }

        let type_changed = new_message.type_name() != self.message.type_name();
        self.reset_retry_count();

        if !self.publishing {
            self.message = Arc::new(new_message);
            self.adopt_token(replacement_token);
            return Ok(type_changed);
        }

        // swap everything atomically under the caller's modify lock
        self.unregister_listener();
        self.cancel_timer();
        self.message = Arc::new(new_message);
        self.adopt_token(replacement_token);
        self.register_listener();
        self.register_timer();
        self.enqueue()?;

        debug!(request = %self.name, "reconfigured");
        Ok(type_changed)
    }

    /// Unregister the listener and cancel the timer.
    ///
    /// With `retain_token` the queue slot is emptied so the publisher skips
    /// it and `None` is returned; otherwise the token is handed back, still
    /// holding the message, for the next request to reuse. Not publishing is
    /// a no-op returning `None`.
    pub fn stop_publishing(&mut self, retain_token: bool) -> Option<Arc<QueueToken>> {
        if !self.publishing {
            return None;
        }
        self.publishing = false;

        self.unregister_listener();
        self.cancel_timer();

        if retain_token {
            if let Some(token) = self.token.take() {
                token.replace_item(None);
            }
            return None;
        }

        self.token.take()
    }

    /// Validate a correlated response and transition out of publishing.
    ///
    /// The token is left untouched for a possible hand-off to the next
    /// request.
    pub fn process_response(&mut self, response: &PdpStatus) -> ResponseDisposition {
        if !self.publishing {
            return ResponseDisposition::Ignored;
        }
        self.publishing = false;

        self.unregister_listener();
        self.cancel_timer();

        if let Some(reason) = self.check_response(response) {
            info!(request = %self.name, %reason, "PDP data mismatch");
            return ResponseDisposition::Mismatch {
                pdp_name: response.name.clone(),
                reason,
            };
        }

        let pdp_name = self
            .message
            .name()
            .or(response.name.as_deref())
            .unwrap_or_default()
            .to_string();
        info!(request = %self.name, "request successful");
        ResponseDisposition::Success { pdp_name }
    }

    /// Handle the response timer expiring.
    ///
    /// A message still sitting in the queue is left there with a reset retry
    /// count; otherwise the retry count is bumped and the request
    /// re-published, until the budget runs out.
    ///
    /// # Errors
    ///
    /// [`RequestError::Publisher`] if re-publishing fails.
    pub fn handle_timeout(&mut self) -> Result<TimeoutDisposition, RequestError> {
        if !self.publishing {
            return Ok(TimeoutDisposition::Ignored);
        }
        self.publishing = false;

        self.unregister_listener();
        self.cancel_timer();

        if self.is_in_queue() {
            // never sent; keep the queue slot and start over
            info!(request = %self.name, "timeout - request still in the queue");
            self.reset_retry_count();
            self.start_publishing(None)?;
            return Ok(TimeoutDisposition::Republished);
        }

        if !self.bump_retry_count() {
            info!(request = %self.name, "timeout - retry count exhausted");
            return Ok(TimeoutDisposition::Exhausted);
        }

        info!(request = %self.name, retry = self.retry_count, "timeout - re-publishing");
        self.start_publishing(None)?;
        Ok(TimeoutDisposition::Republished)
    }

    /// Whether `other` would tell the PDP the same thing as this request.
    #[must_use]
    pub fn is_same_content(&self, other: &Self) -> bool {
        match (self.message.as_ref(), other.message.as_ref()) {
            (PdpMessage::Update(mine), PdpMessage::Update(theirs)) => {
                mine.pdp_group == theirs.pdp_group
                    && mine.pdp_subgroup == theirs.pdp_subgroup
                    && same_policy_set(&mine.policies, &theirs.policies)
            }
            (PdpMessage::StateChange(mine), PdpMessage::StateChange(theirs)) => {
                mine.state == theirs.state
            }
            _ => false,
        }
    }

    /// Hand over the queue token, e.g. to the successor request.
    pub(crate) fn take_token(&mut self) -> Option<Arc<QueueToken>> {
        self.token.take()
    }

    /// Whether the current message still sits, unsent, in the queue.
    fn is_in_queue(&self) -> bool {
        self.token
            .as_ref()
            .and_then(|token| token.get())
            .is_some_and(|queued| Arc::ptr_eq(&queued, &self.message))
    }

    /// Adopt a caller-provided token when this request has none; cancel a
    /// redundant one.
    fn adopt_token(&mut self, new_token: Option<Arc<QueueToken>>) {
        if let Some(new_token) = new_token {
            match &self.token {
                None => self.token = Some(new_token),
                Some(existing) if Arc::ptr_eq(existing, &new_token) => {}
                Some(_) => {
                    new_token.replace_item(None);
                }
            }
        }
    }

    /// Put the message into the held token if its slot is still live, else
    /// enqueue a fresh token.
    fn enqueue(&mut self) -> Result<(), PublisherError> {
        if let Some(token) = &self.token
            && token.replace_item(Some(Arc::clone(&self.message))).is_some()
        {
            // took the prior message's place in the queue
            return Ok(());
        }

        let token = Arc::new(QueueToken::new(Arc::clone(&self.message)));
        self.token = Some(Arc::clone(&token));
        self.params.publisher.enqueue(token)
    }

    fn register_listener(&self) {
        let handler = self.handler.as_ref().expect("checked in start_publishing");
        self.params
            .dispatcher
            .register(self.message.request_id(), Arc::clone(&handler.on_response));
    }

    fn unregister_listener(&self) {
        self.params.dispatcher.unregister(self.message.request_id());
    }

    fn register_timer(&mut self) {
        let handler = self.handler.as_ref().expect("checked in start_publishing");
        let on_timeout = Arc::clone(&handler.on_timeout);
        let timer = self.params.timers.register(
            self.message.request_id(),
            Box::new(move |key| on_timeout(key)),
        );
        self.timer = Some(timer);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Why the response disagrees with the request, or `None` on a match.
    fn check_response(&self, response: &PdpStatus) -> Option<String> {
        let Some(response_name) = response.name.as_deref() else {
            return Some("null PDP name".to_string());
        };

        if let Some(expected) = self.message.name()
            && expected != response_name
        {
            return Some("PDP name does not match".to_string());
        }

        match self.message.as_ref() {
            PdpMessage::Update(update) => {
                if update.pdp_group != response.pdp_group {
                    return Some("group does not match".to_string());
                }

                if update.pdp_subgroup != response.pdp_subgroup {
                    return Some("subgroup does not match".to_string());
                }

                let expected: HashSet<PolicyIdentifier> =
                    update.policies.iter().map(ToscaPolicy::identifier).collect();
                let actual: HashSet<PolicyIdentifier> =
                    response.policies.iter().cloned().collect();
                if expected != actual {
                    return Some("policies do not match".to_string());
                }
            }
            PdpMessage::StateChange(change) => {
                if response.state != change.state {
                    return Some(format!(
                        "state is {}, but expected {}",
                        response.state, change.state
                    ));
                }
            }
        }

        None
    }
}

/// Order-insensitive equality of two policy lists.
fn same_policy_set(left: &[ToscaPolicy], right: &[ToscaPolicy]) -> bool {
    left.len() == right.len()
        && left.iter().all(|policy| right.contains(policy))
        && right.iter().all(|policy| left.contains(policy))
}
