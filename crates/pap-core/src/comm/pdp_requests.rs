//! Per-PDP request serialization.
//!
//! At most one UPDATE and one STATE-CHANGE may be pending for a PDP, and at
//! most one of them is publishing at any moment. New singletons coalesce
//! into the pending one of their kind; successors are picked by priority,
//! STATE-CHANGE before UPDATE.

use tracing::debug;

use super::request::{Request, RequestError, RequestKind};
use super::token::QueueToken;

/// The pending requests of one PDP.
pub struct PdpRequests {
    pdp_name: String,
    state_change: Option<Request>,
    update: Option<Request>,
    active: Option<RequestKind>,
}

impl PdpRequests {
    /// Create an empty per-PDP queue.
    #[must_use]
    pub fn new(pdp_name: impl Into<String>) -> Self {
        Self {
            pdp_name: pdp_name.into(),
            state_change: None,
            update: None,
            active: None,
        }
    }

    /// The PDP these requests target.
    #[must_use]
    pub fn pdp_name(&self) -> &str {
        &self.pdp_name
    }

    /// Whether no requests are pending.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.state_change.is_none() && self.update.is_none()
    }

    /// Kind of the currently publishing request, if any.
    #[must_use]
    pub const fn active_kind(&self) -> Option<RequestKind> {
        self.active
    }

    /// The currently publishing request.
    #[must_use]
    pub fn active_request_mut(&mut self) -> Option<&mut Request> {
        let kind = self.active?;
        self.slot_mut(kind).as_mut()
    }

    /// Add a request, coalescing with a pending request of the same kind.
    ///
    /// An identical pending request is kept with its retry count reset; a
    /// differing one is reconfigured in place, reusing its queue token. When
    /// the PDP is idle the head request starts publishing immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if reconfiguration or publishing fails.
    pub fn add_singleton(&mut self, request: Request) -> Result<(), RequestError> {
        let kind = request.kind();

        match self.slot_mut(kind) {
            Some(existing) => {
                if existing.is_same_content(&request) {
                    debug!(request = %existing.name(), "duplicate request; resetting retries");
                    existing.reset_retry_count();
                } else {
                    existing.reconfigure(request.into_message(), None)?;
                }
            }
            slot @ None => {
                *slot = Some(request);
            }
        }

        self.start_next_if_idle()
    }

    /// Start the completed request's successor, reusing its queue token.
    ///
    /// The completed request is removed from its slot. Returns `true` if
    /// another request started publishing, `false` if the PDP is quiescent.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if the successor fails to publish.
    pub fn start_next_request(&mut self, completed: RequestKind) -> Result<bool, RequestError> {
        if self.active == Some(completed) {
            self.active = None;
        }

        let token = self
            .slot_mut(completed)
            .take()
            .and_then(|mut request| request.take_token());

        match self.next_kind() {
            Some(kind) => {
                self.start(kind, token)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop the currently publishing request; pending slots stay intact.
    pub fn stop_publishing(&mut self) {
        if let Some(kind) = self.active.take()
            && let Some(request) = self.slot_mut(kind).as_mut()
        {
            request.stop_publishing(true);
        }
    }

    /// Start the head request when nothing is publishing.
    fn start_next_if_idle(&mut self) -> Result<(), RequestError> {
        if self.active.is_none()
            && let Some(kind) = self.next_kind()
        {
            self.start(kind, None)?;
        }
        Ok(())
    }

    /// Lowest-priority-value pending kind.
    fn next_kind(&self) -> Option<RequestKind> {
        if self.state_change.is_some() {
            Some(RequestKind::StateChange)
        } else if self.update.is_some() {
            Some(RequestKind::Update)
        } else {
            None
        }
    }

    fn start(
        &mut self,
        kind: RequestKind,
        token: Option<std::sync::Arc<QueueToken>>,
    ) -> Result<(), RequestError> {
        let request = self
            .slot_mut(kind)
            .as_mut()
            .expect("next_kind returned an occupied slot");
        request.start_publishing(token)?;
        self.active = Some(kind);
        Ok(())
    }

    fn slot_mut(&mut self, kind: RequestKind) -> &mut Option<Request> {
        match kind {
            RequestKind::StateChange => &mut self.state_change,
            RequestKind::Update => &mut self.update,
        }
    }
}
