//! Registry of per-PDP requests and the disable-PDP recovery path.
//!
//! The map's internal mutex is the process-wide modify lock: every request
//! state transition, including the dispatcher and timer callbacks that
//! re-enter through [`Weak`] handles, runs while holding it. Entries are
//! created lazily on the first request for a PDP and removed when the PDP
//! goes quiescent, is force-stopped, or fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::dispatch::RequestIdDispatcher;
use super::pdp_requests::PdpRequests;
use super::publisher::Publisher;
use super::request::{
    Request, RequestError, RequestHandler, RequestKind, RequestParams, ResponseDisposition,
    TimeoutDisposition,
};
use super::timers::TimerManager;
use crate::groups::remove_pdp_from_groups;
use crate::messages::{PdpMessage, PdpState, PdpStateChange, PdpStatus, PdpUpdate};
use crate::params::PdpParameters;
use crate::store::PolicyStore;

/// Error raised by [`PdpModifyRequestMap`] operations.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// A broadcast message was offered to a targeted path.
    #[error("unexpected broadcast message: {0}")]
    Broadcast(&'static str),

    /// The underlying request operation failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Collaborators handed to the map at construction.
pub struct PdpModifyRequestMapParams {
    /// Publisher for the PDP topic.
    pub publisher: Arc<Publisher>,

    /// Dispatcher routing inbound responses.
    pub dispatcher: Arc<RequestIdDispatcher>,

    /// Timeout registry for UPDATE requests.
    pub update_timers: Arc<TimerManager>,

    /// Timeout registry for STATE-CHANGE requests.
    pub state_change_timers: Arc<TimerManager>,

    /// Policy store, consulted during recovery.
    pub store: Arc<dyn PolicyStore>,

    /// Communication parameters.
    pub params: PdpParameters,
}

struct MapData {
    entries: HashMap<String, PdpRequests>,
}

/// Coalesces and serializes modification requests per PDP.
pub struct PdpModifyRequestMap {
    /// The modify lock; guards every request state transition.
    data: Mutex<MapData>,
    update_params: Arc<RequestParams>,
    state_change_params: Arc<RequestParams>,
    store: Arc<dyn PolicyStore>,
}

impl PdpModifyRequestMap {
    /// Build the map. The returned `Arc` is what infra callbacks re-enter
    /// through.
    #[must_use]
    pub fn new(params: PdpModifyRequestMapParams) -> Arc<Self> {
        let update_params = Arc::new(RequestParams {
            publisher: Arc::clone(&params.publisher),
            dispatcher: Arc::clone(&params.dispatcher),
            timers: params.update_timers,
            max_retry_count: params.params.update_parameters.max_retry_count,
        });
        let state_change_params = Arc::new(RequestParams {
            publisher: params.publisher,
            dispatcher: params.dispatcher,
            timers: params.state_change_timers,
            max_retry_count: params.params.state_change_parameters.max_retry_count,
        });

        Arc::new(Self {
            data: Mutex::new(MapData {
                entries: HashMap::new(),
            }),
            update_params,
            state_change_params,
            store: params.store,
        })
    }

    /// Add an update and/or a state-change for their target PDPs. Both
    /// `None` is a no-op.
    ///
    /// # Errors
    ///
    /// [`MapError::Broadcast`] for a message without a target name;
    /// [`MapError::Request`] if publishing fails.
    pub fn add_request(
        self: &Arc<Self>,
        update: Option<PdpUpdate>,
        state_change: Option<PdpStateChange>,
    ) -> Result<(), MapError> {
        if let Some(update) = update {
            self.add_update(update)?;
        }
        if let Some(state_change) = state_change {
            self.add_state_change(state_change)?;
        }
        Ok(())
    }

    /// Add an UPDATE request for its target PDP.
    ///
    /// # Errors
    ///
    /// See [`add_request`](Self::add_request).
    pub fn add_update(self: &Arc<Self>, update: PdpUpdate) -> Result<(), MapError> {
        let Some(pdp_name) = update.name.clone() else {
            return Err(MapError::Broadcast("PdpUpdate"));
        };

        let mut data = self.data.lock().expect("lock poisoned");
        self.add_locked(&mut data, &pdp_name, PdpMessage::Update(update))
    }

    /// Add a STATE-CHANGE request for its target PDP.
    ///
    /// # Errors
    ///
    /// See [`add_request`](Self::add_request).
    pub fn add_state_change(self: &Arc<Self>, state_change: PdpStateChange) -> Result<(), MapError> {
        let Some(pdp_name) = state_change.name.clone() else {
            return Err(MapError::Broadcast("PdpStateChange"));
        };

        let mut data = self.data.lock().expect("lock poisoned");
        self.add_locked(&mut data, &pdp_name, PdpMessage::StateChange(state_change))
    }

    /// Stop whatever the PDP is publishing and drop its entry. Unknown PDPs
    /// are a no-op.
    pub fn stop_publishing(&self, pdp_name: &str) {
        let mut data = self.data.lock().expect("lock poisoned");
        if let Some(mut entry) = data.entries.remove(pdp_name) {
            entry.stop_publishing();
            debug!(pdp = %pdp_name, "stopped publishing and removed entry");
        }
    }

    /// Stop every PDP's publishing and drop all pending requests
    /// (shutdown).
    pub fn stop_all(&self) {
        let mut data = self.data.lock().expect("lock poisoned");
        for entry in data.entries.values_mut() {
            entry.stop_publishing();
        }
        data.entries.clear();
    }

    /// Whether the map currently tracks the PDP.
    #[must_use]
    pub fn contains(&self, pdp_name: &str) -> bool {
        self.data
            .lock()
            .expect("lock poisoned")
            .entries
            .contains_key(pdp_name)
    }

    fn add_locked(
        self: &Arc<Self>,
        data: &mut MapData,
        pdp_name: &str,
        message: PdpMessage,
    ) -> Result<(), MapError> {
        let request = self.make_request(pdp_name, message);

        let entry = data
            .entries
            .entry(pdp_name.to_string())
            .or_insert_with(|| {
                debug!(pdp = %pdp_name, "allocating request queue");
                PdpRequests::new(pdp_name)
            });

        entry.add_singleton(request)?;
        Ok(())
    }

    /// Wrap a message, wiring its callbacks back into this map.
    fn make_request(self: &Arc<Self>, pdp_name: &str, message: PdpMessage) -> Request {
        let params = match RequestKind::of(&message) {
            RequestKind::Update => Arc::clone(&self.update_params),
            RequestKind::StateChange => Arc::clone(&self.state_change_params),
        };

        let mut request = Request::new(params, pdp_name, message);

        let on_response = {
            let map: Weak<Self> = Arc::downgrade(self);
            let pdp_name = pdp_name.to_string();
            Arc::new(move |status: &PdpStatus| {
                if let Some(map) = map.upgrade() {
                    map.on_status(&pdp_name, status);
                }
            })
        };
        let on_timeout = {
            let map: Weak<Self> = Arc::downgrade(self);
            let pdp_name = pdp_name.to_string();
            Arc::new(move |request_id: &str| {
                if let Some(map) = map.upgrade() {
                    map.on_timeout(&pdp_name, request_id);
                }
            })
        };

        request.set_handler(RequestHandler {
            on_response,
            on_timeout,
        });
        request
    }

    /// Dispatcher callback: a response correlated to this PDP's active
    /// request arrived.
    fn on_status(self: &Arc<Self>, pdp_name: &str, status: &PdpStatus) {
        let mut data = self.data.lock().expect("lock poisoned");

        let (kind, disposition) = {
            let Some(entry) = data.entries.get_mut(pdp_name) else {
                debug!(pdp = %pdp_name, "response for removed PDP; dropped");
                return;
            };
            let Some(kind) = entry.active_kind() else {
                debug!(pdp = %pdp_name, "response while idle; dropped");
                return;
            };
            let Some(active) = entry.active_request_mut() else {
                return;
            };
            if status.response_to() != Some(active.message().request_id()) {
                debug!(pdp = %pdp_name, "stale response; dropped");
                return;
            }
            (kind, active.process_response(status))
        };

        match disposition {
            ResponseDisposition::Ignored => {}
            ResponseDisposition::Success { pdp_name: responder } => {
                Self::handle_success(&mut data, pdp_name, kind, &responder);
            }
            ResponseDisposition::Mismatch { pdp_name: responder, reason } => {
                self.handle_failure(&mut data, pdp_name, responder.as_deref(), &reason);
            }
        }
    }

    /// Timer callback: the active request's response window elapsed.
    fn on_timeout(self: &Arc<Self>, pdp_name: &str, request_id: &str) {
        let mut data = self.data.lock().expect("lock poisoned");

        let disposition = {
            let Some(entry) = data.entries.get_mut(pdp_name) else {
                return;
            };
            let Some(active) = entry.active_request_mut() else {
                return;
            };
            if active.message().request_id() != request_id {
                debug!(pdp = %pdp_name, "stale timeout; dropped");
                return;
            }
            active.handle_timeout()
        };

        match disposition {
            Ok(TimeoutDisposition::Republished | TimeoutDisposition::Ignored) => {}
            Ok(TimeoutDisposition::Exhausted) => {
                self.handle_failure(&mut data, pdp_name, Some(pdp_name), "retry count exhausted");
            }
            Err(err) => {
                warn!(pdp = %pdp_name, error = %err, "failed to re-publish after timeout");
            }
        }
    }

    fn handle_success(
        data: &mut MapData,
        pdp_name: &str,
        completed: RequestKind,
        responder: &str,
    ) {
        if responder != pdp_name {
            debug!(pdp = %pdp_name, responder, "success for foreign PDP; ignored");
            return;
        }

        let Some(entry) = data.entries.get_mut(pdp_name) else {
            return;
        };

        match entry.start_next_request(completed) {
            Ok(true) => {}
            Ok(false) => {
                debug!(pdp = %pdp_name, "no more requests; removing entry");
                data.entries.remove(pdp_name);
            }
            Err(err) => {
                warn!(pdp = %pdp_name, error = %err, "failed to start next request");
                data.entries.remove(pdp_name);
            }
        }
    }

    fn handle_failure(
        self: &Arc<Self>,
        data: &mut MapData,
        pdp_name: &str,
        responder: Option<&str>,
        reason: &str,
    ) {
        if responder != Some(pdp_name) {
            debug!(pdp = %pdp_name, ?responder, "failure for foreign PDP; ignored");
            return;
        }

        info!(pdp = %pdp_name, reason, "disabling PDP");
        self.disable_pdp(data, pdp_name);
    }

    /// The PDP would not acknowledge its configuration: repair the persisted
    /// group membership and push a minimal safe configuration before
    /// dropping it from the map.
    fn disable_pdp(self: &Arc<Self>, data: &mut MapData, pdp_name: &str) {
        if let Some(entry) = data.entries.get_mut(pdp_name) {
            entry.stop_publishing();
        }

        // tolerate store failures: the PDP still gets the corrective pair
        let in_group = match remove_pdp_from_groups(self.store.as_ref(), pdp_name) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(pdp = %pdp_name, error = %err, "unable to remove PDP from its sub-group");
                true
            }
        };

        // remove first so the corrective requests allocate a fresh entry
        data.entries.remove(pdp_name);

        if in_group {
            let update = PdpUpdate::new(pdp_name);
            if let Err(err) = self.add_locked(data, pdp_name, PdpMessage::Update(update)) {
                warn!(pdp = %pdp_name, error = %err, "failed to publish corrective update");
            }
        }

        let change = PdpStateChange::new(pdp_name, PdpState::Passive);
        if let Err(err) = self.add_locked(data, pdp_name, PdpMessage::StateChange(change)) {
            warn!(pdp = %pdp_name, error = %err, "failed to publish corrective state-change");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::comm::bus::{BusError, BusSink, TOPIC_POLICY_PDP_PAP};
    use crate::groups::{PdpGroup, PdpGroupFilter, PdpInstance, PdpSubGroup};
    use crate::policy::{PolicyIdentifier, ToscaPolicy};
    use crate::store::InMemoryPolicyStore;

    const PDP1: &str = "pdp_1";
    const MY_GROUP: &str = "my-group";
    const MY_SUBGROUP: &str = "my-subgroup";

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<serde_json::Value>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<serde_json::Value> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl BusSink for RecordingSink {
        fn send(&self, _topic: &str, payload: &str) -> Result<(), BusError> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_str(payload).expect("valid json"));
            Ok(())
        }
    }

    struct Fixture {
        sink: Arc<RecordingSink>,
        dispatcher: Arc<RequestIdDispatcher>,
        store: Arc<InMemoryPolicyStore>,
        map: Arc<PdpModifyRequestMap>,
    }

    impl Fixture {
        fn new() -> Self {
            let long_wait = Duration::from_secs(600);
            let sink = Arc::new(RecordingSink::default());
            let dispatcher = Arc::new(RequestIdDispatcher::new());
            let store = Arc::new(InMemoryPolicyStore::default());

            let map = PdpModifyRequestMap::new(PdpModifyRequestMapParams {
                publisher: Arc::new(Publisher::new(TOPIC_POLICY_PDP_PAP, sink.clone())),
                dispatcher: dispatcher.clone(),
                update_timers: Arc::new(TimerManager::new("update", long_wait)),
                state_change_timers: Arc::new(TimerManager::new("state-change", long_wait)),
                store: store.clone(),
                params: PdpParameters::default(),
            });

            Self {
                sink,
                dispatcher,
                store,
                map,
            }
        }

        fn seed_group(&self, instances: &[&str]) {
            let mut subgroup = PdpSubGroup::new(MY_SUBGROUP);
            subgroup.pdp_instances = instances.iter().copied().map(PdpInstance::new).collect();
            subgroup.current_instance_count = instances.len() as u32;
            let mut group = PdpGroup::new(MY_GROUP, PdpState::Active);
            group.pdp_subgroups.push(subgroup);
            self.store.put_group(group);
        }

        fn make_update(&self) -> PdpUpdate {
            let mut update = PdpUpdate::new(PDP1);
            update.pdp_group = Some(MY_GROUP.into());
            update.pdp_subgroup = Some(MY_SUBGROUP.into());
            update.policies.push(ToscaPolicy::new("p1", "1.0.0"));
            update
        }

        fn wait_for_sends(&self, count: usize) -> Vec<serde_json::Value> {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let sent = self.sink.sent();
                if sent.len() >= count {
                    return sent;
                }
                assert!(Instant::now() < deadline, "timed out waiting for {count} sends");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        /// Respond successfully to a sent message.
        fn respond_ok(&self, sent: &serde_json::Value) {
            let status = match_status_for(sent);
            self.dispatcher.on_status(&status);
        }
    }

    /// Build a status that matches the given outbound message.
    fn match_status_for(sent: &serde_json::Value) -> PdpStatus {
        let policies = sent["policies"]
            .as_array()
            .map(|list| {
                list.iter()
                    .map(|policy| {
                        PolicyIdentifier::new(
                            policy["name"].as_str().unwrap(),
                            policy["version"].as_str().unwrap(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        PdpStatus {
            name: sent["name"].as_str().map(ToString::to_string),
            pdp_type: None,
            state: sent["state"]
                .as_str()
                .map_or(PdpState::Active, |state| {
                    serde_json::from_value(serde_json::Value::String(state.into())).unwrap()
                }),
            healthy: None,
            pdp_group: sent["pdpGroup"].as_str().map(ToString::to_string),
            pdp_subgroup: sent["pdpSubgroup"].as_str().map(ToString::to_string),
            policies,
            request_id: None,
            response: Some(crate::messages::PdpResponseDetails {
                response_to: sent["requestId"].as_str().unwrap().to_string(),
                response_status: None,
                response_message: None,
            }),
        }
    }

    #[test]
    fn test_add_request_both_none_is_noop() {
        let fixture = Fixture::new();
        fixture.map.add_request(None, None).unwrap();
        assert!(!fixture.map.contains(PDP1));
    }

    #[test]
    fn test_add_request_rejects_broadcast() {
        let fixture = Fixture::new();

        let mut update = PdpUpdate::new(PDP1);
        update.name = None;
        let error = fixture.map.add_update(update).unwrap_err();
        assert_eq!(
            error.to_string(),
            "unexpected broadcast message: PdpUpdate"
        );

        let mut change = PdpStateChange::new(PDP1, PdpState::Active);
        change.name = None;
        let error = fixture.map.add_state_change(change).unwrap_err();
        assert_eq!(
            error.to_string(),
            "unexpected broadcast message: PdpStateChange"
        );
    }

    #[test]
    fn test_happy_update_round_trip() {
        let fixture = Fixture::new();
        fixture
            .map
            .add_request(Some(fixture.make_update()), None)
            .unwrap();

        let sent = fixture.wait_for_sends(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["messageName"], "PDP_UPDATE");
        assert_eq!(sent[0]["pdpGroup"], MY_GROUP);

        fixture.respond_ok(&sent[0]);

        assert!(!fixture.map.contains(PDP1));
        // no further messages
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fixture.sink.sent().len(), 1);
    }

    #[test]
    fn test_success_starts_next_request_by_priority() {
        let fixture = Fixture::new();
        fixture
            .map
            .add_request(
                Some(fixture.make_update()),
                Some(PdpStateChange::new(PDP1, PdpState::Active)),
            )
            .unwrap();

        // the update was added first and publishes first
        let sent = fixture.wait_for_sends(1);
        assert_eq!(sent[0]["messageName"], "PDP_UPDATE");

        fixture.respond_ok(&sent[0]);

        let sent = fixture.wait_for_sends(2);
        assert_eq!(sent[1]["messageName"], "PDP_STATE_CHANGE");
        assert!(fixture.map.contains(PDP1));

        fixture.respond_ok(&sent[1]);
        assert!(!fixture.map.contains(PDP1));
    }

    #[test]
    fn test_mismatched_state_triggers_recovery() {
        let fixture = Fixture::new();
        fixture.seed_group(&[PDP1, "pdp_1x", "pdp_1y"]);

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();

        let sent = fixture.wait_for_sends(1);
        let mut status = match_status_for(&sent[0]);
        status.state = PdpState::Safe;
        fixture.dispatcher.on_status(&status);

        // the group was rewritten without pdp_1
        assert_eq!(fixture.store.update_count(), 1);
        let groups = fixture
            .store
            .get_filtered_pdp_groups(&PdpGroupFilter::default())
            .unwrap();
        let subgroup = &groups[0].pdp_subgroups[0];
        assert_eq!(subgroup.current_instance_count, 2);
        assert!(!subgroup.has_instance(PDP1));
        assert!(subgroup.has_instance("pdp_1x"));
        assert!(subgroup.has_instance("pdp_1y"));

        // corrective update with no assignment, then a PASSIVE state-change
        let sent = fixture.wait_for_sends(2);
        assert_eq!(sent[1]["messageName"], "PDP_UPDATE");
        assert_eq!(sent[1]["name"], PDP1);
        assert!(sent[1]["pdpGroup"].is_null());
        assert!(sent[1]["pdpSubgroup"].is_null());
        assert_eq!(sent[1]["policies"], serde_json::json!([]));

        fixture.respond_ok(&sent[1]);
        let sent = fixture.wait_for_sends(3);
        assert_eq!(sent[2]["messageName"], "PDP_STATE_CHANGE");
        assert_eq!(sent[2]["state"], "PASSIVE");
    }

    #[test]
    fn test_recovery_without_group_emits_only_state_change() {
        let fixture = Fixture::new();

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();

        let sent = fixture.wait_for_sends(1);
        let mut status = match_status_for(&sent[0]);
        status.state = PdpState::Safe;
        fixture.dispatcher.on_status(&status);

        assert_eq!(fixture.store.update_count(), 0);

        let sent = fixture.wait_for_sends(2);
        assert_eq!(sent[1]["messageName"], "PDP_STATE_CHANGE");
        assert_eq!(sent[1]["state"], "PASSIVE");
    }

    #[test]
    fn test_recovery_tolerates_store_failure() {
        let fixture = Fixture::new();
        fixture.store.fail_with("expected exception");

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();

        let sent = fixture.wait_for_sends(1);
        let mut status = match_status_for(&sent[0]);
        status.state = PdpState::Safe;
        fixture.dispatcher.on_status(&status);

        // both corrective messages still go out; update first
        let sent = fixture.wait_for_sends(2);
        assert_eq!(sent[1]["messageName"], "PDP_UPDATE");
        assert!(sent[1]["pdpGroup"].is_null());
        assert!(fixture.map.contains(PDP1));
    }

    #[test]
    fn test_stop_publishing_is_idempotent() {
        let fixture = Fixture::new();

        // unknown PDP: no-op
        fixture.map.stop_publishing(PDP1);

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();
        assert!(fixture.map.contains(PDP1));

        fixture.map.stop_publishing(PDP1);
        assert!(!fixture.map.contains(PDP1));

        fixture.map.stop_publishing(PDP1);
    }

    #[test]
    fn test_response_after_stop_is_dropped() {
        let fixture = Fixture::new();

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();
        let sent = fixture.wait_for_sends(1);

        fixture.map.stop_publishing(PDP1);
        fixture.respond_ok(&sent[0]);

        assert!(!fixture.map.contains(PDP1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fixture.sink.sent().len(), 1);
    }

    #[test]
    fn test_same_pdp_reuses_entry_until_quiescent() {
        let fixture = Fixture::new();

        fixture
            .map
            .add_request(None, Some(PdpStateChange::new(PDP1, PdpState::Active)))
            .unwrap();
        fixture
            .map
            .add_request(None, Some(PdpStateChange::new("pdp_2", PdpState::Active)))
            .unwrap();

        assert!(fixture.map.contains(PDP1));
        assert!(fixture.map.contains("pdp_2"));

        let sent = fixture.wait_for_sends(2);
        for message in &sent {
            fixture.respond_ok(message);
        }

        assert!(!fixture.map.contains(PDP1));
        assert!(!fixture.map.contains("pdp_2"));
    }
}
