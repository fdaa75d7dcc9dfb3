//! Heartbeat tracking.
//!
//! PDPs emit anonymous status messages on a fixed interval. The tracker
//! arms a timer per PDP, re-armed on every heartbeat; a PDP that stays
//! silent past `max_missed_heartbeats * heart_beat_ms` is detached from its
//! sub-group and its outstanding requests are dropped. A PDP seen for the
//! first time (e.g. after a control-plane restart) is re-registered by
//! pushing its persisted assignment back to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::dispatch::RequestIdDispatcher;
use super::map::PdpModifyRequestMap;
use super::timers::{Timer, TimerManager};
use crate::groups::{PdpGroupFilter, remove_pdp_from_groups};
use crate::messages::{PdpStateChange, PdpStatus, PdpUpdate};
use crate::store::PolicyStore;

/// Collaborators handed to the tracker at construction.
pub struct PdpTrackerParams {
    /// The modification map, told to stop publishing to lost PDPs.
    pub map: Arc<PdpModifyRequestMap>,

    /// Policy store, consulted for assignments and membership repair.
    pub store: Arc<dyn PolicyStore>,

    /// Heartbeat timeout registry; its wait is the full missed-heartbeat
    /// threshold.
    pub timers: Arc<TimerManager>,
}

struct TrackedPdp {
    timer: Timer,
    last_seen: DateTime<Utc>,
}

/// Watches PDP heartbeats and reconciles the fleet with reality.
pub struct PdpTracker {
    map: Arc<PdpModifyRequestMap>,
    store: Arc<dyn PolicyStore>,
    timers: Arc<TimerManager>,
    tracked: Mutex<HashMap<String, TrackedPdp>>,
}

impl PdpTracker {
    /// Build the tracker.
    #[must_use]
    pub fn new(params: PdpTrackerParams) -> Arc<Self> {
        Arc::new(Self {
            map: params.map,
            store: params.store,
            timers: params.timers,
            tracked: Mutex::new(HashMap::new()),
        })
    }

    /// Register this tracker for anonymous statuses on the dispatcher.
    ///
    /// Returns the anonymous-listener key for later unregistration.
    pub fn register_with(self: &Arc<Self>, dispatcher: &RequestIdDispatcher) -> u64 {
        let tracker: Weak<Self> = Arc::downgrade(self);
        dispatcher.register_anonymous(Arc::new(move |status: &PdpStatus| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_heartbeat(status);
            }
        }))
    }

    /// PDPs currently considered alive.
    #[must_use]
    pub fn tracked_pdps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tracked
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Cancel all heartbeat timers and forget every PDP.
    pub fn stop(&self) {
        let mut tracked = self.tracked.lock().expect("lock poisoned");
        for entry in tracked.values() {
            entry.timer.cancel();
        }
        tracked.clear();
    }

    /// Record a heartbeat, re-arming the PDP's silence timer.
    fn on_heartbeat(self: &Arc<Self>, status: &PdpStatus) {
        let Some(pdp_name) = status.name.as_deref() else {
            debug!("heartbeat without a PDP name; ignored");
            return;
        };

        let newly_seen = {
            let mut tracked = self.tracked.lock().expect("lock poisoned");
            let timer = self.arm_timer(pdp_name);
            let previous = tracked.insert(
                pdp_name.to_string(),
                TrackedPdp {
                    timer,
                    last_seen: Utc::now(),
                },
            );
            if let Some(previous) = previous {
                previous.timer.cancel();
                false
            } else {
                true
            }
        };

        if newly_seen {
            info!(pdp = %pdp_name, "discovered PDP");
            self.reregister(pdp_name);
        }
    }

    fn arm_timer(self: &Arc<Self>, pdp_name: &str) -> Timer {
        let tracker: Weak<Self> = Arc::downgrade(self);
        self.timers.register(
            pdp_name,
            Box::new(move |expired| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.on_heartbeat_timeout(expired);
                }
            }),
        )
    }

    /// The PDP went silent: detach it from its sub-group and drop its
    /// outstanding requests.
    fn on_heartbeat_timeout(self: &Arc<Self>, pdp_name: &str) {
        let lost = self
            .tracked
            .lock()
            .expect("lock poisoned")
            .remove(pdp_name);
        let Some(lost) = lost else {
            // re-armed or already forgotten
            return;
        };

        warn!(
            pdp = %pdp_name,
            last_seen = %lost.last_seen,
            "heartbeat lost; removing PDP"
        );

        match remove_pdp_from_groups(self.store.as_ref(), pdp_name) {
            Ok(true) => info!(pdp = %pdp_name, "removed from its sub-group"),
            Ok(false) => {}
            Err(err) => {
                warn!(pdp = %pdp_name, error = %err, "unable to remove PDP from its sub-group");
            }
        }

        self.map.stop_publishing(pdp_name);
    }

    /// Push the persisted assignment back to a PDP we had not seen before.
    fn reregister(self: &Arc<Self>, pdp_name: &str) {
        let groups = match self
            .store
            .get_filtered_pdp_groups(&PdpGroupFilter::for_instance(pdp_name))
        {
            Ok(groups) => groups,
            Err(err) => {
                warn!(pdp = %pdp_name, error = %err, "unable to look up PDP assignment");
                return;
            }
        };

        let Some((group, subgroup)) = groups
            .iter()
            .find_map(|group| group.subgroup_of(pdp_name).map(|subgroup| (group, subgroup)))
        else {
            debug!(pdp = %pdp_name, "not assigned to any group");
            return;
        };

        let mut update = PdpUpdate::new(pdp_name);
        update.pdp_group = Some(group.name.clone());
        update.pdp_subgroup = Some(subgroup.pdp_type.clone());
        for identifier in &subgroup.policies {
            match self
                .store
                .get_policy_list(&identifier.name, &identifier.version)
            {
                Ok(policies) if policies.is_empty() => {
                    warn!(pdp = %pdp_name, policy = %identifier, "assigned policy not in store");
                }
                Ok(policies) => update.policies.extend(policies),
                Err(err) => {
                    warn!(pdp = %pdp_name, policy = %identifier, error = %err, "unable to load policy");
                }
            }
        }

        let change = PdpStateChange::new(pdp_name, group.pdp_group_state);

        info!(
            pdp = %pdp_name,
            group = %group.name,
            subgroup = %subgroup.pdp_type,
            "re-registering PDP"
        );
        if let Err(err) = self.map.add_request(Some(update), Some(change)) {
            warn!(pdp = %pdp_name, error = %err, "unable to re-register PDP");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::comm::bus::{BusError, BusSink, TOPIC_POLICY_PDP_PAP};
    use crate::comm::map::PdpModifyRequestMapParams;
    use crate::comm::publisher::Publisher;
    use crate::groups::{PdpGroup, PdpInstance, PdpSubGroup};
    use crate::messages::{PdpState, PdpHealthStatus};
    use crate::params::PdpParameters;
    use crate::policy::{PolicyIdentifier, ToscaPolicy};
    use crate::store::InMemoryPolicyStore;

    const PDP1: &str = "pdp_1";
    const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(60);

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
        tracker: Arc<PdpTracker>,
    }

    impl Fixture {
        fn new() -> Self {
            let sink = Arc::new(RecordingSink::default());
            let dispatcher = Arc::new(RequestIdDispatcher::new());
            let store = Arc::new(InMemoryPolicyStore::default());

            let map = PdpModifyRequestMap::new(PdpModifyRequestMapParams {
                publisher: Arc::new(Publisher::new(TOPIC_POLICY_PDP_PAP, sink.clone())),
                dispatcher: dispatcher.clone(),
                update_timers: Arc::new(TimerManager::new("update", Duration::from_secs(600))),
                state_change_timers: Arc::new(TimerManager::new(
                    "state-change",
                    Duration::from_secs(600),
                )),
                store: store.clone(),
                params: PdpParameters::default(),
            });

            let tracker = PdpTracker::new(PdpTrackerParams {
                map: map.clone(),
                store: store.clone(),
                timers: Arc::new(TimerManager::new("heartbeat", HEARTBEAT_TIMEOUT)),
            });
            tracker.register_with(&dispatcher);

            Self {
                sink,
                dispatcher,
                store,
                map,
                tracker,
            }
        }

        fn seed_assignment(&self) {
            self.store.put_policy(ToscaPolicy::new("p1", "1.0.0"));

            let mut subgroup = PdpSubGroup::new("my-subgroup");
            subgroup.policies.push(PolicyIdentifier::new("p1", "1.0.0"));
            subgroup.pdp_instances.push(PdpInstance::new(PDP1));
            subgroup.current_instance_count = 1;

            let mut group = PdpGroup::new("my-group", PdpState::Active);
            group.pdp_subgroups.push(subgroup);
            self.store.put_group(group);
        }

        fn heartbeat(&self, pdp_name: &str) {
            let status = PdpStatus {
                name: Some(pdp_name.into()),
                pdp_type: Some("my-subgroup".into()),
                state: PdpState::Active,
                healthy: Some(PdpHealthStatus::Healthy),
                pdp_group: None,
                pdp_subgroup: None,
                policies: Vec::new(),
                request_id: None,
                response: None,
            };
            self.dispatcher.on_status(&status);
        }

        fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !predicate() {
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn test_new_pdp_is_reregistered_from_store() {
        let fixture = Fixture::new();
        fixture.seed_assignment();

        fixture.heartbeat(PDP1);

        assert_eq!(fixture.tracker.tracked_pdps(), vec![PDP1.to_string()]);

        fixture.wait_until("synthetic update", || !fixture.sink.sent().is_empty());
        let sent = fixture.sink.sent();
        assert_eq!(sent[0]["messageName"], "PDP_UPDATE");
        assert_eq!(sent[0]["pdpGroup"], "my-group");
        assert_eq!(sent[0]["pdpSubgroup"], "my-subgroup");
        assert_eq!(sent[0]["policies"][0]["name"], "p1");
        assert!(fixture.map.contains(PDP1));
    }

    #[test]
    fn test_unassigned_pdp_is_tracked_but_not_updated() {
        let fixture = Fixture::new();

        fixture.heartbeat(PDP1);

        assert_eq!(fixture.tracker.tracked_pdps(), vec![PDP1.to_string()]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(fixture.sink.sent().is_empty());
        assert!(!fixture.map.contains(PDP1));
    }

    #[test]
    fn test_heartbeats_keep_pdp_alive() {
        let fixture = Fixture::new();

        // beat well past the timeout window at a third of the threshold
        for _ in 0..9 {
            fixture.heartbeat(PDP1);
            std::thread::sleep(HEARTBEAT_TIMEOUT / 3);
        }

        assert_eq!(fixture.tracker.tracked_pdps(), vec![PDP1.to_string()]);
    }

    #[test]
    fn test_silent_pdp_is_removed() {
        let fixture = Fixture::new();
        fixture.seed_assignment();

        fixture.heartbeat(PDP1);
        fixture.wait_until("re-registration in flight", || fixture.map.contains(PDP1));

        // go silent: the tracker must detach the PDP and stop its requests
        fixture.wait_until("tracker forgets the PDP", || {
            fixture.tracker.tracked_pdps().is_empty()
        });
        fixture.wait_until("map entry dropped", || !fixture.map.contains(PDP1));

        let groups = fixture
            .store
            .get_filtered_pdp_groups(&PdpGroupFilter::default())
            .unwrap();
        assert!(!groups[0].pdp_subgroups[0].has_instance(PDP1));
        assert_eq!(groups[0].pdp_subgroups[0].current_instance_count, 0);
    }

    #[test]
    fn test_stop_cancels_timers() {
        let fixture = Fixture::new();

        fixture.heartbeat(PDP1);
        fixture.tracker.stop();
        assert!(fixture.tracker.tracked_pdps().is_empty());

        // expiry must not fire after stop: the store stays untouched
        std::thread::sleep(HEARTBEAT_TIMEOUT + Duration::from_millis(30));
        assert_eq!(fixture.store.update_count(), 0);
    }
}
