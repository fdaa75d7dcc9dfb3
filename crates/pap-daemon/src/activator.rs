//! Daemon lifecycle: constructs and starts every component in dependency
//! order, and stops them in reverse.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pap_core::comm::{
    MessageTypeDispatcher, PdpModifyRequestMap, PdpModifyRequestMapParams, PdpTracker,
    PdpTrackerParams, Publisher, RequestIdDispatcher, TimerManager,
};
use pap_core::messages::{MSG_PDP_STATUS, MSG_TYPE_FIELD};
use pap_core::store::PolicyStore;
use tracing::info;

use crate::bus::BusServer;
use crate::config::PapConfig;

/// A running PAP control plane.
pub struct PapActivator {
    bus: BusServer,
    inbound: Arc<MessageTypeDispatcher>,
    request_ids: Arc<RequestIdDispatcher>,
    tracker: Arc<PdpTracker>,
    tracker_key: u64,
    map: Arc<PdpModifyRequestMap>,
    update_timers: Arc<TimerManager>,
    state_change_timers: Arc<TimerManager>,
    publisher: Arc<Publisher>,
}

impl PapActivator {
    /// Start all components.
    ///
    /// # Errors
    ///
    /// Fails when the bus socket cannot be bound.
    pub fn start(config: &PapConfig, store: Arc<dyn PolicyStore>) -> anyhow::Result<Self> {
        let inbound = Arc::new(MessageTypeDispatcher::new(&[MSG_TYPE_FIELD]));
        let request_ids = Arc::new(RequestIdDispatcher::new());
        inbound.register(MSG_PDP_STATUS, request_ids.clone());

        let bus = BusServer::bind(&config.topic.socket, inbound.clone())
            .with_context(|| format!("binding {}", config.topic.socket.display()))?;

        let publisher = Arc::new(Publisher::new(config.topic.name.clone(), bus.sink()));
        let update_timers = Arc::new(TimerManager::new(
            "update",
            Duration::from_millis(config.pdp.update_parameters.max_wait_ms),
        ));
        let state_change_timers = Arc::new(TimerManager::new(
            "state-change",
            Duration::from_millis(config.pdp.state_change_parameters.max_wait_ms),
        ));

        let map = PdpModifyRequestMap::new(PdpModifyRequestMapParams {
            publisher: publisher.clone(),
            dispatcher: request_ids.clone(),
            update_timers: update_timers.clone(),
            state_change_timers: state_change_timers.clone(),
            store: store.clone(),
            params: config.pdp,
        });

        let tracker = PdpTracker::new(PdpTrackerParams {
            map: map.clone(),
            store,
            timers: Arc::new(TimerManager::new(
                "heartbeat",
                Duration::from_millis(config.pdp.heartbeat_timeout_ms()),
            )),
        });
        let tracker_key = tracker.register_with(&request_ids);

        info!(topic = %config.topic.name, "PAP control plane started");
        Ok(Self {
            bus,
            inbound,
            request_ids,
            tracker,
            tracker_key,
            map,
            update_timers,
            state_change_timers,
            publisher,
        })
    }

    /// The modification map; operator commands land here.
    #[must_use]
    pub fn map(&self) -> &Arc<PdpModifyRequestMap> {
        &self.map
    }

    /// The heartbeat tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PdpTracker> {
        &self.tracker
    }

    /// Stop everything, newest dependency first.
    pub fn stop(&self) {
        info!("stopping PAP control plane");
        self.request_ids.unregister_anonymous(self.tracker_key);
        self.tracker.stop();
        self.map.stop_all();
        self.state_change_timers.stop();
        self.update_timers.stop();
        self.publisher.stop();
        self.inbound.unregister(MSG_PDP_STATUS);
        self.bus.stop();
    }
}
