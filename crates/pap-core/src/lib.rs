//! # pap-core
//!
//! Core library for the PAP control plane: coordinates a fleet of Policy
//! Decision Points by pushing UPDATE and STATE-CHANGE requests over a
//! shared message bus and correlating the asynchronous status responses
//! back to the outstanding requests.
//!
//! ## Features
//!
//! - **Request coalescing**: at most one UPDATE and one STATE-CHANGE per
//!   PDP; newer content supersedes an un-sent message in place
//! - **Bounded retry**: timeouts re-publish until the retry budget runs out
//! - **Partial-failure recovery**: a PDP that will not acknowledge its
//!   configuration is detached from its persisted sub-group and pushed a
//!   minimal safe configuration
//! - **Heartbeat tracking**: silent PDPs are removed; newly seen ones are
//!   re-registered from the policy store
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pap_core::comm::{
//!     BusError, BusSink, PdpModifyRequestMap, PdpModifyRequestMapParams, Publisher,
//!     RequestIdDispatcher, TimerManager, TOPIC_POLICY_PDP_PAP,
//! };
//! use pap_core::messages::{PdpState, PdpStateChange};
//! use pap_core::params::PdpParameters;
//! use pap_core::store::InMemoryPolicyStore;
//!
//! struct StdoutSink;
//!
//! impl BusSink for StdoutSink {
//!     fn send(&self, topic: &str, payload: &str) -> Result<(), BusError> {
//!         println!("{topic}: {payload}");
//!         Ok(())
//!     }
//! }
//!
//! let params = PdpParameters::default();
//! let map = PdpModifyRequestMap::new(PdpModifyRequestMapParams {
//!     publisher: Arc::new(Publisher::new(TOPIC_POLICY_PDP_PAP, Arc::new(StdoutSink))),
//!     dispatcher: Arc::new(RequestIdDispatcher::new()),
//!     update_timers: Arc::new(TimerManager::new(
//!         "update",
//!         Duration::from_millis(params.update_parameters.max_wait_ms),
//!     )),
//!     state_change_timers: Arc::new(TimerManager::new(
//!         "state-change",
//!         Duration::from_millis(params.state_change_parameters.max_wait_ms),
//!     )),
//!     store: Arc::new(InMemoryPolicyStore::default()),
//!     params,
//! });
//!
//! map.add_request(None, Some(PdpStateChange::new("pdp_1", PdpState::Active)))
//!     .unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod comm;
pub mod groups;
pub mod messages;
pub mod params;
pub mod policy;
pub mod store;

/// Re-export commonly used types at the crate root.
pub use comm::{PdpModifyRequestMap, PdpModifyRequestMapParams, PdpTracker, PdpTrackerParams};
pub use groups::{PdpGroup, PdpGroupFilter, PdpInstance, PdpSubGroup};
pub use messages::{PdpMessage, PdpState, PdpStateChange, PdpStatus, PdpUpdate};
pub use params::PdpParameters;
pub use policy::{PolicyIdentifier, ToscaPolicy};
pub use store::{InMemoryPolicyStore, PolicyStore, StoreError};
