//! PDP communication: the request-coalescing, retry, timeout and
//! response-matching core.
//!
//! ```text
//! add_request ──▶ PdpModifyRequestMap ──▶ PdpRequests ──▶ Request
//!                        │                                  │
//!                        │ modify lock              token / timer / listener
//!                        ▼                                  ▼
//!                  PolicyStore                 Publisher  TimerManager  RequestIdDispatcher
//!                                                   │                        ▲
//!                                                   ▼                        │
//!                                                BusSink ──── message bus ───┘
//! ```
//!
//! Requests flow down through the map; responses and timeouts re-enter it
//! through the dispatcher and timer workers, always under the modify lock.

pub mod bus;
pub mod dispatch;
pub mod map;
pub mod pdp_requests;
pub mod publisher;
pub mod request;
pub mod timers;
pub mod token;
pub mod tracker;

pub use bus::{BusError, BusSink, TOPIC_POLICY_PDP_PAP};
pub use dispatch::{MessageListener, MessageTypeDispatcher, RequestIdDispatcher, StatusListener};
pub use map::{MapError, PdpModifyRequestMap, PdpModifyRequestMapParams};
pub use pdp_requests::PdpRequests;
pub use publisher::{Publisher, PublisherError};
pub use request::{
    Request, RequestError, RequestHandler, RequestKind, RequestParams, ResponseDisposition,
    TimeoutDisposition,
};
pub use timers::{Timer, TimerManager};
pub use token::QueueToken;
pub use tracker::{PdpTracker, PdpTrackerParams};
