//! Outbound transport seam.
//!
//! The core does not own the message bus; it writes through [`BusSink`] and
//! leaves delivery semantics to the implementation behind it.

/// Topic shared by PAP and all PDPs.
pub const TOPIC_POLICY_PDP_PAP: &str = "POLICY-PDP-PAP";

/// Error raised by a bus sink.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport could not accept the message right now.
    #[error("bus transport failure: {0}")]
    Transport(String),
}

/// Writes serialized messages to one topic of the message bus.
///
/// Implementations must not block indefinitely; a failed or congested
/// transport should return [`BusError`] and let the publisher retry.
pub trait BusSink: Send + Sync {
    /// Write one JSON envelope to the topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the transport rejects the message; the caller
    /// decides whether to retry.
    fn send(&self, topic: &str, payload: &str) -> Result<(), BusError>;
}
