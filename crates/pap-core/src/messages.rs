//! Wire messages exchanged with PDPs on the `POLICY-PDP-PAP` topic.
//!
//! Outbound traffic is [`PdpMessage`], a tagged union of [`PdpUpdate`] and
//! [`PdpStateChange`]; inbound traffic is [`PdpStatus`]. Every outbound
//! message carries a fresh `requestId`; a PDP acknowledges by echoing it in
//! `response.responseTo`. A status without a `response` block is a
//! heartbeat.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::{PolicyIdentifier, ToscaPolicy};

/// Value of the `messageName` discriminator on inbound status messages.
pub const MSG_PDP_STATUS: &str = "PDP_STATUS";

/// JSON field holding the message-type discriminator.
pub const MSG_TYPE_FIELD: &str = "messageName";

/// Lifecycle state of a PDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpState {
    /// Loaded but not evaluating policies.
    Passive,

    /// Evaluating policies, decisions not enforced.
    Safe,

    /// Evaluating and enforcing policies.
    Active,

    /// Shutting down.
    Terminated,
}

impl std::fmt::Display for PdpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Passive => "PASSIVE",
            Self::Safe => "SAFE",
            Self::Active => "ACTIVE",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(text)
    }
}

/// Health as self-reported by a PDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpHealthStatus {
    /// Operating normally.
    Healthy,

    /// Operating degraded.
    NotHealthy,

    /// Self-test in progress.
    TestInProgress,

    /// Health unknown.
    Unknown,
}

/// Instructs a PDP which group, sub-group and policies it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpUpdate {
    /// Target PDP instance; `None` means broadcast.
    pub name: Option<String>,

    /// Group the PDP is assigned to.
    #[serde(default)]
    pub pdp_group: Option<String>,

    /// Sub-group (PDP type) within the group.
    #[serde(default)]
    pub pdp_subgroup: Option<String>,

    /// Policies the PDP must host. May be empty.
    #[serde(default)]
    pub policies: Vec<ToscaPolicy>,

    /// Unique id, echoed by the PDP in its response.
    pub request_id: String,
}

impl PdpUpdate {
    /// Create an update for the given PDP with a fresh request id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            pdp_group: None,
            pdp_subgroup: None,
            policies: Vec::new(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Instructs a PDP to move to a lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpStateChange {
    /// Target PDP instance; `None` means broadcast.
    pub name: Option<String>,

    /// Requested state.
    pub state: PdpState,

    /// Unique id, echoed by the PDP in its response.
    pub request_id: String,
}

impl PdpStateChange {
    /// Create a state-change for the given PDP with a fresh request id.
    pub fn new(name: impl Into<String>, state: PdpState) -> Self {
        Self {
            name: Some(name.into()),
            state,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Any message published to PDPs, tagged on the wire by `messageName`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageName")]
pub enum PdpMessage {
    /// Policy-set / group assignment.
    #[serde(rename = "PDP_UPDATE")]
    Update(PdpUpdate),

    /// Lifecycle state change.
    #[serde(rename = "PDP_STATE_CHANGE")]
    StateChange(PdpStateChange),
}

impl PdpMessage {
    /// Target PDP name; `None` for broadcast.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Update(update) => update.name.as_deref(),
            Self::StateChange(change) => change.name.as_deref(),
        }
    }

    /// The message's request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Update(update) => &update.request_id,
            Self::StateChange(change) => &change.request_id,
        }
    }

    /// Type name used in log tags, e.g. `PdpUpdate`.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Update(_) => "PdpUpdate",
            Self::StateChange(_) => "PdpStateChange",
        }
    }
}

impl From<PdpUpdate> for PdpMessage {
    fn from(update: PdpUpdate) -> Self {
        Self::Update(update)
    }
}

impl From<PdpStateChange> for PdpMessage {
    fn from(change: PdpStateChange) -> Self {
        Self::StateChange(change)
    }
}

/// Response envelope inside a [`PdpStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpResponseDetails {
    /// Request id of the message this status responds to.
    pub response_to: String,

    /// Whether the PDP accepted the request.
    #[serde(default)]
    pub response_status: Option<PdpResponseStatus>,

    /// Optional detail text.
    #[serde(default)]
    pub response_message: Option<String>,
}

/// PDP-reported outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpResponseStatus {
    /// Request applied.
    Success,

    /// Request rejected or failed.
    Fail,
}

/// Status reported by a PDP: either a response to an outstanding request or
/// an anonymous heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpStatus {
    /// Reporting PDP instance.
    pub name: Option<String>,

    /// The PDP's type (sub-group key).
    #[serde(default)]
    pub pdp_type: Option<String>,

    /// Current lifecycle state.
    pub state: PdpState,

    /// Self-reported health.
    #[serde(default)]
    pub healthy: Option<PdpHealthStatus>,

    /// Group the PDP believes it belongs to.
    #[serde(default)]
    pub pdp_group: Option<String>,

    /// Sub-group the PDP believes it belongs to.
    #[serde(default)]
    pub pdp_subgroup: Option<String>,

    /// Policies the PDP is currently hosting.
    #[serde(default)]
    pub policies: Vec<PolicyIdentifier>,

    /// This status message's own id.
    #[serde(default)]
    pub request_id: Option<String>,

    /// Present when this status responds to an outstanding request.
    #[serde(default)]
    pub response: Option<PdpResponseDetails>,
}

impl PdpStatus {
    /// Request id this status responds to, if any.
    #[must_use]
    pub fn response_to(&self) -> Option<&str> {
        self.response.as_ref().map(|details| details.response_to.as_str())
    }

    /// Whether this status is an anonymous heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.response.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_wire_format() {
        let mut update = PdpUpdate::new("pdp_1");
        update.pdp_group = Some("defaultGroup".into());
        update.pdp_subgroup = Some("xacml".into());
        update.policies.push(ToscaPolicy::new("p1", "1.0.0"));

        let value = serde_json::to_value(PdpMessage::from(update.clone())).unwrap();
        assert_eq!(value["messageName"], "PDP_UPDATE");
        assert_eq!(value["name"], "pdp_1");
        assert_eq!(value["pdpGroup"], "defaultGroup");
        assert_eq!(value["pdpSubgroup"], "xacml");
        assert_eq!(value["policies"][0]["name"], "p1");
        assert_eq!(value["requestId"], update.request_id);
    }

    #[test]
    fn test_state_change_wire_format() {
        let change = PdpStateChange::new("pdp_1", PdpState::Active);
        let value = serde_json::to_value(PdpMessage::from(change)).unwrap();
        assert_eq!(value["messageName"], "PDP_STATE_CHANGE");
        assert_eq!(value["state"], "ACTIVE");
    }

    #[test]
    fn test_fresh_request_ids() {
        let first = PdpStateChange::new("pdp_1", PdpState::Active);
        let second = PdpStateChange::new("pdp_1", PdpState::Active);
        assert_ne!(first.request_id, second.request_id);
    }

    #[test]
    fn test_status_response_correlation() {
        let raw = serde_json::json!({
            "messageName": "PDP_STATUS",
            "name": "pdp_1",
            "state": "SAFE",
            "pdpGroup": "defaultGroup",
            "policies": [{"name": "p1", "version": "1.0.0"}],
            "response": {"responseTo": "req-123", "responseStatus": "SUCCESS"}
        });

        let status: PdpStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(status.response_to(), Some("req-123"));
        assert!(!status.is_heartbeat());
        assert_eq!(status.state, PdpState::Safe);
        assert_eq!(status.policies[0], PolicyIdentifier::new("p1", "1.0.0"));
    }

    #[test]
    fn test_status_heartbeat() {
        let raw = serde_json::json!({
            "messageName": "PDP_STATUS",
            "name": "pdp_2",
            "state": "ACTIVE",
            "healthy": "HEALTHY"
        });

        let status: PdpStatus = serde_json::from_value(raw).unwrap();
        assert!(status.is_heartbeat());
        assert_eq!(status.healthy, Some(PdpHealthStatus::Healthy));
        assert!(status.policies.is_empty());
    }
}
