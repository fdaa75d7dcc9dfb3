//! TOSCA policy concepts.
//!
//! Policies are opaque to the modification core: it only needs value
//! equality (request coalescing) and identifier-set equality (response
//! matching).

use serde::{Deserialize, Serialize};

/// Identifies a policy by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyIdentifier {
    /// Policy name.
    pub name: String,

    /// Policy version (e.g. `1.0.0`).
    pub version: String,
}

impl PolicyIdentifier {
    /// Create an identifier from name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for PolicyIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// A deployable TOSCA policy.
///
/// The `properties` body is carried verbatim; the core never evaluates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToscaPolicy {
    /// Policy name.
    pub name: String,

    /// Policy version.
    pub version: String,

    /// Policy type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,

    /// Policy type version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_type_version: Option<String>,

    /// Free-form policy body.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ToscaPolicy {
    /// Create a policy with an empty body.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            policy_type: None,
            policy_type_version: None,
            properties: serde_json::Map::new(),
        }
    }

    /// The policy's identifier.
    #[must_use]
    pub fn identifier(&self) -> PolicyIdentifier {
        PolicyIdentifier {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier() {
        let policy = ToscaPolicy::new("fleet.latency.threshold", "1.0.0");
        assert_eq!(
            policy.identifier(),
            PolicyIdentifier::new("fleet.latency.threshold", "1.0.0")
        );
        assert_eq!(
            policy.identifier().to_string(),
            "fleet.latency.threshold 1.0.0"
        );
    }

    #[test]
    fn test_policy_json_round_trip() {
        let mut policy = ToscaPolicy::new("p1", "1.0.0");
        policy.policy_type = Some("fleet.policies.monitoring.threshold".into());
        policy
            .properties
            .insert("threshold".into(), serde_json::json!(42));

        let text = serde_json::to_string(&policy).unwrap();
        let back: ToscaPolicy = serde_json::from_str(&text).unwrap();
        assert_eq!(policy, back);
    }

    #[test]
    fn test_empty_body_is_omitted() {
        let policy = ToscaPolicy::new("p1", "1.0.0");
        let text = serde_json::to_string(&policy).unwrap();
        assert!(!text.contains("properties"));
        assert!(!text.contains("policyType"));
    }
}
