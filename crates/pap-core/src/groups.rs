//! PDP group and sub-group records as persisted in the policy store.
//!
//! The modification core mutates these only to detach a failed or silent PDP
//! from its sub-group; everything else is owned by the deployment side of
//! the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{PdpHealthStatus, PdpState};
use crate::policy::PolicyIdentifier;
use crate::store::{PolicyStore, StoreError};

/// A registered PDP instance within a sub-group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpInstance {
    /// Unique instance id (the PDP's `name` on the wire).
    pub instance_id: String,

    /// Last known lifecycle state.
    #[serde(default)]
    pub pdp_state: Option<PdpState>,

    /// Last reported health.
    #[serde(default)]
    pub healthy: Option<PdpHealthStatus>,

    /// When the instance last reported in.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl PdpInstance {
    /// Create an instance record with nothing reported yet.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            pdp_state: None,
            healthy: None,
            last_update: None,
        }
    }
}

/// A sub-group: all PDPs of one type within a group, hosting one policy set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpSubGroup {
    /// PDP type served by this sub-group.
    pub pdp_type: String,

    /// Number of instances the operator asked for.
    #[serde(default)]
    pub desired_instance_count: u32,

    /// Number of instances currently registered.
    #[serde(default)]
    pub current_instance_count: u32,

    /// Policies deployed to this sub-group.
    #[serde(default)]
    pub policies: Vec<PolicyIdentifier>,

    /// Registered instances.
    #[serde(default)]
    pub pdp_instances: Vec<PdpInstance>,
}

impl PdpSubGroup {
    /// Create an empty sub-group for a PDP type.
    pub fn new(pdp_type: impl Into<String>) -> Self {
        Self {
            pdp_type: pdp_type.into(),
            desired_instance_count: 0,
            current_instance_count: 0,
            policies: Vec::new(),
            pdp_instances: Vec::new(),
        }
    }

    /// Whether the sub-group contains the given instance.
    #[must_use]
    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.pdp_instances
            .iter()
            .any(|pdp| pdp.instance_id == instance_id)
    }

    /// Remove an instance, decrementing the current count.
    ///
    /// Returns `true` if the instance was present.
    pub fn remove_instance(&mut self, instance_id: &str) -> bool {
        let before = self.pdp_instances.len();
        self.pdp_instances
            .retain(|pdp| pdp.instance_id != instance_id);

        if self.pdp_instances.len() == before {
            return false;
        }

        self.current_instance_count = self.current_instance_count.saturating_sub(1);
        true
    }
}

/// A group of sub-groups sharing a lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpGroup {
    /// Group name.
    pub name: String,

    /// Operator description.
    #[serde(default)]
    pub description: Option<String>,

    /// State pushed to member PDPs.
    pub pdp_group_state: PdpState,

    /// Member sub-groups.
    #[serde(default)]
    pub pdp_subgroups: Vec<PdpSubGroup>,
}

impl PdpGroup {
    /// Create an empty group in the given state.
    pub fn new(name: impl Into<String>, state: PdpState) -> Self {
        Self {
            name: name.into(),
            description: None,
            pdp_group_state: state,
            pdp_subgroups: Vec::new(),
        }
    }

    /// The sub-group containing the given PDP instance, if any.
    #[must_use]
    pub fn subgroup_of(&self, instance_id: &str) -> Option<&PdpSubGroup> {
        self.pdp_subgroups
            .iter()
            .find(|subgroup| subgroup.has_instance(instance_id))
    }

    /// Remove a PDP instance from whichever sub-groups contain it.
    ///
    /// Returns `true` if anything changed.
    pub fn remove_instance(&mut self, instance_id: &str) -> bool {
        let mut changed = false;
        for subgroup in &mut self.pdp_subgroups {
            changed |= subgroup.remove_instance(instance_id);
        }
        changed
    }
}

/// Selects groups when querying the policy store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdpGroupFilter {
    /// Match a specific group name.
    pub name: Option<String>,

    /// Match groups in a specific state.
    pub group_state: Option<PdpState>,

    /// Match groups with a sub-group of this PDP type.
    pub pdp_type: Option<String>,

    /// Match groups containing this PDP instance.
    pub pdp_instance: Option<String>,
}

impl PdpGroupFilter {
    /// Filter for groups containing a PDP instance.
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            pdp_instance: Some(instance_id.into()),
            ..Self::default()
        }
    }

    /// Whether a group passes this filter.
    #[must_use]
    pub fn matches(&self, group: &PdpGroup) -> bool {
        if let Some(name) = &self.name
            && group.name != *name
        {
            return false;
        }

        if let Some(state) = self.group_state
            && group.pdp_group_state != state
        {
            return false;
        }

        if let Some(pdp_type) = &self.pdp_type
            && !group
                .pdp_subgroups
                .iter()
                .any(|subgroup| subgroup.pdp_type == *pdp_type)
        {
            return false;
        }

        if let Some(instance) = &self.pdp_instance
            && group.subgroup_of(instance).is_none()
        {
            return false;
        }

        true
    }
}

/// Detach a PDP from every sub-group that lists it and persist the result.
///
/// Groups without the instance are left untouched and not rewritten.
/// Returns `true` if any group was changed.
///
/// # Errors
///
/// Returns the store error if the load or the write fails; partial mutation
/// is never persisted.
pub fn remove_pdp_from_groups(
    store: &dyn PolicyStore,
    pdp_name: &str,
) -> Result<bool, StoreError> {
    let mut groups = store.get_filtered_pdp_groups(&PdpGroupFilter::for_instance(pdp_name))?;

    groups.retain_mut(|group| group.remove_instance(pdp_name));

    if groups.is_empty() {
        return Ok(false);
    }

    store.update_pdp_groups(&groups)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPolicyStore;

    fn subgroup_with(pdp_type: &str, instances: &[&str]) -> PdpSubGroup {
        let mut subgroup = PdpSubGroup::new(pdp_type);
        subgroup.pdp_instances = instances.iter().copied().map(PdpInstance::new).collect();
        subgroup.current_instance_count = instances.len() as u32;
        subgroup
    }

    #[test]
    fn test_remove_instance_decrements_count() {
        let mut subgroup = subgroup_with("xacml", &["pdp_1", "pdp_1x", "pdp_1y"]);

        assert!(subgroup.remove_instance("pdp_1"));
        assert_eq!(subgroup.current_instance_count, 2);
        assert!(!subgroup.has_instance("pdp_1"));
        assert!(subgroup.has_instance("pdp_1x"));

        // removing again is a no-op
        assert!(!subgroup.remove_instance("pdp_1"));
        assert_eq!(subgroup.current_instance_count, 2);
    }

    #[test]
    fn test_filter_for_instance() {
        let mut group = PdpGroup::new("my-group", PdpState::Active);
        group.pdp_subgroups.push(subgroup_with("xacml", &["pdp_1"]));

        assert!(PdpGroupFilter::for_instance("pdp_1").matches(&group));
        assert!(!PdpGroupFilter::for_instance("pdp_9").matches(&group));

        let by_type = PdpGroupFilter {
            pdp_type: Some("xacml".into()),
            ..PdpGroupFilter::default()
        };
        assert!(by_type.matches(&group));

        let by_state = PdpGroupFilter {
            group_state: Some(PdpState::Passive),
            ..PdpGroupFilter::default()
        };
        assert!(!by_state.matches(&group));
    }

    #[test]
    fn test_remove_pdp_from_groups_rewrites_only_touched_groups() {
        let store = InMemoryPolicyStore::default();

        let mut touched = PdpGroup::new("g1", PdpState::Active);
        touched.pdp_subgroups.push(subgroup_with("a", &["pdp_1a"]));
        touched
            .pdp_subgroups
            .push(subgroup_with("b", &["pdp_1", "pdp_1x", "pdp_1y"]));

        let mut untouched = PdpGroup::new("g2", PdpState::Active);
        untouched.pdp_subgroups.push(subgroup_with("a", &["other"]));

        store.put_group(touched);
        store.put_group(untouched.clone());

        assert!(remove_pdp_from_groups(&store, "pdp_1").unwrap());

        let groups = store
            .get_filtered_pdp_groups(&PdpGroupFilter::default())
            .unwrap();
        let g1 = groups.iter().find(|group| group.name == "g1").unwrap();
        let g2 = groups.iter().find(|group| group.name == "g2").unwrap();

        let b = g1
            .pdp_subgroups
            .iter()
            .find(|subgroup| subgroup.pdp_type == "b")
            .unwrap();
        assert_eq!(b.current_instance_count, 2);
        assert!(!b.has_instance("pdp_1"));
        assert!(b.has_instance("pdp_1x"));
        assert_eq!(*g2, untouched);
    }

    #[test]
    fn test_remove_pdp_from_groups_absent_pdp() {
        let store = InMemoryPolicyStore::default();
        let mut group = PdpGroup::new("g1", PdpState::Active);
        group.pdp_subgroups.push(subgroup_with("a", &["other"]));
        store.put_group(group);

        assert!(!remove_pdp_from_groups(&store, "pdp_1").unwrap());
        assert_eq!(store.update_count(), 0);
    }
}
