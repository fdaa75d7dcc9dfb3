//! Policy store access.
//!
//! [`PolicyStore`] is the seam to the persistent policy database. The core
//! consumes it read-mostly; the only write it performs is rewriting group
//! membership while disabling a PDP. Store failures are surfaced as
//! [`StoreError`] and never retried here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::groups::{PdpGroup, PdpGroupFilter};
use crate::policy::ToscaPolicy;

/// Error raised by a policy store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing database rejected or failed the operation.
    #[error("policy store failure: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt record {name}: {reason}")]
    Corrupt {
        /// Record key.
        name: String,

        /// Decode failure detail.
        reason: String,
    },
}

/// Selects policies when querying the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyFilter {
    /// Match a specific policy name.
    pub name: Option<String>,

    /// Match a specific version.
    pub version: Option<String>,

    /// Match a specific policy type.
    pub policy_type: Option<String>,
}

impl PolicyFilter {
    /// Whether a policy passes this filter.
    #[must_use]
    pub fn matches(&self, policy: &ToscaPolicy) -> bool {
        if let Some(name) = &self.name
            && policy.name != *name
        {
            return false;
        }

        if let Some(version) = &self.version
            && policy.version != *version
        {
            return false;
        }

        if let Some(policy_type) = &self.policy_type
            && policy.policy_type.as_deref() != Some(policy_type.as_str())
        {
            return false;
        }

        true
    }
}

/// Access to persisted PDP groups and policies.
pub trait PolicyStore: Send + Sync {
    /// Groups passing the filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_filtered_pdp_groups(&self, filter: &PdpGroupFilter)
    -> Result<Vec<PdpGroup>, StoreError>;

    /// Replace the stored form of each given group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn update_pdp_groups(&self, groups: &[PdpGroup]) -> Result<(), StoreError>;

    /// Policies with the given name and version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_policy_list(&self, name: &str, version: &str) -> Result<Vec<ToscaPolicy>, StoreError>;

    /// Policies passing the filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_filtered_policy_list(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<ToscaPolicy>, StoreError>;
}

/// In-memory [`PolicyStore`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    groups: Mutex<HashMap<String, PdpGroup>>,
    policies: Mutex<HashMap<(String, String), ToscaPolicy>>,
    update_count: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl InMemoryPolicyStore {
    /// Insert or replace a group.
    pub fn put_group(&self, group: PdpGroup) {
        self.groups
            .lock()
            .expect("lock poisoned")
            .insert(group.name.clone(), group);
    }

    /// Insert or replace a policy.
    pub fn put_policy(&self, policy: ToscaPolicy) {
        self.policies
            .lock()
            .expect("lock poisoned")
            .insert((policy.name.clone(), policy.version.clone()), policy);
    }

    /// Number of `update_pdp_groups` calls so far.
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    /// Make every following operation fail with the given message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().expect("lock poisoned") = Some(message.into());
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        match self.failure.lock().expect("lock poisoned").as_ref() {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn get_filtered_pdp_groups(
        &self,
        filter: &PdpGroupFilter,
    ) -> Result<Vec<PdpGroup>, StoreError> {
        self.check_failure()?;

        let groups = self.groups.lock().expect("lock poisoned");
        let mut matched: Vec<PdpGroup> = groups
            .values()
            .filter(|group| filter.matches(group))
            .cloned()
            .collect();
        matched.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(matched)
    }

    fn update_pdp_groups(&self, updated: &[PdpGroup]) -> Result<(), StoreError> {
        self.check_failure()?;
        self.update_count.fetch_add(1, Ordering::Relaxed);

        let mut groups = self.groups.lock().expect("lock poisoned");
        for group in updated {
            groups.insert(group.name.clone(), group.clone());
        }
        Ok(())
    }

    fn get_policy_list(&self, name: &str, version: &str) -> Result<Vec<ToscaPolicy>, StoreError> {
        self.check_failure()?;

        let policies = self.policies.lock().expect("lock poisoned");
        Ok(policies
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .into_iter()
            .collect())
    }

    fn get_filtered_policy_list(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<ToscaPolicy>, StoreError> {
        self.check_failure()?;

        let policies = self.policies.lock().expect("lock poisoned");
        let mut matched: Vec<ToscaPolicy> = policies
            .values()
            .filter(|policy| filter.matches(policy))
            .cloned()
            .collect();
        matched.sort_by(|left, right| {
            (&left.name, &left.version).cmp(&(&right.name, &right.version))
        });
        Ok(matched)
    }
}
