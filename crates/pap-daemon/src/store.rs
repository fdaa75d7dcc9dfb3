//! Persistent policy store backed by `SQLite`.
//!
//! # Schema
//!
//! The `pdp_group` table has columns: `name`, `description`, `state`,
//! `subgroups` (JSON). The `policy` table has columns: `name`, `version`,
//! `policy_type`, `body` (JSON).
//!
//! Group filters match on decoded records rather than in SQL; the fleet is
//! small and the membership predicates do not map cleanly onto columns.

use std::path::Path;
use std::sync::{Arc, Mutex};

use pap_core::groups::{PdpGroup, PdpGroupFilter, PdpSubGroup};
use pap_core::messages::PdpState;
use pap_core::policy::ToscaPolicy;
use pap_core::store::{PolicyFilter, PolicyStore, StoreError};
use rusqlite::{Connection, params};
use tracing::info;

/// Durable [`PolicyStore`] implementation.
#[derive(Debug)]
pub struct SqlitePolicyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePolicyStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::init_schema(&conn)?;
        info!(path = %path.display(), "opened policy store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pdp_group (
                name TEXT PRIMARY KEY,
                description TEXT,
                state TEXT NOT NULL,
                subgroups TEXT NOT NULL
            )",
            [],
        )
        .map_err(backend)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS policy (
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                policy_type TEXT,
                body TEXT NOT NULL,
                PRIMARY KEY (name, version)
            )",
            [],
        )
        .map_err(backend)?;
        Ok(())
    }

    /// Insert or replace a group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn put_group(&self, group: &PdpGroup) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        Self::write_group(&conn, group)
    }

    /// Insert or replace a policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn put_policy(&self, policy: &ToscaPolicy) -> Result<(), StoreError> {
        let body = serde_json::to_string(policy).map_err(|err| StoreError::Backend(err.to_string()))?;
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO policy (name, version, policy_type, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![policy.name, policy.version, policy.policy_type, body],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn write_group(conn: &Connection, group: &PdpGroup) -> Result<(), StoreError> {
        let state = serde_json::to_string(&group.pdp_group_state)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let subgroups = serde_json::to_string(&group.pdp_subgroups)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO pdp_group (name, description, state, subgroups)
             VALUES (?1, ?2, ?3, ?4)",
            params![group.name, group.description, state, subgroups],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn row_to_group(
        name: String,
        description: Option<String>,
        state: &str,
        subgroups: &str,
    ) -> Result<PdpGroup, StoreError> {
        let pdp_group_state: PdpState =
            serde_json::from_str(state).map_err(|err| StoreError::Corrupt {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        let pdp_subgroups: Vec<PdpSubGroup> =
            serde_json::from_str(subgroups).map_err(|err| StoreError::Corrupt {
                name: name.clone(),
                reason: err.to_string(),
            })?;

        Ok(PdpGroup {
            name,
            description,
            pdp_group_state,
            pdp_subgroups,
        })
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl PolicyStore for SqlitePolicyStore {
    fn get_filtered_pdp_groups(
        &self,
        filter: &PdpGroupFilter,
    ) -> Result<Vec<PdpGroup>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT name, description, state, subgroups FROM pdp_group ORDER BY name")
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(backend)?;

        let mut groups = Vec::new();
        for row in rows {
            let (name, description, state, subgroups) = row.map_err(backend)?;
            let group = Self::row_to_group(name, description, &state, &subgroups)?;
            if filter.matches(&group) {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    fn update_pdp_groups(&self, groups: &[PdpGroup]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction().map_err(backend)?;
        for group in groups {
            Self::write_group(&tx, group)?;
        }
        tx.commit().map_err(backend)
    }

    fn get_policy_list(&self, name: &str, version: &str) -> Result<Vec<ToscaPolicy>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT body FROM policy WHERE name = ?1 AND version = ?2")
            .map_err(backend)?;

        let rows = stmt
            .query_map(params![name, version], |row| row.get::<_, String>(0))
            .map_err(backend)?;

        let mut policies = Vec::new();
        for body in rows {
            let body = body.map_err(backend)?;
            policies.push(serde_json::from_str(&body).map_err(|err| StoreError::Corrupt {
                name: format!("{name} {version}"),
                reason: err.to_string(),
            })?);
        }
        Ok(policies)
    }

    fn get_filtered_policy_list(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<ToscaPolicy>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT name, body FROM policy ORDER BY name, version")
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(backend)?;

        let mut policies = Vec::new();
        for row in rows {
            let (name, body) = row.map_err(backend)?;
            let policy: ToscaPolicy =
                serde_json::from_str(&body).map_err(|err| StoreError::Corrupt {
                    name,
                    reason: err.to_string(),
                })?;
            if filter.matches(&policy) {
                policies.push(policy);
            }
        }
        Ok(policies)
    }
}
