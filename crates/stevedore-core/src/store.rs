//! Embedded transactional store.
//!
//! The whole object graph is persisted as a single serialized snapshot in a
//! sled tree. A [`StoreConn`] reads the snapshot once and works on a plain
//! in-memory [`DeployState`]; [`StoreConn::commit`] writes back with a
//! compare-and-swap against the bytes the connection read, so a concurrent
//! commit from another connection is detected and rejected with
//! [`Error::Conflict`] instead of silently overwriting it.
//!
//! One connection per operation; connections are never shared across tasks.
//! Dropping a connection without committing discards its changes.
//!
//! Schema migrations run once on open: a versioned sequence of
//! transformations applied in order to the serialized root. The schema is
//! fixed at v1 and only migrates forward.

use std::path::Path;

use serde_json::Value;
use sled::IVec;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::DeployState;

/// Current schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

const ROOT_KEY: &[u8] = b"root";
const STATE_TREE: &str = "state";

/// One migration step: transforms the serialized root in place.
type Migration = fn(&mut Value) -> Result<()>;

/// Steps indexed by the version they migrate *from*.
const MIGRATIONS: &[(u32, Migration)] = &[(0, migrate_v0_to_v1)];

/// v0 snapshots predate the versioned schema; stamping them v1 is the whole
/// migration.
fn migrate_v0_to_v1(root: &mut Value) -> Result<()> {
    if let Some(map) = root.as_object_mut() {
        map.insert("schema_version".to_string(), Value::from(1u32));
    }
    Ok(())
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Handle to the embedded database. Cheap to clone; owned by the controller
/// root for the lifetime of the process.
#[derive(Clone)]
pub struct Store {
    tree: sled::Tree,
}

impl Store {
    /// Opens (or creates) the database under `dir` and applies pending
    /// schema migrations.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(dir)?;
        let tree = db.open_tree(STATE_TREE)?;
        let store = Store { tree };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let Some(bytes) = self.tree.get(ROOT_KEY)? else {
            // Fresh database: write an empty root at the current version.
            let root = DeployState {
                schema_version: SCHEMA_VERSION,
                ..DeployState::default()
            };
            self.tree.insert(ROOT_KEY, serde_json::to_vec(&root)?)?;
            self.tree.flush()?;
            debug!(version = SCHEMA_VERSION, "initialized store");
            return Ok(());
        };

        let mut root: Value = serde_json::from_slice(&bytes)?;
        let mut version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        for (from, step) in MIGRATIONS {
            if *from == version {
                step(&mut root)?;
                version = *from + 1;
                root["schema_version"] = Value::from(version);
            }
        }
        self.tree.insert(ROOT_KEY, serde_json::to_vec(&root)?)?;
        self.tree.flush()?;
        info!(version, "migrated store schema");
        Ok(())
    }

    /// Opens a new connection with its own snapshot of the state.
    pub fn connection(&self) -> Result<StoreConn> {
        let bytes = self
            .tree
            .get(ROOT_KEY)?
            .ok_or_else(|| Error::invalid_input("store not initialized"))?;
        let state: DeployState = serde_json::from_slice(&bytes)?;
        Ok(StoreConn {
            tree: self.tree.clone(),
            snapshot: bytes,
            state,
        })
    }
}

// ─── StoreConn ────────────────────────────────────────────────────────────────

/// A per-operation connection: a mutable in-memory snapshot plus the commit
/// point it was read at.
pub struct StoreConn {
    tree: sled::Tree,
    snapshot: IVec,
    /// The working state. Mutations stay in memory until [`commit`].
    ///
    /// [`commit`]: StoreConn::commit
    pub state: DeployState,
}

impl StoreConn {
    /// Writes the working state back, failing with [`Error::Conflict`] if
    /// another connection committed since this one was opened.
    pub fn commit(&mut self) -> Result<()> {
        let new = IVec::from(serde_json::to_vec(&self.state)?);
        let swapped = self.tree.compare_and_swap(
            ROOT_KEY,
            Some(self.snapshot.clone()),
            Some(new.clone()),
        )?;
        match swapped {
            Ok(()) => {
                self.tree.flush()?;
                self.snapshot = new;
                Ok(())
            }
            Err(_) => Err(Error::Conflict),
        }
    }

    /// Discards the working state. Equivalent to dropping the connection;
    /// exists to make abort points explicit at call sites.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Deployment;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_store_is_at_current_schema() {
        let (_dir, store) = open_temp();
        let conn = store.connection().unwrap();
        assert_eq!(conn.state.schema_version, SCHEMA_VERSION);
        assert!(conn.state.deployments.is_empty());
    }

    #[test]
    fn commit_persists_across_connections() {
        let (_dir, store) = open_temp();

        let mut conn = store.connection().unwrap();
        conn.state
            .deployments
            .insert("foo".to_string(), Deployment::new("foo"));
        conn.commit().unwrap();

        let other = store.connection().unwrap();
        assert!(other.state.deployments.contains_key("foo"));
    }

    #[test]
    fn uncommitted_changes_are_discarded() {
        let (_dir, store) = open_temp();

        let conn = {
            let mut conn = store.connection().unwrap();
            conn.state
                .deployments
                .insert("foo".to_string(), Deployment::new("foo"));
            conn
        };
        conn.abort();

        let other = store.connection().unwrap();
        assert!(other.state.deployments.is_empty());
    }

    #[test]
    fn stale_commit_is_rejected() {
        let (_dir, store) = open_temp();

        let mut first = store.connection().unwrap();
        let mut second = store.connection().unwrap();

        first
            .state
            .deployments
            .insert("a".to_string(), Deployment::new("a"));
        first.commit().unwrap();

        second
            .state
            .deployments
            .insert("b".to_string(), Deployment::new("b"));
        let err = second.commit().unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }

    #[test]
    fn unversioned_snapshot_is_migrated_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = sled::open(&path).unwrap();
            let tree = db.open_tree(STATE_TREE).unwrap();
            tree.insert(ROOT_KEY, br#"{"deployments": {}}"#.to_vec())
                .unwrap();
            tree.flush().unwrap();
        }
        let store = Store::open(&path).unwrap();
        let conn = store.connection().unwrap();
        assert_eq!(conn.state.schema_version, SCHEMA_VERSION);
    }
}
