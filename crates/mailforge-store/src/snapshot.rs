//! Whole-file JSON snapshot persistence
//!
//! The entire engine state lives in one JSON document, loaded and written
//! as a unit. Writers must hold the per-user [`UserLock`](crate::UserLock)
//! before mutating a user's record; the store itself only guarantees that
//! individual writes are atomic (temp file + rename), not that concurrent
//! read-modify-write cycles compose.

use mailforge_common::types::OwnerId;
use mailforge_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::models::UserRecord;

/// The full persisted state: one record per user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub users: HashMap<OwnerId, UserRecord>,
}

/// Snapshot store rooted at a data directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store under `data_dir`, creating the directory if needed
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Persistence(format!("Failed to create data directory: {}", e)))?;

        info!(path = %data_dir.display(), "Initialized snapshot store");

        Ok(Self {
            path: data_dir.join("state.json"),
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full snapshot; a missing file yields an empty snapshot
    pub async fn load(&self) -> Result<Snapshot> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Snapshot::default());
            }
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "Failed to read snapshot: {}",
                    e
                )));
            }
        };

        serde_json::from_slice(&data)
            .map_err(|e| Error::Persistence(format!("Failed to parse snapshot: {}", e)))
    }

    /// Write the full snapshot atomically (temp file + rename)
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::Persistence(format!("Failed to serialize snapshot: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to write snapshot: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to replace snapshot: {}", e)))?;

        debug!(path = %self.path.display(), size = data.len(), "Persisted snapshot");

        Ok(())
    }

    /// Load one user's record
    pub async fn load_user(&self, owner: OwnerId) -> Result<Option<UserRecord>> {
        Ok(self.load().await?.users.get(&owner).cloned())
    }

    /// Read-modify-write one user's record, creating it if absent
    pub async fn update_user<F, T>(&self, owner: OwnerId, f: F) -> Result<T>
    where
        F: FnOnce(&mut UserRecord) -> T,
    {
        let mut snapshot = self.load().await?;
        let record = snapshot.users.entry(owner).or_default();
        let out = f(record);
        self.save(&snapshot).await?;
        Ok(out)
    }
}
