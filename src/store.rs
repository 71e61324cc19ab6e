// ===============================
// src/store.rs (contract store)
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use std::io::Write;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::{Contract, ContractState, Millis};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("contract {0} not found")]
    NotFound(String),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store {0} is held by another process (lock file {1})")]
    Locked(String, String),
}

/// Fields written when a settlement completes.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementUpdate {
    pub state: ContractState,
    pub close_price: Decimal,
    pub pnl_user: Decimal,
    pub pnl_venue: Decimal,
    pub pnl_net: Decimal,
    pub payback: bool,
    pub settled_at_ms: Millis,
}

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Snapshot of contracts that may still be matched.
    async fn active_contracts(&self) -> Result<Vec<Contract>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Contract>, StoreError>;

    /// Writes `update` only if the stored state is still `expected`.
    /// Returns `false` when another path changed the state first.
    async fn apply_settlement(
        &self,
        id: &str,
        expected: ContractState,
        update: &SettlementUpdate,
    ) -> Result<bool, StoreError>;

    /// Marks a contract for manual reconciliation; it leaves the active set.
    async fn flag_for_reconciliation(&self, id: &str, note: &str) -> Result<(), StoreError>;
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// In-process store, optionally mirrored to a JSON file after every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contracts: RwLock<HashMap<String, Contract>>,
    persist_to: Option<PathBuf>,
    // one file writer at a time
    file_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(contracts: Vec<Contract>) -> Self {
        Self {
            contracts: RwLock::new(contracts.into_iter().map(|c| (c.id.clone(), c)).collect()),
            ..Self::default()
        }
    }

    /// Loads a JSON array of contracts and writes changes back to the same file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let contracts: Vec<Contract> = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "contracts file missing, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), count = contracts.len(), "contracts loaded");
        Ok(Self { persist_to: Some(path), ..Self::new(contracts) })
    }

    /// State change from outside the settlement path (cancel, expiry, admin).
    #[cfg(test)]
    pub async fn set_state(&self, id: &str, state: ContractState) -> Result<(), StoreError> {
        {
            let mut map = self.contracts.write().await;
            let c = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            c.state = state;
        }
        self.persist().await
    }

    /// Snapshot is taken under the file lock, so the last file written
    /// always holds the newest state. Written to `<file>.tmp`, then renamed.
    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.persist_to else { return Ok(()) };
        let _file = self.file_lock.lock().await;
        let body = {
            let map = self.contracts.read().await;
            let mut all: Vec<&Contract> = map.values().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_vec_pretty(&all)?
        };
        let tmp = sibling(path, ".tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Exclusive claim on a contracts file by one process, held as
/// `<file>.lock` (containing the owner pid) until dropped.
#[derive(Debug)]
pub struct StoreLease {
    lock_path: PathBuf,
}

impl StoreLease {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let lock_path = sibling(path, ".lock");
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::Locked(
                path.display().to_string(),
                lock_path.display().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(?e, path = %self.lock_path.display(), "store lease: lock file not removed");
        }
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn active_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        Ok(self.contracts.read().await.values().filter(|c| c.is_matchable()).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Contract>, StoreError> {
        Ok(self.contracts.read().await.get(id).cloned())
    }

    async fn apply_settlement(
        &self,
        id: &str,
        expected: ContractState,
        update: &SettlementUpdate,
    ) -> Result<bool, StoreError> {
        {
            let mut map = self.contracts.write().await;
            let c = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if c.state != expected {
                return Ok(false);
            }
            c.state = update.state;
            c.close_price = Some(update.close_price);
            c.pnl_user = update.pnl_user;
            c.pnl_venue = update.pnl_venue;
            c.pnl_net = update.pnl_net;
            c.payback = update.payback;
            c.settled_at_ms = Some(update.settled_at_ms);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn flag_for_reconciliation(&self, id: &str, note: &str) -> Result<(), StoreError> {
        {
            let mut map = self.contracts.write().await;
            let c = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            c.reconciliation = Some(note.to_string());
        }
        self.persist().await
    }
}
