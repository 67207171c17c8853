//! Document store seam
//!
//! The access layer talks to a hierarchical key-path store through
//! [`DocumentStore`]. Handles are injected as `Arc<dyn DocumentStore>`; there is
//! no ambient connection.
//!
//! ## Layout
//!
//! - `accounts/{account}/profile`: account profile
//! - `accounts/{account}/patients/{patient}`: mirror copy
//! - `patientsGlobal/{patient}`: canonical copy
//! - `accessIndex/{account}/{patient} = true`: access entry
//! - `governmentIds/{normalized id} = patient`: government ID claim

mod memory;

pub use memory::MemoryStore;

use crate::config::PathConfig;
use crate::error::StoreResult;
use crate::model::{AccountId, PatientId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

/// Partial-field patch: direct children of the target node.
///
/// Keys may be relative multi-segment paths (`"glucose/m1/value"`); a `null`
/// value deletes the child.
pub type FieldUpdates = serde_json::Map<String, Value>;

/// Kind of change carried by a [`StoreEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Updated,
    Removed,
}

/// Change notification pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub path: String,
    pub kind: ChangeKind,
}

impl StoreEvent {
    /// Whether a change at this event's path is visible at `watched`
    pub fn touches(&self, watched: &str) -> bool {
        is_within(&self.path, watched) || is_within(watched, &self.path)
    }
}

fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Live subscription to changes at or below (or above) a path
#[derive(Debug)]
pub struct Subscription {
    path: String,
    receiver: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, receiver: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            path: path.into(),
            receiver,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change affecting the watched path.
    ///
    /// Returns `None` once the store is dropped.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.touches(&self.path) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        path = %self.path,
                        skipped,
                        "Subscription lagged, events dropped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Hierarchical key-path document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read. `None` when nothing is stored at `path`.
    async fn get(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Point write, replacing the subtree at `path`
    async fn set(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Partial merge of `patch` into the node at `path`
    async fn update(&self, path: &str, patch: FieldUpdates) -> StoreResult<()>;

    /// Write `value` only if nothing is stored at `path`, atomically.
    ///
    /// Returns `false` and leaves the node untouched when it is occupied.
    async fn set_if_absent(&self, path: &str, value: Value) -> StoreResult<bool>;

    /// Append under `path` with a generated key; returns the key
    async fn push(&self, path: &str, value: Value) -> StoreResult<String>;

    /// Delete the subtree at `path`. Deleting a missing path succeeds.
    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Keys of the direct children of `path`, sorted
    async fn child_keys(&self, path: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Push-based change notification for `path`
    fn subscribe(&self, path: &str) -> StoreResult<Subscription>;
}

/// Read and decode the value at `path`
pub async fn read_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    path: &str,
) -> StoreResult<Option<T>> {
    match store.get(path).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Builds namespaced store paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    accounts_root: String,
    canonical_root: String,
    access_root: String,
    government_id_root: String,
}

impl StorePaths {
    pub fn new(config: &PathConfig) -> Self {
        Self {
            accounts_root: config.accounts_root.clone(),
            canonical_root: config.canonical_root.clone(),
            access_root: config.access_root.clone(),
            government_id_root: config.government_id_root.clone(),
        }
    }

    pub fn accounts_root(&self) -> &str {
        &self.accounts_root
    }

    pub fn canonical_root(&self) -> &str {
        &self.canonical_root
    }

    pub fn access_root(&self) -> &str {
        &self.access_root
    }

    pub fn government_id_root(&self) -> &str {
        &self.government_id_root
    }

    /// `patientsGlobal/{patient}`
    pub fn canonical(&self, patient_id: &PatientId) -> String {
        format!("{}/{}", self.canonical_root, patient_id)
    }

    /// `accounts/{account}/patients/{patient}`
    pub fn mirror(&self, account_id: &AccountId, patient_id: &PatientId) -> String {
        format!("{}/{}", self.mirrors_of(account_id), patient_id)
    }

    /// `accounts/{account}/patients`
    pub fn mirrors_of(&self, account_id: &AccountId) -> String {
        format!("{}/{}/patients", self.accounts_root, account_id)
    }

    /// `accounts/{account}/profile`
    pub fn profile(&self, account_id: &AccountId) -> String {
        format!("{}/{}/profile", self.accounts_root, account_id)
    }

    /// `accessIndex/{account}/{patient}`
    pub fn access_entry(&self, account_id: &AccountId, patient_id: &PatientId) -> String {
        format!("{}/{}", self.access_of(account_id), patient_id)
    }

    /// `accessIndex/{account}`
    pub fn access_of(&self, account_id: &AccountId) -> String {
        format!("{}/{}", self.access_root, account_id)
    }

    /// `governmentIds/{normalized}`; `normalized` comes from
    /// `normalize_government_id` and is a single alphanumeric segment
    pub fn government_id_claim(&self, normalized: &str) -> String {
        format!("{}/{}", self.government_id_root, normalized)
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self::new(&PathConfig::default())
    }
}

/// Append a relative sub-path to a base path
pub fn join(base: &str, sub: &str) -> String {
    match (base.is_empty(), sub.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => sub.to_string(),
        (false, false) => format!("{base}/{sub}"),
    }
}
