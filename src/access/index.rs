//! Access index: which accounts may read/write which patients
//!
//! Entries live at `accessIndex/{account}/{patient} = true`. An entry either
//! exists or it does not; there are no permission levels.
//!
//! All lookups here fail closed. A missing id or a store error means "no
//! access" (or an empty set) and is logged, never raised. The guard in
//! `guard.rs` is the only place a denial becomes an error.

use crate::error::StoreResult;
use crate::model::{AccountId, PatientId};
use crate::store::{DocumentStore, StorePaths};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AccessIndex {
    store: Arc<dyn DocumentStore>,
    paths: StorePaths,
}

impl AccessIndex {
    pub fn new(store: Arc<dyn DocumentStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// True iff an access entry exists for the pair
    pub async fn has_access(&self, account_id: &AccountId, patient_id: &PatientId) -> bool {
        if !account_id.is_valid() || !patient_id.is_valid() {
            return false;
        }
        match self.entry_exists(account_id, patient_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    patient_id = %patient_id,
                    error = %e,
                    "Access lookup failed, denying"
                );
                false
            }
        }
    }

    /// Create the entry. Idempotent; `false` only when the write fails.
    pub async fn grant_access(&self, account_id: &AccountId, patient_id: &PatientId) -> bool {
        if !account_id.is_valid() || !patient_id.is_valid() {
            warn!(
                account_id = %account_id,
                patient_id = %patient_id,
                "Refusing to grant access with invalid id"
            );
            return false;
        }
        let path = self.paths.access_entry(account_id, patient_id);
        match self.store.set(&path, Value::Bool(true)).await {
            Ok(()) => {
                info!(account_id = %account_id, patient_id = %patient_id, "Access granted");
                true
            }
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    patient_id = %patient_id,
                    error = %e,
                    "Grant failed"
                );
                false
            }
        }
    }

    /// Delete the entry. Succeeds when it was already absent.
    pub async fn revoke_access(&self, account_id: &AccountId, patient_id: &PatientId) -> bool {
        if !account_id.is_valid() || !patient_id.is_valid() {
            warn!(
                account_id = %account_id,
                patient_id = %patient_id,
                "Refusing to revoke access with invalid id"
            );
            return false;
        }
        let path = self.paths.access_entry(account_id, patient_id);
        match self.store.remove(&path).await {
            Ok(()) => {
                info!(account_id = %account_id, patient_id = %patient_id, "Access revoked");
                true
            }
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    patient_id = %patient_id,
                    error = %e,
                    "Revoke failed"
                );
                false
            }
        }
    }

    /// Every patient the account holds an entry for. Empty on missing id or store error.
    pub async fn list_accessible_patient_ids(&self, account_id: &AccountId) -> BTreeSet<PatientId> {
        if !account_id.is_valid() {
            return BTreeSet::new();
        }
        match self.try_list_accessible(account_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Listing accessible patients failed");
                BTreeSet::new()
            }
        }
    }

    /// Every account holding an entry for the patient, in store key order.
    ///
    /// Unlike the other lookups this reports store errors, because the
    /// reconciler must distinguish "no holders" from "holders unknown".
    pub async fn holders_of(&self, patient_id: &PatientId) -> StoreResult<Vec<AccountId>> {
        if !patient_id.is_valid() {
            return Ok(Vec::new());
        }
        let accounts = self.store.child_keys(self.paths.access_root()).await?;
        let checks = accounts.into_iter().map(|account| async move {
            let account_id = AccountId::from(account);
            let exists = self.entry_exists(&account_id, patient_id).await?;
            Ok::<_, crate::error::StoreError>(exists.then_some(account_id))
        });
        let mut holders = Vec::new();
        for result in join_all(checks).await {
            if let Some(account_id) = result? {
                holders.push(account_id);
            }
        }
        debug!(patient_id = %patient_id, holders = holders.len(), "Listed access holders");
        Ok(holders)
    }

    /// Every (account, patient) pair in the index
    pub async fn all_entries(&self) -> StoreResult<Vec<(AccountId, PatientId)>> {
        let mut entries = Vec::new();
        for account in self.store.child_keys(self.paths.access_root()).await? {
            let account_id = AccountId::from(account);
            for patient_id in self.try_list_accessible(&account_id).await? {
                entries.push((account_id.clone(), patient_id));
            }
        }
        Ok(entries)
    }

    async fn try_list_accessible(
        &self,
        account_id: &AccountId,
    ) -> StoreResult<BTreeSet<PatientId>> {
        let path = self.paths.access_of(account_id);
        let ids = match self.store.get(&path).await? {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter(|(_, v)| *v == Value::Bool(true))
                .map(|(k, _)| PatientId::from(k))
                .collect(),
            _ => BTreeSet::new(),
        };
        Ok(ids)
    }

    async fn entry_exists(
        &self,
        account_id: &AccountId,
        patient_id: &PatientId,
    ) -> StoreResult<bool> {
        let path = self.paths.access_entry(account_id, patient_id);
        Ok(self.store.get(&path).await? == Some(Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn index() -> AccessIndex {
        AccessIndex::new(Arc::new(MemoryStore::new()), StorePaths::default())
    }

    #[tokio::test]
    async fn test_grant_revoke_idempotent() {
        let index = index();
        let a = AccountId::from("acc-1");
        let p = PatientId::from("pat-1");

        assert!(!index.has_access(&a, &p).await);
        assert!(index.grant_access(&a, &p).await);
        assert!(index.grant_access(&a, &p).await);
        assert!(index.has_access(&a, &p).await);

        assert!(index.revoke_access(&a, &p).await);
        assert!(index.revoke_access(&a, &p).await);
        assert!(!index.has_access(&a, &p).await);
    }

    #[tokio::test]
    async fn test_missing_ids_fail_closed() {
        let index = index();
        let p = PatientId::from("pat-1");
        assert!(!index.grant_access(&AccountId::from(""), &p).await);
        assert!(!index.has_access(&AccountId::from(""), &p).await);
        assert!(index.list_accessible_patient_ids(&AccountId::from("")).await.is_empty());
    }

    #[tokio::test]
    async fn test_listing_both_directions() {
        let index = index();
        let (a, b) = (AccountId::from("a"), AccountId::from("b"));
        let (p1, p2) = (PatientId::from("p1"), PatientId::from("p2"));
        index.grant_access(&a, &p1).await;
        index.grant_access(&a, &p2).await;
        index.grant_access(&b, &p1).await;

        let for_a = index.list_accessible_patient_ids(&a).await;
        assert_eq!(for_a.into_iter().collect::<Vec<_>>(), vec![p1.clone(), p2.clone()]);
        assert_eq!(index.holders_of(&p1).await.unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(index.holders_of(&p2).await.unwrap(), vec![a.clone()]);
        assert_eq!(index.all_entries().await.unwrap().len(), 3);
    }
}
