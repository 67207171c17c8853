//! Canonical/mirror reconciliation
//!
//! Every patient record has one canonical copy and one mirror per account
//! holding access. All writes go through [`PatientReconciler`], which applies
//! the change to the canonical copy first and then to every holder's mirror.
//! A mirror that does not exist yet is seeded with the full canonical copy.
//!
//! Entry collections are id-keyed and every entry write addresses the single
//! entry path, so concurrent edits of different entries never overwrite each
//! other.
//!
//! The reconciler does not check access; callers go through
//! [`AccessIndex::with_access`] first.

use crate::access::AccessIndex;
use crate::error::{MirrorFault, Result, SafeCareError, StoreError, SyncFailure};
use crate::model::{AccountId, EntryId, MetricEntry, MetricId, MetricKind, PatientId, PatientRecord};
use crate::store::{join, read_typed, DocumentStore, FieldUpdates, StorePaths};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Conversion passes before a collection still read as an array is reported
const KEYING_ATTEMPTS: usize = 3;

/// Entry collection under a patient record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Metric(MetricKind),
    Medications,
    Appointments,
    Observations,
}

impl Collection {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Metric(kind) => kind.collection(),
            Self::Medications => "medications",
            Self::Appointments => "appointments",
            Self::Observations => "observations",
        }
    }

    /// Older clients wrote these as positional arrays
    pub fn may_be_positional(&self) -> bool {
        !matches!(self, Self::Metric(_))
    }

    fn entry_path(&self, entry_id: &EntryId) -> String {
        format!("{}/{}", self.key(), entry_id)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// What a reconciled write touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Mirrors the change was applied to
    pub mirrors_written: Vec<AccountId>,
    /// Mirrors created from the full canonical copy
    pub mirrors_seeded: Vec<AccountId>,
    /// Stale mirrors of accounts without access (repair pass only)
    pub mirrors_removed: Vec<AccountId>,
    /// A repair pass ran after a partial failure
    pub repaired: bool,
}

impl ReconcileReport {
    pub fn mirrors_touched(&self) -> usize {
        self.mirrors_written.len() + self.mirrors_seeded.len()
    }
}

#[derive(Debug, Clone)]
enum Write {
    Set(Value),
    Update(FieldUpdates),
    Remove,
}

impl Write {
    async fn apply(
        &self,
        store: &dyn DocumentStore,
        path: &str,
    ) -> std::result::Result<(), StoreError> {
        match self {
            Write::Set(value) => store.set(path, value.clone()).await,
            Write::Update(updates) => store.update(path, updates.clone()).await,
            Write::Remove => store.remove(path).await,
        }
    }
}

enum MirrorOutcome {
    Written(AccountId),
    Seeded(AccountId),
    Failed(MirrorFault),
}

#[derive(Clone)]
pub struct PatientReconciler {
    store: Arc<dyn DocumentStore>,
    paths: StorePaths,
    access: AccessIndex,
    repair_on_partial_failure: bool,
}

impl PatientReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, access: AccessIndex) -> Self {
        let paths = access.paths().clone();
        Self {
            store,
            paths,
            access,
            repair_on_partial_failure: false,
        }
    }

    /// Run one repair pass before reporting a partial mirror failure
    pub fn with_repair_on_partial_failure(mut self, enabled: bool) -> Self {
        self.repair_on_partial_failure = enabled;
        self
    }

    pub async fn read_canonical(&self, patient_id: &PatientId) -> Result<Option<PatientRecord>> {
        Ok(read_typed(self.store.as_ref(), &self.paths.canonical(patient_id)).await?)
    }

    /// Write a whole record to the canonical copy and every holder's mirror
    pub async fn create(
        &self,
        patient_id: &PatientId,
        record: &PatientRecord,
    ) -> Result<ReconcileReport> {
        let value = serde_json::to_value(record)?;
        self.write_canonical(patient_id, "", &Write::Set(value.clone())).await?;
        info!(patient_id = %patient_id, "Canonical record written");
        self.propagate(patient_id, "", Write::Set(value)).await
    }

    /// Apply a partial-field patch to the canonical copy and every holder's mirror
    pub async fn update_everywhere(
        &self,
        patient_id: &PatientId,
        updates: FieldUpdates,
    ) -> Result<ReconcileReport> {
        if updates.is_empty() {
            return Ok(ReconcileReport::default());
        }
        self.require_canonical(patient_id).await?;
        let write = Write::Update(updates);
        self.write_canonical(patient_id, "", &write).await?;
        self.propagate(patient_id, "", write).await
    }

    /// Idempotent repair: copy the canonical record to every holder's mirror and
    /// drop mirrors held by accounts without access.
    pub async fn reconcile(&self, patient_id: &PatientId) -> Result<ReconcileReport> {
        let canonical = self
            .store
            .get(&self.paths.canonical(patient_id))
            .await?
            .ok_or_else(|| SafeCareError::NotFound(format!("patient {patient_id}")))?;
        let holders = self.access.holders_of(patient_id).await?;

        let writes = holders.iter().map(|account_id| {
            let path = self.paths.mirror(account_id, patient_id);
            let value = canonical.clone();
            async move {
                match self.store.set(&path, value).await {
                    Ok(()) => MirrorOutcome::Written(account_id.clone()),
                    Err(error) => MirrorOutcome::Failed(MirrorFault {
                        account_id: account_id.clone(),
                        error,
                    }),
                }
            }
        });

        let mut report = ReconcileReport::default();
        let mut failed = Vec::new();
        for outcome in join_all(writes).await {
            match outcome {
                MirrorOutcome::Written(id) | MirrorOutcome::Seeded(id) => {
                    report.mirrors_written.push(id)
                }
                MirrorOutcome::Failed(fault) => failed.push(fault),
            }
        }

        let holder_set: BTreeSet<&AccountId> = holders.iter().collect();
        for account in self.store.child_keys(self.paths.accounts_root()).await? {
            let account_id = AccountId::from(account);
            if holder_set.contains(&account_id) {
                continue;
            }
            let path = self.paths.mirror(&account_id, patient_id);
            match self.store.exists(&path).await {
                Ok(false) => {}
                Ok(true) => match self.store.remove(&path).await {
                    Ok(()) => report.mirrors_removed.push(account_id),
                    Err(error) => failed.push(MirrorFault { account_id, error }),
                },
                Err(error) => failed.push(MirrorFault { account_id, error }),
            }
        }

        if !failed.is_empty() {
            return Err(SyncFailure::Mirror {
                patient_id: patient_id.clone(),
                failed,
            }
            .into());
        }
        info!(
            patient_id = %patient_id,
            written = report.mirrors_written.len(),
            removed = report.mirrors_removed.len(),
            "Patient reconciled"
        );
        Ok(report)
    }

    /// Copy the canonical record into one account's mirror
    pub async fn seed_mirror(&self, account_id: &AccountId, patient_id: &PatientId) -> Result<()> {
        let canonical = self.require_canonical(patient_id).await?;
        self.store.set(&self.paths.mirror(account_id, patient_id), canonical).await?;
        debug!(account_id = %account_id, patient_id = %patient_id, "Mirror seeded");
        Ok(())
    }

    pub async fn drop_mirror(&self, account_id: &AccountId, patient_id: &PatientId) -> Result<()> {
        self.store.remove(&self.paths.mirror(account_id, patient_id)).await?;
        debug!(account_id = %account_id, patient_id = %patient_id, "Mirror dropped");
        Ok(())
    }

    // === Metrics ===

    /// Append a metric entry; returns its generated id
    pub async fn add_metric(
        &self,
        patient_id: &PatientId,
        kind: MetricKind,
        entry: &MetricEntry,
    ) -> Result<MetricId> {
        let entry = entry.clone().with_derived_bmi();
        entry.validate_for(kind)?;
        self.add_entry(patient_id, Collection::Metric(kind), &entry).await
    }

    /// Patch one metric entry in place; `NotFound` for an unknown id
    pub async fn edit_metric(
        &self,
        patient_id: &PatientId,
        kind: MetricKind,
        metric_id: &MetricId,
        updates: FieldUpdates,
    ) -> Result<MetricEntry> {
        let derive = |entry: MetricEntry| -> Result<MetricEntry> {
            let entry = entry.with_derived_bmi();
            entry.validate_for(kind)?;
            Ok(entry)
        };
        self.patch_entry(patient_id, Collection::Metric(kind), metric_id, updates, derive)
            .await
    }

    pub async fn remove_metric(
        &self,
        patient_id: &PatientId,
        kind: MetricKind,
        metric_id: &MetricId,
    ) -> Result<()> {
        self.remove_entry(patient_id, Collection::Metric(kind), metric_id)
            .await
    }

    // === Id-keyed entries ===

    pub async fn add_entry<T: Serialize>(
        &self,
        patient_id: &PatientId,
        collection: Collection,
        entry: &T,
    ) -> Result<EntryId> {
        self.require_canonical(patient_id).await?;
        if collection.may_be_positional() {
            self.ensure_keyed(patient_id, collection).await?;
        }
        let value = serde_json::to_value(entry)?;
        let base = join(&self.paths.canonical(patient_id), collection.key());
        let key = self
            .store
            .push(&base, value.clone())
            .await
            .map_err(|source| SyncFailure::Canonical {
                patient_id: patient_id.clone(),
                source,
            })?;
        let entry_id = EntryId::from(key);
        debug!(
            patient_id = %patient_id,
            collection = %collection,
            entry_id = %entry_id,
            "Entry added"
        );
        self.propagate(patient_id, &collection.entry_path(&entry_id), Write::Set(value))
            .await?;
        Ok(entry_id)
    }

    pub async fn edit_entry<T>(
        &self,
        patient_id: &PatientId,
        collection: Collection,
        entry_id: &EntryId,
        updates: FieldUpdates,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.patch_entry(patient_id, collection, entry_id, updates, Ok).await
    }

    pub async fn remove_entry(
        &self,
        patient_id: &PatientId,
        collection: Collection,
        entry_id: &EntryId,
    ) -> Result<()> {
        if collection.may_be_positional() {
            self.ensure_keyed(patient_id, collection).await?;
        }
        let sub = collection.entry_path(entry_id);
        let path = join(&self.paths.canonical(patient_id), &sub);
        if !self.store.exists(&path).await? {
            return Err(SafeCareError::NotFound(format!(
                "{collection} entry {entry_id} of patient {patient_id}"
            )));
        }
        self.write_canonical(patient_id, &sub, &Write::Remove).await?;
        debug!(
            patient_id = %patient_id,
            collection = %collection,
            entry_id = %entry_id,
            "Entry removed"
        );
        self.propagate(patient_id, &sub, Write::Remove).await?;
        Ok(())
    }

    /// Rewrite a positional (array) collection as an id-keyed map.
    ///
    /// Entries are written one key per former index through a partial update,
    /// so an entry pushed by a concurrent caller survives the conversion.
    /// Returns the number of entries converted; 0 when already keyed.
    pub async fn ensure_keyed(
        &self,
        patient_id: &PatientId,
        collection: Collection,
    ) -> Result<usize> {
        let path = join(&self.paths.canonical(patient_id), collection.key());
        let mut converted = 0;
        for _ in 0..KEYING_ATTEMPTS {
            let Some(Value::Array(items)) = self.store.get(&path).await? else {
                return Ok(converted);
            };
            // Former indices become the keys, matching how positional arrays decode
            let keyed: FieldUpdates = items
                .into_iter()
                .enumerate()
                .filter(|(_, item)| !item.is_null())
                .map(|(index, item)| (index.to_string(), item))
                .collect();
            if keyed.is_empty() {
                self.write_canonical(patient_id, collection.key(), &Write::Remove)
                    .await?;
                self.propagate(patient_id, collection.key(), Write::Remove)
                    .await?;
                return Ok(converted);
            }
            converted = keyed.len();
            let write = Write::Update(keyed);
            self.write_canonical(patient_id, collection.key(), &write).await?;
            info!(
                patient_id = %patient_id,
                collection = %collection,
                converted,
                "Positional collection keyed"
            );
            self.propagate(patient_id, collection.key(), write).await?;
        }
        Err(SyncFailure::Canonical {
            patient_id: patient_id.clone(),
            source: StoreError::Conflict(format!("{path} is still positional")),
        }
        .into())
    }

    // === Private Implementation ===

    async fn require_canonical(&self, patient_id: &PatientId) -> Result<Value> {
        if !patient_id.is_valid() {
            return Err(SafeCareError::NotFound(format!("patient {patient_id:?}")));
        }
        self.store
            .get(&self.paths.canonical(patient_id))
            .await?
            .ok_or_else(|| SafeCareError::NotFound(format!("patient {patient_id}")))
    }

    async fn patch_entry<T, F>(
        &self,
        patient_id: &PatientId,
        collection: Collection,
        entry_id: &EntryId,
        mut updates: FieldUpdates,
        derive: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> Result<T>,
    {
        if let Some(key) = updates.keys().find(|k| k.contains('/')) {
            return Err(SafeCareError::InvalidEntry(format!("nested field {key:?} in entry patch")));
        }
        if collection.may_be_positional() {
            self.ensure_keyed(patient_id, collection).await?;
        }
        let sub = collection.entry_path(entry_id);
        let path = join(&self.paths.canonical(patient_id), &sub);
        let mut merged = match self.store.get(&path).await? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SafeCareError::InvalidEntry(format!(
                    "{collection} entry {entry_id} is not an object"
                )));
            }
            None => {
                return Err(SafeCareError::NotFound(format!(
                    "{collection} entry {entry_id} of patient {patient_id}"
                )));
            }
        };
        for (key, value) in &updates {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }

        let entry: T = serde_json::from_value(Value::Object(merged.clone())).map_err(|e| {
            SafeCareError::InvalidEntry(format!("{collection} entry {entry_id}: {e}"))
        })?;
        let decoded = serde_json::to_value(&entry)?;
        let entry = derive(entry)?;

        // Fields recomputed or cleared by `derive` travel with the patch
        if let Value::Object(derived) = serde_json::to_value(&entry)? {
            if let Value::Object(decoded) = decoded {
                for key in decoded.keys().filter(|k| !derived.contains_key(*k)) {
                    updates.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in derived {
                if merged.get(&key) != Some(&value) {
                    updates.insert(key, value);
                }
            }
        }

        let write = Write::Update(updates);
        self.write_canonical(patient_id, &sub, &write).await?;
        debug!(
            patient_id = %patient_id,
            collection = %collection,
            entry_id = %entry_id,
            "Entry edited"
        );
        self.propagate(patient_id, &sub, write).await?;
        Ok(entry)
    }

    async fn write_canonical(
        &self,
        patient_id: &PatientId,
        sub: &str,
        write: &Write,
    ) -> std::result::Result<(), SyncFailure> {
        let path = join(&self.paths.canonical(patient_id), sub);
        write.apply(self.store.as_ref(), &path).await.map_err(|source| {
            warn!(
                patient_id = %patient_id,
                path = %path,
                error = %source,
                "Canonical write failed"
            );
            SyncFailure::Canonical {
                patient_id: patient_id.clone(),
                source,
            }
        })
    }

    /// Apply `write` at `sub` under every holder's mirror
    async fn propagate(
        &self,
        patient_id: &PatientId,
        sub: &str,
        write: Write,
    ) -> Result<ReconcileReport> {
        let holders = self.access.holders_of(patient_id).await.map_err(|source| {
            warn!(
                patient_id = %patient_id,
                error = %source,
                "Holder lookup failed after canonical write"
            );
            SyncFailure::HolderLookup {
                patient_id: patient_id.clone(),
                source,
            }
        })?;

        let writes = holders
            .iter()
            .map(|account_id| self.write_mirror(account_id, patient_id, sub, &write));
        let outcomes = join_all(writes).await;

        let mut report = ReconcileReport::default();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                MirrorOutcome::Written(id) => report.mirrors_written.push(id),
                MirrorOutcome::Seeded(id) => report.mirrors_seeded.push(id),
                MirrorOutcome::Failed(fault) => failed.push(fault),
            }
        }

        if failed.is_empty() {
            debug!(
                patient_id = %patient_id,
                sub = %sub,
                mirrors = report.mirrors_touched(),
                "Write propagated"
            );
            return Ok(report);
        }

        warn!(patient_id = %patient_id, failed = failed.len(), "Mirror writes failed");
        if self.repair_on_partial_failure {
            if let Ok(mut repaired) = self.reconcile(patient_id).await {
                repaired.repaired = true;
                return Ok(repaired);
            }
        }
        Err(SyncFailure::Mirror {
            patient_id: patient_id.clone(),
            failed,
        }
        .into())
    }

    async fn write_mirror(
        &self,
        account_id: &AccountId,
        patient_id: &PatientId,
        sub: &str,
        write: &Write,
    ) -> MirrorOutcome {
        let root = self.paths.mirror(account_id, patient_id);
        let fail = |error: StoreError| {
            MirrorOutcome::Failed(MirrorFault {
                account_id: account_id.clone(),
                error,
            })
        };

        let exists = match self.store.exists(&root).await {
            Ok(exists) => exists,
            Err(error) => return fail(error),
        };

        let whole_record_set = sub.is_empty() && matches!(write, Write::Set(_));
        if exists && !whole_record_set {
            return match write.apply(self.store.as_ref(), &join(&root, sub)).await {
                Ok(()) => MirrorOutcome::Written(account_id.clone()),
                Err(error) => fail(error),
            };
        }

        // Missing mirror, or a whole-record set: copy the canonical record
        let canonical = match self.store.get(&self.paths.canonical(patient_id)).await {
            Ok(Some(value)) => value,
            Ok(None) => Value::Null,
            Err(error) => return fail(error),
        };
        match self.store.set(&root, canonical).await {
            Ok(()) if exists => MirrorOutcome::Written(account_id.clone()),
            Ok(()) => MirrorOutcome::Seeded(account_id.clone()),
            Err(error) => fail(error),
        }
    }
}
