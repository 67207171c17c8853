//! Guarded patient service
//!
//! The facade UI code talks to. Every patient-scoped call is wrapped in
//! [`AccessIndex::with_access`]; writes go through [`PatientReconciler`] so
//! canonical and mirror copies stay in step.
//!
//! # Example
//!
//! ```rust,ignore
//! use safecare_access::{Config, MemoryStore, NewPatient, PatientService};
//!
//! let service = PatientService::new(Arc::new(MemoryStore::new()), Config::default());
//! let patient_id = service.register_patient(&caller, NewPatient::new("Maria", "123")).await?;
//! let record = service.get_patient(&caller, &patient_id).await?;
//! ```

use crate::access::AccessIndex;
use crate::config::Config;
use crate::error::{Result, SafeCareError, StoreError, SyncFailure};
use crate::identity::{AccountDirectory, IdentityResolver};
use crate::migrate::Migrator;
use crate::model::{
    normalize_government_id, AccountId, Appointment, CreatorRef, EntryId, Medication, MetricEntry,
    MetricId, MetricKind, NewPatient, Observation, PatientId, PatientPatch, PatientRecord,
};
use crate::reconcile::{Collection, PatientReconciler, ReconcileReport};
use crate::sharing::{SharingInfo, SharingInspector};
use crate::store::{join, read_typed, DocumentStore, FieldUpdates, StorePaths, Subscription};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PatientService {
    store: Arc<dyn DocumentStore>,
    paths: StorePaths,
    access: AccessIndex,
    directory: AccountDirectory,
    identity: IdentityResolver,
    reconciler: PatientReconciler,
    sharing: SharingInspector,
}

impl PatientService {
    pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        let paths = StorePaths::new(&config.paths);
        let access = AccessIndex::new(store.clone(), paths.clone());
        let directory = AccountDirectory::new(store.clone(), paths.clone());
        let identity =
            IdentityResolver::new(directory.clone(), access.clone(), config.identity.clone());
        let reconciler = PatientReconciler::new(store.clone(), access.clone())
            .with_repair_on_partial_failure(config.sync.repair_on_partial_failure);
        let sharing = SharingInspector::new(access.clone(), identity.clone());
        Self {
            store,
            paths,
            access,
            directory,
            identity,
            reconciler,
            sharing,
        }
    }

    pub fn access(&self) -> &AccessIndex {
        &self.access
    }

    pub fn accounts(&self) -> &AccountDirectory {
        &self.directory
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn reconciler(&self) -> &PatientReconciler {
        &self.reconciler
    }

    pub fn sharing(&self) -> &SharingInspector {
        &self.sharing
    }

    /// Migration passes over the same store
    pub fn migrator(&self) -> Migrator {
        Migrator::new(
            self.store.clone(),
            self.access.clone(),
            self.identity.clone(),
            self.reconciler.clone(),
        )
    }

    // === Patients ===

    /// Register a new patient; the caller becomes its owner and first holder.
    ///
    /// The normalized government ID is claimed with
    /// [`DocumentStore::set_if_absent`] before the record is written, so only
    /// one of several concurrent registrations of the same ID succeeds.
    /// Records written before claims existed are found by a scan.
    pub async fn register_patient(
        &self,
        caller: &AccountId,
        patient: NewPatient,
    ) -> Result<PatientId> {
        if !caller.is_valid() {
            return Err(SafeCareError::InvalidEntry(format!(
                "invalid account id {:?}",
                caller.as_str()
            )));
        }
        let normalized = normalize_government_id(&patient.government_id);
        if patient.name.trim().is_empty() || normalized.is_empty() {
            return Err(SafeCareError::InvalidEntry(
                "patient name and government ID are required".into(),
            ));
        }
        if let Some(existing) = self.find_by_government_id(&patient.government_id).await? {
            return Err(SafeCareError::DuplicatePatient {
                government_id: patient.government_id,
                patient_id: existing,
            });
        }

        let patient_id = PatientId::generate();
        self.claim_government_id(&normalized, &patient_id, &patient.government_id)
            .await?;
        if !self.access.grant_access(caller, &patient_id).await {
            self.release_government_id(&normalized, &patient_id).await;
            return Err(StoreError::Unavailable(format!(
                "could not grant {caller} access to new patient"
            ))
            .into());
        }
        let record = PatientRecord::new(patient, CreatorRef::Account(caller.clone()));
        if let Err(e) = self.reconciler.create(&patient_id, &record).await {
            // Leave no access entry or claim pointing at a record that was never written
            if matches!(&e, SafeCareError::Sync(failure) if failure.is_retryable()) {
                self.access.revoke_access(caller, &patient_id).await;
                self.release_government_id(&normalized, &patient_id).await;
            }
            return Err(e);
        }
        info!(account_id = %caller, patient_id = %patient_id, "Patient registered");
        Ok(patient_id)
    }

    /// Add an existing patient to the caller's list by government ID lookup
    pub async fn link_patient_by_government_id(
        &self,
        caller: &AccountId,
        government_id: &str,
    ) -> Result<PatientId> {
        let patient_id = self
            .find_by_government_id(government_id)
            .await?
            .ok_or_else(|| {
                SafeCareError::NotFound(format!("patient with government ID {government_id}"))
            })?;
        if self.access.has_access(caller, &patient_id).await {
            return Ok(patient_id);
        }
        if !self.access.grant_access(caller, &patient_id).await {
            return Err(StoreError::Unavailable(format!(
                "could not grant {caller} access to {patient_id}"
            ))
            .into());
        }
        self.reconciler.seed_mirror(caller, &patient_id).await?;
        info!(account_id = %caller, patient_id = %patient_id, "Patient linked by government ID");
        Ok(patient_id)
    }

    pub async fn get_patient(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
    ) -> Result<PatientRecord> {
        self.access
            .with_access(caller, patient_id, || async {
                self.reconciler
                    .read_canonical(patient_id)
                    .await?
                    .ok_or_else(|| SafeCareError::NotFound(format!("patient {patient_id}")))
            })
            .await
    }

    /// Every patient the caller may access. Access entries whose canonical
    /// record is missing or cannot be decoded are skipped.
    pub async fn list_patients(
        &self,
        caller: &AccountId,
    ) -> Result<Vec<(PatientId, PatientRecord)>> {
        let mut patients = Vec::new();
        for patient_id in self.access.list_accessible_patient_ids(caller).await {
            match self.reconciler.read_canonical(&patient_id).await {
                Ok(Some(record)) => patients.push((patient_id, record)),
                Ok(None) => warn!(
                    account_id = %caller,
                    patient_id = %patient_id,
                    "Access entry without canonical record"
                ),
                Err(SafeCareError::Store(StoreError::Serialization(error))) => warn!(
                    account_id = %caller,
                    patient_id = %patient_id,
                    error = %error,
                    "Undecodable canonical record skipped"
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(patients)
    }

    /// Patch demographics and stamp `editedBy` / `editedAt`.
    ///
    /// A new government ID is claimed first and must not belong to another
    /// patient; the previous claim is released once the canonical write lands.
    pub async fn update_patient(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        patch: PatientPatch,
    ) -> Result<ReconcileReport> {
        self.access
            .with_access(caller, patient_id, || async {
                let moved = match &patch.government_id {
                    Some(raw) => self.move_government_id(patient_id, raw).await?,
                    None => None,
                };
                let mut updates = patch.into_updates()?;
                updates.insert("editedBy".into(), Value::String(caller.to_string()));
                updates.insert("editedAt".into(), serde_json::to_value(Utc::now())?);
                let result = self.reconciler.update_everywhere(patient_id, updates).await;

                if let Some((previous, claimed)) = moved {
                    let canonical_failed = matches!(
                        &result,
                        Err(SafeCareError::Sync(SyncFailure::Canonical { .. }))
                    );
                    match (canonical_failed, previous) {
                        (true, _) => self.release_government_id(&claimed, patient_id).await,
                        (false, Some(previous)) => {
                            self.release_government_id(&previous, patient_id).await
                        }
                        (false, None) => {}
                    }
                }
                result
            })
            .await
    }

    // === Metrics ===

    pub async fn add_metric(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        kind: MetricKind,
        entry: MetricEntry,
    ) -> Result<MetricId> {
        self.access
            .with_access(caller, patient_id, || async {
                let entry = if entry.author.is_some() {
                    entry
                } else {
                    entry.by(caller.clone())
                };
                self.reconciler.add_metric(patient_id, kind, &entry).await
            })
            .await
    }

    pub async fn edit_metric(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        kind: MetricKind,
        metric_id: &MetricId,
        updates: FieldUpdates,
    ) -> Result<MetricEntry> {
        self.access
            .with_access(caller, patient_id, || {
                self.reconciler.edit_metric(patient_id, kind, metric_id, updates)
            })
            .await
    }

    pub async fn remove_metric(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        kind: MetricKind,
        metric_id: &MetricId,
    ) -> Result<()> {
        self.access
            .with_access(caller, patient_id, || {
                self.reconciler.remove_metric(patient_id, kind, metric_id)
            })
            .await
    }

    /// One metric collection, oldest first
    pub async fn list_metrics(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        kind: MetricKind,
    ) -> Result<Vec<(MetricId, MetricEntry)>> {
        let record = self.get_patient(caller, patient_id).await?;
        Ok(record
            .metrics_sorted(kind)
            .into_iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect())
    }

    // === Medications ===

    pub async fn add_medication(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        medication: Medication,
    ) -> Result<EntryId> {
        self.add_entry(caller, patient_id, Collection::Medications, &medication)
            .await
    }

    pub async fn edit_medication(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        entry_id: &EntryId,
        updates: FieldUpdates,
    ) -> Result<Medication> {
        self.edit_entry(caller, patient_id, Collection::Medications, entry_id, updates)
            .await
    }

    pub async fn remove_medication(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        entry_id: &EntryId,
    ) -> Result<()> {
        self.remove_entry(caller, patient_id, Collection::Medications, entry_id)
            .await
    }

    // === Appointments ===

    pub async fn add_appointment(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        appointment: Appointment,
    ) -> Result<EntryId> {
        self.add_entry(caller, patient_id, Collection::Appointments, &appointment)
            .await
    }

    pub async fn edit_appointment(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        entry_id: &EntryId,
        updates: FieldUpdates,
    ) -> Result<Appointment> {
        self.edit_entry(caller, patient_id, Collection::Appointments, entry_id, updates)
            .await
    }

    pub async fn remove_appointment(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        entry_id: &EntryId,
    ) -> Result<()> {
        self.remove_entry(caller, patient_id, Collection::Appointments, entry_id)
            .await
    }

    // === Observations ===

    pub async fn add_observation(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        text: &str,
    ) -> Result<EntryId> {
        if text.trim().is_empty() {
            return Err(SafeCareError::InvalidEntry("observation text is empty".into()));
        }
        let observation = Observation::new(text.trim(), caller.clone());
        self.add_entry(caller, patient_id, Collection::Observations, &observation)
            .await
    }

    pub async fn remove_observation(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        entry_id: &EntryId,
    ) -> Result<()> {
        self.remove_entry(caller, patient_id, Collection::Observations, entry_id)
            .await
    }

    // === Sharing ===

    pub async fn sharing_info(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
    ) -> Result<SharingInfo> {
        let record = self.get_patient(caller, patient_id).await?;
        Ok(self.sharing.get_sharing_info(caller, &record, patient_id).await)
    }

    /// Remove the patient from the caller's own list
    pub async fn leave_patient(&self, caller: &AccountId, patient_id: &PatientId) -> Result<()> {
        self.access.require_access(caller, patient_id).await?;
        if !self.access.revoke_access(caller, patient_id).await {
            return Err(StoreError::Unavailable(format!(
                "could not revoke {caller} access to {patient_id}"
            ))
            .into());
        }
        self.reconciler.drop_mirror(caller, patient_id).await?;
        info!(account_id = %caller, patient_id = %patient_id, "Left patient");
        Ok(())
    }

    /// Owner-only: revoke another account's access
    pub async fn stop_sharing_with(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        other: &AccountId,
    ) -> Result<()> {
        let record = self.get_patient(caller, patient_id).await?;
        let owner = self
            .identity
            .resolve_owner(patient_id, record.created_by.as_ref())
            .await;
        if owner.account_id() != Some(caller) || other == caller {
            warn!(
                account_id = %caller,
                patient_id = %patient_id,
                "Only the owner may stop sharing with others"
            );
            return Err(SafeCareError::AccessDenied {
                account_id: caller.clone(),
                patient_id: patient_id.clone(),
            });
        }
        if !self.access.revoke_access(other, patient_id).await {
            return Err(StoreError::Unavailable(format!(
                "could not revoke {other} access to {patient_id}"
            ))
            .into());
        }
        self.reconciler.drop_mirror(other, patient_id).await?;
        info!(account_id = %caller, patient_id = %patient_id, revoked = %other, "Stopped sharing");
        Ok(())
    }

    // === Sync ===

    /// Real-time changes to the canonical record
    pub async fn watch_patient(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
    ) -> Result<Subscription> {
        self.access
            .with_access(caller, patient_id, || async {
                Ok(self.store.subscribe(&self.paths.canonical(patient_id))?)
            })
            .await
    }

    /// Run the repair pass for one patient
    pub async fn repair_patient(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
    ) -> Result<ReconcileReport> {
        self.access
            .with_access(caller, patient_id, || self.reconciler.reconcile(patient_id))
            .await
    }

    // === Private Implementation ===

    async fn add_entry<T: serde::Serialize>(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        collection: Collection,
        entry: &T,
    ) -> Result<EntryId> {
        self.access
            .with_access(caller, patient_id, || {
                self.reconciler.add_entry(patient_id, collection, entry)
            })
            .await
    }

    async fn edit_entry<T>(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        collection: Collection,
        entry_id: &EntryId,
        updates: FieldUpdates,
    ) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        self.access
            .with_access(caller, patient_id, || {
                self.reconciler.edit_entry(patient_id, collection, entry_id, updates)
            })
            .await
    }

    async fn remove_entry(
        &self,
        caller: &AccountId,
        patient_id: &PatientId,
        collection: Collection,
        entry_id: &EntryId,
    ) -> Result<()> {
        self.access
            .with_access(caller, patient_id, || {
                self.reconciler.remove_entry(patient_id, collection, entry_id)
            })
            .await
    }

    /// Patient holding a government ID: its claim first, then a scan of
    /// canonical records for those written before claims existed
    async fn find_by_government_id(&self, government_id: &str) -> Result<Option<PatientId>> {
        let wanted = normalize_government_id(government_id);
        if wanted.is_empty() {
            return Ok(None);
        }
        let claim = self.paths.government_id_claim(&wanted);
        if let Some(holder) = read_typed::<String>(self.store.as_ref(), &claim).await? {
            let holder = PatientId::from(holder);
            if self.store.exists(&self.paths.canonical(&holder)).await? {
                return Ok(Some(holder));
            }
        }
        let root = self.paths.canonical_root();
        for key in self.store.child_keys(root).await? {
            let path = join(&join(root, &key), "governmentId");
            if let Some(stored) = read_typed::<String>(self.store.as_ref(), &path).await? {
                if normalize_government_id(&stored) == wanted {
                    return Ok(Some(PatientId::from(key)));
                }
            }
        }
        Ok(None)
    }

    /// Claim a normalized government ID for `patient_id`. Fails with
    /// `DuplicatePatient` when another patient holds the claim.
    async fn claim_government_id(
        &self,
        normalized: &str,
        patient_id: &PatientId,
        government_id: &str,
    ) -> Result<()> {
        let path = self.paths.government_id_claim(normalized);
        let value = Value::String(patient_id.to_string());
        for _ in 0..CLAIM_ATTEMPTS {
            if self.store.set_if_absent(&path, value.clone()).await? {
                debug!(patient_id = %patient_id, "Government ID claimed");
                return Ok(());
            }
            match read_typed::<String>(self.store.as_ref(), &path).await? {
                Some(holder) if holder == patient_id.as_str() => return Ok(()),
                Some(holder) => {
                    return Err(SafeCareError::DuplicatePatient {
                        government_id: government_id.to_string(),
                        patient_id: PatientId::from(holder),
                    })
                }
                // Released between the two calls
                None => continue,
            }
        }
        Err(StoreError::Conflict(path).into())
    }

    /// Drop a claim held by `patient_id`; claims of other patients are left alone
    async fn release_government_id(&self, normalized: &str, patient_id: &PatientId) {
        let path = self.paths.government_id_claim(normalized);
        let held = match read_typed::<String>(self.store.as_ref(), &path).await {
            Ok(holder) => holder.as_deref() == Some(patient_id.as_str()),
            Err(e) => {
                warn!(patient_id = %patient_id, error = %e, "Government ID claim lookup failed");
                false
            }
        };
        if !held {
            return;
        }
        if let Err(e) = self.store.remove(&path).await {
            warn!(patient_id = %patient_id, error = %e, "Government ID claim not released");
        }
    }

    /// Claim a replacement government ID for an existing patient.
    ///
    /// Returns the previous normalized ID (when there was one) and the newly
    /// claimed one, or `None` when the ID does not change.
    async fn move_government_id(
        &self,
        patient_id: &PatientId,
        government_id: &str,
    ) -> Result<Option<(Option<String>, String)>> {
        let normalized = normalize_government_id(government_id);
        if normalized.is_empty() {
            return Err(SafeCareError::InvalidEntry("government ID is required".into()));
        }
        let current_path = join(&self.paths.canonical(patient_id), "governmentId");
        let previous = read_typed::<String>(self.store.as_ref(), &current_path)
            .await?
            .map(|stored| normalize_government_id(&stored))
            .filter(|stored| !stored.is_empty());
        if previous.as_deref() == Some(normalized.as_str()) {
            return Ok(None);
        }
        if let Some(existing) = self.find_by_government_id(government_id).await? {
            if existing != *patient_id {
                return Err(SafeCareError::DuplicatePatient {
                    government_id: government_id.to_string(),
                    patient_id: existing,
                });
            }
        }
        self.claim_government_id(&normalized, patient_id, government_id)
            .await?;
        Ok(Some((previous, normalized)))
    }
}
