//! Data migrations for records written by older clients
//!
//! All passes are idempotent and safe to re-run. Each one routes its writes
//! through [`PatientReconciler`] so mirrors follow the canonical copy.

use crate::access::AccessIndex;
use crate::error::{Result, SafeCareError};
use crate::identity::IdentityResolver;
use crate::model::{AccountId, CreatorRef, LegacyCreator, PatientId};
use crate::reconcile::{Collection, PatientReconciler, ReconcileReport};
use crate::store::{join, read_typed, DocumentStore, FieldUpdates, StorePaths};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KEYED_COLLECTIONS: [Collection; 3] = [
    Collection::Medications,
    Collection::Appointments,
    Collection::Observations,
];

/// Result of [`Migrator::migrate_creator_refs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatorMigrationReport {
    pub scanned: usize,
    /// Raw strings rewritten into the tagged form
    pub rewritten: Vec<PatientId>,
    /// Legacy records whose owner guess was pinned
    pub pinned: Vec<(PatientId, AccountId)>,
    /// Legacy records nobody holds access to
    pub unresolved: Vec<PatientId>,
}

/// Result of [`Migrator::migrate_positional_collections`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyingReport {
    pub scanned: usize,
    pub converted: Vec<(PatientId, Collection, usize)>,
}

impl KeyingReport {
    pub fn entries_converted(&self) -> usize {
        self.converted.iter().map(|(_, _, n)| n).sum()
    }
}

/// Result of [`Migrator::reconcile_all`]
#[derive(Debug, Default)]
pub struct BulkReconcileReport {
    pub reconciled: Vec<(PatientId, ReconcileReport)>,
    pub failed: Vec<(PatientId, SafeCareError)>,
}

#[derive(Clone)]
pub struct Migrator {
    store: Arc<dyn DocumentStore>,
    paths: StorePaths,
    access: AccessIndex,
    identity: IdentityResolver,
    reconciler: PatientReconciler,
}

impl Migrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        access: AccessIndex,
        identity: IdentityResolver,
        reconciler: PatientReconciler,
    ) -> Self {
        let paths = access.paths().clone();
        Self {
            store,
            paths,
            access,
            identity,
            reconciler,
        }
    }

    /// Every patient with a canonical record
    pub async fn patient_ids(&self) -> Result<Vec<PatientId>> {
        Ok(self
            .store
            .child_keys(self.paths.canonical_root())
            .await?
            .into_iter()
            .map(PatientId::from)
            .collect())
    }

    /// Rewrite untagged `createdBy` strings into the tagged form, pinning the
    /// current owner guess on legacy records so it no longer drifts as holders
    /// come and go.
    pub async fn migrate_creator_refs(&self) -> Result<CreatorMigrationReport> {
        let mut report = CreatorMigrationReport::default();
        for patient_id in self.patient_ids().await? {
            report.scanned += 1;
            let path = join(&self.paths.canonical(&patient_id), "createdBy");
            let (creator, was_raw) = match self.store.get(&path).await? {
                None => continue,
                Some(Value::String(raw)) => (self.identity.creator_from_raw(&raw), true),
                Some(tagged) => match serde_json::from_value::<CreatorRef>(tagged) {
                    Ok(creator) => (creator, false),
                    Err(e) => {
                        warn!(
                            patient_id = %patient_id,
                            error = %e,
                            "Unreadable createdBy, skipping"
                        );
                        continue;
                    }
                },
            };

            let creator = match creator {
                CreatorRef::Legacy(LegacyCreator {
                    email,
                    pinned_owner: None,
                }) => {
                    let guess = self
                        .identity
                        .detect_legacy_owner_guess(&patient_id, Some(&email))
                        .await;
                    match &guess {
                        Some(owner) => report.pinned.push((patient_id.clone(), owner.clone())),
                        None => report.unresolved.push(patient_id.clone()),
                    }
                    if guess.is_none() && !was_raw {
                        continue;
                    }
                    CreatorRef::Legacy(LegacyCreator {
                        email,
                        pinned_owner: guess,
                    })
                }
                _ if !was_raw => {
                    debug!(patient_id = %patient_id, "createdBy already migrated");
                    continue;
                }
                other => other,
            };

            let mut updates = FieldUpdates::new();
            updates.insert("createdBy".into(), serde_json::to_value(&creator)?);
            self.reconciler.update_everywhere(&patient_id, updates).await?;
            if was_raw {
                report.rewritten.push(patient_id);
            }
        }
        info!(
            scanned = report.scanned,
            rewritten = report.rewritten.len(),
            pinned = report.pinned.len(),
            unresolved = report.unresolved.len(),
            "Creator references migrated"
        );
        Ok(report)
    }

    /// Convert positional medication, appointment and observation arrays into
    /// id-keyed maps
    pub async fn migrate_positional_collections(&self) -> Result<KeyingReport> {
        let mut report = KeyingReport::default();
        for patient_id in self.patient_ids().await? {
            report.scanned += 1;
            for collection in KEYED_COLLECTIONS {
                let converted = self.reconciler.ensure_keyed(&patient_id, collection).await?;
                if converted > 0 {
                    report.converted.push((patient_id.clone(), collection, converted));
                }
            }
        }
        info!(
            scanned = report.scanned,
            entries = report.entries_converted(),
            "Positional collections keyed"
        );
        Ok(report)
    }

    /// Access entries pointing at a patient with no canonical record
    pub async fn find_orphaned_access_entries(&self) -> Result<Vec<(AccountId, PatientId)>> {
        let mut orphans = Vec::new();
        for (account_id, patient_id) in self.access.all_entries().await? {
            if !self.store.exists(&self.paths.canonical(&patient_id)).await? {
                orphans.push((account_id, patient_id));
            }
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Orphaned access entries found");
        }
        Ok(orphans)
    }

    /// Revoke every orphaned access entry; returns how many were removed
    pub async fn prune_orphaned_access_entries(&self) -> Result<usize> {
        let mut pruned = 0;
        for (account_id, patient_id) in self.find_orphaned_access_entries().await? {
            if self.access.revoke_access(&account_id, &patient_id).await {
                self.reconciler.drop_mirror(&account_id, &patient_id).await?;
                pruned += 1;
            }
        }
        info!(pruned, "Orphaned access entries pruned");
        Ok(pruned)
    }

    /// Government ID claims naming a patient with no canonical record, as
    /// left behind by a registration that stopped halfway
    pub async fn find_orphaned_government_id_claims(&self) -> Result<Vec<(String, PatientId)>> {
        let root = self.paths.government_id_root();
        let mut orphans = Vec::new();
        for key in self.store.child_keys(root).await? {
            let path = join(root, &key);
            let Some(holder) = read_typed::<String>(self.store.as_ref(), &path).await? else {
                continue;
            };
            let holder = PatientId::from(holder);
            if !self.store.exists(&self.paths.canonical(&holder)).await? {
                orphans.push((key, holder));
            }
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Orphaned government ID claims found");
        }
        Ok(orphans)
    }

    /// Remove every orphaned government ID claim; returns how many were removed.
    ///
    /// Meant for offline maintenance: a registration in flight also looks
    /// orphaned until its canonical write lands.
    pub async fn prune_orphaned_government_id_claims(&self) -> Result<usize> {
        let orphans = self.find_orphaned_government_id_claims().await?;
        for (key, _) in &orphans {
            self.store
                .remove(&self.paths.government_id_claim(key))
                .await?;
        }
        info!(pruned = orphans.len(), "Orphaned government ID claims pruned");
        Ok(orphans.len())
    }

    /// Run the repair pass over every patient, collecting per-patient failures
    pub async fn reconcile_all(&self) -> Result<BulkReconcileReport> {
        let mut report = BulkReconcileReport::default();
        for patient_id in self.patient_ids().await? {
            match self.reconciler.reconcile(&patient_id).await {
                Ok(done) => report.reconciled.push((patient_id, done)),
                Err(e) => {
                    warn!(patient_id = %patient_id, error = %e, "Reconcile failed");
                    report.failed.push((patient_id, e));
                }
            }
        }
        Ok(report)
    }
}
