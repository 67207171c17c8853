//! End-to-end access and reconciliation flows through the patient service
//!
//! Several caregiver accounts share patients over one in-memory store.

use chrono::NaiveDate;
use safecare_access::store::DocumentStore;
use safecare_access::{
    AccountId, Config, FieldUpdates, Frequency, Medication, MemoryStore, MetricEntry, MetricKind,
    NewPatient, PatientId, PatientPatch, PatientService, SafeCareError,
};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    store: Arc<MemoryStore>,
    service: PatientService,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let service = PatientService::new(store.clone(), Config::default());
        Self { store, service }
    }

    /// Register a patient as `owner` and link it for every account in `others`
    async fn shared_patient(&self, owner: &AccountId, others: &[&AccountId]) -> PatientId {
        let patient_id = self
            .service
            .register_patient(owner, NewPatient::new("Maria Souza", "123.456.789-00"))
            .await
            .unwrap();
        for other in others {
            self.service
                .link_patient_by_government_id(other, "12345678900")
                .await
                .unwrap();
        }
        patient_id
    }

    async fn mirror_field(
        &self,
        account: &AccountId,
        patient: &PatientId,
        field: &str,
    ) -> Option<serde_json::Value> {
        self.store
            .get(&format!("accounts/{account}/patients/{patient}/{field}"))
            .await
            .unwrap()
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
}

#[tokio::test]
async fn test_grant_revoke_idempotent_in_any_order() {
    let h = Harness::new();
    let access = h.service.access();
    let a = AccountId::from("caregiver");
    let p = PatientId::from("p1");

    for _ in 0..3 {
        assert!(access.grant_access(&a, &p).await);
    }
    assert!(access.has_access(&a, &p).await);

    for _ in 0..3 {
        assert!(access.revoke_access(&a, &p).await);
    }
    assert!(!access.has_access(&a, &p).await);

    access.revoke_access(&a, &p).await;
    access.grant_access(&a, &p).await;
    assert!(access.has_access(&a, &p).await);
}

#[tokio::test]
async fn test_update_reaches_every_holder_mirror() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let doctor = AccountId::from("doctor");
    let p = h.shared_patient(&nurse, &[&daughter, &doctor]).await;

    h.service
        .update_patient(&daughter, &p, PatientPatch::name("New Name"))
        .await
        .unwrap();

    assert_eq!(h.service.get_patient(&doctor, &p).await.unwrap().name, "New Name");
    for account in [&nurse, &daughter, &doctor] {
        assert_eq!(h.mirror_field(account, &p, "name").await, Some(json!("New Name")));
        assert_eq!(h.mirror_field(account, &p, "editedBy").await, Some(json!("daughter")));
    }
}

#[tokio::test]
async fn test_metric_round_trip_keeps_date() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let p = h.shared_patient(&nurse, &[]).await;

    let id = h
        .service
        .add_metric(&nurse, &p, MetricKind::Glucose, MetricEntry::reading(95.0, day(20)))
        .await
        .unwrap();
    let mut updates = FieldUpdates::new();
    updates.insert("value".into(), json!(100));
    h.service
        .edit_metric(&nurse, &p, MetricKind::Glucose, &id, updates)
        .await
        .unwrap();

    let metrics = h.service.list_metrics(&nurse, &p, MetricKind::Glucose).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].0, id);
    assert_eq!(metrics[0].1.value, Some(100.0));
    assert_eq!(metrics[0].1.date, day(20));
}

#[tokio::test]
async fn test_concurrent_medication_deletes_hit_their_own_entries() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let p = h.shared_patient(&nurse, &[&daughter]).await;

    let mut ids = Vec::new();
    for (name, dosage) in [("Metformin", "850mg"), ("Losartan", "50mg"), ("Aspirin", "100mg")] {
        let med = Medication::new(name, dosage, Frequency::OnceDaily);
        ids.push(h.service.add_medication(&nurse, &p, med).await.unwrap());
    }

    // Both callers read the same list, then delete different entries concurrently
    let before = h.service.get_patient(&nurse, &p).await.unwrap();
    assert_eq!(before.medications.len(), 3);

    let (a, b) = tokio::join!(
        h.service.remove_medication(&nurse, &p, &ids[1]),
        h.service.remove_medication(&daughter, &p, &ids[2]),
    );
    a.unwrap();
    b.unwrap();

    let after = h.service.get_patient(&daughter, &p).await.unwrap();
    let names: Vec<_> = after.medications.values().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Metformin"]);

    // A repeated delete of an already-removed entry is reported, not misapplied
    let err = h.service.remove_medication(&daughter, &p, &ids[1]).await.unwrap_err();
    assert!(matches!(err, SafeCareError::NotFound(_)));
    assert_eq!(h.service.get_patient(&nurse, &p).await.unwrap().medications.len(), 1);
}

#[tokio::test]
async fn test_sharing_details_only_for_owner() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let p = h.shared_patient(&nurse, &[]).await;

    let alone = h.service.sharing_info(&nurse, &p).await.unwrap();
    assert_eq!(alone.being_shared, Some(false));
    assert_eq!(alone.shared_with_count, Some(0));

    h.service.link_patient_by_government_id(&daughter, "123.456.789-00").await.unwrap();

    let owner_view = h.service.sharing_info(&nurse, &p).await.unwrap();
    assert_eq!(owner_view.being_shared, Some(true));
    assert_eq!(owner_view.shared_with_count, Some(1));

    let other_view = h.service.sharing_info(&daughter, &p).await.unwrap();
    assert!(other_view.shared);
    assert_eq!(other_view.shared_with_count, None);
    assert_eq!(other_view.shared_with_users, None);
}

#[tokio::test]
async fn test_watch_sees_writes_from_other_holders() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let p = h.shared_patient(&nurse, &[&daughter]).await;

    let mut subscription = h.service.watch_patient(&nurse, &p).await.unwrap();
    h.service.add_observation(&daughter, &p, "Ate well today").await.unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert!(event.path.starts_with(&format!("patientsGlobal/{p}")));
}

#[tokio::test]
async fn test_revoked_account_loses_reads_and_mirror() {
    let h = Harness::new();
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let p = h.shared_patient(&nurse, &[&daughter]).await;

    h.service.stop_sharing_with(&nurse, &p, &daughter).await.unwrap();

    assert!(h.service.get_patient(&daughter, &p).await.unwrap_err().is_access_denied());
    assert_eq!(h.mirror_field(&daughter, &p, "name").await, None);

    // Later writes do not recreate the mirror
    h.service.update_patient(&nurse, &p, PatientPatch::name("Maria S.")).await.unwrap();
    assert_eq!(h.mirror_field(&daughter, &p, "name").await, None);
}
