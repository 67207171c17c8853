//! Partial-failure behavior of reconciled writes
//!
//! A fault-injecting store wraps `MemoryStore` and refuses writes under
//! chosen path prefixes, simulating an offline or rejecting backend. Faults
//! can be persistent, fire once, or hit child listings.

use async_trait::async_trait;
use safecare_access::error::StoreResult;
use safecare_access::store::DocumentStore;
use safecare_access::{
    AccountId, Config, FieldUpdates, MemoryStore, NewPatient, PatientId, PatientPatch,
    PatientService, SafeCareError, StoreError, Subscription, SyncFailure,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    failing: Mutex<Vec<String>>,
    failing_once: Mutex<Vec<String>>,
    failing_listings: Mutex<Vec<String>>,
}

impl FaultyStore {
    fn fail_writes_under(&self, prefix: &str) {
        self.failing.lock().unwrap().push(prefix.to_string());
    }

    /// The next write under `prefix` fails; later ones succeed
    fn fail_next_write_under(&self, prefix: &str) {
        self.failing_once.lock().unwrap().push(prefix.to_string());
    }

    fn fail_listings_of(&self, path: &str) {
        self.failing_listings.lock().unwrap().push(path.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.failing_once.lock().unwrap().clear();
        self.failing_listings.lock().unwrap().clear();
    }

    fn check(&self, path: &str) -> StoreResult<()> {
        let injected = || Err(StoreError::Unavailable(format!("injected fault at {path}")));
        if self.failing.lock().unwrap().iter().any(|p| path.starts_with(p.as_str())) {
            return injected();
        }
        let mut once = self.failing_once.lock().unwrap();
        if let Some(i) = once.iter().position(|p| path.starts_with(p.as_str())) {
            once.remove(i);
            return injected();
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        self.check(path)?;
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, patch: FieldUpdates) -> StoreResult<()> {
        self.check(path)?;
        self.inner.update(path, patch).await
    }

    async fn set_if_absent(&self, path: &str, value: Value) -> StoreResult<bool> {
        self.check(path)?;
        self.inner.set_if_absent(path, value).await
    }

    async fn push(&self, path: &str, value: Value) -> StoreResult<String> {
        self.check(path)?;
        self.inner.push(path, value).await
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.check(path)?;
        self.inner.remove(path).await
    }

    async fn child_keys(&self, path: &str) -> StoreResult<Vec<String>> {
        if self.failing_listings.lock().unwrap().iter().any(|p| p == path) {
            return Err(StoreError::Unavailable(format!("injected listing fault at {path}")));
        }
        self.inner.child_keys(path).await
    }

    fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        self.inner.subscribe(path)
    }
}

async fn setup(
    config: Config,
) -> (Arc<FaultyStore>, PatientService, AccountId, AccountId, PatientId) {
    let store = Arc::new(FaultyStore::default());
    let service = PatientService::new(store.clone(), config);
    let nurse = AccountId::from("nurse");
    let daughter = AccountId::from("daughter");
    let p = service
        .register_patient(&nurse, NewPatient::new("Maria", "42"))
        .await
        .unwrap();
    service.link_patient_by_government_id(&daughter, "42").await.unwrap();
    (store, service, nurse, daughter, p)
}

#[tokio::test]
async fn test_mirror_failure_reported_then_repaired() {
    let (store, service, nurse, daughter, p) = setup(Config::default()).await;
    store.fail_writes_under("accounts/daughter/");

    let err = service
        .update_patient(&nurse, &p, PatientPatch::name("New Name"))
        .await
        .unwrap_err();
    match err {
        SafeCareError::Sync(SyncFailure::Mirror { patient_id, failed }) => {
            assert_eq!(patient_id, p);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].account_id, daughter);
        }
        other => panic!("expected mirror failure, got {other:?}"),
    }

    // Canonical write landed; the daughter's mirror diverged
    assert_eq!(service.get_patient(&daughter, &p).await.unwrap().name, "New Name");
    let stale = store
        .get(&format!("accounts/daughter/patients/{p}/name"))
        .await
        .unwrap();
    assert_eq!(stale, Some(json!("Maria")));

    store.heal();
    let report = service.repair_patient(&daughter, &p).await.unwrap();
    assert_eq!(report.mirrors_written.len(), 2);
    let repaired = store
        .get(&format!("accounts/daughter/patients/{p}/name"))
        .await
        .unwrap();
    assert_eq!(repaired, Some(json!("New Name")));
}

#[tokio::test]
async fn test_canonical_failure_writes_nothing() {
    let (store, service, nurse, _daughter, p) = setup(Config::default()).await;
    store.fail_writes_under("patientsGlobal/");

    let err = service
        .update_patient(&nurse, &p, PatientPatch::name("New Name"))
        .await
        .unwrap_err();
    match &err {
        SafeCareError::Sync(failure) => {
            assert!(failure.is_retryable());
            assert!(matches!(failure, SyncFailure::Canonical { .. }));
        }
        other => panic!("expected canonical failure, got {other:?}"),
    }

    for account in ["nurse", "daughter"] {
        let name = store
            .get(&format!("accounts/{account}/patients/{p}/name"))
            .await
            .unwrap();
        assert_eq!(name, Some(json!("Maria")));
    }
}

#[tokio::test]
async fn test_repair_on_partial_failure_does_not_mask_persistent_faults() {
    let mut config = Config::default();
    config.sync.repair_on_partial_failure = true;
    let (store, service, nurse, _daughter, p) = setup(config).await;
    store.fail_writes_under("accounts/daughter/");

    let err = service
        .update_patient(&nurse, &p, PatientPatch::name("New Name"))
        .await
        .unwrap_err();
    assert!(matches!(err, SafeCareError::Sync(SyncFailure::Mirror { .. })));
}

#[tokio::test]
async fn test_repair_on_partial_failure_heals_transient_fault() {
    let mut config = Config::default();
    config.sync.repair_on_partial_failure = true;
    let (store, service, nurse, daughter, p) = setup(config).await;
    store.fail_next_write_under("accounts/daughter/");

    let report = service
        .update_patient(&nurse, &p, PatientPatch::name("New Name"))
        .await
        .unwrap();
    assert!(report.repaired);
    assert_eq!(report.mirrors_written, vec![daughter.clone(), nurse.clone()]);

    for account in ["nurse", "daughter"] {
        let name = store
            .get(&format!("accounts/{account}/patients/{p}/name"))
            .await
            .unwrap();
        assert_eq!(name, Some(json!("New Name")));
    }
}

#[tokio::test]
async fn test_holder_lookup_failure_after_canonical_write() {
    let (store, service, nurse, _daughter, p) = setup(Config::default()).await;
    store.fail_listings_of("accessIndex");

    let err = service
        .update_patient(&nurse, &p, PatientPatch::name("New Name"))
        .await
        .unwrap_err();
    match &err {
        SafeCareError::Sync(failure @ SyncFailure::HolderLookup { patient_id, .. }) => {
            assert_eq!(patient_id, &p);
            assert!(failure.needs_repair());
            assert!(!failure.is_retryable());
        }
        other => panic!("expected holder lookup failure, got {other:?}"),
    }

    // The canonical copy moved on; the mirrors wait for the repair pass
    let canonical = store.get(&format!("patientsGlobal/{p}/name")).await.unwrap();
    assert_eq!(canonical, Some(json!("New Name")));
    let mirror = store
        .get(&format!("accounts/daughter/patients/{p}/name"))
        .await
        .unwrap();
    assert_eq!(mirror, Some(json!("Maria")));

    store.heal();
    let report = service.repair_patient(&nurse, &p).await.unwrap();
    assert_eq!(report.mirrors_written.len(), 2);
}

#[tokio::test]
async fn test_failed_registration_leaves_no_access_entry() {
    let store = Arc::new(FaultyStore::default());
    let service = PatientService::new(store.clone(), Config::default());
    let nurse = AccountId::from("nurse");
    store.fail_writes_under("patientsGlobal/");

    let err = service
        .register_patient(&nurse, NewPatient::new("Maria", "42"))
        .await
        .unwrap_err();
    assert!(matches!(err, SafeCareError::Sync(SyncFailure::Canonical { .. })));
    assert!(service.access().list_accessible_patient_ids(&nurse).await.is_empty());

    // The government ID claim was released, so a retry can succeed
    assert_eq!(store.get("governmentIds/42").await.unwrap(), None);
    store.heal();
    service
        .register_patient(&nurse, NewPatient::new("Maria", "42"))
        .await
        .unwrap();
}
