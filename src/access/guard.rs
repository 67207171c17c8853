//! Patient access guard
//!
//! The single chokepoint for patient-scoped work: the operation only runs
//! after the access index confirms an entry for the caller.

use super::AccessIndex;
use crate::error::{Result, SafeCareError};
use crate::model::{AccountId, PatientId};
use std::future::Future;
use tracing::warn;

impl AccessIndex {
    /// Fail with `AccessDenied` unless the caller holds an entry for the patient
    pub async fn require_access(
        &self,
        account_id: &AccountId,
        patient_id: &PatientId,
    ) -> Result<()> {
        if self.has_access(account_id, patient_id).await {
            Ok(())
        } else {
            warn!(account_id = %account_id, patient_id = %patient_id, "Access denied");
            Err(SafeCareError::AccessDenied {
                account_id: account_id.clone(),
                patient_id: patient_id.clone(),
            })
        }
    }

    /// Run `operation` only if the caller may access the patient.
    ///
    /// The operation is never invoked on denial.
    pub async fn with_access<T, F, Fut>(
        &self,
        account_id: &AccountId,
        patient_id: &PatientId,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.require_access(account_id, patient_id).await?;
        operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StorePaths};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_denied_operation_never_runs() {
        let index = AccessIndex::new(Arc::new(MemoryStore::new()), StorePaths::default());
        let calls = AtomicUsize::new(0);
        let a = AccountId::from("intruder");
        let p = PatientId::from("p1");

        let result = index
            .with_access(&a, &p, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SafeCareError::AccessDenied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_granted_operation_runs_once() {
        let index = AccessIndex::new(Arc::new(MemoryStore::new()), StorePaths::default());
        let a = AccountId::from("nurse");
        let p = PatientId::from("p1");
        index.grant_access(&a, &p).await;

        let calls = AtomicUsize::new(0);
        let value = index
            .with_access(&a, &p, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
