//! Error types for the SafeCare access layer

use crate::model::{AccountId, PatientId};
use thiserror::Error;

/// Result type for access-layer operations
pub type Result<T> = std::result::Result<T, SafeCareError>;

/// Result type for raw document store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`DocumentStore`](crate::store::DocumentStore) backend.
///
/// These are passed through unchanged; the access layer never reinterprets them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the operation at the infrastructure level
    #[error("Permission denied by store: {0}")]
    PermissionDenied(String),

    /// Malformed key path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A write collided with a non-object node on the same path
    #[error("Conflicting write at {0}")]
    Conflict(String),

    /// Stored value could not be encoded or decoded
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A single mirror copy that did not accept a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFault {
    pub account_id: AccountId,
    pub error: StoreError,
}

/// Failure of a reconciled (canonical + mirrors) write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The canonical write itself failed. Nothing was propagated; safe to retry.
    #[error("Canonical write for patient {patient_id} failed: {source}")]
    Canonical {
        patient_id: PatientId,
        #[source]
        source: StoreError,
    },

    /// The canonical write landed but some mirrors did not.
    #[error(
        "Canonical write for patient {patient_id} succeeded but {} mirror write(s) failed",
        .failed.len()
    )]
    Mirror {
        patient_id: PatientId,
        failed: Vec<MirrorFault>,
    },

    /// The canonical write landed but access holders could not be listed.
    #[error(
        "Canonical write for patient {patient_id} succeeded but access holders \
         could not be listed: {source}"
    )]
    HolderLookup {
        patient_id: PatientId,
        #[source]
        source: StoreError,
    },
}

impl SyncFailure {
    /// Patient whose copies are affected
    pub fn patient_id(&self) -> &PatientId {
        match self {
            SyncFailure::Canonical { patient_id, .. }
            | SyncFailure::Mirror { patient_id, .. }
            | SyncFailure::HolderLookup { patient_id, .. } => patient_id,
        }
    }

    /// Whether the whole write can simply be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncFailure::Canonical { .. })
    }

    /// Whether copies may now diverge and a `reconcile` pass is required
    pub fn needs_repair(&self) -> bool {
        !self.is_retryable()
    }
}

/// Access-layer error types
#[derive(Error, Debug)]
pub enum SafeCareError {
    /// Caller holds no access entry for the patient
    #[error("Access denied: account {account_id} has no access to patient {patient_id}")]
    AccessDenied {
        account_id: AccountId,
        patient_id: PatientId,
    },

    /// Record or entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A patient with the same government ID is already registered
    #[error("Patient with government ID {government_id} already registered as {patient_id}")]
    DuplicatePatient {
        government_id: String,
        patient_id: PatientId,
    },

    /// Entry is missing the fields its collection requires
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Reconciled write failed
    #[error("Sync failure: {0}")]
    Sync(#[from] SyncFailure),

    /// Store error passed through
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SafeCareError {
    /// True for authorization denials, which callers must surface as such
    pub fn is_access_denied(&self) -> bool {
        matches!(self, SafeCareError::AccessDenied { .. })
    }
}
