//! SafeCare Home - Patient Access Layer
//!
//! Access control and canonical/mirror data reconciliation for shared
//! patient records in a home-care app.
//!
//! # Architecture
//!
//! Several caregiver accounts can share one patient. Each patient record has:
//! - **Canonical copy** at `patientsGlobal/{patient}` (authoritative)
//! - **Mirror copies** at `accounts/{account}/patients/{patient}`, one per holder
//! - **Access entries** at `accessIndex/{account}/{patient}`: the only
//!   authorization source
//!
//! Reads come from the canonical copy and pass the access guard first. Writes
//! go to the canonical copy and then fan out to every holder's mirror.
//!
//! # Example
//!
//! ```rust,ignore
//! use safecare_access::{Config, MemoryStore, MetricEntry, MetricKind, NewPatient, PatientService};
//!
//! let service = PatientService::new(Arc::new(MemoryStore::new()), Config::default());
//!
//! // The registering account becomes the owner
//! let patient = service
//!     .register_patient(&nurse, NewPatient::new("Maria", "123.456"))
//!     .await?;
//!
//! // Another caregiver links the same patient by government ID
//! service.link_patient_by_government_id(&family, "123456").await?;
//!
//! // Writes reach both mirrors
//! let reading = MetricEntry::reading(95.0, today);
//! service
//!     .add_metric(&family, &patient, MetricKind::Glucose, reading)
//!     .await?;
//! ```

// Access index and guard
pub mod access;

// Configuration
pub mod config;

// Error types
pub mod error;

// Account profiles and owner detection
pub mod identity;

// Migrations for legacy records
pub mod migrate;

// Domain types
pub mod model;

// Canonical/mirror reconciliation
pub mod reconcile;

// Guarded facade
pub mod service;

// Sharing inspection
pub mod sharing;

// Document store seam
pub mod store;

pub use access::AccessIndex;
pub use config::Config;
pub use error::{MirrorFault, Result, SafeCareError, StoreError, SyncFailure};
pub use identity::{AccountDirectory, IdentityResolver, OwnerResolution};
pub use migrate::Migrator;
pub use model::{
    Account, AccountId, Appointment, CreatorRef, EntryId, Frequency, Medication, MetricEntry,
    MetricId, MetricKind, NewPatient, Observation, PatientId, PatientPatch, PatientRecord,
};
pub use reconcile::{Collection, PatientReconciler, ReconcileReport};
pub use service::PatientService;
pub use sharing::{SharingInfo, SharingInspector, SharingStatus};
pub use store::{DocumentStore, FieldUpdates, MemoryStore, StorePaths, Subscription};
