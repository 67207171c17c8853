//! Patient access control
//!
//! [`AccessIndex`] is the sole authorization source of truth. Its
//! `with_access` guard wraps every patient-scoped operation in
//! [`PatientService`](crate::service::PatientService).

mod guard;
mod index;

pub use index::AccessIndex;
