//! Domain types: accounts, patient records and their entry collections

mod account;
mod care;
mod creator;
mod ids;
mod metrics;
mod patient;
pub mod time;

pub use account::{Account, AccountPatch};
pub use care::{Appointment, Frequency, Medication, Observation};
pub use creator::{
    is_stable_identifier, is_stable_identifier_with, CreatorRef, LegacyCreator, STABLE_ID_MIN_LEN,
};
pub use ids::{AccountId, EntryId, MetricId, PatientId};
pub use metrics::{body_mass_index, MetricEntry, MetricKind};
pub use patient::{
    normalize_government_id, Entries, NewPatient, PatientPatch, PatientRecord,
    POSITIONAL_COLLECTIONS,
};

pub(crate) use ids::is_valid_segment;
