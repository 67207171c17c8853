//! Patient records

use super::{
    AccountId, Appointment, CreatorRef, EntryId, Medication, MetricEntry, MetricKind, Observation,
};
use crate::store::FieldUpdates;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id-keyed entry collection
pub type Entries<T> = BTreeMap<EntryId, T>;

/// Collections written as positional arrays by older clients
pub const POSITIONAL_COLLECTIONS: [&str; 3] = ["medications", "appointments", "observations"];

/// The subject-of-care entity: demographics plus health history.
///
/// Stored canonically at `patientsGlobal/{id}` and mirrored at
/// `accounts/{account}/patients/{id}` for every account with access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    pub name: String,
    #[serde(default)]
    pub government_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,

    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub weight: Entries<MetricEntry>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub glucose: Entries<MetricEntry>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub temperature: Entries<MetricEntry>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub pressure: Entries<MetricEntry>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub oxygen: Entries<MetricEntry>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub heart_rate: Entries<MetricEntry>,

    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub medications: Entries<Medication>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub appointments: Entries<Appointment>,
    #[serde(default, with = "keyed", skip_serializing_if = "BTreeMap::is_empty")]
    pub observations: Entries<Observation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<CreatorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_by: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl PatientRecord {
    pub fn new(patient: NewPatient, creator: CreatorRef) -> Self {
        Self {
            name: patient.name,
            government_id: patient.government_id,
            birth_date: patient.birth_date,
            gender: patient.gender,
            phone: patient.phone,
            address: patient.address,
            conditions: patient.conditions,
            weight: BTreeMap::new(),
            glucose: BTreeMap::new(),
            temperature: BTreeMap::new(),
            pressure: BTreeMap::new(),
            oxygen: BTreeMap::new(),
            heart_rate: BTreeMap::new(),
            medications: BTreeMap::new(),
            appointments: BTreeMap::new(),
            observations: BTreeMap::new(),
            created_by: Some(creator),
            created_at: Some(Utc::now()),
            edited_by: None,
            edited_at: None,
        }
    }

    pub fn metrics(&self, kind: MetricKind) -> &Entries<MetricEntry> {
        match kind {
            MetricKind::Weight => &self.weight,
            MetricKind::Glucose => &self.glucose,
            MetricKind::Temperature => &self.temperature,
            MetricKind::Pressure => &self.pressure,
            MetricKind::Oxygen => &self.oxygen,
            MetricKind::HeartRate => &self.heart_rate,
        }
    }

    /// Entries of one collection, oldest first
    pub fn metrics_sorted(&self, kind: MetricKind) -> Vec<(&EntryId, &MetricEntry)> {
        let mut entries: Vec<_> = self.metrics(kind).iter().collect();
        entries.sort_by(|(a_id, a), (b_id, b)| {
            a.sort_key().cmp(&b.sort_key()).then(a_id.cmp(b_id))
        });
        entries
    }

    /// Latest entry of one collection
    pub fn latest_metric(&self, kind: MetricKind) -> Option<(&EntryId, &MetricEntry)> {
        self.metrics_sorted(kind).pop()
    }

    pub fn matches_government_id(&self, government_id: &str) -> bool {
        let wanted = normalize_government_id(government_id);
        !wanted.is_empty() && normalize_government_id(&self.government_id) == wanted
    }
}

/// Government IDs are compared on their alphanumeric characters only
pub fn normalize_government_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>().to_uppercase()
}

/// Fields supplied when registering a patient
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    pub name: String,
    pub government_id: String,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl NewPatient {
    pub fn new(name: impl Into<String>, government_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            government_id: government_id.into(),
            ..Default::default()
        }
    }
}

/// Partial demographic update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub government_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

impl PatientPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn into_updates(self) -> serde_json::Result<FieldUpdates> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(FieldUpdates::new()),
        }
    }
}

/// Reads id-keyed collections, also accepting positional arrays from older
/// clients. Array entries are keyed by their former index; null holes are skipped.
pub(crate) mod keyed {
    use super::Entries;
    use crate::model::EntryId;
    use serde::de::{DeserializeOwned, Error as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer, T: Serialize>(
        entries: &Entries<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Entries<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let mut entries = Entries::new();
        match Value::deserialize(deserializer)? {
            Value::Null => {}
            Value::Array(items) => {
                for (index, item) in items.into_iter().enumerate() {
                    if item.is_null() {
                        continue;
                    }
                    let entry = serde_json::from_value(item).map_err(D::Error::custom)?;
                    entries.insert(EntryId::from(index.to_string()), entry);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let entry = serde_json::from_value(item).map_err(D::Error::custom)?;
                    entries.insert(EntryId::from(key), entry);
                }
            }
            other => {
                return Err(D::Error::custom(format!(
                    "expected entry collection, got {other}"
                )))
            }
        }
        Ok(entries)
    }
}
