//! Medications, appointments and observations

use super::time::opt_hhmm;
use super::AccountId;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Dosing frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    OnceDaily,
    TwiceDaily,
    ThreeTimesDaily,
    FourTimesDaily,
    EveryOtherDay,
    Weekly,
    AsNeeded,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnceDaily => "once_daily",
            Self::TwiceDaily => "twice_daily",
            Self::ThreeTimesDaily => "three_times_daily",
            Self::FourTimesDaily => "four_times_daily",
            Self::EveryOtherDay => "every_other_day",
            Self::Weekly => "weekly",
            Self::AsNeeded => "as_needed",
        }
    }

    /// Doses per day, `None` for as-needed
    pub fn doses_per_day(&self) -> Option<f32> {
        match self {
            Self::OnceDaily => Some(1.0),
            Self::TwiceDaily => Some(2.0),
            Self::ThreeTimesDaily => Some(3.0),
            Self::FourTimesDaily => Some(4.0),
            Self::EveryOtherDay => Some(0.5),
            Self::Weekly => Some(1.0 / 7.0),
            Self::AsNeeded => None,
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    pub name: String,
    pub dosage: String,
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hhmm")]
    pub time: Option<NaiveTime>,
}

impl Medication {
    pub fn new(name: impl Into<String>, dosage: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            name: name.into(),
            dosage: dosage.into(),
            frequency,
            time: None,
        }
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.time = Some(time);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub title: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hhmm")]
    pub time: Option<NaiveTime>,
}

impl Appointment {
    pub fn new(title: impl Into<String>, date: NaiveDate, time: Option<NaiveTime>) -> Self {
        Self {
            title: title.into(),
            date,
            time,
        }
    }

    pub fn is_upcoming(&self, today: NaiveDate) -> bool {
        self.date >= today
    }
}

/// Free-text note attached to a patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<AccountId>,
}

impl Observation {
    pub fn new(text: impl Into<String>, author: AccountId) -> Self {
        Self {
            text: text.into(),
            created_at: Utc::now(),
            author: Some(author),
        }
    }
}
