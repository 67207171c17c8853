//! Vital-sign metrics

use super::time::opt_hhmm;
use super::AccountId;
use crate::error::{Result, SafeCareError};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// The six time-ordered metric collections of a patient record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    /// Weight, height and derived body-mass index
    Weight,
    Glucose,
    Temperature,
    /// Systolic / diastolic blood pressure
    Pressure,
    /// Oxygen saturation
    Oxygen,
    HeartRate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Weight,
        MetricKind::Glucose,
        MetricKind::Temperature,
        MetricKind::Pressure,
        MetricKind::Oxygen,
        MetricKind::HeartRate,
    ];

    /// Collection key under the patient record
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Weight => "weight",
            Self::Glucose => "glucose",
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Oxygen => "oxygen",
            Self::HeartRate => "heartRate",
        }
    }

    pub fn from_collection(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.collection() == s)
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.collection())
    }
}

/// One measurement in a metric collection.
///
/// Single-valued kinds use `value`. Weight uses `weight`/`height`/`bmi`,
/// pressure uses `systolic`/`diastolic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Kilograms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Centimetres, or metres when below 3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic: Option<f64>,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hhmm")]
    pub time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<AccountId>,
}

impl MetricEntry {
    fn empty(date: NaiveDate) -> Self {
        Self {
            value: None,
            weight: None,
            height: None,
            bmi: None,
            systolic: None,
            diastolic: None,
            date,
            time: None,
            author: None,
        }
    }

    /// Single-valued reading (glucose, temperature, oxygen, heart rate)
    pub fn reading(value: f64, date: NaiveDate) -> Self {
        Self {
            value: Some(value),
            ..Self::empty(date)
        }
    }

    pub fn weight(weight_kg: f64, height: Option<f64>, date: NaiveDate) -> Self {
        Self {
            weight: Some(weight_kg),
            height,
            ..Self::empty(date)
        }
        .with_derived_bmi()
    }

    pub fn pressure(systolic: f64, diastolic: f64, date: NaiveDate) -> Self {
        Self {
            systolic: Some(systolic),
            diastolic: Some(diastolic),
            ..Self::empty(date)
        }
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn by(mut self, author: AccountId) -> Self {
        self.author = Some(author);
        self
    }

    /// Recompute `bmi` from `weight` and `height`. A weight without a
    /// height carries no index.
    pub fn with_derived_bmi(mut self) -> Self {
        self.bmi = match (self.weight, self.height) {
            (Some(w), Some(h)) => body_mass_index(w, h),
            (Some(_), None) => None,
            (None, _) => self.bmi,
        };
        self
    }

    /// Check the entry carries the fields its collection requires
    pub fn validate_for(&self, kind: MetricKind) -> Result<()> {
        let ok = match kind {
            MetricKind::Weight => self.weight.is_some(),
            MetricKind::Pressure => self.systolic.is_some() && self.diastolic.is_some(),
            _ => self.value.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(SafeCareError::InvalidEntry(format!(
                "{kind} entry dated {} is missing its reading",
                self.date
            )))
        }
    }

    /// Chronological ordering key
    pub fn sort_key(&self) -> (NaiveDate, Option<NaiveTime>) {
        (self.date, self.time)
    }
}

/// BMI rounded to one decimal; height accepted in metres or centimetres
pub fn body_mass_index(weight_kg: f64, height: f64) -> Option<f64> {
    let metres = if height < 3.0 { height } else { height / 100.0 };
    if metres <= 0.0 || weight_kg <= 0.0 {
        return None;
    }
    Some((weight_kg / (metres * metres) * 10.0).round() / 10.0)
}
