//! Identifier newtypes
//!
//! Identifiers are opaque strings. They double as store path segments, so an
//! empty id or one containing `/` is never valid and every lookup with such an
//! id fails closed.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Usable as a single store path segment
            pub fn is_valid(&self) -> bool {
                is_valid_segment(&self.0)
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable account identifier issued by the authentication provider
    AccountId
);

string_id!(
    /// Patient record identifier
    PatientId
);

string_id!(
    /// Key of a single metric, medication, appointment or observation entry
    EntryId
);

impl PatientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl EntryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Metric entries share the entry key space
pub type MetricId = EntryId;

pub(crate) fn is_valid_segment(s: &str) -> bool {
    !s.trim().is_empty() && !s.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_validity() {
        assert!(AccountId::from("k3x9f7q2m1p8z5y6w0v4a").is_valid());
        assert!(!AccountId::from("").is_valid());
        assert!(!AccountId::from("   ").is_valid());
        assert!(!PatientId::from("a/b").is_valid());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = EntryId::generate();
        let b = EntryId::generate();
        assert_ne!(a, b);
        assert!(a.is_valid());
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_transparent_serde() {
        let id = PatientId::from("p-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p-1\"");
        let back: PatientId = serde_json::from_str("\"p-1\"").unwrap();
        assert_eq!(back, id);
    }
}
