//! Record creator references
//!
//! Old records stored the creator's email in `createdBy`; newer ones store the
//! account id. [`CreatorRef`] makes the distinction explicit and is written in
//! tagged form. A bare string is only ever seen on records that predate the
//! tagged form, and is classified once on decode by [`is_stable_identifier`].

use super::AccountId;
use serde::{Deserialize, Serialize};

/// Identifiers strictly longer than this are treated as machine-issued
pub const STABLE_ID_MIN_LEN: usize = 20;

/// Shape heuristic separating machine-issued account ids from emails and names.
///
/// True iff the identifier is longer than [`STABLE_ID_MIN_LEN`] characters and
/// contains neither `@` nor a space.
pub fn is_stable_identifier(identifier: &str) -> bool {
    is_stable_identifier_with(identifier, STABLE_ID_MIN_LEN)
}

pub fn is_stable_identifier_with(identifier: &str, min_len: usize) -> bool {
    identifier.chars().count() > min_len && !identifier.contains('@') && !identifier.contains(' ')
}

/// Legacy creator: a free-text email, optionally with an owner pinned by migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCreator {
    pub email: String,
    /// Owner chosen once by `Migrator::migrate_creator_refs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_owner: Option<AccountId>,
}

/// Who created a patient record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "CreatorWire")]
pub enum CreatorRef {
    /// Stable account identifier (current format)
    Account(AccountId),
    /// Free-text email (old format)
    Legacy(LegacyCreator),
}

impl CreatorRef {
    /// Classify a raw `createdBy` string from an untagged record
    pub fn from_raw(raw: &str) -> Self {
        Self::from_raw_with(raw, STABLE_ID_MIN_LEN)
    }

    /// [`CreatorRef::from_raw`] with a configured minimum identifier length
    pub fn from_raw_with(raw: &str, min_len: usize) -> Self {
        if is_stable_identifier_with(raw, min_len) {
            CreatorRef::Account(AccountId::from(raw))
        } else {
            CreatorRef::Legacy(LegacyCreator {
                email: raw.to_string(),
                pinned_owner: None,
            })
        }
    }

    pub fn legacy(email: impl Into<String>) -> Self {
        CreatorRef::Legacy(LegacyCreator {
            email: email.into(),
            pinned_owner: None,
        })
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, CreatorRef::Legacy(_))
    }

    /// The raw identifier as it would have been stored untagged
    pub fn raw(&self) -> &str {
        match self {
            CreatorRef::Account(id) => id.as_str(),
            CreatorRef::Legacy(legacy) => &legacy.email,
        }
    }
}

impl From<AccountId> for CreatorRef {
    fn from(id: AccountId) -> Self {
        CreatorRef::Account(id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CreatorWire {
    Raw(String),
    Account { account: AccountId },
    Legacy { legacy: LegacyCreator },
}

impl From<CreatorWire> for CreatorRef {
    fn from(wire: CreatorWire) -> Self {
        match wire {
            CreatorWire::Raw(raw) => CreatorRef::from_raw(&raw),
            CreatorWire::Account { account } => CreatorRef::Account(account),
            CreatorWire::Legacy { legacy } => CreatorRef::Legacy(legacy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_identifier_heuristic() {
        assert!(!is_stable_identifier("abc@def.com"));
        assert!(is_stable_identifier("k3x9f7q2m1p8z5y6w0v4a"));
        assert!(!is_stable_identifier("Dr Joao"));
        // exactly 20 characters is not enough
        assert!(!is_stable_identifier("k3x9f7q2m1p8z5y6w0v4"));
        assert!(!is_stable_identifier("k3x9f7q2m1p8z5y6w0v4 with space"));
    }

    #[test]
    fn test_raw_string_decodes_by_shape() {
        let stable: CreatorRef = serde_json::from_value(json!("k3x9f7q2m1p8z5y6w0v4a")).unwrap();
        assert_eq!(stable, CreatorRef::Account(AccountId::from("k3x9f7q2m1p8z5y6w0v4a")));

        let legacy: CreatorRef = serde_json::from_value(json!("nurse@example.com")).unwrap();
        assert_eq!(legacy, CreatorRef::legacy("nurse@example.com"));
    }

    #[test]
    fn test_raw_classification_follows_configured_length() {
        assert_eq!(
            CreatorRef::from_raw_with("abcdefghijkl", 10),
            CreatorRef::Account(AccountId::from("abcdefghijkl"))
        );
        assert_eq!(CreatorRef::from_raw("abcdefghijkl"), CreatorRef::legacy("abcdefghijkl"));
        assert!(CreatorRef::from_raw_with("a@example.com", 3).is_legacy());
    }

    #[test]
    fn test_tagged_form_is_written() {
        let creator = CreatorRef::Account(AccountId::from("short"));
        let value = serde_json::to_value(&creator).unwrap();
        assert_eq!(value, json!({"account": "short"}));

        // A short tagged id stays an account id; no shape sniffing on tagged values
        let back: CreatorRef = serde_json::from_value(value).unwrap();
        assert_eq!(back, creator);

        let pinned = CreatorRef::Legacy(LegacyCreator {
            email: "old@example.com".into(),
            pinned_owner: Some(AccountId::from("owner")),
        });
        let value = serde_json::to_value(&pinned).unwrap();
        assert_eq!(
            value,
            json!({"legacy": {"email": "old@example.com", "pinnedOwner": "owner"}})
        );
        assert_eq!(serde_json::from_value::<CreatorRef>(value).unwrap(), pinned);
    }
}
