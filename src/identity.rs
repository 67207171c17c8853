//! Identity resolution
//!
//! Maps creator identifiers to display names and to a best-effort original
//! owner. Everything here feeds display logic, so failures degrade to `None`
//! and are never raised.

use crate::access::AccessIndex;
use crate::config::IdentityConfig;
use crate::error::{Result, SafeCareError};
use crate::model::{
    is_stable_identifier_with, Account, AccountId, AccountPatch, CreatorRef, PatientId,
};
use crate::store::{read_typed, DocumentStore, StorePaths};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Account profiles stored at `accounts/{id}/profile`
#[derive(Clone)]
pub struct AccountDirectory {
    store: Arc<dyn DocumentStore>,
    paths: StorePaths,
}

impl AccountDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub async fn register(&self, account: &Account) -> Result<()> {
        if !account.id.is_valid() {
            return Err(SafeCareError::InvalidEntry(format!(
                "invalid account id {:?}",
                account.id.as_str()
            )));
        }
        let path = self.paths.profile(&account.id);
        self.store.set(&path, serde_json::to_value(account)?).await?;
        info!(account_id = %account.id, "Account registered");
        Ok(())
    }

    pub async fn get(&self, account_id: &AccountId) -> Result<Option<Account>> {
        if !account_id.is_valid() {
            return Ok(None);
        }
        Ok(read_typed(self.store.as_ref(), &self.paths.profile(account_id)).await?)
    }

    pub async fn update_profile(&self, account_id: &AccountId, patch: AccountPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        if self.get(account_id).await?.is_none() {
            return Err(SafeCareError::NotFound(format!("account {account_id}")));
        }
        let updates = match serde_json::to_value(patch)? {
            serde_json::Value::Object(map) => map,
            _ => return Ok(()),
        };
        self.store.update(&self.paths.profile(account_id), updates).await?;
        debug!(account_id = %account_id, "Profile updated");
        Ok(())
    }
}

/// How the original owner of a record was determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerResolution {
    /// `createdBy` holds an account id
    Recorded(AccountId),
    /// Legacy record whose owner was pinned once by migration
    Pinned(AccountId),
    /// Legacy record; some account currently holding access. Not authoritative.
    LegacyGuess(AccountId),
    /// Legacy record nobody holds access to
    Unknown,
}

impl OwnerResolution {
    pub fn account_id(&self) -> Option<&AccountId> {
        match self {
            Self::Recorded(id) | Self::Pinned(id) | Self::LegacyGuess(id) => Some(id),
            Self::Unknown => None,
        }
    }

    pub fn into_account_id(self) -> Option<AccountId> {
        match self {
            Self::Recorded(id) | Self::Pinned(id) | Self::LegacyGuess(id) => Some(id),
            Self::Unknown => None,
        }
    }

    pub fn is_guess(&self) -> bool {
        matches!(self, Self::LegacyGuess(_))
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    directory: AccountDirectory,
    access: AccessIndex,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(directory: AccountDirectory, access: AccessIndex, config: IdentityConfig) -> Self {
        Self {
            directory,
            access,
            config,
        }
    }

    pub fn directory(&self) -> &AccountDirectory {
        &self.directory
    }

    /// Display name for a creator identifier.
    ///
    /// Identifiers containing `@` are legacy raw emails and come back
    /// unchanged. Otherwise the account's name, then its email, then `None`.
    pub async fn resolve_display_name(&self, identifier: &str) -> Option<String> {
        if identifier.contains('@') {
            return Some(identifier.to_string());
        }
        let account_id = AccountId::from(identifier);
        match self.directory.get(&account_id).await {
            Ok(Some(account)) => account.display_name().map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Display name lookup failed");
                None
            }
        }
    }

    pub fn is_stable_identifier(&self, identifier: &str) -> bool {
        is_stable_identifier_with(identifier, self.config.stable_id_min_len)
    }

    /// Classify an untagged `createdBy` string with the configured length
    pub fn creator_from_raw(&self, raw: &str) -> CreatorRef {
        CreatorRef::from_raw_with(raw, self.config.stable_id_min_len)
    }

    /// Placeholder for an account whose profile cannot be resolved
    pub fn masked(&self, account_id: &AccountId) -> String {
        let prefix: String = account_id
            .as_str()
            .chars()
            .take(self.config.masked_prefix_len)
            .collect();
        format!("User {prefix}...")
    }

    /// Owner of a record from a raw `createdBy` value.
    ///
    /// Stable identifiers are returned as-is. Anything else is a legacy email
    /// and yields [`detect_legacy_owner_guess`](Self::detect_legacy_owner_guess).
    pub async fn detect_original_owner(
        &self,
        patient_id: &PatientId,
        created_by: &str,
    ) -> Option<AccountId> {
        if self.is_stable_identifier(created_by) {
            return Some(AccountId::from(created_by));
        }
        self.detect_legacy_owner_guess(patient_id, Some(created_by)).await
    }

    /// Owner of a record from its decoded creator reference.
    ///
    /// An unpinned legacy value that is a stable identifier under the
    /// configured length counts as recorded; record decoding classifies raw
    /// strings with the default length.
    pub async fn resolve_owner(
        &self,
        patient_id: &PatientId,
        creator: Option<&CreatorRef>,
    ) -> OwnerResolution {
        match creator {
            Some(CreatorRef::Account(id)) => OwnerResolution::Recorded(id.clone()),
            Some(CreatorRef::Legacy(legacy)) => match &legacy.pinned_owner {
                Some(id) => OwnerResolution::Pinned(id.clone()),
                None if self.is_stable_identifier(&legacy.email) => {
                    OwnerResolution::Recorded(AccountId::from(legacy.email.as_str()))
                }
                None => self
                    .detect_legacy_owner_guess(patient_id, Some(&legacy.email))
                    .await
                    .map_or(OwnerResolution::Unknown, OwnerResolution::LegacyGuess),
            },
            None => self
                .detect_legacy_owner_guess(patient_id, None)
                .await
                .map_or(OwnerResolution::Unknown, OwnerResolution::LegacyGuess),
        }
    }

    /// Best guess at the owner of a legacy record: a current holder whose
    /// profile email matches the legacy email, else the first holder in store
    /// order. The result is only ever "some valid sharer"; with several legacy
    /// holders it is not necessarily the historical creator.
    pub async fn detect_legacy_owner_guess(
        &self,
        patient_id: &PatientId,
        legacy_email: Option<&str>,
    ) -> Option<AccountId> {
        let holders = match self.access.holders_of(patient_id).await {
            Ok(holders) => holders,
            Err(e) => {
                warn!(
                    patient_id = %patient_id,
                    error = %e,
                    "Holder lookup failed during owner detection"
                );
                return None;
            }
        };

        if let Some(email) = legacy_email.map(str::trim).filter(|e| !e.is_empty()) {
            for holder in &holders {
                if let Ok(Some(account)) = self.directory.get(holder).await {
                    if account.email.eq_ignore_ascii_case(email) {
                        return Some(holder.clone());
                    }
                }
            }
        }

        let guess = holders.into_iter().next();
        debug!(patient_id = %patient_id, guess = ?guess, "Legacy owner guessed");
        guess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const STABLE: &str = "k3x9f7q2m1p8z5y6w0v4a";

    fn resolver() -> IdentityResolver {
        resolver_with(IdentityConfig::default())
    }

    fn resolver_with(config: IdentityConfig) -> IdentityResolver {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let paths = StorePaths::default();
        IdentityResolver::new(
            AccountDirectory::new(store.clone(), paths.clone()),
            AccessIndex::new(store, paths),
            config,
        )
    }

    #[tokio::test]
    async fn test_legacy_email_passthrough() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve_display_name("nurse@example.com").await.as_deref(),
            Some("nurse@example.com")
        );
    }

    #[tokio::test]
    async fn test_display_name_fallbacks() {
        let resolver = resolver();
        let dir = resolver.directory();
        dir.register(&Account::new("named", "Ana Souza", "ana@example.com", "nurse"))
            .await
            .unwrap();
        dir.register(&Account::new("unnamed", "", "bruno@example.com", "family"))
            .await
            .unwrap();

        let named = resolver.resolve_display_name("named").await;
        assert_eq!(named.as_deref(), Some("Ana Souza"));
        let unnamed = resolver.resolve_display_name("unnamed").await;
        assert_eq!(unnamed.as_deref(), Some("bruno@example.com"));
        assert_eq!(resolver.resolve_display_name("ghost").await, None);
        assert_eq!(resolver.resolve_display_name("").await, None);
    }

    #[tokio::test]
    async fn test_stable_creator_returned_as_is() {
        let resolver = resolver();
        let owner = resolver.detect_original_owner(&PatientId::from("p1"), STABLE).await;
        assert_eq!(owner, Some(AccountId::from(STABLE)));
    }

    #[tokio::test]
    async fn test_legacy_owner_guess_is_some_holder() {
        let resolver = resolver();
        let p = PatientId::from("p1");
        assert_eq!(resolver.detect_original_owner(&p, "old@example.com").await, None);

        let holders = [AccountId::from("holder-a"), AccountId::from("holder-b")];
        for h in &holders {
            resolver.access.grant_access(h, &p).await;
        }
        let guess = resolver.detect_original_owner(&p, "old@example.com").await.unwrap();
        assert!(holders.contains(&guess));
    }

    #[tokio::test]
    async fn test_legacy_guess_prefers_matching_email() {
        let resolver = resolver();
        let p = PatientId::from("p1");
        resolver.access.grant_access(&AccountId::from("aaa"), &p).await;
        resolver.access.grant_access(&AccountId::from("zzz"), &p).await;
        resolver
            .directory()
            .register(&Account::new("zzz", "Carla", "Old@Example.com", "nurse"))
            .await
            .unwrap();

        let owner = resolver
            .resolve_owner(&p, Some(&CreatorRef::legacy("old@example.com")))
            .await;
        assert_eq!(owner, OwnerResolution::LegacyGuess(AccountId::from("zzz")));
        assert!(owner.is_guess());
    }

    #[tokio::test]
    async fn test_configured_length_applies_to_decoded_creators() {
        let resolver = resolver_with(IdentityConfig {
            stable_id_min_len: 10,
            ..IdentityConfig::default()
        });
        let p = PatientId::from("p1");
        resolver.access.grant_access(&AccountId::from("zzz"), &p).await;

        // Record decoding uses the default length, so this arrives as legacy
        let raw = serde_json::json!({"name": "Maria", "createdBy": "abcdefghijkl"});
        let record: crate::model::PatientRecord = serde_json::from_value(raw).unwrap();
        assert!(record.created_by.as_ref().map_or(false, CreatorRef::is_legacy));

        assert!(resolver.is_stable_identifier("abcdefghijkl"));
        assert_eq!(
            resolver.creator_from_raw("abcdefghijkl"),
            CreatorRef::Account(AccountId::from("abcdefghijkl"))
        );
        assert_eq!(
            resolver.resolve_owner(&p, record.created_by.as_ref()).await,
            OwnerResolution::Recorded(AccountId::from("abcdefghijkl"))
        );
    }

    #[test]
    fn test_masked_placeholder() {
        let resolver = resolver();
        assert_eq!(resolver.masked(&AccountId::from(STABLE)), "User k3x9f7q2...");
        assert_eq!(resolver.masked(&AccountId::from("ab")), "User ab...");
    }
}
