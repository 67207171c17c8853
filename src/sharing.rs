//! Sharing inspection
//!
//! Who else holds access to a patient. Only the owner is shown sharing
//! details; other holders learn who shared the record with them and nothing
//! about the rest of the access list.

use crate::access::AccessIndex;
use crate::identity::{IdentityResolver, OwnerResolution};
use crate::model::{AccountId, PatientId, PatientRecord};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingStatus {
    pub is_being_shared: bool,
    pub shared_with_count: usize,
}

/// Sharing view of one patient for one caller.
///
/// `being_shared`, `shared_with_count` and `shared_with_users` are only
/// present when the caller is the (original) owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingInfo {
    /// The record was shared with the caller by someone else
    pub shared: bool,
    /// Display name of the owner, when the caller is not the owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub being_shared: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_with_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_with_users: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct SharingInspector {
    access: AccessIndex,
    identity: IdentityResolver,
}

impl SharingInspector {
    pub fn new(access: AccessIndex, identity: IdentityResolver) -> Self {
        Self { access, identity }
    }

    /// Count access entries for the patient other than the owner's
    pub async fn is_being_shared(
        &self,
        patient_id: &PatientId,
        owner_id: &AccountId,
    ) -> SharingStatus {
        let others = self.non_owner_holders(patient_id, owner_id).await;
        SharingStatus {
            is_being_shared: !others.is_empty(),
            shared_with_count: others.len(),
        }
    }

    /// Display names of every non-owner holder; unresolvable accounts get a
    /// masked placeholder so the list length always matches the count.
    pub async fn list_shared_with_names(
        &self,
        patient_id: &PatientId,
        owner_id: &AccountId,
    ) -> Vec<String> {
        let mut names = Vec::new();
        for holder in self.non_owner_holders(patient_id, owner_id).await {
            let name = self
                .identity
                .resolve_display_name(holder.as_str())
                .await
                .unwrap_or_else(|| self.identity.masked(&holder));
            names.push(name);
        }
        names
    }

    /// Composite sharing view for `account_id`
    pub async fn get_sharing_info(
        &self,
        account_id: &AccountId,
        record: &PatientRecord,
        patient_id: &PatientId,
    ) -> SharingInfo {
        let owner = self
            .identity
            .resolve_owner(patient_id, record.created_by.as_ref())
            .await;
        let Some(owner_id) = owner.account_id() else {
            return SharingInfo::default();
        };

        if owner_id != account_id {
            let original_owner = match &owner {
                // A legacy record's email is what the owner originally typed
                OwnerResolution::LegacyGuess(_) | OwnerResolution::Pinned(_) => {
                    match &record.created_by {
                        Some(creator) => Some(creator.raw().to_string()),
                        None => self.identity.resolve_display_name(owner_id.as_str()).await,
                    }
                }
                _ => self.identity.resolve_display_name(owner_id.as_str()).await,
            };
            return SharingInfo {
                shared: true,
                original_owner,
                ..Default::default()
            };
        }

        let users = self.list_shared_with_names(patient_id, owner_id).await;
        SharingInfo {
            shared: false,
            original_owner: None,
            being_shared: Some(!users.is_empty()),
            shared_with_count: Some(users.len()),
            shared_with_users: Some(users),
        }
    }

    async fn non_owner_holders(
        &self,
        patient_id: &PatientId,
        owner_id: &AccountId,
    ) -> Vec<AccountId> {
        match self.access.holders_of(patient_id).await {
            Ok(holders) => holders.into_iter().filter(|h| h != owner_id).collect(),
            Err(e) => {
                warn!(
                    patient_id = %patient_id,
                    error = %e,
                    "Holder lookup failed, reporting no sharing"
                );
                Vec::new()
            }
        }
    }
}
