//! Consent and Scope Model
//!
//! One `Consent` represents a linked payment-authorization credential; its
//! `Scope`s are the account/action grants the credential covers. Relational
//! persistence lives outside this core; the [`ConsentRepository`] trait is
//! the boundary, with an in-memory implementation for tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{Result, ServiceError};

// ============================================================================
// Model
// ============================================================================

/// Consent lifecycle status. Transitions only ISSUED -> REVOKED, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentStatus {
    Issued,
    Revoked,
}

/// Credential verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    Pending,
    Verified,
}

/// Supported credential kinds. Only FIDO today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialType {
    Fido,
}

/// A linked payment-authorization credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consent {
    pub id: String,
    /// Owning financial institution.
    pub participant_id: String,
    pub status: ConsentStatus,
    pub credential_type: CredentialType,
    pub credential_status: CredentialStatus,
    pub credential_id: String,
    /// Derived challenge digest captured at registration. Immutable once
    /// attestation succeeds.
    pub credential_challenge: String,
    /// PEM-encoded public key extracted from the attestation.
    pub credential_payload: String,
    /// Monotonic anti-replay counter reported by the authenticator.
    pub credential_counter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// An authorization grant: account + permitted actions for one consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub consent_id: String,
    pub address: String,
    pub actions: Vec<String>,
}

// ============================================================================
// Repository boundary
// ============================================================================

/// Consent/Scope storage interface (implemented outside this core).
///
/// `insert` is assumed transactional: the consent and its scopes land as one
/// unit or not at all.
#[async_trait]
pub trait ConsentRepository: Send + Sync {
    async fn retrieve(&self, consent_id: &str) -> Result<Consent>;

    async fn insert(&self, consent: &Consent, scopes: &[Scope]) -> Result<()>;

    /// Returns the number of rows affected.
    async fn update(&self, consent: &Consent) -> Result<u64>;

    async fn retrieve_all_scopes(&self, consent_id: &str) -> Result<Vec<Scope>>;

    /// Mark a consent REVOKED. Idempotent; keeps the first `revoked_at`.
    async fn revoke(&self, consent_id: &str) -> Result<Consent>;
}

// ============================================================================
// In-memory repository (tests / demo wiring)
// ============================================================================

#[derive(Default)]
pub struct MemoryConsentRepository {
    consents: Mutex<HashMap<String, Consent>>,
    scopes: Mutex<HashMap<String, Vec<Scope>>>,
}

impl MemoryConsentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsentRepository for MemoryConsentRepository {
    async fn retrieve(&self, consent_id: &str) -> Result<Consent> {
        self.consents
            .lock()
            .unwrap()
            .get(consent_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(consent_id.to_string()))
    }

    async fn insert(&self, consent: &Consent, scopes: &[Scope]) -> Result<()> {
        let mut consents = self.consents.lock().unwrap();
        if consents.contains_key(&consent.id) {
            return Err(ServiceError::Store(format!(
                "consent {} already exists",
                consent.id
            )));
        }
        consents.insert(consent.id.clone(), consent.clone());
        self.scopes
            .lock()
            .unwrap()
            .insert(consent.id.clone(), scopes.to_vec());
        Ok(())
    }

    async fn update(&self, consent: &Consent) -> Result<u64> {
        let mut consents = self.consents.lock().unwrap();
        match consents.get_mut(&consent.id) {
            Some(existing) => {
                *existing = consent.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn retrieve_all_scopes(&self, consent_id: &str) -> Result<Vec<Scope>> {
        Ok(self
            .scopes
            .lock()
            .unwrap()
            .get(consent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn revoke(&self, consent_id: &str) -> Result<Consent> {
        let mut consents = self.consents.lock().unwrap();
        let consent = consents
            .get_mut(consent_id)
            .ok_or_else(|| ServiceError::NotFound(consent_id.to_string()))?;
        if consent.status != ConsentStatus::Revoked {
            consent.status = ConsentStatus::Revoked;
            consent.revoked_at = Some(Utc::now());
        }
        Ok(consent.clone())
    }
}

#[cfg(test)]
pub(crate) fn sample_consent(id: &str) -> Consent {
    Consent {
        id: id.to_string(),
        participant_id: "dfspa".to_string(),
        status: ConsentStatus::Issued,
        credential_type: CredentialType::Fido,
        credential_status: CredentialStatus::Verified,
        credential_id: "credential-1".to_string(),
        credential_challenge: "challenge-b64".to_string(),
        credential_payload: "-----BEGIN PUBLIC KEY-----\n-----END PUBLIC KEY-----\n".to_string(),
        credential_counter: 4,
        revoked_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_retrieve() {
        let repo = MemoryConsentRepository::new();
        let consent = sample_consent("c-1");
        let scopes = vec![Scope {
            consent_id: "c-1".to_string(),
            address: "acct-1".to_string(),
            actions: vec!["ACCOUNTS_TRANSFER".to_string()],
        }];

        repo.insert(&consent, &scopes).await.unwrap();
        assert_eq!(repo.retrieve("c-1").await.unwrap(), consent);
        assert_eq!(repo.retrieve_all_scopes("c-1").await.unwrap(), scopes);
    }

    #[tokio::test]
    async fn test_retrieve_missing_is_not_found() {
        let repo = MemoryConsentRepository::new();
        assert!(matches!(
            repo.retrieve("missing").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = MemoryConsentRepository::new();
        let consent = sample_consent("c-1");
        repo.insert(&consent, &[]).await.unwrap();
        assert!(repo.insert(&consent, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_is_one_way_and_idempotent() {
        let repo = MemoryConsentRepository::new();
        repo.insert(&sample_consent("c-1"), &[]).await.unwrap();

        let revoked = repo.revoke("c-1").await.unwrap();
        assert_eq!(revoked.status, ConsentStatus::Revoked);
        let first_ts = revoked.revoked_at.unwrap();

        let again = repo.revoke("c-1").await.unwrap();
        assert_eq!(again.revoked_at.unwrap(), first_ts);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_value(sample_consent("c-1")).unwrap();
        assert_eq!(json["status"], "ISSUED");
        assert_eq!(json["credentialType"], "FIDO");
        assert_eq!(json["credentialStatus"], "VERIFIED");
    }
}
