//! Error Types
//!
//! Two layers of failure reporting:
//!
//! - [`ServiceError`]: internal failures, carried through the service with
//!   `?` and logged with their `code()` for triage.
//! - [`ProtocolError`]: the wire-level error information shape sent to peers
//!   and checkpointed alongside a failed workflow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

// ==== Protocol error information ====

/// Mojaloop-style error codes this service emits.
pub const SERVER_ERROR: &str = "2001";
pub const ACCOUNT_LINKING_ERROR: &str = "7200";
pub const AUTHORIZATION_NOT_VALID: &str = "7105";
pub const INCORRECT_CONSENT_STATUS: &str = "7209";

/// Error information in the peer-facing wire shape. Also persisted inside a
/// workflow checkpoint when the machine enters its errored state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolError {
    pub error_code: String,
    pub error_description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extensions: BTreeMap<String, String>,
}

impl ProtocolError {
    pub fn new(code: &str, description: &str) -> Self {
        Self {
            error_code: code.to_string(),
            error_description: description.to_string(),
            extensions: BTreeMap::new(),
        }
    }

    /// Generic internal server error.
    pub fn server_error() -> Self {
        Self::new(SERVER_ERROR, "Internal server error")
    }

    /// Generic account-linking failure during consent registration.
    pub fn account_linking_error() -> Self {
        Self::new(ACCOUNT_LINKING_ERROR, "Generic Thirdparty account linking error")
    }

    /// The signed authorization could not be verified.
    pub fn authorization_not_valid() -> Self {
        Self::new(AUTHORIZATION_NOT_VALID, "Authorization received from PISP failed validation")
    }

    /// The consent is not in a state that permits the requested operation.
    pub fn incorrect_consent_status() -> Self {
        Self::new(INCORRECT_CONSENT_STATUS, "Consent status is not valid for this request")
    }

    pub fn with_extension(mut self, key: &str, value: &str) -> Self {
        self.extensions.insert(key.to_string(), value.to_string());
        self
    }
}

// ==== Internal service error ====

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store keys must be non-empty strings")]
    InvalidKey,

    #[error("timeout must be greater than zero")]
    PositiveTimeoutRequired,

    #[error("client is not connected")]
    ConnectionError,

    #[error("key-value store failure: {0}")]
    Store(String),

    #[error("pub/sub failure: {0}")]
    PubSub(String),

    #[error("message cannot be serialized: {0}")]
    UnserializableMessage(String),

    #[error("transition '{0}' already in progress")]
    PendingTransition(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported workflow schema version {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("deferred job timed out waiting for a notification")]
    DeferredJobTimeout,

    #[error("credential verification failed: {0}")]
    Credential(String),

    #[error("authorization could not be verified")]
    AuthorizationFailed,

    #[error("peer reported an error: {} {}", .0.error_code, .0.error_description)]
    Protocol(ProtocolError),

    #[error("outbound request failed: {0}")]
    Outbound(String),
}

impl ServiceError {
    /// Stable short code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ServiceError::InvalidKey => "INVALID_KEY",
            ServiceError::PositiveTimeoutRequired => "POSITIVE_TIMEOUT_REQUIRED",
            ServiceError::ConnectionError => "NOT_CONNECTED",
            ServiceError::Store(_) => "STORE_FAILURE",
            ServiceError::PubSub(_) => "PUBSUB_FAILURE",
            ServiceError::UnserializableMessage(_) => "UNSERIALIZABLE_MESSAGE",
            ServiceError::PendingTransition(_) => "PENDING_TRANSITION",
            ServiceError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::UnsupportedSchemaVersion(_) => "UNSUPPORTED_SCHEMA_VERSION",
            ServiceError::DeferredJobTimeout => "DEFERRED_JOB_TIMEOUT",
            ServiceError::Credential(_) => "CREDENTIAL_INVALID",
            ServiceError::AuthorizationFailed => "AUTHORIZATION_FAILED",
            ServiceError::Protocol(_) => "PEER_ERROR",
            ServiceError::Outbound(_) => "OUTBOUND_FAILURE",
        }
    }

    /// Map a registration-phase failure to the error information sent to the
    /// DFSP. A peer-reported error passes through unchanged.
    pub fn to_account_linking_error(&self) -> ProtocolError {
        match self {
            ServiceError::Protocol(info) => info.clone(),
            _ => ProtocolError::account_linking_error(),
        }
    }

    /// Map a verification-phase failure to the error information sent to the
    /// DFSP, tagged with the transition it interrupted.
    pub fn to_verification_error(&self, transition: &str) -> ProtocolError {
        let info = match self {
            ServiceError::Protocol(info) => info.clone(),
            ServiceError::AuthorizationFailed => ProtocolError::authorization_not_valid(),
            other => ProtocolError::server_error().with_extension("reason", other.code()),
        };
        info.with_extension("transition", transition)
    }
}

impl From<ProtocolError> for ServiceError {
    fn from(info: ProtocolError) -> Self {
        ServiceError::Protocol(info)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::UnserializableMessage(err.to_string())
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Outbound(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_wire_shape() {
        let info = ProtocolError::account_linking_error();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["errorCode"], "7200");
        assert!(json["errorDescription"].is_string());
        assert!(json.get("extensions").is_none());
    }

    #[test]
    fn test_extensions_serialize_when_present() {
        let info = ProtocolError::server_error().with_extension("transition", "retrieveConsent");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["errorCode"], "2001");
        assert_eq!(json["extensions"]["transition"], "retrieveConsent");
    }

    #[test]
    fn test_peer_error_passes_through_account_linking_mapping() {
        let peer = ProtocolError::new("7201", "No such account");
        let err = ServiceError::Protocol(peer.clone());
        assert_eq!(err.to_account_linking_error(), peer);

        let other = ServiceError::DeferredJobTimeout;
        assert_eq!(other.to_account_linking_error().error_code, ACCOUNT_LINKING_ERROR);
    }

    #[test]
    fn test_verification_error_mapping() {
        let err = ServiceError::AuthorizationFailed;
        let info = err.to_verification_error("verifyTransaction");
        assert_eq!(info.error_code, AUTHORIZATION_NOT_VALID);
        assert_eq!(info.extensions["transition"], "verifyTransaction");

        let generic = ServiceError::Store("redis down".to_string());
        let info = generic.to_verification_error("retrieveConsent");
        assert_eq!(info.error_code, SERVER_ERROR);
        assert_eq!(info.extensions["reason"], "STORE_FAILURE");
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ServiceError::InvalidKey.code(), "INVALID_KEY");
        assert_eq!(ServiceError::AuthorizationFailed.code(), "AUTHORIZATION_FAILED");
    }
}
