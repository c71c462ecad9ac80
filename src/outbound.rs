//! Outbound Protocol Client
//!
//! Callbacks to the DFSP that initiated a request and registration calls to
//! the account lookup service (ALS). The [`OutboundClient`] trait is the
//! seam; workflows never construct HTTP requests themselves.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::{ProtocolError, Result, ServiceError};

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait OutboundClient: Send + Sync {
    /// `PUT /consents/{id}` on the DFSP: registration outcome.
    async fn put_consents(&self, consent_id: &str, destination: &str, payload: &Value)
    -> Result<()>;

    /// `PUT /consents/{id}/error` on the DFSP.
    async fn put_consents_error(
        &self,
        consent_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()>;

    /// `PUT /thirdpartyRequests/verifications/{id}` on the DFSP.
    async fn put_verifications(
        &self,
        verification_id: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<()>;

    /// `PUT /thirdpartyRequests/verifications/{id}/error` on the DFSP.
    async fn put_verifications_error(
        &self,
        verification_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()>;

    /// `POST /participants/{Type}/{ID}` on the ALS: claim this service as
    /// the authoritative source for a consent.
    async fn post_participant(&self, id_type: &str, id: &str) -> Result<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpOutboundClient {
    http: reqwest::Client,
    peer_base_url: String,
    als_base_url: String,
    /// Our FSPIOP source id.
    participant_id: String,
}

impl HttpOutboundClient {
    pub fn new(peer_base_url: &str, als_base_url: &str, participant_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            peer_base_url: peer_base_url.trim_end_matches('/').to_string(),
            als_base_url: als_base_url.trim_end_matches('/').to_string(),
            participant_id: participant_id.to_string(),
        }
    }

    async fn put_json(&self, url: &str, destination: &str, body: &Value) -> Result<()> {
        let response = self
            .http
            .put(url)
            .header("fspiop-source", &self.participant_id)
            .header("fspiop-destination", destination)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            error!(url, status = %response.status(), "outbound PUT rejected");
            return Err(ServiceError::Outbound(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }
        debug!(url, destination, "outbound PUT delivered");
        Ok(())
    }
}

#[async_trait]
impl OutboundClient for HttpOutboundClient {
    async fn put_consents(
        &self,
        consent_id: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<()> {
        let url = format!("{}/consents/{}", self.peer_base_url, consent_id);
        self.put_json(&url, destination, payload).await
    }

    async fn put_consents_error(
        &self,
        consent_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()> {
        let url = format!("{}/consents/{}/error", self.peer_base_url, consent_id);
        let body = serde_json::json!({ "errorInformation": error });
        self.put_json(&url, destination, &body).await
    }

    async fn put_verifications(
        &self,
        verification_id: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<()> {
        let url = format!(
            "{}/thirdpartyRequests/verifications/{}",
            self.peer_base_url, verification_id
        );
        self.put_json(&url, destination, payload).await
    }

    async fn put_verifications_error(
        &self,
        verification_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()> {
        let url = format!(
            "{}/thirdpartyRequests/verifications/{}/error",
            self.peer_base_url, verification_id
        );
        let body = serde_json::json!({ "errorInformation": error });
        self.put_json(&url, destination, &body).await
    }

    async fn post_participant(&self, id_type: &str, id: &str) -> Result<()> {
        let url = format!("{}/participants/{}/{}", self.als_base_url, id_type, id);
        let body = serde_json::json!({ "fspId": self.participant_id });
        let response = self
            .http
            .post(&url)
            .header("fspiop-source", &self.participant_id)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            error!(url, status = %response.status(), "participant registration rejected");
            return Err(ServiceError::Outbound(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Mock implementation (tests)
// ============================================================================

/// One recorded outbound call, in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    PutConsents {
        consent_id: String,
        destination: String,
        payload: Value,
    },
    PutConsentsError {
        consent_id: String,
        destination: String,
        error: ProtocolError,
    },
    PutVerifications {
        verification_id: String,
        destination: String,
        payload: Value,
    },
    PutVerificationsError {
        verification_id: String,
        destination: String,
        error: ProtocolError,
    },
    PostParticipant {
        id_type: String,
        id: String,
    },
}

/// Call-recording client with per-operation failure switches.
#[derive(Default)]
pub struct MockOutboundClient {
    calls: Mutex<Vec<OutboundCall>>,
    fail_put_consents: AtomicBool,
    fail_put_consents_error: AtomicBool,
    fail_put_verifications: AtomicBool,
    fail_put_verifications_error: AtomicBool,
    fail_post_participant: AtomicBool,
}

impl MockOutboundClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn set_fail_put_consents(&self, fail: bool) {
        self.fail_put_consents.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_put_consents_error(&self, fail: bool) {
        self.fail_put_consents_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_put_verifications(&self, fail: bool) {
        self.fail_put_verifications.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_put_verifications_error(&self, fail: bool) {
        self.fail_put_verifications_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_post_participant(&self, fail: bool) {
        self.fail_post_participant.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: OutboundCall, fail: &AtomicBool, what: &str) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if fail.load(Ordering::SeqCst) {
            return Err(ServiceError::Outbound(format!("mock {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundClient for MockOutboundClient {
    async fn put_consents(
        &self,
        consent_id: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<()> {
        self.record(
            OutboundCall::PutConsents {
                consent_id: consent_id.to_string(),
                destination: destination.to_string(),
                payload: payload.clone(),
            },
            &self.fail_put_consents,
            "put_consents",
        )
    }

    async fn put_consents_error(
        &self,
        consent_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()> {
        self.record(
            OutboundCall::PutConsentsError {
                consent_id: consent_id.to_string(),
                destination: destination.to_string(),
                error: error.clone(),
            },
            &self.fail_put_consents_error,
            "put_consents_error",
        )
    }

    async fn put_verifications(
        &self,
        verification_id: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<()> {
        self.record(
            OutboundCall::PutVerifications {
                verification_id: verification_id.to_string(),
                destination: destination.to_string(),
                payload: payload.clone(),
            },
            &self.fail_put_verifications,
            "put_verifications",
        )
    }

    async fn put_verifications_error(
        &self,
        verification_id: &str,
        destination: &str,
        error: &ProtocolError,
    ) -> Result<()> {
        self.record(
            OutboundCall::PutVerificationsError {
                verification_id: verification_id.to_string(),
                destination: destination.to_string(),
                error: error.clone(),
            },
            &self.fail_put_verifications_error,
            "put_verifications_error",
        )
    }

    async fn post_participant(&self, id_type: &str, id: &str) -> Result<()> {
        self.record(
            OutboundCall::PostParticipant {
                id_type: id_type.to_string(),
                id: id.to_string(),
            },
            &self.fail_post_participant,
            "post_participant",
        )
    }
}
