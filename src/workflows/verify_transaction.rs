//! Verify-Transaction Workflow
//!
//! Transaction authorization: a DFSP asks whether a signed FIDO assertion
//! was produced by the credential linked to a consent. The consent is loaded
//! from the repository, the assertion verified against the stored key and
//! counter, and the verdict sent back to the DFSP. The consent itself is
//! never written here: the stored record belongs to registration and revoke.
//!
//! ```text
//! Start --retrieveConsent--> ConsentRetrieved
//!       --verifyTransaction--> TransactionVerified
//!       --sendCallbackToDFSP--> CallbackSent
//! (any) --fail--> Errored
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

use super::WorkflowEnv;
use crate::consent::{Consent, ConsentStatus};
use crate::credential::{AssertionExpectations, FidoAssertion, verify_assertion};
use crate::errors::{ProtocolError, Result, ServiceError};
use crate::fsm::{PendingTransition, PersistentFsm, StateTag, Transition};

// ==== States and transitions ====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifyTransactionState {
    Start,
    ConsentRetrieved,
    TransactionVerified,
    CallbackSent,
    Errored,
}

impl fmt::Display for VerifyTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StateTag for VerifyTransactionState {
    fn initial() -> Self {
        VerifyTransactionState::Start
    }
    fn errored() -> Self {
        VerifyTransactionState::Errored
    }
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerifyTransactionState::CallbackSent | VerifyTransactionState::Errored
        )
    }
}

static TRANSITIONS: &[Transition<VerifyTransactionState>] = &[
    Transition {
        name: "retrieveConsent",
        from: VerifyTransactionState::Start,
        to: VerifyTransactionState::ConsentRetrieved,
    },
    Transition {
        name: "verifyTransaction",
        from: VerifyTransactionState::ConsentRetrieved,
        to: VerifyTransactionState::TransactionVerified,
    },
    Transition {
        name: "sendCallbackToDFSP",
        from: VerifyTransactionState::TransactionVerified,
        to: VerifyTransactionState::CallbackSent,
    },
];

// ==== Request and durable data ====

/// Inbound `POST /thirdpartyRequests/verifications` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyTransactionRequest {
    pub verification_request_id: String,
    pub consent_id: String,
    /// DFSP asking for the verification; callbacks go here.
    pub participant_id: String,
    /// Challenge the DFSP handed to the PISP for signing.
    pub challenge: String,
    /// Only "FIDO" is supported.
    pub signed_payload_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fido_signed_payload: Option<FidoAssertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyTransactionData {
    pub request: VerifyTransactionRequest,
    /// Loaded at retrieveConsent.
    pub consent: Option<Consent>,
    /// Verdict computed at verifyTransaction, sent at sendCallbackToDFSP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_response: Option<serde_json::Value>,
}

// ==== Workflow ====

pub struct VerifyTransactionWorkflow {
    fsm: PersistentFsm<VerifyTransactionState, VerifyTransactionData>,
    env: WorkflowEnv,
}

fn storage_key(verification_request_id: &str) -> String {
    format!("VerifyTransaction_{}", verification_request_id)
}

impl VerifyTransactionWorkflow {
    pub async fn create(env: WorkflowEnv, request: VerifyTransactionRequest) -> Result<Self> {
        let key = storage_key(&request.verification_request_id);
        let data = VerifyTransactionData {
            request,
            consent: None,
            verification_response: None,
        };
        let fsm = PersistentFsm::create(env.kvs.clone(), &key, TRANSITIONS, data).await?;
        Ok(Self { fsm, env })
    }

    /// Resume a workflow from its checkpoint; no completed step is re-run.
    pub async fn load(env: WorkflowEnv, verification_request_id: &str) -> Result<Self> {
        let fsm = PersistentFsm::load(
            env.kvs.clone(),
            &storage_key(verification_request_id),
            TRANSITIONS,
        )
        .await?;
        Ok(Self { fsm, env })
    }

    pub fn state(&self) -> VerifyTransactionState {
        self.fsm.state()
    }

    /// Drive the workflow to a terminal state, one transition per iteration.
    ///
    /// Any step failure maps to the verification error shape (tagged with the
    /// transition it interrupted), moves the machine to `Errored`, and
    /// best-effort notifies the DFSP before the original error returns.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let (transition_name, result) = match self.fsm.state() {
                VerifyTransactionState::Start => {
                    ("retrieveConsent", self.step_retrieve_consent().await)
                }
                VerifyTransactionState::ConsentRetrieved => {
                    ("verifyTransaction", self.step_verify_transaction().await)
                }
                VerifyTransactionState::TransactionVerified => {
                    ("sendCallbackToDFSP", self.step_send_callback().await)
                }
                VerifyTransactionState::CallbackSent => {
                    info!(
                        verification_request_id = %self.fsm.data.request.verification_request_id,
                        "transaction verification complete"
                    );
                    return Ok(());
                }
                VerifyTransactionState::Errored => {
                    warn!(
                        verification_request_id = %self.fsm.data.request.verification_request_id,
                        "workflow already errored, nothing to do"
                    );
                    return Ok(());
                }
            };

            if let Err(err) = result {
                let info = err.to_verification_error(transition_name);
                return self.settle_failure(err, info).await;
            }
        }
    }

    async fn settle_failure(&mut self, err: ServiceError, info: ProtocolError) -> Result<()> {
        if let Err(fail_err) = self.fsm.fail(info.clone()).await {
            error!(error = %fail_err, "could not checkpoint errored state");
        }
        let verification_request_id = self.fsm.data.request.verification_request_id.clone();
        let destination = self.fsm.data.request.participant_id.clone();
        if let Err(notify_err) = self
            .env
            .outbound
            .put_verifications_error(&verification_request_id, &destination, &info)
            .await
        {
            error!(
                verification_request_id,
                error = %notify_err,
                "could not notify DFSP of verification failure"
            );
        }
        Err(err)
    }

    /// Abort a pending transition; a checkpoint failure here is logged and
    /// swallowed so it cannot mask the step error being propagated.
    async fn abort_logged(&mut self, transition: PendingTransition<VerifyTransactionState>) {
        let name = transition.name();
        if let Err(err) = self.fsm.abort(transition).await {
            error!(transition = name, error = %err, "could not checkpoint aborted transition");
        }
    }

    // ==== Steps ====

    async fn step_retrieve_consent(&mut self) -> Result<()> {
        let transition = self.fsm.begin("retrieveConsent")?;

        let consent_id = self.fsm.data.request.consent_id.clone();
        match self.env.repository.retrieve(&consent_id).await {
            Ok(consent) => {
                self.fsm.data.consent = Some(consent);
                self.fsm.commit(transition).await
            }
            Err(err) => {
                warn!(consent_id, error = %err, "consent could not be retrieved");
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }

    async fn step_verify_transaction(&mut self) -> Result<()> {
        let transition = self.fsm.begin("verifyTransaction")?;

        let outcome = async {
            let data = &self.fsm.data;
            let request = &data.request;
            let consent = data.consent.as_ref().ok_or_else(|| {
                ServiceError::InvalidStateTransition(
                    "verifyTransaction requires retrieveConsent output".to_string(),
                )
            })?;

            if consent.status == ConsentStatus::Revoked {
                warn!(consent_id = %consent.id, "verification attempted against revoked consent");
                return Err(ServiceError::Protocol(
                    ProtocolError::incorrect_consent_status(),
                ));
            }
            if request.signed_payload_type != "FIDO" {
                return Err(ServiceError::InvalidArgument(format!(
                    "unsupported signed payload type '{}'",
                    request.signed_payload_type
                )));
            }
            let assertion = request.fido_signed_payload.as_ref().ok_or_else(|| {
                ServiceError::InvalidArgument("FIDO signed payload missing".to_string())
            })?;

            let new_counter = verify_assertion(
                assertion,
                &AssertionExpectations {
                    challenge: request.challenge.clone(),
                    origin: None,
                    public_key_pem: consent.credential_payload.clone(),
                    previous_counter: consent.credential_counter,
                    require_user_verification: self.env.config.require_user_verification,
                },
            )?;
            // The stored consent is not touched: the counter baseline stays
            // the registration-time value until the credential re-registers.
            info!(
                consent_id = %consent.id,
                asserted_counter = new_counter,
                "assertion verified"
            );
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.fsm.data.verification_response =
                    Some(serde_json::json!({ "authenticationResponse": "VERIFIED" }));
                self.fsm.commit(transition).await
            }
            Err(err) => {
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }

    async fn step_send_callback(&mut self) -> Result<()> {
        let transition = self.fsm.begin("sendCallbackToDFSP")?;

        let payload = match &self.fsm.data.verification_response {
            Some(response) => response.clone(),
            None => {
                let err = ServiceError::InvalidStateTransition(
                    "sendCallbackToDFSP requires verifyTransaction output".to_string(),
                );
                self.abort_logged(transition).await;
                return Err(err);
            }
        };
        let request = &self.fsm.data.request;
        let result = self
            .env
            .outbound
            .put_verifications(
                &request.verification_request_id,
                &request.participant_id,
                &payload,
            )
            .await;
        match result {
            Ok(()) => self.fsm.commit(transition).await,
            Err(err) => {
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }
}
