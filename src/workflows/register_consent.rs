//! Register-Consent Workflow
//!
//! Account linking: a DFSP forwards a consent carrying a FIDO attestation;
//! this service verifies the attestation against the challenge it derives
//! from the consent's scopes, persists the consent as the system of record,
//! registers itself as the authoritative source at the ALS registry, and
//! finally confirms the link back to the DFSP.
//!
//! ```text
//! Start --verifyConsent--> ConsentVerified
//!       --storeConsent--> ConsentStoredAndVerified
//!       --registerAuthoritativeSourceWithALS--> RegisteredAsAuthoritativeSource
//!       --sendConsentCallbackToDFSP--> CallbackSent
//! (any) --fail--> Errored
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

use super::WorkflowEnv;
use crate::challenge::{ChallengePayload, ChallengeScope, derive_challenge_base64};
use crate::consent::{Consent, ConsentStatus, CredentialStatus, CredentialType, Scope};
use crate::credential::{AttestationExpectations, FidoAttestation, verify_attestation};
use crate::deferred_job::deferred_job;
use crate::errors::{ProtocolError, Result, ServiceError};
use crate::fsm::{PersistentFsm, StateTag, Transition};

/// Key material recorded when a demo credential bypasses attestation.
const DEMO_PLACEHOLDER_PEM: &str =
    "-----BEGIN PUBLIC KEY-----\nDEMO CREDENTIAL - NOT A KEY\n-----END PUBLIC KEY-----\n";

// ==== States and transitions ====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegisterConsentState {
    Start,
    ConsentVerified,
    ConsentStoredAndVerified,
    RegisteredAsAuthoritativeSource,
    CallbackSent,
    Errored,
}

impl fmt::Display for RegisterConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StateTag for RegisterConsentState {
    fn initial() -> Self {
        RegisterConsentState::Start
    }
    fn errored() -> Self {
        RegisterConsentState::Errored
    }
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegisterConsentState::CallbackSent | RegisterConsentState::Errored
        )
    }
}

static TRANSITIONS: &[Transition<RegisterConsentState>] = &[
    Transition {
        name: "verifyConsent",
        from: RegisterConsentState::Start,
        to: RegisterConsentState::ConsentVerified,
    },
    Transition {
        name: "storeConsent",
        from: RegisterConsentState::ConsentVerified,
        to: RegisterConsentState::ConsentStoredAndVerified,
    },
    Transition {
        name: "registerAuthoritativeSourceWithALS",
        from: RegisterConsentState::ConsentStoredAndVerified,
        to: RegisterConsentState::RegisteredAsAuthoritativeSource,
    },
    Transition {
        name: "sendConsentCallbackToDFSP",
        from: RegisterConsentState::RegisteredAsAuthoritativeSource,
        to: RegisterConsentState::CallbackSent,
    },
];

// ==== Request and durable data ====

/// Inbound `POST /consents` content this workflow is created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConsentRequest {
    pub consent_id: String,
    /// DFSP that initiated the account linking; callbacks go here.
    pub participant_id: String,
    pub scopes: Vec<ChallengeScope>,
    pub credential: FidoAttestation,
}

/// Everything checkpointed between transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConsentData {
    pub request: RegisterConsentRequest,
    /// Derived at verifyConsent; immutable afterwards.
    pub derived_challenge: Option<String>,
    pub credential_public_key_pem: Option<String>,
    pub credential_counter: Option<u32>,
}

// ==== Workflow ====

pub struct RegisterConsentWorkflow {
    fsm: PersistentFsm<RegisterConsentState, RegisterConsentData>,
    env: WorkflowEnv,
}

fn storage_key(consent_id: &str) -> String {
    format!("RegisterConsent_{}", consent_id)
}

fn registry_reply_channel(consent_id: &str) -> String {
    format!("RegisterConsent_registerAuthoritativeSource_{}", consent_id)
}

impl RegisterConsentWorkflow {
    pub async fn create(env: WorkflowEnv, request: RegisterConsentRequest) -> Result<Self> {
        let key = storage_key(&request.consent_id);
        let data = RegisterConsentData {
            request,
            derived_challenge: None,
            credential_public_key_pem: None,
            credential_counter: None,
        };
        let fsm = PersistentFsm::create(env.kvs.clone(), &key, TRANSITIONS, data).await?;
        Ok(Self { fsm, env })
    }

    /// Resume a workflow from its checkpoint; no completed step is re-run.
    pub async fn load(env: WorkflowEnv, consent_id: &str) -> Result<Self> {
        let fsm =
            PersistentFsm::load(env.kvs.clone(), &storage_key(consent_id), TRANSITIONS).await?;
        Ok(Self { fsm, env })
    }

    pub fn state(&self) -> RegisterConsentState {
        self.fsm.state()
    }

    /// Drive the workflow to a terminal state, one transition per iteration.
    ///
    /// On any step failure: move the machine to `Errored` with the mapped
    /// protocol error, best-effort notify the DFSP, and return the original
    /// error. A notification failure is logged, never masks the original.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let result = match self.fsm.state() {
                RegisterConsentState::Start => self.step_verify_consent().await,
                RegisterConsentState::ConsentVerified => self.step_store_consent().await,
                RegisterConsentState::ConsentStoredAndVerified => {
                    self.step_register_authoritative_source().await
                }
                RegisterConsentState::RegisteredAsAuthoritativeSource => {
                    self.step_send_callback().await
                }
                RegisterConsentState::CallbackSent => {
                    info!(consent_id = %self.fsm.data.request.consent_id, "consent registration complete");
                    return Ok(());
                }
                RegisterConsentState::Errored => {
                    warn!(
                        consent_id = %self.fsm.data.request.consent_id,
                        "workflow already errored, nothing to do"
                    );
                    return Ok(());
                }
            };

            if let Err(err) = result {
                let info = err.to_account_linking_error();
                return self.settle_failure(err, info).await;
            }

            // The registry listener records a peer error without throwing;
            // it must not go unnoticed past this point.
            if self.fsm.state() == RegisterConsentState::RegisteredAsAuthoritativeSource {
                if let Some(info) = self.fsm.error_information.clone() {
                    let err = ServiceError::Protocol(info.clone());
                    return self.settle_failure(err, info).await;
                }
            }
        }
    }

    async fn settle_failure(&mut self, err: ServiceError, info: ProtocolError) -> Result<()> {
        if let Err(fail_err) = self.fsm.fail(info.clone()).await {
            error!(error = %fail_err, "could not checkpoint errored state");
        }
        let consent_id = self.fsm.data.request.consent_id.clone();
        let destination = self.fsm.data.request.participant_id.clone();
        if let Err(notify_err) = self
            .env
            .outbound
            .put_consents_error(&consent_id, &destination, &info)
            .await
        {
            error!(consent_id, error = %notify_err, "could not notify DFSP of registration failure");
        }
        Err(err)
    }

    /// Abort a pending transition; a checkpoint failure here is logged and
    /// swallowed so it cannot mask the step error being propagated.
    async fn abort_logged(
        &mut self,
        transition: crate::fsm::PendingTransition<RegisterConsentState>,
    ) {
        let name = transition.name();
        if let Err(err) = self.fsm.abort(transition).await {
            error!(transition = name, error = %err, "could not checkpoint aborted transition");
        }
    }

    // ==== Steps ====

    async fn step_verify_consent(&mut self) -> Result<()> {
        let transition = self.fsm.begin("verifyConsent")?;

        let request = &self.fsm.data.request;
        let outcome = async {
            let payload =
                ChallengePayload::new(&request.consent_id, request.scopes.clone());
            let challenge = derive_challenge_base64(&payload)?;

            let bypass = self
                .env
                .config
                .demo_override_credential_ids
                .contains(&request.credential.id);
            if bypass {
                warn!(
                    consent_id = %request.consent_id,
                    credential_id = %request.credential.id,
                    "DEMO OVERRIDE: skipping attestation verification for allow-listed credential"
                );
                return Ok((challenge, DEMO_PLACEHOLDER_PEM.to_string(), 0));
            }

            let verified = verify_attestation(
                &request.credential,
                &AttestationExpectations {
                    challenge: challenge.clone(),
                    origin: None,
                    require_user_verification: self.env.config.require_user_verification,
                },
            )?;
            Ok((challenge, verified.public_key_pem, verified.signature_counter))
        }
        .await;

        match outcome {
            Ok((challenge, pem, counter)) => {
                self.fsm.data.derived_challenge = Some(challenge);
                self.fsm.data.credential_public_key_pem = Some(pem);
                self.fsm.data.credential_counter = Some(counter);
                self.fsm.commit(transition).await
            }
            Err(err) => {
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }

    async fn step_store_consent(&mut self) -> Result<()> {
        let transition = self.fsm.begin("storeConsent")?;

        let outcome = async {
            let data = &self.fsm.data;
            let request = &data.request;
            // Both fields are written by verifyConsent; a checkpoint in this
            // state without them is corrupt.
            let (challenge, pem) = match (&data.derived_challenge, &data.credential_public_key_pem)
            {
                (Some(challenge), Some(pem)) => (challenge.clone(), pem.clone()),
                _ => {
                    return Err(ServiceError::InvalidStateTransition(
                        "storeConsent requires verifyConsent output".to_string(),
                    ));
                }
            };
            let consent = Consent {
                id: request.consent_id.clone(),
                participant_id: request.participant_id.clone(),
                status: ConsentStatus::Issued,
                credential_type: CredentialType::Fido,
                credential_status: CredentialStatus::Verified,
                credential_id: request.credential.id.clone(),
                credential_challenge: challenge,
                credential_payload: pem,
                credential_counter: data.credential_counter.unwrap_or(0),
                revoked_at: None,
            };
            let scopes: Vec<Scope> = request
                .scopes
                .iter()
                .map(|s| Scope {
                    consent_id: request.consent_id.clone(),
                    address: s.address.clone(),
                    actions: s.actions.clone(),
                })
                .collect();
            self.env.repository.insert(&consent, &scopes).await
        }
        .await;

        match outcome {
            Ok(()) => self.fsm.commit(transition).await,
            Err(err) => {
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }

    async fn step_register_authoritative_source(&mut self) -> Result<()> {
        let transition = self.fsm.begin("registerAuthoritativeSourceWithALS")?;

        let consent_id = self.fsm.data.request.consent_id.clone();
        let channel = registry_reply_channel(&consent_id);
        let outbound = self.env.outbound.clone();
        let timeout = Duration::from_secs(self.env.config.register_timeout_seconds);

        let outcome = deferred_job(self.env.pubsub.clone(), &channel)
            .init(|_channel| async move { outbound.post_participant("CONSENT", &consent_id).await })
            .job(|message: crate::pubsub::NotificationMessage| async move {
                // A registry error is recorded, not thrown: the machine still
                // reaches RegisteredAsAuthoritativeSource and run() settles it.
                match message.get("errorInformation") {
                    Some(raw) => {
                        let info: ProtocolError = serde_json::from_value(raw.clone())?;
                        Ok(Some(info))
                    }
                    None => Ok(None),
                }
            })
            .wait(timeout)
            .await;

        match outcome {
            Ok(registry_error) => {
                if let Some(info) = registry_error {
                    warn!(
                        consent_id = %self.fsm.data.request.consent_id,
                        code = %info.error_code,
                        "ALS registry rejected authoritative-source registration"
                    );
                    self.fsm.error_information = Some(info);
                }
                self.fsm.commit(transition).await
            }
            Err(err) => {
                self.abort_logged(transition).await;
                Err(err)
            }
        }
    }

    async fn step_send_callback(&mut self) -> Result<()> {
        let transition = self.fsm.begin("sendConsentCallbackToDFSP")?;

        let request = &self.fsm.data.request;
        let payload = serde_json::json!({
            "scopes": request.scopes,
            "credential": {
                "credentialType": CredentialType::Fido,
                "status": CredentialStatus::Verified,
                "fidoPayload": request.credential,
            },
        });

        let result = self
            .env
            .outbound
            .put_consents(&request.consent_id, &request.participant_id, &payload)
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
