//! Consent Workflows
//!
//! The two durable state machines this service runs:
//!
//! - [`register_consent`]: account linking. Verify a FIDO attestation,
//!   persist the consent, claim authoritative-source status at the ALS,
//!   notify the DFSP.
//! - [`verify_transaction`]: transaction authorization. Load the consent,
//!   verify the signed assertion, notify the DFSP.
//!
//! Each workflow wraps a [`PersistentFsm`](crate::fsm::PersistentFsm) and
//! drives one transition per `run()` loop iteration, so a process crash
//! resumes from the last committed checkpoint.

pub mod register_consent;
pub mod verify_transaction;


use std::sync::Arc;

use crate::config::WorkflowConfig;
use crate::consent::ConsentRepository;
use crate::kvs::KvClient;
use crate::outbound::OutboundClient;
use crate::pubsub::PubSubChannel;

pub use register_consent::{RegisterConsentRequest, RegisterConsentWorkflow};
pub use verify_transaction::{VerifyTransactionRequest, VerifyTransactionWorkflow};

/// Everything a workflow needs from the outside world, bundled once at
/// bootstrap and cloned per workflow instance.
#[derive(Clone)]
pub struct WorkflowEnv {
    pub kvs: KvClient,
    pub repository: Arc<dyn ConsentRepository>,
    pub pubsub: Arc<PubSubChannel>,
    pub outbound: Arc<dyn OutboundClient>,
    pub config: WorkflowConfig,
}
