//! auth-consent - Third-Party Payment Authorization Core
//!
//! The consent-authorization core of a third-party payment authorization
//! service: FIDO credential registration (account linking) and transaction
//! verification, driven by durable state machines over a key-value store,
//! with a pub/sub channel bridging asynchronous registry callbacks.
//!
//! # Modules
//!
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber / rolling file setup
//! - [`errors`] - service errors + peer-facing protocol error information
//! - [`challenge`] - canonical-JSON challenge derivation
//! - [`consent`] - Consent/Scope model and repository boundary
//! - [`credential`] - attestation, assertion, and raw-signature verification
//! - [`kvs`] - key-value store client (Redis + memory)
//! - [`pubsub`] - publish/subscribe channel (Redis + loopback transports)
//! - [`deferred_job`] - subscribe-then-trigger request/reply coordinator
//! - [`fsm`] - persistent finite-state-machine base
//! - [`outbound`] - DFSP / ALS protocol client
//! - [`workflows`] - the register-consent and verify-transaction machines

pub mod challenge;
pub mod config;
pub mod consent;
pub mod credential;
pub mod deferred_job;
pub mod errors;
pub mod fsm;
pub mod kvs;
pub mod logging;
pub mod outbound;
pub mod pubsub;
pub mod workflows;

// Convenient re-exports at crate root
pub use challenge::{ChallengePayload, ChallengeScope, derive_challenge_base64, derive_challenge_hex};
pub use consent::{Consent, ConsentRepository, ConsentStatus, CredentialStatus, Scope};
pub use errors::{ProtocolError, Result, ServiceError};
pub use fsm::{PersistentFsm, StateTag, Transition, WORKFLOW_SCHEMA_VERSION};
pub use kvs::{KvClient, MemoryKvStore, RedisKvStore};
pub use outbound::{HttpOutboundClient, OutboundClient};
pub use pubsub::{NotificationMessage, PubSubChannel, RedisPubSubTransport};
pub use workflows::{
    RegisterConsentRequest, RegisterConsentWorkflow, VerifyTransactionRequest,
    VerifyTransactionWorkflow, WorkflowEnv,
};
