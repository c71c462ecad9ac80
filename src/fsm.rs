//! Persistent Finite-State-Machine Base
//!
//! Generic durable state machine bound to the Key-Value Store. Workflow data
//! plus the current state are checkpointed under the workflow's correlation
//! key after every transition, success or failure, so a crashed process can
//! resume where it stopped without re-running completed side effects.
//!
//! States are plain enums and legal transitions a static `{name, from, to}`
//! table per workflow; handlers are ordinary async methods on the concrete
//! workflow driving `begin` / `commit` / `abort`. The `fail` transition is
//! universal: it is accepted from any state, even while another transition is
//! pending, and lands in the terminal errored state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::errors::{ProtocolError, Result, ServiceError};
use crate::kvs::KvClient;

/// Persisted blob layout version. Bumped on incompatible shape changes;
/// loaders reject versions they do not understand.
pub const WORKFLOW_SCHEMA_VERSION: u32 = 1;

/// Contract a workflow state enum must satisfy.
pub trait StateTag:
    Copy + Eq + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// State a fresh machine starts in.
    fn initial() -> Self;
    /// Universal terminal error state.
    fn errored() -> Self;
    /// True for states with no outgoing transitions.
    fn is_terminal(&self) -> bool;
}

/// One row of a workflow's static transition table.
pub struct Transition<S: 'static> {
    pub name: &'static str,
    pub from: S,
    pub to: S,
}

/// The durable checkpoint written to the Key-Value Store.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowEnvelope<S, D> {
    schema_version: u32,
    current_state: S,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_information: Option<ProtocolError>,
    data: D,
}

/// Token handed out by [`PersistentFsm::begin`]; consumed by `commit`.
#[must_use = "a begun transition must be committed or aborted"]
#[derive(Debug)]
pub struct PendingTransition<S> {
    name: &'static str,
    to: S,
}

impl<S: Copy> PendingTransition<S> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Durable state machine instance bound to one correlation key.
pub struct PersistentFsm<S: StateTag, D> {
    key: String,
    kvs: KvClient,
    transitions: &'static [Transition<S>],
    state: S,
    pub data: D,
    /// Error surfaced by a sub-step, carried in the checkpoint. Some steps
    /// record an error here without throwing; callers must check it.
    pub error_information: Option<ProtocolError>,
    pending: Option<&'static str>,
}

impl<S: StateTag, D> fmt::Debug for PersistentFsm<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentFsm")
            .field("key", &self.key)
            .field("state", &format_args!("{}", self.state))
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<S, D> PersistentFsm<S, D>
where
    S: StateTag,
    D: Serialize + DeserializeOwned + Send,
{
    /// Start a fresh machine in the initial state and write the first
    /// checkpoint.
    pub async fn create(
        kvs: KvClient,
        key: &str,
        transitions: &'static [Transition<S>],
        data: D,
    ) -> Result<Self> {
        let fsm = Self {
            key: key.to_string(),
            kvs,
            transitions,
            state: S::initial(),
            data,
            error_information: None,
            pending: None,
        };
        fsm.save().await?;
        Ok(fsm)
    }

    /// Reconstruct a machine from its persisted checkpoint. Places the
    /// machine directly into the stored state; no transition side effects
    /// are re-run.
    pub async fn load(
        kvs: KvClient,
        key: &str,
        transitions: &'static [Transition<S>],
    ) -> Result<Self> {
        let envelope: WorkflowEnvelope<S, D> = kvs
            .get(key)
            .await?
            .ok_or_else(|| ServiceError::NotFound(key.to_string()))?;
        if envelope.schema_version != WORKFLOW_SCHEMA_VERSION {
            return Err(ServiceError::UnsupportedSchemaVersion(
                envelope.schema_version,
            ));
        }
        debug!(key, state = %envelope.current_state, "workflow resumed from store");
        Ok(Self {
            key: key.to_string(),
            kvs,
            transitions,
            state: envelope.current_state,
            data: envelope.data,
            error_information: envelope.error_information,
            pending: None,
        })
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Begin a named transition: enforces the single-pending-transition
    /// guard and validates the from-state against the transition table.
    pub fn begin(&mut self, name: &'static str) -> Result<PendingTransition<S>> {
        if let Some(pending) = self.pending {
            warn!(key = %self.key, pending, attempted = name, "transition already pending");
            return Err(ServiceError::PendingTransition(name.to_string()));
        }
        let row = self
            .transitions
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                ServiceError::InvalidStateTransition(format!("unknown transition '{}'", name))
            })?;
        if row.from != self.state {
            return Err(ServiceError::InvalidStateTransition(format!(
                "transition '{}' requires state {}, machine is in {}",
                name, row.from, self.state
            )));
        }
        self.pending = Some(name);
        Ok(PendingTransition {
            name,
            to: row.to,
        })
    }

    /// Complete a begun transition: advance the state and checkpoint.
    pub async fn commit(&mut self, transition: PendingTransition<S>) -> Result<()> {
        debug_assert_eq!(self.pending, Some(transition.name));
        self.state = transition.to;
        self.pending = None;
        debug!(key = %self.key, state = %self.state, transition = transition.name, "transition committed");
        self.save().await
    }

    /// Abandon a begun transition after its handler failed. The state does
    /// not advance but the checkpoint is still written: persistence happens
    /// after every transition, success or failure.
    pub async fn abort(&mut self, transition: PendingTransition<S>) -> Result<()> {
        debug_assert_eq!(self.pending, Some(transition.name));
        self.pending = None;
        warn!(key = %self.key, state = %self.state, transition = transition.name, "transition aborted");
        self.save().await
    }

    /// The universal error transition: allowed from any state, including
    /// while another transition is pending, carrying the triggering error
    /// into the terminal checkpoint.
    pub async fn fail(&mut self, error: ProtocolError) -> Result<()> {
        self.pending = None;
        self.error_information = Some(error);
        self.state = S::errored();
        warn!(key = %self.key, "workflow moved to errored state");
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let envelope = WorkflowEnvelope {
            schema_version: WORKFLOW_SCHEMA_VERSION,
            current_state: self.state,
            error_information: self.error_information.clone(),
            data: &self.data,
        };
        self.kvs.set(&self.key, &envelope).await
    }
}
