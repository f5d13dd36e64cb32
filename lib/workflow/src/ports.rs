//! Traits the workflow service depends on.
//!
//! These abstractions let the service be tested without Postgres or a sidecar
//! while the server wires in the real implementations.

use crate::error::{GatewayError, StoreError};
use crate::model::{
    AccessHistoryEntry, ExecutionState, ExecutionStatus, Workflow, WorkflowSummary,
};
use crate::query::WorkflowQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdesk_core::WorkflowId;
use rootcause::Report;
use serde_json::Value as JsonValue;

/// Which parts of a workflow a save writes.
///
/// Both scopes write only the user-editable columns and `updated_at`.
/// Execution columns go through [`WorkflowStore::save_execution`] and the
/// access columns through [`WorkflowStore::record_access`], so a save never
/// reverts a concurrent write to either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveScope {
    /// Editable columns only; node and edge rows are untouched.
    Record,
    /// Editable columns plus a full replacement of node and edge rows.
    RecordAndGraph,
}

/// Precondition checked against the stored execution columns before
/// [`WorkflowStore::save_execution`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionGuard {
    /// No execution may be running. Used to start one.
    Idle,
    /// The execution that started at `started_at` must still be running.
    Running {
        started_at: Option<DateTime<Utc>>,
    },
}

impl ExecutionGuard {
    /// Returns true if the stored execution columns satisfy the guard.
    #[must_use]
    pub fn holds(&self, status: ExecutionStatus, last_executed_at: Option<DateTime<Utc>>) -> bool {
        match self {
            Self::Idle => status != ExecutionStatus::Running,
            Self::Running { started_at } => {
                status == ExecutionStatus::Running && last_executed_at == *started_at
            }
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The workflow does not exist.
    NotFound,
    /// The guard did not hold; nothing was written.
    Conflict,
}

/// Persistence for workflow records and their rows.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts a new workflow with its nodes and edges.
    async fn insert(&self, workflow: &Workflow) -> Result<(), Report<StoreError>>;

    /// Loads a workflow with its nodes and edges.
    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, Report<StoreError>>;

    /// Returns one page of summaries and the total number of matches.
    async fn list(
        &self,
        query: &WorkflowQuery,
    ) -> Result<(Vec<WorkflowSummary>, u64), Report<StoreError>>;

    /// Writes a workflow. Returns `false` if it no longer exists.
    async fn save(&self, workflow: &Workflow, scope: SaveScope)
    -> Result<bool, Report<StoreError>>;

    /// Writes only the execution columns, atomically with checking `guard`.
    async fn save_execution(
        &self,
        id: WorkflowId,
        execution: &ExecutionState,
        guard: ExecutionGuard,
    ) -> Result<WriteOutcome, Report<StoreError>>;

    /// Appends an access entry and sets `last_accessed_*`.
    ///
    /// Returns the resulting history, or `None` if the workflow is gone.
    async fn record_access(
        &self,
        id: WorkflowId,
        entry: &AccessHistoryEntry,
    ) -> Result<Option<Vec<AccessHistoryEntry>>, Report<StoreError>>;

    /// Deletes a workflow and its rows. Returns `false` if it did not exist.
    async fn delete(&self, id: WorkflowId) -> Result<bool, Report<StoreError>>;
}

/// Key/value state store used as a read-through cache.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, Report<GatewayError>>;
    async fn save(&self, key: &str, value: JsonValue) -> Result<(), Report<GatewayError>>;
    async fn delete(&self, key: &str) -> Result<(), Report<GatewayError>>;
}

/// Publishes lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), Report<GatewayError>>;
}

/// Invokes a method on another service by app id.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(
        &self,
        app_id: &str,
        method: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, Report<GatewayError>>;
}
