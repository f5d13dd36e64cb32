//! Lifecycle events published when workflows change.

use crate::model::{ExecutionStatus, Workflow, WorkflowStatus};
use chrono::{DateTime, Utc};
use flowdesk_core::{UserId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Topic for execution progress reported back by the execution service.
pub const EXECUTION_STATUS_TOPIC: &str = "workflow.execution.status";

/// Kind of lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    ExecutionStarted,
    ExecutionUpdated,
}

impl EventKind {
    /// Pub/sub topic the event is published on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Created => "workflow.created",
            Self::Updated => "workflow.updated",
            Self::Deleted => "workflow.deleted",
            Self::ExecutionStarted => "workflow.execution.started",
            Self::ExecutionUpdated => "workflow.execution.updated",
        }
    }
}

/// Payload published on every lifecycle topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub workflow_id: WorkflowId,
    /// User who caused the change; absent for changes reported by services.
    pub actor: Option<UserId>,
    pub status: Option<WorkflowStatus>,
    pub execution_status: Option<ExecutionStatus>,
    pub occurred_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Builds an event describing the current state of `workflow`.
    #[must_use]
    pub fn for_workflow(kind: EventKind, workflow: &Workflow, actor: Option<UserId>) -> Self {
        Self {
            kind,
            workflow_id: workflow.id,
            actor,
            status: Some(workflow.status),
            execution_status: Some(workflow.execution.execution_status),
            occurred_at: Utc::now(),
        }
    }

    /// Builds a deletion event; nothing but the id survives a delete.
    #[must_use]
    pub fn deleted(workflow_id: WorkflowId, actor: UserId) -> Self {
        Self {
            kind: EventKind::Deleted,
            workflow_id,
            actor: Some(actor),
            status: None,
            execution_status: None,
            occurred_at: Utc::now(),
        }
    }
}
