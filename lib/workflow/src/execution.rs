//! Execution bookkeeping for workflows forwarded to the execution service.
//!
//! This crate never runs a workflow. It records that a run was requested,
//! forwards the record, and folds the progress events sent back by the
//! execution service into [`ExecutionState`].

use crate::model::{ExecutionState, ExecutionStatus, Workflow};
use chrono::{DateTime, Utc};
use flowdesk_core::{ExecutionId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Phase recorded when an execution is first forwarded.
pub const INITIAL_PHASE: &str = "initializing";

/// How the caller wants the execution service to run the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    #[default]
    Async,
}

/// Options forwarded verbatim to the execution service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default)]
    pub notify_on_completion: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

/// Body sent to the execution service.
#[derive(Debug, Serialize)]
pub struct ExecutionDispatch<'a> {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow: &'a Workflow,
    pub config: &'a ExecutionConfig,
}

/// Returned once the execution service has accepted a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAccepted {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    /// Acknowledgement text reported by the execution service, if any.
    pub message: Option<String>,
}

/// Progress report sent back by the execution service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatusEvent {
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What happened to a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event changed the execution state.
    Applied,
    /// The event was dropped without changes.
    Ignored(IgnoreReason),
}

/// Why a status event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No execution is running.
    NotRunning,
    /// The event predates the current execution.
    Stale,
    /// `not_started` is never a valid report.
    InvalidStatus,
    /// Another writer changed the execution between reading and writing it.
    Superseded,
}

fn clamp_progress(progress: f64) -> Option<f64> {
    progress.is_finite().then(|| progress.clamp(0.0, 1.0))
}

impl ExecutionState {
    /// Returns true if an execution is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.execution_status == ExecutionStatus::Running
    }

    /// Marks a new execution as forwarded by `user` at `at`.
    pub fn begin(&mut self, user: UserId, at: DateTime<Utc>) {
        self.execution_status = ExecutionStatus::Running;
        self.current_phase = Some(INITIAL_PHASE.to_string());
        self.execution_progress = Some(0.0);
        self.last_status_message = Some("Starting workflow execution".to_string());
        self.last_executed_at = Some(at);
        self.last_executed_by = Some(user);
    }

    /// Marks the current execution as failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.execution_status = ExecutionStatus::Failed;
        self.last_status_message = Some(message.into());
    }

    /// Folds a progress event into the state.
    ///
    /// Events are applied only while an execution is running and only if they
    /// are not older than the start of that execution.
    pub fn apply(&mut self, event: &ExecutionStatusEvent) -> EventOutcome {
        if event.status == ExecutionStatus::NotStarted {
            return EventOutcome::Ignored(IgnoreReason::InvalidStatus);
        }
        if !self.is_running() {
            return EventOutcome::Ignored(IgnoreReason::NotRunning);
        }
        if self
            .last_executed_at
            .is_some_and(|started| event.timestamp < started)
        {
            return EventOutcome::Ignored(IgnoreReason::Stale);
        }

        self.execution_status = event.status;
        if let Some(phase) = &event.phase {
            self.current_phase = Some(phase.clone());
        }
        if let Some(progress) = event.progress.and_then(clamp_progress) {
            self.execution_progress = Some(progress);
        }
        if event.status == ExecutionStatus::Completed {
            self.execution_progress = Some(1.0);
        }
        if let Some(message) = &event.message {
            self.last_status_message = Some(message.clone());
        }
        EventOutcome::Applied
    }
}
