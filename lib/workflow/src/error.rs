//! Error types for the workflow crate.
//!
//! Errors are layered with rootcause:
//! - `ValidationError` / `GraphError`: request checks, raised before any I/O
//! - `StoreError` / `GatewayError`: failures reported by the ports
//! - `WorkflowError`: service-level context wrapped around the above

use flowdesk_core::WorkflowId;
use std::fmt;

/// A request field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The offending field.
    pub field: &'static str,
    /// Why it was rejected.
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// A node/edge draft could not be turned into rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node was submitted without a key.
    BlankNodeKey,
    /// A node was submitted without a type.
    BlankNodeType { key: String },
    /// Two nodes share the same key.
    DuplicateNodeKey { key: String },
    /// An edge names a node key that is not in the draft.
    UnknownEdgeEndpoint { edge: String, endpoint: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlankNodeKey => write!(f, "node key must not be blank"),
            Self::BlankNodeType { key } => write!(f, "node '{key}' has no type"),
            Self::DuplicateNodeKey { key } => write!(f, "duplicate node key '{key}'"),
            Self::UnknownEdgeEndpoint { edge, endpoint } => {
                write!(f, "edge '{edge}' references unknown node '{endpoint}'")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Failures reported by a [`WorkflowStore`](crate::ports::WorkflowStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing database could not be reached.
    Unavailable { details: String },
    /// A query failed.
    Query { details: String },
    /// A stored row could not be decoded.
    Corrupt { details: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "workflow store unavailable: {details}"),
            Self::Query { details } => write!(f, "workflow store query failed: {details}"),
            Self::Corrupt { details } => write!(f, "corrupt workflow row: {details}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Failures reported by the sidecar-facing ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// State store operation failed.
    StateStore { operation: &'static str, key: String },
    /// Event could not be published.
    Publish { topic: String },
    /// Remote method invocation failed.
    Invoke { app_id: String, method: String },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateStore { operation, key } => {
                write!(f, "state store {operation} failed for key '{key}'")
            }
            Self::Publish { topic } => write!(f, "failed to publish to topic '{topic}'"),
            Self::Invoke { app_id, method } => {
                write!(f, "failed to invoke '{method}' on '{app_id}'")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// High-level workflow service errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow does not exist.
    NotFound { id: WorkflowId },
    /// The request was rejected before touching storage.
    Invalid { reason: String },
    /// Workflow is in a state that does not allow the operation.
    InvalidState {
        id: WorkflowId,
        state: String,
        required: String,
    },
    /// The store failed (use as context wrapper).
    Store { operation: &'static str },
    /// The execution service could not be reached (use as context wrapper).
    ExecutionDispatch { id: WorkflowId, app_id: String },
}

impl WorkflowError {
    /// Returns true if the error is caused by the caller rather than the system.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Invalid { .. } | Self::InvalidState { .. }
        )
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "workflow '{id}' not found"),
            Self::Invalid { reason } => write!(f, "invalid workflow request: {reason}"),
            Self::InvalidState {
                id,
                state,
                required,
            } => write!(
                f,
                "workflow '{id}' is in state '{state}', requires '{required}'"
            ),
            Self::Store { operation } => write!(f, "workflow store {operation} failed"),
            Self::ExecutionDispatch { id, app_id } => {
                write!(f, "failed to dispatch workflow '{id}' to '{app_id}'")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<ValidationError> for WorkflowError {
    fn from(e: ValidationError) -> Self {
        Self::Invalid {
            reason: e.to_string(),
        }
    }
}

impl From<GraphError> for WorkflowError {
    fn from(e: GraphError) -> Self {
        Self::Invalid {
            reason: e.to_string(),
        }
    }
}
