//! Workflow records and the service that manages them.
//!
//! This crate provides:
//!
//! - **Model**: workflow records, node/edge rows and their label enums
//! - **Requests**: create/update requests, listing queries and paging
//! - **Events**: lifecycle events published on every change
//! - **Execution**: bookkeeping for runs forwarded to the execution service
//! - **Ports**: store, state store, publisher and invoker traits
//! - **Service**: [`WorkflowService`], which wires the ports together

pub mod error;
pub mod event;
pub mod execution;
pub mod graph;
pub mod memory;
pub mod model;
pub mod ports;
pub mod query;
pub mod request;
pub mod service;

pub use error::{GatewayError, GraphError, StoreError, ValidationError, WorkflowError};
pub use event::{EXECUTION_STATUS_TOPIC, EventKind, WorkflowEvent};
pub use execution::{
    EventOutcome, ExecutionAccepted, ExecutionConfig, ExecutionMode, ExecutionStatusEvent,
    IgnoreReason,
};
pub use graph::{
    EdgeConfig, EdgeDraft, GraphDraft, NodeConfig, NodeDraft, Position, WorkflowEdge,
    WorkflowNode,
};
pub use model::{
    AccessAction, AccessHistoryEntry, ConsentStatus, DataClassification, ExecutionState,
    ExecutionStatus, JsonMap, Workflow, WorkflowStatus, WorkflowSummary,
};
pub use ports::{
    EventPublisher, ExecutionGuard, SaveScope, ServiceInvoker, StateStore, WorkflowStore,
    WriteOutcome,
};
pub use query::{SortField, SortOrder, WorkflowPage, WorkflowQuery};
pub use request::{CreateWorkflow, UpdateWorkflow};
pub use service::{ServiceSettings, WorkflowService};
