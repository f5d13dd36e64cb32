//! Core identifiers and error handling for flowdesk.
//!
//! This crate provides the strongly-typed ids and the `Result` alias shared
//! by the workflow service, the sidecar client and the server binary.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EdgeId, ExecutionId, NodeId, ParseIdError, UserId, WorkflowId};
