//! Database access for the workflow service.

pub mod workflow;

pub use workflow::PgWorkflowStore;
