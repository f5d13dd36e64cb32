//! flowdesk workflow service process.
//!
//! Wires the workflow service to Postgres and the sidecar, and exposes the
//! routes the sidecar calls back into.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
