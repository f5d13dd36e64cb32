//! Client for the sidecar HTTP API.
//!
//! The workflow service reaches its infrastructure through a local sidecar:
//! a key/value state store used as a cache, a pub/sub broker for lifecycle
//! events, and service invocation for the execution service. This crate
//! implements the workflow ports on top of that API and carries the types
//! the sidecar uses to deliver subscribed events.

mod client;
mod config;
mod error;
mod subscription;

pub use client::SidecarClient;
pub use config::SidecarConfig;
pub use error::SidecarError;
pub use subscription::{CloudEvent, Subscription, TopicEventResponse, TopicEventStatus};
