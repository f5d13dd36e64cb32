//! Startup error types for the server binary.

use std::fmt;

/// Failures that stop the server from starting or keep it from serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// Configuration could not be loaded.
    Config { details: String },
    /// The database could not be reached.
    Database { details: String },
    /// Migrations failed to apply.
    Migration { details: String },
    /// The sidecar client could not be built.
    Sidecar,
    /// The listener could not bind.
    Bind { addr: String, details: String },
    /// The HTTP server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {}", details),
            Self::Database { details } => {
                write!(f, "failed to connect to database: {}", details)
            }
            Self::Migration { details } => write!(f, "failed to run migrations: {}", details),
            Self::Sidecar => write!(f, "failed to create sidecar client"),
            Self::Bind { addr, details } => {
                write!(f, "failed to bind to '{}': {}", addr, details)
            }
            Self::Serve { details } => write!(f, "server error: {}", details),
        }
    }
}

impl std::error::Error for StartupError {}
