//! Sidecar client error types.

use std::fmt;

/// Sidecar client errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarError {
    /// The configured address does not form a valid URL.
    InvalidUrl {
        /// Error details.
        details: String,
    },
    /// The HTTP client could not be built.
    Client {
        /// Error details.
        details: String,
    },
    /// The request could not be sent or the response not read.
    Request {
        /// Target URL.
        url: String,
        /// Error details.
        details: String,
    },
    /// The sidecar answered with a non-success status.
    UnexpectedStatus {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The response body was not valid JSON.
    Decode {
        /// Error details.
        details: String,
    },
}

impl fmt::Display for SidecarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { details } => write!(f, "invalid sidecar url: {}", details),
            Self::Client { details } => write!(f, "failed to build sidecar client: {}", details),
            Self::Request { url, details } => {
                write!(f, "sidecar request to '{}' failed: {}", url, details)
            }
            Self::UnexpectedStatus { url, status, body } => {
                write!(f, "sidecar returned {} for '{}': {}", status, url, body)
            }
            Self::Decode { details } => {
                write!(f, "failed to decode sidecar response: {}", details)
            }
        }
    }
}

impl std::error::Error for SidecarError {}
