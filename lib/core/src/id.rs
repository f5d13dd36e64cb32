//! Strongly-typed ID types for workflow records and their rows.
//!
//! All IDs are ULIDs, so they sort by creation time. The display form carries
//! a short type prefix (`wf_01H...`), and parsing accepts either form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Splits an optional `prefix_` off `s` and parses the rest as a ULID.
fn parse_ulid(s: &str, prefix: &str, id_type: &'static str) -> Result<Ulid, ParseIdError> {
    let bare = s
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(s);
    Ulid::from_string(bare).map_err(|e| ParseIdError {
        id_type,
        reason: e.to_string(),
    })
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Type prefix of the display form.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh id.
            #[allow(clippy::new_without_default)]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_ulid(s, Self::PREFIX, stringify!($name)).map(Self)
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of the user acting on a workflow.
    UserId => "usr"
);

define_id!(
    /// Identifier of a workflow record.
    WorkflowId => "wf"
);

define_id!(
    /// Identifier of a node row belonging to a workflow.
    NodeId => "node"
);

define_id!(
    /// Identifier of an edge row belonging to a workflow.
    EdgeId => "edge"
);

define_id!(
    /// Identifier handed back when an execution request is forwarded.
    ExecutionId => "exec"
);
