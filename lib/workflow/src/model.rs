//! Workflow record and its label enums.

use crate::graph::{WorkflowEdge, WorkflowNode};
use chrono::{DateTime, Utc};
use flowdesk_core::{UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// JSON object used for free-form metadata blobs.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Maximum number of entries kept in a workflow's access history.
pub const ACCESS_HISTORY_LIMIT: usize = 100;

/// Error returned when a stored label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLabelError {
    /// The enum being parsed.
    pub kind: &'static str,
    /// The rejected value.
    pub value: String,
}

impl fmt::Display for ParseLabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseLabelError {}

/// Generates a snake_case label enum with `as_str`, `Display` and `FromStr`.
macro_rules! label_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the label stored in the database and sent on the wire.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseLabelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ParseLabelError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

label_enum!(
    /// Lifecycle status of a workflow definition.
    WorkflowStatus {
        /// Newly created, still being edited.
        Draft => "draft",
        /// Published and executable.
        Active => "active",
        /// Retired but kept for reference.
        Archived => "archived",
        /// Soft-deleted.
        Deleted => "deleted",
    }
);

impl WorkflowStatus {
    /// Returns true if executions may be requested in this status.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }
}

label_enum!(
    /// Status of the most recent execution handed to the execution service.
    ExecutionStatus {
        /// Never executed.
        NotStarted => "not_started",
        /// Forwarded and in progress.
        Running => "running",
        /// Finished successfully.
        Completed => "completed",
        /// Finished with error, or could not be dispatched.
        Failed => "failed",
        /// Cancelled by the execution service.
        Cancelled => "cancelled",
    }
);

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

label_enum!(
    /// Sensitivity classification of the data a workflow handles.
    DataClassification {
        Public => "public",
        Internal => "internal",
        Confidential => "confidential",
        Restricted => "restricted",
    }
);

impl Default for DataClassification {
    fn default() -> Self {
        Self::Internal
    }
}

label_enum!(
    /// Data-subject consent state recorded against a workflow.
    ConsentStatus {
        NotRequired => "not_required",
        Pending => "pending",
        Approved => "approved",
        Denied => "denied",
    }
);

label_enum!(
    /// What a user did when an access history entry was recorded.
    AccessAction {
        View => "view",
        Update => "update",
        Execute => "execute",
    }
);

/// One entry of a workflow's access audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessHistoryEntry {
    /// Who accessed the workflow.
    pub user_id: UserId,
    /// What they did.
    pub action: AccessAction,
    /// When.
    pub timestamp: DateTime<Utc>,
}

impl AccessHistoryEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn now(user_id: UserId, action: AccessAction) -> Self {
        Self {
            user_id,
            action,
            timestamp: Utc::now(),
        }
    }
}

/// Appends an entry, dropping the oldest ones beyond [`ACCESS_HISTORY_LIMIT`].
pub fn push_access_entry(history: &mut Vec<AccessHistoryEntry>, entry: AccessHistoryEntry) {
    history.push(entry);
    if history.len() > ACCESS_HISTORY_LIMIT {
        let excess = history.len() - ACCESS_HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// Execution bookkeeping columns of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Status of the latest execution.
    pub execution_status: ExecutionStatus,
    /// Phase reported by the execution service.
    pub current_phase: Option<String>,
    /// Progress in `0.0..=1.0`.
    pub execution_progress: Option<f64>,
    /// Last human-readable status line.
    pub last_status_message: Option<String>,
    /// When the latest execution was requested.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Who requested the latest execution.
    pub last_executed_by: Option<UserId>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            execution_status: ExecutionStatus::NotStarted,
            current_phase: None,
            execution_progress: None,
            last_status_message: None,
            last_executed_at: None,
            last_executed_by: None,
        }
    }
}

/// A persisted workflow definition with its node and edge rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Execution bookkeeping.
    #[serde(flatten)]
    pub execution: ExecutionState,
    /// Free-form metadata (version, tags, category, ...).
    pub metadata: Option<JsonMap>,
    /// Data sensitivity.
    pub data_classification: DataClassification,
    /// Consent state, if tracked.
    pub consent_status: Option<ConsentStatus>,
    /// Region the workflow's data must reside in.
    pub data_region: String,
    /// Whether data may leave `data_region`.
    pub cross_border_allowed: bool,
    /// Creator.
    pub created_by: UserId,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When last updated.
    pub updated_at: DateTime<Utc>,
    /// Most recent accessor.
    pub last_accessed_by: Option<UserId>,
    /// Most recent access time.
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Bounded audit trail, oldest first.
    #[serde(default)]
    pub access_history: Vec<AccessHistoryEntry>,
    /// Node rows.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// Edge rows.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl Workflow {
    /// Creates a draft workflow with no nodes or edges.
    #[must_use]
    pub fn new(name: String, data_region: String, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name,
            description: None,
            status: WorkflowStatus::Draft,
            execution: ExecutionState::default(),
            metadata: None,
            data_classification: DataClassification::default(),
            consent_status: None,
            data_region,
            cross_border_allowed: false,
            created_by,
            created_at: now,
            updated_at: now,
            last_accessed_by: None,
            last_accessed_at: None,
            access_history: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Records an access, updating `last_accessed_*` and the audit trail.
    pub fn record_access(&mut self, entry: AccessHistoryEntry) {
        self.last_accessed_by = Some(entry.user_id);
        self.last_accessed_at = Some(entry.timestamp);
        push_access_entry(&mut self.access_history, entry);
    }

    /// Returns the listing view of this workflow.
    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            status: self.status,
            execution: self.execution.clone(),
            metadata: self.metadata.clone(),
            data_classification: self.data_classification,
            consent_status: self.consent_status,
            data_region: self.data_region.clone(),
            cross_border_allowed: self.cross_border_allowed,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_by: self.last_accessed_by,
            last_accessed_at: self.last_accessed_at,
            node_count: self.nodes.len() as u64,
            edge_count: self.edges.len() as u64,
        }
    }
}

/// Listing view of a workflow: scalar columns plus child row counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Execution bookkeeping.
    #[serde(flatten)]
    pub execution: ExecutionState,
    /// Metadata.
    pub metadata: Option<JsonMap>,
    /// Data sensitivity.
    pub data_classification: DataClassification,
    /// Consent state.
    pub consent_status: Option<ConsentStatus>,
    /// Data region.
    pub data_region: String,
    /// Cross-border flag.
    pub cross_border_allowed: bool,
    /// Creator.
    pub created_by: UserId,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When last updated.
    pub updated_at: DateTime<Utc>,
    /// Most recent accessor.
    pub last_accessed_by: Option<UserId>,
    /// Most recent access time.
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Number of node rows.
    pub node_count: u64,
    /// Number of edge rows.
    pub edge_count: u64,
}
