//! Create and update requests for workflows.

use crate::error::ValidationError;
use crate::graph::GraphDraft;
use crate::model::{ConsentStatus, DataClassification, JsonMap, Workflow, WorkflowStatus};
use chrono::Utc;
use flowdesk_core::UserId;
use serde::{Deserialize, Serialize};

/// Maximum length of a workflow name, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a data region label, in characters.
pub const MAX_REGION_LEN: usize = 50;

/// Request to create a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub data_classification: Option<DataClassification>,
    pub data_region: String,
    #[serde(default)]
    pub cross_border_allowed: Option<bool>,
    #[serde(default)]
    pub graph: Option<GraphDraft>,
}

impl CreateWorkflow {
    /// Validates the request fields.
    ///
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        validate_region(&self.data_region)
    }

    /// Builds the draft record described by this request.
    ///
    /// The graph is not resolved here; see [`GraphDraft::resolve`].
    #[must_use]
    pub fn into_workflow(self, created_by: UserId) -> Workflow {
        let mut workflow = Workflow::new(
            self.name.trim().to_string(),
            self.data_region.trim().to_string(),
            created_by,
        );
        workflow.description = self.description;
        workflow.metadata = self.metadata;
        workflow.data_classification = self.data_classification.unwrap_or_default();
        workflow.cross_border_allowed = self.cross_border_allowed.unwrap_or(false);
        workflow
    }
}

/// Partial update of a workflow. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateWorkflow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub data_classification: Option<DataClassification>,
    #[serde(default)]
    pub consent_status: Option<ConsentStatus>,
    #[serde(default)]
    pub data_region: Option<String>,
    #[serde(default)]
    pub cross_border_allowed: Option<bool>,
    /// Full replacement of nodes and edges.
    #[serde(default)]
    pub graph: Option<GraphDraft>,
}

impl UpdateWorkflow {
    /// Validates the fields that are present.
    ///
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(region) = &self.data_region {
            validate_region(region)?;
        }
        Ok(())
    }

    /// Returns true if the update touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the scalar fields to `workflow` and bumps `updated_at`.
    ///
    /// The graph is left to the caller.
    pub fn apply_to(&self, workflow: &mut Workflow) {
        if let Some(name) = &self.name {
            workflow.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            workflow.description = Some(description.clone());
        }
        if let Some(status) = self.status {
            workflow.status = status;
        }
        if let Some(metadata) = &self.metadata {
            workflow.metadata = Some(metadata.clone());
        }
        if let Some(classification) = self.data_classification {
            workflow.data_classification = classification;
        }
        if let Some(consent) = self.consent_status {
            workflow.consent_status = Some(consent);
        }
        if let Some(region) = &self.data_region {
            workflow.data_region = region.trim().to_string();
        }
        if let Some(allowed) = self.cross_border_allowed {
            workflow.cross_border_allowed = allowed;
        }
        workflow.updated_at = Utc::now();
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be blank"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

fn validate_region(region: &str) -> Result<(), ValidationError> {
    let region = region.trim();
    if region.is_empty() {
        return Err(ValidationError::new("data_region", "must not be blank"));
    }
    if region.chars().count() > MAX_REGION_LEN {
        return Err(ValidationError::new(
            "data_region",
            format!("must be at most {MAX_REGION_LEN} characters"),
        ));
    }
    Ok(())
}
