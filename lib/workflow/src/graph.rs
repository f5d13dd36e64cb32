//! Node and edge rows, and the editor drafts they are built from.
//!
//! The editor names nodes with its own string keys and wires edges between
//! those keys. [`GraphDraft::resolve`] swaps the keys for freshly generated
//! row ids. The only check made is referential: every edge endpoint must name
//! a node in the same draft. Nodes and edges are configuration, never
//! interpreted here.

use crate::error::GraphError;
use crate::model::JsonMap;
use chrono::{DateTime, Utc};
use flowdesk_core::{EdgeId, NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canvas position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Opaque node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<JsonMap>,
}

/// Opaque edge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// A node row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub workflow_id: WorkflowId,
    /// Node kind as named by the editor (e.g. `task`, `research_agent`).
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub config: NodeConfig,
    pub position: Option<Position>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An edge row connecting two nodes of the same workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: EdgeId,
    pub workflow_id: WorkflowId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    #[serde(default)]
    pub config: EdgeConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node as submitted by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    /// Editor-side key, unique within the draft.
    pub key: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default)]
    pub position: Option<Position>,
}

/// An edge as submitted by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDraft {
    /// Editor-side key, used only in error messages.
    #[serde(default)]
    pub key: Option<String>,
    /// Key of the source node.
    pub source: String,
    /// Key of the target node.
    pub target: String,
    #[serde(default)]
    pub config: EdgeConfig,
}

/// A full replacement set of nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDraft {
    #[serde(default)]
    pub nodes: Vec<NodeDraft>,
    #[serde(default)]
    pub edges: Vec<EdgeDraft>,
}

impl GraphDraft {
    /// Builds row values for `workflow_id`, assigning new ids.
    ///
    /// # Errors
    ///
    /// Returns an error on blank or duplicate node keys, or when an edge
    /// names a node key that is not part of the draft.
    pub fn resolve(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<(Vec<WorkflowNode>, Vec<WorkflowEdge>), GraphError> {
        let now = Utc::now();
        let mut ids: HashMap<&str, NodeId> = HashMap::with_capacity(self.nodes.len());
        let mut nodes = Vec::with_capacity(self.nodes.len());

        for draft in &self.nodes {
            let key = draft.key.trim();
            if key.is_empty() {
                return Err(GraphError::BlankNodeKey);
            }
            if draft.node_type.trim().is_empty() {
                return Err(GraphError::BlankNodeType {
                    key: key.to_string(),
                });
            }
            let id = NodeId::new();
            if ids.insert(key, id).is_some() {
                return Err(GraphError::DuplicateNodeKey {
                    key: key.to_string(),
                });
            }
            nodes.push(WorkflowNode {
                id,
                workflow_id,
                node_type: draft.node_type.clone(),
                name: draft.name.clone(),
                config: draft.config.clone(),
                position: draft.position,
                created_at: now,
                updated_at: now,
            });
        }

        let lookup = |edge: &EdgeDraft, endpoint: &str| {
            ids.get(endpoint.trim())
                .copied()
                .ok_or_else(|| GraphError::UnknownEdgeEndpoint {
                    edge: edge
                        .key
                        .clone()
                        .unwrap_or_else(|| format!("{}->{}", edge.source, edge.target)),
                    endpoint: endpoint.to_string(),
                })
        };

        let mut edges = Vec::with_capacity(self.edges.len());
        for draft in &self.edges {
            edges.push(WorkflowEdge {
                id: EdgeId::new(),
                workflow_id,
                source_id: lookup(draft, &draft.source)?,
                target_id: lookup(draft, &draft.target)?,
                config: draft.config.clone(),
                created_at: now,
                updated_at: now,
            });
        }

        Ok((nodes, edges))
    }
}
