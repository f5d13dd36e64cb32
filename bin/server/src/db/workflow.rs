//! Postgres-backed workflow store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdesk_core::{EdgeId, NodeId, WorkflowId};
use flowdesk_workflow::model::ACCESS_HISTORY_LIMIT;
use flowdesk_workflow::{
    AccessHistoryEntry, EdgeConfig, ExecutionGuard, ExecutionState, ExecutionStatus, JsonMap,
    NodeConfig, Position, SaveScope, StoreError, Workflow, WorkflowEdge, WorkflowNode,
    WorkflowQuery, WorkflowStore, WorkflowSummary, WriteOutcome,
};
use rootcause::Report;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, instrument};

const WORKFLOW_COLUMNS: &str = "w.id, w.name, w.description, w.status, w.execution_status, \
     w.current_phase, w.execution_progress, w.last_status_message, w.last_executed_at, \
     w.last_executed_by, w.metadata, w.data_classification, w.consent_status, w.data_region, \
     w.cross_border_allowed, w.created_by, w.created_at, w.updated_at, w.last_accessed_by, \
     w.last_accessed_at, w.access_history";

/// Editable columns only. Execution and access columns have their own writes.
const UPDATE_RECORD: &str = r#"
    UPDATE workflows
    SET name = $2, description = $3, status = $4, metadata = $5,
        data_classification = $6, consent_status = $7, data_region = $8,
        cross_border_allowed = $9, updated_at = $10
    WHERE id = $1
"#;

/// Row and rows of one workflow are read from a single snapshot.
const SNAPSHOT_ISOLATION: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ";

/// Maps a driver error onto the store's error vocabulary.
fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable {
            details: err.to_string(),
        },
        other => StoreError::Query {
            details: other.to_string(),
        },
    }
}

fn corrupt(what: &str, value: &str, err: impl Display) -> StoreError {
    StoreError::Corrupt {
        details: format!("invalid {} '{}': {}", what, value, err),
    }
}

fn parse<T>(what: &str, value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| corrupt(what, value, e))
}

fn parse_opt<T>(what: &str, value: Option<&str>) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value.map(|v| parse(what, v)).transpose()
}

fn decode_json<T: serde::de::DeserializeOwned>(
    what: &str,
    value: JsonValue,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        details: format!("invalid {}: {}", what, e),
    })
}

fn encode_json(value: &impl serde::Serialize) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Query {
        details: format!("failed to encode json column: {}", e),
    })
}

fn metadata_from_column(value: Option<JsonValue>) -> Result<Option<JsonMap>, StoreError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Object(map)) => Ok(Some(map)),
        Some(other) => Err(StoreError::Corrupt {
            details: format!("metadata is not an object: {}", other),
        }),
    }
}

/// `%term%` for ILIKE with wildcard characters in `term` escaped.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    execution_status: String,
    current_phase: Option<String>,
    execution_progress: Option<f64>,
    last_status_message: Option<String>,
    last_executed_at: Option<DateTime<Utc>>,
    last_executed_by: Option<String>,
    metadata: Option<JsonValue>,
    data_classification: String,
    consent_status: Option<String>,
    data_region: String,
    cross_border_allowed: bool,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_accessed_by: Option<String>,
    last_accessed_at: Option<DateTime<Utc>>,
    access_history: JsonValue,
}

impl WorkflowRow {
    /// Converts to a record without nodes or edges.
    fn try_into_record(self) -> Result<Workflow, StoreError> {
        Ok(Workflow {
            id: parse("workflow id", &self.id)?,
            name: self.name,
            description: self.description,
            status: parse("status", &self.status)?,
            execution: ExecutionState {
                execution_status: parse("execution status", &self.execution_status)?,
                current_phase: self.current_phase,
                execution_progress: self.execution_progress,
                last_status_message: self.last_status_message,
                last_executed_at: self.last_executed_at,
                last_executed_by: parse_opt("user id", self.last_executed_by.as_deref())?,
            },
            metadata: metadata_from_column(self.metadata)?,
            data_classification: parse("data classification", &self.data_classification)?,
            consent_status: parse_opt("consent status", self.consent_status.as_deref())?,
            data_region: self.data_region,
            cross_border_allowed: self.cross_border_allowed,
            created_by: parse("user id", &self.created_by)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_by: parse_opt("user id", self.last_accessed_by.as_deref())?,
            last_accessed_at: self.last_accessed_at,
            access_history: decode_json("access history", self.access_history)?,
            nodes: Vec::new(),
            edges: Vec::new(),
        })
    }
}

/// Row type for listings: workflow columns plus child row counts.
#[derive(FromRow)]
struct WorkflowSummaryRow {
    #[sqlx(flatten)]
    workflow: WorkflowRow,
    node_count: i64,
    edge_count: i64,
}

#[derive(FromRow)]
struct ExecutionLockRow {
    execution_status: String,
    last_executed_at: Option<DateTime<Utc>>,
}

impl ExecutionLockRow {
    fn satisfies(&self, guard: ExecutionGuard) -> Result<bool, StoreError> {
        let status: ExecutionStatus = parse("execution status", &self.execution_status)?;
        Ok(guard.holds(status, self.last_executed_at))
    }
}

impl WorkflowSummaryRow {
    fn try_into_summary(self) -> Result<WorkflowSummary, StoreError> {
        let mut summary = self.workflow.try_into_record()?.summary();
        summary.node_count = u64::try_from(self.node_count).unwrap_or_default();
        summary.edge_count = u64::try_from(self.edge_count).unwrap_or_default();
        Ok(summary)
    }
}

#[derive(FromRow)]
struct NodeRow {
    id: String,
    workflow_id: String,
    node_type: String,
    name: String,
    config: JsonValue,
    position: Option<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NodeRow {
    fn try_into_node(self) -> Result<WorkflowNode, StoreError> {
        let position: Option<Position> = match self.position {
            None | Some(JsonValue::Null) => None,
            Some(value) => Some(decode_json("node position", value)?),
        };
        Ok(WorkflowNode {
            id: parse::<NodeId>("node id", &self.id)?,
            workflow_id: parse("workflow id", &self.workflow_id)?,
            node_type: self.node_type,
            name: self.name,
            config: decode_json::<NodeConfig>("node config", self.config)?,
            position,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EdgeRow {
    id: String,
    workflow_id: String,
    source_id: String,
    target_id: String,
    config: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EdgeRow {
    fn try_into_edge(self) -> Result<WorkflowEdge, StoreError> {
        Ok(WorkflowEdge {
            id: parse::<EdgeId>("edge id", &self.id)?,
            workflow_id: parse("workflow id", &self.workflow_id)?,
            source_id: parse("node id", &self.source_id)?,
            target_id: parse("node id", &self.target_id)?,
            config: decode_json::<EdgeConfig>("edge config", self.config)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Appends the `WHERE` clause for a listing query.
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &WorkflowQuery) {
    builder.push(" WHERE TRUE");
    if let Some(status) = query.status {
        builder.push(" AND w.status = ").push_bind(status.as_str());
    }
    if let Some(region) = &query.data_region {
        builder.push(" AND w.data_region = ").push_bind(region.clone());
    }
    if let Some(classification) = query.data_classification {
        builder
            .push(" AND w.data_classification = ")
            .push_bind(classification.as_str());
    }
    if let Some(user) = query.created_by {
        builder
            .push(" AND w.created_by = ")
            .push_bind(user.to_string());
    }
    if let Some(term) = query.search_term() {
        let pattern = like_pattern(term);
        builder
            .push(" AND (w.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR w.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Workflow store over a Postgres pool.
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        workflow: &Workflow,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(UPDATE_RECORD)
            .bind(workflow.id.to_string())
            .bind(&workflow.name)
            .bind(&workflow.description)
            .bind(workflow.status.as_str())
            .bind(workflow.metadata.clone().map(JsonValue::Object))
            .bind(workflow.data_classification.as_str())
            .bind(workflow.consent_status.map(|c| c.as_str()))
            .bind(&workflow.data_region)
            .bind(workflow.cross_border_allowed)
            .bind(workflow.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn write_graph(
        tx: &mut Transaction<'_, Postgres>,
        workflow: &Workflow,
    ) -> Result<(), StoreError> {
        for node in &workflow.nodes {
            sqlx::query(
                r#"
                INSERT INTO workflow_nodes
                    (id, workflow_id, node_type, name, config, position, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(node.id.to_string())
            .bind(workflow.id.to_string())
            .bind(&node.node_type)
            .bind(&node.name)
            .bind(encode_json(&node.config)?)
            .bind(node.position.as_ref().map(encode_json).transpose()?)
            .bind(node.created_at)
            .bind(node.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(store_error)?;
        }

        for edge in &workflow.edges {
            sqlx::query(
                r#"
                INSERT INTO workflow_edges
                    (id, workflow_id, source_id, target_id, config, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(edge.id.to_string())
            .bind(workflow.id.to_string())
            .bind(edge.source_id.to_string())
            .bind(edge.target_id.to_string())
            .bind(encode_json(&edge.config)?)
            .bind(edge.created_at)
            .bind(edge.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(store_error)?;
        }

        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn insert(&self, workflow: &Workflow) -> Result<(), Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let execution = &workflow.execution;

        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, name, description, status, execution_status, current_phase,
                 execution_progress, last_status_message, last_executed_at, last_executed_by,
                 metadata, data_classification, consent_status, data_region,
                 cross_border_allowed, created_by, created_at, updated_at, last_accessed_by,
                 last_accessed_at, access_history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.as_str())
        .bind(execution.execution_status.as_str())
        .bind(&execution.current_phase)
        .bind(execution.execution_progress)
        .bind(&execution.last_status_message)
        .bind(execution.last_executed_at)
        .bind(execution.last_executed_by.map(|u| u.to_string()))
        .bind(workflow.metadata.clone().map(JsonValue::Object))
        .bind(workflow.data_classification.as_str())
        .bind(workflow.consent_status.map(|c| c.as_str()))
        .bind(&workflow.data_region)
        .bind(workflow.cross_border_allowed)
        .bind(workflow.created_by.to_string())
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.last_accessed_by.map(|u| u.to_string()))
        .bind(workflow.last_accessed_at)
        .bind(encode_json(&workflow.access_history)?)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        Self::write_graph(&mut tx, workflow).await?;
        tx.commit().await.map_err(store_error)?;

        debug!(
            nodes = workflow.nodes.len(),
            edges = workflow.edges.len(),
            "workflow inserted"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query(SNAPSHOT_ISOLATION)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {} FROM workflows w WHERE w.id = $1",
            WORKFLOW_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(store_error)?;
            return Ok(None);
        };
        let mut workflow = row.try_into_record()?;

        let nodes: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_type, name, config, position, created_at, updated_at
            FROM workflow_nodes
            WHERE workflow_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        let edges: Vec<EdgeRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, source_id, target_id, config, created_at, updated_at
            FROM workflow_edges
            WHERE workflow_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        workflow.nodes = nodes
            .into_iter()
            .map(NodeRow::try_into_node)
            .collect::<Result<_, _>>()?;
        workflow.edges = edges
            .into_iter()
            .map(EdgeRow::try_into_edge)
            .collect::<Result<_, _>>()?;
        Ok(Some(workflow))
    }

    #[instrument(skip(self, query))]
    async fn list(
        &self,
        query: &WorkflowQuery,
    ) -> Result<(Vec<WorkflowSummary>, u64), Report<StoreError>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM workflows w");
        push_filters(&mut count, query);
        let (total,): (i64,) = count
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT ");
        select.push(WORKFLOW_COLUMNS).push(
            ", (SELECT COUNT(*) FROM workflow_nodes n WHERE n.workflow_id = w.id) AS node_count, \
             (SELECT COUNT(*) FROM workflow_edges e WHERE e.workflow_id = w.id) AS edge_count \
             FROM workflows w",
        );
        push_filters(&mut select, query);
        // Column and keyword come from closed enums, never from input.
        select
            .push(" ORDER BY w.")
            .push(query.sort.column())
            .push(" ")
            .push(query.order.keyword())
            .push(", w.id ")
            .push(query.order.keyword())
            .push(" LIMIT ")
            .push_bind(i64::from(query.limit()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows: Vec<WorkflowSummaryRow> = select
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let items = rows
            .into_iter()
            .map(WorkflowSummaryRow::try_into_summary)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, u64::try_from(total).unwrap_or_default()))
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn save(
        &self,
        workflow: &Workflow,
        scope: SaveScope,
    ) -> Result<bool, Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        if !Self::write_record(&mut tx, workflow).await? {
            tx.rollback().await.map_err(store_error)?;
            return Ok(false);
        }

        if scope == SaveScope::RecordAndGraph {
            // Edges first: they reference nodes.
            sqlx::query("DELETE FROM workflow_edges WHERE workflow_id = $1")
                .bind(workflow.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
            sqlx::query("DELETE FROM workflow_nodes WHERE workflow_id = $1")
                .bind(workflow.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
            Self::write_graph(&mut tx, workflow).await?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(true)
    }

    #[instrument(skip(self, execution))]
    async fn save_execution(
        &self,
        id: WorkflowId,
        execution: &ExecutionState,
        guard: ExecutionGuard,
    ) -> Result<WriteOutcome, Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // The row lock holds off other execution writes until commit.
        let current: Option<ExecutionLockRow> = sqlx::query_as(
            "SELECT execution_status, last_executed_at FROM workflows WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(current) = current else {
            tx.rollback().await.map_err(store_error)?;
            return Ok(WriteOutcome::NotFound);
        };
        if !current.satisfies(guard)? {
            tx.rollback().await.map_err(store_error)?;
            debug!(?guard, stored = %current.execution_status, "execution write conflicts");
            return Ok(WriteOutcome::Conflict);
        }

        sqlx::query(
            r#"
            UPDATE workflows
            SET execution_status = $2, current_phase = $3, execution_progress = $4,
                last_status_message = $5, last_executed_at = $6, last_executed_by = $7
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(execution.execution_status.as_str())
        .bind(&execution.current_phase)
        .bind(execution.execution_progress)
        .bind(&execution.last_status_message)
        .bind(execution.last_executed_at)
        .bind(execution.last_executed_by.map(|u| u.to_string()))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(WriteOutcome::Written)
    }

    #[instrument(skip(self, entry), fields(user = %entry.user_id, action = %entry.action))]
    async fn record_access(
        &self,
        id: WorkflowId,
        entry: &AccessHistoryEntry,
    ) -> Result<Option<Vec<AccessHistoryEntry>>, Report<StoreError>> {
        // Appends and keeps only the newest entries in one statement.
        let row: Option<(JsonValue,)> = sqlx::query_as(
            r#"
            UPDATE workflows
            SET last_accessed_by = $2,
                last_accessed_at = $3,
                access_history = (
                    SELECT COALESCE(jsonb_agg(recent.entry ORDER BY recent.ord), '[]'::jsonb)
                    FROM (
                        SELECT t.entry, t.ord
                        FROM jsonb_array_elements(access_history || $4::jsonb)
                            WITH ORDINALITY AS t(entry, ord)
                        ORDER BY t.ord DESC
                        LIMIT $5
                    ) recent
                )
            WHERE id = $1
            RETURNING access_history
            "#,
        )
        .bind(id.to_string())
        .bind(entry.user_id.to_string())
        .bind(entry.timestamp)
        .bind(encode_json(&[entry])?)
        .bind(i64::try_from(ACCESS_HISTORY_LIMIT).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some((history,)) => Ok(Some(decode_json("access history", history)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: WorkflowId) -> Result<bool, Report<StoreError>> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected() > 0)
    }
}
