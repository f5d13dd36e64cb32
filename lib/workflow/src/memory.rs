//! In-memory implementations of the ports.
//!
//! Used by the service and server tests, and handy for running the server
//! without a database or sidecar. Failure toggles let tests exercise the
//! degraded paths.

use crate::error::{GatewayError, StoreError};
use crate::model::{AccessHistoryEntry, ExecutionState, Workflow, WorkflowSummary};
use crate::ports::{
    EventPublisher, ExecutionGuard, SaveScope, ServiceInvoker, StateStore, WorkflowStore,
    WriteOutcome,
};
use crate::query::{SortField, SortOrder, WorkflowQuery};
use async_trait::async_trait;
use flowdesk_core::WorkflowId;
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Workflow store backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    failing: AtomicBool,
}

impl InMemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Returns a copy of the stored workflow.
    #[must_use]
    pub fn get(&self, id: WorkflowId) -> Option<Workflow> {
        lock(&self.workflows).get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.workflows).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), Report<StoreError>> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable {
                details: "in-memory store set to fail".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn matches(workflow: &Workflow, query: &WorkflowQuery) -> bool {
    if query.status.is_some_and(|s| s != workflow.status) {
        return false;
    }
    if query
        .data_region
        .as_deref()
        .is_some_and(|r| r != workflow.data_region)
    {
        return false;
    }
    if query
        .data_classification
        .is_some_and(|c| c != workflow.data_classification)
    {
        return false;
    }
    if query.created_by.is_some_and(|u| u != workflow.created_by) {
        return false;
    }
    if let Some(term) = query.search_term() {
        let term = term.to_lowercase();
        let in_name = workflow.name.to_lowercase().contains(&term);
        let in_description = workflow
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(&term));
        if !in_name && !in_description {
            return false;
        }
    }
    true
}

fn compare(a: &Workflow, b: &Workflow, sort: SortField) -> Ordering {
    let primary = match sort {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Name => a.name.cmp(&b.name),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> Result<(), Report<StoreError>> {
        self.check()?;
        let mut workflows = lock(&self.workflows);
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Query {
                details: format!("duplicate workflow id {}", workflow.id),
            }
            .into());
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, Report<StoreError>> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn list(
        &self,
        query: &WorkflowQuery,
    ) -> Result<(Vec<WorkflowSummary>, u64), Report<StoreError>> {
        self.check()?;
        let workflows = lock(&self.workflows);
        let mut matching: Vec<&Workflow> =
            workflows.values().filter(|w| matches(w, query)).collect();
        matching.sort_by(|a, b| {
            let ord = compare(a, b, query.sort);
            match query.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit() as usize)
            .map(Workflow::summary)
            .collect();
        Ok((items, total))
    }

    async fn save(
        &self,
        workflow: &Workflow,
        scope: SaveScope,
    ) -> Result<bool, Report<StoreError>> {
        self.check()?;
        let mut workflows = lock(&self.workflows);
        let Some(existing) = workflows.get_mut(&workflow.id) else {
            return Ok(false);
        };
        existing.name.clone_from(&workflow.name);
        existing.description.clone_from(&workflow.description);
        existing.status = workflow.status;
        existing.metadata.clone_from(&workflow.metadata);
        existing.data_classification = workflow.data_classification;
        existing.consent_status = workflow.consent_status;
        existing.data_region.clone_from(&workflow.data_region);
        existing.cross_border_allowed = workflow.cross_border_allowed;
        existing.updated_at = workflow.updated_at;
        if scope == SaveScope::RecordAndGraph {
            existing.nodes.clone_from(&workflow.nodes);
            existing.edges.clone_from(&workflow.edges);
        }
        Ok(true)
    }

    async fn save_execution(
        &self,
        id: WorkflowId,
        execution: &ExecutionState,
        guard: ExecutionGuard,
    ) -> Result<WriteOutcome, Report<StoreError>> {
        self.check()?;
        let mut workflows = lock(&self.workflows);
        let Some(existing) = workflows.get_mut(&id) else {
            return Ok(WriteOutcome::NotFound);
        };
        let current = &existing.execution;
        if !guard.holds(current.execution_status, current.last_executed_at) {
            return Ok(WriteOutcome::Conflict);
        }
        existing.execution = execution.clone();
        Ok(WriteOutcome::Written)
    }

    async fn record_access(
        &self,
        id: WorkflowId,
        entry: &AccessHistoryEntry,
    ) -> Result<Option<Vec<AccessHistoryEntry>>, Report<StoreError>> {
        self.check()?;
        let mut workflows = lock(&self.workflows);
        Ok(workflows.get_mut(&id).map(|existing| {
            existing.record_access(entry.clone());
            existing.access_history.clone()
        }))
    }

    async fn delete(&self, id: WorkflowId) -> Result<bool, Report<StoreError>> {
        self.check()?;
        Ok(lock(&self.workflows).remove(&id).is_some())
    }
}

/// State store backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<String, JsonValue>>,
    failing: AtomicBool,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<JsonValue> {
        lock(&self.entries).get(key).cloned()
    }

    /// Stores a value directly, bypassing the failure toggle.
    pub fn insert_raw(&self, key: &str, value: JsonValue) {
        lock(&self.entries).insert(key.to_string(), value);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    fn check(&self, operation: &'static str, key: &str) -> Result<(), Report<GatewayError>> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(GatewayError::StateStore {
                operation,
                key: key.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, Report<GatewayError>> {
        self.check("get", key)?;
        Ok(self.get_raw(key))
    }

    async fn save(&self, key: &str, value: JsonValue) -> Result<(), Report<GatewayError>> {
        self.check("save", key)?;
        self.insert_raw(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Report<GatewayError>> {
        self.check("delete", key)?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Publisher that keeps every published event.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, JsonValue)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// All successfully published `(topic, payload)` pairs, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<(String, JsonValue)> {
        lock(&self.published).clone()
    }

    /// Topics of all successfully published events, oldest first.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        lock(&self.published)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), Report<GatewayError>> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(GatewayError::Publish {
                topic: topic.to_string(),
            }
            .into());
        }
        lock(&self.published).push((topic.to_string(), payload));
        Ok(())
    }
}

/// Invoker that records calls and answers with a fixed response.
pub struct RecordingInvoker {
    calls: Mutex<Vec<(String, String, JsonValue)>>,
    response: JsonValue,
    failing: AtomicBool,
}

impl RecordingInvoker {
    #[must_use]
    pub fn new(response: JsonValue) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            response,
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent invocation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// All `(app_id, method, payload)` triples received, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String, JsonValue)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ServiceInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        app_id: &str,
        method: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, Report<GatewayError>> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(GatewayError::Invoke {
                app_id: app_id.to_string(),
                method: method.to_string(),
            }
            .into());
        }
        lock(&self.calls).push((app_id.to_string(), method.to_string(), payload));
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessAction, ExecutionStatus, WorkflowStatus};
    use chrono::Utc;
    use flowdesk_core::UserId;

    fn workflow(name: &str, region: &str) -> Workflow {
        Workflow::new(name.to_string(), region.to_string(), UserId::new())
    }

    #[tokio::test]
    async fn list_filters_and_searches() {
        let store = InMemoryWorkflowStore::new();
        let mut archived = workflow("Quarterly report", "eu-west-1");
        archived.status = WorkflowStatus::Archived;
        let mut described = workflow("Intake", "us-east-1");
        described.description = Some("Handles the REPORT intake".to_string());
        for wf in [archived, described, workflow("Billing", "us-east-1")] {
            store.insert(&wf).await.expect("insert");
        }

        let query = WorkflowQuery {
            search: Some("report".to_string()),
            ..WorkflowQuery::default()
        };
        let (_, total) = store.list(&query).await.expect("list");
        assert_eq!(total, 2);

        let query = WorkflowQuery {
            data_region: Some("us-east-1".to_string()),
            sort: SortField::Name,
            order: SortOrder::Asc,
            ..WorkflowQuery::default()
        };
        let (items, total) = store.list(&query).await.expect("list");
        assert_eq!(total, 2);
        assert_eq!(items[0].name, "Billing");
        assert_eq!(items[1].name, "Intake");
    }

    #[tokio::test]
    async fn record_save_keeps_graph_rows() {
        let store = InMemoryWorkflowStore::new();
        let mut wf = workflow("Graph", "us-east-1");
        let (nodes, edges) = crate::graph::GraphDraft {
            nodes: vec![crate::graph::NodeDraft {
                key: "a".to_string(),
                node_type: "task".to_string(),
                name: "A".to_string(),
                config: Default::default(),
                position: None,
            }],
            edges: Vec::new(),
        }
        .resolve(wf.id)
        .expect("resolve");
        wf.nodes = nodes;
        wf.edges = edges;
        store.insert(&wf).await.expect("insert");

        let mut renamed = wf.clone();
        renamed.name = "Renamed".to_string();
        renamed.nodes.clear();
        assert!(store.save(&renamed, SaveScope::Record).await.expect("save"));

        let stored = store.get(wf.id).expect("stored");
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.nodes.len(), 1);
    }

    #[tokio::test]
    async fn save_leaves_execution_and_access_columns_alone() {
        let store = InMemoryWorkflowStore::new();
        let wf = workflow("Busy", "us-east-1");
        store.insert(&wf).await.expect("insert");

        let stale = wf.clone();
        let user = UserId::new();
        let mut running = wf.execution.clone();
        running.begin(user, Utc::now());
        store
            .save_execution(wf.id, &running, ExecutionGuard::Idle)
            .await
            .expect("begin");
        store
            .record_access(wf.id, &AccessHistoryEntry::now(user, AccessAction::View))
            .await
            .expect("record");

        let mut edited = stale;
        edited.description = Some("edited from an old copy".to_string());
        edited.access_history.clear();
        assert!(store.save(&edited, SaveScope::Record).await.expect("save"));

        let stored = store.get(wf.id).expect("stored");
        assert_eq!(stored.description.as_deref(), Some("edited from an old copy"));
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Running);
        assert_eq!(stored.access_history.len(), 1);
        assert_eq!(stored.last_accessed_by, Some(user));
    }

    #[tokio::test]
    async fn save_execution_checks_guard() {
        let store = InMemoryWorkflowStore::new();
        let wf = workflow("Guarded", "us-east-1");
        store.insert(&wf).await.expect("insert");
        let started = Utc::now();
        let mut running = wf.execution.clone();
        running.begin(UserId::new(), started);

        let first = store
            .save_execution(wf.id, &running, ExecutionGuard::Idle)
            .await
            .expect("begin");
        let second = store
            .save_execution(wf.id, &running, ExecutionGuard::Idle)
            .await
            .expect("begin again");
        assert_eq!(first, WriteOutcome::Written);
        assert_eq!(second, WriteOutcome::Conflict);

        let mut done = running.clone();
        done.execution_status = ExecutionStatus::Completed;
        let other_run = ExecutionGuard::Running {
            started_at: Some(started - chrono::Duration::seconds(5)),
        };
        assert_eq!(
            store.save_execution(wf.id, &done, other_run).await.expect("save"),
            WriteOutcome::Conflict
        );
        let this_run = ExecutionGuard::Running {
            started_at: Some(started),
        };
        assert_eq!(
            store.save_execution(wf.id, &done, this_run).await.expect("save"),
            WriteOutcome::Written
        );
        assert_eq!(
            store.save_execution(wf.id, &running, this_run).await.expect("save"),
            WriteOutcome::Conflict
        );
        assert_eq!(
            store
                .save_execution(WorkflowId::new(), &running, ExecutionGuard::Idle)
                .await
                .expect("save"),
            WriteOutcome::NotFound
        );
        let stored = store.get(wf.id).expect("stored");
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn record_access_on_missing_workflow_returns_none() {
        let store = InMemoryWorkflowStore::new();
        let entry = AccessHistoryEntry::now(UserId::new(), AccessAction::View);
        let history = store
            .record_access(WorkflowId::new(), &entry)
            .await
            .expect("record");
        assert!(history.is_none());
    }

    #[tokio::test]
    async fn failing_store_reports_unavailable() {
        let store = InMemoryWorkflowStore::new();
        store.set_failing(true);
        let err = store.find(WorkflowId::new()).await.expect_err("failing");
        assert!(matches!(
            err.current_context(),
            StoreError::Unavailable { .. }
        ));
    }
}
