//! Workflow service: CRUD over workflow records with read-through caching,
//! lifecycle events and execution forwarding.
//!
//! The store is the source of truth. The state store and the publisher are
//! best effort: when they fail the operation still succeeds and the failure
//! is logged.

use crate::error::WorkflowError;
use crate::event::{EventKind, WorkflowEvent};
use crate::execution::{
    EventOutcome, ExecutionAccepted, ExecutionConfig, ExecutionDispatch, ExecutionStatusEvent,
    IgnoreReason,
};
use crate::model::{AccessAction, AccessHistoryEntry, ExecutionStatus, Workflow};
use crate::ports::{
    EventPublisher, ExecutionGuard, SaveScope, ServiceInvoker, StateStore, WorkflowStore,
    WriteOutcome,
};
use crate::query::{WorkflowPage, WorkflowQuery};
use crate::request::{CreateWorkflow, UpdateWorkflow};
use chrono::{SubsecRound, Utc};
use flowdesk_core::{ExecutionId, Result, UserId, WorkflowId};
use rootcause::prelude::ResultExt;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Tunables for [`WorkflowService`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceSettings {
    /// Whether reads go through the state store.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Prefix prepended to workflow ids to form state store keys.
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,
    /// App id of the execution service.
    #[serde(default = "default_execution_app_id")]
    pub execution_app_id: String,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_key_prefix() -> String {
    "workflow:".to_string()
}

fn default_execution_app_id() -> String {
    "crew-service".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_enabled: default_cache_enabled(),
            cache_key_prefix: default_cache_key_prefix(),
            execution_app_id: default_execution_app_id(),
        }
    }
}

/// Entry point for all workflow operations.
#[derive(Clone)]
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    cache: Arc<dyn StateStore>,
    events: Arc<dyn EventPublisher>,
    invoker: Arc<dyn ServiceInvoker>,
    settings: ServiceSettings,
}

impl WorkflowService {
    /// Creates a service over the given ports.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        cache: Arc<dyn StateStore>,
        events: Arc<dyn EventPublisher>,
        invoker: Arc<dyn ServiceInvoker>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            invoker,
            settings,
        }
    }

    /// Returns the settings in use.
    #[must_use]
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Creates a draft workflow owned by `user`.
    ///
    /// # Errors
    ///
    /// `Invalid` for bad fields or graph drafts, `Store` if the insert fails.
    #[instrument(skip(self, request), fields(user = %user))]
    pub async fn create(
        &self,
        mut request: CreateWorkflow,
        user: UserId,
    ) -> Result<Workflow, WorkflowError> {
        request.validate().map_err(WorkflowError::from)?;
        let graph = request.graph.take();
        let mut workflow = request.into_workflow(user);
        if let Some(graph) = graph {
            let (nodes, edges) = graph.resolve(workflow.id).map_err(WorkflowError::from)?;
            workflow.nodes = nodes;
            workflow.edges = edges;
        }

        self.store
            .insert(&workflow)
            .await
            .context(WorkflowError::Store { operation: "insert" })?;

        info!(
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            edges = workflow.edges.len(),
            "workflow created"
        );
        self.cache_put(&workflow).await;
        self.publish(WorkflowEvent::for_workflow(
            EventKind::Created,
            &workflow,
            Some(user),
        ))
        .await;
        Ok(workflow)
    }

    /// Loads a workflow and records that `user` viewed it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the workflow does not exist, `Store` on storage failure.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn find_by_id(
        &self,
        id: WorkflowId,
        user: UserId,
    ) -> Result<Workflow, WorkflowError> {
        let mut workflow = match self.cache_get(id).await {
            Some(workflow) => workflow,
            None => {
                let workflow = self.load(id).await?;
                self.cache_put(&workflow).await;
                workflow
            }
        };

        self.record_access(&mut workflow, AccessHistoryEntry::now(user, AccessAction::View))
            .await?;
        Ok(workflow)
    }

    /// Lists workflows matching `query`.
    ///
    /// # Errors
    ///
    /// `Store` on storage failure.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &WorkflowQuery) -> Result<WorkflowPage, WorkflowError> {
        let (items, total) = self
            .store
            .list(query)
            .await
            .context(WorkflowError::Store { operation: "list" })?;
        debug!(returned = items.len(), total, "listed workflows");
        Ok(WorkflowPage {
            items,
            total,
            page: query.page(),
            limit: query.limit(),
        })
    }

    /// Applies a partial update on behalf of `user`.
    ///
    /// # Errors
    ///
    /// `Invalid` for bad or empty requests, `NotFound`, or `Store`.
    #[instrument(skip(self, request), fields(user = %user))]
    pub async fn update(
        &self,
        id: WorkflowId,
        request: UpdateWorkflow,
        user: UserId,
    ) -> Result<Workflow, WorkflowError> {
        request.validate().map_err(WorkflowError::from)?;
        if request.is_empty() {
            return Err(WorkflowError::Invalid {
                reason: "update contains no changes".to_string(),
            }
            .into());
        }

        let mut workflow = self.load(id).await?;
        request.apply_to(&mut workflow);
        let scope = match &request.graph {
            Some(graph) => {
                let (nodes, edges) = graph.resolve(id).map_err(WorkflowError::from)?;
                workflow.nodes = nodes;
                workflow.edges = edges;
                SaveScope::RecordAndGraph
            }
            None => SaveScope::Record,
        };
        let saved = self
            .store
            .save(&workflow, scope)
            .await
            .context(WorkflowError::Store { operation: "save" })?;
        if !saved {
            self.cache_evict(id).await;
            return Err(WorkflowError::NotFound { id }.into());
        }

        self.record_access(&mut workflow, AccessHistoryEntry::now(user, AccessAction::Update))
            .await?;
        // Execution progress may have been written while this update was in
        // flight; return and cache what is stored.
        let workflow = self.load(id).await?;

        info!(workflow_id = %id, ?scope, "workflow updated");
        self.cache_put(&workflow).await;
        self.publish(WorkflowEvent::for_workflow(
            EventKind::Updated,
            &workflow,
            Some(user),
        ))
        .await;
        Ok(workflow)
    }

    /// Deletes a workflow and its nodes and edges.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Store`.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn delete(&self, id: WorkflowId, user: UserId) -> Result<(), WorkflowError> {
        let deleted = self
            .store
            .delete(id)
            .await
            .context(WorkflowError::Store { operation: "delete" })?;
        self.cache_evict(id).await;
        if !deleted {
            return Err(WorkflowError::NotFound { id }.into());
        }

        info!(workflow_id = %id, "workflow deleted");
        self.publish(WorkflowEvent::deleted(id, user)).await;
        Ok(())
    }

    /// Marks a workflow as running and forwards it to the execution service.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidState` for archived/deleted workflows or when an
    /// execution is already running, `Store`, or `ExecutionDispatch` when the
    /// execution service rejects the call (the workflow is then left `failed`).
    #[instrument(skip(self, config), fields(user = %user))]
    pub async fn execute(
        &self,
        id: WorkflowId,
        config: ExecutionConfig,
        user: UserId,
    ) -> Result<ExecutionAccepted, WorkflowError> {
        let mut workflow = self.load(id).await?;
        if !workflow.status.is_executable() {
            return Err(WorkflowError::InvalidState {
                id,
                state: workflow.status.to_string(),
                required: "draft or active".to_string(),
            }
            .into());
        }
        if workflow.execution.is_running() {
            return Err(WorkflowError::InvalidState {
                id,
                state: workflow.execution.execution_status.to_string(),
                required: "no execution in progress".to_string(),
            }
            .into());
        }

        // Stored timestamps keep microseconds; the start time identifies the
        // execution in later guarded writes.
        let started_at = Utc::now().trunc_subsecs(6);
        workflow.execution.begin(user, started_at);
        let begun = self
            .store
            .save_execution(id, &workflow.execution, ExecutionGuard::Idle)
            .await
            .context(WorkflowError::Store {
                operation: "save_execution",
            })?;
        match begun {
            WriteOutcome::Written => {}
            WriteOutcome::NotFound => {
                self.cache_evict(id).await;
                return Err(WorkflowError::NotFound { id }.into());
            }
            WriteOutcome::Conflict => {
                self.cache_evict(id).await;
                return Err(WorkflowError::InvalidState {
                    id,
                    state: ExecutionStatus::Running.to_string(),
                    required: "no execution in progress".to_string(),
                }
                .into());
            }
        }
        self.record_access(
            &mut workflow,
            AccessHistoryEntry {
                user_id: user,
                action: AccessAction::Execute,
                timestamp: started_at,
            },
        )
        .await?;

        let app_id = self.settings.execution_app_id.clone();
        let execution_id = ExecutionId::new();
        let payload = serde_json::to_value(ExecutionDispatch {
            execution_id,
            workflow_id: id,
            workflow: &workflow,
            config: &config,
        })
        .map_err(|e| WorkflowError::Invalid {
            reason: format!("workflow could not be serialized: {e}"),
        })?;
        let method = format!("workflows/{id}/execute");

        match self.invoker.invoke(&app_id, &method, payload).await {
            Ok(response) => {
                info!(workflow_id = %id, %execution_id, app_id = %app_id, "execution dispatched");
                self.cache_put(&workflow).await;
                self.publish(WorkflowEvent::for_workflow(
                    EventKind::ExecutionStarted,
                    &workflow,
                    Some(user),
                ))
                .await;
                Ok(ExecutionAccepted {
                    execution_id,
                    workflow_id: id,
                    status: workflow.execution.execution_status,
                    message: acknowledgement(&response),
                })
            }
            Err(report) => {
                warn!(workflow_id = %id, app_id = %app_id, error = %report, "execution dispatch failed");
                workflow
                    .execution
                    .fail(format!("Execution dispatch failed: {}", report.current_context()));
                let guard = ExecutionGuard::Running {
                    started_at: Some(started_at),
                };
                let recorded = match self
                    .store
                    .save_execution(id, &workflow.execution, guard)
                    .await
                {
                    Ok(WriteOutcome::Written) => true,
                    Ok(outcome) => {
                        warn!(workflow_id = %id, ?outcome, "execution changed before dispatch failure was recorded");
                        false
                    }
                    Err(e) => {
                        warn!(workflow_id = %id, error = %e, "failed to record dispatch failure");
                        false
                    }
                };
                if recorded {
                    self.cache_put(&workflow).await;
                } else {
                    self.cache_evict(id).await;
                }
                self.publish(WorkflowEvent::for_workflow(
                    EventKind::ExecutionUpdated,
                    &workflow,
                    Some(user),
                ))
                .await;
                Err(report.context(WorkflowError::ExecutionDispatch { id, app_id }))
            }
        }
    }

    /// Folds a progress report from the execution service into the workflow.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Store`. Reports that do not apply are not errors; they
    /// come back as [`EventOutcome::Ignored`].
    #[instrument(skip(self, event), fields(workflow_id = %event.workflow_id, status = %event.status))]
    pub async fn apply_execution_event(
        &self,
        event: &ExecutionStatusEvent,
    ) -> Result<EventOutcome, WorkflowError> {
        let id = event.workflow_id;
        let mut workflow = self.load(id).await?;
        let guard = ExecutionGuard::Running {
            started_at: workflow.execution.last_executed_at,
        };
        let outcome = workflow.execution.apply(event);
        if let EventOutcome::Ignored(reason) = outcome {
            debug!(?reason, "ignoring execution status event");
            return Ok(outcome);
        }

        let written = self
            .store
            .save_execution(id, &workflow.execution, guard)
            .await
            .context(WorkflowError::Store {
                operation: "save_execution",
            })?;
        match written {
            WriteOutcome::Written => {}
            WriteOutcome::NotFound => {
                self.cache_evict(id).await;
                return Err(WorkflowError::NotFound { id }.into());
            }
            WriteOutcome::Conflict => {
                debug!("execution changed while the event was applied, ignoring");
                self.cache_evict(id).await;
                return Ok(EventOutcome::Ignored(IgnoreReason::Superseded));
            }
        }

        debug!(
            phase = workflow.execution.current_phase.as_deref(),
            progress = workflow.execution.execution_progress,
            "execution status applied"
        );
        self.cache_put(&workflow).await;
        self.publish(WorkflowEvent::for_workflow(
            EventKind::ExecutionUpdated,
            &workflow,
            None,
        ))
        .await;
        Ok(outcome)
    }

    async fn load(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        let found = self
            .store
            .find(id)
            .await
            .context(WorkflowError::Store { operation: "find" })?;
        match found {
            Some(workflow) => Ok(workflow),
            None => Err(WorkflowError::NotFound { id }.into()),
        }
    }

    /// Appends `entry` in the store and copies the stored history onto `workflow`.
    async fn record_access(
        &self,
        workflow: &mut Workflow,
        entry: AccessHistoryEntry,
    ) -> Result<(), WorkflowError> {
        let id = workflow.id;
        let history = self
            .store
            .record_access(id, &entry)
            .await
            .context(WorkflowError::Store {
                operation: "record_access",
            })?;
        let Some(history) = history else {
            self.cache_evict(id).await;
            return Err(WorkflowError::NotFound { id }.into());
        };
        workflow.last_accessed_by = Some(entry.user_id);
        workflow.last_accessed_at = Some(entry.timestamp);
        workflow.access_history = history;
        Ok(())
    }

    fn cache_key(&self, id: WorkflowId) -> String {
        format!("{}{}", self.settings.cache_key_prefix, id)
    }

    async fn cache_get(&self, id: WorkflowId) -> Option<Workflow> {
        if !self.settings.cache_enabled {
            return None;
        }
        let key = self.cache_key(id);
        match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<Workflow>(value) {
                Ok(workflow) if workflow.id == id => {
                    debug!(%key, "cache hit");
                    Some(workflow)
                }
                Ok(_) => {
                    warn!(%key, "cached workflow has a different id, evicting");
                    self.cache_evict(id).await;
                    None
                }
                Err(e) => {
                    warn!(%key, error = %e, "corrupt cache entry, evicting");
                    self.cache_evict(id).await;
                    None
                }
            },
            Ok(None) => {
                debug!(%key, "cache miss");
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn cache_put(&self, workflow: &Workflow) {
        if !self.settings.cache_enabled {
            return;
        }
        let key = self.cache_key(workflow.id);
        let value = match serde_json::to_value(workflow) {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "failed to serialize workflow for cache");
                return;
            }
        };
        if let Err(e) = self.cache.save(&key, value).await {
            warn!(%key, error = %e, "cache write failed");
        }
    }

    async fn cache_evict(&self, id: WorkflowId) {
        if !self.settings.cache_enabled {
            return;
        }
        let key = self.cache_key(id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!(%key, error = %e, "cache eviction failed");
        }
    }

    async fn publish(&self, event: WorkflowEvent) {
        let topic = event.kind.topic();
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, error = %e, "failed to serialize event");
                return;
            }
        };
        if let Err(e) = self.events.publish(topic, payload).await {
            warn!(topic, workflow_id = %event.workflow_id, error = %e, "event publish failed");
        }
    }
}

/// Extracts a short acknowledgement from the execution service's reply.
fn acknowledgement(response: &JsonValue) -> Option<String> {
    ["message", "status"]
        .iter()
        .find_map(|field| response.get(*field).and_then(JsonValue::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeDraft, GraphDraft, NodeDraft};
    use crate::memory::{
        InMemoryStateStore, InMemoryWorkflowStore, RecordingInvoker, RecordingPublisher,
    };
    use crate::error::StoreError;
    use crate::model::{ExecutionState, WorkflowStatus, WorkflowSummary};
    use async_trait::async_trait;
    use chrono::Duration;
    use rootcause::Report;
    use std::sync::Mutex;

    struct Harness {
        service: WorkflowService,
        store: Arc<InMemoryWorkflowStore>,
        cache: Arc<InMemoryStateStore>,
        events: Arc<RecordingPublisher>,
        invoker: Arc<RecordingInvoker>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let cache = Arc::new(InMemoryStateStore::new());
        let events = Arc::new(RecordingPublisher::new());
        let invoker = Arc::new(RecordingInvoker::new(
            serde_json::json!({"status": "accepted"}),
        ));
        let service = WorkflowService::new(
            store.clone(),
            cache.clone(),
            events.clone(),
            invoker.clone(),
            ServiceSettings::default(),
        );
        Harness {
            service,
            store,
            cache,
            events,
            invoker,
        }
    }

    fn create_request(name: &str) -> CreateWorkflow {
        CreateWorkflow {
            name: name.to_string(),
            description: Some("Test workflow description".to_string()),
            data_region: "us-east-1".to_string(),
            ..CreateWorkflow::default()
        }
    }

    fn two_node_graph() -> GraphDraft {
        let node = |key: &str| NodeDraft {
            key: key.to_string(),
            node_type: "task".to_string(),
            name: key.to_string(),
            config: Default::default(),
            position: None,
        };
        GraphDraft {
            nodes: vec![node("research"), node("qa")],
            edges: vec![EdgeDraft {
                key: Some("e1".to_string()),
                source: "research".to_string(),
                target: "qa".to_string(),
                config: Default::default(),
            }],
        }
    }

    #[tokio::test]
    async fn create_persists_caches_and_publishes() {
        let h = harness();
        let user = UserId::new();
        let mut request = create_request("Test Workflow");
        request.graph = Some(two_node_graph());

        let created = h.service.create(request, user).await.expect("create");

        assert_eq!(created.status, WorkflowStatus::Draft);
        assert_eq!(created.created_by, user);
        assert_eq!(created.nodes.len(), 2);
        assert_eq!(created.edges.len(), 1);
        assert!(h.store.get(created.id).is_some());
        assert!(h.cache.contains(&format!("workflow:{}", created.id)));
        assert_eq!(h.events.topics(), vec!["workflow.created".to_string()]);
    }

    #[tokio::test]
    async fn create_rejects_dangling_edges_before_writing() {
        let h = harness();
        let mut request = create_request("Broken");
        let mut graph = two_node_graph();
        graph.edges[0].target = "nowhere".to_string();
        request.graph = Some(graph);

        let err = h
            .service
            .create(request, UserId::new())
            .await
            .expect_err("dangling edge");

        assert!(matches!(err.current_context(), WorkflowError::Invalid { .. }));
        assert_eq!(h.store.len(), 0);
        assert!(h.events.topics().is_empty());
    }

    #[tokio::test]
    async fn find_by_id_records_view_access() {
        let h = harness();
        let owner = UserId::new();
        let viewer = UserId::new();
        let created = h
            .service
            .create(create_request("Viewed"), owner)
            .await
            .expect("create");

        let found = h.service.find_by_id(created.id, viewer).await.expect("find");

        assert_eq!(found.id, created.id);
        assert_eq!(found.last_accessed_by, Some(viewer));
        assert_eq!(found.access_history.len(), 1);
        assert_eq!(found.access_history[0].user_id, viewer);
        assert_eq!(found.access_history[0].action, AccessAction::View);

        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.access_history.len(), 1);
    }

    #[tokio::test]
    async fn find_by_id_falls_back_to_store_on_cache_miss() {
        let h = harness();
        let created = h
            .service
            .create(create_request("Uncached"), UserId::new())
            .await
            .expect("create");
        h.cache.clear();

        let found = h
            .service
            .find_by_id(created.id, UserId::new())
            .await
            .expect("find");

        assert_eq!(found.name, "Uncached");
        assert!(h.cache.contains(&format!("workflow:{}", created.id)));
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_evicted() {
        let h = harness();
        let created = h
            .service
            .create(create_request("Corrupt"), UserId::new())
            .await
            .expect("create");
        let key = format!("workflow:{}", created.id);
        h.cache.insert_raw(&key, serde_json::json!({"not": "a workflow"}));

        let found = h
            .service
            .find_by_id(created.id, UserId::new())
            .await
            .expect("find");

        assert_eq!(found.name, "Corrupt");
        let cached = h.cache.get_raw(&key).expect("re-cached from store");
        assert_eq!(cached["name"], "Corrupt");
    }

    #[tokio::test]
    async fn sidecar_outage_does_not_fail_reads_or_writes() {
        let h = harness();
        h.cache.set_failing(true);
        h.events.set_failing(true);

        let created = h
            .service
            .create(create_request("Degraded"), UserId::new())
            .await
            .expect("create despite sidecar outage");
        let found = h
            .service
            .find_by_id(created.id, UserId::new())
            .await
            .expect("find despite sidecar outage");

        assert_eq!(found.id, created.id);
        assert!(h.events.topics().is_empty());
    }

    #[tokio::test]
    async fn find_missing_workflow_is_not_found() {
        let h = harness();
        let id = WorkflowId::new();
        let err = h
            .service
            .find_by_id(id, UserId::new())
            .await
            .expect_err("missing");
        assert_eq!(err.current_context(), &WorkflowError::NotFound { id });
    }

    #[tokio::test]
    async fn disabled_cache_is_never_touched() {
        let h = harness();
        let service = WorkflowService::new(
            h.store.clone(),
            h.cache.clone(),
            h.events.clone(),
            h.invoker.clone(),
            ServiceSettings {
                cache_enabled: false,
                ..ServiceSettings::default()
            },
        );
        let created = service
            .create(create_request("No cache"), UserId::new())
            .await
            .expect("create");
        service
            .find_by_id(created.id, UserId::new())
            .await
            .expect("find");
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn list_paginates() {
        let h = harness();
        let user = UserId::new();
        for name in ["Workflow 1", "Workflow 2", "Workflow 3"] {
            h.service
                .create(create_request(name), user)
                .await
                .expect("create");
        }

        let page = h
            .service
            .list(&WorkflowQuery {
                page: Some(1),
                limit: Some(2),
                ..WorkflowQuery::default()
            })
            .await
            .expect("list");

        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 2);
    }

    #[tokio::test]
    async fn update_changes_fields_and_replaces_graph() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Original Name"), user)
            .await
            .expect("create");

        let updated = h
            .service
            .update(
                created.id,
                UpdateWorkflow {
                    name: Some("Updated Name".to_string()),
                    status: Some(WorkflowStatus::Active),
                    graph: Some(two_node_graph()),
                    ..UpdateWorkflow::default()
                },
                user,
            )
            .await
            .expect("update");

        assert_eq!(updated.name, "Updated Name");
        assert_eq!(updated.status, WorkflowStatus::Active);
        assert_eq!(updated.last_accessed_by, Some(user));
        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.nodes.len(), 2);
        assert_eq!(stored.edges.len(), 1);
        assert_eq!(
            h.events.topics(),
            vec!["workflow.created".to_string(), "workflow.updated".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let h = harness();
        let created = h
            .service
            .create(create_request("Static"), UserId::new())
            .await
            .expect("create");
        let err = h
            .service
            .update(created.id, UpdateWorkflow::default(), UserId::new())
            .await
            .expect_err("empty update");
        assert!(err.current_context().is_client_error());
    }

    #[tokio::test]
    async fn delete_evicts_and_publishes() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("To Delete"), user)
            .await
            .expect("create");

        h.service.delete(created.id, user).await.expect("delete");

        assert!(h.store.get(created.id).is_none());
        assert!(!h.cache.contains(&format!("workflow:{}", created.id)));
        assert_eq!(h.events.topics().last().map(String::as_str), Some("workflow.deleted"));
        let err = h
            .service
            .find_by_id(created.id, user)
            .await
            .expect_err("deleted");
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let h = harness();
        let err = h
            .service
            .delete(WorkflowId::new(), UserId::new())
            .await
            .expect_err("missing");
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn execute_marks_running_and_forwards_record() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Runnable"), user)
            .await
            .expect("create");

        let accepted = h
            .service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect("execute");

        assert_eq!(accepted.status, ExecutionStatus::Running);
        assert_eq!(accepted.message.as_deref(), Some("accepted"));
        let calls = h.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "crew-service");
        assert_eq!(calls[0].1, format!("workflows/{}/execute", created.id));
        assert_eq!(calls[0].2["workflow"]["name"], "Runnable");
        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Running);
        assert_eq!(stored.execution.last_executed_by, Some(user));
        assert_eq!(
            h.events.topics().last().map(String::as_str),
            Some("workflow.execution.started")
        );
    }

    #[tokio::test]
    async fn execute_twice_is_rejected_while_running() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Busy"), user)
            .await
            .expect("create");
        h.service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect("first execute");

        let err = h
            .service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect_err("already running");
        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidState { .. }
        ));
        assert_eq!(h.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn archived_workflows_cannot_execute() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Retired"), user)
            .await
            .expect("create");
        h.service
            .update(
                created.id,
                UpdateWorkflow {
                    status: Some(WorkflowStatus::Archived),
                    ..UpdateWorkflow::default()
                },
                user,
            )
            .await
            .expect("archive");

        let err = h
            .service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect_err("archived");
        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidState { .. }
        ));
        assert!(h.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_workflow_failed() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Unreachable"), user)
            .await
            .expect("create");
        h.invoker.set_failing(true);

        let err = h
            .service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect_err("dispatch fails");

        assert!(matches!(
            err.current_context(),
            WorkflowError::ExecutionDispatch { .. }
        ));
        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Failed);
        assert!(
            stored
                .execution
                .last_status_message
                .as_deref()
                .is_some_and(|m| m.contains("crew-service"))
        );
    }

    #[tokio::test]
    async fn status_events_update_running_execution() {
        let h = harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Progress"), user)
            .await
            .expect("create");
        h.service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect("execute");

        let event = ExecutionStatusEvent {
            workflow_id: created.id,
            status: ExecutionStatus::Running,
            phase: Some("analysis".to_string()),
            progress: Some(0.5),
            message: Some("Analysis phase completed".to_string()),
            timestamp: Utc::now() + Duration::seconds(1),
        };
        let outcome = h
            .service
            .apply_execution_event(&event)
            .await
            .expect("apply");

        assert_eq!(outcome, EventOutcome::Applied);
        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.execution.current_phase.as_deref(), Some("analysis"));
        assert_eq!(stored.execution.execution_progress, Some(0.5));
        assert_eq!(
            h.events.topics().last().map(String::as_str),
            Some("workflow.execution.updated")
        );
    }

    #[tokio::test]
    async fn status_events_without_execution_are_ignored() {
        let h = harness();
        let created = h
            .service
            .create(create_request("Idle"), UserId::new())
            .await
            .expect("create");
        let published = h.events.topics().len();

        let outcome = h
            .service
            .apply_execution_event(&ExecutionStatusEvent {
                workflow_id: created.id,
                status: ExecutionStatus::Completed,
                phase: None,
                progress: None,
                message: None,
                timestamp: Utc::now(),
            })
            .await
            .expect("apply");

        assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::NotRunning));
        assert_eq!(h.events.topics().len(), published);
    }

    /// A write another replica commits while the service is mid-operation.
    enum Concurrent {
        /// The execution service reports the running execution as completed.
        Complete,
        /// Another user opens the workflow.
        View(UserId),
        /// Another user starts an execution.
        Begin(UserId),
    }

    /// Store that commits one concurrent write just before the next
    /// `save` or `save_execution` reaches the inner store.
    struct InterleavingStore {
        inner: Arc<InMemoryWorkflowStore>,
        pending: Mutex<Option<(WorkflowId, Concurrent)>>,
    }

    impl InterleavingStore {
        fn new(inner: Arc<InMemoryWorkflowStore>) -> Self {
            Self {
                inner,
                pending: Mutex::new(None),
            }
        }

        fn before_next_write(&self, id: WorkflowId, write: Concurrent) {
            *self.pending.lock().unwrap() = Some((id, write));
        }

        async fn run_pending(&self) {
            let pending = self.pending.lock().unwrap().take();
            let Some((id, write)) = pending else {
                return;
            };
            match write {
                Concurrent::Complete => {
                    let stored = self.inner.get(id).expect("stored");
                    let guard = ExecutionGuard::Running {
                        started_at: stored.execution.last_executed_at,
                    };
                    let mut execution = stored.execution;
                    let outcome = execution.apply(&ExecutionStatusEvent {
                        workflow_id: id,
                        status: ExecutionStatus::Completed,
                        phase: Some("done".to_string()),
                        progress: None,
                        message: Some("All phases completed".to_string()),
                        timestamp: Utc::now() + Duration::seconds(1),
                    });
                    assert_eq!(outcome, EventOutcome::Applied);
                    let written = self
                        .inner
                        .save_execution(id, &execution, guard)
                        .await
                        .expect("complete");
                    assert_eq!(written, WriteOutcome::Written);
                }
                Concurrent::View(user) => {
                    self.inner
                        .record_access(id, &AccessHistoryEntry::now(user, AccessAction::View))
                        .await
                        .expect("view")
                        .expect("exists");
                }
                Concurrent::Begin(user) => {
                    let mut execution = ExecutionState::default();
                    execution.begin(user, Utc::now());
                    let written = self
                        .inner
                        .save_execution(id, &execution, ExecutionGuard::Idle)
                        .await
                        .expect("begin");
                    assert_eq!(written, WriteOutcome::Written);
                }
            }
        }
    }

    #[async_trait]
    impl WorkflowStore for InterleavingStore {
        async fn insert(&self, workflow: &Workflow) -> std::result::Result<(), Report<StoreError>> {
            self.inner.insert(workflow).await
        }

        async fn find(
            &self,
            id: WorkflowId,
        ) -> std::result::Result<Option<Workflow>, Report<StoreError>> {
            self.inner.find(id).await
        }

        async fn list(
            &self,
            query: &WorkflowQuery,
        ) -> std::result::Result<(Vec<WorkflowSummary>, u64), Report<StoreError>> {
            self.inner.list(query).await
        }

        async fn save(
            &self,
            workflow: &Workflow,
            scope: SaveScope,
        ) -> std::result::Result<bool, Report<StoreError>> {
            self.run_pending().await;
            self.inner.save(workflow, scope).await
        }

        async fn save_execution(
            &self,
            id: WorkflowId,
            execution: &ExecutionState,
            guard: ExecutionGuard,
        ) -> std::result::Result<WriteOutcome, Report<StoreError>> {
            self.run_pending().await;
            self.inner.save_execution(id, execution, guard).await
        }

        async fn record_access(
            &self,
            id: WorkflowId,
            entry: &AccessHistoryEntry,
        ) -> std::result::Result<Option<Vec<AccessHistoryEntry>>, Report<StoreError>> {
            self.inner.record_access(id, entry).await
        }

        async fn delete(&self, id: WorkflowId) -> std::result::Result<bool, Report<StoreError>> {
            self.inner.delete(id).await
        }
    }

    fn interleaving_harness() -> (Harness, Arc<InterleavingStore>) {
        let h = harness();
        let store = Arc::new(InterleavingStore::new(h.store.clone()));
        let service = WorkflowService::new(
            store.clone(),
            h.cache.clone(),
            h.events.clone(),
            h.invoker.clone(),
            ServiceSettings::default(),
        );
        (Harness { service, ..h }, store)
    }

    #[tokio::test]
    async fn update_keeps_completion_written_meanwhile() {
        let (h, store) = interleaving_harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Racing"), user)
            .await
            .expect("create");
        h.service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect("execute");

        store.before_next_write(created.id, Concurrent::Complete);
        let updated = h
            .service
            .update(
                created.id,
                UpdateWorkflow {
                    description: Some("Edited while running".to_string()),
                    ..UpdateWorkflow::default()
                },
                user,
            )
            .await
            .expect("update");

        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Completed);
        assert_eq!(stored.execution.execution_progress, Some(1.0));
        assert_eq!(stored.description.as_deref(), Some("Edited while running"));
        assert_eq!(updated.execution.execution_status, ExecutionStatus::Completed);
        let cached = h
            .cache
            .get_raw(&format!("workflow:{}", created.id))
            .expect("cached");
        assert_eq!(cached["execution_status"], "completed");
    }

    #[tokio::test]
    async fn update_keeps_access_recorded_meanwhile() {
        let (h, store) = interleaving_harness();
        let owner = UserId::new();
        let viewer = UserId::new();
        let created = h
            .service
            .create(create_request("Shared"), owner)
            .await
            .expect("create");

        store.before_next_write(created.id, Concurrent::View(viewer));
        let updated = h
            .service
            .update(
                created.id,
                UpdateWorkflow {
                    name: Some("Shared and renamed".to_string()),
                    ..UpdateWorkflow::default()
                },
                owner,
            )
            .await
            .expect("update");

        let stored = h.store.get(created.id).expect("stored");
        let actions: Vec<_> = stored
            .access_history
            .iter()
            .map(|entry| (entry.user_id, entry.action))
            .collect();
        assert_eq!(
            actions,
            vec![(viewer, AccessAction::View), (owner, AccessAction::Update)]
        );
        assert_eq!(stored.last_accessed_by, Some(owner));
        assert_eq!(updated.access_history.len(), 2);
    }

    #[tokio::test]
    async fn execute_loses_to_execution_started_meanwhile() {
        let (h, store) = interleaving_harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Contended"), user)
            .await
            .expect("create");

        store.before_next_write(created.id, Concurrent::Begin(UserId::new()));
        let err = h
            .service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect_err("already started elsewhere");

        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidState { .. }
        ));
        assert!(h.invoker.calls().is_empty());
        let stored = h.store.get(created.id).expect("stored");
        assert_ne!(stored.execution.last_executed_by, Some(user));
        assert!(stored.access_history.is_empty());
    }

    #[tokio::test]
    async fn running_event_does_not_overwrite_completion() {
        let (h, store) = interleaving_harness();
        let user = UserId::new();
        let created = h
            .service
            .create(create_request("Finishing"), user)
            .await
            .expect("create");
        h.service
            .execute(created.id, ExecutionConfig::default(), user)
            .await
            .expect("execute");
        let published = h.events.topics().len();

        store.before_next_write(created.id, Concurrent::Complete);
        let outcome = h
            .service
            .apply_execution_event(&ExecutionStatusEvent {
                workflow_id: created.id,
                status: ExecutionStatus::Running,
                phase: Some("review".to_string()),
                progress: Some(0.8),
                message: None,
                timestamp: Utc::now() + Duration::seconds(1),
            })
            .await
            .expect("apply");

        assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::Superseded));
        let stored = h.store.get(created.id).expect("stored");
        assert_eq!(stored.execution.execution_status, ExecutionStatus::Completed);
        assert_eq!(stored.execution.current_phase.as_deref(), Some("done"));
        assert_eq!(h.events.topics().len(), published);
    }

    #[test]
    fn acknowledgement_prefers_message() {
        let response = serde_json::json!({"status": "accepted", "message": "queued"});
        assert_eq!(acknowledgement(&response).as_deref(), Some("queued"));
        assert_eq!(acknowledgement(&JsonValue::Null), None);
    }
}
