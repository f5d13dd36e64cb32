//! Sidecar-facing HTTP routes.
//!
//! - `GET /health`: liveness probe
//! - `GET /dapr/subscribe`: programmatic subscription discovery
//! - `POST /events/execution-status`: execution progress events

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use flowdesk_sidecar::{CloudEvent, Subscription, TopicEventResponse};
use flowdesk_workflow::{EXECUTION_STATUS_TOPIC, ExecutionStatusEvent, WorkflowService};
use serde_json::Value as JsonValue;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Route the sidecar delivers execution status events to.
pub const EXECUTION_STATUS_ROUTE: &str = "/events/execution-status";

/// Shared state for the route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: WorkflowService,
    /// Pub/sub component subscriptions are registered on.
    pub pubsub: String,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dapr/subscribe", get(subscribe))
        .route(EXECUTION_STATUS_ROUTE, post(execution_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<JsonValue> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn subscribe(State(state): State<AppState>) -> Json<Vec<Subscription>> {
    Json(vec![Subscription::new(
        state.pubsub,
        EXECUTION_STATUS_TOPIC,
        EXECUTION_STATUS_ROUTE,
    )])
}

/// Accepts a CloudEvent envelope or a bare event.
fn parse_status_event(body: &[u8]) -> Option<ExecutionStatusEvent> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    if value.get("data").is_some() {
        serde_json::from_value::<CloudEvent<ExecutionStatusEvent>>(value)
            .ok()
            .map(|envelope| envelope.data)
    } else {
        serde_json::from_value(value).ok()
    }
}

async fn execution_status(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<TopicEventResponse>) {
    let Some(event) = parse_status_event(&body) else {
        warn!("dropping malformed execution status event");
        return (StatusCode::OK, Json(TopicEventResponse::drop()));
    };

    match state.service.apply_execution_event(&event).await {
        Ok(outcome) => {
            debug!(workflow_id = %event.workflow_id, ?outcome, "execution status handled");
            (StatusCode::OK, Json(TopicEventResponse::success()))
        }
        Err(report) if report.current_context().is_client_error() => {
            warn!(workflow_id = %event.workflow_id, error = %report, "dropping execution status event");
            (StatusCode::OK, Json(TopicEventResponse::drop()))
        }
        Err(report) => {
            error!(workflow_id = %event.workflow_id, error = %report, "execution status event failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TopicEventResponse::retry()),
            )
        }
    }
}
