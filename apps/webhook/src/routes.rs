//! HTTP routes: start a flow, deliver an async-step webhook, and read
//! flow/partition status. Follows `apps/api/src/routes`
//! (one handler module, `ApiError` mapped to a JSON body via
//! `IntoResponse`), narrowed to this engine's one real collaborator
//! (`FlowOrchestrator`) instead of its many domain services.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use flowcore_domain::{AttributeName, FlowId, FlowState, PartitionState, StepId};
use flowcore_engine::{FlowOrchestrator, OrchestrationError, TestScriptEnv, WebhookIngress, WebhookPayload};

type Orchestrator = FlowOrchestrator<TestScriptEnv>;

#[derive(Debug, Error)]
pub enum WebhookApiError {
    #[error("flow not found: {0}")]
    FlowNotFound(FlowId),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error(transparent)]
    Webhook(#[from] flowcore_engine::WebhookError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for WebhookApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::FlowNotFound(_) => StatusCode::NOT_FOUND,
            Self::Orchestration(OrchestrationError::UnsatisfiablePlan { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Orchestration(OrchestrationError::Plan(_)) => StatusCode::BAD_REQUEST,
            Self::Orchestration(_) | Self::Webhook(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error_type = match &self {
            Self::FlowNotFound(_) => "flow_not_found",
            Self::Orchestration(_) => "orchestration_error",
            Self::Webhook(_) => "malformed_webhook",
        };
        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartFlowRequest {
    pub flow_id: FlowId,
    pub goals: Vec<StepId>,
    #[serde(default)]
    pub init: HashMap<AttributeName, Value>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub allow_partial: bool,
}

#[derive(Debug, Serialize)]
pub struct StartFlowResponse {
    pub flow_id: FlowId,
}

async fn start_flow(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<StartFlowRequest>,
) -> Result<(StatusCode, Json<StartFlowResponse>), WebhookApiError> {
    let flow_id = request.flow_id.clone();
    orchestrator
        .start_flow(
            request.flow_id,
            request.goals,
            request.init,
            request.metadata,
            request.labels,
            request.allow_partial,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartFlowResponse { flow_id })))
}

async fn get_flow(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(flow_id): Path<String>,
) -> Result<Json<FlowState>, WebhookApiError> {
    let flow_id = FlowId::new(flow_id);
    orchestrator
        .load_flow(&flow_id)
        .await?
        .map(Json)
        .ok_or(WebhookApiError::FlowNotFound(flow_id))
}

async fn get_partition(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<Json<PartitionState>, WebhookApiError> {
    Ok(Json(orchestrator.load_partition().await?))
}

async fn deliver_webhook(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path((flow_id, step_id, token)): Path<(String, String, String)>,
    Json(payload): Json<WebhookPayload>,
) -> Result<StatusCode, WebhookApiError> {
    let ingress = WebhookIngress::new(Arc::clone(orchestrator.runner()));
    ingress.deliver(&flow_id, &step_id, &token, payload).await?;
    // A delivered outcome only settles the work item; it does not by itself
    // re-sweep the flow (the runner's `on_settled` hook already schedules
    // that), so this handler has nothing further to do but acknowledge.
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

pub fn routes(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/flows", post(start_flow))
        .route("/flows/{flow_id}", get(get_flow))
        .route("/partition", get(get_partition))
        .route("/webhook/{flow_id}/{step_id}/{token}", post(deliver_webhook))
        .with_state(orchestrator)
}
