//! Workflow metadata routes
//!
//! Feed the CLI's synthesized help and schema-aware parameter parsing.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use inkforge_core::WorkflowMetadata;

use crate::common::ApiError;
use crate::AppState;

/// A workflow with its declared parameter schema
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowDetail {
    pub metadata: WorkflowMetadata,
    /// Ordered parameter definitions
    #[schema(value_type = Object)]
    pub params: Value,
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", get(list_workflows))
        .route("/v1/workflows/:workflow_type", get(get_workflow))
        .with_state(state)
}

/// GET /v1/workflows - Registered workflows
#[utoipa::path(
    get,
    path = "/v1/workflows",
    responses(
        (status = 200, description = "Registered workflows", body = Vec<WorkflowMetadata>),
    ),
    tag = "workflows"
)]
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowMetadata>> {
    Json(state.registry.list())
}

/// GET /v1/workflows/{workflow_type} - One workflow with its parameter schema
#[utoipa::path(
    get,
    path = "/v1/workflows/{workflow_type}",
    params(("workflow_type" = String, Path, description = "Workflow type name")),
    responses(
        (status = 200, description = "Workflow detail", body = WorkflowDetail),
        (status = 404, description = "Unknown workflow"),
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_type): Path<String>,
) -> Result<Json<WorkflowDetail>, ApiError> {
    let factory = state
        .registry
        .get_optional(&workflow_type)
        .ok_or_else(|| ApiError::UnknownWorkflow(workflow_type.clone()))?;

    let params = serde_json::to_value(factory.param_schema())
        .map_err(|e| ApiError::Storage(e.to_string()))?;

    Ok(Json(WorkflowDetail {
        metadata: factory.metadata(),
        params,
    }))
}
