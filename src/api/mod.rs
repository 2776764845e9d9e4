//! # HTTP API
//!
//! Thin axum layer over the orchestrator. Handlers translate between the
//! wire shapes and the engine types and never contain engine logic.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::{Orchestrator, RawTileOutput, TaskState};
use crate::types::{CalculationSettings, EngineError, GroupId, TaskId, UserId};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trigger_calculation", post(trigger_calculation))
        .route("/collect_results/:group_id", get(collect_results))
        .route("/check_on_singletask/:task_id", get(check_on_singletask))
        .route("/check_projects_for_user", post(check_projects_for_user))
        .route("/cancel_calculation/:group_id", post(cancel_calculation))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn api_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::GroupNotFound(_) | EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub user_id: String,
    /// Simulation kind plus its settings, e.g.
    /// `{"kind": "wind", "wind_speed": 5.0, "wind_direction": 90.0}`.
    #[serde(flatten)]
    pub settings: CalculationSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CollectQuery {
    #[serde(default = "default_format")]
    pub result_format: String,
}

fn default_format() -> String {
    "geojson".to_string()
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CollectPayload {
    GeoJson(geojson::FeatureCollection),
    Raw(Vec<RawTileOutput>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectResponse {
    pub group_id: String,
    pub tasks_completed: usize,
    pub tasks_total: usize,
    pub processed: bool,
    pub results: CollectPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleTaskResponse {
    pub task_id: String,
    pub state: String,
    pub succeeded: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCheckResponse {
    pub user_id: String,
    pub valid: bool,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": crate::NAME,
        "version": crate::VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Accept a calculation request and hand back the setup task id.
pub async fn trigger_calculation(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let user = UserId::new(request.user_id);
    debug!("calculation requested by {} ({})", user, request.settings.kind());
    let task_id = state.orchestrator.run_calculation(user, request.settings);
    Ok(Json(TriggerResponse {
        task_id: task_id.to_string(),
    }))
}

/// Progress and results of a dispatched group.
pub async fn collect_results(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(query): Query<CollectQuery>,
) -> Result<Json<CollectResponse>, ApiError> {
    let group_id: GroupId = group_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed group id".to_string()))?;

    let progress = state.orchestrator.collect(group_id).map_err(api_error)?;
    let results = match query.result_format.as_str() {
        "geojson" => CollectPayload::GeoJson(progress.results),
        "raw" => CollectPayload::Raw(state.orchestrator.collect_raw(group_id).map_err(api_error)?),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unsupported result_format '{other}'"),
            ))
        }
    };

    Ok(Json(CollectResponse {
        group_id: group_id.to_string(),
        tasks_completed: progress.completed,
        tasks_total: progress.total,
        processed: progress.processed,
        results,
    }))
}

/// State of a setup task; once succeeded, `result` carries the group id.
pub async fn check_on_singletask(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<SingleTaskResponse>, ApiError> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed task id".to_string()))?;

    let task_state = state.orchestrator.task_state(task_id).map_err(api_error)?;
    let response = match task_state {
        TaskState::Pending => SingleTaskResponse {
            task_id: task_id.to_string(),
            state: "pending".to_string(),
            succeeded: false,
            ready: false,
            result: None,
        },
        TaskState::Succeeded(group_id) => SingleTaskResponse {
            task_id: task_id.to_string(),
            state: "succeeded".to_string(),
            succeeded: true,
            ready: true,
            result: Some(group_id.to_string()),
        },
        TaskState::Failed(reason) => SingleTaskResponse {
            task_id: task_id.to_string(),
            state: "failed".to_string(),
            succeeded: false,
            ready: true,
            result: Some(reason),
        },
    };
    Ok(Json(response))
}

/// Re-validate the user's stored project set against the backend.
pub async fn check_projects_for_user(
    State(state): State<AppState>,
    Json(request): Json<UserRequest>,
) -> Result<Json<ProjectCheckResponse>, ApiError> {
    let user = UserId::new(request.user_id);
    let valid = state
        .orchestrator
        .check_projects_for_user(&user)
        .await
        .map_err(api_error)?;
    Ok(Json(ProjectCheckResponse {
        user_id: user.to_string(),
        valid,
    }))
}

/// Abort every still-running pipeline of a group.
pub async fn cancel_calculation(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id: GroupId = group_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed group id".to_string()))?;
    state.orchestrator.cancel(group_id).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "groupId": group_id.to_string(), "cancelled": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_request_decodes_flattened_settings() {
        let request: TriggerRequest = serde_json::from_str(
            r#"{"user_id": "u1", "kind": "wind", "wind_speed": 5.0, "wind_direction": 90.0}"#,
        )
        .unwrap();
        assert_eq!(request.user_id, "u1");
        assert!(matches!(
            request.settings,
            CalculationSettings::Wind { wind_speed, wind_direction }
                if wind_speed == 5.0 && wind_direction == 90.0
        ));
    }

    #[test]
    fn test_trigger_request_rejects_unknown_kind() {
        let result = serde_json::from_str::<TriggerRequest>(
            r#"{"user_id": "u1", "kind": "weather"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_collect_response_field_casing() {
        let response = CollectResponse {
            group_id: "g".into(),
            tasks_completed: 3,
            tasks_total: 4,
            processed: true,
            results: CollectPayload::GeoJson(geojson::FeatureCollection {
                bbox: None,
                features: vec![],
                foreign_members: None,
            }),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["tasksCompleted"], 3);
        assert_eq!(json["tasksTotal"], 4);
        assert_eq!(json["results"]["type"], "FeatureCollection");
    }

    #[test]
    fn test_default_result_format_is_geojson() {
        let query: CollectQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.result_format, "geojson");
    }
}
