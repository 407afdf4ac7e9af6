//! API endpoints for mind control and message delivery.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::core::inbox::parse_queued_payload;
use crate::error::Error;
use crate::events::MindEvent;
use crate::lifecycle::{DeliverOutcome, MindStatus};
use crate::sleep::WakeResult;
use crate::web::AppState;

/// Maps crate errors to HTTP statuses with a JSON body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownMind(_) => StatusCode::NOT_FOUND,
            Error::MalformedQueuedMessage(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::StartupTimeout { .. } | Error::StopTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub mind: String,
    pub action: &'static str,
}

#[derive(Serialize)]
pub struct WakeResponse {
    pub mind: String,
    pub result: WakeResult,
}

#[derive(Serialize)]
pub struct DeliverResponse {
    pub mind: String,
    pub outcome: DeliverOutcome,
}

/// List every configured instance.
pub async fn list_minds(State(state): State<AppState>) -> Json<Vec<MindStatus>> {
    Json(state.coordinator.status())
}

pub async fn start_mind(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.coordinator.start_mind_full(&name).await?;
    Ok(Json(ActionResponse {
        mind: name,
        action: "started",
    }))
}

pub async fn stop_mind(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.coordinator.stop_mind_full(&name).await?;
    Ok(Json(ActionResponse {
        mind: name,
        action: "stopped",
    }))
}

pub async fn sleep_mind(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.coordinator.sleep_mind(&name).await?;
    Ok(Json(ActionResponse {
        mind: name,
        action: "sleeping",
    }))
}

pub async fn wake_mind(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WakeResponse>, ApiError> {
    let result = state.coordinator.wake_mind(&name).await?;
    Ok(Json(WakeResponse { mind: name, result }))
}

/// Delivery entrypoint. Only a malformed body is an error; delivery problems
/// are reported in `outcome`.
pub async fn deliver(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<DeliverResponse>, ApiError> {
    let payload = parse_queued_payload(&body)?;
    let outcome = state.coordinator.deliver(&name, payload).await;
    Ok(Json(DeliverResponse {
        mind: name,
        outcome,
    }))
}

/// Event reported by a mind about its own turn.
pub async fn report_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(event): Json<MindEvent>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.record_mind_event(&name, &event)?;
    Ok(StatusCode::NO_CONTENT)
}
