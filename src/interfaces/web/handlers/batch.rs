use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use super::super::{AppState, auth};
use crate::core::batch::{idle_payload, status_payload};
use crate::core::error::ControlError;
use crate::core::job::AnalysisParams;

fn default_workers() -> u32 {
    8
}

#[derive(serde::Deserialize)]
pub struct UpdateQuery {
    #[serde(default = "default_workers")]
    workers: u32,
    #[serde(default)]
    force: bool,
}

pub async fn start_update_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UpdateQuery>,
) -> Response {
    let user = auth::caller_identity(&headers);
    info!("listing update requested by {} (workers: {})", user, query.workers);

    match state
        .service
        .start_update(&user, query.workers, query.force)
        .await
    {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": task_id, "runner": user })),
        )
            .into_response(),
        Err(e) => control_error_response(e),
    }
}

#[derive(serde::Deserialize)]
pub struct AnalysisRequest {
    #[serde(flatten)]
    params: AnalysisParams,
    #[serde(default)]
    force: bool,
}

pub async fn start_analysis_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AnalysisRequest>,
) -> Response {
    let user = auth::caller_identity(&headers);
    info!(
        "analysis requested by {} (type: {})",
        user, payload.params.analysis_type
    );

    match state
        .service
        .start_analysis(&user, payload.params, payload.force)
        .await
    {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": task_id, "runner": user })),
        )
            .into_response(),
        Err(e) => control_error_response(e),
    }
}

pub async fn cancel_endpoint(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let user = auth::caller_identity(&headers);
    info!("[{}] cancel requested by {}", task_id, user);

    match state.service.cancel(&task_id, &user).await {
        Ok(()) => Json(serde_json::json!({
            "status": "CANCEL_REQUESTED",
            "current_user": user
        }))
        .into_response(),
        Err(e) => control_error_response(e),
    }
}

pub async fn status_current_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let user = auth::caller_identity(&headers);
    let mut payload = match state.service.current_snapshot().await {
        Some((task_id, snap)) => status_payload(&task_id, &snap),
        None => idle_payload(),
    };
    if let Some(map) = payload.as_object_mut() {
        map.insert("current_user".into(), user.into());
    }
    Json(payload)
}

pub async fn status_endpoint(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.service.snapshot(&task_id).await {
        Some(snap) => Json(status_payload(&task_id, &snap)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown task: {task_id}") })),
        )
            .into_response(),
    }
}

#[derive(serde::Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    after: u64,
}

pub async fn logs_endpoint(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.service.logs_since(&task_id, query.after).await {
        Some(lines) => Json(serde_json::json!({ "lines": lines })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown task: {task_id}") })),
        )
            .into_response(),
    }
}

pub async fn active_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.service.active_info().await)
}

pub async fn subscribe_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let user = auth::caller_identity(&headers);
    let rx = state.service.subscribe(&user).await;
    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok::<_, Infallible>(
            Event::default()
                .event(frame.event_name())
                .data(frame.data()),
        )
    });
    Sse::new(stream)
}

fn control_error_response(err: ControlError) -> Response {
    let msg = err.to_string();
    match err {
        ControlError::Busy { runner, progress } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": msg,
                "runner": runner,
                "progress": progress,
                "active": true
            })),
        ),
        ControlError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": msg })),
        ),
        ControlError::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": msg })),
        ),
        ControlError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": msg })),
        ),
    }
    .into_response()
}
