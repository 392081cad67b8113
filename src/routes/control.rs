use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::client::ReportApi;
use crate::error::SyncError;
use crate::events::{EventLevel, EventSource};
use crate::server::AppState;

pub async fn reload<A: ReportApi>(
    State(app): State<AppState<A>>,
) -> Result<impl IntoResponse, SyncError> {
    app.dispatcher.reload_code().await?;

    Ok(Json(serde_json::json!({
        "status": "reloaded",
        "message": "Test code reloaded"
    })))
}

pub async fn abort<A: ReportApi>(
    State(app): State<AppState<A>>,
) -> Result<impl IntoResponse, SyncError> {
    app.state
        .events
        .emit(EventSource::Control, EventLevel::Info, "Abort requested")
        .await;

    app.dispatcher.abort().await?;

    Ok(Json(serde_json::json!({
        "status": "aborted",
        "message": "Session aborted, polling stopped"
    })))
}

/// POST /control/stop-environments: stop every started environment.
/// Per-test failures are reported in the body rather than failing the call.
pub async fn stop_environments<A: ReportApi>(
    State(app): State<AppState<A>>,
) -> Result<impl IntoResponse, SyncError> {
    let outcomes = app.dispatcher.stop_all_environments().await?;
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();

    Ok(Json(serde_json::json!({
        "requested": outcomes.len(),
        "failed": failed,
        "results": outcomes,
    })))
}
