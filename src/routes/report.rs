use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::client::ReportApi;
use crate::dispatcher::{EnvAction, FieldChanges};
use crate::error::SyncError;
use crate::report::{Address, FullNode};
use crate::server::AppState;

#[derive(Deserialize)]
pub struct CommandRequest {
    /// Uids from the first test down to the entry; empty for the report.
    #[serde(default)]
    pub address: Address,
    #[serde(flatten)]
    pub changes: FieldChanges,
}

#[derive(Deserialize)]
pub struct EnvRequest {
    pub address: Address,
    pub action: EnvAction,
}

fn entry_response(
    tree: &Arc<FullNode>,
    address: &Address,
) -> Result<Json<serde_json::Value>, SyncError> {
    let entry = tree.find(address).ok_or_else(|| SyncError::PathNotFound {
        path: address.uids().to_vec(),
    })?;
    Ok(Json(json!({ "entry": entry })))
}

/// GET /report: the current tree with its derived indices.
pub async fn get_report<A: ReportApi>(
    State(app): State<AppState<A>>,
) -> Result<impl IntoResponse, SyncError> {
    let snapshot = app.state.tree.snapshot().await;
    let root = snapshot.root.ok_or(SyncError::NoReport)?;
    Ok(Json(json!({
        "revision": snapshot.revision,
        "report": root,
    })))
}

/// POST /entries/command: change an entry's runtime or environment status.
pub async fn command<A: ReportApi>(
    State(app): State<AppState<A>>,
    Json(body): Json<CommandRequest>,
) -> Result<impl IntoResponse, SyncError> {
    let tree = app
        .dispatcher
        .command_at(&body.address, body.changes)
        .await?;
    entry_response(&tree, &body.address)
}

/// POST /entries/env: start or stop a test's environment.
pub async fn env_ctrl<A: ReportApi>(
    State(app): State<AppState<A>>,
    Json(body): Json<EnvRequest>,
) -> Result<impl IntoResponse, SyncError> {
    let changes = FieldChanges::env(body.action.requested_status());
    let tree = app.dispatcher.command_at(&body.address, changes).await?;
    entry_response(&tree, &body.address)
}

/// POST /report/reset: reset every entry of the report.
pub async fn reset_report<A: ReportApi>(
    State(app): State<AppState<A>>,
) -> Result<impl IntoResponse, SyncError> {
    let tree = app.dispatcher.reset_report().await?;
    entry_response(&tree, &Address::root())
}
