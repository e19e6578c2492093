//! `/server` endpoints.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use serde_json::{Value, json};
use tracing::info;

use actlabs_core::models::ServerRecord;

use crate::AppState;
use crate::error::AppResult;

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

/// Body parsed as JSON whatever its `Content-Type`.
fn server_record(body: &Bytes) -> AppResult<ServerRecord> {
    Ok(serde_json::from_slice(body)?)
}

/// `GET /server`: provider view of the caller's server.
pub async fn get_server(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<ServerRecord>> {
    let server = server_record(&body)?;
    let server = state.orchestrator.get(server).await?;
    Ok(Json(server))
}

/// `PUT /server`: create or update the caller's server and wait for it.
pub async fn deploy_server(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<ServerRecord>> {
    let server = server_record(&body)?;
    let cancel = state.shutdown.child_token();
    let server = state.orchestrator.deploy(server, &cancel).await?;
    info!(alias = %server.user_alias, status = %server.status, "deploy finished");
    Ok(Json(server))
}

/// `DELETE /server`: delete the caller's server.
pub async fn destroy_server(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let server = server_record(&body)?;
    let cancel = state.shutdown.child_token();
    state.orchestrator.destroy(server, &cancel).await?;
    Ok(success())
}

/// `PUT /server/activity/{userPrincipalName}`: record that the user is active.
pub async fn update_activity(
    State(state): State<AppState>,
    Path(user_principal_name): Path<String>,
) -> AppResult<Json<Value>> {
    state
        .orchestrator
        .update_activity(&user_principal_name)
        .await?;
    Ok(success())
}
