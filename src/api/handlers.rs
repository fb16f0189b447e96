//! HTTP request handlers for the status surface.
//!
//! - `GET /api/v1/mcp/status` reports every server
//! - `POST /api/v1/mcp/servers/{name}/start` starts one server
//! - `POST /api/v1/mcp/servers/{name}/stop` stops one server

use crate::api::ApiState;
use crate::error::Result;
use actix_web::{HttpResponse, web};
use serde_json::json;

/// Status of every server
pub async fn get_status(state: web::Data<ApiState>) -> HttpResponse {
    let servers = state.supervisor().status();
    tracing::debug!(num_servers = servers.len(), "Serving status snapshot");

    HttpResponse::Ok().json(json!({
        "success": true,
        "servers": servers,
    }))
}

/// Start one server
pub async fn start_server(
    state: web::Data<ApiState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let name = name.into_inner();
    tracing::info!(server_name = %name, "Start requested over HTTP");

    let supervisor = state.supervisor().clone();
    let server = name.clone();
    state
        .run(async move { supervisor.start(&server).await })
        .await?;

    server_response(&state, &name)
}

/// Stop one server
pub async fn stop_server(
    state: web::Data<ApiState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let name = name.into_inner();
    tracing::info!(server_name = %name, "Stop requested over HTTP");

    let supervisor = state.supervisor().clone();
    let server = name.clone();
    state
        .run(async move { supervisor.stop(&server).await })
        .await?;

    server_response(&state, &name)
}

fn server_response(state: &ApiState, name: &str) -> Result<HttpResponse> {
    let status = state.supervisor().server_status(name)?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "server": name,
        "status": status,
    })))
}
