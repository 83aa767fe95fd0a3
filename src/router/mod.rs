//! HTTP surface
//!
//! Thin transport over the lifecycle engine: the core consumes an already
//! validated `(server, action)` invocation, so handlers only resolve the
//! server, call in, and serialize the result.

mod middleware;
mod websocket;

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Result;
use crate::server::{CreateServer, InstallProcess, Manager, Server, ServerRecord, StatsSnapshot};
use crate::templates::Template;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    let servers = Router::new()
        .route("/:server", get(get_server).delete(delete_server))
        .route("/:server/stats", get(get_server_stats))
        .route("/:server/ws", get(websocket::server_ws))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_server,
        ))
        .route("/", get(get_servers).post(create_server));

    let templates = Router::new()
        .route("/", get(get_templates))
        .route("/:id", get(get_template))
        .route("/add", post(add_template));

    Router::new()
        .nest("/api/servers", servers)
        .nest("/api/templates", templates)
        .route("/api/ws", get(websocket::global_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_servers(State(state): State<AppState>) -> Json<Vec<ServerRecord>> {
    let records = state.manager.all().iter().map(|s| s.record()).collect();
    Json(records)
}

async fn create_server(
    State(state): State<AppState>,
    Json(spec): Json<CreateServer>,
) -> Result<Json<ServerRecord>> {
    let server = state.manager.create(spec)?;
    let record = server.record();

    // Installation runs in the background; clients watch it over the bus.
    tokio::spawn(async move {
        let _ = InstallProcess::new(server).run(false).await;
    });

    Ok(Json(record))
}

async fn get_server(Extension(server): Extension<Arc<Server>>) -> Json<ServerRecord> {
    Json(server.record())
}

async fn delete_server(
    State(state): State<AppState>,
    Extension(server): Extension<Arc<Server>>,
) -> Result<Json<serde_json::Value>> {
    state.manager.delete(server.uuid()).await?;
    Ok(Json(serde_json::json!({ "deleted": server.uuid() })))
}

async fn get_server_stats(
    Extension(server): Extension<Arc<Server>>,
) -> Result<Json<StatsSnapshot>> {
    Ok(Json(server.stats().await?))
}

async fn get_templates(State(state): State<AppState>) -> Json<Vec<Template>> {
    Json(state.manager.templates().all())
}

async fn get_template(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> Result<Json<Template>> {
    Ok(Json(state.manager.templates().get(id)?))
}

async fn add_template(
    State(state): State<AppState>,
    Json(template): Json<Template>,
) -> Result<Json<Template>> {
    state.manager.templates().add(template.clone())?;
    Ok(Json(template))
}
