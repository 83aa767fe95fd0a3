//! Request middleware: resolves the `:server` path parameter into an
//! `Arc<Server>` extension before handlers run.

use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::DaemonError;

use super::AppState;

pub async fn require_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut request: Request,
    next: Next,
) -> Result<Response, DaemonError> {
    let server = state.manager.get(&id)?;
    request.extensions_mut().insert(server);
    Ok(next.run(request).await)
}
