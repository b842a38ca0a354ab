use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use relay_bus::{SessionSnapshot, SourceId};
use serde::Serialize;

use crate::{handler::ApiJsonResult, manager};

pub fn relay_router() -> Router {
    Router::new()
        .route("/list", get(list_sessions))
        .route("/status/{source_id}", get(session_status))
        .route("/stop/{source_id}", post(stop_session))
}

#[derive(Serialize)]
struct StopResponse {
    source_id: SourceId,
    stopped: bool,
}

async fn list_sessions() -> ApiJsonResult<Vec<SessionSnapshot>> {
    Ok(Json(manager::registry()?.list().await))
}

async fn session_status(
    Path(source_id): Path<SourceId>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let registry =
        manager::registry().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    registry
        .snapshot(&source_id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no session for {}", source_id)))
}

async fn stop_session(Path(source_id): Path<SourceId>) -> ApiJsonResult<StopResponse> {
    let stopped = manager::registry()?.evict(&source_id).await;
    if stopped {
        log::info!("{}: session stopped on request", source_id);
    }
    Ok(Json(StopResponse { source_id, stopped }))
}
