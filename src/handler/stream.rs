use axum::{
    Router,
    body::Body,
    extract::Path,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use relay_bus::{HttpSink, SourceId, SourceRegistry, sink::CONTENT_TYPE};

use crate::{handler::ApiResult, manager};

pub fn stream_router() -> Router {
    Router::new().route("/{source_id}", get(open_stream))
}

async fn open_stream(Path(source_id): Path<SourceId>) -> ApiResult<Response> {
    open(manager::registry()?, &source_id).await
}

/// Attaches a viewer and answers with an endless MJPEG multipart body. Errors
/// are returned before any byte of the body is committed.
pub(crate) async fn open(registry: &SourceRegistry, source_id: &SourceId) -> ApiResult<Response> {
    let lease = registry.acquire(source_id).await?;
    lease.wait_ready().await?;
    log::info!(
        "{}: viewer connected ({} watching)",
        source_id,
        lease.session().subscriber_count()
    );

    let body = Body::from_stream(HttpSink::new(lease).into_stream());
    Ok((
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        body,
    )
        .into_response())
}
