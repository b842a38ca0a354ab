use axum::Router;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub(crate) fn app() -> Router {
    Router::new()
        .nest("/stream", crate::handler::stream::stream_router())
        .nest("/relay", crate::handler::relay::relay_router())
}

/// Serves the HTTP API until `cancel` fires. A bind failure cancels too, so
/// the process exits instead of running without a listener.
pub(crate) fn start_api_server(listen: String, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Error binding API server to {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app())
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error running API server: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
