use std::{sync::Arc, time::Duration};

use relay_bus::{CommandLauncher, SourceRegistry};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;

const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("nvr_relay", log::LevelFilter::Debug)
        .filter_module("relay_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();
    let directory = config::load_directory(config.sources_path()).unwrap_or_else(|e| {
        log::error!("Error loading source directory: {:#}", e);
        std::process::exit(1);
    });
    log::info!(
        "{} sources configured, transcoder {}",
        directory.len(),
        config.ffmpeg()
    );

    let registry = SourceRegistry::new(
        Arc::new(directory),
        Arc::new(CommandLauncher::ffmpeg(config.ffmpeg())),
        config.relay_options(),
    );
    manager::init(registry.clone());

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    let server = api::start_api_server(config.listen().to_string(), cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, shutting down");
                cancel.cancel();
            },
        }
    }

    // open streams only end once their sessions are gone
    registry.shutdown().await;
    if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server).await.is_err() {
        log::warn!("API server did not stop within {:?}", SERVER_DRAIN_TIMEOUT);
    }

    std::process::exit(0);
}
