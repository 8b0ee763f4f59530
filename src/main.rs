mod config;
mod error;
mod extractor;
mod metadata;
mod pipeline;
mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::Config,
    error::ApiError,
    extractor::YtDlpClient,
    pipeline::{DownloadPipeline, PipelineSettings, sweep_stale_artifacts},
    routes::{AppState, SERVICE_NAME, build_router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "solidarity_media_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create work directory {:?}: {error}",
                config.work_dir
            ))
        })?;
    sweep_stale_artifacts(&config.work_dir, config.stale_artifact_seconds).await;

    let client = YtDlpClient::new(config.yt_dlp_bin.clone());
    if !client.is_available().await {
        warn!(
            "{:?} is not runnable. Metadata and download requests will fail until it is installed.",
            client.binary()
        );
    }

    let pipeline = DownloadPipeline::new(Arc::new(client), PipelineSettings::from_config(&config));
    let app = build_router(AppState {
        pipeline: Arc::new(pipeline),
    });

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("Starting {SERVICE_NAME} on http://{}", config.bind_addr);
    info!("Work directory: {:?}", config.work_dir);
    info!("Evasion profile: {:?}", config.evasion_profile);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
