//! Server binary.
//!
//! Wires up:
//! - ffmpeg encoder, SQLite store and upload-dir source locator
//! - orchestrator and delivery services
//! - HTTP router with static chunk and upload serving

use rendition::adapters::ffmpeg::FfmpegEncoder;
use rendition::adapters::fs::UploadDirLocator;
use rendition::adapters::http::{self, AppState};
use rendition::adapters::sqlite::SqliteRepository;
use rendition::application::{delivery::DeliveryService, orchestrator::OrchestratorService};
use rendition::domain::layout::ChunkLayout;
use rendition::Config;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "rendition=info,tower_http=info,sqlx=warn";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(fmt::layer())
        .init();

    tokio::fs::create_dir_all(&config.chunks_root).await?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    // 1. Adapters
    let repo = Arc::new(SqliteRepository::connect(&config.database_url, config.max_db_connections).await?);
    let encoder = Arc::new(FfmpegEncoder::new(&config.ffmpeg_bin, &config.ffprobe_bin));
    let locator = Arc::new(UploadDirLocator::new(&config.upload_dir, "/uploads"));
    let layout = ChunkLayout::new(&config.chunks_root);

    // 2. Application services
    let orchestrator = Arc::new(OrchestratorService::new(
        encoder,
        repo.clone(),
        layout.clone(),
        config.max_concurrent_encodes,
    ));
    let delivery = Arc::new(DeliveryService::new(repo, locator, layout, "/chunks"));
    info!(
        max_concurrent_encodes = config.max_concurrent_encodes,
        chunks_root = %config.chunks_root.display(),
        "services ready"
    );

    // 3. HTTP
    let app = http::router(
        AppState {
            orchestrator,
            delivery,
        },
        &config.chunks_root,
        &config.upload_dir,
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %config.bind_addr(), "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
