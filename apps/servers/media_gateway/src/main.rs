use anyhow::{Context, Result};
use clap::Parser;
use media_gateway::{AppState, Config, Ingestor};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{shutdown, telemetry, RedisQueue};
use tokio::net::TcpListener;

const REDIS_MAX_RETRIES: u32 = 5;
const REDIS_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	let config = Config::parse();
	config.validate()?;
	telemetry::init_tracing(&config.rust_log, config.log_json)?;

	let staging_dir = prepare_dir(&config.staging_dir).await?;
	let output_dir = prepare_dir(&config.output_dir).await?;
	let queue = RedisQueue::connect_with_retry(config.queue.clone(), REDIS_MAX_RETRIES, REDIS_INITIAL_BACKOFF).await?;

	let state = AppState {
		queue: Arc::new(queue),
		ingestor: Arc::new(Ingestor::new(&staging_dir, &output_dir)),
	};
	let app = media_gateway::app(state, config.max_upload_bytes());

	let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
	tracing::info!(
		addr = %listener.local_addr()?,
		staging_dir = %staging_dir.display(),
		output_dir = %output_dir.display(),
		max_upload_mb = config.max_upload_mb,
		"media gateway listening"
	);

	let shutdown_token = shutdown::cancel_on_signal();
	axum::serve(listener, app)
		.with_graceful_shutdown(async move { shutdown_token.cancelled().await })
		.await?;

	tracing::info!("media gateway stopped");
	Ok(())
}

/// Creates `dir` if needed and returns its absolute path, so queued jobs
/// stay valid for workers started from another directory.
async fn prepare_dir(dir: &Path) -> Result<PathBuf> {
	tokio::fs::create_dir_all(dir).await.with_context(|| format!("cannot create {}", dir.display()))?;
	tokio::fs::canonicalize(dir).await.with_context(|| format!("cannot resolve {}", dir.display()))
}
