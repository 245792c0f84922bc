mod config;
mod metrics;

use anyhow::Result;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{shutdown, telemetry, FfmpegConverter, QueueStore, RedisQueue, WorkerPool};
use tokio::net::TcpListener;

use config::Config;

const REDIS_MAX_RETRIES: u32 = 5;
const REDIS_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
	dotenvy::dotenv().ok();
	let config = Config::parse();
	config.validate()?;
	telemetry::init_tracing(&config.rust_log, config.log_json)?;

	tracing::info!(
		pool_size = config.pool.pool_size,
		ffmpeg = %config.pool.ffmpeg_path,
		lease = ?config.queue.lease_duration,
		job_timeout = ?config.pool.job_timeout,
		max_attempts = config.queue.max_attempts,
		"starting media worker"
	);

	let queue: Arc<dyn QueueStore> = Arc::new(RedisQueue::connect_with_retry(config.queue.clone(), REDIS_MAX_RETRIES, REDIS_INITIAL_BACKOFF).await?);
	let converter = Arc::new(FfmpegConverter::new(config.pool.ffmpeg_path.clone()));

	let registry = Registry::new();
	let pool = WorkerPool::new(queue, converter, config.pool.clone(), &registry)?;

	let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.metrics_port))).await?;
	tracing::info!(addr = %listener.local_addr()?, "serving metrics");

	let shutdown_token = shutdown::cancel_on_signal();
	let handle = pool.spawn(shutdown_token.clone());

	let server_token = shutdown_token.clone();
	let server = tokio::spawn(async move {
		axum::serve(listener, metrics::router(registry))
			.with_graceful_shutdown(async move { server_token.cancelled().await })
			.await
	});

	shutdown_token.cancelled().await;
	tracing::info!(grace = ?config.pool.shutdown_grace, "draining workers");
	handle.wait().await;

	match server.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => tracing::error!(error = %e, "metrics server failed"),
		Err(e) => tracing::error!(error = %e, "metrics server task panicked"),
	}

	tracing::info!("media worker stopped");
	Ok(())
}
