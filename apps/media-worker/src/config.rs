use clap::Parser;
use task_queue::{ConfigError, PoolConfig, QueueConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "media-worker")]
#[command(about = "Extracts audio tracks from queued media uploads", long_about = None)]
pub struct Config {
	/// Port serving /metrics and /health
	#[arg(long, env = "METRICS_PORT", default_value = "9100")]
	pub metrics_port: u16,

	#[arg(long, env = "RUST_LOG", default_value = "info")]
	pub rust_log: String,

	/// Emit logs as JSON lines
	#[arg(long, env = "LOG_JSON")]
	pub log_json: bool,

	#[command(flatten)]
	pub queue: QueueConfig,

	#[command(flatten)]
	pub pool: PoolConfig,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.queue.validate()?;
		self.pool.validate(&self.queue)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn defaults_are_valid() {
		let config = Config::parse_from(["media-worker"]);
		assert_eq!(config.metrics_port, 9100);
		assert_eq!(config.pool.pool_size, 4);
		assert_eq!(config.pool.ffmpeg_path, "ffmpeg");
		assert!(config.validate().is_ok());
	}

	#[test]
	fn lease_must_outlive_job_timeout() {
		let config = Config::parse_from(["media-worker", "--lease-duration-secs", "60", "--job-timeout-secs", "120"]);
		assert_eq!(config.queue.lease_duration, Duration::from_secs(60));
		assert_eq!(config.validate(), Err(ConfigError::LeaseShorterThanTimeout { lease: 60, timeout: 120 }));
	}

	#[test]
	fn pool_size_must_be_positive() {
		let config = Config::parse_from(["media-worker", "--pool-size", "0"]);
		assert_eq!(config.validate(), Err(ConfigError::MustBePositive("pool_size")));
	}
}
