use crate::error::ConfigError;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every process that talks to the queue backend.
#[derive(Args, Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
	#[arg(long, env = "REDIS_ADDR", default_value = "127.0.0.1:6379", help = "Queue backend address (host:port)")]
	pub redis_addr: String,

	#[arg(long, env = "QUEUE_NAMESPACE", default_value = "media", help = "Key prefix for all queue records")]
	pub namespace: String,

	#[arg(
        long = "lease-duration-secs",
        env = "LEASE_DURATION_SECS",
        default_value = "300",
        value_parser = parse_duration,
        help = "How long a leased job stays invisible to other workers"
    )]
	pub lease_duration: Duration,

	#[arg(long, env = "MAX_ATTEMPTS", default_value = "5", help = "Execution attempts before a job is dead-lettered")]
	pub max_attempts: u32,

	#[arg(
        long = "backoff-base-secs",
        env = "BACKOFF_BASE_SECS",
        default_value = "5",
        value_parser = parse_duration,
        help = "Base delay for exponential retry backoff"
    )]
	pub backoff_base: Duration,

	#[arg(
        long = "backoff-cap-secs",
        env = "BACKOFF_CAP_SECS",
        default_value = "600",
        value_parser = parse_duration,
        help = "Upper bound for a single retry delay"
    )]
	pub backoff_cap: Duration,

	#[arg(
        long = "completed-retention-secs",
        env = "COMPLETED_RETENTION_SECS",
        default_value = "3600",
        value_parser = parse_duration,
        help = "How long completed job records are kept"
    )]
	pub completed_retention: Duration,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			redis_addr: "127.0.0.1:6379".to_string(),
			namespace: "media".to_string(),
			lease_duration: Duration::from_secs(300),
			max_attempts: 5,
			backoff_base: Duration::from_secs(5),
			backoff_cap: Duration::from_secs(600),
			completed_retention: Duration::from_secs(3600),
		}
	}
}

impl QueueConfig {
	#[must_use]
	pub fn redis_url(&self) -> String {
		if self.redis_addr.contains("://") {
			self.redis_addr.clone()
		} else {
			format!("redis://{}/", self.redis_addr)
		}
	}

	/// # Errors
	/// Returns an error when a value cannot describe a working queue.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_attempts == 0 {
			return Err(ConfigError::MustBePositive("max_attempts"));
		}
		if self.lease_duration.is_zero() {
			return Err(ConfigError::MustBePositive("lease_duration"));
		}
		if self.backoff_base > self.backoff_cap {
			return Err(ConfigError::BackoffBaseAboveCap {
				base: self.backoff_base.as_secs(),
				cap: self.backoff_cap.as_secs(),
			});
		}
		Ok(())
	}

	#[cfg(any(test, feature = "test-util"))]
	pub fn test() -> Self {
		Self {
			namespace: format!("test-{}", uuid::Uuid::new_v4().simple()),
			lease_duration: Duration::from_millis(200),
			max_attempts: 3,
			backoff_base: Duration::from_millis(10),
			backoff_cap: Duration::from_millis(40),
			completed_retention: Duration::from_secs(60),
			..Self::default()
		}
	}
}

/// Worker pool sizing and per-job execution limits.
#[derive(Args, Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
	#[arg(long, env = "WORKER_POOL_SIZE", default_value = "4", help = "Number of concurrent workers")]
	pub pool_size: usize,

	#[arg(
        long = "job-timeout-secs",
        env = "JOB_TIMEOUT_SECS",
        default_value = "240",
        value_parser = parse_duration,
        help = "Deadline for a single conversion"
    )]
	pub job_timeout: Duration,

	#[arg(
        long = "shutdown-grace-secs",
        env = "SHUTDOWN_GRACE_SECS",
        default_value = "10",
        value_parser = parse_duration,
        help = "Time in-flight conversions get to finish after shutdown is requested"
    )]
	pub shutdown_grace: Duration,

	#[arg(
        long = "sweep-interval-secs",
        env = "SWEEP_INTERVAL_SECS",
        default_value = "15",
        value_parser = parse_duration,
        help = "Interval between lease-expiry sweeps"
    )]
	pub sweep_interval: Duration,

	#[arg(
        long = "heartbeat-interval-secs",
        env = "HEARTBEAT_INTERVAL_SECS",
        default_value = "30",
        value_parser = parse_duration,
        help = "Interval between queue depth samples"
    )]
	pub heartbeat_interval: Duration,

	#[arg(
        long = "poll-timeout-secs",
        env = "POLL_TIMEOUT_SECS",
        default_value = "5",
        value_parser = parse_duration,
        help = "How long a worker waits on an empty queue before polling again"
    )]
	pub poll_timeout: Duration,

	#[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg", help = "Path of the conversion tool")]
	pub ffmpeg_path: String,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			pool_size: 4,
			job_timeout: Duration::from_secs(240),
			shutdown_grace: Duration::from_secs(10),
			sweep_interval: Duration::from_secs(15),
			heartbeat_interval: Duration::from_secs(30),
			poll_timeout: Duration::from_secs(5),
			ffmpeg_path: "ffmpeg".to_string(),
		}
	}
}

impl PoolConfig {
	/// # Errors
	/// Returns an error when the pool cannot run with these values, including
	/// a lease that would expire before the job deadline fires.
	pub fn validate(&self, queue: &QueueConfig) -> Result<(), ConfigError> {
		if self.pool_size == 0 {
			return Err(ConfigError::MustBePositive("pool_size"));
		}
		if self.sweep_interval.is_zero() {
			return Err(ConfigError::MustBePositive("sweep_interval"));
		}
		if self.heartbeat_interval.is_zero() {
			return Err(ConfigError::MustBePositive("heartbeat_interval"));
		}
		if queue.lease_duration <= self.job_timeout {
			return Err(ConfigError::LeaseShorterThanTimeout {
				lease: queue.lease_duration.as_secs(),
				timeout: self.job_timeout.as_secs(),
			});
		}
		Ok(())
	}
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}
