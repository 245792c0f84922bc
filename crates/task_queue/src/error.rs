use std::num::TryFromIntError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
	#[error("Queue backend unavailable: {0}")]
	Unavailable(String),
	#[error("Job not found: {0}")]
	NotFound(String),
	#[error("Corrupt job record {id}: {reason}")]
	Corrupt { id: String, reason: String },
	#[error("JSON error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("Integer conversion failed: {0}")]
	IntConversion(String),
}

impl QueueError {
	/// Whether retrying the same call later may succeed.
	#[must_use]
	pub const fn is_transient(&self) -> bool {
		matches!(self, Self::Unavailable(_))
	}
}

impl From<redis::RedisError> for QueueError {
	fn from(error: redis::RedisError) -> Self {
		Self::Unavailable(error.to_string())
	}
}

impl From<TryFromIntError> for QueueError {
	fn from(error: TryFromIntError) -> Self {
		Self::IntConversion(error.to_string())
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("{0} must be at least 1")]
	MustBePositive(&'static str),
	#[error("lease duration ({lease}s) must exceed the job timeout ({timeout}s)")]
	LeaseShorterThanTimeout { lease: u64, timeout: u64 },
	#[error("backoff base ({base}s) must not exceed backoff cap ({cap}s)")]
	BackoffBaseAboveCap { base: u64, cap: u64 },
}
