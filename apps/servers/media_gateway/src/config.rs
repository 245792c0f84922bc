use clap::Parser;
use std::path::PathBuf;
use task_queue::{ConfigError, QueueConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "media_gateway")]
#[command(about = "Accepts media uploads and queues audio extraction jobs", long_about = None)]
pub struct Config {
	/// HTTP listen port
	#[arg(long, env = "PORT", default_value = "3000")]
	pub port: u16,

	/// Directory uploads are staged in before a worker picks them up
	#[arg(long, env = "STAGING_DIR", default_value = "./uploads")]
	pub staging_dir: PathBuf,

	/// Directory extracted audio is written to
	#[arg(long, env = "OUTPUT_DIR", default_value = "./processed")]
	pub output_dir: PathBuf,

	/// Largest accepted request body, in megabytes
	#[arg(long, env = "MAX_UPLOAD_MB", default_value = "100")]
	pub max_upload_mb: usize,

	#[arg(long, env = "RUST_LOG", default_value = "info")]
	pub rust_log: String,

	/// Emit logs as JSON lines
	#[arg(long, env = "LOG_JSON")]
	pub log_json: bool,

	#[command(flatten)]
	pub queue: QueueConfig,
}

impl Config {
	/// # Errors
	/// Returns the first invalid setting.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_upload_mb == 0 {
			return Err(ConfigError::MustBePositive("max_upload_mb"));
		}
		self.queue.validate()
	}

	#[must_use]
	pub const fn max_upload_bytes(&self) -> usize {
		self.max_upload_mb.saturating_mul(1024 * 1024)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let config = Config::parse_from(["media_gateway"]);
		assert_eq!(config.port, 3000);
		assert_eq!(config.staging_dir, PathBuf::from("./uploads"));
		assert_eq!(config.output_dir, PathBuf::from("./processed"));
		assert_eq!(config.max_upload_bytes(), 100 * 1024 * 1024);
		assert_eq!(config.queue.namespace, "media");
		assert!(config.validate().is_ok());
	}

	#[test]
	fn rejects_zero_upload_limit() {
		let config = Config::parse_from(["media_gateway", "--max-upload-mb", "0"]);
		assert_eq!(config.validate(), Err(ConfigError::MustBePositive("max_upload_mb")));
	}
}
