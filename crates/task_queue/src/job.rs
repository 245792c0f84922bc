use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job type handled by the conversion worker.
pub const EXTRACT_AUDIO: &str = "extract_audio";

/// Recorded on a job whose last allowed lease expired without a result.
pub const LEASE_EXPIRED_ON_FINAL_ATTEMPT: &str = "lease expired on final attempt";

pub type JobId = String;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	Pending,
	Leased,
	Completed,
	Retrying,
	DeadLetter,
}

impl JobState {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Leased => "leased",
			Self::Completed => "completed",
			Self::Retrying => "retrying",
			Self::DeadLetter => "dead_letter",
		}
	}

	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::DeadLetter)
	}
}

impl fmt::Display for JobState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for JobState {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(Self::Pending),
			"leased" => Ok(Self::Leased),
			"completed" => Ok(Self::Completed),
			"retrying" => Ok(Self::Retrying),
			"dead_letter" => Ok(Self::DeadLetter),
			other => Err(format!("unknown job state: {other}")),
		}
	}
}

/// Source and destination of one conversion.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtractPayload {
	pub input: String,
	pub output: String,
}

impl ExtractPayload {
	/// # Errors
	/// Returns an error if the payload cannot be serialized.
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	/// # Errors
	/// Returns an error if `raw` is not a JSON `{input, output}` object.
	pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(raw)
	}
}

/// A queued unit of work as seen by a store reader.
///
/// `payload` is kept as the exact string handed to `enqueue`; the store never
/// re-encodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
	pub id: JobId,
	#[serde(rename = "type")]
	pub job_type: String,
	pub payload: String,
	pub state: JobState,
	pub attempts: u32,
	pub max_attempts: u32,
	pub lease_expiry: Option<DateTime<Utc>>,
	pub ready_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Job {
	#[must_use]
	pub fn new(id: JobId, job_type: impl Into<String>, payload: impl Into<String>, max_attempts: u32, now: DateTime<Utc>) -> Self {
		Self {
			id,
			job_type: job_type.into(),
			payload: payload.into(),
			state: JobState::Pending,
			attempts: 0,
			max_attempts,
			lease_expiry: None,
			ready_at: None,
			last_error: None,
			created_at: now,
			updated_at: now,
		}
	}

	/// The fencing token of the lease this copy was handed out with.
	#[must_use]
	pub fn lease(&self) -> Lease {
		Lease {
			job_id: self.id.clone(),
			attempt: self.attempts,
		}
	}

	#[must_use]
	pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
		self.state == JobState::Leased && self.lease_expiry.is_some_and(|expiry| expiry <= now)
	}
}

impl fmt::Display for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}[{}] {} attempt {}/{}", self.job_type, self.id, self.state, self.attempts, self.max_attempts)
	}
}

/// Identifies one grant of a lease. `ack` and `fail` only take effect while
/// the job is still leased under the same attempt number.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Lease {
	pub job_id: JobId,
	pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckOutcome {
	Completed,
	/// The lease was reclaimed or re-granted before the ack arrived.
	Stale,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailOutcome {
	Retrying { attempts: u32, delay: std::time::Duration },
	DeadLettered { attempts: u32 },
	Stale,
}

/// Number of live jobs per non-terminal state, plus the dead-letter backlog.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct QueueDepth {
	pub pending: u64,
	pub retrying: u64,
	pub leased: u64,
	pub dead_letter: u64,
}
