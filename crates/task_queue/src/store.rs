use crate::error::QueueError;
use crate::job::{AckOutcome, FailOutcome, Job, JobId, Lease, QueueDepth};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Durable job storage with exclusive, time-bounded delivery.
///
/// Every job state change goes through this trait. Implementations must make
/// `try_lease` atomic across concurrent callers: two calls never hand out the
/// same job while its lease is valid.
#[async_trait]
pub trait QueueStore: Send + Sync {
	/// Stores a new `pending` job with zero attempts and returns its id.
	async fn enqueue(&self, job_type: &str, payload: &str) -> Result<JobId, QueueError>;

	/// Claims one deliverable job without waiting.
	///
	/// Expired leases are reclaimed and due retries promoted before a job is
	/// selected. The returned job is `leased` with `attempts` already
	/// incremented.
	async fn try_lease(&self) -> Result<Option<Job>, QueueError>;

	/// Resolves a lease as successful.
	async fn ack(&self, lease: &Lease) -> Result<AckOutcome, QueueError>;

	/// Resolves a lease as failed, scheduling a retry or dead-lettering the
	/// job once `max_attempts` is reached.
	async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError>;

	/// Gives back an attempt the holder could not finish, for example because
	/// the worker is shutting down. The lease itself stays in place until it
	/// expires; the caller must not use it again. Returns `false` when the
	/// lease was no longer held.
	async fn abandon(&self, lease: Lease) -> Result<bool, QueueError>;

	/// Returns every expired lease to `pending`, keeping its attempt count.
	/// A job whose expired lease was its last allowed attempt is moved to
	/// `dead_letter` instead.
	async fn sweep_expired(&self) -> Result<usize, QueueError>;

	async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

	async fn depth(&self) -> Result<QueueDepth, QueueError>;

	async fn ping(&self) -> Result<(), QueueError>;

	fn poll_interval(&self) -> Duration {
		DEFAULT_POLL_INTERVAL
	}

	/// Claims one job, waiting up to `timeout` for one to become available.
	///
	/// `None` or a zero timeout makes this a single non-blocking attempt.
	async fn lease(&self, timeout: Option<Duration>) -> Result<Option<Job>, QueueError> {
		let deadline = timeout.map(|t| Instant::now() + t);
		loop {
			if let Some(job) = self.try_lease().await? {
				return Ok(Some(job));
			}
			let remaining = match deadline {
				Some(deadline) => deadline.saturating_duration_since(Instant::now()),
				None => return Ok(None),
			};
			if remaining.is_zero() {
				return Ok(None);
			}
			tokio::time::sleep(self.poll_interval().min(remaining)).await;
		}
	}
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
	chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
