use crate::backoff::retry_delay;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{AckOutcome, FailOutcome, Job, JobId, JobState, Lease, QueueDepth, LEASE_EXPIRED_ON_FINAL_ATTEMPT};
use crate::store::{chrono_duration, QueueStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process queue store for single-binary deployments and tests.
///
/// All bookkeeping sits behind one mutex, so every operation is a critical
/// section and `try_lease` cannot hand the same job to two callers. Nothing
/// survives a restart.
pub struct MemoryQueue {
	config: QueueConfig,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	jobs: HashMap<JobId, Job>,
	pending: VecDeque<JobId>,
	retrying: Vec<JobId>,
	leased: Vec<JobId>,
	dead_letter: Vec<JobId>,
}

impl Inner {
	/// Expired leases go back to `pending`, or to `dead_letter` when the
	/// expired lease was the job's last allowed attempt.
	fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
		let jobs = &mut self.jobs;
		let mut reclaimed = Vec::new();
		let mut exhausted = Vec::new();
		self.leased.retain(|id| match jobs.get_mut(id) {
			Some(job) if job.lease_expired(now) => {
				job.lease_expiry = None;
				job.updated_at = now;
				if job.attempts >= job.max_attempts {
					job.state = JobState::DeadLetter;
					job.last_error = Some(LEASE_EXPIRED_ON_FINAL_ATTEMPT.to_string());
					exhausted.push(id.clone());
				} else {
					job.state = JobState::Pending;
					reclaimed.push(id.clone());
				}
				false
			}
			Some(_) => true,
			None => false,
		});
		for id in &exhausted {
			tracing::warn!(job_id = %id, "lease expired on final attempt, job moved to dead letter");
		}
		let count = reclaimed.len() + exhausted.len();
		self.pending.extend(reclaimed);
		self.dead_letter.extend(exhausted);
		count
	}

	fn promote_due_retries(&mut self, now: DateTime<Utc>) {
		let jobs = &mut self.jobs;
		let mut due: Vec<(DateTime<Utc>, JobId)> = Vec::new();
		self.retrying.retain(|id| match jobs.get_mut(id) {
			Some(job) if job.ready_at.is_some_and(|ready| ready <= now) => {
				due.push((job.ready_at.unwrap_or(now), id.clone()));
				job.state = JobState::Pending;
				job.ready_at = None;
				job.updated_at = now;
				false
			}
			Some(_) => true,
			None => false,
		});
		due.sort();
		self.pending.extend(due.into_iter().map(|(_, id)| id));
	}

	fn purge_completed(&mut self, now: DateTime<Utc>, retention: chrono::Duration) {
		self.jobs
			.retain(|_, job| job.state != JobState::Completed || job.updated_at.checked_add_signed(retention).map_or(true, |until| until > now));
	}

	/// The job behind `lease`, if it is still held under that attempt.
	fn held(&mut self, lease: &Lease) -> Option<&mut Job> {
		self.jobs
			.get_mut(&lease.job_id)
			.filter(|job| job.state == JobState::Leased && job.attempts == lease.attempt)
	}

	fn release_lease(&mut self, id: &str) {
		self.leased.retain(|leased| leased != id);
	}
}

impl MemoryQueue {
	#[must_use]
	pub fn new(config: QueueConfig) -> Self {
		Self {
			config,
			inner: Mutex::new(Inner::default()),
		}
	}

	#[must_use]
	pub const fn config(&self) -> &QueueConfig {
		&self.config
	}
}

#[async_trait]
impl QueueStore for MemoryQueue {
	async fn enqueue(&self, job_type: &str, payload: &str) -> Result<JobId, QueueError> {
		let id = Uuid::new_v4().to_string();
		let job = Job::new(id.clone(), job_type, payload, self.config.max_attempts, Utc::now());

		let mut inner = self.inner.lock().await;
		inner.jobs.insert(id.clone(), job);
		inner.pending.push_back(id.clone());
		drop(inner);

		tracing::debug!(job_id = %id, job_type, "job enqueued");
		Ok(id)
	}

	async fn try_lease(&self) -> Result<Option<Job>, QueueError> {
		let now = Utc::now();
		let mut inner = self.inner.lock().await;
		inner.reclaim_expired(now);
		inner.promote_due_retries(now);

		while let Some(id) = inner.pending.pop_front() {
			let Some(job) = inner.jobs.get_mut(&id) else { continue };
			if job.state != JobState::Pending {
				continue;
			}
			job.state = JobState::Leased;
			job.attempts += 1;
			job.lease_expiry = Some(now + chrono_duration(self.config.lease_duration));
			job.updated_at = now;
			let leased = job.clone();
			inner.leased.push(id);
			return Ok(Some(leased));
		}
		Ok(None)
	}

	async fn ack(&self, lease: &Lease) -> Result<AckOutcome, QueueError> {
		let now = Utc::now();
		let mut inner = self.inner.lock().await;
		let Some(job) = inner.held(lease) else {
			return Ok(AckOutcome::Stale);
		};
		job.state = JobState::Completed;
		job.lease_expiry = None;
		job.updated_at = now;
		inner.release_lease(&lease.job_id);
		Ok(AckOutcome::Completed)
	}

	async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError> {
		let now = Utc::now();
		let mut inner = self.inner.lock().await;
		let Some(job) = inner.held(lease) else {
			return Ok(FailOutcome::Stale);
		};
		job.lease_expiry = None;
		job.last_error = Some(reason.to_string());
		job.updated_at = now;
		let attempts = job.attempts;

		let outcome = if attempts < job.max_attempts {
			let delay = retry_delay(self.config.backoff_base, self.config.backoff_cap, attempts);
			job.state = JobState::Retrying;
			job.ready_at = Some(now + chrono_duration(delay));
			inner.retrying.push(lease.job_id.clone());
			FailOutcome::Retrying { attempts, delay }
		} else {
			job.state = JobState::DeadLetter;
			inner.dead_letter.push(lease.job_id.clone());
			FailOutcome::DeadLettered { attempts }
		};
		inner.release_lease(&lease.job_id);
		Ok(outcome)
	}

	async fn abandon(&self, lease: Lease) -> Result<bool, QueueError> {
		let mut inner = self.inner.lock().await;
		let Some(job) = inner.held(&lease) else {
			return Ok(false);
		};
		job.attempts = job.attempts.saturating_sub(1);
		job.updated_at = Utc::now();
		Ok(true)
	}

	async fn sweep_expired(&self) -> Result<usize, QueueError> {
		let now = Utc::now();
		let mut inner = self.inner.lock().await;
		let reclaimed = inner.reclaim_expired(now);
		inner.purge_completed(now, chrono_duration(self.config.completed_retention));
		Ok(reclaimed)
	}

	async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
		Ok(self.inner.lock().await.jobs.get(id).cloned())
	}

	async fn depth(&self) -> Result<QueueDepth, QueueError> {
		let inner = self.inner.lock().await;
		Ok(QueueDepth {
			pending: inner.pending.len() as u64,
			retrying: inner.retrying.len() as u64,
			leased: inner.leased.len() as u64,
			dead_letter: inner.dead_letter.len() as u64,
		})
	}

	async fn ping(&self) -> Result<(), QueueError> {
		Ok(())
	}

	fn poll_interval(&self) -> Duration {
		Duration::from_millis(10)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::EXTRACT_AUDIO;
	use std::collections::HashSet;
	use std::sync::Arc;

	const PAYLOAD: &str = r#"{"input":"./uploads/a_1.mp4","output":"./processed/a_1.wav"}"#;

	fn queue() -> MemoryQueue {
		MemoryQueue::new(QueueConfig::test())
	}

	#[tokio::test]
	async fn enqueue_then_lease_returns_identical_payload() -> Result<(), QueueError> {
		let queue = queue();
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;

		let pending = queue.get(&id).await?.unwrap();
		assert_eq!(pending.state, JobState::Pending);
		assert_eq!(pending.attempts, 0);

		let job = queue.lease(None).await?.unwrap();
		assert_eq!(job.id, id);
		assert_eq!(job.payload, PAYLOAD);
		assert_eq!(job.job_type, EXTRACT_AUDIO);
		assert_eq!(job.state, JobState::Leased);
		assert_eq!(job.attempts, 1);
		assert!(job.lease_expiry.is_some());
		Ok(())
	}

	#[tokio::test]
	async fn empty_poll_does_not_touch_attempts() -> Result<(), QueueError> {
		let queue = queue();
		assert!(queue.lease(None).await?.is_none());
		assert!(queue.lease(Some(Duration::from_millis(30))).await?.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn concurrent_leases_never_share_a_job() -> Result<(), QueueError> {
		let queue = Arc::new(queue());
		for _ in 0..50 {
			queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;
		}

		let mut handles = Vec::new();
		for _ in 0..80 {
			let queue = Arc::clone(&queue);
			handles.push(tokio::spawn(async move { queue.try_lease().await }));
		}

		let mut seen = HashSet::new();
		let mut leased = 0;
		for handle in handles {
			if let Some(job) = handle.await.unwrap()? {
				leased += 1;
				assert!(seen.insert(job.id), "job handed out twice");
			}
		}
		assert_eq!(leased, 50);
		Ok(())
	}

	#[tokio::test]
	async fn ack_completes_and_late_ack_is_stale() -> Result<(), QueueError> {
		let queue = queue();
		queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;
		let job = queue.lease(None).await?.unwrap();

		assert_eq!(queue.ack(&job.lease()).await?, AckOutcome::Completed);
		assert_eq!(queue.get(&job.id).await?.unwrap().state, JobState::Completed);
		assert_eq!(queue.ack(&job.lease()).await?, AckOutcome::Stale);
		assert!(queue.lease(None).await?.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn expired_lease_is_redelivered_with_attempts_kept() -> Result<(), QueueError> {
		let queue = queue();
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;
		let first = queue.lease(None).await?.unwrap();
		assert!(queue.lease(None).await?.is_none());

		tokio::time::sleep(queue.config().lease_duration + Duration::from_millis(50)).await;

		let second = queue.lease(None).await?.unwrap();
		assert_eq!(second.id, id);
		assert_eq!(second.attempts, 2);

		// the abandoned worker finishing late must not complete the job
		assert_eq!(queue.ack(&first.lease()).await?, AckOutcome::Stale);
		assert_eq!(queue.fail(&first.lease(), "late").await?, FailOutcome::Stale);
		assert_eq!(queue.ack(&second.lease()).await?, AckOutcome::Completed);
		Ok(())
	}

	#[tokio::test]
	async fn sweep_returns_expired_leases_to_pending() -> Result<(), QueueError> {
		let queue = queue();
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;
		queue.lease(None).await?.unwrap();
		assert_eq!(queue.sweep_expired().await?, 0);

		tokio::time::sleep(queue.config().lease_duration + Duration::from_millis(50)).await;
		assert_eq!(queue.sweep_expired().await?, 1);

		let job = queue.get(&id).await?.unwrap();
		assert_eq!(job.state, JobState::Pending);
		assert_eq!(job.attempts, 1);
		Ok(())
	}

	#[tokio::test]
	async fn failures_back_off_then_dead_letter_at_max_attempts() -> Result<(), QueueError> {
		let queue = queue();
		let max = queue.config().max_attempts;
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;

		let mut delays = Vec::new();
		for attempt in 1..=max {
			let job = queue.lease(Some(Duration::from_secs(2))).await?.expect("job should be redelivered");
			assert_eq!(job.attempts, attempt);
			match queue.fail(&job.lease(), "exit status 1").await? {
				FailOutcome::Retrying { attempts, delay } => {
					assert_eq!(attempts, attempt);
					assert_eq!(queue.get(&id).await?.unwrap().state, JobState::Retrying);
					delays.push(delay);
				}
				FailOutcome::DeadLettered { attempts } => {
					assert_eq!(attempt, max);
					assert_eq!(attempts, max);
				}
				FailOutcome::Stale => panic!("lease should be held"),
			}
		}

		assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "backoff must grow: {delays:?}");
		let job = queue.get(&id).await?.unwrap();
		assert_eq!(job.state, JobState::DeadLetter);
		assert_eq!(job.attempts, max);
		assert_eq!(job.last_error.as_deref(), Some("exit status 1"));

		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(queue.lease(None).await?.is_none());
		assert_eq!(queue.depth().await?.dead_letter, 1);
		Ok(())
	}

	#[tokio::test]
	async fn expired_final_attempt_is_dead_lettered() -> Result<(), QueueError> {
		let queue = MemoryQueue::new(QueueConfig {
			max_attempts: 2,
			..QueueConfig::test()
		});
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;

		let first = queue.lease(None).await?.unwrap();
		queue.fail(&first.lease(), "exit status 1").await?;
		let second = queue.lease(Some(Duration::from_secs(2))).await?.unwrap();
		assert_eq!(second.attempts, 2);

		tokio::time::sleep(queue.config().lease_duration + Duration::from_millis(50)).await;
		assert!(queue.lease(None).await?.is_none(), "exhausted job must not be leased again");

		let job = queue.get(&id).await?.unwrap();
		assert_eq!(job.state, JobState::DeadLetter);
		assert_eq!(job.attempts, 2);
		assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_ON_FINAL_ATTEMPT));
		assert_eq!(queue.fail(&second.lease(), "late").await?, FailOutcome::Stale);
		assert_eq!(queue.depth().await?.dead_letter, 1);
		Ok(())
	}

	#[tokio::test]
	async fn abandoned_final_attempt_is_not_counted() -> Result<(), QueueError> {
		let queue = MemoryQueue::new(QueueConfig {
			max_attempts: 1,
			..QueueConfig::test()
		});
		let id = queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;

		let job = queue.lease(None).await?.unwrap();
		assert!(queue.abandon(job.lease()).await?);
		assert!(!queue.abandon(job.lease()).await?, "a second abandon is stale");

		let held = queue.get(&id).await?.unwrap();
		assert_eq!(held.state, JobState::Leased);
		assert_eq!(held.attempts, 0);
		assert!(queue.lease(None).await?.is_none(), "the lease stays in place until it expires");

		tokio::time::sleep(queue.config().lease_duration + Duration::from_millis(50)).await;
		let again = queue.lease(None).await?.unwrap();
		assert_eq!(again.id, id);
		assert_eq!(again.attempts, 1);
		assert_eq!(queue.fail(&again.lease(), "exit status 1").await?, FailOutcome::DeadLettered { attempts: 1 });
		Ok(())
	}

	#[tokio::test]
	async fn retrying_job_waits_for_backoff() -> Result<(), QueueError> {
		let config = QueueConfig {
			backoff_base: Duration::from_millis(200),
			backoff_cap: Duration::from_secs(5),
			..QueueConfig::test()
		};
		let queue = MemoryQueue::new(config);
		queue.enqueue(EXTRACT_AUDIO, PAYLOAD).await?;
		let job = queue.lease(None).await?.unwrap();
		queue.fail(&job.lease(), "boom").await?;

		assert!(queue.lease(None).await?.is_none(), "retry must not be visible before its delay");
		let again = queue.lease(Some(Duration::from_secs(2))).await?.unwrap();
		assert_eq!(again.attempts, 2);
		assert_eq!(again.last_error.as_deref(), Some("boom"));
		Ok(())
	}
}
