use crate::config::PoolConfig;
use crate::converter::{ConversionError, ConversionRequest, Converter};
use crate::job::{AckOutcome, ExtractPayload, FailOutcome, Job, Lease, EXTRACT_AUDIO};
use crate::metrics::PoolMetrics;
use crate::store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Longest pause after the store refuses a lease call.
const STORE_ERROR_DELAY: Duration = Duration::from_secs(1);

/// How a single delivery ended from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
	Completed,
	Retrying { attempts: u32, delay: Duration },
	DeadLettered { attempts: u32 },
	/// The lease was lost before the result could be recorded.
	Stale,
	/// Shutdown interrupted the conversion. The attempt is given back and the
	/// lease is left to expire.
	Abandoned,
	/// The result could not be recorded; the lease is left to expire.
	StoreError,
}

/// Leases jobs one at a time and runs each through the converter.
pub struct Worker {
	id: usize,
	store: Arc<dyn QueueStore>,
	converter: Arc<dyn Converter>,
	config: PoolConfig,
	metrics: PoolMetrics,
	cancel: CancellationToken,
}

impl Worker {
	#[must_use]
	pub fn new(id: usize, store: Arc<dyn QueueStore>, converter: Arc<dyn Converter>, config: PoolConfig, metrics: PoolMetrics, cancel: CancellationToken) -> Self {
		Self {
			id,
			store,
			converter,
			config,
			metrics,
			cancel,
		}
	}

	/// Runs until the cancellation token fires. No new lease is taken after
	/// that; a conversion already running gets the shutdown grace period.
	pub async fn run(&self) {
		tracing::debug!(worker = self.id, "worker started");
		loop {
			let leased = tokio::select! {
				biased;
				() = self.cancel.cancelled() => break,
				leased = self.store.lease(Some(self.config.poll_timeout)) => leased,
			};

			match leased {
				Ok(Some(job)) => {
					self.process(job).await;
				}
				Ok(None) => {}
				Err(e) => {
					tracing::warn!(worker = self.id, error = %e, "failed to lease a job");
					tokio::select! {
						() = self.cancel.cancelled() => break,
						() = tokio::time::sleep(self.config.poll_timeout.min(STORE_ERROR_DELAY)) => {}
					}
				}
			}
		}
		tracing::debug!(worker = self.id, "worker stopped");
	}

	/// Converts one leased job and records the result in the store.
	pub async fn process(&self, job: Job) -> JobOutcome {
		let span = tracing::info_span!("job", worker = self.id, job_id = %job.id, attempt = job.attempts);
		self.process_leased(job).instrument(span).await
	}

	async fn process_leased(&self, job: Job) -> JobOutcome {
		let lease = job.lease();
		tracing::info!(job_type = %job.job_type, "processing job");

		let result = match self.request_for(&job) {
			Ok(request) => {
				let converted = self.converter.convert(&request, &self.cancel).await;
				converted.map(|diagnostics| {
					tracing::debug!(output = %diagnostics.summary(), "conversion tool output");
					request
				})
			}
			Err(e) => Err(e),
		};

		match result {
			Ok(request) => match self.store.ack(&lease).await {
				Ok(AckOutcome::Completed) => {
					self.metrics.completed.inc();
					tracing::info!(output = %request.output.display(), "job completed");
					JobOutcome::Completed
				}
				Ok(AckOutcome::Stale) => {
					self.metrics.stale.inc();
					tracing::warn!("lease lost before ack, result discarded by the store");
					JobOutcome::Stale
				}
				Err(e) => {
					tracing::error!(error = %e, "failed to ack job");
					JobOutcome::StoreError
				}
			},
			Err(ConversionError::Cancelled) => {
				match self.store.abandon(lease).await {
					Ok(true) => tracing::info!("conversion interrupted by shutdown, attempt returned and lease left to expire"),
					Ok(false) => tracing::warn!("conversion interrupted by shutdown after the lease was lost"),
					Err(e) => tracing::warn!(error = %e, "conversion interrupted by shutdown, attempt could not be returned"),
				}
				JobOutcome::Abandoned
			}
			Err(e) => self.record_failure(&lease, &e).await,
		}
	}

	fn request_for(&self, job: &Job) -> Result<ConversionRequest, ConversionError> {
		if job.job_type != EXTRACT_AUDIO {
			return Err(ConversionError::InvalidPayload(format!("unsupported job type {}", job.job_type)));
		}
		let payload = ExtractPayload::from_json(&job.payload).map_err(|e| ConversionError::InvalidPayload(e.to_string()))?;
		Ok(ConversionRequest {
			input: payload.input.into(),
			output: payload.output.into(),
			timeout: self.config.job_timeout,
			grace: self.config.shutdown_grace,
		})
	}

	async fn record_failure(&self, lease: &Lease, error: &ConversionError) -> JobOutcome {
		self.metrics.failed.with_label_values(&[error.kind()]).inc();
		if error.is_configuration() {
			tracing::error!(kind = error.kind(), error = %error, "conversion failed, check worker configuration");
		} else {
			tracing::warn!(kind = error.kind(), error = %error, "conversion failed");
		}

		match self.store.fail(lease, &error.to_string()).await {
			Ok(FailOutcome::Retrying { attempts, delay }) => {
				tracing::info!(attempts, ?delay, "job scheduled for retry");
				JobOutcome::Retrying { attempts, delay }
			}
			Ok(FailOutcome::DeadLettered { attempts }) => {
				self.metrics.dead_lettered.inc();
				tracing::error!(attempts, last_error = %error, "job moved to dead letter");
				JobOutcome::DeadLettered { attempts }
			}
			Ok(FailOutcome::Stale) => {
				self.metrics.stale.inc();
				tracing::warn!("lease lost before failure was recorded");
				JobOutcome::Stale
			}
			Err(e) => {
				tracing::error!(error = %e, "failed to record job failure");
				JobOutcome::StoreError
			}
		}
	}
}
