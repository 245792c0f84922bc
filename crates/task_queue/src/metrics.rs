use crate::job::QueueDepth;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Counters and gauges exported by the worker pool.
#[derive(Clone)]
pub struct PoolMetrics {
	pub completed: IntCounter,
	pub failed: IntCounterVec,
	pub dead_lettered: IntCounter,
	pub stale: IntCounter,
	pub active_workers: IntGauge,
	pub queue_depth: IntGaugeVec,
}

impl PoolMetrics {
	/// Creates the pool metrics and registers them with `registry`.
	///
	/// # Errors
	/// Fails when a metric with the same name is already registered.
	pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
		let completed = IntCounter::new("media_jobs_completed_total", "Jobs converted and acknowledged")?;
		let failed = IntCounterVec::new(Opts::new("media_jobs_failed_total", "Failed conversion attempts by error kind"), &["kind"])?;
		let dead_lettered = IntCounter::new("media_jobs_dead_lettered_total", "Jobs moved to the dead-letter set")?;
		let stale = IntCounter::new("media_jobs_stale_total", "Acks or failures that arrived after the lease was lost")?;
		let active_workers = IntGauge::new("media_worker_pool_active_workers", "Workers currently running")?;
		let queue_depth = IntGaugeVec::new(Opts::new("media_queue_depth", "Jobs per queue state"), &["state"])?;

		registry.register(Box::new(completed.clone()))?;
		registry.register(Box::new(failed.clone()))?;
		registry.register(Box::new(dead_lettered.clone()))?;
		registry.register(Box::new(stale.clone()))?;
		registry.register(Box::new(active_workers.clone()))?;
		registry.register(Box::new(queue_depth.clone()))?;

		Ok(Self {
			completed,
			failed,
			dead_lettered,
			stale,
			active_workers,
			queue_depth,
		})
	}

	pub fn record_depth(&self, depth: &QueueDepth) {
		for (state, count) in [("pending", depth.pending), ("retrying", depth.retrying), ("leased", depth.leased), ("dead_letter", depth.dead_letter)] {
			self.queue_depth.with_label_values(&[state]).set(i64::try_from(count).unwrap_or(i64::MAX));
		}
	}
}
