use crate::config::PoolConfig;
use crate::converter::Converter;
use crate::metrics::PoolMetrics;
use crate::store::QueueStore;
use crate::worker::Worker;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
	config: PoolConfig,
	store: Arc<dyn QueueStore>,
	converter: Arc<dyn Converter>,
	metrics: PoolMetrics,
}

impl WorkerPool {
	/// # Errors
	/// Returns an error if the pool metrics cannot be registered.
	pub fn new(store: Arc<dyn QueueStore>, converter: Arc<dyn Converter>, config: PoolConfig, registry: &Registry) -> Result<Self, prometheus::Error> {
		let metrics = PoolMetrics::register(registry)?;
		Ok(Self {
			config,
			store,
			converter,
			metrics,
		})
	}

	#[must_use]
	pub const fn metrics(&self) -> &PoolMetrics {
		&self.metrics
	}

	/// Starts `pool_size` workers plus the lease sweeper and the depth
	/// sampler. Everything stops once `cancel` fires.
	#[must_use]
	pub fn spawn(self, cancel: CancellationToken) -> PoolHandle {
		let mut workers = Vec::with_capacity(self.config.pool_size);
		for id in 0..self.config.pool_size {
			let worker = Worker::new(id, Arc::clone(&self.store), Arc::clone(&self.converter), self.config.clone(), self.metrics.clone(), cancel.child_token());
			let active = self.metrics.active_workers.clone();
			active.inc();
			workers.push(tokio::spawn(async move {
				worker.run().await;
				active.dec();
			}));
		}

		let background = vec![
			tokio::spawn(sweep_loop(Arc::clone(&self.store), self.config.sweep_interval, cancel.child_token())),
			tokio::spawn(depth_loop(Arc::clone(&self.store), self.metrics.clone(), self.config.heartbeat_interval, cancel.child_token())),
		];

		tracing::info!(workers = self.config.pool_size, "worker pool started");
		PoolHandle { cancel, workers, background }
	}
}

/// Owns the tasks started by [`WorkerPool::spawn`].
pub struct PoolHandle {
	cancel: CancellationToken,
	workers: Vec<JoinHandle<()>>,
	background: Vec<JoinHandle<()>>,
}

impl PoolHandle {
	/// Stops leasing new jobs. Running conversions get the shutdown grace period.
	pub fn shutdown(&self) {
		self.cancel.cancel();
	}

	/// Waits for every worker and background task to exit.
	pub async fn wait(self) {
		for (id, handle) in self.workers.into_iter().enumerate() {
			if let Err(e) = handle.await {
				tracing::error!(worker = id, error = %e, "worker task panicked");
			}
		}
		for handle in self.background {
			if let Err(e) = handle.await {
				tracing::error!(error = %e, "background task panicked");
			}
		}
		tracing::info!("worker pool stopped");
	}
}

async fn sweep_loop(store: Arc<dyn QueueStore>, every: Duration, cancel: CancellationToken) {
	let mut ticker = tokio::time::interval(every);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}
		match store.sweep_expired().await {
			Ok(0) => {}
			Ok(reclaimed) => tracing::info!(reclaimed, "returned expired leases to pending"),
			Err(e) => tracing::warn!(error = %e, "lease sweep failed"),
		}
	}
}

async fn depth_loop(store: Arc<dyn QueueStore>, metrics: PoolMetrics, every: Duration, cancel: CancellationToken) {
	let mut ticker = tokio::time::interval(every);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}
		match store.depth().await {
			Ok(depth) => {
				metrics.record_depth(&depth);
				tracing::debug!(?depth, "queue depth");
			}
			Err(e) => tracing::warn!(error = %e, "failed to sample queue depth"),
		}
	}
}
