pub mod backoff;
pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod memory_queue;
pub mod metrics;
pub mod pool;
pub mod redis_queue;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use config::{PoolConfig, QueueConfig};
pub use converter::{ConversionError, ConversionRequest, Converter, FfmpegConverter, StubConverter, StubOutcome};
pub use error::{ConfigError, QueueError};
pub use job::{AckOutcome, ExtractPayload, FailOutcome, Job, JobId, JobState, Lease, QueueDepth, EXTRACT_AUDIO, LEASE_EXPIRED_ON_FINAL_ATTEMPT};
pub use memory_queue::MemoryQueue;
pub use metrics::PoolMetrics;
pub use pool::{PoolHandle, WorkerPool};
pub use redis_queue::RedisQueue;
pub use store::QueueStore;
pub use worker::{JobOutcome, Worker};
