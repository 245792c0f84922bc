use crate::backoff::retry_delay;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{AckOutcome, FailOutcome, Job, JobId, JobState, Lease, QueueDepth};
use crate::store::QueueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use uuid::Uuid;

// Every script reads the server clock so lease expiry never depends on the
// caller's wall time.
const CLOCK: &str = r"
redis.replicate_commands()
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

// KEYS: pending, leased, retrying, dead_letter. ARGV[1]: job key prefix.
const RECLAIM: &str = r"
local function reclaim()
	local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
	for _, id in ipairs(expired) do
		local key = ARGV[1] .. id
		redis.call('ZREM', KEYS[2], id)
		local attempts = tonumber(redis.call('HGET', key, 'attempts'))
		if attempts >= tonumber(redis.call('HGET', key, 'max_attempts')) then
			redis.call('HSET', key, 'state', 'dead_letter', 'lease_expiry', '', 'last_error', 'lease expired on final attempt', 'updated_at', now)
			redis.call('ZADD', KEYS[4], now, id)
		else
			redis.call('HSET', key, 'state', 'pending', 'lease_expiry', '', 'updated_at', now)
			redis.call('ZADD', KEYS[1], now, id)
		end
	end
	return #expired
end

local function promote()
	local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now, 'WITHSCORES')
	for i = 1, #due, 2 do
		local id = due[i]
		redis.call('ZREM', KEYS[3], id)
		redis.call('HSET', ARGV[1] .. id, 'state', 'pending', 'ready_at', '', 'updated_at', now)
		redis.call('ZADD', KEYS[1], due[i + 1], id)
	end
end
";

// KEYS: job key, pending. ARGV: id, type, payload, max_attempts.
const ENQUEUE: &str = r"
redis.call('HSET', KEYS[1],
	'id', ARGV[1], 'type', ARGV[2], 'payload', ARGV[3], 'state', 'pending',
	'attempts', 0, 'max_attempts', ARGV[4], 'created_at', now, 'updated_at', now)
redis.call('ZADD', KEYS[2], now, ARGV[1])
return now
";

// KEYS: pending, leased, retrying, dead_letter. ARGV: prefix, lease_ms.
const LEASE: &str = r"
reclaim()
promote()
while true do
	local head = redis.call('ZRANGE', KEYS[1], 0, 0)
	if #head == 0 then
		return false
	end
	local id = head[1]
	redis.call('ZREM', KEYS[1], id)
	local key = ARGV[1] .. id
	if redis.call('HGET', key, 'state') == 'pending' then
		local expiry = now + tonumber(ARGV[2])
		redis.call('HINCRBY', key, 'attempts', 1)
		redis.call('HSET', key, 'state', 'leased', 'lease_expiry', expiry, 'updated_at', now)
		redis.call('ZADD', KEYS[2], expiry, id)
		return redis.call('HGETALL', key)
	end
end
";

// KEYS: pending, leased, retrying, dead_letter. ARGV: prefix.
const SWEEP: &str = r"
return reclaim()
";

// KEYS: leased. ARGV: prefix, id, attempt, retention_secs.
const ACK: &str = r"
local key = ARGV[1] .. ARGV[2]
if redis.call('HGET', key, 'state') ~= 'leased' or redis.call('HGET', key, 'attempts') ~= ARGV[3] then
	return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HSET', key, 'state', 'completed', 'lease_expiry', '', 'updated_at', now)
redis.call('EXPIRE', key, ARGV[4])
return 1
";

// ARGV: prefix, id, attempt.
const ABANDON: &str = r"
local key = ARGV[1] .. ARGV[2]
if redis.call('HGET', key, 'state') ~= 'leased' or redis.call('HGET', key, 'attempts') ~= ARGV[3] then
	return 0
end
redis.call('HINCRBY', key, 'attempts', -1)
redis.call('HSET', key, 'updated_at', now)
return 1
";

// KEYS: leased, retrying, dead_letter. ARGV: prefix, id, attempt, reason, delay_ms.
const FAIL: &str = r"
local key = ARGV[1] .. ARGV[2]
local attempts = redis.call('HGET', key, 'attempts')
if redis.call('HGET', key, 'state') ~= 'leased' or attempts ~= ARGV[3] then
	return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
if tonumber(attempts) < tonumber(redis.call('HGET', key, 'max_attempts')) then
	local ready = now + tonumber(ARGV[5])
	redis.call('HSET', key, 'state', 'retrying', 'ready_at', ready, 'lease_expiry', '', 'last_error', ARGV[4], 'updated_at', now)
	redis.call('ZADD', KEYS[2], ready, ARGV[2])
	return 1
end
redis.call('HSET', key, 'state', 'dead_letter', 'lease_expiry', '', 'last_error', ARGV[4], 'updated_at', now)
redis.call('ZADD', KEYS[3], now, ARGV[2])
return 2
";

struct Scripts {
	enqueue: Script,
	lease: Script,
	sweep: Script,
	ack: Script,
	abandon: Script,
	fail: Script,
}

impl Scripts {
	fn new() -> Self {
		Self {
			enqueue: Script::new(&format!("{CLOCK}{ENQUEUE}")),
			lease: Script::new(&format!("{CLOCK}{RECLAIM}{LEASE}")),
			sweep: Script::new(&format!("{CLOCK}{RECLAIM}{SWEEP}")),
			ack: Script::new(&format!("{CLOCK}{ACK}")),
			abandon: Script::new(&format!("{CLOCK}{ABANDON}")),
			fail: Script::new(&format!("{CLOCK}{FAIL}")),
		}
	}
}

#[derive(Debug, Clone)]
struct Keys {
	job_prefix: String,
	pending: String,
	leased: String,
	retrying: String,
	dead_letter: String,
}

impl Keys {
	fn new(namespace: &str) -> Self {
		Self {
			job_prefix: format!("{namespace}:job:"),
			pending: format!("{namespace}:pending"),
			leased: format!("{namespace}:leased"),
			retrying: format!("{namespace}:retrying"),
			dead_letter: format!("{namespace}:dead_letter"),
		}
	}

	fn job(&self, id: &str) -> String {
		format!("{}{id}", self.job_prefix)
	}
}

/// Redis-backed queue store shared by the gateway and worker processes.
///
/// Jobs live in one hash each; the sorted sets `pending`, `leased`,
/// `retrying` and `dead_letter` index them by state, scored by enqueue time,
/// lease expiry, retry time and death time respectively. Each state
/// transition is a single Lua script, which Redis runs atomically.
#[derive(Clone)]
pub struct RedisQueue {
	conn: ConnectionManager,
	config: QueueConfig,
	keys: Keys,
	scripts: std::sync::Arc<Scripts>,
}

impl RedisQueue {
	///
	/// # Errors
	/// This function returns an error if:
	/// - The configured address is not a valid Redis URL
	/// - The initial connection fails
	pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
		let client = Client::open(config.redis_url())?;
		let conn = ConnectionManager::new(client).await?;
		Ok(Self {
			conn,
			keys: Keys::new(&config.namespace),
			config,
			scripts: std::sync::Arc::new(Scripts::new()),
		})
	}

	/// Connects, retrying with exponential backoff starting at `initial_backoff`.
	///
	/// # Errors
	/// Returns the last connection error once `max_retries` attempts have failed.
	pub async fn connect_with_retry(config: QueueConfig, max_retries: u32, initial_backoff: std::time::Duration) -> Result<Self, QueueError> {
		let mut attempt = 1;
		loop {
			match Self::connect(config.clone()).await {
				Ok(queue) => {
					tracing::info!(addr = %config.redis_addr, namespace = %config.namespace, "connected to queue backend");
					return Ok(queue);
				}
				Err(e) if attempt >= max_retries => {
					tracing::error!(error = %e, addr = %config.redis_addr, attempts = attempt, "giving up on queue backend");
					return Err(e);
				}
				Err(e) => {
					let backoff = retry_delay(initial_backoff, initial_backoff * 16, attempt - 1);
					tracing::warn!(attempt, max_retries, ?backoff, error = %e, "queue backend connection failed, retrying");
					tokio::time::sleep(backoff).await;
					attempt += 1;
				}
			}
		}
	}

	#[must_use]
	pub const fn config(&self) -> &QueueConfig {
		&self.config
	}

	fn millis(duration: std::time::Duration) -> u64 {
		u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
	}
}

#[async_trait]
impl QueueStore for RedisQueue {
	async fn enqueue(&self, job_type: &str, payload: &str) -> Result<JobId, QueueError> {
		let id = Uuid::new_v4().to_string();
		let mut conn = self.conn.clone();
		let _: i64 = self
			.scripts
			.enqueue
			.key(self.keys.job(&id))
			.key(&self.keys.pending)
			.arg(&id)
			.arg(job_type)
			.arg(payload)
			.arg(self.config.max_attempts)
			.invoke_async(&mut conn)
			.await?;

		tracing::debug!(job_id = %id, job_type, "job enqueued");
		Ok(id)
	}

	async fn try_lease(&self) -> Result<Option<Job>, QueueError> {
		let mut conn = self.conn.clone();
		let fields: Option<HashMap<String, String>> = self
			.scripts
			.lease
			.key(&self.keys.pending)
			.key(&self.keys.leased)
			.key(&self.keys.retrying)
			.key(&self.keys.dead_letter)
			.arg(&self.keys.job_prefix)
			.arg(Self::millis(self.config.lease_duration))
			.invoke_async(&mut conn)
			.await?;

		fields.map(job_from_fields).transpose()
	}

	async fn ack(&self, lease: &Lease) -> Result<AckOutcome, QueueError> {
		let mut conn = self.conn.clone();
		let acked: i64 = self
			.scripts
			.ack
			.key(&self.keys.leased)
			.arg(&self.keys.job_prefix)
			.arg(&lease.job_id)
			.arg(lease.attempt)
			.arg(self.config.completed_retention.as_secs().max(1))
			.invoke_async(&mut conn)
			.await?;

		Ok(if acked == 1 { AckOutcome::Completed } else { AckOutcome::Stale })
	}

	async fn abandon(&self, lease: Lease) -> Result<bool, QueueError> {
		let mut conn = self.conn.clone();
		let released: i64 = self
			.scripts
			.abandon
			.arg(&self.keys.job_prefix)
			.arg(&lease.job_id)
			.arg(lease.attempt)
			.invoke_async(&mut conn)
			.await?;
		Ok(released == 1)
	}

	async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError> {
		let delay = retry_delay(self.config.backoff_base, self.config.backoff_cap, lease.attempt);
		let mut conn = self.conn.clone();
		let outcome: i64 = self
			.scripts
			.fail
			.key(&self.keys.leased)
			.key(&self.keys.retrying)
			.key(&self.keys.dead_letter)
			.arg(&self.keys.job_prefix)
			.arg(&lease.job_id)
			.arg(lease.attempt)
			.arg(reason)
			.arg(Self::millis(delay))
			.invoke_async(&mut conn)
			.await?;

		Ok(match outcome {
			1 => FailOutcome::Retrying { attempts: lease.attempt, delay },
			2 => FailOutcome::DeadLettered { attempts: lease.attempt },
			_ => FailOutcome::Stale,
		})
	}

	async fn sweep_expired(&self) -> Result<usize, QueueError> {
		let mut conn = self.conn.clone();
		let reclaimed: i64 = self
			.scripts
			.sweep
			.key(&self.keys.pending)
			.key(&self.keys.leased)
			.key(&self.keys.retrying)
			.key(&self.keys.dead_letter)
			.arg(&self.keys.job_prefix)
			.invoke_async(&mut conn)
			.await?;
		Ok(usize::try_from(reclaimed)?)
	}

	async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
		let mut conn = self.conn.clone();
		let fields: HashMap<String, String> = redis::cmd("HGETALL").arg(self.keys.job(id)).query_async(&mut conn).await?;
		if fields.is_empty() {
			return Ok(None);
		}
		job_from_fields(fields).map(Some)
	}

	async fn depth(&self) -> Result<QueueDepth, QueueError> {
		let mut conn = self.conn.clone();
		let (pending, retrying, leased, dead_letter): (u64, u64, u64, u64) = redis::pipe()
			.zcard(&self.keys.pending)
			.zcard(&self.keys.retrying)
			.zcard(&self.keys.leased)
			.zcard(&self.keys.dead_letter)
			.query_async(&mut conn)
			.await?;

		Ok(QueueDepth {
			pending,
			retrying,
			leased,
			dead_letter,
		})
	}

	async fn ping(&self) -> Result<(), QueueError> {
		let mut conn = self.conn.clone();
		let _: String = redis::cmd("PING").query_async(&mut conn).await?;
		Ok(())
	}
}

fn job_from_fields(mut fields: HashMap<String, String>) -> Result<Job, QueueError> {
	let id = fields.remove("id").unwrap_or_default();
	let corrupt = |reason: String| QueueError::Corrupt { id: id.clone(), reason };

	let mut take = |name: &str| fields.remove(name).filter(|value| !value.is_empty());
	let job_type = take("type");
	let payload = take("payload");
	let state = take("state");
	let attempts = take("attempts");
	let max_attempts = take("max_attempts");
	let lease_expiry = take("lease_expiry");
	let ready_at = take("ready_at");
	let last_error = take("last_error");
	let created_at = take("created_at");
	let updated_at = take("updated_at");

	let number = |name: &str, value: Option<String>| -> Result<u32, QueueError> {
		value
			.ok_or_else(|| corrupt(format!("missing {name}")))?
			.parse()
			.map_err(|e| corrupt(format!("invalid {name}: {e}")))
	};
	let timestamp = |name: &str, value: Option<String>| -> Result<Option<DateTime<Utc>>, QueueError> {
		value
			.map(|raw| {
				raw.parse::<i64>()
					.ok()
					.and_then(DateTime::from_timestamp_millis)
					.ok_or_else(|| corrupt(format!("invalid {name}: {raw}")))
			})
			.transpose()
	};

	let state: JobState = state.ok_or_else(|| corrupt("missing state".into()))?.parse().map_err(corrupt)?;
	let created_at = timestamp("created_at", created_at)?.ok_or_else(|| corrupt("missing created_at".into()))?;

	Ok(Job {
		job_type: job_type.ok_or_else(|| corrupt("missing type".into()))?,
		payload: payload.unwrap_or_default(),
		state,
		attempts: number("attempts", attempts)?,
		max_attempts: number("max_attempts", max_attempts)?,
		lease_expiry: timestamp("lease_expiry", lease_expiry)?,
		ready_at: timestamp("ready_at", ready_at)?,
		last_error,
		updated_at: timestamp("updated_at", updated_at)?.unwrap_or(created_at),
		created_at,
		id,
	})
}
