use std::time::Duration;

/// Exponential retry delay: `base * 2^attempts`, never above `cap`.
///
/// Saturates instead of overflowing, so very large attempt counts simply
/// return `cap`.
#[must_use]
pub fn retry_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
	let factor = 2_u32.checked_pow(attempts).unwrap_or(u32::MAX);
	base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}
