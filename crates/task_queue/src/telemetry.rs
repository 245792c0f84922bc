use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, layer::SubscriberExt, util::SubscriberInitExt, Layer};

const FALLBACK_FILTER: &str = "info";

/// Installs the global subscriber: pretty output, or flattened JSON lines
/// when `json` is set. An unparsable `filter` falls back to `info`.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(filter: &str, json: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
	let (env_filter, rejected) = match EnvFilter::try_new(filter) {
		Ok(env_filter) => (env_filter, None),
		Err(e) => (EnvFilter::new(FALLBACK_FILTER), Some(e)),
	};

	tracing_subscriber::registry()
		.with(if json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.fmt_fields(JsonFields::default())
					.event_format(tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false))
					.with_filter(env_filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(tracing_subscriber::fmt::layer().event_format(tracing_subscriber::fmt::format().pretty()).with_filter(env_filter))
		})
		.try_init()?;

	if let Some(e) = rejected {
		tracing::warn!(filter, error = %e, "invalid log filter, using {FALLBACK_FILTER}");
	}
	Ok(())
}
