use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::instrument;

/// Liveness only; a queue outage must not get a healthy gateway restarted.
#[instrument(name = "health")]
pub async fn health() -> &'static str {
	"OK"
}

#[instrument(name = "ready", skip(state))]
pub async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
	match state.queue.ping().await {
		Ok(()) => (StatusCode::OK, "OK"),
		Err(e) => {
			tracing::warn!(error = %e, "queue backend unreachable");
			(StatusCode::SERVICE_UNAVAILABLE, "queue unavailable")
		}
	}
}
