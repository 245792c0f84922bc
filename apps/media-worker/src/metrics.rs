use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

/// Serves `GET /metrics` from `registry` and a plain `GET /health`.
pub fn router(registry: Registry) -> Router {
	Router::new().route("/metrics", get(metrics_handler)).route("/health", get(health)).with_state(registry)
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();

	if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
		tracing::error!(error = %e, "failed to encode metrics");
		return StatusCode::INTERNAL_SERVER_ERROR.into_response();
	}

	([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

async fn health() -> &'static str {
	"OK"
}
