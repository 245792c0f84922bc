use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use task_queue::QueueStore;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;

pub use config::Config;
pub use error::GatewayError;
pub use ingest::{Ingestor, JobPaths, MediaType, UploadName};

#[derive(Clone)]
pub struct AppState {
	pub queue: Arc<dyn QueueStore>,
	pub ingestor: Arc<Ingestor>,
}

/// Builds the gateway router. Request bodies above `max_upload_bytes` are refused.
pub fn app(state: AppState, max_upload_bytes: usize) -> Router {
	Router::new()
		.route("/upload", post(handlers::upload::upload))
		.route("/api/upload", post(handlers::upload::upload))
		.route("/health", get(handlers::health::health))
		.route("/ready", get(handlers::health::ready))
		.route("/tasks/:id", get(handlers::tasks::task_status))
		.with_state(state)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(DefaultBodyLimit::disable())
				.layer(RequestBodyLimitLayer::new(max_upload_bytes)),
		)
}
