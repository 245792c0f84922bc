use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use task_queue::QueueError;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("Unsupported media type: {0}")]
	UnsupportedMediaType(String),

	#[error("Invalid filename: {0}")]
	InvalidFilename(String),

	#[error("Multipart field `file` is missing")]
	MissingFile,

	#[error("Malformed multipart body: {0}")]
	Multipart(#[from] MultipartError),

	#[error("Task not found: {0}")]
	TaskNotFound(String),

	#[error("Error saving file: {0}")]
	Staging(#[from] std::io::Error),

	#[error("Error queuing task: {0}")]
	Queue(#[from] QueueError),

	#[error("Payload encoding failed: {0}")]
	Payload(#[from] serde_json::Error),
}

impl GatewayError {
	pub const fn status_code(&self) -> StatusCode {
		match self {
			Self::UnsupportedMediaType(_) | Self::InvalidFilename(_) | Self::MissingFile | Self::Multipart(_) => StatusCode::BAD_REQUEST,
			Self::TaskNotFound(_) => StatusCode::NOT_FOUND,
			Self::Staging(_) | Self::Queue(_) | Self::Payload(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			tracing::error!(error = %self, "request failed");
		} else {
			tracing::debug!(error = %self, "request rejected");
		}
		(status, Json(ErrorBody { error: self.to_string() })).into_response()
	}
}
