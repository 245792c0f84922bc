use crate::{error::GatewayError, AppState};
use axum::extract::{Multipart, State};
use axum::Json;
use serde::{Deserialize, Serialize};

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
	pub message: String,
	pub task_id: String,
}

/// Accepts a multipart `file` field and answers as soon as the job is queued.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<UploadResponse>, GatewayError> {
	while let Some(field) = multipart.next_field().await? {
		if field.name() != Some(UPLOAD_FIELD) {
			continue;
		}
		let filename = field.file_name().map(str::to_owned);
		let content_type = field.content_type().map(str::to_owned);
		let task_id = state.ingestor.ingest(state.queue.as_ref(), filename.as_deref(), content_type.as_deref(), field).await?;

		return Ok(Json(UploadResponse {
			message: "Your file is being processed".to_string(),
			task_id,
		}));
	}
	Err(GatewayError::MissingFile)
}
