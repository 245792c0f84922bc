use crate::{error::GatewayError, AppState};
use axum::extract::{Path, State};
use axum::Json;
use task_queue::Job;

/// Current state of a queued job, for polling clients.
pub async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>, GatewayError> {
	state.queue.get(&id).await?.map(Json).ok_or(GatewayError::TaskNotFound(id))
}
