use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use media_gateway::handlers::upload::UploadResponse;
use media_gateway::{AppState, Ingestor};
use std::path::Path;
use std::sync::Arc;
use prometheus::Registry;
use std::time::Duration;
use task_queue::converter::STUB_WAV;
use task_queue::{
	AckOutcome, ExtractPayload, FailOutcome, Job, JobId, JobState, Lease, MemoryQueue, PoolConfig, QueueConfig, QueueDepth, QueueError, QueueStore, StubConverter, StubOutcome, WorkerPool, EXTRACT_AUDIO,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const BOUNDARY: &str = "media-gateway-test-boundary";
const MAX_UPLOAD: usize = 1024 * 1024;

/// A backend that refuses every call.
struct DownQueue;

#[async_trait]
impl QueueStore for DownQueue {
	async fn enqueue(&self, _job_type: &str, _payload: &str) -> Result<JobId, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn try_lease(&self) -> Result<Option<Job>, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn ack(&self, _lease: &Lease) -> Result<AckOutcome, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn fail(&self, _lease: &Lease, _reason: &str) -> Result<FailOutcome, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn abandon(&self, _lease: Lease) -> Result<bool, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn sweep_expired(&self) -> Result<usize, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn get(&self, _id: &str) -> Result<Option<Job>, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn depth(&self) -> Result<QueueDepth, QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
	async fn ping(&self) -> Result<(), QueueError> {
		Err(QueueError::Unavailable("connection refused".into()))
	}
}

struct Harness {
	app: Router,
	staging: tempfile::TempDir,
	output: tempfile::TempDir,
}

fn harness(queue: Arc<dyn QueueStore>) -> Harness {
	let staging = tempfile::tempdir().unwrap();
	let output = tempfile::tempdir().unwrap();
	let state = AppState {
		queue,
		ingestor: Arc::new(Ingestor::new(staging.path(), output.path())),
	};
	Harness {
		app: media_gateway::app(state, MAX_UPLOAD),
		staging,
		output,
	}
}

fn multipart(uri: &str, field: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
	let mut body = Vec::new();
	body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
	body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n").as_bytes());
	body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
	body.extend_from_slice(bytes);
	body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

	Request::builder()
		.method("POST")
		.uri(uri)
		.header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
		.body(Body::from(body))
		.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
	axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn staged_files(dir: &Path) -> Vec<String> {
	std::fs::read_dir(dir).unwrap().map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned()).collect()
}

#[tokio::test]
async fn mp4_upload_is_staged_and_queued() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	let response = h.app.clone().oneshot(multipart("/upload", "file", "holiday.mp4", "video/mp4", b"\x00\x00\x00\x18ftypmp42")).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let reply: UploadResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert_eq!(reply.message, "Your file is being processed");
	assert!(!reply.task_id.is_empty());

	let job = queue.get(&reply.task_id).await.unwrap().unwrap();
	assert_eq!(job.job_type, EXTRACT_AUDIO);
	assert_eq!(job.state, JobState::Pending);
	assert_eq!(job.attempts, 0);

	let payload = ExtractPayload::from_json(&job.payload).unwrap();
	let input = Path::new(&payload.input);
	let output = Path::new(&payload.output);
	assert_eq!(input.parent().unwrap(), h.staging.path());
	assert_eq!(output.parent().unwrap(), h.output.path());
	assert!(input.file_name().unwrap().to_string_lossy().starts_with("holiday_"));
	assert_eq!(input.extension().unwrap(), "mp4");
	assert_eq!(output.extension().unwrap(), "wav");
	assert_eq!(std::fs::read(input).unwrap(), b"\x00\x00\x00\x18ftypmp42");
	assert_eq!(staged_files(h.staging.path()).len(), 1);
}

#[tokio::test]
async fn api_upload_route_is_an_alias() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	let response = h.app.oneshot(multipart("/api/upload", "file", "voice.wav", "audio/x-wav", b"RIFF")).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(queue.depth().await.unwrap().pending, 1);
}

#[tokio::test]
async fn same_filename_twice_gets_distinct_paths() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	let mut payloads = Vec::new();
	for _ in 0..2 {
		let response = h.app.clone().oneshot(multipart("/upload", "file", "clip.mp3", "audio/mpeg", b"ID3")).await.unwrap();
		let reply: UploadResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
		let job = queue.get(&reply.task_id).await.unwrap().unwrap();
		payloads.push(ExtractPayload::from_json(&job.payload).unwrap());
	}

	assert_ne!(payloads[0].input, payloads[1].input);
	assert_ne!(payloads[0].output, payloads[1].output);
	assert_eq!(staged_files(h.staging.path()).len(), 2);
}

#[tokio::test]
async fn unsupported_type_is_rejected_without_a_job() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	let response = h.app.oneshot(multipart("/upload", "file", "notes.txt", "text/plain", b"hello")).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
	assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn mismatched_or_bare_filenames_are_rejected() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	for filename in ["clip.wav", "clip", ".mp4", "clip."] {
		let response = h.app.clone().oneshot(multipart("/upload", "file", filename, "video/mp4", b"data")).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{filename} should be rejected");
	}
	assert_eq!(queue.depth().await.unwrap().pending, 0);
	assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn missing_file_field_is_a_bad_request() {
	let h = harness(Arc::new(MemoryQueue::new(QueueConfig::default())));

	let response = h.app.oneshot(multipart("/upload", "attachment", "clip.mp4", "video/mp4", b"data")).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn queue_outage_fails_the_request_and_cleans_up() {
	let h = harness(Arc::new(DownQueue));

	let response = h.app.oneshot(multipart("/upload", "file", "clip.mp4", "video/mp4", b"data")).await.unwrap();
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn oversized_upload_is_refused() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());

	let response = h.app.oneshot(multipart("/upload", "file", "big.mp4", "video/mp4", &vec![0_u8; MAX_UPLOAD + 1])).await.unwrap();
	assert!(response.status().is_client_error());
	assert_eq!(queue.depth().await.unwrap().pending, 0);
	assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn task_status_reports_the_job() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
	let h = harness(queue.clone());
	let id = queue.enqueue(EXTRACT_AUDIO, r#"{"input":"a.mp4","output":"a.wav"}"#).await.unwrap();

	let response = h.app.clone().oneshot(Request::get(format!("/tasks/{id}")).body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let status: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert_eq!(status["state"], "pending");
	assert_eq!(status["type"], EXTRACT_AUDIO);
	assert_eq!(status["attempts"], 0);

	let response = h.app.oneshot(Request::get("/tasks/unknown").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_stays_up_while_readiness_follows_the_queue() {
	let up = harness(Arc::new(MemoryQueue::new(QueueConfig::default())));
	let response = up.app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_bytes(response).await, b"OK");
	let response = up.app.oneshot(Request::get("/ready").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let down = harness(Arc::new(DownQueue));
	let response = down.app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_bytes(response).await, b"OK");
	let response = down.app.oneshot(Request::get("/ready").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn uploaded_file_is_converted_by_the_worker_pool() {
	let queue = Arc::new(MemoryQueue::new(QueueConfig::test()));
	let h = harness(queue.clone());

	let response = h.app.clone().oneshot(multipart("/upload", "file", "interview.mp4", "video/mp4", b"\x00\x00\x00\x18ftypmp42")).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let reply: UploadResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();

	let pool_config = PoolConfig {
		pool_size: 1,
		job_timeout: Duration::from_millis(150),
		poll_timeout: Duration::from_millis(20),
		sweep_interval: Duration::from_millis(50),
		heartbeat_interval: Duration::from_millis(50),
		..PoolConfig::default()
	};
	let converter = Arc::new(StubConverter::always(StubOutcome::Succeed));
	let handle = WorkerPool::new(queue.clone(), converter, pool_config, &Registry::new()).unwrap().spawn(CancellationToken::new());

	let mut status = serde_json::Value::Null;
	for _ in 0..300 {
		let response = h.app.clone().oneshot(Request::get(format!("/tasks/{}", reply.task_id)).body(Body::empty()).unwrap()).await.unwrap();
		status = serde_json::from_slice(&body_bytes(response).await).unwrap();
		if status["state"] == "completed" {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	handle.shutdown();
	handle.wait().await;

	assert_eq!(status["state"], "completed");
	assert_eq!(status["attempts"], 1);
	let job = queue.get(&reply.task_id).await.unwrap().unwrap();
	let payload = ExtractPayload::from_json(&job.payload).unwrap();
	assert_eq!(std::fs::read(&payload.output).unwrap(), STUB_WAV);
	assert_eq!(Path::new(&payload.output).parent().unwrap(), h.output.path());
}
