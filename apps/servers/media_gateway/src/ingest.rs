use crate::error::GatewayError;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use task_queue::{ExtractPayload, JobId, QueueStore, EXTRACT_AUDIO};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Declared upload types the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
	Mp4,
	Wav,
	Mp3,
}

impl MediaType {
	/// Parses a declared content type, ignoring parameters and case.
	///
	/// # Errors
	/// Returns `UnsupportedMediaType` for anything but mp4 video, wav or mpeg audio.
	pub fn from_content_type(content_type: &str) -> Result<Self, GatewayError> {
		let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
		match essence.as_str() {
			"video/mp4" => Ok(Self::Mp4),
			"audio/wav" | "audio/x-wav" => Ok(Self::Wav),
			"audio/mpeg" => Ok(Self::Mp3),
			_ => Err(GatewayError::UnsupportedMediaType(content_type.to_string())),
		}
	}

	#[must_use]
	pub const fn extension(self) -> &'static str {
		match self {
			Self::Mp4 => "mp4",
			Self::Wav => "wav",
			Self::Mp3 => "mp3",
		}
	}
}

/// A client filename reduced to a safe stem of a known media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadName {
	stem: String,
	media: MediaType,
}

/// Where a job reads its input and writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
	pub input: PathBuf,
	pub output: PathBuf,
}

impl UploadName {
	/// Keeps only the last path component and splits it on the last `.`.
	///
	/// # Errors
	/// Returns `InvalidFilename` when the stem or extension is empty, or the
	/// extension does not match `media`.
	pub fn parse(filename: &str, media: MediaType) -> Result<Self, GatewayError> {
		let base = filename.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(filename);
		let (stem, extension) = base
			.rsplit_once('.')
			.filter(|(stem, extension)| !stem.is_empty() && !extension.is_empty())
			.ok_or_else(|| GatewayError::InvalidFilename(format!("{filename:?} needs a name and an extension")))?;

		if !extension.eq_ignore_ascii_case(media.extension()) {
			return Err(GatewayError::InvalidFilename(format!(".{extension} does not match the declared .{} type", media.extension())));
		}

		Ok(Self { stem: sanitize(stem), media })
	}

	#[must_use]
	pub fn stem(&self) -> &str {
		&self.stem
	}

	/// Staged input `{stem}_{token}.{ext}` and output `{stem}_{token}.wav`.
	#[must_use]
	pub fn paths(&self, staging_dir: &Path, output_dir: &Path, token: &str) -> JobPaths {
		JobPaths {
			input: staging_dir.join(format!("{}_{token}.{}", self.stem, self.media.extension())),
			output: output_dir.join(format!("{}_{token}.wav", self.stem)),
		}
	}
}

fn sanitize(stem: &str) -> String {
	stem.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' }).collect()
}

/// Stages uploads on disk and turns them into queued extraction jobs.
#[derive(Debug, Clone)]
pub struct Ingestor {
	staging_dir: PathBuf,
	output_dir: PathBuf,
}

impl Ingestor {
	#[must_use]
	pub fn new(staging_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
		Self {
			staging_dir: staging_dir.into(),
			output_dir: output_dir.into(),
		}
	}

	#[must_use]
	pub fn staging_dir(&self) -> &Path {
		&self.staging_dir
	}

	/// Validates, stages and enqueues one upload, returning the job id.
	///
	/// The declared type and filename are checked before any byte is written.
	/// Nothing is left in the staging directory when this fails.
	///
	/// # Errors
	/// Validation failures come back as client errors; staging and queue
	/// failures as server errors.
	pub async fn ingest<S, B, E>(&self, queue: &dyn QueueStore, filename: Option<&str>, content_type: Option<&str>, body: S) -> Result<JobId, GatewayError>
	where
		S: Stream<Item = Result<B, E>>,
		B: AsRef<[u8]>,
		GatewayError: From<E>,
	{
		let content_type = content_type.ok_or_else(|| GatewayError::UnsupportedMediaType("missing content type".to_string()))?;
		let media = MediaType::from_content_type(content_type)?;
		let filename = filename.ok_or_else(|| GatewayError::InvalidFilename("missing filename".to_string()))?;
		let name = UploadName::parse(filename, media)?;

		let token = Uuid::new_v4().simple().to_string();
		let paths = name.paths(&self.staging_dir, &self.output_dir, &token);

		let staged = self.stage(body, &paths.input).await?;
		let payload = ExtractPayload {
			input: paths.input.display().to_string(),
			output: paths.output.display().to_string(),
		}
		.to_json()?;
		let job_id = queue.enqueue(EXTRACT_AUDIO, &payload).await?;
		staged.keep();

		tracing::info!(job_id = %job_id, filename, input = %paths.input.display(), "upload queued for audio extraction");
		Ok(job_id)
	}

	/// Streams `body` into a hidden temp file, syncs it, then renames it to
	/// `dest` so a partial upload never appears under its final name.
	async fn stage<S, B, E>(&self, body: S, dest: &Path) -> Result<StagedFile, GatewayError>
	where
		S: Stream<Item = Result<B, E>>,
		B: AsRef<[u8]>,
		GatewayError: From<E>,
	{
		let temp = tempfile::Builder::new().prefix(".upload-").suffix(".part").tempfile_in(&self.staging_dir)?.into_temp_path();
		let mut file = tokio::fs::OpenOptions::new().write(true).open(&temp).await?;

		tokio::pin!(body);
		let mut written: u64 = 0;
		while let Some(chunk) = body.next().await {
			let chunk = chunk?;
			file.write_all(chunk.as_ref()).await?;
			written += chunk.as_ref().len() as u64;
		}
		file.flush().await?;
		file.sync_all().await?;
		drop(file);

		temp.persist(dest).map_err(|e| e.error)?;
		tracing::debug!(path = %dest.display(), bytes = written, "upload staged");
		Ok(StagedFile::new(dest))
	}
}

/// Removes a staged upload on drop unless [`StagedFile::keep`] was called.
struct StagedFile {
	path: Option<PathBuf>,
}

impl StagedFile {
	fn new(path: &Path) -> Self {
		Self { path: Some(path.to_path_buf()) }
	}

	fn keep(mut self) {
		self.path = None;
	}
}

impl Drop for StagedFile {
	fn drop(&mut self) {
		if let Some(path) = self.path.take() {
			match std::fs::remove_file(&path) {
				Ok(()) => tracing::debug!(path = %path.display(), "removed staged upload"),
				Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove staged upload"),
			}
		}
	}
}
