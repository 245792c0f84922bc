use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest tail of tool output kept in a failure reason.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// How long the output pipes may stay open once the tool has exited or been
/// killed. A wrapper's leftover children can hold them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
	#[error("conversion tool exited with {status}: {diagnostics}")]
	NonZeroExit { status: String, diagnostics: String },

	#[error("conversion exceeded its {timeout:?} deadline: {diagnostics}")]
	Timeout { timeout: Duration, diagnostics: String },

	#[error("conversion tool not found: {tool}")]
	ToolNotFound { tool: String },

	#[error("conversion I/O setup failed: {0}")]
	IoSetup(String),

	#[error("conversion cancelled by shutdown")]
	Cancelled,

	#[error("invalid job payload: {0}")]
	InvalidPayload(String),
}

impl ConversionError {
	/// Stable label used in logs and metrics.
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::NonZeroExit { .. } => "tool_nonzero_exit",
			Self::Timeout { .. } => "tool_timeout",
			Self::ToolNotFound { .. } => "tool_not_found",
			Self::IoSetup(_) => "io_setup_failure",
			Self::Cancelled => "cancelled_on_shutdown",
			Self::InvalidPayload(_) => "invalid_payload",
		}
	}

	/// Failures no amount of retrying will fix without operator action.
	#[must_use]
	pub const fn is_configuration(&self) -> bool {
		matches!(self, Self::ToolNotFound { .. } | Self::IoSetup(_) | Self::InvalidPayload(_))
	}
}

/// Captured tool output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
	pub stdout: String,
	pub stderr: String,
}

impl Diagnostics {
	/// The tail of stderr (falling back to stdout), bounded for storage.
	#[must_use]
	pub fn summary(&self) -> String {
		let text = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
		tail(text.trim(), MAX_DIAGNOSTIC_CHARS)
	}
}

fn tail(text: &str, max_chars: usize) -> String {
	let count = text.chars().count();
	if count <= max_chars {
		return text.to_string();
	}
	text.chars().skip(count - max_chars).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
	pub input: PathBuf,
	pub output: PathBuf,
	/// Hard deadline for the whole conversion.
	pub timeout: Duration,
	/// Time a running conversion gets to finish once shutdown is requested.
	pub grace: Duration,
}

/// Runs one media conversion.
#[async_trait]
pub trait Converter: Send + Sync {
	async fn convert(&self, request: &ConversionRequest, cancel: &CancellationToken) -> Result<Diagnostics, ConversionError>;
}

/// Spawns `ffmpeg` (or a compatible binary) once per job.
///
/// Output is 16-bit PCM WAV, 44.1 kHz stereo. `-y` makes re-running a job
/// overwrite the previous output.
pub struct FfmpegConverter {
	program: String,
	prefix_args: Vec<OsString>,
}

impl FfmpegConverter {
	#[must_use]
	pub fn new(program: impl Into<String>) -> Self {
		Self::wrapped(program, Vec::<OsString>::new())
	}

	/// Runs the tool through a wrapper such as `nice` or `sh <script>`;
	/// `prefix_args` go before the conversion arguments.
	#[must_use]
	pub fn wrapped(program: impl Into<String>, prefix_args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
		Self {
			program: program.into(),
			prefix_args: prefix_args.into_iter().map(Into::into).collect(),
		}
	}

	fn args<'a>(&'a self, request: &'a ConversionRequest) -> Vec<&'a OsStr> {
		let mut args: Vec<&OsStr> = self.prefix_args.iter().map(OsString::as_os_str).collect();
		args.extend([
			OsStr::new("-y"),
			OsStr::new("-i"),
			request.input.as_os_str(),
			OsStr::new("-vn"),
			OsStr::new("-acodec"),
			OsStr::new("pcm_s16le"),
			OsStr::new("-ar"),
			OsStr::new("44100"),
			OsStr::new("-ac"),
			OsStr::new("2"),
			request.output.as_os_str(),
		]);
		args
	}

	fn spawn(&self, request: &ConversionRequest) -> Result<Child, ConversionError> {
		Command::new(&self.program)
			.args(self.args(request))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| match e.kind() {
				ErrorKind::NotFound => ConversionError::ToolNotFound { tool: self.program.clone() },
				_ => ConversionError::IoSetup(format!("failed to spawn {}: {e}", self.program)),
			})
	}
}

enum Exit {
	Status(std::io::Result<ExitStatus>),
	TimedOut,
	Cancelled,
}

#[async_trait]
impl Converter for FfmpegConverter {
	async fn convert(&self, request: &ConversionRequest, cancel: &CancellationToken) -> Result<Diagnostics, ConversionError> {
		ensure_parent_dir(&request.output).await?;

		let mut child = self.spawn(request)?;
		let stdout = tokio::spawn(read_all(child.stdout.take()));
		let stderr = tokio::spawn(read_all(child.stderr.take()));

		let deadline = tokio::time::sleep(request.timeout);
		tokio::pin!(deadline);

		let mut exit = tokio::select! {
			status = child.wait() => Exit::Status(status),
			() = &mut deadline => Exit::TimedOut,
			() = cancel.cancelled() => Exit::Cancelled,
		};

		if matches!(exit, Exit::Cancelled) {
			tracing::info!(grace = ?request.grace, "shutdown requested, waiting for conversion to finish");
			exit = tokio::select! {
				status = child.wait() => Exit::Status(status),
				() = tokio::time::sleep(request.grace) => Exit::Cancelled,
				() = &mut deadline => Exit::TimedOut,
			};
		}

		if !matches!(exit, Exit::Status(_)) {
			if let Err(e) = child.kill().await {
				tracing::warn!(error = %e, "failed to kill conversion process");
			}
		}

		let (stdout, stderr) = tokio::join!(drain(stdout), drain(stderr));
		let diagnostics = Diagnostics { stdout, stderr };

		match exit {
			Exit::Status(Ok(status)) if status.success() => Ok(diagnostics),
			Exit::Status(Ok(status)) => Err(ConversionError::NonZeroExit {
				status: status.to_string(),
				diagnostics: diagnostics.summary(),
			}),
			Exit::Status(Err(e)) => Err(ConversionError::IoSetup(format!("failed to wait for {}: {e}", self.program))),
			Exit::TimedOut => Err(ConversionError::Timeout {
				timeout: request.timeout,
				diagnostics: diagnostics.summary(),
			}),
			Exit::Cancelled => Err(ConversionError::Cancelled),
		}
	}
}

async fn ensure_parent_dir(path: &Path) -> Result<(), ConversionError> {
	match path.parent() {
		Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir)
			.await
			.map_err(|e| ConversionError::IoSetup(format!("cannot create output directory {}: {e}", dir.display()))),
		_ => Ok(()),
	}
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
	let Some(mut pipe) = pipe else { return String::new() };
	let mut buf = Vec::new();
	if let Err(e) = pipe.read_to_end(&mut buf).await {
		tracing::debug!(error = %e, "failed to read conversion output");
	}
	String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(mut reader: JoinHandle<String>) -> String {
	match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut reader).await {
		Ok(output) => output.unwrap_or_default(),
		Err(_) => {
			reader.abort();
			tracing::warn!(timeout = ?PIPE_DRAIN_TIMEOUT, "conversion output still open after the tool stopped, dropping it");
			String::new()
		}
	}
}

/// Scripted outcome for [`StubConverter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOutcome {
	/// Writes a fixed WAV header to the output path.
	Succeed,
	ExitCode(i32),
	Timeout,
	ToolNotFound,
	IoSetup,
	/// Blocks until the deadline passes or shutdown is requested.
	Hang,
}

/// Deterministic converter that never spawns a process.
///
/// Outcomes are taken from the script in order; once it runs dry every call
/// gets the fallback.
pub struct StubConverter {
	script: Mutex<VecDeque<StubOutcome>>,
	fallback: StubOutcome,
	calls: AtomicUsize,
}

/// Bytes written by a successful stub conversion.
pub const STUB_WAV: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt ";

impl StubConverter {
	#[must_use]
	pub fn always(outcome: StubOutcome) -> Self {
		Self::scripted(Vec::new(), outcome)
	}

	#[must_use]
	pub fn scripted(script: Vec<StubOutcome>, fallback: StubOutcome) -> Self {
		Self {
			script: Mutex::new(script.into()),
			fallback,
			calls: AtomicUsize::new(0),
		}
	}

	#[must_use]
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	fn next_outcome(&self) -> StubOutcome {
		self.script
			.lock()
			.ok()
			.and_then(|mut script| script.pop_front())
			.unwrap_or_else(|| self.fallback.clone())
	}
}

#[async_trait]
impl Converter for StubConverter {
	async fn convert(&self, request: &ConversionRequest, cancel: &CancellationToken) -> Result<Diagnostics, ConversionError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let stderr = format!("stub conversion {} -> {}", request.input.display(), request.output.display());

		match self.next_outcome() {
			StubOutcome::Succeed => {
				ensure_parent_dir(&request.output).await?;
				tokio::fs::write(&request.output, STUB_WAV)
					.await
					.map_err(|e| ConversionError::IoSetup(format!("cannot write {}: {e}", request.output.display())))?;
				Ok(Diagnostics { stdout: String::new(), stderr })
			}
			StubOutcome::ExitCode(code) => Err(ConversionError::NonZeroExit {
				status: format!("exit status: {code}"),
				diagnostics: stderr,
			}),
			StubOutcome::Timeout => Err(ConversionError::Timeout {
				timeout: request.timeout,
				diagnostics: stderr,
			}),
			StubOutcome::ToolNotFound => Err(ConversionError::ToolNotFound { tool: "stub".to_string() }),
			StubOutcome::IoSetup => Err(ConversionError::IoSetup(stderr)),
			StubOutcome::Hang => tokio::select! {
				() = tokio::time::sleep(request.timeout) => Err(ConversionError::Timeout { timeout: request.timeout, diagnostics: stderr }),
				() = cancel.cancelled() => Err(ConversionError::Cancelled),
			},
		}
	}
}
