use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			tracing::error!(error = %e, "failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(e) => {
				tracing::error!(error = %e, "failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

/// Returns a token that is cancelled when the process receives a shutdown signal.
#[must_use]
pub fn cancel_on_signal() -> CancellationToken {
	let token = CancellationToken::new();
	let signal_token = token.clone();
	tokio::spawn(async move {
		wait_for_shutdown_signal().await;
		tracing::info!("shutdown signal received");
		signal_token.cancel();
	});
	token
}
