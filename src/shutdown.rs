use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The hub, elector and pruner all stop on it; the elector releases
/// its advisory lock on the way out.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping node");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping node");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
