//! Process termination signals.
//!
//! On Unix, SIGINT, SIGTERM and SIGQUIT all request a clean shutdown; other
//! platforms only see Ctrl-C.

use tokio_util::sync::CancellationToken;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// A token cancelled on the first termination signal.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                trigger.cancel();
            }
            // Default signal dispositions still terminate the process.
            Err(e) => tracing::error!("Cannot listen for shutdown signals: {e}"),
        }
    });
    token
}
