use std::io;

use rdmx_verbs::ShutdownSignal;
use tokio::task::JoinHandle;

/// Wait for a shutdown signal (CTRL+C or SIGTERM).
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = ctrl_c => {
            res?;
            tracing::info!("Received CTRL+C");
        }
        _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
    }
    Ok(())
}

/// Triggers `shutdown` when the process is asked to stop.
///
/// If the handlers cannot be installed the signal is triggered right away,
/// since nothing could stop the session later.
pub fn spawn_shutdown_watcher(shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "failed to install signal handlers");
        }
        shutdown.trigger();
    })
}
