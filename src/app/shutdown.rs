use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info};

/// Resolves on Ctrl+C, or on SIGTERM where available. If no handler can be installed the
/// future never resolves, leaving end of input as the only way out.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(err) => {
                error!("Failed to create SIGTERM handler: {}", err);
                None
            }
        };

        let terminate = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT (Ctrl+C), unloading"),
                Err(err) => {
                    error!("Failed to listen for SIGINT: {}", err);
                    std::future::pending::<()>().await;
                }
            },
            () = terminate => info!("Received SIGTERM, unloading"),
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), unloading"),
            Err(err) => {
                error!("Failed to listen for SIGINT: {}", err);
                std::future::pending::<()>().await;
            }
        }
    }
}
