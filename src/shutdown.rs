// src/shutdown.rs

use std::sync::Arc;

use tracing::{info, warn};

use crate::rabbitmq::MessageQueue;

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    Ok(())
}

/// Closes every role in order. Failures are logged and the rest still close.
pub async fn close_all(roles: &[(&str, Arc<dyn MessageQueue>)]) {
    for (name, role) in roles {
        match role.close().await {
            Ok(()) => info!(role = %name, "Closed"),
            Err(e) => warn!(role = %name, error = %e, "Failed to close"),
        }
    }
}
