//! Termination signal handling.
//!
//! SIGINT and SIGTERM both request the same graceful shutdown; no other
//! signal is handled.

use std::future::Future;
use tracing::info;

use crate::utils::error::BrokerError;

/// Registers the termination signal handlers and returns a future that
/// completes when the first of them arrives.
///
/// Registration happens eagerly so a failure surfaces at startup instead of
/// looking like an immediate shutdown request.
#[cfg(unix)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()>, BrokerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    })
}

/// Windows only delivers Ctrl+C.
#[cfg(windows)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()>, BrokerError> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;

    Ok(async move {
        ctrl_c.recv().await;
        info!("Received Ctrl+C");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn pending_until_a_signal_arrives() {
        let shutdown = shutdown_signal().unwrap();
        assert!(timeout(Duration::from_millis(10), shutdown).await.is_err());
    }
}
