use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{signal, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Signal,
    /// Requested from inside the process, e.g. leadership lost
    Requested(String),
}

/// Fans a single shutdown decision out to servers and background loops.
///
/// Servers await [`GracefulShutdown::wait_for_shutdown_signal`]; loops hold a
/// child [`CancellationToken`].
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Token cancelled when shutdown starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger shutdown from inside the process. Only the first call has effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown triggered: {:?}", reason);
            let _ = self.shutdown_tx.send(reason);
            self.token.cancel();
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Listen for SIGINT/SIGTERM and turn the first one into a shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }
        self.trigger_shutdown(ShutdownReason::Signal);
    }

    /// Wait indefinitely for the shutdown decision.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return ShutdownReason::Requested("already initiated".to_string());
        }
        let mut receiver = self.subscribe();
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(reason) => reason,
                Err(_) => {
                    tracing::warn!("Shutdown channel closed unexpectedly");
                    ShutdownReason::Requested("channel closed".to_string())
                }
            },
            _ = self.token.cancelled() => ShutdownReason::Requested("cancelled".to_string()),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_tokens() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.cancellation_token();
        let mut receiver = shutdown.subscribe();

        assert!(!shutdown.is_shutdown_initiated());
        shutdown.trigger_shutdown(ShutdownReason::Requested("test".into()));

        assert!(shutdown.is_shutdown_initiated());
        assert!(token.is_cancelled());
        assert_eq!(
            receiver.try_recv().unwrap(),
            ShutdownReason::Requested("test".into())
        );
    }

    #[tokio::test]
    async fn test_second_trigger_is_ignored() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();
        shutdown.trigger_shutdown(ShutdownReason::Signal);
        shutdown.trigger_shutdown(ShutdownReason::Requested("late".into()));

        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Signal);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown_signal().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger_shutdown(ShutdownReason::Signal);
        let reason = waiter.await.unwrap();
        assert!(matches!(
            reason,
            ShutdownReason::Signal | ShutdownReason::Requested(_)
        ));
    }
}
