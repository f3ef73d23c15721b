//! Graceful shutdown for the binaries: one cancellation token fanned out to
//! every long-running task, then a bounded wait for them to finish.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Resolve on Ctrl-C or when the token is cancelled from inside the process.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
    }

    /// Cancel every task and wait up to the drain timeout. Returns true if all finished.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let drain = async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(()) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete");
                false
            }
        }
    }

    pub async fn wait_for_shutdown(self) -> bool {
        self.wait_for_signal().await;
        self.shutdown().await
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
