//! Graceful shutdown handling for the stride controller
//!
//! SIGTERM and SIGINT flip a watch channel. The Rollout controller listens on
//! it through `graceful_shutdown_on`, so reconciles already running finish
//! their status write before the process exits. No new reconciles start.

use tokio::sync::watch;
use tracing::info;

/// Receiving side of the shutdown channel
///
/// Cheap to clone. Every clone observes the same trigger.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown signal
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Resolve once shutdown is triggered, consuming this handle
    ///
    /// Suits APIs that take an owned `Future + Send + 'static`, such as
    /// `Controller::graceful_shutdown_on`.
    pub async fn triggered(mut self) {
        self.wait().await
    }

    /// Check if shutdown was signaled (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending side of the shutdown channel
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Trigger shutdown
    pub fn shutdown(&self) {
        // send_replace never fails, even with every receiver gone
        self.sender.send_replace(true);
        info!("Shutdown signal sent");
    }
}

/// Create a new shutdown signal pair
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT
///
/// Returns the signal name that was received, or the error raised while
/// registering the handlers.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = received, "Received termination signal");
    Ok(received)
}

/// Wait for Ctrl+C (non-unix targets)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
