//! Terminal geometry synchronisation.

use crate::engine::DynEngine;
use crate::terminal::{Console, TerminalSize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Mirrors the local terminal size onto the container's TTY until
/// `cancel` fires. Individual failures are retried on the next tick.
pub async fn resize_loop(
    engine: DynEngine,
    console: Arc<dyn Console>,
    id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut applied: Option<TerminalSize> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !console.is_terminal() {
            continue;
        }

        let size = match console.size() {
            Ok(size) => size,
            Err(e) => {
                tracing::debug!("Failed to read terminal size: {}", e);
                continue;
            }
        };
        if applied == Some(size) {
            continue;
        }

        match engine.resize(&id, size).await {
            Ok(()) => applied = Some(size),
            Err(e) => tracing::debug!("Resize to {}x{} failed: {}", size.cols, size.rows, e),
        }
    }
}
