//! Local input forwarding and the force-exit gesture.

use crate::client::short_id;
use crate::engine::DynEngine;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// End of Transmission (Ctrl-D).
const EOT: u8 = 0x04;

/// Injected into the remote input after the first EOT. Runs as a shell
/// comment, so it is harmless if it reaches a prompt.
pub const FORCE_EXIT_WARNING: &[u8] = b"# press Ctrl-D again to force exit\r";

/// What to do with one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Send the byte to the container.
    Forward(u8),
    /// Send [`FORCE_EXIT_WARNING`] instead of the byte.
    Warn,
    /// Second consecutive EOT: remove the container.
    ForceExit,
}

/// Detects two consecutive EOT bytes in the input stream.
#[derive(Debug, Default)]
pub struct ControlFilter {
    pending_eot: bool,
}

impl ControlFilter {
    pub fn feed(&mut self, byte: u8) -> Control {
        match (byte, self.pending_eot) {
            (EOT, true) => {
                self.pending_eot = false;
                Control::ForceExit
            }
            (EOT, false) => {
                self.pending_eot = true;
                Control::Warn
            }
            (byte, _) => {
                self.pending_eot = false;
                Control::Forward(byte)
            }
        }
    }
}

/// How the input pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// Local input reached end of file; the remote side was shut down.
    Eof,
    /// The force-exit gesture removed the container.
    ForceExit,
    /// The session ended first.
    Cancelled,
}

/// Copies `input` to the container, intercepting the force-exit gesture.
pub async fn forward_input<R, W>(
    mut input: R,
    mut remote: W,
    engine: DynEngine,
    id: String,
    cancel: CancellationToken,
) -> io::Result<InputOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut filter = ControlFilter::default();
    let mut buf = [0u8; 1024];
    let mut out = Vec::with_capacity(buf.len());

    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return Ok(InputOutcome::Cancelled),
            read = input.read(&mut buf) => read?,
        };

        if n == 0 {
            tracing::debug!("Local input closed");
            remote.shutdown().await?;
            return Ok(InputOutcome::Eof);
        }

        out.clear();
        for &byte in &buf[..n] {
            match filter.feed(byte) {
                Control::Forward(byte) => out.push(byte),
                Control::Warn => out.extend_from_slice(FORCE_EXIT_WARNING),
                Control::ForceExit => {
                    if !out.is_empty() {
                        remote.write_all(&out).await?;
                        remote.flush().await?;
                    }
                    force_remove(&engine, &id).await;
                    return Ok(InputOutcome::ForceExit);
                }
            }
        }

        remote.write_all(&out).await?;
        remote.flush().await?;
    }
}

async fn force_remove(engine: &DynEngine, id: &str) {
    tracing::debug!("Double Ctrl-D, removing container {}", short_id(id));
    match engine.remove(id, true, true).await {
        Ok(()) => {}
        Err(e) if e.is_already_removed() => {}
        Err(e) => tracing::warn!("Failed to remove container {}: {}", short_id(id), e),
    }
}
