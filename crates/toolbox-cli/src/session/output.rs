//! Container output forwarding.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copies container output to `local` until the stream ends or `cancel`
/// fires. Returns the number of bytes copied.
pub async fn pump_output<R, W>(
    mut remote: R,
    mut local: W,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            read = remote.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        local.write_all(&buf[..n]).await?;
        local.flush().await?;
        total += n as u64;
    }

    Ok(total)
}
