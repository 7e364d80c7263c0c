//! Full-duplex byte transfer between a client and a backend
//!
//! Each direction copies until its source reaches end of stream, then
//! half-closes its destination. A broken pipe on write means the destination
//! has gone away; the direction stops and asks the opposite direction to
//! half-close the source instead. `transfer` returns only after both
//! directions have finished.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes both ways until both directions finish
pub async fn transfer<C, B>(client: C, backend: B) -> TransferStats
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    // signalled when the writer half of that side must be closed early
    let close_client = Notify::new();
    let close_backend = Notify::new();

    let upstream = copy_half(client_read, backend_write, &close_backend, &close_client);
    let downstream = copy_half(backend_read, client_write, &close_client, &close_backend);

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let mut stats = TransferStats::default();
    match upstream {
        Ok(n) => stats.client_to_backend = n,
        Err(e) => debug!(direction = "client->backend", error = %e, "Transfer ended with error"),
    }
    match downstream {
        Ok(n) => stats.backend_to_client = n,
        Err(e) => debug!(direction = "backend->client", error = %e, "Transfer ended with error"),
    }
    stats
}

/// Copy `reader` into `writer`.
///
/// `close_writer` asks this direction to half-close `writer` and stop;
/// `close_source` asks the opposite direction to half-close the stream `reader`
/// belongs to.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    close_writer: &Notify,
    close_source: &Notify,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = close_writer.notified() => {
                shutdown_quietly(&mut writer).await;
                return Ok(copied);
            }
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            // TLS peers that skip close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                shutdown_quietly(&mut writer).await;
                return Err(e);
            }
        };

        match writer.write_all(&buf[..n]).await {
            Ok(()) => copied += n as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                close_source.notify_one();
                return Ok(copied);
            }
            Err(e) => {
                close_source.notify_one();
                return Err(e);
            }
        }
    }

    writer.flush().await?;
    shutdown_quietly(&mut writer).await;
    Ok(copied)
}

async fn shutdown_quietly<W: AsyncWrite + Unpin>(writer: &mut W) {
    if let Err(e) = writer.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(error = %e, "Half-close failed");
        }
    }
}
