//! Shared relay plumbing for the proxy servers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upstream dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout for established relays.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Dial an upstream destination with the standard timeout.
pub async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out"),
        )),
    }
}

/// Relay bytes in both directions with the default idle timeout.
pub async fn relay_bidirectional<A, B>(a: A, b: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_idle_timeout(a, b, IDLE_TIMEOUT).await
}

/// Relay bytes in both directions until either side closes or the
/// connection sits idle past `idle`. Byte order is preserved per direction.
pub async fn relay_with_idle_timeout<A, B>(a: A, b: B, idle: Duration) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let progress = Arc::new(AtomicU64::new(0));
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let up = copy_counted(&mut ar, &mut bw, progress.clone());
    let down = copy_counted(&mut br, &mut aw, progress.clone());
    let watchdog = idle_watchdog(progress, idle);

    tokio::select! {
        result = async { tokio::try_join!(up, down) } => result.map(|_| ()),
        err = watchdog => Err(err),
    }
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    progress: Arc<AtomicU64>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        progress.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await.ok();
    Ok(())
}

/// Resolves to an error once no byte has moved for a full idle window.
async fn idle_watchdog(progress: Arc<AtomicU64>, idle: Duration) -> std::io::Error {
    let mut last = progress.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(idle).await;
        let now = progress.load(Ordering::Relaxed);
        if now == last {
            return std::io::Error::new(std::io::ErrorKind::TimedOut, "relay idle timeout");
        }
        last = now;
    }
}
