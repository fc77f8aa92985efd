//! Per-connection proxying: one local TCP connection paired with one remote
//! stream, copied in both directions until both directions finish.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failure of one or both copy directions. End-of-stream is not an error;
/// when both directions fail, both failures are surfaced.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("local to remote: {0}")]
    Upstream(#[source] io::Error),

    #[error("remote to local: {0}")]
    Downstream(#[source] io::Error),

    #[error("local to remote: {up}; remote to local: {down}")]
    Both { up: io::Error, down: io::Error },
}

/// Copy bytes both ways between `local` and `remote` until each direction
/// reaches end-of-stream or fails, then close both endpoints unconditionally.
///
/// Both directions always run to completion before cleanup; a direction that
/// fails forces the other to stop immediately instead of waiting for an EOF
/// that may never come (the forced direction reports clean termination, so
/// the combined result carries exactly the real failure).
pub async fn run<L, R>(local: L, remote: R, buf_size: usize) -> Result<(), ProxyError>
where
    L: AsyncRead + AsyncWrite + Send,
    R: AsyncRead + AsyncWrite + Send,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let abort = CancellationToken::new();

    let up = copy_direction(&mut local_read, &mut remote_write, buf_size, &abort);
    let down = copy_direction(&mut remote_read, &mut local_write, buf_size, &abort);
    let (up_result, down_result) = tokio::join!(up, down);

    // Close both endpoints regardless of how either direction ended.
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    match (up_result, down_result) {
        (Ok(sent), Ok(received)) => {
            debug!("proxy finished: {} bytes up, {} bytes down", sent, received);
            Ok(())
        }
        (Err(up), Ok(_)) => Err(ProxyError::Upstream(up)),
        (Ok(_), Err(down)) => Err(ProxyError::Downstream(down)),
        (Err(up), Err(down)) => Err(ProxyError::Both { up, down }),
    }
}

/// One copy direction. Returns the byte count on EOF or forced stop; on
/// failure, cancels the token so the sibling direction unwinds too.
async fn copy_direction<S, D>(
    src: &mut S,
    dst: &mut D,
    buf_size: usize,
    abort: &CancellationToken,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;

    loop {
        let step = async {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok(0);
            }
            dst.write_all(&buf[..n]).await?;
            dst.flush().await?;
            Ok(n)
        };

        tokio::select! {
            result = step => match result {
                Ok(0) => {
                    // Propagate the half-close so the peer sees EOF.
                    let _ = dst.shutdown().await;
                    return Ok(total);
                }
                Ok(n) => total += n as u64,
                Err(e) => {
                    abort.cancel();
                    return Err(e);
                }
            },
            _ = abort.cancelled() => return Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};
    use tokio::time::timeout;

    /// Stream whose reads fail and whose writes succeed, for error paths.
    struct ReadFails;

    impl AsyncRead for ReadFails {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "read side died")))
        }
    }

    impl AsyncWrite for ReadFails {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_proxy_symmetry() {
        let (local, mut local_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);

        let proxy = tokio::spawn(run(local, remote, 16));

        local_peer.write_all(b"from local").await.unwrap();
        local_peer.flush().await.unwrap();
        let mut buf = [0u8; 10];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from local");

        remote_peer.write_all(b"from remote").await.unwrap();
        remote_peer.flush().await.unwrap();
        let mut buf = [0u8; 11];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from remote");

        drop(local_peer);
        drop(remote_peer);
        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_proxy_preserves_order_with_tiny_buffer() {
        let (local, mut local_peer) = duplex(4096);
        let (remote, mut remote_peer) = duplex(4096);

        // Buffer far smaller than the payload forces many copy iterations.
        let proxy = tokio::spawn(run(local, remote, 4));

        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            local_peer.write_all(&payload).await.unwrap();
            drop(local_peer);
        });

        let mut received = Vec::new();
        remote_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        drop(remote_peer);
        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_proxy_closes_both_ends() {
        let (local, mut local_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);

        let proxy = tokio::spawn(run(local, remote, 16));

        // Close one side; the proxy propagates the close to the remote end.
        drop(local_peer);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(1), remote_peer.read(&mut buf))
            .await
            .expect("remote endpoint not closed")
            .unwrap();
        assert_eq!(n, 0);

        // The reverse direction ends once the remote peer closes too.
        drop(remote_peer);
        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_one_sided_failure_reports_only_that_direction() {
        // The remote read direction fails; the local side never reaches EOF
        // on its own, so the proxy must force it closed.
        let (local, mut local_peer) = duplex(1024);

        let result = timeout(Duration::from_secs(1), run(local, ReadFails, 16))
            .await
            .expect("proxy hung on one-sided failure");

        match result {
            Err(ProxyError::Downstream(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected downstream error, got {:?}", other.err()),
        }

        // Both endpoints were closed despite the error.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(1), local_peer.read(&mut buf))
            .await
            .expect("local endpoint not closed")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_both_failures_are_combined() {
        let result = run(ReadFails, ReadFails, 16).await;

        match result {
            Err(ProxyError::Both { up, down }) => {
                assert_eq!(up.kind(), io::ErrorKind::ConnectionReset);
                assert_eq!(down.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected both directions to fail, got {:?}", other.err()),
        }
    }
}
