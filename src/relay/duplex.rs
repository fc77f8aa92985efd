//! The duplex channel: one POST upload body and one GET download body
//! composed into a single bidirectional byte stream.
//!
//! The relay gives us no native duplex primitive. The upload request is
//! issued immediately with a streaming body backed by an in-memory pipe, so
//! writes are always routable; the download request runs on its own task and
//! its outcome (response body or failure) resolves a one-shot future exactly
//! once. The first read blocks on that future and the outcome is memoized,
//! success or failure, for every later read.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::TryStreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Client, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::{header_map, HeaderEntry};
use crate::error::{combine_errors, Result, TunnelError};

/// Capacity of the in-memory upload pipe. Writes beyond this block until the
/// relay drains the request body.
const UPLOAD_PIPE_CAPACITY: usize = 8 * 1024;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

enum DownloadState {
    /// Download request still in flight; first read rendezvouses here.
    Pending(oneshot::Receiver<io::Result<BoxReader>>),
    /// Resolved to a readable body; reused for all subsequent reads.
    Ready(BoxReader),
    /// Resolved to a failure; every read reports it.
    Failed(io::ErrorKind, String),
    /// Explicitly closed.
    Closed,
}

/// A bidirectional byte stream synthesized from one upload and one download
/// HTTP exchange against the relay.
pub struct DuplexChannel {
    writer: BoxWriter,
    download: DownloadState,
    download_task: Option<AbortHandle>,
    // Keeps the upload exchange alive while its body is still streaming.
    _upload_response: Option<Response>,
}

impl DuplexChannel {
    /// Establish the duplex: issue the upload POST immediately (failure to
    /// start it surfaces here) and spawn the download GET on a separate task
    /// (its failure surfaces via the read path).
    pub async fn connect(
        client: &Client,
        headers: &[HeaderEntry],
        upload_url: &str,
        download_url: &str,
    ) -> Result<Self> {
        let header_map = header_map(headers).map_err(|e| TunnelError::Setup(e.to_string()))?;

        let (upload_writer, upload_reader) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
        let body = Body::wrap_stream(ReaderStream::new(upload_reader));

        let mut upload_headers = header_map.clone();
        upload_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let upload_response = client
            .post(upload_url)
            .headers(upload_headers)
            .body(body)
            .send()
            .await?;
        debug!("upload leg established: {}", upload_url);

        let (resolve_tx, resolve_rx) = oneshot::channel();
        let download_client = client.clone();
        let download_url = download_url.to_string();
        let task = tokio::spawn(async move {
            let outcome = async {
                let response = download_client
                    .get(&download_url)
                    .headers(header_map)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
                debug!("download leg established: {}", download_url);
                let reader = StreamReader::new(
                    response
                        .bytes_stream()
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
                );
                Ok::<BoxReader, io::Error>(Box::new(reader))
            }
            .await;
            let _ = resolve_tx.send(outcome);
        });

        Ok(Self {
            writer: Box::new(upload_writer),
            download: DownloadState::Pending(resolve_rx),
            download_task: Some(task.abort_handle()),
            _upload_response: Some(upload_response),
        })
    }

    /// Compose a duplex from arbitrary legs: a writable upload sink and a
    /// one-shot future resolving to the download reader or a failure.
    pub fn from_parts(
        writer: BoxWriter,
        download: oneshot::Receiver<io::Result<BoxReader>>,
    ) -> Self {
        Self {
            writer,
            download: DownloadState::Pending(download),
            download_task: None,
            _upload_response: None,
        }
    }

    /// Close both legs. If both report a failure, the reported error carries
    /// both rather than discarding either.
    pub async fn close(&mut self) -> io::Result<()> {
        let upload_err = self.writer.shutdown().await.err();

        let download_err = match std::mem::replace(&mut self.download, DownloadState::Closed) {
            DownloadState::Failed(kind, msg) => Some(io::Error::new(kind, msg)),
            DownloadState::Pending(_) | DownloadState::Ready(_) | DownloadState::Closed => None,
        };
        if let Some(task) = self.download_task.take() {
            task.abort();
        }

        match combine_errors(upload_err, download_err) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        if let Some(task) = self.download_task.take() {
            task.abort();
        }
    }
}

impl AsyncRead for DuplexChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match &mut self.download {
                DownloadState::Pending(rx) => {
                    let outcome = ready!(Pin::new(rx).poll(cx));
                    self.download = match outcome {
                        Ok(Ok(reader)) => DownloadState::Ready(reader),
                        Ok(Err(e)) => DownloadState::Failed(e.kind(), e.to_string()),
                        Err(_) => DownloadState::Failed(
                            io::ErrorKind::Other,
                            "download task ended without a result".to_string(),
                        ),
                    };
                }
                DownloadState::Ready(reader) => return Pin::new(reader).poll_read(cx, buf),
                DownloadState::Failed(kind, msg) => {
                    return Poll::Ready(Err(io::Error::new(*kind, msg.clone())))
                }
                DownloadState::Closed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "duplex channel closed",
                    )))
                }
            }
        }
    }
}

impl AsyncWrite for DuplexChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn boxed_reader(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    /// Writer whose shutdown always fails, for exercising close().
    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
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
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "upload close failed")))
        }
    }

    #[tokio::test]
    async fn test_read_blocks_until_download_resolves() {
        let (writer, _peer) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(writer), rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(Ok(boxed_reader(b"hello")));
        });

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_memoizes_resolved_stream() {
        let (writer, _peer) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(writer), rx);
        tx.send(Ok(boxed_reader(b"hello"))).ok().unwrap();

        // Both reads must come from the same resolved stream, in order.
        let mut buf = [0u8; 3];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hel");

        let mut rest = [0u8; 2];
        channel.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"lo");

        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_memoizes_download_failure() {
        let (writer, _peer) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(writer), rx);
        tx.send(Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "download failed",
        )))
        .ok()
        .unwrap();

        let mut buf = [0u8; 4];
        let first = channel.read(&mut buf).await.unwrap_err();
        let second = channel.read(&mut buf).await.unwrap_err();

        assert_eq!(first.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(second.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[tokio::test]
    async fn test_write_forwards_to_upload_leg() {
        let (writer, mut peer) = tokio::io::duplex(64);
        let (_tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(writer), rx);

        channel.write_all(b"ping").await.unwrap();
        channel.shutdown().await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
    }

    #[tokio::test]
    async fn test_close_combines_both_leg_failures() {
        let (tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(FailingWriter), rx);
        tx.send(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "download leg failed",
        )))
        .ok()
        .unwrap();

        // Memoize the download failure, then close.
        let mut buf = [0u8; 4];
        channel.read(&mut buf).await.unwrap_err();

        let err = channel.close().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("upload close failed"), "got: {}", msg);
        assert!(msg.contains("download leg failed"), "got: {}", msg);
    }

    #[tokio::test]
    async fn test_close_with_clean_legs_is_ok() {
        let (writer, _peer) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let mut channel = DuplexChannel::from_parts(Box::new(writer), rx);
        tx.send(Ok(boxed_reader(b""))).ok().unwrap();

        channel.close().await.unwrap();

        // Reads after close fail instead of hanging.
        let mut buf = [0u8; 1];
        assert!(channel.read(&mut buf).await.is_err());
    }
}
