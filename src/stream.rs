//! Close-observable byte streams.
//!
//! [`NotifyingStream`] wraps any bidirectional stream so that its close is
//! visible as a token on an out-of-band channel, and so that a watchdog
//! holding a [`CloseHandle`] can force it shut from outside. The
//! notification channel is buffered with capacity 2: the owner's close and
//! a watchdog force-close can both publish without the other side
//! listening.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::warn;

/// Marker trait for the streams the proxy splices.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A stream wrapper that publishes a token when closed and honors an
/// external force-close. After a force-close, reads return EOF and writes
/// fail with `BrokenPipe`.
pub struct NotifyingStream<S> {
    inner: S,
    notify: mpsc::Sender<()>,
    notified: bool,
    force: Pin<Box<WaitForCancellationFutureOwned>>,
    force_closed: bool,
}

impl<S> NotifyingStream<S> {
    /// Wrap `inner`. Returns the wrapper, the close-notification receiver,
    /// and a handle that can force the stream shut.
    pub fn new(inner: S) -> (Self, mpsc::Receiver<()>, CloseHandle) {
        let (tx, rx) = mpsc::channel(2);
        let token = CancellationToken::new();
        let handle = CloseHandle {
            token: token.clone(),
            notify: tx.clone(),
        };
        let stream = Self {
            inner,
            notify: tx,
            notified: false,
            force: Box::pin(token.cancelled_owned()),
            force_closed: false,
        };
        (stream, rx, handle)
    }

    fn check_force_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if self.force_closed {
            return true;
        }
        if self.force.as_mut().poll(cx).is_ready() {
            self.force_closed = true;
            return true;
        }
        false
    }

    fn send_close_token(&mut self) {
        if !self.notified {
            self.notified = true;
            let _ = self.notify.try_send(());
        }
    }
}

impl<S> Drop for NotifyingStream<S> {
    fn drop(&mut self) {
        self.send_close_token();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NotifyingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.check_force_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NotifyingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.check_force_closed(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream was force-closed",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.check_force_closed(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream was force-closed",
            )));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.force_closed {
            this.send_close_token();
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.send_close_token();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Force-close handle for a [`NotifyingStream`].
#[derive(Clone)]
pub struct CloseHandle {
    token: CancellationToken,
    notify: mpsc::Sender<()>,
}

impl CloseHandle {
    /// Close the stream out-of-band: publish a close token and fail all
    /// subsequent reads and writes.
    pub fn force_close(&self) {
        let _ = self.notify.try_send(());
        self.token.cancel();
    }
}

/// Race a hard timeout against the stream's own close. On timeout the
/// stream is force-closed; either way `cleanup` runs when the watchdog
/// exits (the controller uses it to tear down the SSH session).
pub fn spawn_watchdog<F>(
    timeout: Duration,
    close: CloseHandle,
    mut closed: mpsc::Receiver<()>,
    cleanup: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                warn!("Connection has been open for too long, closing");
                close.force_close();
            }
            _ = closed.recv() => {}
        }
        cleanup.await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_shutdown_publishes_close_token() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, mut closed, _handle) = NotifyingStream::new(local);

        stream.shutdown().await.unwrap();

        assert!(closed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drop_publishes_close_token() {
        let (local, _remote) = tokio::io::duplex(64);
        let (stream, mut closed, _handle) = NotifyingStream::new(local);

        drop(stream);

        assert!(closed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_token_published_once_per_close_path() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, mut closed, _handle) = NotifyingStream::new(local);

        stream.shutdown().await.unwrap();
        drop(stream);

        assert!(closed.try_recv().is_ok());
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_close_fails_pending_read() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, _closed, handle) = NotifyingStream::new(local);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            stream.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        handle.force_close();

        // EOF, not an error: the reader sees a closed stream.
        assert_eq!(reader.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_force_close_fails_writes() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, _closed, handle) = NotifyingStream::new(local);

        handle.force_close();

        let err = stream.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_both_close_paths_fit_in_buffer() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, mut closed, handle) = NotifyingStream::new(local);

        // Watchdog force-close and user close racing: neither may block.
        handle.force_close();
        stream.shutdown().await.unwrap();

        assert!(closed.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_force_closes_after_timeout() {
        let (local, _remote) = tokio::io::duplex(64);
        let (mut stream, closed, handle) = NotifyingStream::new(local);
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();

        let watchdog = spawn_watchdog(Duration::from_millis(50), handle, closed, async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(60)).await;
        watchdog.await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_exits_quietly_when_stream_closes_first() {
        let (local, remote) = tokio::io::duplex(64);
        let (mut stream, closed, handle) = NotifyingStream::new(local);
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();

        let watchdog = spawn_watchdog(Duration::from_secs(600), handle, closed, async move {
            flag.store(true, Ordering::SeqCst);
        });

        stream.shutdown().await.unwrap();
        watchdog.await.unwrap();

        assert!(cleaned.load(Ordering::SeqCst));
        // The peer is untouched by the watchdog exit.
        drop(remote);
    }
}
