//! Accepted connections the supervisor can close.
//!
//! tonic hands every accepted connection to its own detached task, so
//! aborting the accept loop leaves those connections running. Each
//! connection is wrapped in [`Releasable`], which fails all further I/O once
//! the shared release token is cancelled. The connection task then sees an
//! error, ends, and drops the socket.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;

/// A connection that stops doing I/O once its release token is cancelled.
pub struct Releasable<IO> {
    io: IO,
    token: CancellationToken,
    released: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<IO> Releasable<IO> {
    pub fn new(io: IO, token: &CancellationToken) -> Self {
        Self {
            io,
            token: token.clone(),
            released: Box::pin(token.clone().cancelled_owned()),
        }
    }

    /// Fails once released. Otherwise registers the task to be woken on
    /// release, so an idle connection notices it too.
    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.token.is_cancelled() || self.released.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection released at drain deadline",
            ));
        }
        Ok(())
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for Releasable<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Releasable<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl<IO: Connected> Connected for Releasable<IO> {
    type ConnectInfo = IO::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.io.connect_info()
    }
}

/// Wrap every connection `incoming` yields so `token` can close it.
pub fn releasable<S, IO>(
    incoming: S,
    token: CancellationToken,
) -> impl Stream<Item = io::Result<Releasable<IO>>>
where
    S: Stream<Item = io::Result<IO>>,
{
    incoming.map(move |conn| conn.map(|io| Releasable::new(io, &token)))
}
