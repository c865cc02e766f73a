use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use quinn::{StreamId, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tonic::transport::server::Connected;
use tracing::debug;

use crate::credentials::AuthInfo;
use crate::error::Error;
use crate::session::{Session, StreamLease};

/// How long a closed connection waits for the peer to acknowledge its
/// remaining data before the stream is reset.
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_secs(3);

/// One QUIC bidirectional stream presented as a byte-stream connection.
///
/// The connection holds a lease on its session for as long as it is open.
/// [`StreamConn::close`] (or dropping the connection) gives it back exactly
/// once, after the peer has acknowledged everything written.
pub struct StreamConn {
    // Taken by the close linger.
    send: Option<quinn::SendStream>,
    recv: quinn::RecvStream,
    lease: StreamLease,
    stream_id: StreamId,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    linger: Duration,
    write_closed: bool,
    read_eof: bool,
    closed: bool,
}

/// Connection metadata tonic attaches to every request served over a [`StreamConn`].
#[derive(Debug, Clone)]
pub struct StreamConnInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub session_id: u64,
    pub stream_id: StreamId,
    pub auth_info: Arc<AuthInfo>,
}

impl StreamConn {
    pub(crate) fn new(send: quinn::SendStream, recv: quinn::RecvStream, lease: StreamLease) -> Self {
        Self {
            stream_id: send.id(),
            send: Some(send),
            recv,
            lease,
            read_deadline: None,
            write_deadline: None,
            linger: DEFAULT_CLOSE_LINGER,
            write_closed: false,
            read_eof: false,
            closed: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session().local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.session().remote_addr()
    }

    /// Security state negotiated for the owning session.
    pub fn auth_info(&self) -> Arc<AuthInfo> {
        self.session().auth_info()
    }

    pub fn session(&self) -> &Arc<Session> {
        self.lease.session()
    }

    pub fn session_id(&self) -> u64 {
        self.session().id()
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn info(&self) -> StreamConnInfo {
        StreamConnInfo {
            local_addr: self.local_addr(),
            remote_addr: self.remote_addr(),
            session_id: self.session_id(),
            stream_id: self.stream_id,
            auth_info: self.auth_info(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Set both the read and write deadlines. `None` clears them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Pending and future reads fail with `Timeout` once `deadline` passes.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        update_deadline(&mut self.read_deadline, deadline);
    }

    /// Pending and future writes fail with `Timeout` once `deadline` passes.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        update_deadline(&mut self.write_deadline, deadline);
    }

    /// Bound how long [`StreamConn::close`] waits for unacknowledged data.
    ///
    /// A zero linger resets the stream on close unless everything written has
    /// already been acknowledged.
    pub fn set_linger(&mut self, linger: Duration) {
        self.linger = linger;
    }

    /// Half-close the sending direction.
    ///
    /// The peer reads end-of-stream once everything written so far has been
    /// delivered. Reading from this side keeps working.
    pub fn close_write(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        match self.send.as_mut() {
            Some(send) => send.finish().map_err(|_| Error::StreamClosed),
            None => Err(Error::StreamClosed),
        }
    }

    /// Close both directions and release the session reference.
    ///
    /// The sending direction is finished rather than reset, so the peer reads
    /// everything written followed by end-of-stream. The session reference is
    /// held until the peer acknowledges that data; if the linger expires first
    /// the stream is reset. Calling `close` again has no effect.
    pub fn close(&mut self) {
        if !self.begin_close(Error::CODE_STREAM_CANCELED) {
            return;
        }

        let Some(mut send) = self.send.take() else {
            self.lease.release();
            return;
        };
        if !self.write_closed {
            self.write_closed = true;
            let _ = send.finish();
        }
        linger(send, self.lease.take(), self.linger);
    }

    /// Abruptly terminate both directions with an application error code.
    ///
    /// Written data the peer has not yet received is discarded.
    pub fn reset(&mut self, code: u32) {
        if !self.begin_close(code) {
            return;
        }

        self.write_closed = true;
        if let Some(send) = self.send.as_mut() {
            let _ = send.reset(VarInt::from_u32(code));
        }
        self.lease.release();
    }

    /// Mark the connection closed and stop the receiving direction.
    /// Returns false if it was already closed.
    fn begin_close(&mut self, code: u32) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.read_deadline = None;
        self.write_deadline = None;

        if !self.read_eof {
            let _ = self.recv.stop(VarInt::from_u32(code));
        }
        true
    }

    /// Attach the session's own close reason to transport-level failures.
    fn classify(&self, err: Error) -> Error {
        match err {
            Error::SessionClosed(reason) => {
                Error::SessionClosed(self.session().close_reason().unwrap_or(reason))
            }
            other => other,
        }
    }
}

/// Keep `lease` until the peer acknowledges everything sent on `send`.
fn linger(mut send: quinn::SendStream, lease: StreamLease, within: Duration) {
    // Without a runtime the dropped stream still finishes; only the wait is skipped.
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let stopped = send.stopped();
    runtime.spawn(async move {
        if tokio::time::timeout(within, stopped).await.is_err() {
            debug!(stream_id = %send.id(), "Close linger expired, resetting stream");
            let _ = send.reset(VarInt::from_u32(Error::CODE_STREAM_CANCELED));
        }
        drop(lease);
    });
}

fn update_deadline(slot: &mut Option<Pin<Box<Sleep>>>, deadline: Option<Instant>) {
    let Some(deadline) = deadline else {
        *slot = None;
        return;
    };
    match slot {
        Some(sleep) => sleep.as_mut().reset(deadline),
        None => *slot = Some(Box::pin(tokio::time::sleep_until(deadline))),
    }
}

fn deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    deadline
        .as_mut()
        .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready())
}

impl AsyncRead for StreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        }
        if this.read_eof {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before && buf.remaining() > 0 {
                    this.read_eof = true;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(this.classify(Error::from_read_io(e)).into()))
            }
            Poll::Pending if deadline_elapsed(&mut this.read_deadline, cx) => {
                Poll::Ready(Err(Error::Timeout.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed || this.write_closed {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        }
        let Some(send) = this.send.as_mut() else {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        };

        match AsyncWrite::poll_write(Pin::new(send), cx, buf) {
            Poll::Ready(Ok(written)) => Poll::Ready(Ok(written)),
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(this.classify(Error::from_write_io(e)).into()))
            }
            Poll::Pending if deadline_elapsed(&mut this.write_deadline, cx) => {
                Poll::Ready(Err(Error::Timeout.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        let Some(send) = this.send.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        AsyncWrite::poll_flush(Pin::new(send), cx)
            .map_err(|e| this.classify(Error::from_write_io(e)).into())
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        Poll::Ready(this.close_write().map_err(Into::into))
    }
}

impl Connected for StreamConn {
    type ConnectInfo = StreamConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info()
    }
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("session_id", &self.session_id())
            .field("stream_id", &self.stream_id)
            .field("write_closed", &self.write_closed)
            .field("read_eof", &self.read_eof)
            .field("closed", &self.closed)
            .finish()
    }
}
