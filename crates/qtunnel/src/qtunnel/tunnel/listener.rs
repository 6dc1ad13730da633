//! Connection-source abstraction, plus an adapter that exposes one tunnel
//! session as such a source so an ordinary stream server (the CONNECT bridge)
//! can run on top of it.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};

use crate::qtunnel::tunnel::transport::{
    BoxedStream, LISTENER_CLOSE_CODE, LISTENER_CLOSE_REASON, SharedSession,
};

pub trait Addressable {
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A byte stream that also knows both of its endpoint addresses.
pub trait Connection: AsyncRead + AsyncWrite + Addressable + Send + Unpin + 'static {}
impl<T> Connection for T where T: AsyncRead + AsyncWrite + Addressable + Send + Unpin + 'static {}

#[async_trait]
pub trait Listener: Send + Sync {
    type Conn: Connection;

    async fn accept(&self) -> anyhow::Result<Self::Conn>;
    async fn close(&self);
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// One stream pushed over a tunnel session. The stream itself carries no
/// addressing, so the session's addresses are attached.
pub struct TunnelConn {
    stream: BoxedStream,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl TunnelConn {
    pub fn new(stream: BoxedStream, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self {
            stream,
            local,
            remote,
        }
    }
}

impl Addressable for TunnelConn {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Accepts the streams the far side pushes over a single session.
pub struct TunnelListener {
    sess: SharedSession,
}

impl TunnelListener {
    pub fn new(sess: SharedSession) -> Self {
        Self { sess }
    }
}

#[async_trait]
impl Listener for TunnelListener {
    type Conn = TunnelConn;

    async fn accept(&self) -> anyhow::Result<TunnelConn> {
        let stream = self.sess.accept_stream().await?;
        Ok(TunnelConn::new(
            stream,
            self.sess.local_addr(),
            self.sess.remote_addr(),
        ))
    }

    /// Closes the whole session, not just this listener.
    async fn close(&self) {
        self.sess
            .close(LISTENER_CLOSE_CODE, LISTENER_CLOSE_REASON)
            .await;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.sess.local_addr()
    }
}

impl Addressable for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> anyhow::Result<TcpStream> {
        let (conn, _) = TcpListener::accept(self).await?;
        let _ = conn.set_nodelay(true);
        Ok(conn)
    }

    /// The socket is released when the listener is dropped.
    async fn close(&self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }
}

const _: fn() = || {
    fn assert_connection<T: Connection>() {}
    fn assert_listener<T: Listener>() {}
    assert_connection::<TunnelConn>();
    assert_connection::<TcpStream>();
    assert_listener::<TunnelListener>();
    assert_listener::<TcpListener>();
};
