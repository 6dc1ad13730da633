use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type SharedSession = Arc<dyn TransportSession>;

/// Close code sent when a client gives up on a broken session or a tunnel
/// listener is closed.
pub const LISTENER_CLOSE_CODE: u32 = 100;
pub const LISTENER_CLOSE_REASON: &str = "die";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tunnel: listener closed")]
    ListenerClosed,
    #[error("tunnel: session closed")]
    SessionClosed,
}

/// Returns true when `err` means the session listener is gone for good.
pub fn is_listener_closed(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransportError>(),
        Some(TransportError::ListenerClosed)
    )
}

/// Dial/listen half of the multiplexed transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str) -> anyhow::Result<SharedSession>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<SharedSession>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self);
}

/// One multiplexed connection to a single remote peer.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self, code: u32, reason: &str);
    /// Resolves once, when the session is permanently gone.
    async fn closed(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Identity comparison of two sessions (same allocation).
pub fn same_session(a: &SharedSession, b: &SharedSession) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
pub mod mem;
pub mod quic;
