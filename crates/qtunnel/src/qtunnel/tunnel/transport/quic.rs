use std::{
    future::IntoFuture,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig, VarInt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::qtunnel::{
    net,
    tls::{self, ClientTlsOptions, ServerTlsOptions},
    tunnel::transport::{
        BoxedStream, SharedSession, Transport, TransportError, TransportListener,
        TransportSession,
    },
};

pub const DEFAULT_ALPN: &[u8] = b"qtunnel";

/// QUIC tuning shared by both roles.
#[derive(Debug, Clone)]
pub struct QuicTuning {
    pub handshake_timeout: Duration,
    pub max_idle_timeout: Duration,
    /// Only applied on the dialing side; zero disables keep-alives.
    pub keep_alive_interval: Duration,
    pub max_incoming_streams: u32,
    pub stream_receive_window: u64,
    pub receive_window: u64,
}

impl Default for QuicTuning {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            max_idle_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(2),
            max_incoming_streams: 10_000,
            stream_receive_window: 246 * (1 << 20),
            receive_window: 500 * (1 << 20),
        }
    }
}

impl QuicTuning {
    fn transport_config(&self, keep_alive: bool) -> anyhow::Result<TransportConfig> {
        let mut cfg = TransportConfig::default();
        if self.max_idle_timeout > Duration::ZERO {
            cfg.max_idle_timeout(Some(
                self.max_idle_timeout
                    .try_into()
                    .context("quic: max_idle_timeout out of range")?,
            ));
        }
        if keep_alive && self.keep_alive_interval > Duration::ZERO {
            cfg.keep_alive_interval(Some(self.keep_alive_interval));
        }
        cfg.max_concurrent_bidi_streams(VarInt::from_u32(self.max_incoming_streams));
        cfg.max_concurrent_uni_streams(VarInt::from_u32(self.max_incoming_streams));
        cfg.stream_receive_window(
            VarInt::from_u64(self.stream_receive_window)
                .context("quic: stream_receive_window out of range")?,
        );
        cfg.receive_window(
            VarInt::from_u64(self.receive_window).context("quic: receive_window out of range")?,
        );
        Ok(cfg)
    }

    async fn handshake<F>(&self, fut: F) -> anyhow::Result<Connection>
    where
        F: std::future::Future<Output = Result<Connection, quinn::ConnectionError>>,
    {
        if self.handshake_timeout > Duration::ZERO {
            Ok(tokio::time::timeout(self.handshake_timeout, fut)
                .await
                .context("quic: handshake timeout")??)
        } else {
            Ok(fut.await?)
        }
    }
}

#[derive(Debug, Clone)]
enum QuicRole {
    Server(ServerTlsOptions),
    Client(ClientTlsOptions),
}

pub struct QuicTransport {
    role: QuicRole,
    tuning: QuicTuning,
    alpn: Vec<Vec<u8>>,
}

impl QuicTransport {
    pub fn server(tls: ServerTlsOptions, tuning: QuicTuning) -> Self {
        Self {
            role: QuicRole::Server(tls),
            tuning,
            alpn: vec![DEFAULT_ALPN.to_vec()],
        }
    }

    pub fn client(tls: ClientTlsOptions, tuning: QuicTuning) -> Self {
        Self {
            role: QuicRole::Client(tls),
            tuning,
            alpn: vec![DEFAULT_ALPN.to_vec()],
        }
    }

    /// Build the dial config up front so bad TLS material fails at startup
    /// instead of on every reconnect attempt.
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.role {
            QuicRole::Server(tls) => tls::server_crypto_config(tls, self.alpn.clone()).map(|_| ()),
            QuicRole::Client(tls) => tls::client_crypto_config(tls, self.alpn.clone()).map(|_| ()),
        }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let QuicRole::Server(tls) = &self.role else {
            anyhow::bail!("quic: listen requires server TLS options");
        };
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("quic: invalid listen address {bind_addr}"))?;

        let server_crypto = tls::server_crypto_config(tls, self.alpn.clone())?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(self.tuning.transport_config(false)?));

        let endpoint = Endpoint::server(server_cfg, addr)
            .with_context(|| format!("quic: bind {addr}"))?;
        Ok(Box::new(QuicTransportListener::new(
            endpoint,
            self.tuning.clone(),
        )))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<SharedSession> {
        let QuicRole::Client(tls) = &self.role else {
            anyhow::bail!("quic: dial requires client TLS options");
        };

        let client_crypto = tls::client_crypto_config(tls, self.alpn.clone())?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(self.tuning.transport_config(true)?));

        let remote = net::resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind).context("quic: bind client endpoint")?;
        endpoint.set_default_client_config(client_cfg);

        let name = if tls.server_name.trim().is_empty() {
            "localhost"
        } else {
            tls.server_name.trim()
        };

        let connecting = endpoint.connect(remote, name)?;
        let conn = self.tuning.handshake(connecting).await?;
        Ok(Arc::new(QuicSession::new(conn, endpoint)))
    }
}

/// Hands out sessions whose handshake already completed. Each incoming
/// connection handshakes on its own task, so a silent peer never holds up
/// the others.
pub struct QuicTransportListener {
    endpoint: Endpoint,
    ready: Mutex<mpsc::Receiver<Connection>>,
    task: JoinHandle<()>,
}

impl QuicTransportListener {
    fn new(endpoint: Endpoint, tuning: QuicTuning) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let ep = endpoint.clone();
        let task = tokio::spawn(async move {
            while let Some(incoming) = ep.accept().await {
                let tx = tx.clone();
                let tuning = tuning.clone();
                tokio::spawn(async move {
                    let remote = incoming.remote_address();
                    match tuning.handshake(incoming.into_future()).await {
                        Ok(conn) => {
                            let _ = tx.send(conn).await;
                        }
                        Err(err) => {
                            tracing::warn!(remote = %remote, err = %format!("{err:#}"), "quic: handshake failed");
                        }
                    }
                });
            }
        });
        Self {
            endpoint,
            ready: Mutex::new(rx),
            task,
        }
    }
}

impl Drop for QuicTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<SharedSession> {
        let conn = self
            .ready
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)?;
        Ok(Arc::new(QuicSession::new(conn, self.endpoint.clone())))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"");
    }
}

struct QuicSession {
    conn: Connection,
    // Keeps a client-side endpoint (and its socket driver) alive with the session.
    endpoint: Endpoint,
}

impl QuicSession {
    fn new(conn: Connection, endpoint: Endpoint) -> Self {
        Self { conn, endpoint }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        tracing::trace!(stream_id = %send.id(), "quic: opened stream");
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.accept_bi().await?;
        tracing::trace!(stream_id = %send.id(), "quic: accepted stream");
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn close(&self, code: u32, reason: &str) {
        self.conn.close(code.into(), reason.as_bytes());
    }

    async fn closed(&self) {
        let reason = self.conn.closed().await;
        tracing::debug!(remote = %self.conn.remote_address(), reason = %reason, "quic: session closed");
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}
