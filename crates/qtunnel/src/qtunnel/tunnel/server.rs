use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::qtunnel::{
    net::normalize_bind_addr,
    relay::relay,
    tunnel::{
        listener::Listener,
        registry::Registry,
        shutdown_requested,
        transport::{SharedSession, Transport, TransportListener, is_listener_closed},
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Where tunnel clients connect.
    pub tunnel_addr: String,
    /// Where plain TCP callers connect.
    pub plain_addr: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tunnel_addr: "0.0.0.0:8888".to_string(),
            plain_addr: "0.0.0.0:8443".to_string(),
        }
    }
}

/// Rendezvous server with both listeners bound.
pub struct Server {
    registry: Arc<Registry>,
    sessions: Box<dyn TransportListener>,
    plain: TcpListener,
}

impl Server {
    /// Bind both listeners. Failure here is fatal for the process.
    pub async fn bind(opts: &ServerOptions, transport: &dyn Transport) -> anyhow::Result<Self> {
        let sessions = transport
            .listen(&opts.tunnel_addr)
            .await
            .with_context(|| format!("tunnel: listen {}", opts.tunnel_addr))?;

        let plain_addr = normalize_bind_addr(&opts.plain_addr);
        let plain = TcpListener::bind(plain_addr.as_ref())
            .await
            .with_context(|| format!("tunnel: bind tcp {plain_addr}"))?;

        tracing::info!(
            transport = %transport.name(),
            tunnel = ?sessions.local_addr(),
            plain = ?plain.local_addr().ok(),
            "tunnel: listening"
        );

        Ok(Self {
            registry: Arc::new(Registry::new()),
            sessions,
            plain,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.sessions.local_addr()
    }

    pub fn plain_addr(&self) -> Option<SocketAddr> {
        self.plain.local_addr().ok()
    }

    /// Run the session loop and the plain-connection loop until shutdown or
    /// until the session listener goes away.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Self {
            registry,
            sessions,
            plain,
        } = self;

        let res = tokio::select! {
            err = session_loop(sessions.as_ref(), registry.clone()) => Err(err),
            _ = plain_loop(&plain, registry.clone()) => Ok(()),
            _ = shutdown_requested(&mut shutdown) => Ok(()),
        };

        sessions.close().await;
        for sess in registry.snapshot().await.0 {
            sess.close(0, "server shutdown").await;
        }
        res
    }
}

async fn session_loop(ln: &dyn TransportListener, registry: Arc<Registry>) -> anyhow::Error {
    loop {
        let sess = match ln.accept().await {
            Ok(s) => s,
            Err(err) if is_listener_closed(&err) => return err,
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "tunnel: session accept failed");
                continue;
            }
        };

        registry.register(sess.clone()).await;
        let n = registry.len().await;
        tracing::info!(
            client = ?sess.remote_addr(),
            sessions = n,
            "tunnel: session registered"
        );

        let registry = registry.clone();
        tokio::spawn(async move {
            sess.closed().await;
            registry.unregister(&sess).await;
            let n = registry.len().await;
            tracing::info!(
                client = ?sess.remote_addr(),
                sessions = n,
                "tunnel: session lost"
            );
        });
    }
}

async fn plain_loop(ln: &TcpListener, registry: Arc<Registry>) {
    loop {
        let mut conn = match Listener::accept(ln).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: tcp accept failed");
                continue;
            }
        };

        let sess = match registry.next().await {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(peer = ?conn.peer_addr().ok(), err = %err, "tunnel: dropping connection");
                tokio::spawn(async move {
                    let _ = conn.shutdown().await;
                });
                continue;
            }
        };

        tokio::spawn(dispatch(conn, sess));
    }
}

async fn dispatch(mut conn: TcpStream, sess: SharedSession) {
    let peer = conn.peer_addr().ok();
    let stream = match sess.open_stream().await {
        Ok(st) => st,
        Err(err) => {
            tracing::warn!(peer = ?peer, client = ?sess.remote_addr(), err = %err, "tunnel: open stream failed");
            let _ = conn.shutdown().await;
            return;
        }
    };
    tracing::debug!(peer = ?peer, client = ?sess.remote_addr(), "tunnel: relaying");

    let stats = relay(conn, stream).await;
    tracing::debug!(
        peer = ?peer,
        up = stats.a_to_b,
        down = stats.b_to_a,
        "tunnel: connection closed"
    );
}
