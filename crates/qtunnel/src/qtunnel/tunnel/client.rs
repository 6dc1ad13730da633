use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, sync::watch};

use crate::qtunnel::{
    backoff::{Backoff, BackoffPolicy},
    net,
    relay::relay,
    tunnel::{
        connect::{self, ConnectOptions},
        listener::{Listener, TunnelListener},
        shutdown_requested,
        transport::{LISTENER_CLOSE_CODE, LISTENER_CLOSE_REASON, SharedSession, Transport},
    },
};

/// What a connected client does with its session.
#[async_trait]
pub trait SessionService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve `sess` until it is no longer usable; returns the reason.
    async fn serve(&self, sess: SharedSession) -> anyhow::Error;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    /// Pause after a session breaks, before redialing.
    pub cooldown: Duration,
    /// Applied between failed dials; reset after a successful connect.
    pub backoff: BackoffPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            cooldown: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Keeps exactly one outbound session alive and hands it to a service.
pub struct Client {
    opts: ClientOptions,
    transport: Arc<dyn Transport>,
    service: Arc<dyn SessionService>,
}

impl Client {
    pub fn new(
        opts: ClientOptions,
        transport: Arc<dyn Transport>,
        service: Arc<dyn SessionService>,
    ) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }
        Ok(Self {
            opts,
            transport,
            service,
        })
    }

    /// Runs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let server = self.opts.server_addr.trim();
        let mut backoff = Backoff::new(self.opts.backoff);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let dialed = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                res = self.transport.dial(server) => res,
            };
            let sess = match dialed {
                Ok(s) => s,
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        transport = %self.transport.name(),
                        server = %server,
                        err = %err,
                        backoff = %humantime::format_duration(delay),
                        "tunnel: dial failed; retrying"
                    );
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff.reset();

            tracing::info!(
                transport = %self.transport.name(),
                service = %self.service.name(),
                server = %server,
                local = ?sess.local_addr(),
                "tunnel: connected"
            );

            let lost = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => None,
                err = self.service.serve(sess.clone()) => Some(err),
            };
            sess.close(LISTENER_CLOSE_CODE, LISTENER_CLOSE_REASON).await;

            let Some(err) = lost else {
                return Ok(());
            };
            tracing::warn!(
                server = %server,
                err = %err,
                cooldown = %humantime::format_duration(self.opts.cooldown),
                "tunnel: session lost; reconnecting"
            );
            if sleep_or_shutdown(&mut shutdown, self.opts.cooldown).await {
                return Ok(());
            }
        }
    }
}

/// Relays every pushed stream to one fixed upstream address.
#[derive(Debug, Clone)]
pub struct ForwardService {
    pub upstream: String,
    pub dial_timeout: Duration,
}

impl ForwardService {
    pub fn new(upstream: impl Into<String>, dial_timeout: Duration) -> anyhow::Result<Self> {
        let upstream = upstream.into().trim().to_string();
        if upstream.is_empty() {
            anyhow::bail!("must specify upstream host");
        }
        Ok(Self {
            upstream,
            dial_timeout,
        })
    }
}

#[async_trait]
impl SessionService for ForwardService {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn serve(&self, sess: SharedSession) -> anyhow::Error {
        loop {
            let mut stream = match sess.accept_stream().await {
                Ok(s) => s,
                Err(err) => return err,
            };

            let up = match net::dial_tcp(&self.upstream, self.dial_timeout).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(upstream = %self.upstream, err = %err, "tunnel: upstream dial failed");
                    let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
                    continue;
                }
            };

            let upstream = self.upstream.clone();
            tokio::spawn(async move {
                let stats = relay(stream, up).await;
                tracing::debug!(
                    upstream = %upstream,
                    to_upstream = stats.a_to_b,
                    from_upstream = stats.b_to_a,
                    "tunnel: stream closed"
                );
            });
        }
    }
}

/// Runs the CONNECT bridge over the streams of the session.
#[derive(Debug, Clone, Default)]
pub struct ConnectProxyService {
    pub opts: ConnectOptions,
}

#[async_trait]
impl SessionService for ConnectProxyService {
    fn name(&self) -> &'static str {
        "connect-proxy"
    }

    async fn serve(&self, sess: SharedSession) -> anyhow::Error {
        let watched = sess.clone();
        let watcher = tokio::spawn(async move {
            watched.closed().await;
            tracing::info!(remote = ?watched.remote_addr(), "tunnel: session closed");
        });

        let ln = TunnelListener::new(sess);
        let err = connect::serve(&ln, self.opts).await;
        watcher.abort();
        ln.close().await;
        err
    }
}

/// Returns true if shutdown was requested while sleeping.
async fn sleep_or_shutdown(rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
