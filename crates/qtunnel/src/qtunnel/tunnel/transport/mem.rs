//! In-process transport used by tests: sessions are channel pairs and
//! streams are `tokio::io::duplex` pipes.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::qtunnel::tunnel::transport::{
    BoxedStream, SharedSession, Transport, TransportError, TransportListener, TransportSession,
};

const PIPE_BYTES: usize = 64 * 1024;

#[derive(Default)]
struct Shared {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<SharedSession>>>,
    fail_dials: AtomicUsize,
    dials: AtomicUsize,
    port_seq: AtomicU16,
    closes: Mutex<Vec<(u32, String)>>,
}

#[derive(Clone, Default)]
pub struct MemTransport {
    shared: Arc<Shared>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_dials(&self, n: usize) {
        self.shared.fail_dials.store(n, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// `(code, reason)` of every explicit session close, in order.
    pub fn closes(&self) -> Vec<(u32, String)> {
        self.shared.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        "mem"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock().unwrap();
        if listeners.contains_key(addr) {
            anyhow::bail!("mem: address in use {addr}");
        }
        listeners.insert(addr.to_string(), tx);
        Ok(Box::new(MemListener {
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<SharedSession> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .shared
            .fail_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("mem: injected dial failure");
        }

        let port = 1000 + self.shared.port_seq.fetch_add(1, Ordering::SeqCst);
        let (server, client) = MemSession::pair(port, self.shared.clone());

        let tx = self
            .shared
            .listeners
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("mem: connection refused {addr}"))?;
        tx.send(server)
            .map_err(|_| anyhow::anyhow!("mem: connection refused {addr}"))?;
        Ok(client)
    }
}

struct MemListener {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SharedSession>>,
}

#[async_trait]
impl TransportListener for MemListener {
    async fn accept(&self) -> anyhow::Result<SharedSession> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await.ok_or(TransportError::ListenerClosed)?)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) {
        self.rx.lock().await.close();
    }
}

pub struct MemSession {
    outgoing: mpsc::UnboundedSender<tokio::io::DuplexStream>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<tokio::io::DuplexStream>>,
    closed: Arc<watch::Sender<bool>>,
    local: SocketAddr,
    remote: SocketAddr,
    shared: Arc<Shared>,
}

impl MemSession {
    /// Returns `(server side, client side)` of one connection.
    fn pair(port: u16, shared: Arc<Shared>) -> (SharedSession, SharedSession) {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let server_addr: SocketAddr = ([127, 0, 0, 1], 8888).into();
        let client_addr: SocketAddr = ([127, 0, 0, 1], port).into();

        let server = MemSession {
            outgoing: to_client,
            incoming: tokio::sync::Mutex::new(server_rx),
            closed: closed.clone(),
            local: server_addr,
            remote: client_addr,
            shared: shared.clone(),
        };
        let client = MemSession {
            outgoing: to_server,
            incoming: tokio::sync::Mutex::new(client_rx),
            closed,
            local: client_addr,
            remote: server_addr,
            shared,
        };
        (Arc::new(server), Arc::new(client))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl TransportSession for MemSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed.into());
        }
        let (local, remote) = tokio::io::duplex(PIPE_BYTES);
        self.outgoing
            .send(remote)
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            st = rx.recv() => match st {
                Some(st) if !self.is_closed() => Ok(Box::new(st)),
                _ => Err(TransportError::SessionClosed.into()),
            },
            _ = closed.wait_for(|c| *c) => Err(TransportError::SessionClosed.into()),
        }
    }

    async fn close(&self, code: u32, reason: &str) {
        if !self.closed.send_replace(true) {
            self.shared
                .closes
                .lock()
                .unwrap()
                .push((code, reason.to_string()));
        }
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}
