//! Reverse tunnel: the rendezvous server, the reconnecting client, and the
//! pieces they share.

use tokio::sync::watch;

pub mod client;
pub mod connect;
pub mod listener;
pub mod registry;
pub mod server;
pub mod transport;

/// Resolves once shutdown is requested. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
