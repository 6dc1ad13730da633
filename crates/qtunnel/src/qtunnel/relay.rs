//! Bidirectional relay between two byte-stream endpoints.
//!
//! Both directions are copied by independent tasks. Whichever direction ends
//! first (EOF or error) flips a one-shot latch that stops the opposite
//! direction; once both tasks are done each endpoint is shut down exactly once.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time,
};

const COPY_BUF_BYTES: usize = 32 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes moved in each direction of one relay pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// One-shot close latch shared by the two copy tasks of a single pair.
#[derive(Clone)]
struct CloseLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseLatch {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true only for the caller that flipped the latch.
    fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Couple `a` and `b` until either side ends.
///
/// Never fails: copy errors and EOF are both ordinary termination. Returns
/// after both copy tasks have finished and both endpoints were shut down.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let latch = CloseLatch::new();

    let fwd = tokio::spawn(pipe("a->b", a_rd, b_wr, latch.clone()));
    let back = tokio::spawn(pipe("b->a", b_rd, a_wr, latch));

    let (fwd, back) = tokio::join!(fwd, back);

    match (fwd, back) {
        (Ok(fwd), Ok(back)) => {
            let mut a = fwd.rd.unsplit(back.wr);
            let mut b = back.rd.unsplit(fwd.wr);
            close(&mut a).await;
            close(&mut b).await;
            RelayStats {
                a_to_b: fwd.copied,
                b_to_a: back.copied,
            }
        }
        (fwd, back) => {
            // The surviving halves are dropped here, which closes them.
            tracing::warn!(
                fwd_ok = fwd.is_ok(),
                back_ok = back.is_ok(),
                "relay: copy task panicked"
            );
            RelayStats::default()
        }
    }
}

struct PipeEnd<R, W> {
    rd: R,
    wr: W,
    copied: u64,
}

async fn pipe<R, W>(dir: &'static str, mut rd: R, mut wr: W, latch: CloseLatch) -> PipeEnd<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let res = tokio::select! {
        res = copy_counted(&mut rd, &mut wr, &mut copied) => res,
        _ = latch.fired() => Ok(()),
    };
    let first = latch.fire();

    if let Err(err) = res {
        tracing::debug!(dir, first, copied, err = %err, "relay: copy ended with error");
    }

    PipeEnd { rd, wr, copied }
}

async fn copy_counted<R, W>(rd: &mut R, wr: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

async fn close<S: AsyncWrite + Unpin>(s: &mut S) {
    let _ = time::timeout(SHUTDOWN_TIMEOUT, s.shutdown()).await;
}
