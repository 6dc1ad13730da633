use rand::{RngExt, rng};
use tokio::sync::RwLock;

use crate::qtunnel::tunnel::transport::{SharedSession, same_session};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Retryable: no tunnel client is connected right now.
    #[error("no client connections available")]
    NoSessionsAvailable,
}

#[derive(Default)]
struct State {
    sessions: Vec<SharedSession>,
    // Invariant: cursor < sessions.len() when non-empty, 0 when empty.
    cursor: usize,
}

/// Active reverse sessions with round-robin dispatch.
///
/// Every mutation (register, unregister and the cursor advance in `next`)
/// takes the write lock; the read lock is only used for snapshots.
pub struct Registry {
    state: RwLock<State>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Append a session. The same remote may appear more than once if it
    /// reconnects before its old session is pruned.
    pub async fn register(&self, sess: SharedSession) {
        let mut st = self.state.write().await;
        st.sessions.push(sess);
    }

    /// Return the session under the cursor and advance it.
    pub async fn next(&self) -> Result<SharedSession, RegistryError> {
        let mut st = self.state.write().await;
        if st.sessions.is_empty() {
            return Err(RegistryError::NoSessionsAvailable);
        }
        let sess = st.sessions[st.cursor].clone();
        st.cursor = (st.cursor + 1) % st.sessions.len();
        Ok(sess)
    }

    /// Swap-remove `sess` (by identity) and reseed the cursor uniformly at
    /// random. Returns false if it was not registered.
    pub async fn unregister(&self, sess: &SharedSession) -> bool {
        let mut st = self.state.write().await;
        let Some(idx) = st.sessions.iter().position(|s| same_session(s, sess)) else {
            return false;
        };
        st.sessions.swap_remove(idx);
        st.cursor = match st.sessions.len() {
            0 => 0,
            len => rng().random_range(0..len),
        };
        true
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Consistent view of `(sessions, cursor)`.
    pub async fn snapshot(&self) -> (Vec<SharedSession>, usize) {
        let st = self.state.read().await;
        (st.sessions.clone(), st.cursor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::qtunnel::tunnel::transport::{Transport, mem::MemTransport};

    async fn sessions(n: usize) -> Vec<SharedSession> {
        let tr = MemTransport::new();
        let _ln = tr.listen("registry").await.unwrap();
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(tr.dial("registry").await.unwrap());
        }
        out
    }

    fn pos(list: &[SharedSession], s: &SharedSession) -> usize {
        list.iter().position(|x| same_session(x, s)).expect("member")
    }

    #[tokio::test]
    async fn empty_registry_is_retryable_error() {
        let reg = Registry::new();
        assert!(matches!(
            reg.next().await,
            Err(RegistryError::NoSessionsAvailable)
        ));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn round_robin_wraps() {
        let s = sessions(3).await;
        let reg = Registry::new();
        for x in &s {
            reg.register(x.clone()).await;
        }

        for expected in [0, 1, 2, 0] {
            let got = reg.next().await.unwrap();
            assert!(same_session(&got, &s[expected]));
        }
    }

    #[tokio::test]
    async fn unregister_swap_deletes_and_reseeds_cursor() {
        let s = sessions(3).await;
        let mut seen = [false; 2];

        for _ in 0..200 {
            let reg = Registry::new();
            for x in &s {
                reg.register(x.clone()).await;
            }
            assert!(reg.unregister(&s[1]).await);

            let (list, cursor) = reg.snapshot().await;
            assert_eq!(list.len(), 2);
            assert!(same_session(&list[0], &s[0]));
            assert!(same_session(&list[1], &s[2]));
            assert!(cursor < 2);
            seen[cursor] = true;
        }

        assert_eq!(seen, [true, true], "cursor should be drawn from the whole range");
    }

    #[tokio::test]
    async fn unregister_last_resets_cursor_and_ignores_unknown() {
        let s = sessions(2).await;
        let reg = Registry::new();
        reg.register(s[0].clone()).await;

        assert!(!reg.unregister(&s[1]).await);
        assert!(reg.unregister(&s[0]).await);
        let (list, cursor) = reg.snapshot().await;
        assert!(list.is_empty());
        assert_eq!(cursor, 0);
        assert!(!reg.unregister(&s[0]).await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_kept() {
        let s = sessions(1).await;
        let reg = Registry::new();
        reg.register(s[0].clone()).await;
        reg.register(s[0].clone()).await;
        assert_eq!(reg.len().await, 2);

        assert!(reg.unregister(&s[0]).await);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn random_register_unregister_sequences_stay_in_bounds() {
        let pool = sessions(6).await;
        let reg = Arc::new(Registry::new());
        let mut live: Vec<SharedSession> = Vec::new();

        for step in 0..500usize {
            let pick = rng().random_range(0..pool.len());
            if rng().random_bool(0.5) {
                reg.register(pool[pick].clone()).await;
                live.push(pool[pick].clone());
            } else if reg.unregister(&pool[pick]).await {
                let i = pos(&live, &pool[pick]);
                live.swap_remove(i);
            }

            let (list, cursor) = reg.snapshot().await;
            assert_eq!(list.len(), live.len(), "step {step}");
            if list.is_empty() {
                assert_eq!(cursor, 0);
                assert!(reg.next().await.is_err());
            } else {
                assert!(cursor < list.len());
                let got = reg.next().await.unwrap();
                assert!(live.iter().any(|s| same_session(s, &got)));
            }
        }
    }

    #[tokio::test]
    async fn concurrent_next_and_unregister_never_panic() {
        let pool = sessions(8).await;
        let reg = Arc::new(Registry::new());
        for s in &pool {
            reg.register(s.clone()).await;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let reg = reg.clone();
            tasks.spawn(async move {
                for _ in 0..200 {
                    let _ = reg.next().await;
                    tokio::task::yield_now().await;
                }
            });
        }
        for s in pool.clone() {
            let reg = reg.clone();
            tasks.spawn(async move {
                tokio::task::yield_now().await;
                reg.unregister(&s).await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("task panicked");
        }

        assert!(reg.is_empty().await);
        assert_eq!(reg.snapshot().await.1, 0);
    }
}
