//! The agent registry: terminated TCP connections from in-guest test
//! agents, queued per node until a caller wants to talk to that agent.

use crate::stack::StackConn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A terminated connection from the test agent on `node`.
pub(crate) struct AgentConn {
    pub(crate) node: usize,
    pub(crate) conn: StackConn,
}

#[derive(Default)]
pub(crate) struct AgentRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Idle connections, unkeyed; small enough to scan.
    idle: Vec<AgentConn>,
    /// One waiter per node, signaled when a connection for it arrives.
    waiters: HashMap<usize, mpsc::Sender<()>>,
}

impl AgentRegistry {
    /// Queues an idle agent connection and nudges the waiter for its node,
    /// if any. Never blocks.
    pub(crate) fn add_idle(&self, ac: AgentConn) {
        debug!(node = ac.node, "got agent conn");
        let mut inner = self.inner.lock();
        let node = ac.node;
        inner.idle.push(ac);
        if let Some(waiter) = inner.waiters.get(&node) {
            let _ = waiter.try_send(());
        }
    }

    fn take_one(&self, node: usize) -> Option<AgentConn> {
        let mut inner = self.inner.lock();
        let pos = inner.idle.iter().position(|ac| ac.node == node)?;
        Some(inner.idle.swap_remove(pos))
    }

    /// Takes the next queued connection for `node`, waiting for one to be
    /// admitted. Returns `None` once `cancel` fires.
    pub(crate) async fn take(&self, cancel: &CancellationToken, node: usize) -> Option<AgentConn> {
        loop {
            if let Some(ac) = self.take_one(node) {
                return Some(ac);
            }
            let (tx, mut rx) = mpsc::channel(1);
            self.inner.lock().waiters.insert(node, tx);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = rx.recv() => {}
                // Retry periodically regardless: a connection admitted
                // between take_one and installing the waiter, or a waiter
                // displaced by a second caller, would otherwise be missed.
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::iface::{SocketHandle, SocketSet};
    use smoltcp::socket::tcp;
    use std::sync::Arc;
    use tokio::time::{timeout, Instant};

    fn conn() -> (StackConn, SocketHandle) {
        let mut sockets = SocketSet::new(vec![]);
        let handle = sockets.add(tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; 64]),
            tcp::SocketBuffer::new(vec![0; 64]),
        ));
        let (_to_conn, rx) = mpsc::channel(1);
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        (StackConn::new(handle, rx, cmd_tx), handle)
    }

    #[tokio::test]
    async fn queued_conn_is_taken_immediately() {
        let registry = AgentRegistry::default();
        let (c, _) = conn();
        registry.add_idle(AgentConn { node: 3, conn: c });

        let cancel = CancellationToken::new();
        let taken = registry.take(&cancel, 3).await.unwrap();
        assert_eq!(taken.node, 3);
        // The queue is empty again.
        assert!(registry.take_one(3).is_none());
    }

    #[tokio::test]
    async fn take_blocks_until_admission() {
        let registry = Arc::new(AgentRegistry::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.take(&cancel, 0).await.map(|ac| ac.node) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (c, _) = conn();
        registry.add_idle(AgentConn { node: 0, conn: c });

        let got = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some(0));
    }

    #[tokio::test]
    async fn take_respects_cancellation() {
        let registry = AgentRegistry::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(registry.take(&cancel, 0).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_retry_recovers_lost_wakeups() {
        let registry = Arc::new(AgentRegistry::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.take(&cancel, 7).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Slip a connection in without signaling: displace the waiter the
        // way a racing second caller would.
        {
            let (c, _) = conn();
            let mut inner = registry.inner.lock();
            inner.waiters.remove(&7);
            inner.idle.push(AgentConn { node: 7, conn: c });
        }

        let start = Instant::now();
        assert!(timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap());
        // The 1s retry tick, not a signal, must have picked it up.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
