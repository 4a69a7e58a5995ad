//! The per-network link registry: which connected guest (by MAC) gets a
//! frame, and how to hand it to that guest's writer task.

use crate::mac::Mac;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// Posts frames to the transport writer task that owns the wire.
pub(crate) type FrameSender = mpsc::Sender<Vec<u8>>;

/// MAC → writer map for one network. Contains entries for connected guests
/// only; the router itself is never registered.
#[derive(Default)]
pub(crate) struct LinkRegistry {
    writers: Mutex<HashMap<Mac, FrameSender>>,
}

impl LinkRegistry {
    pub(crate) fn register(&self, mac: Mac, sender: FrameSender) {
        self.writers.lock().insert(mac, sender);
    }

    pub(crate) fn unregister(&self, mac: Mac) {
        self.writers.lock().remove(&mac);
    }

    /// Delivers a raw Ethernet frame to the connected guests it addresses:
    /// every guest except the sender for broadcasts, the destination guest
    /// for unicasts. Frames to unknown or disconnected destinations are
    /// dropped, as are frames a guest addresses to itself.
    pub(crate) async fn write_eth(&self, frame: Vec<u8>) {
        if frame.len() < 12 {
            return;
        }
        let (Some(dst), Some(src)) = (
            Mac::from_slice(&frame[0..6]),
            Mac::from_slice(&frame[6..12]),
        ) else {
            return;
        };

        if dst.is_broadcast() {
            let targets: Vec<FrameSender> = {
                let writers = self.writers.lock();
                writers
                    .iter()
                    .filter(|(mac, _)| **mac != src)
                    .map(|(_, sender)| sender.clone())
                    .collect()
            };
            for sender in targets {
                // A send error means the guest disconnected between the
                // lookup and the delivery; that race is fine.
                let _ = sender.send(frame.clone()).await;
            }
            return;
        }

        if dst == src {
            trace!(%src, "dropping frame addressed to its own sender");
            return;
        }

        let sender = self.writers.lock().get(&dst).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dst: Mac, src: Mac) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst.0);
        f.extend_from_slice(&src.0);
        f.extend_from_slice(&[0x08, 0x00]);
        f
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_sender() {
        let reg = LinkRegistry::default();
        let a = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]);
        let b = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x01]);
        let c = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x02]);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        reg.register(a, tx_a);
        reg.register(b, tx_b);
        reg.register(c, tx_c);

        reg.write_eth(frame(Mac::BROADCAST, a)).await;

        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err()); // exactly one copy
    }

    #[tokio::test]
    async fn unicast_and_self_frames() {
        let reg = LinkRegistry::default();
        let a = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]);
        let b = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x01]);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        reg.register(a, tx_a);
        reg.register(b, tx_b);

        reg.write_eth(frame(b, a)).await;
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());

        // Never deliver a frame whose destination equals its source.
        reg.write_eth(frame(a, a)).await;
        assert!(rx_a.try_recv().is_err());

        // Unknown destinations are silently dropped.
        reg.write_eth(frame(Mac([9; 6]), a)).await;

        reg.unregister(b);
        reg.unregister(b); // idempotent
        reg.write_eth(frame(b, a)).await;
        assert!(rx_b.try_recv().is_err());
    }
}
