//! A queue-backed `smoltcp` device carrying raw IPv4 datagrams: the router
//! pushes intercepted packets in, the pump drains the stack's output and
//! wraps it back into Ethernet.

use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use tracing::debug;

const MTU: usize = 1500;
const MAX_QUEUED: usize = 512;

pub(crate) struct QueueDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

impl QueueDevice {
    pub(crate) fn new() -> QueueDevice {
        QueueDevice {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue_rx(&mut self, datagram: Vec<u8>) {
        if self.rx.len() >= MAX_QUEUED {
            debug!("stack inbound queue full; dropping datagram");
            return;
        }
        self.rx.push_back(datagram);
    }

    pub(crate) fn pop_tx(&mut self) -> Option<Vec<u8>> {
        self.tx.pop_front()
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = QueueRxToken where Self: 'a;
    type TxToken<'a> = QueueTxToken<'a> where Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MTU;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let datagram = self.rx.pop_front()?;
        Some((QueueRxToken(datagram), QueueTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken(&mut self.tx))
    }
}

pub(crate) struct QueueRxToken(Vec<u8>);

impl smoltcp::phy::RxToken for QueueRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub(crate) struct QueueTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl smoltcp::phy::TxToken for QueueTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        if self.0.len() < MAX_QUEUED {
            self.0.push_back(buf);
        }
        result
    }
}
