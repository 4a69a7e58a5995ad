//! `StackConn`: an async byte stream over a connection terminated on a
//! network's user-space TCP stack. The stack pump owns the smoltcp socket;
//! this adapter talks to it through bounded channels, which is also where
//! backpressure comes from.

use smoltcp::iface::SocketHandle;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Commands a connection handler sends to the pump that owns its socket.
pub(crate) enum ConnCmd {
    /// Bytes to transmit to the guest.
    Data { handle: SocketHandle, bytes: Vec<u8> },
    /// Close the transmit half (FIN) once buffered data is flushed.
    Shutdown { handle: SocketHandle },
    /// Tear the connection down with a RST.
    Abort { handle: SocketHandle },
}

impl ConnCmd {
    pub(crate) fn handle(&self) -> SocketHandle {
        match self {
            ConnCmd::Data { handle, .. }
            | ConnCmd::Shutdown { handle }
            | ConnCmd::Abort { handle } => *handle,
        }
    }
}

/// One terminated TCP connection, readable and writable like any socket.
/// Dropping it closes the guest-facing connection once in-flight data is
/// flushed.
pub struct StackConn {
    handle: SocketHandle,
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    tx: PollSender<ConnCmd>,
    raw_tx: mpsc::Sender<ConnCmd>,
    write_closed: bool,
}

impl StackConn {
    pub(crate) fn new(
        handle: SocketHandle,
        rx: mpsc::Receiver<Vec<u8>>,
        cmd_tx: mpsc::Sender<ConnCmd>,
    ) -> StackConn {
        StackConn {
            handle,
            rx,
            leftover: Vec::new(),
            tx: PollSender::new(cmd_tx.clone()),
            raw_tx: cmd_tx,
            write_closed: false,
        }
    }

    /// Resets the guest-facing connection instead of closing it cleanly.
    pub(crate) async fn abort(self) {
        let _ = self
            .raw_tx
            .send(ConnCmd::Abort {
                handle: self.handle,
            })
            .await;
    }
}

impl AsyncRead for StackConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => {
                let n = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.leftover.extend_from_slice(&bytes[n..]);
                }
                Poll::Ready(Ok(()))
            }
            // Channel closed: the guest finished sending. EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StackConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let handle = self.handle;
                if self
                    .tx
                    .send_item(ConnCmd::Data {
                        handle,
                        bytes: buf.to_vec(),
                    })
                    .is_err()
                {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let handle = self.handle;
                let _ = self.tx.send_item(ConnCmd::Shutdown { handle });
                self.write_closed = true;
                Poll::Ready(Ok(()))
            }
            // The pump is gone; there is nothing left to shut down.
            Poll::Ready(Err(_)) => {
                self.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
