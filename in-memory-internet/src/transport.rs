//! Guest transports: framed Ethernet over a local connection. Stream
//! transports carry a 4-byte big-endian length before each frame; datagram
//! transports carry one frame per datagram.

use crate::mac::Mac;
use crate::server::Server;
use crate::wire::ETHERNET_HEADER_LEN;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tracing::debug;

/// Largest Ethernet frame a guest may send, either framing.
pub const MAX_FRAME_SIZE: usize = 16 << 10;

/// Depth of the per-transport outbound frame queue. When it fills, senders
/// (the router, on its reader task) wait, which throttles the guest that is
/// generating the traffic.
const WRITER_QUEUE_DEPTH: usize = 512;

impl Server {
    /// Serves one guest over a length-prefixed stream transport until the
    /// stream fails, the peer hangs up, or the server shuts down.
    pub async fn serve_stream<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shutdown = self.shutdown_token();
        let (mut rd, mut wr) = tokio::io::split(stream);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE_DEPTH);

        // Writes are serialized by this task; it owns the write half.
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let header = (frame.len() as u32).to_be_bytes();
                let res = async {
                    wr.write_all(&header).await?;
                    wr.write_all(&frame).await?;
                    wr.flush().await
                }
                .await;
                if let Err(err) = res {
                    debug!(%err, "stream transport write failed");
                    return;
                }
            }
        });

        let mut session = GuestSession::new(self.clone(), writer_tx);
        let mut header = [0u8; 4];
        loop {
            let read = async {
                rd.read_exact(&mut header).await?;
                let len = u32::from_be_bytes(header) as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("frame length {len} exceeds limit"),
                    ));
                }
                let mut frame = vec![0u8; len];
                rd.read_exact(&mut frame).await?;
                Ok(frame)
            };
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = read => match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(%err, "stream transport closed");
                        break;
                    }
                },
            };
            session.handle_frame(frame).await;
        }

        drop(session); // deregisters the writer
        writer.abort();
    }

    /// Serves one guest over a connected datagram socket: one Ethernet
    /// frame per datagram. Per-datagram read errors are benign and logged;
    /// the reader keeps going until shutdown.
    pub async fn serve_datagram(self: &Arc<Self>, socket: UnixDatagram) {
        let shutdown = self.shutdown_token();
        let socket = Arc::new(socket);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE_DEPTH);

        let writer_socket = socket.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(err) = writer_socket.send(&frame).await {
                    debug!(%err, "datagram transport write failed");
                    return;
                }
            }
        });

        let mut session = GuestSession::new(self.clone(), writer_tx);
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv(&mut buf) => received,
            };
            match received {
                Ok(n) => session.handle_frame(buf[..n].to_vec()).await,
                Err(err) => {
                    debug!(%err, "datagram transport read failed");
                    continue;
                }
            }
        }

        drop(session);
        writer.abort();
    }
}

/// The per-transport state: which node the transport locked onto with its
/// first valid frame, and the writer registered for it.
struct GuestSession {
    server: Arc<Server>,
    writer: mpsc::Sender<Vec<u8>>,
    locked: Option<LockedNode>,
}

struct LockedNode {
    mac: Mac,
    net: usize,
}

impl GuestSession {
    fn new(server: Arc<Server>, writer: mpsc::Sender<Vec<u8>>) -> GuestSession {
        GuestSession {
            server,
            writer,
            locked: None,
        }
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) {
        if frame.len() < ETHERNET_HEADER_LEN {
            return;
        }
        let Some(src) = Mac::from_slice(&frame[6..12]) else {
            return;
        };

        let net = if let Some(locked) = &self.locked {
            if locked.mac != src {
                debug!(got = %src, want = %locked.mac, "ignoring frame from unexpected MAC");
                return;
            }
            locked.net
        } else {
            let Some(&node) = self.server.node_by_mac.get(&src) else {
                debug!(%src, "ignoring frame from unknown MAC");
                return;
            };
            let node = &self.server.nodes[node];
            debug!(mac = %src, lan_ip = %node.lan_ip, "transport locked to node");
            self.server.networks[node.net]
                .links
                .register(src, self.writer.clone());
            self.locked = Some(LockedNode {
                mac: src,
                net: node.net,
            });
            node.net
        };

        self.server.networks[net]
            .handle_ethernet_frame(&self.server, frame)
            .await;
    }
}

impl Drop for GuestSession {
    fn drop(&mut self) {
        if let Some(locked) = &self.locked {
            self.server.networks[locked.net].links.unregister(locked.mac);
        }
    }
}
