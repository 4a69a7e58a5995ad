//! The TCP terminator: one user-space TCP/IP stack per network, fed with
//! the IPv4 datagrams the router intercepts. Accepted connections are
//! answered in-process (probe sink, test agents) or bridged to the real
//! host network (relays, the control plane).

mod conn;
mod device;

pub use conn::StackConn;
pub(crate) use conn::ConnCmd;

use crate::agent::AgentConn;
use crate::server::Server;
use crate::wire;
use crate::{FAKE_CONTROL_PLANE_IP, FAKE_TEST_AGENT_IP};
use device::QueueDevice;
use pnet_packet::ipv4::Ipv4Packet;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Destination ports the router intercepts; each keeps a listening socket
/// ready on every network's stack.
const INTERCEPT_PORTS: [u16; 4] = [123, 80, 443, 8008];

/// Depth of the router → stack inbound datagram queue.
pub(crate) const INJECT_QUEUE_DEPTH: usize = 512;

const SOCKET_BUFFER_SIZE: usize = 64 * 1024;
const CONN_CHANNEL_DEPTH: usize = 32;
const CMD_CHANNEL_DEPTH: usize = 256;
const RECV_CHUNK: usize = 4096;
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What the TCP probe sink on port 123 says before hanging up.
const PROBE_GREETING: &[u8] = b"Hello from Go\nGoodbye.\n";

fn smol_now() -> SmolInstant {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    SmolInstant::from_micros(now.as_micros() as i64)
}

fn endpoint_ipv4(addr: IpAddress) -> Ipv4Addr {
    match addr {
        IpAddress::Ipv4(a) => Ipv4Addr::from(a.0),
    }
}

/// Per-connection pump state: the buffers between a smoltcp socket and the
/// handler task holding the matching [`StackConn`].
struct ConnState {
    /// Data from the guest on its way to the handler; `None` after EOF.
    to_conn: Option<mpsc::Sender<Vec<u8>>>,
    /// A chunk the handler channel had no room for.
    stalled: Option<Vec<u8>>,
    /// Data from the handler not yet accepted by the socket.
    from_conn: Vec<u8>,
    /// Handler shut down its write half; FIN once `from_conn` drains.
    write_closed: bool,
    /// Handler asked for a RST.
    abort: bool,
    /// Handler dropped the conn entirely.
    handler_gone: bool,
}

/// Runs one network's stack until shutdown. `inject_rx` delivers the IPv4
/// datagrams the router intercepts.
pub(crate) async fn run(server: Arc<Server>, net: usize, mut inject_rx: mpsc::Receiver<Vec<u8>>) {
    let shutdown = server.shutdown_token();
    let router_ip = server.networks[net].router_ip();
    let prefix_bits = server.networks[net].lan_prefix.bits();

    let mut device = QueueDevice::new();
    let mut iface = Interface::new(IfaceConfig::new(HardwareAddress::Ip), &mut device, smol_now());
    iface.update_ip_addrs(|addrs| {
        addrs
            .push(IpCidr::new(IpAddress::from(Ipv4Address::from(router_ip)), prefix_bits))
            .unwrap();
    });
    // The stack must accept connections for addresses it does not own
    // (relay IPs, the fake control plane); any-IP mode covers that.
    iface.set_any_ip(true);
    iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Address::from(router_ip))
        .unwrap();

    let mut sockets = SocketSet::new(vec![]);
    let mut listeners: HashMap<SocketHandle, u16> = INTERCEPT_PORTS
        .iter()
        .map(|&port| (add_listener(&mut sockets, port), port))
        .collect();
    let mut handshaking: Vec<SocketHandle> = Vec::new();
    let mut conns: HashMap<SocketHandle, ConnState> = HashMap::new();
    // Sockets with no handler (the probe sink) still need reaping.
    let mut transient: Vec<SocketHandle> = Vec::new();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ConnCmd>(CMD_CHANNEL_DEPTH);

    loop {
        let delay = iface
            .poll_delay(smol_now(), &sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
            .unwrap_or(MAX_POLL_INTERVAL)
            .min(MAX_POLL_INTERVAL);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            datagram = inject_rx.recv() => {
                let Some(datagram) = datagram else { break };
                device.enqueue_rx(datagram);
                while let Ok(more) = inject_rx.try_recv() {
                    device.enqueue_rx(more);
                }
            }
            cmd = cmd_rx.recv() => {
                if let Some(cmd) = cmd {
                    apply_cmd(&mut conns, cmd);
                    while let Ok(more) = cmd_rx.try_recv() {
                        apply_cmd(&mut conns, more);
                    }
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }

        iface.poll(smol_now(), &mut device, &mut sockets);

        accept_connections(
            &server,
            net,
            &mut sockets,
            &mut listeners,
            &mut handshaking,
            &mut conns,
            &mut transient,
            &cmd_tx,
        );
        relay_connections(&mut sockets, &mut conns);

        // A second poll turns freshly buffered data into segments before we
        // flush the device, saving a timer round-trip per chunk.
        iface.poll(smol_now(), &mut device, &mut sockets);
        flush_device(&server, net, &mut device).await;
        reap_closed(&mut sockets, &mut conns, &mut transient);
    }
}

fn apply_cmd(conns: &mut HashMap<SocketHandle, ConnState>, cmd: ConnCmd) {
    // The connection may already be reaped; stale commands are fine.
    let Some(state) = conns.get_mut(&cmd.handle()) else {
        return;
    };
    match cmd {
        ConnCmd::Data { bytes, .. } => state.from_conn.extend_from_slice(&bytes),
        ConnCmd::Shutdown { .. } => state.write_closed = true,
        ConnCmd::Abort { .. } => state.abort = true,
    }
}

fn add_listener(sockets: &mut SocketSet<'static>, port: u16) -> SocketHandle {
    let rx = tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]);
    let mut sock = tcp::Socket::new(rx, tx);
    sock.set_nagle_enabled(false);
    // Listening on a fresh socket only fails for port 0.
    sock.listen(port).unwrap();
    sockets.add(sock)
}

/// Watches the listener pool: a listener that caught a SYN is replaced (so
/// the port keeps accepting) and dispatched once its handshake completes.
#[allow(clippy::too_many_arguments)]
fn accept_connections(
    server: &Arc<Server>,
    net: usize,
    sockets: &mut SocketSet<'static>,
    listeners: &mut HashMap<SocketHandle, u16>,
    handshaking: &mut Vec<SocketHandle>,
    conns: &mut HashMap<SocketHandle, ConnState>,
    transient: &mut Vec<SocketHandle>,
    cmd_tx: &mpsc::Sender<ConnCmd>,
) {
    let engaged: Vec<(SocketHandle, u16)> = listeners
        .iter()
        .filter(|(&h, _)| sockets.get::<tcp::Socket>(h).state() != tcp::State::Listen)
        .map(|(&h, &port)| (h, port))
        .collect();
    for (handle, port) in engaged {
        listeners.remove(&handle);
        listeners.insert(add_listener(sockets, port), port);
        handshaking.push(handle);
    }

    let mut still_handshaking = Vec::new();
    for handle in handshaking.drain(..) {
        match sockets.get::<tcp::Socket>(handle).state() {
            tcp::State::Established => {
                dispatch_accept(server, net, sockets, handle, conns, transient, cmd_tx);
            }
            tcp::State::Closed => {
                sockets.remove(handle);
            }
            _ => still_handshaking.push(handle),
        }
    }
    *handshaking = still_handshaking;
}

/// Decides what a newly established connection is for, per the interception
/// predicate: probe sink, agent hand-off, or a bridge to the host network.
fn dispatch_accept(
    server: &Arc<Server>,
    net: usize,
    sockets: &mut SocketSet<'static>,
    handle: SocketHandle,
    conns: &mut HashMap<SocketHandle, ConnState>,
    transient: &mut Vec<SocketHandle>,
    cmd_tx: &mpsc::Sender<ConnCmd>,
) {
    let sock = sockets.get_mut::<tcp::Socket>(handle);
    let (Some(local), Some(remote)) = (sock.local_endpoint(), sock.remote_endpoint()) else {
        sock.abort();
        transient.push(handle);
        return;
    };
    debug!(%local, %remote, "accepted TCP connection");
    let local_ip = endpoint_ipv4(local.addr);
    let remote_ip = endpoint_ipv4(remote.addr);

    if local.port == 123 {
        // Probe sink: greet and hang up.
        let _ = sock.send_slice(PROBE_GREETING);
        sock.close();
        transient.push(handle);
        return;
    }

    if local.port == 8008 && local_ip == FAKE_TEST_AGENT_IP {
        let Some(&node) = server.networks[net].nodes_by_ip.get(&remote_ip) else {
            debug!(%remote_ip, "agent conn from unknown node");
            sock.abort();
            transient.push(handle);
            return;
        };
        let conn = register_conn(handle, conns, cmd_tx);
        server.add_idle_agent_conn(AgentConn { node, conn });
        return;
    }

    let target = if server.derp_ips.contains(&local_ip) {
        Some(format!("{local_ip}:{}", local.port))
    } else if local_ip == FAKE_CONTROL_PLANE_IP {
        Some(format!("controlplane.tailscale.com:{}", local.port))
    } else {
        None
    };

    match target {
        Some(target) => {
            let conn = register_conn(handle, conns, cmd_tx);
            tokio::spawn(bridge(conn, target));
        }
        None => {
            sock.abort();
            transient.push(handle);
        }
    }
}

fn register_conn(
    handle: SocketHandle,
    conns: &mut HashMap<SocketHandle, ConnState>,
    cmd_tx: &mpsc::Sender<ConnCmd>,
) -> StackConn {
    let (to_conn, conn_rx) = mpsc::channel(CONN_CHANNEL_DEPTH);
    conns.insert(
        handle,
        ConnState {
            to_conn: Some(to_conn),
            stalled: None,
            from_conn: Vec::new(),
            write_closed: false,
            abort: false,
            handler_gone: false,
        },
    );
    StackConn::new(handle, conn_rx, cmd_tx.clone())
}

/// Dials the real destination and copies bytes both ways, exiting as soon
/// as either direction finishes; the drop then closes the other side.
async fn bridge(conn: StackConn, target: String) {
    let stream = match tokio::net::TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%target, %err, "bridge dial failed");
            conn.abort().await;
            return;
        }
    };
    let (mut stream_rd, mut stream_wr) = stream.into_split();
    let (mut conn_rd, mut conn_wr) = tokio::io::split(conn);
    tokio::select! {
        _ = tokio::io::copy(&mut conn_rd, &mut stream_wr) => {}
        _ = tokio::io::copy(&mut stream_rd, &mut conn_wr) => {}
    }
}

/// Moves bytes between each socket and its handler, propagating shutdowns
/// in both directions.
fn relay_connections(sockets: &mut SocketSet<'static>, conns: &mut HashMap<SocketHandle, ConnState>) {
    for (&handle, state) in conns.iter_mut() {
        let sock = sockets.get_mut::<tcp::Socket>(handle);

        if state.abort {
            sock.abort();
            continue;
        }

        if let Some(tx) = &state.to_conn {
            if tx.is_closed() {
                state.handler_gone = true;
                state.to_conn = None;
                state.stalled = None;
            }
        }

        // Handler → guest.
        if !state.from_conn.is_empty() && sock.can_send() {
            if let Ok(n) = sock.send_slice(&state.from_conn) {
                state.from_conn.drain(..n);
            }
        }
        if (state.write_closed || state.handler_gone) && state.from_conn.is_empty() {
            sock.close();
        }

        // Guest → handler.
        if let Some(chunk) = state.stalled.take() {
            if let Some(tx) = &state.to_conn {
                match tx.try_send(chunk) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(chunk)) => state.stalled = Some(chunk),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        state.handler_gone = true;
                        state.to_conn = None;
                    }
                }
            }
        }
        while state.stalled.is_none() && sock.can_recv() {
            let Some(tx) = state.to_conn.as_ref() else {
                break;
            };
            let mut chunk = vec![0u8; RECV_CHUNK];
            let n = match sock.recv_slice(&mut chunk) {
                Ok(n) if n > 0 => n,
                _ => break,
            };
            chunk.truncate(n);
            match tx.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(chunk)) => state.stalled = Some(chunk),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    state.handler_gone = true;
                    state.to_conn = None;
                }
            }
        }

        // Guest sent FIN and everything is delivered: EOF to the handler.
        if state.to_conn.is_some()
            && state.stalled.is_none()
            && !sock.may_recv()
            && !sock.can_recv()
        {
            state.to_conn = None;
        }
    }
}

/// Forwards the stack's outbound IPv4 datagrams to the guests that own the
/// destination addresses, wrapped in Ethernet from the router.
async fn flush_device(server: &Arc<Server>, net: usize, device: &mut QueueDevice) {
    let network = &server.networks[net];
    while let Some(datagram) = device.pop_tx() {
        let Some(ip) = Ipv4Packet::new(&datagram) else {
            continue;
        };
        let dst = ip.get_destination();
        let Some(&node) = network.nodes_by_ip.get(&dst) else {
            debug!(%dst, "no MAC for dest IP");
            continue;
        };
        let frame = wire::prepend_ethernet(network.mac, server.nodes[node].mac, &datagram);
        network.links.write_eth(frame).await;
    }
}

fn reap_closed(
    sockets: &mut SocketSet<'static>,
    conns: &mut HashMap<SocketHandle, ConnState>,
    transient: &mut Vec<SocketHandle>,
) {
    let closed: Vec<SocketHandle> = conns
        .keys()
        .copied()
        .chain(transient.iter().copied())
        .filter(|&h| sockets.get::<tcp::Socket>(h).state() == tcp::State::Closed)
        .collect();
    for &handle in &closed {
        trace!(?handle, "reaping closed connection");
        conns.remove(&handle);
        sockets.remove(handle);
    }
    transient.retain(|h| !closed.contains(h));
}
