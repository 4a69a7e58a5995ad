//! The process-wide root of the simulation: owns every network and node,
//! switches UDP between networks on the synthetic WAN, answers STUN
//! in-process and talks HTTP to in-guest test agents.

use crate::agent::{AgentConn, AgentRegistry};
use crate::config::{network_mac, node_mac, Config, ConfigError, NetworkHandle, NodeHandle};
use crate::mac::Mac;
use crate::nat::NatKind;
use crate::network::Network;
use crate::stack;
use crate::wire::{dhcp, stun};
use crate::{UdpPacket, FAKE_CONTROL_PLANE_IP, FAKE_DNS_IP, FAKE_TEST_AGENT_IP, STUN_PORT};
use anyhow::Context as _;
use hyper::client::conn::SendRequest;
use hyper::Body;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A runtime node: one guest NIC on one network.
pub(crate) struct Node {
    pub(crate) mac: Mac,
    pub(crate) lan_ip: Ipv4Addr,
    pub(crate) net: usize,
}

pub struct Server {
    shutdown: CancellationToken,
    pub(crate) networks: Vec<Network>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) network_by_wan: HashMap<Ipv4Addr, usize>,
    pub(crate) node_by_mac: HashMap<Mac, usize>,
    /// Relay addresses whose TCP traffic is bridged to the host network.
    /// Populated before serving, read-only afterwards.
    pub(crate) derp_ips: HashSet<Ipv4Addr>,
    pub(crate) agents: AgentRegistry,
    /// Cached HTTP connections to in-guest agents, one per node.
    agent_http: Mutex<HashMap<usize, SendRequest<Body>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Materializes the runtime state from `config`, spawns each network's
    /// TCP/IP stack, and starts serving. `relay_ips` are the real-world
    /// relay addresses to bridge when intercepted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, relay_ips: Vec<Ipv4Addr>) -> Result<Arc<Server>, ConfigError> {
        let mut networks = Vec::with_capacity(config.networks.len());
        let mut network_by_wan = HashMap::new();
        let mut inject_rxs = Vec::with_capacity(config.networks.len());

        for (i, spec) in config.networks.iter().enumerate() {
            if network_by_wan.insert(spec.wan_ip, i).is_some() {
                return Err(ConfigError::DuplicateWanIp(spec.wan_ip));
            }
            let (inject_tx, inject_rx) = mpsc::channel(stack::INJECT_QUEUE_DEPTH);
            networks.push(Network::new(
                i,
                network_mac(i),
                spec.wan_ip,
                spec.lan_prefix,
                spec.services.contains(&crate::config::NetworkService::NatPmp),
                spec.nat,
                inject_tx,
            ));
            inject_rxs.push(inject_rx);
        }

        let mut nodes = Vec::with_capacity(config.nodes.len());
        let mut node_by_mac = HashMap::new();
        for (i, spec) in config.nodes.iter().enumerate() {
            let mac = node_mac(i);
            if node_by_mac.insert(mac, i).is_some() {
                return Err(ConfigError::DuplicateMac(mac));
            }
            let Some(&net) = spec.networks.first() else {
                return Err(ConfigError::NodeWithoutNetwork(i));
            };
            let lan_ip = networks[net].lan_prefix.node_ip(mac.low_byte());
            networks[net].nodes_by_ip.insert(lan_ip, i);
            nodes.push(Node { mac, lan_ip, net });
        }

        let server = Arc::new(Server {
            shutdown: CancellationToken::new(),
            networks,
            nodes,
            network_by_wan,
            node_by_mac,
            derp_ips: relay_ips.into_iter().collect(),
            agents: AgentRegistry::default(),
            agent_http: Mutex::new(HashMap::new()),
        });

        for (i, inject_rx) in inject_rxs.into_iter().enumerate() {
            tokio::spawn(stack::run(server.clone(), i, inject_rx));
        }

        Ok(server)
    }

    /// Cancels everything: stack pumps, transport readers, pending agent
    /// waits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The nodes of the simulation, in configuration order.
    pub fn node_handles(&self) -> Vec<NodeHandle> {
        (0..self.nodes.len()).map(NodeHandle).collect()
    }

    /// Replaces a network's NAT table at runtime.
    pub fn set_nat(&self, network: NetworkHandle, kind: NatKind) {
        self.networks[network.0].set_nat(kind);
    }

    pub fn nat_style(&self, network: NetworkHandle) -> NatKind {
        self.networks[network.0].nat_style()
    }

    /// Routes a UDP packet across the synthetic WAN by destination IP.
    /// STUN is answered in-process: the reply re-enters here so it is
    /// switched like any other packet.
    pub(crate) async fn route_udp_packet(&self, p: UdpPacket) {
        let mut p = p;
        while p.dst.port() == STUN_PORT {
            match stun::parse_binding_request(&p.payload) {
                Some(txid) => {
                    p = UdpPacket {
                        src: p.dst,
                        dst: p.src,
                        payload: stun::response(txid, p.src),
                    };
                }
                None => {
                    debug!(src = %p.src, "invalid STUN request");
                    return;
                }
            }
        }

        let Some(&net) = self.network_by_wan.get(p.dst.ip()) else {
            debug!(dst = %p.dst, "no network to route UDP packet");
            return;
        };
        self.networks[net].handle_udp_packet(self, p).await;
    }

    /// The address a DNS A query for `qname` resolves to, if the fake
    /// resolver knows the name.
    pub(crate) fn ipv4_for_dns(&self, qname: &str) -> Option<Ipv4Addr> {
        match qname {
            "dns" => Some(FAKE_DNS_IP),
            "test-driver.tailscale" => Some(FAKE_TEST_AGENT_IP),
            "controlplane.tailscale.com" => Some(FAKE_CONTROL_PLANE_IP),
            _ => None,
        }
    }

    /// Whether a TCP flow to `(dst_ip, dst_port)` should be terminated on
    /// the in-process stack instead of dropped.
    pub(crate) fn should_intercept_tcp(&self, dst_ip: Ipv4Addr, dst_port: u16) -> bool {
        if dst_port == 123 {
            return true;
        }
        if (dst_port == 80 || dst_port == 443)
            && (dst_ip == FAKE_CONTROL_PLANE_IP || self.derp_ips.contains(&dst_ip))
        {
            return true;
        }
        dst_port == 8008 && dst_ip == FAKE_TEST_AGENT_IP
    }

    /// Builds the reply to a DHCP request from the guest with `src_mac`:
    /// Discover gets an Offer, Request gets an Ack carrying the full lease.
    pub(crate) fn create_dhcp_response(
        &self,
        net: &Network,
        src_mac: Mac,
        ip_src: Ipv4Addr,
        ip_dst: Ipv4Addr,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let msg = dhcp::Message::parse(payload)?;
        if msg.op != 1 {
            return None;
        }
        let Some(&node) = self.node_by_mac.get(&src_mac) else {
            debug!(%src_mac, "DHCP request from unknown node; ignoring");
            return None;
        };
        let gw_ip = net.router_ip();

        let (reply_type, lease) = match msg.message_type {
            dhcp::MessageType::Discover => (dhcp::MessageType::Offer, None),
            dhcp::MessageType::Request => (
                dhcp::MessageType::Ack,
                Some(dhcp::LeaseOptions {
                    lease_secs: 3600,
                    router: gw_ip,
                    dns: FAKE_DNS_IP,
                    subnet_mask: net.lan_prefix.mask(),
                }),
            ),
            _ => return None,
        };

        let reply = dhcp::build_reply(&msg, reply_type, self.nodes[node].lan_ip, gw_ip, lease);
        // The IP layer mirrors the request: replies to 0.0.0.0 senders go
        // out with their broadcast destination as the source.
        Some(crate::wire::build_udp_frame(
            net.mac,
            src_mac,
            std::net::SocketAddrV4::new(ip_dst, 67),
            std::net::SocketAddrV4::new(ip_src, 68),
            &reply,
        ))
    }

    /// Takes the next idle agent connection for `node`, waiting for one to
    /// arrive. Returns `None` when `cancel` fires first.
    pub async fn take_agent_conn(
        &self,
        cancel: &CancellationToken,
        node: NodeHandle,
    ) -> Option<crate::stack::StackConn> {
        self.agents.take(cancel, node.0).await.map(|ac| ac.conn)
    }

    pub(crate) fn add_idle_agent_conn(&self, ac: AgentConn) {
        self.agents.add_idle(ac);
    }

    /// Fetches `GET /status` from the in-guest agent on `node` over a
    /// terminated agent connection, reusing a cached connection when the
    /// agent keeps it alive.
    pub async fn node_status(&self, node: NodeHandle) -> anyhow::Result<Vec<u8>> {
        for fresh in [false, true] {
            let mut send_request = match self.cached_agent_conn(node, fresh).await? {
                Some(sr) => sr,
                None => continue,
            };

            let req = hyper::Request::get("/status")
                .header(hyper::header::HOST, "node")
                .body(Body::empty())
                .expect("static request");
            let res = match send_request.send_request(req).await {
                Ok(res) => res,
                // A cached connection may have died since we last used it;
                // retry once on a fresh one.
                Err(err) if !fresh => {
                    debug!(node = node.0, %err, "cached agent conn failed");
                    continue;
                }
                Err(err) => return Err(err).context("agent request"),
            };

            let status = res.status();
            let body = hyper::body::to_bytes(res.into_body())
                .await
                .context("reading agent response")?;
            if status != hyper::StatusCode::OK {
                anyhow::bail!("agent status: {status}, {}", String::from_utf8_lossy(&body));
            }
            self.agent_http.lock().await.insert(node.0, send_request);
            return Ok(body.to_vec());
        }
        anyhow::bail!("agent connection wait canceled")
    }

    /// Returns a cached HTTP connection to `node`'s agent, or dials a new
    /// one over the next queued agent connection. `force_fresh` skips the
    /// cache.
    async fn cached_agent_conn(
        &self,
        node: NodeHandle,
        force_fresh: bool,
    ) -> anyhow::Result<Option<SendRequest<Body>>> {
        if !force_fresh {
            if let Some(sr) = self.agent_http.lock().await.remove(&node.0) {
                return Ok(Some(sr));
            }
        }
        let Some(ac) = self.agents.take(&self.shutdown, node.0).await else {
            return Ok(None);
        };
        let (send_request, conn) = hyper::client::conn::handshake(ac.conn)
            .await
            .context("agent HTTP handshake")?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        Ok(Some(send_request))
    }

    /// Writes the one-line-per-node startup banner.
    pub fn write_starting_banner(&self, mut w: impl io::Write) -> io::Result<()> {
        writeln!(w, "in-memory internet serving clients:")?;
        for node in &self.nodes {
            let net = &self.networks[node.net];
            writeln!(
                w,
                "  {} {:>15} ({}, {})",
                node.mac,
                node.lan_ip,
                net.wan_ip,
                net.nat_style()
            )?;
        }
        Ok(())
    }
}
