//! Relay catalog population: runs an external command that prints the relay
//! map as JSON and collects every node's IPv4 address.

use anyhow::{bail, Context};
use in_memory_internet::RelayCatalog;
use std::net::Ipv4Addr;

/// A [`RelayCatalog`] backed by a subprocess, e.g.
/// `tailscale debug derp-map`.
pub struct RelayMapCommand {
    command: String,
}

impl RelayMapCommand {
    pub fn new(command: impl Into<String>) -> RelayMapCommand {
        RelayMapCommand {
            command: command.into(),
        }
    }
}

impl RelayCatalog for RelayMapCommand {
    fn list_relay_ipv4s(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("empty relay catalog command")?;
        let output = std::process::Command::new(program)
            .args(parts)
            .output()
            .with_context(|| format!("running {:?}", self.command))?;
        if !output.status.success() {
            bail!(
                "{:?} failed ({}): {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        parse_relay_map(&output.stdout)
    }
}

/// Pulls `Regions.*.Nodes[].IPv4` out of a relay map document. Nodes
/// without an IPv4 address are skipped.
fn parse_relay_map(json: &[u8]) -> anyhow::Result<Vec<Ipv4Addr>> {
    let doc: serde_json::Value = serde_json::from_slice(json).context("parsing relay map JSON")?;
    let mut ips = Vec::new();
    let Some(regions) = doc.get("Regions").and_then(|r| r.as_object()) else {
        return Ok(ips);
    };
    for region in regions.values() {
        let Some(nodes) = region.get("Nodes").and_then(|n| n.as_array()) else {
            continue;
        };
        for node in nodes {
            let Some(ip) = node.get("IPv4").and_then(|ip| ip.as_str()) else {
                continue;
            };
            if let Ok(ip) = ip.parse() {
                ips.push(ip);
            }
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ipv4s_from_relay_map() {
        let json = br#"{
            "Regions": {
                "1": {"Nodes": [{"Name": "1a", "IPv4": "140.1.1.1"}, {"Name": "1b", "IPv4": "140.1.1.2"}]},
                "2": {"Nodes": [{"Name": "2a"}]},
                "3": {}
            }
        }"#;
        let ips = parse_relay_map(json).unwrap();
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&Ipv4Addr::new(140, 1, 1, 1)));
        assert!(ips.contains(&Ipv4Addr::new(140, 1, 1, 2)));
    }

    #[test]
    fn empty_or_alien_documents_yield_no_ips() {
        assert!(parse_relay_map(b"{}").unwrap().is_empty());
        assert!(parse_relay_map(b"{\"Regions\": 3}").unwrap().is_empty());
        assert!(parse_relay_map(b"not json").is_err());
    }
}
