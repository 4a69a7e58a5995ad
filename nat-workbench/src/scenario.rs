//! Scenario files: the JSON description of networks and nodes that the CLI
//! turns into a [`Config`].

use anyhow::{bail, Context};
use in_memory_internet::{Config, Ipv4Prefix, NatKind, NetworkService};
use serde::Deserialize;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub networks: Vec<NetworkScenario>,
    #[serde(default)]
    pub nodes: Vec<NodeScenario>,
    /// Static relay addresses to bridge, for runs without a catalog command.
    #[serde(default)]
    pub relay_ipv4s: Vec<Ipv4Addr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkScenario {
    pub wan_ip: Ipv4Addr,
    pub lan_prefix: Option<Ipv4Prefix>,
    pub nat: Option<NatKind>,
    #[serde(default)]
    pub services: Vec<NetworkService>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeScenario {
    /// Indices into `networks`; the runtime uses the first.
    pub networks: Vec<usize>,
}

pub fn load(path: &Path) -> anyhow::Result<Scenario> {
    let file = File::open(path).context("unable to open scenario JSON file")?;
    let parsed = serde_json::from_reader(file).context("error parsing scenario JSON")?;
    Ok(parsed)
}

impl Scenario {
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::default();
        let mut handles = Vec::with_capacity(self.networks.len());
        for net in &self.networks {
            let mut spec = in_memory_internet::config::NetworkSpec::new(net.wan_ip);
            if let Some(prefix) = net.lan_prefix {
                spec = spec.lan_prefix(prefix);
            }
            if let Some(nat) = net.nat {
                spec = spec.nat(nat);
            }
            for &service in &net.services {
                spec = spec.service(service);
            }
            handles.push(config.add_network(spec));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let mut nets = Vec::with_capacity(node.networks.len());
            for &idx in &node.networks {
                let Some(&handle) = handles.get(idx) else {
                    bail!("node {i} references network {idx}, but only {} exist", handles.len());
                };
                nets.push(handle);
            }
            config.add_node(&nets);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scenario_parses() {
        let json = r#"{
            "networks": [
                {"wan_ip": "2.0.0.1"},
                {"wan_ip": "2.0.0.2", "lan_prefix": "10.0.0.0/24", "nat": "symmetric", "services": ["nat-pmp"]}
            ],
            "nodes": [
                {"networks": [0]},
                {"networks": [1]}
            ],
            "relay_ipv4s": ["140.1.1.1"]
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.networks.len(), 2);
        assert_eq!(scenario.networks[1].nat, Some(NatKind::Symmetric));
        assert_eq!(scenario.relay_ipv4s, vec![Ipv4Addr::new(140, 1, 1, 1)]);
        scenario.to_config().unwrap();
    }

    #[test]
    fn out_of_range_network_reference_fails() {
        let json = r#"{"networks": [], "nodes": [{"networks": [0]}]}"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert!(scenario.to_config().is_err());
    }
}
