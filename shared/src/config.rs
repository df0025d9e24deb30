//! Network configuration: recognized inputs, defaulting, and the names
//! and ports derived from them.

use std::{net::SocketAddr, path::PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_NETWORK_CIDR: &str = "10.210.0.0/16";
pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;
pub const WIREGUARD_INTERFACE_MTU: u32 = 1280;

const WG_PORT_BASE: u16 = 51000;
const WG_PORT_RANGE: u16 = 1000;
const CORROSION_API_PORT_BASE: u16 = 52000;
const CORROSION_API_PORT_RANGE: u16 = 1000;
const CORROSION_GOSSIP_PORT_BASE: u16 = 53000;
const CORROSION_GOSSIP_PORT_RANGE: u16 = 1000;

/// Operator-supplied configuration for one network, before defaulting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfigInput {
    pub network: Option<String>,
    pub data_root: Option<PathBuf>,
    pub network_cidr: Option<String>,
    pub subnet: Option<String>,
    pub wg_port: Option<u16>,
    pub advertise_endpoint: Option<String>,
    pub bootstrap: Vec<String>,
    pub helper_image: Option<String>,
}

/// Fully normalized configuration for one network, with every derived
/// name and port filled in. This is what every other component consumes.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: String,
    pub data_root: PathBuf,
    pub data_dir: PathBuf,
    pub network_cidr: Ipv4Net,
    pub subnet: Option<Ipv4Net>,
    pub wg_interface: String,
    pub wg_port: u16,
    pub advertise_endpoint: Option<SocketAddr>,
    pub bootstrap: Vec<String>,
    pub docker_network: String,
    pub corrosion_name: String,
    pub corrosion_image: String,
    pub corrosion_api_port: u16,
    pub corrosion_gossip_port: u16,
    pub helper_name: String,
    pub helper_image: String,
}

impl NetworkConfigInput {
    /// Fills in defaults and derives every name/port that depends only on
    /// the (possibly partial) input, not on persisted state.
    pub fn normalize(self) -> Result<NetworkConfig, Error> {
        let network = self.network.unwrap_or_else(|| "default".to_string());
        let data_root = self.data_root.unwrap_or_else(|| PathBuf::from("/var/lib/ployz"));
        let data_dir = data_root.join(&network);

        let network_cidr: Ipv4Net = match self.network_cidr {
            Some(cidr) => cidr
                .parse()
                .map_err(|e| Error::InvalidCidr(cidr.clone(), e))?,
            None => DEFAULT_NETWORK_CIDR.parse().expect("default CIDR is valid"),
        };

        let subnet = self
            .subnet
            .map(|s| s.parse().map_err(|e| Error::InvalidCidr(s.clone(), e)))
            .transpose()?;

        let advertise_endpoint = self
            .advertise_endpoint
            .map(|s| s.parse().map_err(|_| Error::InvalidEndpoint(s.clone())))
            .transpose()?;

        let wg_port = self.wg_port.unwrap_or_else(|| derive_port(&network, WG_PORT_BASE, WG_PORT_RANGE));
        let corrosion_api_port = derive_port(&network, CORROSION_API_PORT_BASE, CORROSION_API_PORT_RANGE);
        let corrosion_gossip_port =
            derive_port(&network, CORROSION_GOSSIP_PORT_BASE, CORROSION_GOSSIP_PORT_RANGE);

        let helper_image = self
            .helper_image
            .or_else(|| std::env::var("PLOYZ_ORB_HELPER_IMAGE").ok())
            .unwrap_or_else(|| "ployz/helper:latest".to_string());

        Ok(NetworkConfig {
            wg_interface: wg_interface_name(&network),
            docker_network: format!("ployz-{network}"),
            corrosion_name: format!("ployz-corrosion-{network}"),
            corrosion_image: "ghcr.io/superfly/corrosion:latest".to_string(),
            helper_name: format!("ployz-helper-{network}"),
            network,
            data_root,
            data_dir,
            network_cidr,
            subnet,
            wg_port,
            advertise_endpoint,
            bootstrap: self.bootstrap,
            corrosion_api_port,
            corrosion_gossip_port,
            helper_image,
        })
    }
}

/// `"plz-" + network`, truncated to 15 bytes (the kernel's `IFNAMSIZ - 1`).
pub fn wg_interface_name(network: &str) -> String {
    let full = format!("plz-{network}");
    if full.len() <= 15 {
        full
    } else {
        full[..15].to_string()
    }
}

/// Deterministic FNV-1a hash of `name`, folded into `[base, base+range)`.
fn derive_port(name: &str, base: u16, range: u16) -> u16 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    base + (hash % range as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_network_to_default() {
        let cfg = NetworkConfigInput::default().normalize().unwrap();
        assert_eq!(cfg.network, "default");
        assert_eq!(cfg.network_cidr, DEFAULT_NETWORK_CIDR.parse().unwrap());
        assert_eq!(cfg.wg_interface, "plz-default");
        assert_eq!(cfg.docker_network, "ployz-default");
    }

    #[test]
    fn truncates_long_interface_names() {
        let name = wg_interface_name("an-extremely-long-network-name");
        assert_eq!(name.len(), 15);
        assert!(name.starts_with("plz-"));
    }

    #[test]
    fn port_derivation_is_stable_and_in_range() {
        let a = derive_port("net1", WG_PORT_BASE, WG_PORT_RANGE);
        let b = derive_port("net1", WG_PORT_BASE, WG_PORT_RANGE);
        assert_eq!(a, b);
        assert!((WG_PORT_BASE..WG_PORT_BASE + WG_PORT_RANGE).contains(&a));
    }

    #[test]
    fn wg_and_corrosion_ports_are_disjoint_ranges() {
        assert!(WG_PORT_BASE + WG_PORT_RANGE <= CORROSION_API_PORT_BASE);
        assert!(CORROSION_API_PORT_BASE + CORROSION_API_PORT_RANGE <= CORROSION_GOSSIP_PORT_BASE);
    }

    #[test]
    fn rejects_malformed_cidr() {
        let input = NetworkConfigInput {
            network_cidr: Some("not-a-cidr".to_string()),
            ..Default::default()
        };
        assert!(matches!(input.normalize(), Err(Error::InvalidCidr(..))));
    }
}
