//! Host-Access Session (C9): a temporary operator-workstation peer, live
//! for the duration of one command invocation.

use std::{net::Ipv4Addr, sync::Arc};

use ipnet::Ipv4Net;
use ployz_shared::error::Error;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, KeyPair};

use crate::{adapter::PlatformAdapter, state::State};

/// Allocates the host-access address: the last usable address in
/// `subnet`, one below the broadcast address.
pub fn host_address(subnet: Ipv4Net) -> Ipv4Addr {
    let broadcast = u32::from(subnet.broadcast());
    Ipv4Addr::from(broadcast - 1)
}

/// A running host-access session. Dropping it does not tear anything
/// down; callers must call `close` explicitly so the best-effort cleanup
/// can be awaited and its errors observed.
pub struct HostAccessSession {
    adapter: Arc<dyn PlatformAdapter>,
    state: State,
    host_ip: Ipv4Addr,
    keypair: KeyPair,
}

impl HostAccessSession {
    /// Runs steps 1-4: allocates the address, generates an ephemeral
    /// keypair, registers it as a peer on the overlay, and brings up a
    /// userspace tunnel on the operator's host.
    pub async fn open(adapter: Arc<dyn PlatformAdapter>, state: State) -> Result<Self, Error> {
        let host_ip = host_address(state.subnet);
        let keypair = KeyPair::generate();

        adapter.add_ephemeral_peer(&state, &keypair.public, host_ip).await?;

        if let Err(e) = bring_up_local_tunnel(&state, &keypair, host_ip).await {
            let _ = adapter.remove_ephemeral_peer(&state, &keypair.public, host_ip).await;
            return Err(e);
        }

        Ok(Self { adapter, state, host_ip, keypair })
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    /// Blocks until `ctrl_c` (or another termination signal) fires, then
    /// tears down. Teardown always runs, even if setup partially failed,
    /// via a context detached from whatever cancelled the wait.
    pub async fn run_until_signal(self) -> Result<(), Error> {
        let _ = tokio::signal::ctrl_c().await;
        self.close().await
    }

    /// Removes the peer and its route, best-effort: both calls are
    /// attempted even if the first fails.
    pub async fn close(self) -> Result<(), Error> {
        take_down_local_tunnel(&self.state);
        self.adapter.remove_ephemeral_peer(&self.state, &self.keypair.public, self.host_ip).await
    }
}

async fn bring_up_local_tunnel(state: &State, keypair: &KeyPair, host_ip: Ipv4Addr) -> Result<(), Error> {
    let iface: InterfaceName = local_interface_name(&state.network)
        .parse()
        .map_err(|e: wireguard_control::InvalidInterfaceName| Error::Other(e.to_string()))?;

    let peer = wireguard_control::PeerConfigBuilder::new(&state.wg_public)
        .replace_allowed_ips()
        .add_allowed_ip(std::net::IpAddr::V4(state.subnet.network()), state.subnet.prefix_len())
        .add_allowed_ip(std::net::IpAddr::V6(state.management), 128);

    let peer = match state.advertise.as_deref().and_then(|e| e.parse().ok()) {
        Some(endpoint) => peer.set_endpoint(endpoint),
        None => peer,
    };

    DeviceUpdate::new()
        .set_private_key(keypair.private.clone())
        .add_peer(peer)
        .apply(&iface, Backend::Userspace)
        .map_err(Error::Io)?;

    assign_local_address(&iface, host_ip).await
}

/// `wg-quick`-style address assignment: wireguard-control only speaks the
/// wg protocol over the userspace socket, so the tun device's own address
/// still goes through `ip addr`.
async fn assign_local_address(iface: &InterfaceName, host_ip: Ipv4Addr) -> Result<(), Error> {
    let resolved = wireguard_control::backends::userspace::resolve_tun(iface).unwrap_or_else(|_| iface.to_string());
    let output = tokio::process::Command::new("ip")
        .args(["addr", "replace", &format!("{host_ip}/32"), "dev", &resolved])
        .output()
        .await
        .map_err(Error::Io)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Other(format!("ip addr replace failed: {}", String::from_utf8_lossy(&output.stderr))))
    }
}

fn take_down_local_tunnel(state: &State) {
    if let Ok(iface) = local_interface_name(&state.network).parse::<InterfaceName>() {
        if let Ok(device) = wireguard_control::Device::get(&iface, Backend::Userspace) {
            let _ = device.delete();
        }
    }
}

fn local_interface_name(network: &str) -> String {
    ployz_shared::config::wg_interface_name(&format!("host-{network}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_address_is_broadcast_minus_one() {
        let subnet: Ipv4Net = "10.210.0.0/24".parse().unwrap();
        assert_eq!(host_address(subnet), "10.210.0.254".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn local_interface_name_is_derived_and_truncated() {
        let name = local_interface_name("an-extremely-long-network-name");
        assert!(name.len() <= 15);
        assert!(name.starts_with("plz-host"));
    }
}
