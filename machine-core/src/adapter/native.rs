//! Native (Linux) platform adapter: direct netlink control of the
//! WireGuard interface, its addresses and routes, plus iptables rules
//! shelled out via subprocess.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bollard::Docker;
use ipnet::IpNet;
use netlink_packet_core::{
    NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::{
    address::nlas::Nla as AddressNla,
    constants::{AF_INET, AF_INET6, RTN_UNICAST, RTPROT_BOOT, RT_SCOPE_LINK, RT_TABLE_MAIN},
    link::nlas::Nla as LinkNla,
    route::nlas::Nla as RouteNla,
    AddressMessage, LinkMessage, RouteHeader, RouteMessage, RtnlMessage,
};
use netlink_request::netlink_request_rtnl;
use ployz_shared::{config, error::Error};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::{
    adapter::PlatformAdapter,
    docker,
    state::{PeerRecord, State},
};

pub struct NativeAdapter {
    docker: Docker,
}

impl NativeAdapter {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Short container-ID-derived name of the bridge Docker created for
    /// `docker_network`, e.g. `br-1a2b3c4d5e6f`. `None` if the network
    /// doesn't exist yet (first `start`, before `EnsureDockerNetwork`
    /// has run); the caller skips bridge-dependent rules in that case
    /// and the next reconcile converges them.
    async fn bridge_name(&self, docker_network: &str) -> Result<Option<String>, Error> {
        match self.docker.inspect_network::<String>(docker_network, None).await {
            Ok(net) => {
                let id = net
                    .id
                    .ok_or_else(|| Error::Other(format!("docker network {docker_network} has no id")))?;
                Ok(Some(format!("br-{}", &id[..id.len().min(12)])))
            },
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(Error::Docker(e)),
        }
    }
}

#[async_trait]
impl PlatformAdapter for NativeAdapter {
    async fn prepare(&self, _state: &State) -> Result<(), Error> {
        Ok(())
    }

    async fn configure_wireguard(&self, state: &State, peers: &[PeerRecord]) -> Result<(), Error> {
        let iface = parse_iface(state)?;
        let wg_private = state.wg_private.clone();
        let wg_port = state.wg_port;
        let management = state.management;
        let subnet = state.subnet;
        let desired = peers.to_vec();

        tokio::task::spawn_blocking(move || {
            apply_wireguard(&iface, &wg_private, wg_port, subnet, management, &desired)
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))??;

        let bridge = self.bridge_name(&state.docker_network).await?;
        sync_iptables(state, bridge.as_deref()).await
    }

    async fn ensure_docker_network(&self, state: &State) -> Result<(), Error> {
        docker::ensure_network(
            &self.docker,
            &state.docker_network,
            state.subnet,
            &state.wg_interface,
        )
        .await?;
        Ok(())
    }

    async fn cleanup_docker_network(&self, state: &State) -> Result<(), Error> {
        docker::cleanup_network(&self.docker, &state.docker_network).await
    }

    async fn cleanup_wireguard(&self, state: &State) -> Result<(), Error> {
        let iface = parse_iface(state)?;

        tokio::task::spawn_blocking(move || match Device::get(&iface, Backend::Kernel) {
            Ok(device) => device.delete(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?
        .map_err(Error::Io)
    }

    async fn after_stop(&self, _state: &State) -> Result<(), Error> {
        Ok(())
    }

    async fn add_ephemeral_peer(&self, state: &State, peer_key: &Key, host_ip: std::net::Ipv4Addr) -> Result<(), Error> {
        let iface = parse_iface(state)?;
        let peer_key = peer_key.clone();

        tokio::task::spawn_blocking(move || {
            let builder = PeerConfigBuilder::new(&peer_key)
                .replace_allowed_ips()
                .add_allowed_ip(IpAddr::V4(host_ip), 32);
            DeviceUpdate::new().add_peer(builder).apply(&iface, Backend::Kernel)?;

            let index = link_index(&iface).map_err(to_io)?;
            let route = IpNet::new(IpAddr::V4(host_ip), 32).expect("/32 is always valid");
            new_route(index, route)
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?
        .map_err(Error::Io)
    }

    async fn remove_ephemeral_peer(&self, state: &State, peer_key: &Key, host_ip: std::net::Ipv4Addr) -> Result<(), Error> {
        let iface = parse_iface(state)?;
        let peer_key = peer_key.clone();

        tokio::task::spawn_blocking(move || {
            DeviceUpdate::new().remove_peer_by_key(&peer_key).apply(&iface, Backend::Kernel)?;

            let index = link_index(&iface).map_err(to_io)?;
            let route = IpNet::new(IpAddr::V4(host_ip), 32).expect("/32 is always valid");
            del_route(index, route)
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?
        .map_err(Error::Io)
    }
}

fn parse_iface(state: &State) -> Result<InterfaceName, Error> {
    state
        .wg_interface
        .parse()
        .map_err(|e: wireguard_control::InvalidInterfaceName| Error::Other(e.to_string()))
}

fn to_io(e: Error) -> std::io::Error {
    match e {
        Error::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    }
}

/// Brings the kernel WireGuard interface to the desired peer set,
/// addresses, and routes. Runs on a blocking thread: every call in here
/// is a synchronous netlink round trip.
fn apply_wireguard(
    iface: &InterfaceName,
    private_key: &Key,
    port: u16,
    subnet: ipnet::Ipv4Net,
    management: std::net::Ipv6Addr,
    peers: &[PeerRecord],
) -> Result<(), Error> {
    let current = Device::get(iface, Backend::Kernel).ok();
    let desired_keys = peers
        .iter()
        .map(|p| Key::from_base64(&p.public_key))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::from)?;

    let mut update = DeviceUpdate::new()
        .set_private_key(private_key.clone())
        .set_listen_port(port);

    if let Some(device) = &current {
        for existing in &device.peers {
            if !desired_keys.contains(&existing.config.public_key) {
                update = update.remove_peer_by_key(&existing.config.public_key);
            }
        }
    }

    for (peer, public_key) in peers.iter().zip(&desired_keys) {
        let mut builder = PeerConfigBuilder::new(public_key)
            .replace_allowed_ips()
            .add_allowed_ip(IpAddr::V4(peer.subnet.network()), peer.subnet.prefix_len())
            .add_allowed_ip(IpAddr::V6(peer.management), 128)
            .set_persistent_keepalive_interval(config::PERSISTENT_KEEPALIVE_INTERVAL_SECS);

        if let Some(addr) = peer.endpoint.as_deref().and_then(|e| e.parse::<SocketAddr>().ok()) {
            builder = builder.set_endpoint(addr);
        }
        update = update.add_peer(builder);
    }

    update.apply(iface, Backend::Kernel).map_err(Error::Io)?;
    set_mtu_and_up(iface, config::WIREGUARD_INTERFACE_MTU)?;

    let desired_addrs = vec![
        IpNet::new(IpAddr::V4(subnet.network()), subnet.prefix_len())
            .map_err(|e| Error::Other(e.to_string()))?,
        IpNet::new(IpAddr::V6(management), 128).map_err(|e| Error::Other(e.to_string()))?,
    ];
    sync_addresses(iface, &desired_addrs)?;

    let mut desired_routes = desired_addrs.clone();
    for peer in peers {
        desired_routes.push(
            IpNet::new(IpAddr::V4(peer.subnet.network()), peer.subnet.prefix_len())
                .map_err(|e| Error::Other(e.to_string()))?,
        );
        desired_routes.push(IpNet::new(IpAddr::V6(peer.management), 128).map_err(|e| Error::Other(e.to_string()))?);
    }
    sync_routes(iface, &desired_routes)
}

fn link_index(name: &InterfaceName) -> Result<u32, Error> {
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(Error::Other(format!("no such interface {name}")));
    }
    Ok(index)
}

fn set_mtu_and_up(iface: &InterfaceName, mtu: u32) -> Result<(), Error> {
    let mut link = LinkMessage::default();
    link.header.index = link_index(iface)?;
    link.nlas.push(LinkNla::IfName(iface.as_str_lossy().to_string()));
    link.nlas.push(LinkNla::Mtu(mtu));
    link.header.flags = libc::IFF_UP as u32;
    link.header.change_mask = libc::IFF_UP as u32;

    netlink_request_rtnl(RtnlMessage::SetLink(link), Some(NLM_F_REQUEST | NLM_F_ACK))
        .map(|_| ())
        .map_err(Error::Io)
}

/// Address sync: add anything missing (ignoring EEXIST), remove anything
/// present but undesired (ignoring EADDRNOTAVAIL).
fn sync_addresses(iface: &InterfaceName, desired: &[IpNet]) -> Result<(), Error> {
    let index = link_index(iface)?;
    let existing = dump_addresses(index)?;

    for addr in desired {
        if !existing.contains(addr) {
            if let Err(e) = new_address(index, *addr) {
                if e.raw_os_error() != Some(libc::EEXIST) {
                    return Err(Error::Io(e));
                }
            }
        }
    }
    for addr in &existing {
        if !desired.contains(addr) {
            if let Err(e) = del_address(index, *addr) {
                if e.raw_os_error() != Some(libc::EADDRNOTAVAIL) {
                    return Err(Error::Io(e));
                }
            }
        }
    }
    Ok(())
}

fn dump_addresses(index: u32) -> Result<Vec<IpNet>, Error> {
    let mut msg = AddressMessage::default();
    msg.header.index = index;
    let responses =
        netlink_request_rtnl(RtnlMessage::GetAddress(msg), Some(NLM_F_REQUEST | NLM_F_DUMP))
            .map_err(Error::Io)?;

    let mut out = vec![];
    for response in responses {
        if let NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(addr)) = response.payload {
            if addr.header.index != index {
                continue;
            }
            for nla in &addr.nlas {
                if let AddressNla::Address(bytes) = nla {
                    if let Some(net) = ip_from_bytes(addr.header.family, bytes, addr.header.prefix_len) {
                        out.push(net);
                    }
                }
            }
        }
    }
    Ok(out)
}

fn ip_from_bytes(family: u8, bytes: &[u8], prefix: u8) -> Option<IpNet> {
    match family as i32 {
        AF_INET => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            IpNet::new(IpAddr::from(octets), prefix).ok()
        },
        AF_INET6 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            IpNet::new(IpAddr::from(octets), prefix).ok()
        },
        _ => None,
    }
}

fn new_address(index: u32, net: IpNet) -> Result<(), std::io::Error> {
    netlink_request_rtnl(
        RtnlMessage::NewAddress(build_address_message(index, net)),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL),
    )
    .map(|_| ())
}

fn del_address(index: u32, net: IpNet) -> Result<(), std::io::Error> {
    netlink_request_rtnl(
        RtnlMessage::DelAddress(build_address_message(index, net)),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )
    .map(|_| ())
}

fn build_address_message(index: u32, net: IpNet) -> AddressMessage {
    let mut msg = AddressMessage::default();
    msg.header.index = index;
    msg.header.prefix_len = net.prefix_len();
    msg.header.family = if net.addr().is_ipv4() { AF_INET as u8 } else { AF_INET6 as u8 };
    let bytes = match net.addr() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    msg.nlas.push(AddressNla::Local(bytes.clone()));
    msg.nlas.push(AddressNla::Address(bytes));
    msg
}

/// Route sync, scoped to link-local routes owned by this interface only
/// (the interface's own address prefixes are always in `desired`, so
/// they're never spuriously removed).
fn sync_routes(iface: &InterfaceName, desired: &[IpNet]) -> Result<(), Error> {
    let index = link_index(iface)?;
    let existing = dump_routes(index)?;

    for route in desired {
        if !existing.contains(route) {
            new_route(index, *route).map_err(Error::Io)?;
        }
    }
    for route in &existing {
        if !desired.contains(route) {
            del_route(index, *route).map_err(Error::Io)?;
        }
    }
    Ok(())
}

fn dump_routes(index: u32) -> Result<Vec<IpNet>, Error> {
    let msg = RouteMessage {
        header: RouteHeader { table: RT_TABLE_MAIN, ..Default::default() },
        nlas: vec![],
    };
    let responses =
        netlink_request_rtnl(RtnlMessage::GetRoute(msg), Some(NLM_F_REQUEST | NLM_F_DUMP))
            .map_err(Error::Io)?;

    let mut out = vec![];
    for response in responses {
        if let NetlinkPayload::InnerMessage(RtnlMessage::NewRoute(route)) = response.payload {
            if route.header.scope != RT_SCOPE_LINK {
                continue;
            }
            let oif = route.nlas.iter().find_map(|nla| match nla {
                RouteNla::Oif(i) => Some(*i),
                _ => None,
            });
            if oif != Some(index) {
                continue;
            }
            let dst = route.nlas.iter().find_map(|nla| match nla {
                RouteNla::Destination(bytes) => ip_from_bytes(
                    route.header.address_family,
                    bytes,
                    route.header.destination_prefix_length,
                ),
                _ => None,
            });
            if let Some(net) = dst {
                out.push(net);
            }
        }
    }
    Ok(out)
}

fn new_route(index: u32, net: IpNet) -> Result<(), std::io::Error> {
    netlink_request_rtnl(
        RtnlMessage::NewRoute(build_route_message(index, net)),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | libc::NLM_F_REPLACE as u16),
    )
    .map(|_| ())
}

fn del_route(index: u32, net: IpNet) -> Result<(), std::io::Error> {
    netlink_request_rtnl(
        RtnlMessage::DelRoute(build_route_message(index, net)),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )
    .map(|_| ())
}

fn build_route_message(index: u32, net: IpNet) -> RouteMessage {
    let mut msg = RouteMessage {
        header: RouteHeader {
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_LINK,
            kind: RTN_UNICAST,
            address_family: if net.addr().is_ipv4() { AF_INET as u8 } else { AF_INET6 as u8 },
            destination_prefix_length: net.prefix_len(),
            ..Default::default()
        },
        nlas: vec![],
    };
    let bytes = match net.addr() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    msg.nlas.push(RouteNla::Destination(bytes));
    msg.nlas.push(RouteNla::Oif(index));
    msg
}

async fn sync_iptables(state: &State, bridge: Option<&str>) -> Result<(), Error> {
    if let Some(bridge) = bridge {
        insert_if_missing(
            "iptables",
            &["-C", "DOCKER-USER", "-i", &state.wg_interface, "-o", bridge, "-j", "ACCEPT"],
            &["-I", "DOCKER-USER", "-i", &state.wg_interface, "-o", bridge, "-j", "ACCEPT"],
        )
        .await?;
    }

    let subnet = state.subnet.to_string();
    // Delete-before-insert: the rule is idempotent on the observable
    // ruleset but `iptables -I` would otherwise duplicate it every call.
    let _ = run(
        "iptables",
        &["-t", "nat", "-D", "POSTROUTING", "-s", &subnet, "-o", &state.wg_interface, "-j", "RETURN"],
    )
    .await;
    run(
        "iptables",
        &["-t", "nat", "-I", "POSTROUTING", "-s", &subnet, "-o", &state.wg_interface, "-j", "RETURN"],
    )
    .await
}

async fn insert_if_missing(bin: &str, check: &[&str], insert: &[&str]) -> Result<(), Error> {
    if run(bin, check).await.is_err() {
        run(bin, insert).await?;
    }
    Ok(())
}

async fn run(bin: &str, args: &[&str]) -> Result<(), Error> {
    let output = tokio::process::Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(Error::Io)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "{bin} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}
