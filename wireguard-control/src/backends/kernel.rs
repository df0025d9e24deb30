use crate::{
    device::{AllowedIp, PeerConfig},
    Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder, PeerInfo, PeerStats,
};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_generic::GenlMessage;
use netlink_packet_route::{
    link::{self, nlas::{Info, InfoKind}},
    LinkMessage, RtnlMessage,
};
use netlink_packet_wireguard::{
    nlas::{WgAllowedIpAttrs, WgDeviceAttrs, WgPeerAttrs},
    Wireguard, WireguardCmd,
};
use netlink_request::{netlink_request_genl, netlink_request_rtnl};
use std::{convert::TryFrom, io, net::IpAddr};

macro_rules! get_nla_value {
    ($nlas:expr, $e:ident, $v:ident) => {
        $nlas.iter().find_map(|attr| match attr {
            $e::$v(value) => Some(value),
            _ => None,
        })
    };
}

impl TryFrom<Vec<WgAllowedIpAttrs>> for AllowedIp {
    type Error = io::Error;

    fn try_from(attrs: Vec<WgAllowedIpAttrs>) -> Result<Self, Self::Error> {
        let address = *get_nla_value!(attrs, WgAllowedIpAttrs, IpAddr)
            .ok_or(io::ErrorKind::NotFound)?;
        let cidr = *get_nla_value!(attrs, WgAllowedIpAttrs, Cidr).ok_or(io::ErrorKind::NotFound)?;
        Ok(AllowedIp { address, cidr })
    }
}

fn peer_info_from_attrs(attrs: Vec<WgPeerAttrs>) -> Result<PeerInfo, io::Error> {
    let public_key = get_nla_value!(attrs, WgPeerAttrs, PublicKey)
        .map(|key| Key(*key))
        .ok_or(io::ErrorKind::NotFound)?;
    let preshared_key = get_nla_value!(attrs, WgPeerAttrs, PresharedKey).map(|key| Key(*key));
    let endpoint = get_nla_value!(attrs, WgPeerAttrs, Endpoint).cloned();
    let persistent_keepalive_interval =
        get_nla_value!(attrs, WgPeerAttrs, PersistentKeepalive).cloned();
    let allowed_ips = get_nla_value!(attrs, WgPeerAttrs, AllowedIps)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(AllowedIp::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let last_handshake_time = get_nla_value!(attrs, WgPeerAttrs, LastHandshake).cloned();
    let rx_bytes = get_nla_value!(attrs, WgPeerAttrs, RxBytes).copied().unwrap_or_default();
    let tx_bytes = get_nla_value!(attrs, WgPeerAttrs, TxBytes).copied().unwrap_or_default();

    Ok(PeerInfo {
        config: PeerConfig {
            public_key,
            preshared_key,
            endpoint,
            persistent_keepalive_interval,
            allowed_ips,
            __cant_construct_me: (),
        },
        stats: PeerStats {
            last_handshake_time,
            rx_bytes,
            tx_bytes,
        },
    })
}

fn device_from_wireguard(wg: &Wireguard) -> Result<Device, io::Error> {
    let name = get_nla_value!(wg.nlas, WgDeviceAttrs, IfName)
        .ok_or(io::ErrorKind::NotFound)?
        .parse()?;
    let public_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PublicKey).map(|key| Key(*key));
    let private_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PrivateKey).map(|key| Key(*key));
    let listen_port = get_nla_value!(wg.nlas, WgDeviceAttrs, ListenPort).copied();
    let fwmark = get_nla_value!(wg.nlas, WgDeviceAttrs, Fwmark).copied();
    let peers = get_nla_value!(wg.nlas, WgDeviceAttrs, Peers)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(peer_info_from_attrs)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Device {
        name,
        public_key,
        private_key,
        fwmark,
        listen_port,
        peers,
        linked_name: None,
        backend: Backend::Kernel,
        __cant_construct_me: (),
    })
}

fn peer_nlas(peer: &PeerConfigBuilder) -> WgPeerAttrs {
    let mut flags = Vec::new();
    if peer.remove_me {
        flags.push(netlink_packet_wireguard::constants::WGPEER_F_REMOVE_ME);
    }
    if peer.replace_allowed_ips {
        flags.push(netlink_packet_wireguard::constants::WGPEER_F_REPLACE_ALLOWEDIPS);
    }
    WgPeerAttrs::Flags(flags.into_iter().fold(0, |acc, f| acc | f))
}

fn encode_peer(peer: &PeerConfigBuilder) -> Vec<WgPeerAttrs> {
    let mut nlas = vec![WgPeerAttrs::PublicKey(peer.public_key.0), peer_nlas(peer)];

    if let Some(psk) = &peer.preshared_key {
        nlas.push(WgPeerAttrs::PresharedKey(psk.0));
    }
    if let Some(endpoint) = peer.endpoint {
        nlas.push(WgPeerAttrs::Endpoint(endpoint));
    }
    if let Some(interval) = peer.persistent_keepalive_interval {
        nlas.push(WgPeerAttrs::PersistentKeepaliveInterval(interval));
    }
    if !peer.allowed_ips.is_empty() {
        let ips = peer
            .allowed_ips
            .iter()
            .map(|ip| {
                netlink_packet_wireguard::nlas::WgAllowedIp(vec![
                    WgAllowedIpAttrs::Family(if ip.address.is_ipv4() { 2 } else { 10 }),
                    WgAllowedIpAttrs::IpAddr(ip.address),
                    WgAllowedIpAttrs::Cidr(ip.cidr),
                ])
            })
            .collect();
        nlas.push(WgPeerAttrs::AllowedIps(ips));
    }
    nlas
}

/// Ensure a link of kind `wireguard` exists with the given name, creating it if missing.
pub fn ensure_link(name: &InterfaceName) -> io::Result<()> {
    if get_by_name(name).is_ok() {
        return Ok(());
    }

    let mut link = LinkMessage::default();
    link.nlas.push(link::nlas::Nla::IfName(name.as_str_lossy().to_string()));
    link.nlas.push(link::nlas::Nla::Info(vec![Info::Kind(InfoKind::Wireguard)]));

    netlink_request_rtnl(
        RtnlMessage::NewLink(link),
        Some(NLM_F_REQUEST | NLM_F_ACK | libc::NLM_F_CREATE as u16 | libc::NLM_F_EXCL as u16),
    )
    .map(|_| ())
    .map_err(|e| {
        if e.raw_os_error() == Some(libc::EEXIST) {
            io::Error::new(io::ErrorKind::Other, "")
        } else {
            e
        }
    })
    .or_else(|e| if e.to_string().is_empty() { Ok(()) } else { Err(e) })
}

pub fn enumerate() -> Result<Vec<InterfaceName>, io::Error> {
    let link_responses =
        netlink_request_rtnl(RtnlMessage::GetLink(LinkMessage::default()), Some(NLM_F_DUMP | NLM_F_REQUEST))?;

    let links = link_responses
        .into_iter()
        .filter_map(|response| match response.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => Some(link),
            _ => None,
        })
        .filter(|link| {
            link.nlas.iter().any(|nla| match nla {
                link::nlas::Nla::Info(infos) => {
                    infos.iter().any(|info| info == &Info::Kind(InfoKind::Wireguard))
                },
                _ => false,
            })
        })
        .filter_map(|link| {
            link.nlas.iter().find_map(|nla| match nla {
                link::nlas::Nla::IfName(name) => name.parse().ok(),
                _ => None,
            })
        })
        .collect();

    Ok(links)
}

pub fn get_by_name(name: &InterfaceName) -> Result<Device, io::Error> {
    let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
        cmd: WireguardCmd::GetDevice,
        nlas: vec![WgDeviceAttrs::IfName(name.as_str_lossy().to_string())],
    });
    let responses = netlink_request_genl(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK))?;

    match responses.into_iter().next() {
        Some(NetlinkMessage {
            payload: NetlinkPayload::InnerMessage(message),
            ..
        }) => device_from_wireguard(&message.payload),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "no device in netlink response")),
    }
}

/// Apply a [`DeviceUpdate`] to the kernel WireGuard interface, creating it first if missing.
pub fn apply(builder: &DeviceUpdate, iface: &InterfaceName) -> io::Result<()> {
    ensure_link(iface)?;

    let mut nlas = vec![WgDeviceAttrs::IfName(iface.as_str_lossy().to_string())];
    if let Some(key) = &builder.private_key {
        nlas.push(WgDeviceAttrs::PrivateKey(key.0));
    }
    if let Some(port) = builder.listen_port {
        nlas.push(WgDeviceAttrs::ListenPort(port));
    }
    if let Some(fwmark) = builder.fwmark {
        nlas.push(WgDeviceAttrs::Fwmark(fwmark));
    }
    if builder.replace_peers {
        nlas.push(WgDeviceAttrs::Flags(
            netlink_packet_wireguard::constants::WGDEVICE_F_REPLACE_PEERS,
        ));
    }
    if !builder.peers.is_empty() {
        let peers = builder.peers.iter().map(|p| netlink_packet_wireguard::nlas::WgPeer(encode_peer(p))).collect();
        nlas.push(WgDeviceAttrs::Peers(peers));
    }

    let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
        cmd: WireguardCmd::SetDevice,
        nlas,
    });
    netlink_request_genl(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK)).map(|_| ())
}

pub fn delete_interface(iface: &InterfaceName) -> io::Result<()> {
    let mut link = LinkMessage::default();
    link.nlas.push(link::nlas::Nla::IfName(iface.as_str_lossy().to_string()));
    netlink_request_rtnl(RtnlMessage::DelLink(link), Some(NLM_F_REQUEST | NLM_F_ACK)).map(|_| ())
}
