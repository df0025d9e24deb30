//! Platform Adapter (C4): the two implementations of "apply desired
//! WireGuard + routes + iptables + Docker network" to the kernel.

#[cfg(target_os = "linux")]
pub mod native;
#[cfg(not(target_os = "linux"))]
pub mod helper;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ployz_shared::error::Error;
use wireguard_control::Key;

use crate::state::{PeerRecord, State};

/// Capability set shared by both platform implementations. Every method
/// must be idempotent and convergent: repeated calls with the same
/// inputs produce the same observable kernel state.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Readies whatever this platform needs before the rest of the
    /// operations can run (a no-op on native Linux; ensures the helper
    /// sidecar container is pulled, created, and running on Darwin).
    async fn prepare(&self, state: &State) -> Result<(), Error>;

    /// Brings the WireGuard interface to the desired address/peer/route
    /// set. Not safe to call concurrently with itself on the same
    /// network; callers must serialize per network.
    async fn configure_wireguard(&self, state: &State, peers: &[PeerRecord]) -> Result<(), Error>;

    /// Ensures the network's Docker bridge network exists with the
    /// correct IPAM subnet, recreating it if the subnet has drifted.
    async fn ensure_docker_network(&self, state: &State) -> Result<(), Error>;

    /// Removes the network's Docker bridge network, purging any
    /// containers still attached to it.
    async fn cleanup_docker_network(&self, state: &State) -> Result<(), Error>;

    /// Tears down the WireGuard interface and its associated iptables
    /// rules and routes.
    async fn cleanup_wireguard(&self, state: &State) -> Result<(), Error>;

    /// Runs after every other teardown step; on helper-container
    /// platforms this also removes the sidecar.
    async fn after_stop(&self, state: &State) -> Result<(), Error>;

    /// Adds a single ephemeral peer (for a host-access session) without
    /// disturbing the rest of the peer set, plus a matching `/32` route.
    async fn add_ephemeral_peer(&self, state: &State, peer_key: &Key, host_ip: Ipv4Addr) -> Result<(), Error>;

    /// Reverses `add_ephemeral_peer`, best-effort: errors are the
    /// caller's to decide whether to surface.
    async fn remove_ephemeral_peer(&self, state: &State, peer_key: &Key, host_ip: Ipv4Addr) -> Result<(), Error>;
}

#[cfg(target_os = "linux")]
pub fn build(docker: bollard::Docker) -> Box<dyn PlatformAdapter> {
    Box::new(native::NativeAdapter::new(docker))
}

#[cfg(not(target_os = "linux"))]
pub fn build(docker: bollard::Docker) -> Box<dyn PlatformAdapter> {
    Box::new(helper::HelperAdapter::new(docker))
}
