//! Join Protocol (C8): initiator-driven onboarding of a remote machine
//! identified by `user@host`, entirely over SSH.

use std::time::Duration;

use ipnet::Ipv4Net;
use ployz_shared::{config::NetworkConfig, error::Error, identity};
use wireguard_control::Key;

use crate::{reconciler::Reconciler, registry::RegistryClient, state::State};

const PUBLIC_KEY_POLL_ATTEMPTS: u32 = 10;
const PUBLIC_KEY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REMOTE_RECONCILE_RETRIES: u32 = 20;
const REMOTE_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// What the initiator computes locally before touching the remote host.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub network_cidr: Ipv4Net,
    pub subnet: Ipv4Net,
    pub bootstrap: Vec<String>,
    pub local_wg_key: Key,
    pub local_subnet: Ipv4Net,
    pub local_mgmt_ip: std::net::Ipv6Addr,
}

pub fn plan(state: &State, allocated: &[Ipv4Net]) -> Result<JoinPlan, Error> {
    let subnet = ployz_shared::ipam::allocate_subnet(state.cidr, allocated)?;
    let advertise = state
        .advertise
        .clone()
        .ok_or_else(|| Error::Precondition("local network has no advertise endpoint to bootstrap from".into()))?;

    Ok(JoinPlan {
        network_cidr: state.cidr,
        subnet,
        bootstrap: vec![advertise],
        local_wg_key: state.wg_public.clone(),
        local_subnet: state.subnet,
        local_mgmt_ip: state.management,
    })
}

pub struct JoinSession<'a> {
    registry: &'a RegistryClient,
    reconciler: &'a Reconciler,
    remote: &'a str,
    remote_port: Option<u16>,
}

impl<'a> JoinSession<'a> {
    pub fn new(registry: &'a RegistryClient, reconciler: &'a Reconciler, remote: &'a str, remote_port: Option<u16>) -> Self {
        Self { registry, reconciler, remote, remote_port }
    }

    /// Runs the full onboarding sequence and returns the resulting local
    /// peer count.
    pub async fn run(&self, cfg: &NetworkConfig, plan: &JoinPlan, remote_endpoint: &str) -> Result<usize, Error> {
        self.preflight().await?;
        self.start_remote(cfg, plan).await?;

        let remote_pub = self.fetch_remote_public_key(cfg).await?;
        let remote_mgmt = identity::derive_management_ip(&Key::from_base64(&remote_pub).map_err(Error::InvalidKey)?);

        self.registry.delete_by_endpoint_except_id(remote_endpoint, &remote_pub).await?;
        self.registry
            .upsert_machine(&remote_pub, &remote_pub, plan.subnet, remote_mgmt, Some(remote_endpoint), 0)
            .await?;

        self.reconciler.reconcile(cfg).await?;

        self.bootstrap_remote_wireguard(cfg, plan).await?;
        self.kick_path(remote_mgmt).await;
        self.reconcile_remote_until_converged(cfg).await?;

        self.reconciler.reconcile(cfg).await
    }

    async fn preflight(&self) -> Result<(), Error> {
        let script = "\
            [ \"$(uname -s)\" = Linux ] || { echo 'remote is not Linux' >&2; exit 1; }; \
            for bin in docker ip wg iptables; do \
                command -v \"$bin\" >/dev/null 2>&1 || { echo \"missing $bin\" >&2; exit 1; }; \
            done; \
            docker info >/dev/null 2>&1 || { echo 'docker daemon unreachable' >&2; exit 1; }\
        ";
        self.ssh(script).await.map(|_| ())
    }

    async fn start_remote(&self, cfg: &NetworkConfig, plan: &JoinPlan) -> Result<(), Error> {
        let bootstrap = plan.bootstrap.join(",");
        let advertise = cfg.advertise_endpoint.map(|e| e.to_string()).unwrap_or_default();
        let script = format!(
            "{sudo}ployz machine start --network {network} --cidr {cidr} --subnet {subnet} \
             --advertise {advertise} --bootstrap {bootstrap} --wg-port {wg_port}",
            sudo = sudo_prefix(),
            network = cfg.network,
            cidr = plan.network_cidr,
            subnet = plan.subnet,
            wg_port = cfg.wg_port,
        );
        self.ssh(&script).await.map(|_| ())
    }

    async fn fetch_remote_public_key(&self, cfg: &NetworkConfig) -> Result<String, Error> {
        let script = format!("ployz machine ls --network {} --format public_key", cfg.network);
        for attempt in 0..PUBLIC_KEY_POLL_ATTEMPTS {
            let out = self.ssh(&script).await?;
            if let Some(key) = out.lines().find(|l| !l.trim().is_empty()) {
                return Ok(key.trim().to_string());
            }
            if attempt + 1 < PUBLIC_KEY_POLL_ATTEMPTS {
                tokio::time::sleep(PUBLIC_KEY_POLL_INTERVAL).await;
            }
        }
        Err(Error::Precondition("remote never reported a WireGuard public key".into()))
    }

    async fn bootstrap_remote_wireguard(&self, cfg: &NetworkConfig, plan: &JoinPlan) -> Result<(), Error> {
        let script = format!(
            "wg set plz-{network} peer {key} allowed-ips {subnet},{mgmt}/128 && \
             ip route replace {subnet} dev plz-{network} scope link && \
             ip route replace {mgmt}/128 dev plz-{network} scope link",
            network = cfg.network,
            key = plan.local_wg_key.to_base64(),
            subnet = plan.local_subnet,
            mgmt = plan.local_mgmt_ip,
        );
        self.ssh(&script).await.map(|_| ())
    }

    async fn kick_path(&self, remote_mgmt: std::net::Ipv6Addr) {
        let _ = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "1", &remote_mgmt.to_string()])
            .output()
            .await;
    }

    async fn reconcile_remote_until_converged(&self, cfg: &NetworkConfig) -> Result<(), Error> {
        let script = format!("ployz machine reconcile --network {}", cfg.network);
        let deadline_attempts = REMOTE_RECONCILE_RETRIES;
        for attempt in 0..deadline_attempts {
            match self.ssh(&script).await {
                Ok(out) if out.trim().parse::<u32>().map(|n| n > 1).unwrap_or(false) => return Ok(()),
                _ => {
                    if attempt + 1 < deadline_attempts {
                        tokio::time::sleep(REMOTE_RECONCILE_INTERVAL).await;
                    }
                },
            }
        }
        Err(Error::Precondition("remote CRDT never converged to more than one row".into()))
    }

    async fn ssh(&self, script: &str) -> Result<String, Error> {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args([
            "-o", "BatchMode=yes",
            "-o", "StrictHostKeyChecking=accept-new",
        ]);
        if let Some(port) = self.remote_port {
            cmd.args(["-p", &port.to_string()]);
        }
        cmd.arg(self.remote).arg(script);

        let output = cmd.output().await.map_err(Error::Io)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Ssh {
                host: self.remote.to_string(),
                detail: format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            })
        }
    }
}

fn sudo_prefix() -> &'static str {
    if unsafe { libc::geteuid() } == 0 { "" } else { "sudo " }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_bootstraps_from_local_advertise_endpoint() {
        let keypair = wireguard_control::KeyPair::generate();
        let state = State {
            network: "net1".to_string(),
            cidr: "10.210.0.0/16".parse().unwrap(),
            subnet: "10.210.0.0/24".parse().unwrap(),
            management: identity::derive_management_ip(&keypair.public),
            advertise: Some("203.0.113.9:51000".to_string()),
            wg_interface: "plz-net1".to_string(),
            wg_port: 51000,
            wg_private: keypair.private,
            wg_public: keypair.public,
            docker_network: "ployz-net1".to_string(),
            corrosion_name: "ployz-corrosion-net1".to_string(),
            corrosion_image: "ghcr.io/superfly/corrosion:latest".to_string(),
            helper_name: "ployz-helper-net1".to_string(),
            helper_image: "ployz/helper:latest".to_string(),
            bootstrap: vec![],
            peers: vec![],
            running: true,
        };
        let plan = plan(&state, &[state.subnet]).unwrap();
        assert_eq!(plan.bootstrap, vec!["203.0.113.9:51000".to_string()]);
        assert_eq!(plan.subnet, "10.210.1.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn plan_requires_advertise_endpoint() {
        let keypair = wireguard_control::KeyPair::generate();
        let state = State {
            network: "net1".to_string(),
            cidr: "10.210.0.0/16".parse().unwrap(),
            subnet: "10.210.0.0/24".parse().unwrap(),
            management: identity::derive_management_ip(&keypair.public),
            advertise: None,
            wg_interface: "plz-net1".to_string(),
            wg_port: 51000,
            wg_private: keypair.private,
            wg_public: keypair.public,
            docker_network: "ployz-net1".to_string(),
            corrosion_name: "ployz-corrosion-net1".to_string(),
            corrosion_image: "ghcr.io/superfly/corrosion:latest".to_string(),
            helper_name: "ployz-helper-net1".to_string(),
            helper_image: "ployz/helper:latest".to_string(),
            bootstrap: vec![],
            peers: vec![],
            running: true,
        };
        assert!(plan(&state, &[]).is_err());
    }
}
