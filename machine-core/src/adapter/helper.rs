//! Helper-container (Darwin) platform adapter: everything the native
//! adapter does via netlink and subprocess is instead piped as a single
//! `sh -lc` script into a privileged Linux sidecar.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use ployz_shared::{config, error::Error};

use crate::{
    adapter::PlatformAdapter,
    docker,
    state::{PeerRecord, State},
};

pub struct HelperAdapter {
    docker: Docker,
}

impl HelperAdapter {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Runs `script` via `sh -lc` inside the sidecar, returning the exec
    /// id alongside combined stdout+stderr. The script is a single
    /// atomic text so `set -eu` semantics hold for the whole invocation.
    async fn exec(&self, helper_name: &str, script: &str) -> Result<(String, String), Error> {
        let exec = self
            .docker
            .create_exec(
                helper_name,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-lc".to_string(), script.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Docker)?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(Error::Docker)?
        {
            let mut buf = String::new();
            while let Some(Ok(chunk)) = output.next().await {
                buf.push_str(&chunk.to_string());
            }
            return Ok((exec.id, buf));
        }
        Ok((exec.id, output))
    }

    async fn run(&self, helper_name: &str, script: &str) -> Result<(), Error> {
        let (exec_id, out) = self.exec(helper_name, &format!("set -eu\n{script}")).await?;
        let details = self.docker.inspect_exec(&exec_id).await.map_err(Error::Docker)?;
        if details.exit_code.unwrap_or(0) != 0 {
            return Err(Error::Other(format!("helper script failed: {out}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for HelperAdapter {
    async fn prepare(&self, state: &State) -> Result<(), Error> {
        let running = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "name".to_string(),
                    vec![state.helper_name.clone()],
                )]),
                ..Default::default()
            }))
            .await
            .map_err(Error::Docker)?;

        let name = state.helper_name.clone();

        match running.first() {
            Some(c) if c.state.as_deref() == Some("running") => Ok(()),
            Some(c) => {
                let id = c.id.as_deref().unwrap_or(&name);
                self.docker
                    .start_container(id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(Error::Docker)
            },
            None => {
                self.docker
                    .create_container(
                        Some(CreateContainerOptions { name: name.clone(), platform: None }),
                        Config {
                            image: Some(state.helper_image.clone()),
                            host_config: Some(HostConfig {
                                network_mode: Some("host".to_string()),
                                privileged: Some(true),
                                cap_add: Some(vec![
                                    "NET_ADMIN".to_string(),
                                    "NET_RAW".to_string(),
                                    "SYS_MODULE".to_string(),
                                ]),
                                restart_policy: Some(bollard::models::RestartPolicy {
                                    name: Some(bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(Error::Docker)?;

                self.docker
                    .start_container(&name, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(Error::Docker)
            },
        }
    }

    async fn configure_wireguard(&self, state: &State, peers: &[PeerRecord]) -> Result<(), Error> {
        let helper = state.helper_name.clone();
        self.run(&helper, &configure_script(state, peers)).await
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
        let helper = state.helper_name.clone();
        self.run(&helper, &format!("ip link del {} 2>/dev/null || true", state.wg_interface))
            .await
    }

    async fn after_stop(&self, state: &State) -> Result<(), Error> {
        let name = state.helper_name.clone();
        match self
            .docker
            .remove_container(&name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(Error::Docker(e)),
        }
    }

    async fn add_ephemeral_peer(&self, state: &State, peer_key: &wireguard_control::Key, host_ip: std::net::Ipv4Addr) -> Result<(), Error> {
        let helper = state.helper_name.clone();
        let script = format!(
            "wg set {iface} peer {key} allowed-ips {host}/32 && ip route replace {host}/32 dev {iface} scope link",
            iface = state.wg_interface,
            key = peer_key.to_base64(),
            host = host_ip,
        );
        self.run(&helper, &script).await
    }

    async fn remove_ephemeral_peer(&self, state: &State, peer_key: &wireguard_control::Key, host_ip: std::net::Ipv4Addr) -> Result<(), Error> {
        let helper = state.helper_name.clone();
        let script = format!(
            "wg set {iface} peer {key} remove; ip route del {host}/32 dev {iface} 2>/dev/null || true",
            iface = state.wg_interface,
            key = peer_key.to_base64(),
            host = host_ip,
        );
        self.run(&helper, &script).await
    }
}

/// Builds the single shell script that brings the sidecar's view of
/// `wgInterface` to the desired address/peer/route set. Observably
/// equivalent to the native adapter: same MTU, same address set, same
/// peer remove-then-add semantics, same route-replace per AllowedIP.
fn configure_script(state: &State, peers: &[PeerRecord]) -> String {
    let iface = &state.wg_interface;
    let mut script = String::new();

    script.push_str(&format!("ip link show {iface} >/dev/null 2>&1 || ip link add {iface} type wireguard\n"));
    script.push_str(&format!(
        "keyfile=$(mktemp); printf '%s' '{}' > \"$keyfile\"; wg set {iface} private-key \"$keyfile\" listen-port {}; rm -f \"$keyfile\"\n",
        state.wg_private.to_base64(),
        state.wg_port,
    ));
    script.push_str(&format!("ip link set {iface} mtu {}\n", config::WIREGUARD_INTERFACE_MTU));

    let desired_keys: Vec<&str> = peers.iter().map(|p| p.public_key.as_str()).collect();
    script.push_str(&format!(
        "for p in $(wg show {iface} peers 2>/dev/null || true); do\n"
    ));
    script.push_str("  keep=0\n");
    for key in &desired_keys {
        script.push_str(&format!("  if [ \"$p\" = \"{key}\" ]; then keep=1; fi\n"));
    }
    script.push_str(&format!("  if [ \"$keep\" = \"0\" ]; then wg set {iface} peer \"$p\" remove; fi\n"));
    script.push_str("done\n");

    for peer in peers {
        let allowed = format!("{},{}/128", peer.subnet, peer.management);
        script.push_str(&format!(
            "wg set {iface} peer {} allowed-ips {allowed} persistent-keepalive {}",
            peer.public_key,
            config::PERSISTENT_KEEPALIVE_INTERVAL_SECS,
        ));
        if let Some(endpoint) = &peer.endpoint {
            script.push_str(&format!(" endpoint {endpoint}"));
        }
        script.push('\n');
    }

    script.push_str(&format!("ip addr replace {}/{} dev {iface} 2>/dev/null || true\n", state.subnet.network(), state.subnet.prefix_len()));
    script.push_str(&format!("ip addr replace {}/128 dev {iface} 2>/dev/null || true\n", state.management));
    script.push_str(&format!("ip link set {iface} up\n"));

    for peer in peers {
        script.push_str(&format!("ip route replace {} dev {iface} scope link\n", peer.subnet));
        script.push_str(&format!("ip route replace {}/128 dev {iface} scope link\n", peer.management));
    }

    script
}
