//! Runtime Orchestrator (C6): `Start`, `Stop`, and `Status` for one
//! network, composed from the local state store, the platform adapter,
//! and the CRDT supervisor.

use std::{collections::HashMap, sync::Arc};

use bollard::Docker;
use ployz_shared::{config::NetworkConfig, error::Error, ipam};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    adapter::{self, PlatformAdapter},
    registry::{MachineRow, RegistryClient},
    state::{PeerRecord, State, StateStore},
    supervisor,
};

pub struct Orchestrator {
    store: Arc<StateStore>,
    adapter: Box<dyn PlatformAdapter>,
    docker: Docker,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Independent probes of one network's resources. Never mutates anything.
#[derive(Debug, Clone)]
pub struct Status {
    pub state_present: bool,
    pub interface_present: bool,
    pub docker_network_present: bool,
    pub crdt_running: bool,
}

impl Orchestrator {
    pub fn new(store: Arc<StateStore>, docker: Docker) -> Self {
        Self { adapter: adapter::build(docker.clone()), store, docker, locks: std::sync::Mutex::new(HashMap::new()) }
    }

    pub async fn start(&self, cfg: &NetworkConfig) -> Result<State, Error> {
        self.check_no_cidr_overlap(cfg)?;

        let (mut state, created) = self.store.ensure_state(cfg)?;
        if !created {
            enforce_first_write_wins(cfg, &state)?;
            merge_updatable_fields(cfg, &mut state);
        }

        self.adapter.prepare(&state).await?;

        let lock = self.network_lock(&state.network);
        {
            let _guard = lock.lock().await;
            self.adapter.configure_wireguard(&state, &state.peers).await?;
        }

        supervisor::render_config(&cfg.data_dir, &state, cfg.corrosion_gossip_port, cfg.corrosion_api_port)?;
        supervisor::start(&self.docker, &cfg.data_dir, &state).await?;
        self.adapter.ensure_docker_network(&state).await?;

        self.register_self_and_apply_peers(cfg, &mut state).await?;

        state.running = true;
        self.store.save_state(&state)?;
        Ok(state)
    }

    /// Upserts this machine's row into the registry and applies the
    /// resulting peer set, so a successful `start` is immediately visible
    /// to other machines and already converged to the current peer list
    /// rather than waiting for a separate `reconcile`.
    async fn register_self_and_apply_peers(&self, cfg: &NetworkConfig, state: &mut State) -> Result<(), Error> {
        let registry = RegistryClient::new(format!("http://127.0.0.1:{}", cfg.corrosion_api_port), None);
        registry.ensure_tables().await?;
        registry.ensure_network_cidr(Some(state.cidr), None, state.cidr).await?;
        registry
            .upsert_machine(
                &state.wg_public.to_base64(),
                &state.wg_public.to_base64(),
                state.subnet,
                state.management,
                state.advertise.as_deref(),
                0,
            )
            .await?;

        state.peers = peers_from_registry(&registry, state).await?;
        self.adapter.configure_wireguard(state, &state.peers).await
    }

    pub async fn stop(&self, cfg: &NetworkConfig, purge: bool) -> Result<(), Error> {
        let Some(state) = self.store.load_state(&cfg.network)? else {
            return Ok(());
        };

        self.adapter.prepare(&state).await?;

        self.adapter.cleanup_docker_network(&state).await?;
        supervisor::stop(&self.docker, &state).await?;
        self.adapter.cleanup_wireguard(&state).await?;
        self.adapter.after_stop(&state).await?;

        if purge {
            self.store.delete_state(&cfg.network)?;
            if cfg.data_dir.exists() {
                std::fs::remove_dir_all(&cfg.data_dir)?;
            }
        } else {
            let mut state = state;
            state.running = false;
            self.store.save_state(&state)?;
        }
        Ok(())
    }

    pub async fn status(&self, network: &str) -> Result<Status, Error> {
        let state = self.store.load_state(network)?;
        let state_present = state.is_some();

        let interface_present = state
            .as_ref()
            .map(|s| interface_exists(&s.wg_interface))
            .unwrap_or(false);

        let docker_network_present = match &state {
            Some(s) => self.docker.inspect_network::<String>(&s.docker_network, None).await.is_ok(),
            None => false,
        };

        let crdt_running = match &state {
            Some(s) => self
                .docker
                .inspect_container(&s.corrosion_name, None)
                .await
                .ok()
                .and_then(|c| c.state)
                .and_then(|st| st.running)
                .unwrap_or(false),
            None => false,
        };

        Ok(Status { state_present, interface_present, docker_network_present, crdt_running })
    }

    fn check_no_cidr_overlap(&self, cfg: &NetworkConfig) -> Result<(), Error> {
        for (other_network, other_cidr) in self.store.other_cidrs(&cfg.network)? {
            if ipam::overlaps(&cfg.network_cidr, &other_cidr) {
                return Err(Error::CidrOverlap {
                    new: cfg.network.clone(),
                    new_cidr: cfg.network_cidr.to_string(),
                    existing: other_network,
                });
            }
        }
        Ok(())
    }

    fn network_lock(&self, network: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("orchestrator lock table poisoned");
        locks.entry(network.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

fn enforce_first_write_wins(cfg: &NetworkConfig, state: &State) -> Result<(), Error> {
    if cfg.network_cidr != state.cidr {
        return Err(Error::AlreadyInitialized {
            network: cfg.network.clone(),
            field: "networkCIDR",
            existing: state.cidr.to_string(),
        });
    }
    if let Some(subnet) = cfg.subnet {
        if subnet != state.subnet {
            return Err(Error::AlreadyInitialized {
                network: cfg.network.clone(),
                field: "subnet",
                existing: state.subnet.to_string(),
            });
        }
    }
    Ok(())
}

async fn peers_from_registry(registry: &RegistryClient, state: &State) -> Result<Vec<PeerRecord>, Error> {
    let rows = registry.list_machines().await?;
    let self_id = state.wg_public.to_base64();

    Ok(rows
        .into_iter()
        .filter(|row| row.public_key != self_id)
        .map(|row| {
            let management = ployz_shared::identity::derive_management_ip(&row_public_key(&row));
            PeerRecord { public_key: row.public_key, subnet: row.subnet, management, endpoint: row.endpoint }
        })
        .collect())
}

fn row_public_key(row: &MachineRow) -> wireguard_control::Key {
    wireguard_control::Key::from_base64(&row.public_key).unwrap_or_else(|_| wireguard_control::Key::zero())
}

fn merge_updatable_fields(cfg: &NetworkConfig, state: &mut State) {
    if let Some(endpoint) = cfg.advertise_endpoint {
        state.advertise = Some(endpoint.to_string());
    }
    state.wg_port = cfg.wg_port;
    if !cfg.bootstrap.is_empty() {
        state.bootstrap = cfg.bootstrap.clone();
    }
}

#[cfg(target_os = "linux")]
fn interface_exists(name: &str) -> bool {
    std::ffi::CString::new(name)
        .map(|c| unsafe { libc::if_nametoindex(c.as_ptr()) != 0 })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn interface_exists(_name: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use ployz_shared::config::NetworkConfigInput;
    use wireguard_control::KeyPair;

    fn cfg(network: &str) -> NetworkConfig {
        NetworkConfigInput { network: Some(network.to_string()), ..Default::default() }.normalize().unwrap()
    }

    fn dummy_state(network: &str, cidr: &str, subnet: &str) -> State {
        let keypair = KeyPair::generate();
        State {
            network: network.to_string(),
            cidr: cidr.parse().unwrap(),
            subnet: subnet.parse().unwrap(),
            management: "fdcc::1".parse().unwrap(),
            advertise: None,
            wg_interface: "plz-test".to_string(),
            wg_port: 51000,
            wg_private: keypair.private,
            wg_public: keypair.public,
            docker_network: "ployz-test".to_string(),
            corrosion_name: "ployz-corrosion-test".to_string(),
            corrosion_image: "ghcr.io/superfly/corrosion:latest".to_string(),
            helper_name: "ployz-helper-test".to_string(),
            helper_image: "ployz/helper:latest".to_string(),
            bootstrap: vec![],
            peers: vec![],
            running: false,
        }
    }

    #[test]
    fn rejects_conflicting_cidr() {
        let cfg = NetworkConfigInput {
            network: Some("net1".to_string()),
            network_cidr: Some("10.211.0.0/16".to_string()),
            ..Default::default()
        }
        .normalize()
        .unwrap();
        let state = dummy_state("net1", "10.210.0.0/16", "10.210.0.0/24");
        let err = enforce_first_write_wins(&cfg, &state).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized { field: "networkCIDR", .. }));
    }

    #[test]
    fn rejects_conflicting_subnet() {
        let cfg = NetworkConfigInput {
            network: Some("net1".to_string()),
            subnet: Some("10.210.5.0/24".to_string()),
            ..Default::default()
        }
        .normalize()
        .unwrap();
        let state = dummy_state("net1", "10.210.0.0/16", "10.210.0.0/24");
        let err = enforce_first_write_wins(&cfg, &state).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized { field: "subnet", .. }));
    }

    #[test]
    fn allows_matching_cidr_and_subnet() {
        let cfg = cfg("net1");
        let state = dummy_state("net1", cfg.network_cidr.to_string().as_str(), "10.210.0.0/24");
        assert!(enforce_first_write_wins(&cfg, &state).is_ok());
    }

    #[test]
    fn merge_updates_advertise_port_and_nonempty_bootstrap() {
        let cfg = NetworkConfigInput {
            network: Some("net1".to_string()),
            advertise_endpoint: Some("203.0.113.5:51000".to_string()),
            bootstrap: vec!["203.0.113.9:53000".to_string()],
            ..Default::default()
        }
        .normalize()
        .unwrap();
        let mut state = dummy_state("net1", "10.210.0.0/16", "10.210.0.0/24");
        merge_updatable_fields(&cfg, &mut state);
        assert_eq!(state.advertise.as_deref(), Some("203.0.113.5:51000"));
        assert_eq!(state.bootstrap, vec!["203.0.113.9:53000".to_string()]);
    }

    #[test]
    fn merge_preserves_bootstrap_when_input_empty() {
        let cfg = cfg("net1");
        let mut state = dummy_state("net1", "10.210.0.0/16", "10.210.0.0/24");
        state.bootstrap = vec!["old:53000".to_string()];
        merge_updatable_fields(&cfg, &mut state);
        assert_eq!(state.bootstrap, vec!["old:53000".to_string()]);
    }
}
