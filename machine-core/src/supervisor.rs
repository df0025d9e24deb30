//! CRDT Supervisor (C5): renders the CRDT's config file and brings its
//! container to the desired running/stopped state.

use std::{collections::HashMap, path::Path};

use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    errors::Error as BollardError,
    models::{HostConfig, Mount, MountTypeEnum},
    Docker,
};
use ployz_shared::error::Error;
use serde::Serialize;

use crate::state::State;

/// IPv4/IPv6 header sizes subtracted from the WireGuard MTU to get the
/// largest gossip frame that still fits unfragmented over the tunnel.
const IPV4_HEADER_BYTES: u32 = 20;
const UDP_HEADER_BYTES: u32 = 8;

const SCHEMA_SQL: &str = include_str!("supervisor_schema.sql");

#[derive(Debug, Serialize)]
struct CrdtConfig {
    db: DbSection,
    gossip: GossipSection,
    api: ApiSection,
    admin: AdminSection,
}

#[derive(Debug, Serialize)]
struct DbSection {
    path: String,
    schema_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GossipSection {
    addr: String,
    bootstrap: Vec<String>,
    plaintext: bool,
    max_mtu: u32,
}

#[derive(Debug, Serialize)]
struct ApiSection {
    addr: String,
}

#[derive(Debug, Serialize)]
struct AdminSection {
    path: String,
}

/// Renders `config.toml` and `schema.sql` for `state` under
/// `<dataDir>/corrosion/`, creating the directory if needed.
pub fn render_config(data_dir: &Path, state: &State, gossip_port: u16, api_port: u16) -> Result<(), Error> {
    let dir = data_dir.join("corrosion");
    ployz_shared::fs::ensure_dir_exists(&dir)?;

    let max_mtu = ployz_shared::config::WIREGUARD_INTERFACE_MTU - IPV4_HEADER_BYTES - UDP_HEADER_BYTES;

    let config = CrdtConfig {
        db: DbSection {
            path: "/data/state.db".to_string(),
            schema_paths: vec!["/data/schema.sql".to_string()],
        },
        gossip: GossipSection {
            addr: format!("{}:{gossip_port}", state.management),
            bootstrap: state.bootstrap.clone(),
            plaintext: true,
            max_mtu,
        },
        api: ApiSection { addr: format!("127.0.0.1:{api_port}") },
        admin: AdminSection { path: "/data/admin.sock".to_string() },
    };

    let rendered = toml::to_string_pretty(&config).map_err(|e| Error::Other(e.to_string()))?;
    std::fs::write(dir.join("config.toml"), rendered)?;
    std::fs::write(dir.join("schema.sql"), SCHEMA_SQL)?;
    Ok(())
}

/// Starts the CRDT container for `state`, creating it if absent. A no-op
/// if it is already running.
pub async fn start(docker: &Docker, data_dir: &Path, state: &State) -> Result<(), Error> {
    let config_dir = data_dir.join("corrosion").canonicalize()?;
    let existing = find_container(docker, &state.corrosion_name).await?;

    match existing {
        Some(c) if c.state.as_deref() == Some("running") => Ok(()),
        Some(c) => {
            let id = c.id.ok_or_else(|| Error::Other("corrosion container has no id".into()))?;
            docker.start_container(&id, None::<StartContainerOptions<String>>).await.map_err(Error::Docker)
        },
        None => {
            create_and_start(docker, &config_dir, state).await
        },
    }
}

/// Removes the CRDT container for `state`, tolerating its absence.
pub async fn stop(docker: &Docker, state: &State) -> Result<(), Error> {
    match docker
        .remove_container(&state.corrosion_name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await
    {
        Ok(()) => Ok(()),
        Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => Err(Error::Docker(e)),
    }
}

async fn find_container(docker: &Docker, name: &str) -> Result<Option<bollard::secret::ContainerSummary>, Error> {
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
            ..Default::default()
        }))
        .await
        .map_err(Error::Docker)?;
    Ok(containers.into_iter().next())
}

async fn create_and_start(docker: &Docker, config_dir: &Path, state: &State) -> Result<(), Error> {
    docker
        .create_container(
            Some(CreateContainerOptions { name: state.corrosion_name.clone(), platform: None }),
            Config {
                image: Some(state.corrosion_image.clone()),
                cmd: Some(vec!["corrosion".to_string(), "agent".to_string(), "-c".to_string(), "/data/config.toml".to_string()]),
                host_config: Some(HostConfig {
                    network_mode: Some("host".to_string()),
                    mounts: Some(vec![Mount {
                        target: Some("/data".to_string()),
                        source: Some(config_dir.to_string_lossy().into_owned()),
                        typ: Some(MountTypeEnum::BIND),
                        ..Default::default()
                    }]),
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

    docker
        .start_container(&state.corrosion_name, None::<StartContainerOptions<String>>)
        .await
        .map_err(Error::Docker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_mtu_subtracts_ip_and_udp_headers() {
        let max_mtu = ployz_shared::config::WIREGUARD_INTERFACE_MTU - IPV4_HEADER_BYTES - UDP_HEADER_BYTES;
        assert_eq!(max_mtu, 1252);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = CrdtConfig {
            db: DbSection { path: "/data/state.db".to_string(), schema_paths: vec!["/data/schema.sql".to_string()] },
            gossip: GossipSection {
                addr: "fdcc::1:8787".to_string(),
                bootstrap: vec!["10.0.0.1:8787".to_string()],
                plaintext: true,
                max_mtu: 1252,
            },
            api: ApiSection { addr: "127.0.0.1:8080".to_string() },
            admin: AdminSection { path: "/data/admin.sock".to_string() },
        };
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("max_mtu = 1252"));
        assert!(rendered.contains("[gossip]"));
    }
}
