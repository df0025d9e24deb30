//! Docker network lifecycle shared by both platform adapters.

use std::collections::HashMap;

use bollard::errors::Error as BollardError;
use bollard::models::{Ipam, IpamConfig, NetworkCreateResponse};
use bollard::network::CreateNetworkOptions;
use bollard::secret::Network;
use bollard::Docker;
use ipnet::Ipv4Net;
use ployz_shared::error::Error;

const TRUSTED_HOST_INTERFACES_OPT: &str = "com.docker.network.bridge.trusted_host_interfaces";

/// Ensures `name` is a bridge network with exactly `subnet` in its IPAM
/// config and `wg_interface` as a trusted host interface. Recreates the
/// network from scratch whenever the existing IPAM subnet doesn't match,
/// purging any containers still attached to it first.
pub async fn ensure_network(
    docker: &Docker,
    name: &str,
    subnet: Ipv4Net,
    wg_interface: &str,
) -> Result<String, Error> {
    match inspect(docker, name).await? {
        Some(net) if ipam_subnet(&net) == Some(subnet.to_string()) => {
            net.id.ok_or_else(|| {
                Error::Other(format!("docker network {name} has no id"))
            })
        }
        Some(net) => {
            purge_network(docker, &net).await?;
            create_network(docker, name, subnet, wg_interface).await
        }
        None => create_network(docker, name, subnet, wg_interface).await,
    }
}

/// Removes the network named `name`, purging every attached container
/// first. A no-op if the network does not exist.
pub async fn cleanup_network(docker: &Docker, name: &str) -> Result<(), Error> {
    if let Some(net) = inspect(docker, name).await? {
        purge_network(docker, &net).await?;
    }
    Ok(())
}

async fn inspect(docker: &Docker, name: &str) -> Result<Option<Network>, Error> {
    match docker.inspect_network::<String>(name, None).await {
        Ok(net) => Ok(Some(net)),
        Err(BollardError::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(None),
        Err(e) => Err(Error::Docker(e)),
    }
}

fn ipam_subnet(net: &Network) -> Option<String> {
    net.ipam
        .as_ref()?
        .config
        .as_ref()?
        .iter()
        .find_map(|c| c.subnet.clone())
}

async fn create_network(
    docker: &Docker,
    name: &str,
    subnet: Ipv4Net,
    wg_interface: &str,
) -> Result<String, Error> {
    let mut options = HashMap::new();
    options.insert(
        TRUSTED_HOST_INTERFACES_OPT.to_string(),
        wg_interface.to_string(),
    );

    let response: NetworkCreateResponse = docker
        .create_network(CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            options,
            ..Default::default()
        })
        .await
        .map_err(Error::Docker)?;

    response
        .id
        .ok_or_else(|| Error::Other(format!("docker did not return an id for network {name}")))
}

async fn purge_network(docker: &Docker, net: &Network) -> Result<(), Error> {
    let id = net
        .id
        .as_deref()
        .ok_or_else(|| Error::Other("docker network has no id".into()))?;

    if let Some(containers) = net.containers.as_ref() {
        for container_id in containers.keys() {
            log::info!("removing container {container_id} attached to docker network {id}");
            match docker
                .remove_container(
                    container_id,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {}
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(Error::Docker(e)),
            }
        }
    }

    match docker.remove_network(id).await {
        Ok(()) => Ok(()),
        Err(BollardError::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(Error::Docker(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipam_subnet_reads_first_config_entry() {
        let net = Network {
            ipam: Some(Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some("10.210.0.0/24".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ipam_subnet(&net), Some("10.210.0.0/24".to_string()));
    }

    #[test]
    fn ipam_subnet_is_none_without_ipam() {
        let net = Network::default();
        assert_eq!(ipam_subnet(&net), None);
    }
}
