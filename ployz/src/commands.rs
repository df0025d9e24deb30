//! Subcommand handlers: each builds a `NetworkConfig`, wires up the
//! `machine-core` components it needs, and runs one operation to
//! completion.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bollard::Docker;
use colored::Colorize;
use machine_core::{
    state::{State, StateStore},
    HostAccessSession, JoinPlan, JoinSession, Orchestrator, Reconciler, RegistryClient,
};
use ployz_shared::config::{NetworkConfig, NetworkConfigInput};
use tokio::sync::watch;

use crate::cli::{HostAccessOpts, JoinOpts, NetworkOpts, RegistryOpts};

fn normalize(opts: &NetworkOpts) -> Result<NetworkConfig> {
    NetworkConfigInput {
        network: Some(opts.network.clone()),
        data_root: Some(opts.data_root.clone()),
        network_cidr: opts.cidr.clone(),
        subnet: opts.subnet.clone(),
        wg_port: opts.wg_port,
        advertise_endpoint: opts.advertise.clone(),
        bootstrap: opts.bootstrap.clone(),
        helper_image: opts.helper_image.clone(),
    }
    .normalize()
    .context("invalid network configuration")
}

fn open_store(cfg: &NetworkConfig) -> Result<Arc<StateStore>> {
    std::fs::create_dir_all(&cfg.data_root).context("creating data root")?;
    let db_path = cfg.data_root.join("machine.db");
    Ok(Arc::new(StateStore::open(&db_path)?))
}

async fn connect_docker() -> Result<Docker> {
    Docker::connect_with_local_defaults().context("connecting to the Docker daemon")
}

fn registry_client(cfg: &NetworkConfig, opts: &RegistryOpts) -> RegistryClient {
    let base_url = opts
        .registry_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", cfg.corrosion_api_port));
    RegistryClient::new(base_url, opts.registry_token.clone())
}

fn load_state(store: &StateStore, cfg: &NetworkConfig) -> Result<State> {
    store
        .load_state(&cfg.network)?
        .with_context(|| format!("network {:?} is not initialized; run `ployz machine start` first", cfg.network))
}

pub async fn start(opts: &NetworkOpts) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let orchestrator = Orchestrator::new(store, docker);
    let state = orchestrator.start(&cfg).await?;

    println!("{} network {:?}", "started".green(), cfg.network);
    println!("  public key:    {}", state.wg_public.to_base64());
    println!("  subnet:        {}", state.subnet);
    println!("  management ip: {}", state.management);
    Ok(())
}

pub async fn stop(opts: &NetworkOpts, purge: bool) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let orchestrator = Orchestrator::new(store, docker);
    orchestrator.stop(&cfg, purge).await?;
    println!("{} network {:?}", "stopped".green(), cfg.network);
    Ok(())
}

pub async fn status(opts: &NetworkOpts) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let orchestrator = Orchestrator::new(store, docker);
    let status = orchestrator.status(&cfg.network).await?;

    println!("network:              {}", cfg.network);
    println!("configured:           {}", status.state_present);
    println!("wireguard up:         {}", status.interface_present);
    println!("docker network up:    {}", status.docker_network_present);
    println!("crdt container up:    {}", status.crdt_running);
    Ok(())
}

pub async fn reconcile(opts: &NetworkOpts, registry: &RegistryOpts) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let adapter: Arc<dyn machine_core::adapter::PlatformAdapter> = Arc::from(machine_core::adapter::build(docker));
    let registry_client = registry_client(&cfg, registry);
    let reconciler = Reconciler::new(store, registry_client, adapter);
    let count = reconciler.reconcile(&cfg).await?;

    // The join protocol drives this exact subcommand over SSH and parses
    // stdout as a bare integer, so nothing else may be printed here.
    println!("{count}");
    Ok(())
}

pub async fn watch(opts: &NetworkOpts, registry: &RegistryOpts) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let adapter: Arc<dyn machine_core::adapter::PlatformAdapter> = Arc::from(machine_core::adapter::build(docker));
    let registry_client = registry_client(&cfg, registry);
    let reconciler = Reconciler::new(store, registry_client, adapter);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });

    log::info!("watching registry for network {:?}", cfg.network);
    reconciler.watch(&cfg, rx).await?;
    Ok(())
}

pub async fn ls(opts: &NetworkOpts, format: Option<&str>) -> Result<()> {
    let cfg = normalize(opts)?;
    let store = open_store(&cfg)?;
    let state = load_state(&store, &cfg)?;

    match format {
        Some("public_key") => println!("{}", state.wg_public.to_base64()),
        Some(other) => bail!("unknown --format {other:?}"),
        None => {
            println!(
                "{}\t{}\t{}\t{}",
                cfg.network,
                state.subnet,
                state.management,
                if state.running { "running" } else { "stopped" },
            );
        },
    }
    Ok(())
}

pub async fn join(opts: &JoinOpts) -> Result<()> {
    let cfg = normalize(&opts.network)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let adapter: Arc<dyn machine_core::adapter::PlatformAdapter> = Arc::from(machine_core::adapter::build(docker));
    let registry_client = registry_client(&cfg, &opts.registry);
    let state = load_state(&store, &cfg)?;

    let peers = registry_client.list_machines().await?;
    let mut allocated: Vec<_> = peers.iter().map(|row| row.subnet).collect();
    allocated.push(state.subnet);

    let plan: JoinPlan = machine_core::join::plan(&state, &allocated)?;
    let reconciler = Reconciler::new(store, registry_client.clone(), adapter);

    let session = JoinSession::new(&registry_client, &reconciler, &opts.remote, opts.ssh_port);
    let count = session.run(&cfg, &plan, &opts.remote_endpoint).await?;

    println!("{} {} ({} peer(s) now known locally)", "joined".green(), opts.remote, count);
    Ok(())
}

pub async fn host_access(opts: &HostAccessOpts) -> Result<()> {
    let cfg = normalize(&opts.network)?;
    let store = open_store(&cfg)?;
    let docker = connect_docker().await?;
    let adapter: Arc<dyn machine_core::adapter::PlatformAdapter> = Arc::from(machine_core::adapter::build(docker));
    let state = load_state(&store, &cfg)?;

    let session = HostAccessSession::open(adapter, state).await?;
    println!("{} host-access peer at {}", "opened".green(), session.host_ip());
    println!("press ctrl-c to close");
    session.run_until_signal().await?;
    println!("{}", "closed".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::NetworkOpts;
    use std::path::PathBuf;

    #[test]
    fn normalize_applies_cli_defaults() {
        let opts = NetworkOpts {
            network: "net1".to_string(),
            data_root: PathBuf::from("/tmp/ployz-test"),
            cidr: None,
            subnet: None,
            advertise: None,
            bootstrap: vec![],
            wg_port: None,
            helper_image: None,
        };
        let cfg = normalize(&opts).unwrap();
        assert_eq!(cfg.network, "net1");
        assert_eq!(cfg.wg_interface, "plz-net1");
    }
}
