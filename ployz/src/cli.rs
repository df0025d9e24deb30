//! Command-line surface: `ployz machine {start,stop,status,reconcile,
//! watch,ls}`, `ployz join`, `ployz host-access`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(name = "ployz", author, version, about)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,

    /// Verbose output, use -vv for even higher verbosity.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Operate on a single machine's local overlay state.
    #[clap(subcommand)]
    Machine(MachineCommand),

    /// Bring a remote `user@host` machine into this network over SSH.
    Join(JoinOpts),

    /// Open a temporary WireGuard peer for this operator's workstation.
    HostAccess(HostAccessOpts),
}

#[derive(Debug, Subcommand)]
pub enum MachineCommand {
    /// Materialize (or re-converge) the local runtime for a network.
    Start(NetworkOpts),

    /// Tear down the local runtime for a network.
    Stop {
        #[clap(flatten)]
        network: NetworkOpts,

        /// Also delete the persisted state and data directory.
        #[clap(long)]
        purge: bool,
    },

    /// Report the resource probes for a network without changing anything.
    Status {
        #[clap(flatten)]
        network: NetworkOpts,
    },

    /// Read the registry once and apply the resulting peer set.
    Reconcile {
        #[clap(flatten)]
        network: NetworkOpts,

        #[clap(flatten)]
        registry: RegistryOpts,
    },

    /// Reconcile on every registry change until interrupted.
    Watch {
        #[clap(flatten)]
        network: NetworkOpts,

        #[clap(flatten)]
        registry: RegistryOpts,
    },

    /// List locally known machine state.
    Ls {
        #[clap(flatten)]
        network: NetworkOpts,

        /// Print only this column, one value per line.
        #[clap(long)]
        format: Option<String>,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct NetworkOpts {
    /// Network identifier; one process may host several in disjoint CIDRs.
    #[clap(long, default_value = "default")]
    pub network: String,

    /// Root directory under which every network's state and data live.
    #[clap(long, default_value = "/var/lib/ployz")]
    pub data_root: PathBuf,

    /// Cluster CIDR (IPv4); only consulted on a network's first `start`.
    #[clap(long)]
    pub cidr: Option<String>,

    /// This machine's `/24` subnet; auto-allocated if omitted.
    #[clap(long)]
    pub subnet: Option<String>,

    /// `ip:port` other machines use to reach this machine's WireGuard listener.
    #[clap(long)]
    pub advertise: Option<String>,

    /// Comma-separated `host:port` CRDT gossip seeds.
    #[clap(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// WireGuard listen port; derived from the network name if omitted.
    #[clap(long)]
    pub wg_port: Option<u16>,

    /// Helper-container image, Darwin only.
    #[clap(long)]
    pub helper_image: Option<String>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RegistryOpts {
    /// CRDT HTTP API base URL; defaults to the network's local corrosion port.
    #[clap(long)]
    pub registry_url: Option<String>,

    /// Bearer token for the registry, if it requires one.
    #[clap(long, env = "PLOYZ_REGISTRY_TOKEN")]
    pub registry_token: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct JoinOpts {
    /// The remote machine, as `user@host`.
    pub remote: String,

    #[clap(flatten)]
    pub network: NetworkOpts,

    #[clap(flatten)]
    pub registry: RegistryOpts,

    /// SSH port on the remote host.
    #[clap(long)]
    pub ssh_port: Option<u16>,

    /// `ip:port` this process advertises for the remote to dial back.
    #[clap(long)]
    pub remote_endpoint: String,
}

#[derive(Debug, clap::Args)]
pub struct HostAccessOpts {
    #[clap(flatten)]
    pub network: NetworkOpts,
}
