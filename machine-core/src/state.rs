//! Local State Store (C2): one persisted row per network, in a single
//! SQLite file shared across all networks under a `dataRoot`.

use std::{
    net::Ipv6Addr,
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ipnet::Ipv4Net;
use ployz_shared::{identity, ipam, config::NetworkConfig, error::Error};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use wireguard_control::{Key, KeyPair};

/// Denormalized peer snapshot most recently applied to the local interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub public_key: String,
    pub subnet: Ipv4Net,
    pub management: Ipv6Addr,
    pub endpoint: Option<String>,
}

/// The persisted record for a single network.
#[derive(Debug, Clone)]
pub struct State {
    pub network: String,
    pub cidr: Ipv4Net,
    pub subnet: Ipv4Net,
    pub management: Ipv6Addr,
    pub advertise: Option<String>,
    pub wg_interface: String,
    pub wg_port: u16,
    pub wg_private: Key,
    pub wg_public: Key,
    pub docker_network: String,
    pub corrosion_name: String,
    pub corrosion_image: String,
    pub helper_name: String,
    pub helper_image: String,
    pub bootstrap: Vec<String>,
    pub peers: Vec<PeerRecord>,
    pub running: bool,
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS networks (
    network         TEXT PRIMARY KEY,
    cidr            TEXT NOT NULL,
    subnet          TEXT NOT NULL,
    management      TEXT NOT NULL,
    advertise       TEXT,
    wg_interface    TEXT NOT NULL,
    wg_port         INTEGER NOT NULL,
    wg_private      TEXT NOT NULL,
    wg_public       TEXT NOT NULL,
    docker_network  TEXT NOT NULL,
    corrosion_name  TEXT NOT NULL,
    corrosion_image TEXT NOT NULL,
    helper_name     TEXT NOT NULL DEFAULT '',
    helper_image    TEXT NOT NULL DEFAULT '',
    bootstrap       TEXT NOT NULL DEFAULT '[]',
    peers           TEXT NOT NULL DEFAULT '[]',
    running         INTEGER NOT NULL DEFAULT 0
)";

/// Columns added after the initial schema. Each entry is applied with
/// `ALTER TABLE ... ADD COLUMN` if missing, so rows written by older
/// binaries keep loading.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[];

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute(CREATE_TABLE_SQL, [])?;
        auto_migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Returns the existing row for `cfg.network`, or creates one: a fresh
    /// WireGuard keypair, a derived management IP, and an allocated subnet
    /// if `cfg.subnet` is absent. Never overwrites an existing row's
    /// identity fields from `cfg`.
    pub fn ensure_state(&self, cfg: &NetworkConfig) -> Result<(State, bool), Error> {
        if let Some(existing) = self.load_state(&cfg.network)? {
            return Ok((existing, false));
        }

        let keypair = KeyPair::generate();
        let management = identity::derive_management_ip(&keypair.public);

        let subnet = match cfg.subnet {
            Some(subnet) => subnet,
            None => {
                let allocated = self.all_subnets_in_cidr(cfg.network_cidr)?;
                ipam::allocate_subnet(cfg.network_cidr, &allocated)?
            },
        };

        let state = State {
            network: cfg.network.clone(),
            cidr: cfg.network_cidr,
            subnet,
            management,
            advertise: cfg.advertise_endpoint.map(|e| e.to_string()),
            wg_interface: cfg.wg_interface.clone(),
            wg_port: cfg.wg_port,
            wg_private: keypair.private,
            wg_public: keypair.public,
            docker_network: cfg.docker_network.clone(),
            corrosion_name: cfg.corrosion_name.clone(),
            corrosion_image: cfg.corrosion_image.clone(),
            helper_name: cfg.helper_name.clone(),
            helper_image: cfg.helper_image.clone(),
            bootstrap: cfg.bootstrap.clone(),
            peers: vec![],
            running: false,
        };

        self.save_state(&state)?;
        Ok((state, true))
    }

    pub fn load_state(&self, network: &str) -> Result<Option<State>, Error> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        conn.query_row(
            "SELECT network, cidr, subnet, management, advertise, wg_interface, wg_port, \
             wg_private, wg_public, docker_network, corrosion_name, corrosion_image, \
             helper_name, helper_image, bootstrap, peers, running FROM networks WHERE network = ?1",
            params![network],
            row_to_state,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn save_state(&self, state: &State) -> Result<(), Error> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        conn.execute(
            "INSERT INTO networks (network, cidr, subnet, management, advertise, wg_interface, \
             wg_port, wg_private, wg_public, docker_network, corrosion_name, corrosion_image, \
             helper_name, helper_image, bootstrap, peers, running) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17) \
             ON CONFLICT(network) DO UPDATE SET \
             cidr=excluded.cidr, subnet=excluded.subnet, management=excluded.management, \
             advertise=excluded.advertise, wg_interface=excluded.wg_interface, \
             wg_port=excluded.wg_port, wg_private=excluded.wg_private, \
             wg_public=excluded.wg_public, docker_network=excluded.docker_network, \
             corrosion_name=excluded.corrosion_name, corrosion_image=excluded.corrosion_image, \
             helper_name=excluded.helper_name, helper_image=excluded.helper_image, \
             bootstrap=excluded.bootstrap, peers=excluded.peers, running=excluded.running",
            params![
                state.network,
                state.cidr.to_string(),
                state.subnet.to_string(),
                state.management.to_string(),
                state.advertise,
                state.wg_interface,
                state.wg_port,
                state.wg_private.to_base64(),
                state.wg_public.to_base64(),
                state.docker_network,
                state.corrosion_name,
                state.corrosion_image,
                state.helper_name,
                state.helper_image,
                serde_json::to_string(&state.bootstrap)?,
                serde_json::to_string(&state.peers)?,
                state.running as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete_state(&self, network: &str) -> Result<(), Error> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        conn.execute("DELETE FROM networks WHERE network = ?1", params![network])?;
        Ok(())
    }

    /// CIDRs of every other network in this store, for host-local overlap checks.
    pub fn other_cidrs(&self, except_network: &str) -> Result<Vec<(String, Ipv4Net)>, Error> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        let mut stmt = conn.prepare("SELECT network, cidr FROM networks WHERE network != ?1")?;
        let rows = stmt
            .query_map(params![except_network], |row| {
                let network: String = row.get(0)?;
                let cidr: String = row.get(1)?;
                Ok((network, cidr))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(network, cidr)| {
                cidr.parse()
                    .map(|cidr| (network, cidr))
                    .map_err(|e| Error::InvalidCidr(cidr, e))
            })
            .collect()
    }

    fn all_subnets_in_cidr(&self, cidr: Ipv4Net) -> Result<Vec<Ipv4Net>, Error> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        let mut stmt = conn.prepare("SELECT subnet FROM networks WHERE cidr = ?1")?;
        let rows = stmt
            .query_map(params![cidr.to_string()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|s| s.parse().map_err(|e| Error::InvalidCidr(s, e)))
            .collect()
    }
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<State> {
    let cidr: String = row.get(1)?;
    let subnet: String = row.get(2)?;
    let management: String = row.get(3)?;
    let wg_private: String = row.get(7)?;
    let wg_public: String = row.get(8)?;
    let bootstrap: String = row.get(14)?;
    let peers: String = row.get(15)?;
    let running: i64 = row.get(16)?;

    Ok(State {
        network: row.get(0)?,
        cidr: parse_col(&cidr)?,
        subnet: parse_col(&subnet)?,
        management: parse_col(&management)?,
        advertise: row.get(4)?,
        wg_interface: row.get(5)?,
        wg_port: row.get(6)?,
        wg_private: Key::from_base64(&wg_private).map_err(|e| decode_err(7, e))?,
        wg_public: Key::from_base64(&wg_public).map_err(|e| decode_err(8, e))?,
        docker_network: row.get(9)?,
        corrosion_name: row.get(10)?,
        corrosion_image: row.get(11)?,
        helper_name: row.get(12)?,
        helper_image: row.get(13)?,
        bootstrap: serde_json::from_str(&bootstrap).map_err(|e| decode_err(14, e))?,
        peers: serde_json::from_str(&peers).map_err(|e| decode_err(15, e))?,
        running: running != 0,
    })
}

fn parse_col<T>(s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| decode_err(0, e))
}

fn decode_err(col: usize, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
    )
}

fn auto_migrate(conn: &Connection) -> Result<(), Error> {
    let mut existing = std::collections::HashSet::new();
    let mut stmt = conn.prepare("PRAGMA table_info(networks)")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        existing.insert(name?);
    }

    for (column, ddl) in ADDITIVE_COLUMNS {
        if !existing.contains(*column) {
            conn.execute(&format!("ALTER TABLE networks ADD COLUMN {ddl}"), [])?;
        }
    }
    Ok(())
}

/// Best-effort current timestamp for fields that merely record "last
/// touched", not a source of ordering truth (the registry's `version`
/// column is that).
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ployz_shared::config::NetworkConfigInput;
    use tempfile::tempdir;

    fn cfg(network: &str) -> NetworkConfig {
        NetworkConfigInput {
            network: Some(network.to_string()),
            ..Default::default()
        }
        .normalize()
        .unwrap()
    }

    #[test]
    fn ensure_state_creates_once_and_persists() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("machine.db")).unwrap();
        let cfg = cfg("net1");

        let (first, created) = store.ensure_state(&cfg).unwrap();
        assert!(created);
        assert_eq!(first.subnet, "10.210.0.0/24".parse().unwrap());
        assert!(first.management.to_string().starts_with("fdcc:"));

        let (second, created_again) = store.ensure_state(&cfg).unwrap();
        assert!(!created_again);
        assert_eq!(first.wg_public, second.wg_public);
        assert_eq!(first.subnet, second.subnet);
    }

    #[test]
    fn save_and_load_round_trips_every_field() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("machine.db")).unwrap();
        let cfg = cfg("net1");
        let (mut state, _) = store.ensure_state(&cfg).unwrap();

        state.peers.push(PeerRecord {
            public_key: "abc".to_string(),
            subnet: "10.210.1.0/24".parse().unwrap(),
            management: "fdcc::1".parse().unwrap(),
            endpoint: Some("1.2.3.4:51820".to_string()),
        });
        state.running = true;
        store.save_state(&state).unwrap();

        let loaded = store.load_state("net1").unwrap().unwrap();
        assert_eq!(loaded.peers, state.peers);
        assert!(loaded.running);
    }

    #[test]
    fn second_network_allocates_next_subnet_when_sharing_cidr() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("machine.db")).unwrap();
        store.ensure_state(&cfg("net1")).unwrap();

        let mut second_cfg = cfg("net2");
        second_cfg.network_cidr = "10.210.0.0/16".parse().unwrap();
        let (second, _) = store.ensure_state(&second_cfg).unwrap();
        assert_eq!(second.subnet, "10.210.1.0/24".parse().unwrap());
    }
}
