//! Transactional, query, and subscription access to the CRDT-replicated
//! `machines` and `network_config` tables (C3).

use std::{net::Ipv6Addr, time::Duration};

use futures_util::StreamExt;
use ipnet::Ipv4Net;
use ployz_shared::error::Error;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::{io::AsyncBufReadExt, sync::{mpsc, watch}};
use tokio_util::io::StreamReader;

use super::events::{ChangeKind, DecodedRow, MachineRow, WireFrame};

const ENSURE_TABLES_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS network_config (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS machines (\
        id TEXT PRIMARY KEY, \
        public_key TEXT NOT NULL, \
        subnet TEXT NOT NULL, \
        management_ip TEXT NOT NULL, \
        endpoint TEXT, \
        updated_at INTEGER NOT NULL, \
        version INTEGER NOT NULL\
    )",
];

const MACHINE_COLUMNS: &str = "id, public_key, subnet, management_ip, endpoint, updated_at, version";

/// What changed about a machine row, as delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    Added(MachineRow),
    Updated(MachineRow),
    Deleted(String),
    /// The subscription had to restart from scratch; the caller must
    /// re-read authoritative state rather than trust its running diff.
    Resync,
}

#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn ensure_tables(&self) -> Result<(), Error> {
        let statements = ENSURE_TABLES_SQL
            .iter()
            .map(|sql| (sql.to_string(), Vec::<Value>::new()))
            .collect();
        self.transact(statements).await
    }

    pub async fn transact(&self, statements: Vec<(String, Vec<Value>)>) -> Result<(), Error> {
        let body: Vec<Value> = statements
            .into_iter()
            .map(|(query, params)| json!({ "query": query, "params": params }))
            .collect();

        let resp = self
            .authed(self.http.post(self.url("/v1/transactions")))
            .json(&body)
            .send()
            .await?;
        resp.error_for_status_ref().map_err(Error::Registry)?;
        Ok(())
    }

    /// Runs `query` and returns every decoded `(columns, values)` row.
    async fn query_raw(&self, query: &str, params: Vec<Value>) -> Result<Vec<(Vec<String>, Vec<Value>)>, Error> {
        let resp = self
            .authed(self.http.post(self.url("/v1/queries")))
            .json(&json!({ "query": query, "params": params }))
            .send()
            .await?;
        resp.error_for_status_ref().map_err(Error::Registry)?;
        let body = resp.bytes().await?;

        let mut columns: Vec<String> = vec![];
        let mut rows = vec![];
        for line in body.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let frame: WireFrame = serde_json::from_slice(line)?;
            if let Some(cols) = frame.columns {
                columns = cols;
            }
            if let Some((_, values)) = frame.row {
                rows.push((columns.clone(), values));
            }
            if frame.eoq.is_some() {
                break;
            }
        }
        Ok(rows)
    }

    pub async fn list_machines(&self) -> Result<Vec<MachineRow>, Error> {
        self.query_raw(&format!("SELECT {MACHINE_COLUMNS} FROM machines"), vec![])
            .await?
            .into_iter()
            .map(|(cols, values)| DecodedRow { values }.into_machine_row(&cols))
            .collect()
    }

    async fn get_machine(&self, id: &str) -> Result<Option<MachineRow>, Error> {
        let rows = self
            .query_raw(
                &format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?"),
                vec![json!(id)],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|(cols, values)| DecodedRow { values }.into_machine_row(&cols))
            .transpose()
    }

    /// Ensures the cluster CIDR is reserved, per §4.3's three-way branch.
    pub async fn ensure_network_cidr(
        &self,
        requested: Option<Ipv4Net>,
        fallback: Option<Ipv4Net>,
        default: Ipv4Net,
    ) -> Result<Ipv4Net, Error> {
        let rows = self
            .query_raw("SELECT value FROM network_config WHERE key = 'cidr'", vec![])
            .await?;

        match rows.into_iter().next() {
            None => {
                let value = requested.or(fallback).unwrap_or(default);
                self.transact(vec![(
                    "INSERT INTO network_config (key, value) VALUES ('cidr', ?)".to_string(),
                    vec![json!(value.to_string())],
                )])
                .await?;
                Ok(value)
            },
            Some((columns, values)) => {
                let stored_str = DecodedRow { values }.text(&columns, "value")?;
                let stored: Ipv4Net = stored_str
                    .parse()
                    .map_err(|e| Error::InvalidCidr(stored_str.clone(), e))?;
                match requested {
                    Some(req) if req != stored => Err(Error::CidrMismatch {
                        existing: stored.to_string(),
                        requested: req.to_string(),
                    }),
                    _ => Ok(stored),
                }
            },
        }
    }

    /// Optimistic-CAS upsert of one machine row, per §4.3.
    pub async fn upsert_machine(
        &self,
        id: &str,
        public_key: &str,
        subnet: Ipv4Net,
        management_ip: Ipv6Addr,
        endpoint: Option<&str>,
        expected_version: i64,
    ) -> Result<(), Error> {
        let now = crate::state::unix_now() as i64;
        match self.get_machine(id).await? {
            None => {
                if expected_version > 0 {
                    return Err(Error::Conflict);
                }
                self.transact(vec![(
                    format!("INSERT INTO machines ({MACHINE_COLUMNS}) VALUES (?,?,?,?,?,?,1)"),
                    vec![
                        json!(id),
                        json!(public_key),
                        json!(subnet.to_string()),
                        json!(management_ip.to_string()),
                        json!(endpoint),
                        json!(now),
                    ],
                )])
                .await
            },
            Some(current) => {
                if expected_version > 0 && current.version != expected_version {
                    return Err(Error::Conflict);
                }
                if current.public_key == public_key
                    && current.subnet == subnet
                    && current.management_ip == management_ip
                    && current.endpoint.as_deref() == endpoint
                {
                    return Ok(());
                }
                self.transact(vec![(
                    "UPDATE machines SET public_key=?, subnet=?, management_ip=?, endpoint=?, \
                     updated_at=?, version=? WHERE id=?"
                        .to_string(),
                    vec![
                        json!(public_key),
                        json!(subnet.to_string()),
                        json!(management_ip.to_string()),
                        json!(endpoint),
                        json!(now),
                        json!(current.version + 1),
                        json!(id),
                    ],
                )])
                .await
            },
        }
    }

    pub async fn delete_by_endpoint_except_id(&self, endpoint: &str, id: &str) -> Result<(), Error> {
        self.transact(vec![(
            "DELETE FROM machines WHERE endpoint = ? AND id != ?".to_string(),
            vec![json!(endpoint), json!(id)],
        )])
        .await
    }

    /// Subscribes to `machines`, returning the initial snapshot plus a
    /// channel of subsequent changes. The subscription auto-resubscribes
    /// on transport or decode failure with exponential backoff (1s→15s),
    /// emitting `Resync` so consumers re-read authoritative state. Runs
    /// until `cancel` is set to `true`.
    pub async fn subscribe_machines(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<(Vec<MachineRow>, mpsc::Receiver<MachineEvent>), Error> {
        let query = format!("SELECT {MACHINE_COLUMNS} FROM machines");
        let (query_id, snapshot, initial_change_id) = self.open_subscription(&query).await?;

        let (tx, rx) = mpsc::channel(64);
        let base_url = self.base_url.clone();
        let token = self.token.clone();

        tokio::spawn(subscription_loop(
            base_url,
            token,
            query_id,
            initial_change_id,
            tx,
            cancel,
        ));

        Ok((snapshot, rx))
    }

    async fn open_subscription(
        &self,
        query: &str,
    ) -> Result<(String, Vec<MachineRow>, Option<i64>), Error> {
        let resp = self
            .authed(self.http.post(self.url("/v1/subscriptions")))
            .json(&json!({ "query": query, "params": Vec::<Value>::new() }))
            .send()
            .await?;
        resp.error_for_status_ref().map_err(Error::Registry)?;

        let query_id = resp
            .headers()
            .get("corro-query-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::RegistryProtocol("missing corro-query-id header".to_string()))?
            .to_string();

        let body = resp.bytes().await?;
        let mut columns = vec![];
        let mut snapshot = vec![];
        let mut change_id = None;
        for line in body.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let frame: WireFrame = serde_json::from_slice(line)?;
            if let Some(cols) = frame.columns {
                columns = cols;
            }
            if let Some((_, values)) = frame.row {
                snapshot.push(DecodedRow { values }.into_machine_row(&columns)?);
            }
            if let Some(eoq) = frame.eoq {
                change_id = eoq.change_id;
            }
        }

        Ok((query_id, snapshot, change_id))
    }
}

async fn subscription_loop(
    base_url: String,
    token: Option<String>,
    mut query_id: String,
    mut last_change_id: Option<i64>,
    tx: mpsc::Sender<MachineEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let http = Client::new();
    let mut backoff = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(15);
    let mut columns: Vec<String> = vec![];

    loop {
        if *cancel.borrow() {
            return;
        }

        let from = last_change_id.unwrap_or(0);
        let url = format!(
            "{}/v1/subscriptions/{}?from={}",
            base_url.trim_end_matches('/'),
            query_id,
            from
        );
        let mut builder = http.get(&url);
        if let Some(token) = &token {
            builder = builder.bearer_auth(token);
        }

        let stream_result = builder.send().await.and_then(|r| r.error_for_status());
        let response = match stream_result {
            Ok(r) => r,
            Err(_) => {
                sleep_or_cancel(&mut backoff, MAX_BACKOFF, &mut cancel).await;
                continue;
            },
        };

        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut lines = StreamReader::new(byte_stream).lines();

        let _ = tx.send(MachineEvent::Resync).await;
        backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) if !line.is_empty() => {
                            match serde_json::from_str::<WireFrame>(&line) {
                                Ok(frame) => {
                                    if let Some(cols) = frame.columns {
                                        columns = cols;
                                    }
                                    if let Some(eoq) = frame.eoq {
                                        last_change_id = eoq.change_id.or(last_change_id);
                                    }
                                    if let Some((kind, _rowid, values, change_id)) = frame.change {
                                        last_change_id = Some(change_id);
                                        if let Err(e) = emit_change(&tx, &columns, &kind, values).await {
                                            log::warn!("dropping malformed subscription frame: {e}");
                                        }
                                    }
                                },
                                Err(_) => break,
                            }
                        },
                        Ok(Some(_)) => {},
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        sleep_or_cancel(&mut backoff, MAX_BACKOFF, &mut cancel).await;
    }
}

async fn emit_change(
    tx: &mpsc::Sender<MachineEvent>,
    columns: &[String],
    kind: &str,
    values: Vec<Value>,
) -> Result<(), Error> {
    match ChangeKind::parse(kind) {
        ChangeKind::Delete => {
            let id = DecodedRow { values }.text(columns, "id")?;
            let _ = tx.send(MachineEvent::Deleted(id)).await;
        },
        ChangeKind::Insert => {
            let row = DecodedRow { values }.into_machine_row(columns)?;
            let _ = tx.send(MachineEvent::Added(row)).await;
        },
        ChangeKind::Update => {
            let row = DecodedRow { values }.into_machine_row(columns)?;
            let _ = tx.send(MachineEvent::Updated(row)).await;
        },
    }
    Ok(())
}

async fn sleep_or_cancel(backoff: &mut Duration, max: Duration, cancel: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(*backoff) => {},
        _ = cancel.changed() => {},
    }
    *backoff = (*backoff * 2).min(max);
}
