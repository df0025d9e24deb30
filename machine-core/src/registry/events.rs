//! Decoding of the CRDT store's newline-delimited JSON event stream.

use ipnet::Ipv4Net;
use ployz_shared::error::Error;
use serde::Deserialize;
use serde_json::Value;
use std::net::Ipv6Addr;

/// One row of the `machines` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRow {
    pub id: String,
    pub public_key: String,
    pub subnet: Ipv4Net,
    pub management_ip: Ipv6Addr,
    pub endpoint: Option<String>,
    pub updated_at: i64,
    pub version: i64,
}

/// A single frame of the wire protocol. Exactly one field is set per
/// line; the store sometimes folds `change_id` into `eoq` and sometimes
/// alongside `change`, so both are modeled explicitly.
#[derive(Debug, Deserialize)]
pub(crate) struct WireFrame {
    pub columns: Option<Vec<String>>,
    pub row: Option<(i64, Vec<Value>)>,
    pub eoq: Option<EoqBody>,
    pub change: Option<(String, i64, Vec<Value>, i64)>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EoqBody {
    pub change_id: Option<i64>,
}

/// The kind of change carried by a `{change:...}` frame. Values outside
/// insert/update/delete have no documented taxonomy and are coerced to
/// `Updated` by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "insert" => ChangeKind::Insert,
            "delete" => ChangeKind::Delete,
            _ => ChangeKind::Update,
        }
    }
}

/// A decoded row, keyed by its position against the most recent
/// `{columns}` frame.
#[derive(Debug, Clone)]
pub(crate) struct DecodedRow {
    pub values: Vec<Value>,
}

impl DecodedRow {
    /// Decodes a single named column as text, accepting a `null` value as
    /// an empty string (the store sometimes emits null-shaped scalars).
    pub(crate) fn text(&self, columns: &[String], name: &str) -> Result<String, Error> {
        match self.column(columns, name)? {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }

    fn column(&self, columns: &[String], name: &str) -> Result<&Value, Error> {
        let idx = columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::RegistryProtocol(format!("missing column {name:?}")))?;
        self.values
            .get(idx)
            .ok_or_else(|| Error::RegistryProtocol(format!("row shorter than columns for {name:?}")))
    }

    /// Decodes a `machines` row. Accepts both scalar and nullable/null
    /// representations for every column.
    pub fn into_machine_row(self, columns: &[String]) -> Result<MachineRow, Error> {
        let text = |name: &str| self.text(columns, name);
        let opt_text = |name: &str| -> Result<Option<String>, Error> {
            match self.column(columns, name)? {
                Value::String(s) => Ok(Some(s.clone())),
                Value::Null => Ok(None),
                other => Ok(Some(other.to_string())),
            }
        };
        let int = |name: &str| -> Result<i64, Error> {
            match self.column(columns, name)? {
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| Error::RegistryProtocol(format!("{name} is not an integer"))),
                Value::Null => Ok(0),
                Value::String(s) => s
                    .parse()
                    .map_err(|_| Error::RegistryProtocol(format!("{name} is not an integer"))),
                _ => Err(Error::RegistryProtocol(format!("{name} has unexpected type"))),
            }
        };

        let subnet_str = text("subnet")?;
        let management_str = text("management_ip")?;

        Ok(MachineRow {
            id: text("id")?,
            public_key: text("public_key")?,
            subnet: subnet_str
                .parse()
                .map_err(|e| Error::InvalidCidr(subnet_str, e))?,
            management_ip: management_str
                .parse()
                .map_err(|_| Error::RegistryProtocol(format!("invalid management_ip {management_str:?}")))?,
            endpoint: opt_text("endpoint")?,
            updated_at: int("updated_at")?,
            version: int("version")?,
        })
    }
}
