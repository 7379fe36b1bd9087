use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ::time::{format_description::well_known, OffsetDateTime};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::dns::DnsCache;
use crate::error::StoreError;
use crate::types::{default_edition, DiscoveredEndpoint, ServerRecord};

/// Protocol number recorded when a server does not report one.
pub const DEFAULT_PROTOCOL_VERSION: i64 = 127;

/// Build a [`ServerRecord`] from a raw status payload. Each field falls back on its own.
pub fn normalize_status(ip: Ipv4Addr, port: u16, hostname: String, status: &Value) -> ServerRecord {
    let str_at = |pointer: &str| {
        status
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let int_at = |pointer: &str, default: i64| {
        status.pointer(pointer).and_then(Value::as_i64).unwrap_or(default)
    };
    let flag = |key: &str| status.get(key).and_then(Value::as_bool).unwrap_or(false);

    let description = match status.get("description") {
        Some(Value::String(s)) => s.clone(),
        _ => str_at("/description/text"),
    };
    let modinfo = status.get("modinfo").filter(|v| !v.is_null());

    ServerRecord {
        ip: ip.to_string(),
        port,
        hostname,
        description,
        extra_description: status
            .pointer("/description/extra")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        version: str_at("/version/name"),
        edition: default_edition(),
        max_players: int_at("/players/max", 0),
        online_players: int_at("/players/online", 0),
        protocol_version: int_at("/version/protocol", DEFAULT_PROTOCOL_VERSION),
        icon: status
            .get("favicon")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        mod_info: modinfo.cloned().unwrap_or_else(|| Value::String(String::new())),
        motd: str_at("/description/text"),
        is_modded: modinfo.is_some(),
        is_eula_blocked: flag("eulaBlocked"),
        prevents_chat_reports: flag("preventsChatReports"),
        whitelisted: None,
        indexed_at: Some(now_iso_like()),
    }
}

/// Result of offering a record to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Added to the index. `persisted` is false when the flush failed; the next insert retries it.
    Inserted { persisted: bool },
    Duplicate,
}

#[derive(Debug, Default)]
struct IndexState {
    records: Vec<ServerRecord>,
    keys: HashSet<(String, u16)>,
}

#[derive(Debug, Default)]
struct WriterState {
    dirty: bool,
}

/// Owner of the in-memory index and its backing JSON file.
///
/// Inserts and flushes are serialized behind one writer lock; dedup lookups only
/// take the index read lock, so they proceed while a flush is on disk.
#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    state: RwLock<IndexState>,
    writer: Mutex<WriterState>,
    dns: DnsCache,
}

impl ResultStore {
    /// Load the index at `path`, creating it as `[]` when absent.
    pub async fn open(path: impl AsRef<Path>, dns: DnsCache) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = load_index(&path).await?;

        let mut state = IndexState::default();
        for record in records {
            if state.keys.insert(record.key()) {
                state.records.push(record);
            } else {
                warn!(ip = %record.ip, port = record.port, "dropping duplicate entry from index file");
            }
        }
        info!(path = %path.display(), servers = state.records.len(), "index loaded");

        Ok(Self {
            path,
            state: RwLock::new(state),
            writer: Mutex::new(WriterState::default()),
            dns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, endpoint: &DiscoveredEndpoint) -> bool {
        let key = (endpoint.ip.to_string(), endpoint.port);
        self.state.read().await.keys.contains(&key)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the index in insertion order.
    pub async fn records(&self) -> Vec<ServerRecord> {
        self.state.read().await.records.clone()
    }

    /// Turn a status payload for `endpoint` into a record and index it.
    pub async fn record_status(&self, endpoint: DiscoveredEndpoint, status: &Value) -> InsertOutcome {
        for key in ["translate", "text"] {
            if let Some(msg) = status.get(key).and_then(Value::as_str) {
                warn!(%endpoint, reply = msg, "server answered with an error message");
            }
        }
        let hostname = self.dns.hostname_or_ip(endpoint.ip);
        let record = normalize_status(endpoint.ip, endpoint.port, hostname, status);
        self.insert(record).await
    }

    /// Append `record` unless its `(ip, port)` is already indexed, then rewrite the file.
    pub async fn insert(&self, record: ServerRecord) -> InsertOutcome {
        let mut writer = self.writer.lock().await;
        {
            let mut state = self.state.write().await;
            if !state.keys.insert(record.key()) {
                return InsertOutcome::Duplicate;
            }
            state.records.push(record);
        }
        let persisted = match self.write_locked(&mut writer).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to persist index; will retry on next insert");
                false
            }
        };
        InsertOutcome::Inserted { persisted }
    }

    /// Retry a flush that failed earlier. No-op when the file is current.
    pub async fn flush_if_dirty(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if !writer.dirty {
            return Ok(());
        }
        self.write_locked(&mut writer).await
    }

    async fn write_locked(&self, writer: &mut WriterState) -> Result<(), StoreError> {
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&state.records)?
        };
        match write_atomic(&self.path, &bytes).await {
            Ok(()) => {
                writer.dirty = false;
                debug!(path = %self.path.display(), bytes = bytes.len(), "index flushed");
                Ok(())
            }
            Err(e) => {
                writer.dirty = true;
                Err(e)
            }
        }
    }
}

async fn load_index(path: &Path) -> Result<Vec<ServerRecord>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_atomic(path, b"[]").await?;
            Ok(Vec::new())
        }
        Err(e) => Err(io_err(e)),
    }
}

/// Sibling temp file used while a new index is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` so readers see either the old or the new file, never a mix.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = temp_path(path);
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
