use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An `ip:port` a scan worker reported as accepting TCP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveredEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl DiscoveredEndpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for DiscoveredEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One indexed server, as stored in the index file.
///
/// Created once from the first successful status response; never rewritten.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub ip: String,
    #[serde(deserialize_with = "port_number_or_string")]
    pub port: u16,
    pub hostname: String,
    pub description: String,
    #[serde(default, deserialize_with = "seq_or_empty")]
    pub extra_description: Vec<Value>,
    pub version: String,
    #[serde(rename = "type", default = "default_edition")]
    pub edition: String,
    pub max_players: i64,
    pub online_players: i64,
    #[serde(rename = "protocol")]
    pub protocol_version: i64,
    pub icon: String,
    #[serde(default)]
    pub mod_info: Value,
    #[serde(default)]
    pub motd: String,
    pub is_modded: bool,
    pub is_eula_blocked: bool,
    pub prevents_chat_reports: bool,
    #[serde(default)]
    pub whitelisted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
}

pub(crate) fn default_edition() -> String {
    "Java".to_string()
}

// Older index files wrote `""` when a server had no extra description.
fn seq_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

// Some crawler versions wrote the port as the string captured from scanner output.
fn port_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(d)? {
        Port::Number(p) => Ok(p),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl ServerRecord {
    /// The `(ip, port)` identity records are deduplicated on.
    pub fn key(&self) -> (String, u16) {
        (self.ip.clone(), self.port)
    }
}

/// Live counters for one crawler run, shared by every component.
#[derive(Clone, Debug, Default)]
pub struct CrawlStats {
    pub discovered: Arc<AtomicU64>,
    pub duplicates: Arc<AtomicU64>,
    pub excluded: Arc<AtomicU64>,
    pub probes: Arc<AtomicU64>,
    pub retries: Arc<AtomicU64>,
    pub indexed: Arc<AtomicU64>,
    pub offline: Arc<AtomicU64>,
    pub scanner_failures: Arc<AtomicU64>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discovered: self.discovered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            scanner_failures: self.scanner_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CrawlStats`].
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub discovered: u64,
    pub duplicates: u64,
    pub excluded: u64,
    pub probes: u64,
    pub retries: u64,
    pub indexed: u64,
    pub offline: u64,
    pub scanner_failures: u64,
}

impl StatsSnapshot {
    /// Counts accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            discovered: self.discovered.saturating_sub(earlier.discovered),
            duplicates: self.duplicates.saturating_sub(earlier.duplicates),
            excluded: self.excluded.saturating_sub(earlier.excluded),
            probes: self.probes.saturating_sub(earlier.probes),
            retries: self.retries.saturating_sub(earlier.retries),
            indexed: self.indexed.saturating_sub(earlier.indexed),
            offline: self.offline.saturating_sub(earlier.offline),
            scanner_failures: self.scanner_failures.saturating_sub(earlier.scanner_failures),
        }
    }
}
