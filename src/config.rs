//! Crawl configuration: defaults, an optional TOML file, and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::masscan::ScanParams;
use crate::partition::{parse_range, AddressChunk};
use crate::protocol::TcpStatusProbe;
use crate::scheduler::SchedulerConfig;

/// Everything one crawler process needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlConfig {
    /// Scanner executable, a path or a name looked up on `PATH`.
    pub scanner_binary: PathBuf,
    /// Address exclusion file handed to every scanner.
    pub exclude_file: PathBuf,
    /// Address range to sweep (`a-b`, CIDR, or a single address).
    pub range: String,
    pub target_port: u16,
    /// Number of parallel scanner processes.
    pub scan_workers: usize,
    /// Packets per second for each scanner process.
    pub scan_rate: u64,
    pub randomize_hosts: bool,
    /// Status pings allowed in flight at once.
    pub query_workers: usize,
    pub query_timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Protocol number announced in the handshake.
    pub protocol_version: i32,
    pub index_path: PathBuf,
    pub shutdown_grace_secs: u64,
    /// Start a new session as soon as one completes.
    pub continuous: bool,
    /// Program run with the index path after each completed session.
    pub post_session_hook: Option<PathBuf>,
    /// Seconds between progress lines; 0 disables them.
    pub progress_interval_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            scanner_binary: PathBuf::from("masscan"),
            exclude_file: PathBuf::from("exclude.conf"),
            range: "0.0.0.0-255.255.255.255".to_string(),
            target_port: 25565,
            scan_workers: 12,
            scan_rate: 1_000_000,
            randomize_hosts: true,
            query_workers: 10,
            query_timeout_ms: 10_000,
            retries: 3,
            retry_backoff_ms: 1_000,
            protocol_version: 0,
            index_path: PathBuf::from("servers.json"),
            shutdown_grace_secs: 10,
            continuous: false,
            post_session_hook: None,
            progress_interval_secs: 30,
        }
    }
}

impl CrawlConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load a config file; keys it leaves out keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject settings the crawler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("scan_workers", self.scan_workers as u64),
            ("scan_rate", self.scan_rate),
            ("query_workers", self.query_workers as u64),
            ("query_timeout_ms", self.query_timeout_ms),
            ("target_port", u64::from(self.target_port)),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        self.scan_range()?;
        Ok(())
    }

    pub fn scan_range(&self) -> Result<AddressChunk, ConfigError> {
        Ok(parse_range(&self.range)?)
    }

    pub fn scan_params(&self) -> ScanParams {
        ScanParams {
            port: self.target_port,
            rate: self.scan_rate,
            exclude_file: self.exclude_file.clone(),
            randomize_hosts: self.randomize_hosts,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.query_workers,
            retries: self.retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn probe(&self) -> TcpStatusProbe {
        TcpStatusProbe {
            protocol_version: self.protocol_version,
            timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }
}
