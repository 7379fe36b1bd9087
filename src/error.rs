//! Error types for the crawler.
//!
//! Protocol failures never leave the probe: they are folded into an offline
//! outcome by [`crate::protocol::ping`]. The remaining types are the ones an
//! operator can actually see.

use std::path::PathBuf;

use thiserror::Error;

/// Why a status ping produced no usable answer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("malformed varint")]
    MalformedVarint,

    #[error("peer closed after {0} bytes, frame incomplete")]
    Truncated(usize),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("string length {0} overruns its frame")]
    StringOverrun(usize),

    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),

    #[error("status payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Failure to parse an address range or exclusion entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("range start {start} is after end {end}")]
    Reversed { start: String, end: String },

    #[error("cannot split a range into zero chunks")]
    ZeroChunks,
}

/// Invalid crawl configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid scan range: {0}")]
    Range(#[from] RangeError),
}

/// Failures of the external scan workers.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner binary not found: {0}")]
    BinaryMissing(PathBuf),

    #[error("failed to read exclusion file {path}: {source}")]
    ExcludeRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exclusion file {path}, line {line}: {source}")]
    ExcludeParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: RangeError,
    },

    #[error("failed to spawn scanner for {chunk}: {source}")]
    Spawn {
        chunk: String,
        #[source]
        source: std::io::Error,
    },
}

/// Index loading and persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index file {path} is not a valid server list: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
}
