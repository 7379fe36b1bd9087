use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{RangeError, ScanError};
use crate::partition::{parse_range, AddressChunk};

/// Address ranges the crawler must never touch.
///
/// The same file is handed to masscan via `--excludefile`; parsing it here lets
/// startup fail early on a bad file and lets the scheduler drop anything a
/// scanner reports from inside an excluded range anyway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionList {
    ranges: Vec<AddressChunk>,
}

impl ExclusionList {
    pub fn new(ranges: Vec<AddressChunk>) -> Self {
        Self { ranges }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Parse exclusion file content, returning the 1-based line number of the first bad entry.
///
/// Supported formats per line:
/// - single address: `10.0.0.1`
/// - inclusive range: `10.0.0.1-10.0.0.255`
/// - CIDR: `10.0.0.0/8`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_exclusions_str(s: &str) -> Result<ExclusionList, (usize, RangeError)> {
    let mut ranges = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let range = parse_range(line).map_err(|e| (idx + 1, e))?;
        ranges.push(range);
    }
    Ok(ExclusionList { ranges })
}

/// Load the exclusion list from a file. A missing file is an error: masscan refuses it too.
pub fn load_exclusions(path: impl AsRef<Path>) -> Result<ExclusionList, ScanError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ScanError::ExcludeRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_exclusions_str(&content).map_err(|(line, source)| ScanError::ExcludeParse {
        path: path.to_path_buf(),
        line,
        source,
    })
}
