use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::RangeError;

/// An inclusive slice of the IPv4 space handed to one scan worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressChunk {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressChunk {
    /// Number of addresses covered, `end` included.
    pub fn address_count(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        u32::from(self.start) <= n && n <= u32::from(self.end)
    }
}

/// Renders in the `start-end` form masscan takes as a target.
impl fmt::Display for AddressChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parse a target range: `a.b.c.d-e.f.g.h`, a CIDR such as `0.0.0.0/0`, or a single address.
pub fn parse_range(s: &str) -> Result<AddressChunk, RangeError> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let start = parse_ipv4(a)?;
        let end = parse_ipv4(b)?;
        if start > end {
            return Err(RangeError::Reversed {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        return Ok(AddressChunk { start, end });
    }
    if s.contains('/') {
        let net: Ipv4Net = s
            .parse()
            .map_err(|_| RangeError::InvalidCidr(s.to_string()))?;
        return Ok(AddressChunk {
            start: net.network(),
            end: net.broadcast(),
        });
    }
    let ip = parse_ipv4(s)?;
    Ok(AddressChunk { start: ip, end: ip })
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr, RangeError> {
    s.trim()
        .parse()
        .map_err(|_| RangeError::InvalidAddress(s.trim().to_string()))
}

/// Split `range` into at most `n` contiguous, non-overlapping chunks.
///
/// Every chunk but the last holds `ceil(total / n)` addresses; the last one takes
/// whatever remains. When the range has fewer addresses than `n`, fewer chunks
/// come back rather than empty or inverted ones.
pub fn split_range(range: AddressChunk, n: usize) -> Result<Vec<AddressChunk>, RangeError> {
    if n == 0 {
        return Err(RangeError::ZeroChunks);
    }
    let start = u64::from(u32::from(range.start));
    let end = u64::from(u32::from(range.end));
    let total = end - start + 1;
    let count = (n as u64).min(total);
    let chunk_size = total.div_ceil(count);

    let mut chunks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let chunk_start = start + i * chunk_size;
        if chunk_start > end {
            break;
        }
        let chunk_end = (chunk_start + chunk_size - 1).min(end);
        // Both bounds are <= `end`, which came from a u32.
        chunks.push(AddressChunk {
            start: Ipv4Addr::from(chunk_start as u32),
            end: Ipv4Addr::from(chunk_end as u32),
        });
    }
    Ok(chunks)
}
