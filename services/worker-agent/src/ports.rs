//! Service port allocation.
//!
//! Picks a free TCP port from the configured range, skipping ports
//! reserved by other locally-serving instances and ports already bound
//! on the host.

use std::collections::HashSet;
use std::net::TcpListener;
use std::str::FromStr;

use thiserror::Error;

/// Inclusive port range for inference servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port available in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("invalid port range: {0}")]
    InvalidRange(String),
}

impl FromStr for PortRange {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortError::InvalidRange(s.to_string()))?;
        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| PortError::InvalidRange(s.to_string()))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| PortError::InvalidRange(s.to_string()))?;
        if start > end {
            return Err(PortError::InvalidRange(s.to_string()));
        }
        Ok(PortRange { start, end })
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Return the first free port in the range that is not in `unavailable`
/// and can be bound on the host.
pub fn allocate_port(range: &PortRange, unavailable: &HashSet<u16>) -> Result<u16, PortError> {
    for port in range.start..=range.end {
        if unavailable.contains(&port) {
            continue;
        }
        // Bind-probe; the listener is dropped immediately.
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(PortError::Exhausted {
        start: range.start,
        end: range.end,
    })
}
