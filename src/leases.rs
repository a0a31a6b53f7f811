//! DHCP lease table and static reservation registry readers.
//!
//! The lease table is a fixed-width text table written by the DHCP server,
//! one record per line: expiry timestamp, MAC, IP, hostname, optional client
//! id. Malformed lines are skipped rather than failing the pass. The
//! registry is the static address-reservation list; membership in it is what
//! separates household devices from guests.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::Result;

/// Hostname placeholder used when the DHCP client did not report one.
pub const UNKNOWN_HOSTNAME: &str = "Unknown";

/// One observed DHCP lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lease expiry as a Unix timestamp.
    pub expires: i64,
    /// Device MAC, normalized to lowercase.
    pub mac: String,
    /// Currently assigned IP. Reassigned by DHCP over time.
    pub ip: Ipv4Addr,
    /// Reported hostname, `"Unknown"` when the client sent `*`.
    pub hostname: String,
    /// Optional DHCP client identifier.
    pub client_id: Option<String>,
}

/// Normalize a MAC address for map keys and registry membership tests.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

fn looks_like_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Parse one lease-table line. Returns `None` for malformed lines.
fn parse_lease_line(line: &str) -> Option<Lease> {
    let mut fields = line.split_whitespace();
    let expires: i64 = fields.next()?.parse().ok()?;
    let mac = normalize_mac(fields.next()?);
    if !looks_like_mac(&mac) {
        return None;
    }
    let ip: Ipv4Addr = fields.next()?.parse().ok()?;
    let hostname = match fields.next()? {
        "*" => UNKNOWN_HOSTNAME.to_string(),
        name => name.to_string(),
    };
    let client_id = fields.next().filter(|c| *c != "*").map(str::to_string);
    Some(Lease {
        expires,
        mac,
        ip,
        hostname,
        client_id,
    })
}

/// Read the current lease table, skipping malformed lines.
pub fn read_leases(path: &Path) -> Result<Vec<Lease>> {
    let raw = std::fs::read_to_string(path)?;
    let mut leases = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_lease_line(line) {
            Some(lease) => leases.push(lease),
            None => tracing::debug!("skipping malformed lease line: {line:?}"),
        }
    }
    Ok(leases)
}

/// The static address-reservation registry, keyed by MAC.
///
/// File format: one `MAC IP hostname` entry per line, `#` comments and blank
/// lines ignored.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    macs: HashSet<String>,
}

impl Registry {
    /// Load the registry from the reservation file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::parse(&raw))
    }

    /// Parse registry content. Lines without a plausible MAC are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut macs = HashSet::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(first) = line.split_whitespace().next() {
                let mac = normalize_mac(first);
                if looks_like_mac(&mac) {
                    macs.insert(mac);
                } else {
                    tracing::debug!("skipping malformed registry line: {line:?}");
                }
            }
        }
        Self { macs }
    }

    /// Membership test: is this MAC a registered household device?
    pub fn is_registered(&self, mac: &str) -> bool {
        self.macs.contains(&normalize_mac(mac))
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.macs.len()
    }

    /// True when no reservations are present.
    pub fn is_empty(&self) -> bool {
        self.macs.is_empty()
    }
}
