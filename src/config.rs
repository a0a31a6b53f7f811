//! Runtime constants and the household settings document.
//!
//! All tunable intervals and kernel identifiers are collected here so they
//! can be found and adjusted in a single place rather than scattered across
//! modules. `Settings` is the small persisted JSON document described by the
//! household provisioning flow; interface names and rates are configuration,
//! never hardcoded assumptions about the deployment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Delay after a lease-table change notification before the file is read,
/// to avoid reading a lease file mid-write (seconds).
pub const LEASE_DEBOUNCE_SECS: u64 = 3;

/// Connect timeout for control-plane HTTP calls (seconds).
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Read timeout for control-plane HTTP calls (seconds).
pub const HTTP_READ_TIMEOUT_SECS: u64 = 30;

/// Scheduled reconciliation interval when the settings document does not
/// specify one (seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Packet mark steering traffic to the fast lane.
pub const FAST_MARK: u32 = 0x1;

/// DNS port redirected for filtered devices.
pub const DNS_PORT: u16 = 53;

/// Root of the per-interface rate-limiting hierarchy.
pub const ROOT_CLASS: &str = "1:";

/// Kernel class id of the fast lane (htb default target).
pub const FAST_CLASS: &str = "1:10";

/// Kernel class id of the slow lane.
pub const SLOW_CLASS: &str = "1:20";

/// Kernel class id of the guest lane.
pub const GUEST_CLASS: &str = "1:30";

/// Maximum retained entries in the bounded activity log.
pub const ACTIVITY_LOG_CAPACITY: usize = 256;

/// Maximum retained entries in the detailed operation log.
pub const OPERATION_LOG_CAPACITY: usize = 1024;

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/lanekeeper.lock")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/lanekeeper/state.json")
}

/// Household configuration loaded from a small key-value JSON document.
///
/// Written once by the provisioning flow and read at the start of every
/// invocation. A missing or unreadable document is `ConfigurationMissing`
/// and terminates the process before any kernel mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Policy scope identifier used to query the remote control plane.
    pub household_id: String,
    /// Base URL of the control plane, e.g. `https://controlplane.example`.
    pub server_url: String,

    /// Fast-lane guaranteed rate, in tc rate syntax (e.g. `90mbit`).
    pub fast_rate: String,
    /// Fast-lane ceiling.
    pub fast_ceil: String,
    /// Slow-lane guaranteed rate.
    pub slow_rate: String,
    /// Slow-lane ceiling.
    pub slow_ceil: String,
    /// Guest-lane guaranteed rate.
    pub guest_rate: String,
    /// Guest-lane ceiling.
    pub guest_ceil: String,

    /// Scheduled reconciliation interval (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// LAN-side interface carrying the lane hierarchy (e.g. `br-lan`).
    pub lan_ifname: String,
    /// WAN-side interface carrying the lane hierarchy (e.g. `eth0`).
    pub wan_ifname: String,

    /// Filtering resolver that port-53 traffic is redirected to.
    pub dns_resolver: Ipv4Addr,

    /// DHCP lease table path.
    pub lease_file: PathBuf,
    /// Static address-reservation registry path.
    pub registry_file: PathBuf,
    /// Cross-process lock path guarding kernel-state mutation.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Persisted session state (handle cache, notified guests).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Settings {
    /// Load settings from the given JSON document.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigurationMissing(format!(
                "required configuration {} not readable: {e}",
                path.display()
            ))
        })?;
        let settings: Settings = serde_json::from_str(&raw).map_err(|e| {
            Error::ConfigurationMissing(format!(
                "configuration {} is not valid JSON: {e}",
                path.display()
            ))
        })?;
        if settings.household_id.trim().is_empty() {
            return Err(Error::ConfigurationMissing(
                "household_id must not be empty".into(),
            ));
        }
        if settings.server_url.trim().is_empty() {
            return Err(Error::ConfigurationMissing(
                "server_url must not be empty".into(),
            ));
        }
        Ok(settings)
    }

    /// Rate/ceiling pairs for the three lanes, in lane order.
    pub fn lane_rates(&self) -> LaneRates {
        LaneRates {
            fast: (self.fast_rate.clone(), self.fast_ceil.clone()),
            slow: (self.slow_rate.clone(), self.slow_ceil.clone()),
            guest: (self.guest_rate.clone(), self.guest_ceil.clone()),
        }
    }
}

/// Rate/ceiling strings for each lane, passed to the kernel backend when the
/// hierarchy is (re)built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneRates {
    pub fast: (String, String),
    pub slow: (String, String),
    pub guest: (String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn sample_settings_json() -> String {
        r#"{
            "household_id": "h-1234",
            "server_url": "https://controlplane.example",
            "fast_rate": "90mbit", "fast_ceil": "100mbit",
            "slow_rate": "5mbit", "slow_ceil": "10mbit",
            "guest_rate": "2mbit", "guest_ceil": "5mbit",
            "lan_ifname": "br-lan",
            "wan_ifname": "eth0",
            "dns_resolver": "192.168.1.1",
            "lease_file": "/tmp/dhcp.leases",
            "registry_file": "/tmp/reservations"
        }"#
        .to_string()
    }

    #[test]
    fn test_load_valid_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_settings_json().as_bytes()).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.household_id, "h-1234");
        assert_eq!(settings.lan_ifname, "br-lan");
        assert_eq!(settings.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(settings.lock_file, PathBuf::from("/var/run/lanekeeper.lock"));
        assert_eq!(settings.dns_resolver, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_load_missing_file_is_configuration_missing() {
        let err = Settings::load(Path::new("/nonexistent/lanekeeper.json")).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationMissing");
    }

    #[test]
    fn test_load_malformed_json_is_configuration_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ household: ").unwrap();
        let err = Settings::load(file.path()).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationMissing");
    }

    #[test]
    fn test_load_empty_household_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = sample_settings_json().replace("h-1234", "  ");
        file.write_all(json.as_bytes()).unwrap();
        let err = Settings::load(file.path()).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationMissing");
    }

    #[test]
    fn test_lane_rates_in_lane_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_settings_json().as_bytes()).unwrap();
        let settings = Settings::load(file.path()).unwrap();

        let rates = settings.lane_rates();
        assert_eq!(rates.fast, ("90mbit".into(), "100mbit".into()));
        assert_eq!(rates.slow, ("5mbit".into(), "10mbit".into()));
        assert_eq!(rates.guest, ("2mbit".into(), "5mbit".into()));
    }
}
