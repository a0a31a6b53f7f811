//! Kernel enforcement port.
//!
//! All privileged traffic-control and firewall operations go through the
//! [`KernelPort`] trait so classification and reconciliation logic never
//! touch the kernel directly:
//! - production: `tc` + `iptables` shell-out with typed output parsing
//!   (`tc` backend)
//! - tests and `--test` dry runs: in-memory rule tables (`memory` backend)

pub mod memory;
pub mod tc;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::classify::Lane;
use crate::config::LaneRates;
use crate::error::Result;

/// Traffic direction relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Traffic toward the device (shaped on the LAN interface).
    Inbound,
    /// Traffic from the device (shaped on the WAN interface).
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "in"),
            Direction::Outbound => write!(f, "out"),
        }
    }
}

/// Opaque kernel-assigned identifier of one classifier rule instance.
///
/// Deleting by handle is the only precise removal the kernel offers; broad
/// pattern deletes risk collateral damage to unrelated rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterHandle(pub String);

impl std::fmt::Display for FilterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One classifier rule as read back from the kernel, in typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub handle: FilterHandle,
    pub ip: Ipv4Addr,
    pub direction: Direction,
    pub lane: Lane,
}

/// Observed drift of one interface's rate-limiting hierarchy.
///
/// Granular on purpose: the repair planner fixes exactly what is missing
/// instead of rebuilding the world. `missing_lanes` and `mark_filter_ok`
/// are only meaningful while `root_ok` holds; a foreign or absent root
/// means the interface needs a rebuild regardless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    /// Managed htb root present with the fast lane as default route.
    pub root_ok: bool,
    /// Lane classes absent from the hierarchy.
    pub missing_lanes: Vec<Lane>,
    /// Base rule routing marked packets to the fast lane is present.
    pub mark_filter_ok: bool,
}

impl InterfaceStatus {
    pub fn healthy(&self) -> bool {
        self.root_ok && self.missing_lanes.is_empty() && self.mark_filter_ok
    }
}

/// Hierarchy drift on both interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyStatus {
    pub lan: InterfaceStatus,
    pub wan: InterfaceStatus,
}

impl TopologyStatus {
    /// True when both interfaces carry the full lane hierarchy.
    pub fn healthy(&self) -> bool {
        self.lan.healthy() && self.wan.healthy()
    }

    pub fn interface(&self, direction: Direction) -> &InterfaceStatus {
        match direction {
            Direction::Inbound => &self.lan,
            Direction::Outbound => &self.wan,
        }
    }
}

/// Rule population counts, recorded before and after every mutation in the
/// operation log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub filters: usize,
    pub marks: usize,
    pub dns_redirects: usize,
}

/// Port to the kernel's traffic-control and firewall tables.
///
/// Implementations are process-wide shared state; methods take `&self` and
/// handle their own interior synchronization. The cross-process pass lock is
/// the caller's responsibility.
pub trait KernelPort: Send + Sync {
    /// Check the lane hierarchy on both interfaces without modifying it.
    fn topology_status(&self) -> Result<TopologyStatus>;

    /// Tear down the hierarchy on both interfaces. Destroys every classifier
    /// filter attached to it.
    fn teardown_topology(&self) -> Result<()>;

    /// Build root plus fast/slow/guest child classes with per-lane queueing,
    /// the mark-to-fast base rule, and the managed firewall chains.
    fn build_topology(&self, rates: &LaneRates) -> Result<()>;

    /// Tear down and recreate the hierarchy on one interface only. Destroys
    /// the classifier filters of that interface's direction; the other
    /// interface is untouched.
    fn rebuild_interface(&self, direction: Direction, rates: &LaneRates) -> Result<()>;

    /// Add one missing lane class and its queueing to an interface whose
    /// root is intact. Leaves existing classes and filters alone.
    fn repair_lane(&self, direction: Direction, lane: Lane, rates: &LaneRates) -> Result<()>;

    /// Reinstall the base rule routing marked packets to the fast lane.
    fn install_mark_filter(&self, direction: Direction) -> Result<()>;

    /// Ensure the managed firewall chains exist and are wired in.
    fn ensure_chains(&self) -> Result<()>;

    /// Is a fast-lane mark rule present for this IP and direction?
    fn has_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<bool>;

    /// Insert a fast-lane mark rule.
    fn add_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()>;

    /// Remove a fast-lane mark rule if present.
    fn remove_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()>;

    /// Remove every managed mark rule.
    fn flush_marks(&self) -> Result<()>;

    /// Install a classifier filter steering `ip` to `lane`, returning the
    /// kernel-assigned handle.
    fn install_filter(&self, ip: Ipv4Addr, direction: Direction, lane: Lane)
        -> Result<FilterHandle>;

    /// Delete one classifier rule by exact handle.
    fn remove_filter(&self, direction: Direction, lane: Lane, handle: &FilterHandle)
        -> Result<()>;

    /// Typed dump of managed classifier rules, optionally restricted to one
    /// lane.
    fn list_filters(&self, lane: Option<Lane>) -> Result<Vec<FilterRule>>;

    /// Is a DNS redirection rule present for this IP?
    fn has_dns_redirect(&self, ip: Ipv4Addr) -> Result<bool>;

    /// Redirect the device's UDP/TCP port-53 traffic to the filtering
    /// resolver.
    fn install_dns_redirect(&self, ip: Ipv4Addr) -> Result<()>;

    /// Remove the device's DNS redirection if present.
    fn remove_dns_redirect(&self, ip: Ipv4Addr) -> Result<()>;

    /// Remove every managed DNS redirection.
    fn flush_dns_redirects(&self) -> Result<()>;

    /// Current managed rule population, for the operation log.
    fn rule_counts(&self) -> Result<RuleCounts>;
}
