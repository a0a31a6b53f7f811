//! Enforcement engine.
//!
//! Converts a classification decision into concrete kernel operations and
//! verifies each change took effect. Fast-lane marking and slow-lane
//! explicit filters are mutually exclusive per IP; guest filters are tracked
//! in a MAC-keyed handle cache so the prior rule can be deleted by exact
//! handle instead of re-scanning kernel state every pass.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::classify::Lane;
use crate::error::{Error, Result};
use crate::kernel::{Direction, FilterHandle, KernelPort, RuleCounts};

/// Cached guest-filter handles for one device, both directions.
///
/// Invalidated whenever the device's IP changes or its lease disappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestHandles {
    pub ip: Ipv4Addr,
    pub inbound: FilterHandle,
    pub outbound: FilterHandle,
}

/// Applies lane and DNS decisions through the kernel port.
pub struct Enforcer {
    kernel: Arc<dyn KernelPort>,
    handles: DashMap<String, GuestHandles>,
    audit: Arc<AuditLog>,
}

impl Enforcer {
    pub fn new(kernel: Arc<dyn KernelPort>, audit: Arc<AuditLog>) -> Self {
        Self {
            kernel,
            handles: DashMap::new(),
            audit,
        }
    }

    pub(crate) fn kernel(&self) -> &dyn KernelPort {
        self.kernel.as_ref()
    }

    /// Export the handle cache for session-state persistence.
    pub fn cache_snapshot(&self) -> HashMap<String, GuestHandles> {
        self.handles
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Restore a previously persisted handle cache.
    pub fn restore_cache(&self, cache: HashMap<String, GuestHandles>) {
        for (mac, entry) in cache {
            self.handles.insert(mac, entry);
        }
    }

    /// Drop every cache entry. Used by `--force` and after a topology
    /// rebuild, which destroys all filters along with their handles.
    pub fn clear_cache(&self) {
        self.handles.clear();
    }

    /// Drop cache entries bound to an IP whose rule has been removed.
    pub(crate) fn forget_ip(&self, ip: Ipv4Addr) {
        self.handles.retain(|_, entry| entry.ip != ip);
    }

    fn counts(&self) -> RuleCounts {
        self.kernel.rule_counts().unwrap_or_default()
    }

    /// Idempotently ensure fast-lane marking for `ip` in both directions.
    ///
    /// Any conflicting slow-lane explicit filter is removed first so the two
    /// steering mechanisms never overlap for one IP.
    pub fn apply_fast(&self, ip: Ipv4Addr) -> Result<()> {
        let before = self.counts();

        for rule in self.kernel.list_filters(Some(Lane::Slow))? {
            if rule.ip == ip {
                self.kernel
                    .remove_filter(rule.direction, Lane::Slow, &rule.handle)?;
                tracing::debug!("removed conflicting slow filter {} for {ip}", rule.handle);
            }
        }

        let mut changed = false;
        for direction in [Direction::Inbound, Direction::Outbound] {
            if !self.kernel.has_mark(ip, direction)? {
                self.kernel.add_mark(ip, direction)?;
                changed = true;
            }
        }

        if changed {
            self.audit
                .operation("fast.mark", ip.to_string(), before, self.counts(), true);
        }
        Ok(())
    }

    /// Steer `ip` to the slow lane with explicit direction-scoped filters,
    /// removing any fast-lane mark first. Explicit filters are required
    /// because the topology default routes to the fast lane.
    pub fn apply_slow(&self, ip: Ipv4Addr) -> Result<()> {
        let before = self.counts();

        for direction in [Direction::Inbound, Direction::Outbound] {
            if self.kernel.has_mark(ip, direction)? {
                self.kernel.remove_mark(ip, direction)?;
            }
        }

        let existing = self.kernel.list_filters(Some(Lane::Slow))?;
        let mut changed = false;
        for direction in [Direction::Inbound, Direction::Outbound] {
            let present = existing
                .iter()
                .any(|r| r.ip == ip && r.direction == direction);
            if !present {
                self.kernel.install_filter(ip, direction, Lane::Slow)?;
                changed = true;
            }
        }

        if changed {
            self.audit
                .operation("slow.filter", ip.to_string(), before, self.counts(), true);
        }
        Ok(())
    }

    /// Ensure guest-lane filters for `ip`, reusing the cached handles for
    /// `mac` when the rules are still live.
    ///
    /// The prior rule is always deleted by exact handle, never by pattern
    /// match, and the new rule is verified by re-reading kernel state. A
    /// rule that does not verify is an `EnforcementFailure` and must
    /// suppress the device's dependent notification.
    pub fn apply_guest(&self, ip: Ipv4Addr, mac: &str) -> Result<()> {
        let before = self.counts();
        let live = self.kernel.list_filters(Some(Lane::Guest))?;

        let cached = self.handles.get(mac).map(|e| e.value().clone());
        if let Some(entry) = &cached {
            let inbound_live = live
                .iter()
                .any(|r| r.handle == entry.inbound && r.ip == entry.ip);
            let outbound_live = live
                .iter()
                .any(|r| r.handle == entry.outbound && r.ip == entry.ip);
            if entry.ip == ip && inbound_live && outbound_live {
                // Converged: same IP, both rules still present.
                return Ok(());
            }
        }

        // Prior rules to clear: the cached pair, or handles recovered from
        // the dump when the cache has no entry for this MAC.
        let mut stale_handles: Vec<(Direction, FilterHandle)> = Vec::new();
        match cached {
            Some(entry) => {
                stale_handles.push((Direction::Inbound, entry.inbound));
                stale_handles.push((Direction::Outbound, entry.outbound));
            }
            None => {
                for rule in &live {
                    if rule.ip == ip {
                        stale_handles.push((rule.direction, rule.handle.clone()));
                    }
                }
            }
        }
        for (direction, handle) in stale_handles {
            // The handle may already be gone after a topology rebuild.
            if live.iter().any(|r| r.handle == handle) {
                self.kernel.remove_filter(direction, Lane::Guest, &handle)?;
            }
        }

        let inbound = self.kernel.install_filter(ip, Direction::Inbound, Lane::Guest)?;
        let outbound = self
            .kernel
            .install_filter(ip, Direction::Outbound, Lane::Guest)?;

        // Verify against a fresh dump before trusting the handles.
        let verify = self.kernel.list_filters(Some(Lane::Guest))?;
        let verified = verify.iter().any(|r| r.handle == inbound && r.ip == ip)
            && verify.iter().any(|r| r.handle == outbound && r.ip == ip);
        if !verified {
            self.handles.remove(mac);
            self.audit
                .operation("guest.filter", ip.to_string(), before, self.counts(), false);
            return Err(Error::EnforcementFailure(format!(
                "guest filter for {ip} ({mac}) did not verify after install"
            )));
        }

        self.handles.insert(
            mac.to_string(),
            GuestHandles {
                ip,
                inbound,
                outbound,
            },
        );
        self.audit
            .operation("guest.filter", ip.to_string(), before, self.counts(), true);
        Ok(())
    }

    /// Idempotent remove-then-add of the DNS redirection for `ip`.
    pub fn apply_dns_filter(&self, ip: Ipv4Addr) -> Result<()> {
        let before = self.counts();
        self.kernel.remove_dns_redirect(ip)?;
        self.kernel.install_dns_redirect(ip)?;
        self.audit
            .operation("dns.redirect", ip.to_string(), before, self.counts(), true);
        Ok(())
    }

    /// Remove the DNS redirection for `ip` if present.
    pub fn remove_dns_filter(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.kernel.has_dns_redirect(ip)? {
            return Ok(());
        }
        let before = self.counts();
        self.kernel.remove_dns_redirect(ip)?;
        self.audit
            .operation("dns.remove", ip.to_string(), before, self.counts(), true);
        Ok(())
    }
}
