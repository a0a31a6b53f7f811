//! Reconciliation passes.
//!
//! A pass converges kernel state onto the desired state: topology first,
//! then managed-device lanes from the control-plane snapshot, then guest
//! detection, then stale-rule cleanup. Every pass runs under the
//! cross-process lock, and every step except topology repair is isolated so
//! one device's failure cannot block the rest.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::{ActivityEntry, AuditLog};
use crate::classify::{classify, DnsPosture, Lane};
use crate::config::Settings;
use crate::enforce::{Enforcer, GuestHandles};
use crate::error::{Error, Result};
use crate::guest::{self, GuestSummary, NotificationLedger};
use crate::kernel::{KernelPort, RuleCounts, TopologyStatus};
use crate::leases::{read_leases, Lease, Registry};
use crate::lock::PassLock;
use crate::policy::{ControlPlane, DeviceControl, HttpControlPlane};
use crate::stale::clean_stale_guests;
use crate::topology::ensure_topology;

/// Session state persisted between invocations: the guest filter-handle
/// cache and the set of already-notified guests.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    #[serde(default)]
    handles: HashMap<String, GuestHandles>,
    #[serde(default)]
    notified: Vec<String>,
}

impl SessionState {
    fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                // Corrupt state just means a cold cache; start over.
                tracing::warn!("discarding unreadable session state {}: {e}", path.display());
                Self::default()
            }
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// What a reconciliation pass accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub topology_rebuilt: bool,
    /// Registered devices whose lane and DNS posture were applied.
    pub managed: usize,
    pub managed_failures: usize,
    /// False when the desired-state fetch failed and managed enforcement
    /// was skipped.
    pub upstream_ok: bool,
    pub guests: GuestSummary,
    pub stale_removed: usize,
}

/// Wakeup reasons for the daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    LeaseChange,
}

/// Point-in-time report for the status command.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub topology: TopologyStatus,
    pub rule_counts: RuleCounts,
    pub fast_filters: usize,
    pub slow_filters: usize,
    pub guest_filters: usize,
    pub cached_guests: usize,
    pub notified_guests: usize,
    pub recent_activity: Vec<ActivityEntry>,
}

/// One household's reconciliation session: configuration, kernel port,
/// control plane, and the caches that survive between passes.
pub struct Session {
    settings: Settings,
    kernel: Arc<dyn KernelPort>,
    plane: Arc<dyn ControlPlane>,
    enforcer: Enforcer,
    ledger: NotificationLedger,
    audit: Arc<AuditLog>,
}

impl Session {
    /// Production session: tc/iptables kernel port and HTTP control plane.
    pub fn new(settings: Settings) -> Result<Self> {
        let kernel: Arc<dyn KernelPort> = Arc::new(crate::kernel::tc::TcKernel::new(
            &settings.lan_ifname,
            &settings.wan_ifname,
            settings.dns_resolver,
        ));
        let plane: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
            &settings.server_url,
            &settings.household_id,
        )?);
        Ok(Self::with_parts(settings, kernel, plane))
    }

    /// Session over explicit ports. Used by the dry-run command and tests.
    pub fn with_parts(
        settings: Settings,
        kernel: Arc<dyn KernelPort>,
        plane: Arc<dyn ControlPlane>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new());
        let enforcer = Enforcer::new(Arc::clone(&kernel), Arc::clone(&audit));
        let ledger = NotificationLedger::new();

        let state = SessionState::load(&settings.state_file);
        enforcer.restore_cache(state.handles);
        ledger.restore(state.notified);

        Self {
            settings,
            kernel,
            plane,
            enforcer,
            ledger,
            audit,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn persist_state(&self) {
        let state = SessionState {
            handles: self.enforcer.cache_snapshot(),
            notified: self.ledger.snapshot(),
        };
        if let Err(e) = state.save(&self.settings.state_file) {
            tracing::warn!(
                "failed to persist session state {}: {e}",
                self.settings.state_file.display()
            );
        }
    }

    /// Run one full reconciliation pass. `force` rebuilds the topology even
    /// when it looks healthy and ignores the persisted handle cache.
    pub fn run_pass(&self, force: bool) -> Result<PassSummary> {
        let _lock = PassLock::acquire(&self.settings.lock_file)?;
        let mut summary = PassSummary::default();

        if force {
            self.enforcer.clear_cache();
        }

        let outcome = ensure_topology(
            self.kernel.as_ref(),
            &self.settings.lane_rates(),
            force,
            &self.audit,
        )?;
        if outcome.rebuilt {
            // Every cached handle died with the old hierarchy.
            self.enforcer.clear_cache();
        }
        summary.topology_rebuilt = outcome.rebuilt;

        let leases = read_leases(&self.settings.lease_file)?;
        let registry = Registry::load(&self.settings.registry_file)?;

        if outcome.rebuilt {
            self.reassert_displaced(&outcome.displaced_guests, &leases, &registry);
        }

        match self.plane.fetch_device_controls() {
            Ok(controls) => {
                summary.upstream_ok = true;
                let (managed, failures) = self.enforce_managed(&leases, &registry, &controls);
                summary.managed = managed;
                summary.managed_failures = failures;
            }
            Err(e) => {
                // Existing kernel state stays as-is; guests and stale
                // cleanup do not need the control plane.
                tracing::warn!("desired-state fetch failed, keeping current lanes: {e}");
                summary.upstream_ok = false;
            }
        }

        summary.guests = guest::detect_and_enforce(
            &leases,
            &registry,
            &self.enforcer,
            self.plane.as_ref(),
            &self.settings.household_id,
            &self.ledger,
            &self.audit,
        );

        match clean_stale_guests(&self.enforcer, &leases) {
            Ok(removed) => summary.stale_removed = removed,
            Err(e) => tracing::warn!("stale guest cleanup incomplete: {e}"),
        }

        self.persist_state();
        tracing::info!(
            "pass complete: managed={} guests={} notified={} stale_removed={} rebuilt={}",
            summary.managed,
            summary.guests.enforced,
            summary.guests.notified,
            summary.stale_removed,
            summary.topology_rebuilt,
        );
        Ok(summary)
    }

    /// Short pass for lease-table changes: guest detection and stale
    /// cleanup only, no control-plane round trip.
    pub fn guest_pass(&self) -> Result<GuestSummary> {
        let _lock = PassLock::acquire(&self.settings.lock_file)?;

        let leases = read_leases(&self.settings.lease_file)?;
        let registry = Registry::load(&self.settings.registry_file)?;

        let summary = guest::detect_and_enforce(
            &leases,
            &registry,
            &self.enforcer,
            self.plane.as_ref(),
            &self.settings.household_id,
            &self.ledger,
            &self.audit,
        );
        if let Err(e) = clean_stale_guests(&self.enforcer, &leases) {
            tracing::warn!("stale guest cleanup incomplete: {e}");
        }

        self.persist_state();
        Ok(summary)
    }

    /// Re-steer guests whose rules a topology rebuild destroyed. Anything
    /// without a live lease is simply gone; the stale sweep would have
    /// removed it anyway.
    fn reassert_displaced(
        &self,
        displaced: &[crate::kernel::FilterRule],
        leases: &[Lease],
        registry: &Registry,
    ) {
        let mut ips: Vec<Ipv4Addr> = displaced.iter().map(|r| r.ip).collect();
        ips.sort_unstable();
        ips.dedup();
        for ip in ips {
            let Some(lease) = leases.iter().find(|l| l.ip == ip) else {
                tracing::debug!("displaced guest {ip} has no lease, dropping");
                continue;
            };
            if registry.is_registered(&lease.mac) {
                // Was an override; the managed path decides its lane now.
                continue;
            }
            if let Err(e) = self.enforcer.apply_guest(ip, &lease.mac) {
                tracing::warn!("failed to re-assert displaced guest {ip}: {e}");
            }
        }
    }

    /// Apply lane and DNS posture for every registered lease, one device at
    /// a time. Returns (applied, failed).
    fn enforce_managed(
        &self,
        leases: &[Lease],
        registry: &Registry,
        controls: &[DeviceControl],
    ) -> (usize, usize) {
        let by_ip: HashMap<Ipv4Addr, &DeviceControl> =
            controls.iter().map(|c| (c.ip, c)).collect();

        // Newest lease wins when a MAC holds more than one.
        let mut newest: HashMap<&str, &Lease> = HashMap::new();
        for lease in leases {
            if !registry.is_registered(&lease.mac) {
                continue;
            }
            let entry = newest.entry(lease.mac.as_str()).or_insert(lease);
            if lease.expires > entry.expires {
                *entry = lease;
            }
        }

        let mut applied = 0usize;
        let mut failed = 0usize;
        for lease in newest.into_values() {
            let control = by_ip.get(&lease.ip).copied();
            let class = classify(true, control);
            let result = self.apply_managed(lease.ip, class.lane, class.dns);
            match result {
                Ok(()) => {
                    applied += 1;
                    tracing::debug!(
                        "{} ({}) -> {} lane, dns {:?}",
                        lease.ip,
                        lease.mac,
                        class.lane,
                        class.dns
                    );
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!("enforcement for {} ({}) failed: {e}", lease.ip, lease.mac);
                }
            }
        }
        (applied, failed)
    }

    fn apply_managed(&self, ip: Ipv4Addr, lane: Lane, dns: DnsPosture) -> Result<()> {
        match lane {
            Lane::Fast => self.enforcer.apply_fast(ip)?,
            Lane::Slow => self.enforcer.apply_slow(ip)?,
            // Registered devices never classify as guests; the override
            // command steers them through the guest path directly.
            Lane::Guest => {}
        }
        match dns {
            DnsPosture::Filtered => self.enforcer.apply_dns_filter(ip)?,
            DnsPosture::Open => self.enforcer.remove_dns_filter(ip)?,
        }
        Ok(())
    }

    /// Force a single device onto the guest lane, regardless of
    /// registration or entitlement.
    pub fn apply_guest_override(&self, ip: Ipv4Addr) -> Result<()> {
        let _lock = PassLock::acquire(&self.settings.lock_file)?;

        let leases = read_leases(&self.settings.lease_file)?;
        let lease = leases
            .iter()
            .filter(|l| l.ip == ip)
            .max_by_key(|l| l.expires)
            .ok_or_else(|| Error::InvalidInput(format!("no active lease for {ip}")))?;

        self.enforcer.apply_guest(ip, &lease.mac)?;
        self.audit
            .activity(format!("manual guest override for {ip} ({})", lease.mac));
        self.persist_state();
        Ok(())
    }

    /// Tear down everything this process manages: hierarchy, filters,
    /// marks, DNS redirects, caches, and persisted state.
    pub fn reset(&self) -> Result<()> {
        let _lock = PassLock::acquire(&self.settings.lock_file)?;

        self.kernel.teardown_topology()?;
        self.kernel.flush_marks()?;
        self.kernel.flush_dns_redirects()?;
        self.enforcer.clear_cache();

        if self.settings.state_file.exists() {
            std::fs::remove_file(&self.settings.state_file)?;
        }
        self.audit.activity("all managed state removed");
        tracing::info!("reset complete");
        Ok(())
    }

    /// Snapshot current kernel and session state for display.
    pub fn status_report(&self) -> Result<StatusReport> {
        let count = |lane| -> Result<usize> {
            Ok(self.kernel.list_filters(Some(lane))?.len())
        };
        Ok(StatusReport {
            topology: self.kernel.topology_status()?,
            rule_counts: self.kernel.rule_counts()?,
            fast_filters: count(Lane::Fast)?,
            slow_filters: count(Lane::Slow)?,
            guest_filters: count(Lane::Guest)?,
            cached_guests: self.enforcer.cache_snapshot().len(),
            notified_guests: self.ledger.snapshot().len(),
            recent_activity: self.audit.recent_activity(20),
        })
    }

    /// Run forever: scheduled full passes plus short guest passes whenever
    /// the lease table changes. Only fatal errors end the loop.
    pub fn run_daemon(&self, force_first: bool) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel::<()>(1);

        #[cfg(target_os = "linux")]
        {
            if let Err(e) = guest::watcher::spawn(self.settings.lease_file.clone(), tx.clone()) {
                tracing::warn!("lease watcher unavailable, relying on schedule: {e}");
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = &tx;

        let interval = Duration::from_secs(self.settings.poll_interval_secs);
        let mut trigger = Trigger::Scheduled;
        let mut force = force_first;
        loop {
            let result = match trigger {
                Trigger::Scheduled => self.run_pass(force).map(|_| ()),
                Trigger::LeaseChange => self.guest_pass().map(|_| ()),
            };
            force = false;
            if let Err(e) = result {
                if e.is_fatal() && !matches!(e, Error::LockContention(_)) {
                    return Err(e);
                }
                // Another invocation holds the lock, or the pass failed in
                // a recoverable way; the next wakeup retries.
                tracing::warn!("{:?} pass skipped: {e}", trigger);
            }

            trigger = match rx.recv_timeout(interval) {
                Ok(()) => Trigger::LeaseChange,
                Err(mpsc::RecvTimeoutError::Timeout) => Trigger::Scheduled,
                Err(mpsc::RecvTimeoutError::Disconnected) => Trigger::Scheduled,
            };
        }
    }
}
