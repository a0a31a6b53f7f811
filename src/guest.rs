//! Guest detection and notification.
//!
//! Any leased MAC absent from the reservation registry is a guest. Guests
//! get guest-lane enforcement and a single structured notification to the
//! control plane per session. Notification delivery is at-least-once: a
//! failed POST rolls the dedup marker back so the next detection cycle
//! retries, while a device whose enforcement did not verify is never
//! announced at all.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::audit::AuditLog;
use crate::enforce::Enforcer;
use crate::leases::{Lease, Registry};
use crate::policy::{unix_timestamp, ControlPlane, GuestNotification};

/// Per-session `MAC -> notified` markers.
#[derive(Debug, Default)]
pub struct NotificationLedger {
    notified: DashMap<String, ()>,
}

impl NotificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn already_notified(&self, mac: &str) -> bool {
        self.notified.contains_key(mac)
    }

    pub fn mark(&self, mac: &str) {
        self.notified.insert(mac.to_string(), ());
    }

    /// Roll a marker back after a failed delivery.
    pub fn clear(&self, mac: &str) {
        self.notified.remove(mac);
    }

    /// Export markers for session-state persistence.
    pub fn snapshot(&self) -> Vec<String> {
        self.notified.iter().map(|e| e.key().clone()).collect()
    }

    /// Restore previously persisted markers.
    pub fn restore(&self, macs: Vec<String>) {
        for mac in macs {
            self.notified.insert(mac, ());
        }
    }
}

/// Counters from one guest detection cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestSummary {
    /// Unregistered leases seen.
    pub detected: usize,
    /// Guests whose lane enforcement verified.
    pub enforced: usize,
    /// Notifications delivered this cycle.
    pub notified: usize,
    /// Enforcement or delivery failures.
    pub failures: usize,
}

/// Classify unregistered leases as guests, enforce the guest lane, and
/// deliver deduplicated notifications.
///
/// Failures are isolated per device: one guest's enforcement failure never
/// blocks the rest of the lease table.
pub fn detect_and_enforce(
    leases: &[Lease],
    registry: &Registry,
    enforcer: &Enforcer,
    plane: &dyn ControlPlane,
    household_id: &str,
    ledger: &NotificationLedger,
    audit: &AuditLog,
) -> GuestSummary {
    let mut summary = GuestSummary::default();

    // A MAC can briefly hold two leases across a reassignment; enforce only
    // the newest one.
    let mut newest: HashMap<&str, &Lease> = HashMap::new();
    for lease in leases {
        if registry.is_registered(&lease.mac) {
            continue;
        }
        let entry = newest.entry(lease.mac.as_str()).or_insert(lease);
        if lease.expires > entry.expires {
            *entry = lease;
        }
    }

    for lease in newest.into_values() {
        summary.detected += 1;

        if let Err(e) = enforcer.apply_guest(lease.ip, &lease.mac) {
            tracing::warn!("guest enforcement for {} ({}) failed: {e}", lease.ip, lease.mac);
            summary.failures += 1;
            // No notification for a device we could not actually steer.
            continue;
        }
        summary.enforced += 1;

        if ledger.already_notified(&lease.mac) {
            continue;
        }
        ledger.mark(&lease.mac);
        let notification = GuestNotification {
            household_id: household_id.to_string(),
            device_info: lease.hostname.clone(),
            device_ip: lease.ip,
            device_mac: lease.mac.clone(),
            timestamp: unix_timestamp(),
        };
        match plane.notify_guest(&notification) {
            Ok(()) => {
                summary.notified += 1;
                audit.activity(format!(
                    "guest {} ({}) enforced and reported",
                    lease.ip, lease.mac
                ));
            }
            Err(e) => {
                tracing::warn!("guest notification for {} failed: {e}", lease.mac);
                ledger.clear(&lease.mac);
                summary.failures += 1;
            }
        }
    }

    summary
}

/// Lease-table watcher: blocks on filesystem change notifications and sends
/// a debounced trigger whenever the lease file settles after a write.
#[cfg(target_os = "linux")]
pub mod watcher {
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::SyncSender;
    use std::time::Duration;

    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    use crate::config;
    use crate::error::{Error, Result};

    /// Spawn the watcher thread. Sends one unit per settled change burst;
    /// a full trigger queue is fine, the pending trigger covers the change.
    pub fn spawn(lease_file: PathBuf, tx: SyncSender<()>) -> Result<std::thread::JoinHandle<()>> {
        let watch_dir: PathBuf = lease_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::InvalidInput(format!("lease file {} has no parent", lease_file.display()))
            })?;
        let file_name = lease_file
            .file_name()
            .map(std::ffi::OsString::from)
            .ok_or_else(|| {
                Error::InvalidInput(format!("lease file {} has no name", lease_file.display()))
            })?;

        let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
            .map_err(|e| Error::Io(format!("inotify init failed: {e}")))?;
        inotify
            .add_watch(
                &watch_dir,
                AddWatchFlags::IN_CLOSE_WRITE
                    | AddWatchFlags::IN_MOVED_TO
                    | AddWatchFlags::IN_CREATE,
            )
            .map_err(|e| Error::Io(format!("inotify watch on {} failed: {e}", watch_dir.display())))?;

        let handle = std::thread::Builder::new()
            .name("lease-watcher".into())
            .spawn(move || loop {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::error!("lease watcher read failed: {e}");
                        break;
                    }
                };

                let mut lease_changed = false;
                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        // Events may be lost; treat as a change.
                        lease_changed = true;
                        break;
                    }
                    if event.name.as_deref() == Some(file_name.as_os_str()) {
                        lease_changed = true;
                    }
                }
                if !lease_changed {
                    continue;
                }

                // Let the DHCP server finish writing before the table is read.
                std::thread::sleep(Duration::from_secs(config::LEASE_DEBOUNCE_SECS));
                match tx.try_send(()) {
                    Ok(()) => {}
                    Err(std::sync::mpsc::TrySendError::Full(())) => {
                        tracing::debug!("lease trigger already pending");
                    }
                    Err(std::sync::mpsc::TrySendError::Disconnected(())) => break,
                }
            })
            .map_err(|e| Error::Io(format!("failed to spawn lease watcher: {e}")))?;
        Ok(handle)
    }
}
