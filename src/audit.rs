//! Bounded activity and operation logs.
//!
//! The activity log is a short human-readable trail of what a pass did. The
//! operation log records every kernel rule add/remove with before/after rule
//! counts, enough to replay a pass when a device ends up in the wrong lane.
//! Both are capped ring buffers so a long-running daemon cannot grow them
//! without bound.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::config;
use crate::kernel::RuleCounts;
use crate::policy::unix_timestamp;

/// One activity-log line.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: i64,
    pub message: String,
}

/// One kernel mutation with its surrounding rule counts.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEntry {
    pub timestamp: i64,
    /// Operation name, e.g. `guest.install_filter`.
    pub operation: String,
    /// Device or rule the operation targeted.
    pub target: String,
    pub before: RuleCounts,
    pub after: RuleCounts,
    pub ok: bool,
}

/// Bounded append-only log shared across pass triggers.
#[derive(Debug)]
pub struct AuditLog {
    activity: Mutex<VecDeque<ActivityEntry>>,
    operations: Mutex<VecDeque<OperationEntry>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            activity: Mutex::new(VecDeque::with_capacity(config::ACTIVITY_LOG_CAPACITY)),
            operations: Mutex::new(VecDeque::with_capacity(config::OPERATION_LOG_CAPACITY)),
        }
    }

    /// Append one activity line, evicting the oldest entry at capacity.
    pub fn activity(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        let mut log = self.activity.lock().unwrap();
        if log.len() == config::ACTIVITY_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(ActivityEntry {
            timestamp: unix_timestamp(),
            message,
        });
    }

    /// Record one kernel mutation with before/after counts.
    pub fn operation(
        &self,
        operation: impl Into<String>,
        target: impl Into<String>,
        before: RuleCounts,
        after: RuleCounts,
        ok: bool,
    ) {
        let entry = OperationEntry {
            timestamp: unix_timestamp(),
            operation: operation.into(),
            target: target.into(),
            before,
            after,
            ok,
        };
        tracing::debug!(
            "op {} target={} filters {}->{} marks {}->{} dns {}->{} ok={}",
            entry.operation,
            entry.target,
            before.filters,
            after.filters,
            before.marks,
            after.marks,
            before.dns_redirects,
            after.dns_redirects,
            ok
        );
        let mut log = self.operations.lock().unwrap();
        if log.len() == config::OPERATION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Most recent activity entries, oldest first.
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityEntry> {
        let log = self.activity.lock().unwrap();
        log.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Most recent operation entries, oldest first.
    pub fn recent_operations(&self, limit: usize) -> Vec<OperationEntry> {
        let log = self.operations.lock().unwrap();
        log.iter().rev().take(limit).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_entries_in_order() {
        let log = AuditLog::new();
        log.activity("first");
        log.activity("second");

        let recent = log.recent_activity(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "first");
        assert_eq!(recent[1].message, "second");
    }

    #[test]
    fn test_activity_log_is_bounded() {
        let log = AuditLog::new();
        for i in 0..(config::ACTIVITY_LOG_CAPACITY + 10) {
            log.activity(format!("entry {i}"));
        }
        let recent = log.recent_activity(usize::MAX);
        assert_eq!(recent.len(), config::ACTIVITY_LOG_CAPACITY);
        // The oldest ten entries were evicted.
        assert_eq!(recent[0].message, "entry 10");
    }

    #[test]
    fn test_operation_records_counts() {
        let log = AuditLog::new();
        let before = RuleCounts {
            filters: 1,
            marks: 0,
            dns_redirects: 0,
        };
        let after = RuleCounts {
            filters: 2,
            marks: 0,
            dns_redirects: 0,
        };
        log.operation("guest.install_filter", "192.168.1.50", before, after, true);

        let ops = log.recent_operations(10);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, "guest.install_filter");
        assert_eq!(ops[0].target, "192.168.1.50");
        assert_eq!(ops[0].before.filters, 1);
        assert_eq!(ops[0].after.filters, 2);
        assert!(ops[0].ok);
    }

    #[test]
    fn test_recent_limit_returns_newest() {
        let log = AuditLog::new();
        log.activity("a");
        log.activity("b");
        log.activity("c");
        let recent = log.recent_activity(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "b");
        assert_eq!(recent[1].message, "c");
    }
}
