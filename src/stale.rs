//! Stale-state cleanup.
//!
//! Removes guest-lane rules whose IP no longer has a lease. Runs strictly
//! after live devices have been reasserted in the pass; running it earlier
//! could misclassify a just-reassigned device's old rule as stale while the
//! device is mid-move.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::classify::Lane;
use crate::enforce::Enforcer;
use crate::error::Result;
use crate::leases::Lease;

/// Delete guest-lane rules with no corresponding lease. Returns the number
/// of rules removed.
pub fn clean_stale_guests(enforcer: &Enforcer, leases: &[Lease]) -> Result<usize> {
    let leased: HashSet<Ipv4Addr> = leases.iter().map(|l| l.ip).collect();

    let mut removed = 0;
    for rule in enforcer.kernel().list_filters(Some(Lane::Guest))? {
        if leased.contains(&rule.ip) {
            continue;
        }
        enforcer
            .kernel()
            .remove_filter(rule.direction, Lane::Guest, &rule.handle)?;
        enforcer.forget_ip(rule.ip);
        tracing::info!(
            "removed stale guest rule {} for {} ({})",
            rule.handle,
            rule.ip,
            rule.direction
        );
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::audit::AuditLog;
    use crate::config::LaneRates;
    use crate::kernel::memory::MemoryKernel;
    use crate::kernel::KernelPort;

    fn rates() -> LaneRates {
        LaneRates {
            fast: ("90mbit".into(), "100mbit".into()),
            slow: ("5mbit".into(), "10mbit".into()),
            guest: ("2mbit".into(), "5mbit".into()),
        }
    }

    fn lease(mac: &str, ip: Ipv4Addr) -> Lease {
        Lease {
            expires: 1700000000,
            mac: mac.to_string(),
            ip,
            hostname: "device".to_string(),
            client_id: None,
        }
    }

    fn setup() -> (Arc<MemoryKernel>, Enforcer) {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.build_topology(&rates()).unwrap();
        let enforcer = Enforcer::new(
            Arc::clone(&kernel) as Arc<dyn KernelPort>,
            Arc::new(AuditLog::new()),
        );
        (kernel, enforcer)
    }

    #[test]
    fn test_departed_guest_rules_are_removed() {
        let (kernel, enforcer) = setup();
        let present = Ipv4Addr::new(192, 168, 1, 50);
        let departed = Ipv4Addr::new(192, 168, 1, 60);
        enforcer.apply_guest(present, "aa:bb:cc:dd:ee:ff").unwrap();
        enforcer.apply_guest(departed, "11:22:33:44:55:66").unwrap();

        let leases = vec![lease("aa:bb:cc:dd:ee:ff", present)];
        let removed = clean_stale_guests(&enforcer, &leases).unwrap();
        assert_eq!(removed, 2);

        let remaining = kernel.list_filters(Some(Lane::Guest)).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.ip == present));
        assert!(!enforcer.cache_snapshot().contains_key("11:22:33:44:55:66"));
    }

    #[test]
    fn test_live_guests_are_untouched() {
        let (kernel, enforcer) = setup();
        let ip = Ipv4Addr::new(192, 168, 1, 50);
        enforcer.apply_guest(ip, "aa:bb:cc:dd:ee:ff").unwrap();

        let removed =
            clean_stale_guests(&enforcer, &[lease("aa:bb:cc:dd:ee:ff", ip)]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(kernel.list_filters(Some(Lane::Guest)).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_lease_table_clears_all_guest_rules() {
        let (kernel, enforcer) = setup();
        enforcer
            .apply_guest(Ipv4Addr::new(192, 168, 1, 50), "aa:bb:cc:dd:ee:ff")
            .unwrap();

        let removed = clean_stale_guests(&enforcer, &[]).unwrap();
        assert_eq!(removed, 2);
        assert!(kernel.list_filters(Some(Lane::Guest)).unwrap().is_empty());
        assert!(enforcer.cache_snapshot().is_empty());
    }

    #[test]
    fn test_non_guest_rules_are_ignored() {
        let (kernel, enforcer) = setup();
        enforcer.apply_slow(Ipv4Addr::new(192, 168, 1, 10)).unwrap();

        let removed = clean_stale_guests(&enforcer, &[]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(kernel.list_filters(Some(Lane::Slow)).unwrap().len(), 2);
    }
}
