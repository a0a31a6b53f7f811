//! Lane topology management.
//!
//! Two-phase repair: observe drift per interface, compute a minimal plan,
//! apply it incrementally. A missing lane class or base mark rule is added
//! in place without touching anything else; only an interface whose root is
//! absent or misrouted gets a destructive rebuild, and only that interface's
//! classifier filters are lost. Guest rules on a rebuilt interface are
//! snapshotted first and handed back to the caller for re-assertion; full
//! restoration is best-effort, the guest detection path re-detects anything
//! the snapshot missed on its next cycle.

use crate::audit::AuditLog;
use crate::classify::Lane;
use crate::config::LaneRates;
use crate::error::Result;
use crate::kernel::{Direction, FilterRule, KernelPort, TopologyStatus};

/// One repair action from the drift plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    /// Tear down and recreate one interface's hierarchy. Destroys that
    /// interface's filters.
    RebuildInterface(Direction),
    /// Add one missing lane class and its queueing in place.
    AddLane(Direction, Lane),
    /// Reinstall the base rule routing marked packets to the fast lane.
    InstallMarkFilter(Direction),
}

impl std::fmt::Display for RepairStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairStep::RebuildInterface(d) => write!(f, "rebuild({d})"),
            RepairStep::AddLane(d, lane) => write!(f, "class({d},{lane})"),
            RepairStep::InstallMarkFilter(d) => write!(f, "markfilter({d})"),
        }
    }
}

/// Minimal repair plan for the observed drift. Pure, so plan shape is
/// testable without a kernel.
///
/// `force` escalates both interfaces to a full rebuild.
pub fn plan_repair(status: &TopologyStatus, force: bool) -> Vec<RepairStep> {
    let mut steps = Vec::new();
    for direction in [Direction::Inbound, Direction::Outbound] {
        let iface = status.interface(direction);
        if force || !iface.root_ok {
            steps.push(RepairStep::RebuildInterface(direction));
            continue;
        }
        for lane in &iface.missing_lanes {
            steps.push(RepairStep::AddLane(direction, *lane));
        }
        if !iface.mark_filter_ok {
            steps.push(RepairStep::InstallMarkFilter(direction));
        }
    }
    steps
}

/// What `ensure_topology` did, and what the repair destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyOutcome {
    /// True when at least one interface was torn down and recreated.
    pub rebuilt: bool,
    /// Guest-lane rules lost to an interface rebuild; empty without one.
    /// Advisory: the guest path should re-assert these devices.
    pub displaced_guests: Vec<FilterRule>,
}

impl TopologyOutcome {
    fn intact() -> Self {
        Self {
            rebuilt: false,
            displaced_guests: Vec::new(),
        }
    }
}

/// Converge the three-lane hierarchy on both interfaces by applying the
/// minimal repair plan for the observed drift (or a full rebuild when
/// `force` is set).
///
/// Topology failure is the one error that blocks the entire pass:
/// enforcement against a broken hierarchy is meaningless.
pub fn ensure_topology(
    kernel: &dyn KernelPort,
    rates: &LaneRates,
    force: bool,
    audit: &AuditLog,
) -> Result<TopologyOutcome> {
    let status = kernel.topology_status()?;
    let plan = plan_repair(&status, force);
    if plan.is_empty() {
        tracing::debug!("lane topology intact on both interfaces");
        // Chains can be flushed behind our back; reassert cheaply.
        kernel.ensure_chains()?;
        return Ok(TopologyOutcome::intact());
    }

    let rebuilt_dirs: Vec<Direction> = plan
        .iter()
        .filter_map(|step| match step {
            RepairStep::RebuildInterface(d) => Some(*d),
            _ => None,
        })
        .collect();

    // A rebuild deletes that interface's filters; keep the guest rules for
    // re-assertion and the record.
    let displaced_guests: Vec<FilterRule> = if rebuilt_dirs.is_empty() {
        Vec::new()
    } else {
        kernel
            .list_filters(Some(Lane::Guest))
            .unwrap_or_default()
            .into_iter()
            .filter(|r| rebuilt_dirs.contains(&r.direction))
            .collect()
    };
    if !displaced_guests.is_empty() {
        tracing::warn!(
            "interface rebuild will displace {} guest rule(s)",
            displaced_guests.len()
        );
    }

    let before = kernel.rule_counts().unwrap_or_default();
    for step in &plan {
        tracing::info!("topology repair: {step}");
        match *step {
            RepairStep::RebuildInterface(direction) => {
                kernel.rebuild_interface(direction, rates)?
            }
            RepairStep::AddLane(direction, lane) => kernel.repair_lane(direction, lane, rates)?,
            RepairStep::InstallMarkFilter(direction) => kernel.install_mark_filter(direction)?,
        }
    }
    kernel.ensure_chains()?;
    let after = kernel.rule_counts().unwrap_or_default();

    let plan_text = plan
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    audit.operation("topology.repair", plan_text.as_str(), before, after, true);
    audit.activity(if force {
        "lane topology rebuilt (forced)".to_string()
    } else {
        format!("lane topology repaired: {plan_text}")
    });

    Ok(TopologyOutcome {
        rebuilt: !rebuilt_dirs.is_empty(),
        displaced_guests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::kernel::memory::MemoryKernel;
    use crate::kernel::InterfaceStatus;

    fn rates() -> LaneRates {
        LaneRates {
            fast: ("90mbit".into(), "100mbit".into()),
            slow: ("5mbit".into(), "10mbit".into()),
            guest: ("2mbit".into(), "5mbit".into()),
        }
    }

    fn intact() -> InterfaceStatus {
        InterfaceStatus {
            root_ok: true,
            missing_lanes: Vec::new(),
            mark_filter_ok: true,
        }
    }

    #[test]
    fn test_plan_is_empty_when_healthy() {
        let status = TopologyStatus {
            lan: intact(),
            wan: intact(),
        };
        assert!(plan_repair(&status, false).is_empty());
    }

    #[test]
    fn test_plan_rebuilds_only_the_broken_interface() {
        let status = TopologyStatus {
            lan: intact(),
            wan: InterfaceStatus::default(),
        };
        assert_eq!(
            plan_repair(&status, false),
            vec![RepairStep::RebuildInterface(Direction::Outbound)]
        );
    }

    #[test]
    fn test_plan_adds_missing_pieces_in_place() {
        let status = TopologyStatus {
            lan: InterfaceStatus {
                missing_lanes: vec![Lane::Guest],
                ..intact()
            },
            wan: InterfaceStatus {
                mark_filter_ok: false,
                ..intact()
            },
        };
        assert_eq!(
            plan_repair(&status, false),
            vec![
                RepairStep::AddLane(Direction::Inbound, Lane::Guest),
                RepairStep::InstallMarkFilter(Direction::Outbound),
            ]
        );
    }

    #[test]
    fn test_force_escalates_to_full_rebuild() {
        let status = TopologyStatus {
            lan: intact(),
            wan: intact(),
        };
        assert_eq!(
            plan_repair(&status, true),
            vec![
                RepairStep::RebuildInterface(Direction::Inbound),
                RepairStep::RebuildInterface(Direction::Outbound),
            ]
        );
    }

    #[test]
    fn test_ensure_topology_builds_from_scratch() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();

        let outcome = ensure_topology(&kernel, &rates(), false, &audit).unwrap();
        assert!(outcome.rebuilt);
        assert!(outcome.displaced_guests.is_empty());
        assert!(kernel.topology_status().unwrap().healthy());
        assert_eq!(kernel.built_rates(), Some(rates()));
    }

    #[test]
    fn test_ensure_topology_is_a_noop_when_healthy() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();
        ensure_topology(&kernel, &rates(), false, &audit).unwrap();

        let outcome = ensure_topology(&kernel, &rates(), false, &audit).unwrap();
        assert!(!outcome.rebuilt);
    }

    #[test]
    fn test_missing_lane_is_repaired_without_displacing_filters() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();
        ensure_topology(&kernel, &rates(), false, &audit).unwrap();
        kernel
            .install_filter(
                Ipv4Addr::new(192, 168, 1, 50),
                Direction::Inbound,
                Lane::Guest,
            )
            .unwrap();

        kernel.drop_lane_class(Direction::Inbound, Lane::Slow);
        let outcome = ensure_topology(&kernel, &rates(), false, &audit).unwrap();

        assert!(!outcome.rebuilt);
        assert!(outcome.displaced_guests.is_empty());
        assert!(kernel.topology_status().unwrap().healthy());
        assert_eq!(kernel.list_filters(None).unwrap().len(), 1);
    }

    #[test]
    fn test_broken_root_rebuild_reports_displaced_guests_only_for_that_interface() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();
        ensure_topology(&kernel, &rates(), false, &audit).unwrap();
        kernel
            .install_filter(
                Ipv4Addr::new(192, 168, 1, 50),
                Direction::Inbound,
                Lane::Guest,
            )
            .unwrap();
        kernel
            .install_filter(
                Ipv4Addr::new(192, 168, 1, 50),
                Direction::Outbound,
                Lane::Guest,
            )
            .unwrap();

        kernel.break_topology();
        let outcome = ensure_topology(&kernel, &rates(), false, &audit).unwrap();

        assert!(outcome.rebuilt);
        // break_topology already destroyed the outbound rules with the
        // root; only the inbound filter survives, and it is not displaced.
        assert!(outcome.displaced_guests.is_empty());
        assert_eq!(kernel.list_filters(None).unwrap().len(), 1);
        assert!(kernel.topology_status().unwrap().healthy());
    }

    #[test]
    fn test_forced_rebuild_reports_all_guest_rules_as_displaced() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();
        ensure_topology(&kernel, &rates(), false, &audit).unwrap();
        for direction in [Direction::Inbound, Direction::Outbound] {
            kernel
                .install_filter(Ipv4Addr::new(192, 168, 1, 50), direction, Lane::Guest)
                .unwrap();
        }

        let outcome = ensure_topology(&kernel, &rates(), true, &audit).unwrap();
        assert!(outcome.rebuilt);
        assert_eq!(outcome.displaced_guests.len(), 2);
        assert!(kernel.list_filters(None).unwrap().is_empty());
    }

    #[test]
    fn test_repair_is_recorded_in_the_operation_log() {
        let kernel = MemoryKernel::new();
        let audit = AuditLog::new();
        ensure_topology(&kernel, &rates(), false, &audit).unwrap();

        let ops = audit.recent_operations(10);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, "topology.repair");
        assert!(ops[0].target.contains("rebuild(in)"));
        assert!(ops[0].ok);
    }
}
