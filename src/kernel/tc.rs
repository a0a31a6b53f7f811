//! Production kernel backend over `tc` and `iptables`.
//!
//! Shapes inbound traffic on the LAN interface (matching destination
//! address) and outbound traffic on the WAN interface (matching source
//! address). Mark and DNS-redirect rules live in dedicated `LANEKEEPER`
//! chains so flushing managed state never touches unrelated firewall rules.
//! Tool output is parsed into typed records; handle recovery is an explicit
//! mapping from the structured dump, not regex extraction.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;

use crate::classify::Lane;
use crate::config::{self, LaneRates};
use crate::error::{Error, Result};

use super::{
    Direction, FilterHandle, FilterRule, InterfaceStatus, KernelPort, RuleCounts, TopologyStatus,
};

/// Managed mangle-table chain holding fast-lane mark rules.
const MARK_CHAIN: &str = "LANEKEEPER";

/// Managed nat-table chain holding DNS redirection rules.
const DNS_CHAIN: &str = "LANEKEEPER_DNS";

/// `tc filter` priority of explicit slow-lane filters.
const SLOW_PRIO: &str = "5";

/// `tc filter` priority of guest-lane filters.
const GUEST_PRIO: &str = "7";

/// Priority of the base fw rule routing marked packets to the fast lane.
const MARK_PRIO: &str = "1";

/// Kernel port shelling out to `tc` and `iptables`.
#[derive(Debug, Clone)]
pub struct TcKernel {
    lan_ifname: String,
    wan_ifname: String,
    dns_resolver: Ipv4Addr,
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Io(format!("failed to spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::EnforcementFailure(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a probe command whose exit status is the answer (`iptables -C`).
fn probe(program: &str, args: &[&str]) -> Result<bool> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Io(format!("failed to spawn {program}: {e}")))?;
    Ok(output.status.success())
}

fn lane_prio(lane: Lane) -> &'static str {
    match lane {
        Lane::Slow => SLOW_PRIO,
        // Fast steering is the mark rule, never an explicit per-IP filter.
        Lane::Fast => MARK_PRIO,
        Lane::Guest => GUEST_PRIO,
    }
}

fn lane_for_flowid(flowid: &str) -> Option<Lane> {
    match flowid {
        config::FAST_CLASS => Some(Lane::Fast),
        config::SLOW_CLASS => Some(Lane::Slow),
        config::GUEST_CLASS => Some(Lane::Guest),
        _ => None,
    }
}

/// Leaf qdisc handle of a lane's sfq.
fn lane_qdisc_handle(lane: Lane) -> &'static str {
    match lane {
        Lane::Fast => "10:",
        Lane::Slow => "20:",
        Lane::Guest => "30:",
    }
}

fn lane_rate(rates: &LaneRates, lane: Lane) -> &(String, String) {
    match lane {
        Lane::Fast => &rates.fast,
        Lane::Slow => &rates.slow,
        Lane::Guest => &rates.guest,
    }
}

/// True when a `tc qdisc show dev X` dump carries the managed htb root with
/// the fast lane as default. iproute2 prints the default id as decimal or
/// hex depending on version.
pub(crate) fn qdisc_is_healthy(dump: &str) -> bool {
    dump.lines().any(|line| {
        line.contains("htb")
            && line.contains(&format!("{} root", config::ROOT_CLASS))
            && (line.contains("default 10") || line.contains("default 0x10"))
    })
}

/// Lane classes absent from a `tc class show dev X` dump.
pub(crate) fn missing_lane_classes(dump: &str) -> Vec<Lane> {
    [Lane::Fast, Lane::Slow, Lane::Guest]
        .into_iter()
        .filter(|lane| {
            !dump
                .lines()
                .any(|line| line.contains(&format!("class htb {} ", lane.class_id())))
        })
        .collect()
}

/// True when a `tc filter show` dump carries the base fw rule steering
/// marked packets to the fast lane.
pub(crate) fn mark_filter_present(dump: &str) -> bool {
    dump.lines().any(|line| {
        line.contains(" fw ")
            && (line.contains(&format!("classid {}", config::FAST_CLASS))
                || line.contains(&format!("flowid {}", config::FAST_CLASS)))
    })
}

/// Parse a `tc filter show` dump into typed rules for one direction.
///
/// Filter descriptor lines carry the handle (`fh 800::800`) and target
/// (`flowid 1:30`); the address follows on a continuation line as
/// `match c0a80132/ffffffff at 12|16` (offset 12 = source, 16 =
/// destination).
pub(crate) fn parse_filter_dump(dump: &str, direction: Direction) -> Vec<FilterRule> {
    let mut rules = Vec::new();
    let mut pending: Option<(FilterHandle, Lane)> = None;

    for line in dump.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if line.trim_start().starts_with("filter") {
            let fh = tokens
                .iter()
                .position(|t| *t == "fh")
                .and_then(|i| tokens.get(i + 1));
            let flowid = tokens
                .iter()
                .position(|t| *t == "flowid")
                .and_then(|i| tokens.get(i + 1));
            pending = match (fh, flowid) {
                // Hash-table header lines ("fh 800:") carry no flowid.
                (Some(fh), Some(flowid)) => {
                    lane_for_flowid(flowid).map(|lane| (FilterHandle(fh.to_string()), lane))
                }
                _ => None,
            };
            continue;
        }

        if let Some(match_pos) = tokens.iter().position(|t| *t == "match") {
            let Some((handle, lane)) = pending.clone() else {
                continue;
            };
            let Some(selector) = tokens.get(match_pos + 1) else {
                continue;
            };
            let Some(hex) = selector.split('/').next() else {
                continue;
            };
            if let Ok(addr) = u32::from_str_radix(hex, 16) {
                rules.push(FilterRule {
                    handle,
                    ip: Ipv4Addr::from(addr),
                    direction,
                    lane,
                });
                pending = None;
            }
        }
    }
    rules
}

impl TcKernel {
    pub fn new(lan_ifname: &str, wan_ifname: &str, dns_resolver: Ipv4Addr) -> Self {
        Self {
            lan_ifname: lan_ifname.to_string(),
            wan_ifname: wan_ifname.to_string(),
            dns_resolver,
        }
    }

    fn ifname(&self, direction: Direction) -> &str {
        match direction {
            Direction::Inbound => &self.lan_ifname,
            Direction::Outbound => &self.wan_ifname,
        }
    }

    /// Address selector for mark/filter rules: inbound matches the device as
    /// destination, outbound as source.
    fn match_side(direction: Direction) -> &'static str {
        match direction {
            Direction::Inbound => "dst",
            Direction::Outbound => "src",
        }
    }

    fn iface_status(&self, ifname: &str) -> Result<InterfaceStatus> {
        let qdisc = run("tc", &["qdisc", "show", "dev", ifname])?;
        if !qdisc_is_healthy(&qdisc) {
            return Ok(InterfaceStatus::default());
        }
        let classes = run("tc", &["class", "show", "dev", ifname])?;
        let filters = run(
            "tc",
            &["filter", "show", "dev", ifname, "parent", config::ROOT_CLASS],
        )?;
        Ok(InterfaceStatus {
            root_ok: true,
            missing_lanes: missing_lane_classes(&classes),
            mark_filter_ok: mark_filter_present(&filters),
        })
    }

    fn add_lane(&self, ifname: &str, lane: Lane, rates: &LaneRates) -> Result<()> {
        let (rate, ceil) = lane_rate(rates, lane);
        run(
            "tc",
            &[
                "class", "add", "dev", ifname, "parent", "1:1", "classid", lane.class_id(),
                "htb", "rate", rate, "ceil", ceil,
            ],
        )?;
        run(
            "tc",
            &[
                "qdisc", "add", "dev", ifname, "parent", lane.class_id(), "handle",
                lane_qdisc_handle(lane), "sfq", "perturb", "10",
            ],
        )?;
        Ok(())
    }

    fn add_mark_filter(&self, ifname: &str) -> Result<()> {
        // Base rule: marked packets go to the fast lane.
        run(
            "tc",
            &[
                "filter",
                "add",
                "dev",
                ifname,
                "parent",
                config::ROOT_CLASS,
                "protocol",
                "ip",
                "prio",
                MARK_PRIO,
                "handle",
                &format!("{:#x}", config::FAST_MARK),
                "fw",
                "flowid",
                config::FAST_CLASS,
            ],
        )?;
        Ok(())
    }

    fn build_iface(&self, ifname: &str, rates: &LaneRates) -> Result<()> {
        run(
            "tc",
            &[
                "qdisc", "add", "dev", ifname, "root", "handle", config::ROOT_CLASS, "htb",
                "default", "10",
            ],
        )?;
        run(
            "tc",
            &[
                "class", "add", "dev", ifname, "parent", config::ROOT_CLASS, "classid", "1:1",
                "htb", "rate", &rates.fast.1,
            ],
        )?;
        for lane in [Lane::Fast, Lane::Slow, Lane::Guest] {
            self.add_lane(ifname, lane, rates)?;
        }
        self.add_mark_filter(ifname)
    }

    fn teardown_iface(&self, ifname: &str) {
        // Absent root qdisc is fine; this is reached on first boot too.
        if let Err(e) = run("tc", &["qdisc", "del", "dev", ifname, "root"]) {
            tracing::debug!("qdisc teardown on {ifname}: {e}");
        }
    }

    fn ensure_chain(&self, table: &str, chain: &str) -> Result<()> {
        if !probe("iptables", &["-t", table, "-nL", chain])? {
            run("iptables", &["-t", table, "-N", chain])?;
        }
        if !probe("iptables", &["-t", table, "-C", "PREROUTING", "-j", chain])? {
            run("iptables", &["-t", table, "-A", "PREROUTING", "-j", chain])?;
        }
        Ok(())
    }

    fn mark_rule_args(ip: Ipv4Addr, direction: Direction) -> Vec<String> {
        let side = match direction {
            Direction::Inbound => "-d",
            Direction::Outbound => "-s",
        };
        vec![
            side.to_string(),
            format!("{ip}/32"),
            "-j".to_string(),
            "MARK".to_string(),
            "--set-mark".to_string(),
            format!("{:#x}", config::FAST_MARK),
        ]
    }

    fn dns_rule_args(&self, ip: Ipv4Addr, proto: &str) -> Vec<String> {
        vec![
            "-s".to_string(),
            format!("{ip}/32"),
            "-p".to_string(),
            proto.to_string(),
            "--dport".to_string(),
            config::DNS_PORT.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            self.dns_resolver.to_string(),
        ]
    }

    fn chain_rule_count(&self, table: &str, chain: &str) -> Result<usize> {
        // A missing chain (pre-topology) simply counts as zero rules.
        let output = Command::new("iptables")
            .args(["-t", table, "-S", chain])
            .output()
            .map_err(|e| Error::Io(format!("failed to spawn iptables: {e}")))?;
        if !output.status.success() {
            return Ok(0);
        }
        let listing = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(listing.lines().filter(|l| l.starts_with("-A ")).count())
    }

    fn filters_for(&self, direction: Direction) -> Result<Vec<FilterRule>> {
        let dump = run(
            "tc",
            &[
                "filter",
                "show",
                "dev",
                self.ifname(direction),
                "parent",
                config::ROOT_CLASS,
            ],
        )?;
        Ok(parse_filter_dump(&dump, direction))
    }
}

impl KernelPort for TcKernel {
    fn topology_status(&self) -> Result<TopologyStatus> {
        Ok(TopologyStatus {
            lan: self.iface_status(&self.lan_ifname)?,
            wan: self.iface_status(&self.wan_ifname)?,
        })
    }

    fn teardown_topology(&self) -> Result<()> {
        self.teardown_iface(&self.lan_ifname);
        self.teardown_iface(&self.wan_ifname);
        Ok(())
    }

    fn build_topology(&self, rates: &LaneRates) -> Result<()> {
        self.build_iface(&self.lan_ifname, rates)?;
        self.build_iface(&self.wan_ifname, rates)?;
        self.ensure_chains()
    }

    fn rebuild_interface(&self, direction: Direction, rates: &LaneRates) -> Result<()> {
        let ifname = self.ifname(direction);
        self.teardown_iface(ifname);
        self.build_iface(ifname, rates)
    }

    fn repair_lane(&self, direction: Direction, lane: Lane, rates: &LaneRates) -> Result<()> {
        self.add_lane(self.ifname(direction), lane, rates)
    }

    fn install_mark_filter(&self, direction: Direction) -> Result<()> {
        self.add_mark_filter(self.ifname(direction))
    }

    fn ensure_chains(&self) -> Result<()> {
        self.ensure_chain("mangle", MARK_CHAIN)?;
        self.ensure_chain("nat", DNS_CHAIN)
    }

    fn has_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<bool> {
        let mut args = vec![
            "-t".to_string(),
            "mangle".to_string(),
            "-C".to_string(),
            MARK_CHAIN.to_string(),
        ];
        args.extend(Self::mark_rule_args(ip, direction));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        probe("iptables", &refs)
    }

    fn add_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()> {
        let mut args = vec![
            "-t".to_string(),
            "mangle".to_string(),
            "-A".to_string(),
            MARK_CHAIN.to_string(),
        ];
        args.extend(Self::mark_rule_args(ip, direction));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run("iptables", &refs)?;
        Ok(())
    }

    fn remove_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()> {
        if !self.has_mark(ip, direction)? {
            return Ok(());
        }
        let mut args = vec![
            "-t".to_string(),
            "mangle".to_string(),
            "-D".to_string(),
            MARK_CHAIN.to_string(),
        ];
        args.extend(Self::mark_rule_args(ip, direction));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run("iptables", &refs)?;
        Ok(())
    }

    fn flush_marks(&self) -> Result<()> {
        if probe("iptables", &["-t", "mangle", "-nL", MARK_CHAIN])? {
            run("iptables", &["-t", "mangle", "-F", MARK_CHAIN])?;
        }
        Ok(())
    }

    fn install_filter(
        &self,
        ip: Ipv4Addr,
        direction: Direction,
        lane: Lane,
    ) -> Result<FilterHandle> {
        let known: HashSet<FilterHandle> = self
            .filters_for(direction)?
            .into_iter()
            .map(|f| f.handle)
            .collect();

        let ifname = self.ifname(direction);
        let selector = format!("{ip}/32");
        run(
            "tc",
            &[
                "filter",
                "add",
                "dev",
                ifname,
                "parent",
                config::ROOT_CLASS,
                "protocol",
                "ip",
                "prio",
                lane_prio(lane),
                "u32",
                "match",
                "ip",
                Self::match_side(direction),
                &selector,
                "flowid",
                lane.class_id(),
            ],
        )?;

        // tc does not echo the assigned handle; recover it from the typed
        // dump as the new rule carrying this IP.
        self.filters_for(direction)?
            .into_iter()
            .find(|f| f.ip == ip && f.lane == lane && !known.contains(&f.handle))
            .map(|f| f.handle)
            .ok_or_else(|| {
                Error::EnforcementFailure(format!(
                    "{lane} filter for {ip} ({direction}) did not appear after install"
                ))
            })
    }

    fn remove_filter(
        &self,
        direction: Direction,
        lane: Lane,
        handle: &FilterHandle,
    ) -> Result<()> {
        run(
            "tc",
            &[
                "filter",
                "del",
                "dev",
                self.ifname(direction),
                "parent",
                config::ROOT_CLASS,
                "handle",
                &handle.0,
                "prio",
                lane_prio(lane),
                "protocol",
                "ip",
                "u32",
            ],
        )?;
        Ok(())
    }

    fn list_filters(&self, lane: Option<Lane>) -> Result<Vec<FilterRule>> {
        let mut rules = self.filters_for(Direction::Inbound)?;
        rules.extend(self.filters_for(Direction::Outbound)?);
        Ok(rules
            .into_iter()
            .filter(|f| lane.map_or(true, |l| f.lane == l))
            .collect())
    }

    fn has_dns_redirect(&self, ip: Ipv4Addr) -> Result<bool> {
        let mut args = vec![
            "-t".to_string(),
            "nat".to_string(),
            "-C".to_string(),
            DNS_CHAIN.to_string(),
        ];
        args.extend(self.dns_rule_args(ip, "udp"));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        probe("iptables", &refs)
    }

    fn install_dns_redirect(&self, ip: Ipv4Addr) -> Result<()> {
        for proto in ["udp", "tcp"] {
            let mut args = vec![
                "-t".to_string(),
                "nat".to_string(),
                "-A".to_string(),
                DNS_CHAIN.to_string(),
            ];
            args.extend(self.dns_rule_args(ip, proto));
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            run("iptables", &refs)?;
        }
        Ok(())
    }

    fn remove_dns_redirect(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.has_dns_redirect(ip)? {
            return Ok(());
        }
        for proto in ["udp", "tcp"] {
            let mut args = vec![
                "-t".to_string(),
                "nat".to_string(),
                "-D".to_string(),
                DNS_CHAIN.to_string(),
            ];
            args.extend(self.dns_rule_args(ip, proto));
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = run("iptables", &refs) {
                tracing::debug!("dns redirect removal ({proto}) for {ip}: {e}");
            }
        }
        Ok(())
    }

    fn flush_dns_redirects(&self) -> Result<()> {
        if probe("iptables", &["-t", "nat", "-nL", DNS_CHAIN])? {
            run("iptables", &["-t", "nat", "-F", DNS_CHAIN])?;
        }
        Ok(())
    }

    fn rule_counts(&self) -> Result<RuleCounts> {
        Ok(RuleCounts {
            filters: self.list_filters(None)?.len(),
            marks: self.chain_rule_count("mangle", MARK_CHAIN)?,
            dns_redirects: self.chain_rule_count("nat", DNS_CHAIN)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QDISC_HEALTHY: &str = "\
qdisc htb 1: root refcnt 2 r2q 10 default 0x10 direct_packets_stat 0 direct_qlen 1000
qdisc sfq 10: parent 1:10 limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
qdisc sfq 20: parent 1:20 limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
qdisc sfq 30: parent 1:30 limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
";

    const CLASSES_HEALTHY: &str = "\
class htb 1:1 root rate 100Mbit ceil 100Mbit burst 1600b cburst 1600b
class htb 1:10 parent 1:1 leaf 10: prio 0 rate 90Mbit ceil 100Mbit burst 1600b cburst 1600b
class htb 1:20 parent 1:1 leaf 20: prio 0 rate 5Mbit ceil 10Mbit burst 1600b cburst 1600b
class htb 1:30 parent 1:1 leaf 30: prio 0 rate 2Mbit ceil 5Mbit burst 1600b cburst 1600b
";

    const FILTER_DUMP: &str = "\
filter parent 1: protocol ip pref 1 fw chain 0 handle 0x1 classid 1:10
filter parent 1: protocol ip pref 5 u32 chain 0
filter parent 1: protocol ip pref 5 u32 chain 0 fh 800: ht divisor 1
filter parent 1: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:20 not_in_hw
  match c0a8010a/ffffffff at 16
filter parent 1: protocol ip pref 7 u32 chain 0 fh 800::801 order 2049 key ht 800 bkt 0 flowid 1:30 not_in_hw
  match c0a80132/ffffffff at 16
";

    #[test]
    fn test_qdisc_health_accepts_hex_and_decimal_default() {
        assert!(qdisc_is_healthy(QDISC_HEALTHY));
        assert!(qdisc_is_healthy(
            "qdisc htb 1: root refcnt 2 r2q 10 default 10 direct_packets_stat 0\n"
        ));
    }

    #[test]
    fn test_qdisc_health_rejects_foreign_root() {
        assert!(!qdisc_is_healthy(
            "qdisc fq_codel 0: root refcnt 2 limit 10240p flows 1024\n"
        ));
        assert!(!qdisc_is_healthy(
            "qdisc htb 1: root refcnt 2 r2q 10 default 0x20 direct_packets_stat 0\n"
        ));
        assert!(!qdisc_is_healthy(""));
    }

    #[test]
    fn test_missing_lane_classes_names_exact_gaps() {
        assert!(missing_lane_classes(CLASSES_HEALTHY).is_empty());

        let missing_guest = CLASSES_HEALTHY
            .lines()
            .filter(|l| !l.contains("1:30"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(missing_lane_classes(&missing_guest), vec![Lane::Guest]);

        assert_eq!(
            missing_lane_classes(""),
            vec![Lane::Fast, Lane::Slow, Lane::Guest]
        );
    }

    #[test]
    fn test_mark_filter_present_detects_fw_rule() {
        assert!(mark_filter_present(FILTER_DUMP));
        // u32 per-IP filters alone do not count.
        assert!(!mark_filter_present(
            "filter parent 1: protocol ip pref 5 u32 chain 0 fh 800::800 flowid 1:20\n\
             \tmatch c0a8010a/ffffffff at 16\n"
        ));
        assert!(!mark_filter_present(""));
    }

    #[test]
    fn test_parse_filter_dump_typed_records() {
        let rules = parse_filter_dump(FILTER_DUMP, Direction::Inbound);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].handle, FilterHandle("800::800".into()));
        assert_eq!(rules[0].ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(rules[0].lane, Lane::Slow);
        assert_eq!(rules[0].direction, Direction::Inbound);

        assert_eq!(rules[1].handle, FilterHandle("800::801".into()));
        assert_eq!(rules[1].ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(rules[1].lane, Lane::Guest);
    }

    #[test]
    fn test_parse_filter_dump_skips_fw_and_header_lines() {
        // Only u32 per-IP entries become rules; the fw mark rule and the
        // hash-table header carry no address match.
        let rules = parse_filter_dump(
            "filter parent 1: protocol ip pref 1 fw chain 0 handle 0x1 classid 1:10\n\
             filter parent 1: protocol ip pref 5 u32 chain 0 fh 800: ht divisor 1\n",
            Direction::Outbound,
        );
        assert!(rules.is_empty());
    }

    #[test]
    fn test_parse_filter_dump_ignores_unknown_flowid() {
        let rules = parse_filter_dump(
            "filter parent 1: protocol ip pref 9 u32 chain 0 fh 801::800 order 1 flowid 1:99\n\
             \tmatch c0a80164/ffffffff at 16\n",
            Direction::Inbound,
        );
        assert!(rules.is_empty());
    }

    #[test]
    fn test_parse_filter_dump_empty() {
        assert!(parse_filter_dump("", Direction::Inbound).is_empty());
    }

    #[test]
    fn test_lane_prio_mapping() {
        assert_eq!(lane_prio(Lane::Slow), SLOW_PRIO);
        assert_eq!(lane_prio(Lane::Guest), GUEST_PRIO);
        assert_eq!(lane_prio(Lane::Fast), MARK_PRIO);
    }
}
