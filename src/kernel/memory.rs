//! In-memory kernel backend.
//!
//! Mirrors the semantics of the production `tc` backend against plain rule
//! tables: handles are assigned sequentially, tearing down the topology
//! destroys all filters, and marks/redirects are simple sets. Used by unit
//! tests and by `--test` dry runs so a pass can be traced without touching
//! kernel state.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::classify::Lane;
use crate::config::LaneRates;
use crate::error::{Error, Result};

use super::{
    Direction, FilterHandle, FilterRule, InterfaceStatus, KernelPort, RuleCounts, TopologyStatus,
};

#[derive(Debug, Default, Clone)]
struct IfaceModel {
    root: bool,
    lanes: HashSet<Lane>,
    mark_filter: bool,
}

impl IfaceModel {
    fn full() -> Self {
        Self {
            root: true,
            lanes: [Lane::Fast, Lane::Slow, Lane::Guest].into_iter().collect(),
            mark_filter: true,
        }
    }

    fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            root_ok: self.root,
            missing_lanes: [Lane::Fast, Lane::Slow, Lane::Guest]
                .into_iter()
                .filter(|lane| self.root && !self.lanes.contains(lane))
                .collect(),
            mark_filter_ok: self.root && self.mark_filter,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    rates: Option<LaneRates>,
    lan: IfaceModel,
    wan: IfaceModel,
    next_handle: u32,
    filters: Vec<FilterRule>,
    marks: HashSet<(Ipv4Addr, Direction)>,
    dns_redirects: HashSet<Ipv4Addr>,
    // Fault injection: pretend the install succeeded but record nothing,
    // so read-back verification fails.
    drop_filter_installs: bool,
    // Fault injection: installs fail outright.
    fail_filter_installs: bool,
}

impl State {
    fn iface(&mut self, direction: Direction) -> &mut IfaceModel {
        match direction {
            Direction::Inbound => &mut self.lan,
            Direction::Outbound => &mut self.wan,
        }
    }
}

/// Kernel port backed by in-memory rule tables.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    state: Mutex<State>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Damage the WAN hierarchy root, as an external actor (manual `tc`
    /// invocation, firmware reset) would. Filters on that interface die
    /// with the root.
    pub fn break_topology(&self) {
        let mut state = self.state.lock().unwrap();
        state.wan = IfaceModel::default();
        state.filters.retain(|f| f.direction != Direction::Outbound);
    }

    /// Remove one lane class without touching the root, the other lanes,
    /// or any installed filters.
    pub fn drop_lane_class(&self, direction: Direction, lane: Lane) {
        let mut state = self.state.lock().unwrap();
        state.iface(direction).lanes.remove(&lane);
    }

    /// Remove the base mark-to-fast rule from one interface.
    pub fn drop_mark_filter(&self, direction: Direction) {
        let mut state = self.state.lock().unwrap();
        state.iface(direction).mark_filter = false;
    }

    /// Enable or disable silent filter-install loss.
    pub fn set_drop_filter_installs(&self, drop: bool) {
        self.state.lock().unwrap().drop_filter_installs = drop;
    }

    /// Enable or disable hard filter-install failure.
    pub fn set_fail_filter_installs(&self, fail: bool) {
        self.state.lock().unwrap().fail_filter_installs = fail;
    }

    /// The rates the topology was last built with, if built.
    pub fn built_rates(&self) -> Option<LaneRates> {
        self.state.lock().unwrap().rates.clone()
    }
}

impl KernelPort for MemoryKernel {
    fn topology_status(&self) -> Result<TopologyStatus> {
        let state = self.state.lock().unwrap();
        Ok(TopologyStatus {
            lan: state.lan.status(),
            wan: state.wan.status(),
        })
    }

    fn teardown_topology(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rates = None;
        state.lan = IfaceModel::default();
        state.wan = IfaceModel::default();
        state.filters.clear();
        Ok(())
    }

    fn build_topology(&self, rates: &LaneRates) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rates = Some(rates.clone());
        state.lan = IfaceModel::full();
        state.wan = IfaceModel::full();
        Ok(())
    }

    fn rebuild_interface(&self, direction: Direction, rates: &LaneRates) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rates = Some(rates.clone());
        *state.iface(direction) = IfaceModel::full();
        state.filters.retain(|f| f.direction != direction);
        Ok(())
    }

    fn repair_lane(&self, direction: Direction, lane: Lane, rates: &LaneRates) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let iface = state.iface(direction);
        if !iface.root {
            return Err(Error::EnforcementFailure(format!(
                "cannot add {lane} class without a root ({direction})"
            )));
        }
        iface.lanes.insert(lane);
        state.rates = Some(rates.clone());
        Ok(())
    }

    fn install_mark_filter(&self, direction: Direction) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let iface = state.iface(direction);
        if !iface.root {
            return Err(Error::EnforcementFailure(format!(
                "cannot install mark filter without a root ({direction})"
            )));
        }
        iface.mark_filter = true;
        Ok(())
    }

    fn ensure_chains(&self) -> Result<()> {
        Ok(())
    }

    fn has_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<bool> {
        Ok(self.state.lock().unwrap().marks.contains(&(ip, direction)))
    }

    fn add_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()> {
        self.state.lock().unwrap().marks.insert((ip, direction));
        Ok(())
    }

    fn remove_mark(&self, ip: Ipv4Addr, direction: Direction) -> Result<()> {
        self.state.lock().unwrap().marks.remove(&(ip, direction));
        Ok(())
    }

    fn flush_marks(&self) -> Result<()> {
        self.state.lock().unwrap().marks.clear();
        Ok(())
    }

    fn install_filter(
        &self,
        ip: Ipv4Addr,
        direction: Direction,
        lane: Lane,
    ) -> Result<FilterHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.iface(direction).root {
            return Err(Error::EnforcementFailure(
                "cannot install filter without topology".into(),
            ));
        }
        if state.fail_filter_installs {
            return Err(Error::EnforcementFailure(format!(
                "injected install failure for {ip} ({direction})"
            )));
        }
        state.next_handle += 1;
        let handle = FilterHandle(format!("800::{:x}", 0x800 + state.next_handle));
        if !state.drop_filter_installs {
            state.filters.push(FilterRule {
                handle: handle.clone(),
                ip,
                direction,
                lane,
            });
        }
        Ok(handle)
    }

    fn remove_filter(
        &self,
        direction: Direction,
        lane: Lane,
        handle: &FilterHandle,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.filters.len();
        state
            .filters
            .retain(|f| !(f.direction == direction && f.lane == lane && &f.handle == handle));
        if state.filters.len() == before {
            return Err(Error::EnforcementFailure(format!(
                "no {lane} filter with handle {handle} ({direction})"
            )));
        }
        Ok(())
    }

    fn list_filters(&self, lane: Option<Lane>) -> Result<Vec<FilterRule>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .filters
            .iter()
            .filter(|f| lane.map_or(true, |l| f.lane == l))
            .cloned()
            .collect())
    }

    fn has_dns_redirect(&self, ip: Ipv4Addr) -> Result<bool> {
        Ok(self.state.lock().unwrap().dns_redirects.contains(&ip))
    }

    fn install_dns_redirect(&self, ip: Ipv4Addr) -> Result<()> {
        self.state.lock().unwrap().dns_redirects.insert(ip);
        Ok(())
    }

    fn remove_dns_redirect(&self, ip: Ipv4Addr) -> Result<()> {
        self.state.lock().unwrap().dns_redirects.remove(&ip);
        Ok(())
    }

    fn flush_dns_redirects(&self) -> Result<()> {
        self.state.lock().unwrap().dns_redirects.clear();
        Ok(())
    }

    fn rule_counts(&self) -> Result<RuleCounts> {
        let state = self.state.lock().unwrap();
        Ok(RuleCounts {
            filters: state.filters.len(),
            marks: state.marks.len(),
            dns_redirects: state.dns_redirects.len(),
        })
    }
}
