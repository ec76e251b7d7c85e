use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use pkg_constants::network::DEFAULT_STATEFUL_NAT_IDLE_TIMEOUT_SECS;
use pkg_constants::pipeline::{PRIORITY_STATEFUL_SNAT_RULE, PRIORITY_TABLE_TRANSITION, TableId};
use pkg_types::net::DeviceId;

use crate::driver::{DriverError, SwitchDriver};
use crate::flow::{Action, FlowKey, FlowRule, GroupBucket, GroupDescription, GroupId, Persistence};
use crate::packet::{OutPort, Packet, PacketIn};

/// Complete set of rules and groups one application wants on the fleet.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub flows: Vec<FlowRule>,
    pub groups: Vec<GroupDescription>,
}

impl DesiredState {
    pub fn extend(&mut self, other: DesiredState) {
        self.flows.extend(other.flows);
        self.groups.extend(other.groups);
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeStats {
    pub installed: usize,
    pub removed: usize,
}

/// Idempotent façade over the switch driver.
///
/// Driver failures are logged and counted, never returned: the pipeline is
/// re-derivable from resource state and the next resync converges it.
pub struct FlowProgrammer {
    driver: Arc<dyn SwitchDriver>,
    stateful_idle_timeout: AtomicU64,
    failures: AtomicU64,
}

impl FlowProgrammer {
    pub fn new(driver: Arc<dyn SwitchDriver>) -> Self {
        Self {
            driver,
            stateful_idle_timeout: AtomicU64::new(DEFAULT_STATEFUL_NAT_IDLE_TIMEOUT_SECS),
            failures: AtomicU64::new(0),
        }
    }

    pub fn set_stateful_idle_timeout(&self, secs: u64) {
        self.stateful_idle_timeout.store(secs, Ordering::Relaxed);
    }

    /// Number of swallowed driver failures since start.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record(&self, what: &str, result: Result<(), DriverError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Pipeline {} failed: {}", what, e);
                false
            }
        }
    }

    /// Rules at the stateful-NAT priority expire when idle; all others are
    /// permanent.
    fn with_persistence(&self, mut rule: FlowRule) -> FlowRule {
        rule.persistence = if rule.priority == PRIORITY_STATEFUL_SNAT_RULE {
            Persistence::IdleTimeout(self.stateful_idle_timeout.load(Ordering::Relaxed))
        } else {
            Persistence::Permanent
        };
        rule
    }

    /// Install (or, with `install == false`, remove) one rule.
    pub async fn set_rule(&self, rule: FlowRule, install: bool) {
        let rule = self.with_persistence(rule);
        debug!(
            "{} rule table={} priority={} on {}",
            if install { "install" } else { "remove" },
            rule.table,
            rule.priority,
            rule.device
        );
        let result = if install {
            self.driver.install_flow(rule).await
        } else {
            self.driver.remove_flow(rule).await
        };
        self.record("flow mutation", result);
    }

    /// Unconditional transition from `from` to `to`.
    pub async fn connect_tables(
        &self,
        app_id: &str,
        device: &DeviceId,
        from: TableId,
        to: TableId,
        install: bool,
    ) {
        let rule = Self::transition(app_id, device, from, to);
        self.set_rule(rule, install).await;
    }

    pub fn transition(app_id: &str, device: &DeviceId, from: TableId, to: TableId) -> FlowRule {
        FlowRule::new(app_id, device, from, PRIORITY_TABLE_TRANSITION).actions(vec![Action::Goto(to)])
    }

    pub async fn set_group(&self, group: GroupDescription, install: bool) {
        let result = if install {
            self.driver.install_group(group).await
        } else {
            self.driver.remove_group(&group.device, group.id).await
        };
        self.record("group mutation", result);
    }

    pub async fn set_buckets(
        &self,
        device: &DeviceId,
        id: GroupId,
        buckets: Vec<GroupBucket>,
        install: bool,
    ) {
        let result = if install {
            self.driver.add_buckets(device, id, buckets).await
        } else {
            self.driver.remove_buckets(device, id, buckets).await
        };
        self.record("bucket mutation", result);
    }

    pub async fn has_group(&self, device: &DeviceId, id: GroupId) -> bool {
        self.group(device, id).await.is_some()
    }

    pub async fn group(&self, device: &DeviceId, id: GroupId) -> Option<GroupDescription> {
        match self.driver.group(device, id).await {
            Ok(group) => group,
            Err(e) => {
                self.record("group lookup", Err(e));
                None
            }
        }
    }

    pub async fn flows(&self, device: &DeviceId) -> Vec<FlowRule> {
        match self.driver.flows(device).await {
            Ok(flows) => flows,
            Err(e) => {
                self.record("flow dump", Err(e));
                Vec::new()
            }
        }
    }

    pub async fn emit(&self, device: &DeviceId, port: OutPort, packet: Packet) {
        let result = self.driver.emit(device, port, packet).await;
        self.record("packet-out", result);
    }

    pub fn packet_in(&self) -> broadcast::Receiver<PacketIn> {
        self.driver.packet_in()
    }

    /// Bring every device's rules owned by `app_id` in line with `desired`.
    ///
    /// Groups are installed before flows and removed after them. Rules with
    /// an idle timeout are left to expire on their own.
    pub async fn converge(
        &self,
        app_id: &str,
        devices: &[DeviceId],
        desired: &DesiredState,
    ) -> ConvergeStats {
        let mut stats = ConvergeStats::default();
        for device in devices {
            let current_flows = match self.driver.flows(device).await {
                Ok(flows) => flows,
                Err(e) => {
                    self.record("flow dump", Err(e));
                    continue;
                }
            };
            let current_groups = match self.driver.groups(device).await {
                Ok(groups) => groups,
                Err(e) => {
                    self.record("group dump", Err(e));
                    continue;
                }
            };
            let current_flows: HashMap<FlowKey, FlowRule> = current_flows
                .into_iter()
                .filter(|r| r.app_id == app_id)
                .map(|r| (r.key(), r))
                .collect();
            let current_groups: HashMap<GroupId, GroupDescription> = current_groups
                .into_iter()
                .filter(|g| g.app_id == app_id)
                .map(|g| (g.id, g))
                .collect();

            let wanted_flows: BTreeMap<FlowKey, FlowRule> = desired
                .flows
                .iter()
                .filter(|r| &r.device == device)
                .map(|r| {
                    let r = self.with_persistence(r.clone());
                    (r.key(), r)
                })
                .collect();
            let wanted_groups: BTreeMap<GroupId, &GroupDescription> = desired
                .groups
                .iter()
                .filter(|g| &g.device == device)
                .map(|g| (g.id, g))
                .collect();

            for (id, group) in &wanted_groups {
                match current_groups.get(id) {
                    None => {
                        self.set_group((*group).clone(), true).await;
                        stats.installed += 1;
                    }
                    Some(cur) if cur.buckets != group.buckets => {
                        let missing: Vec<GroupBucket> = group
                            .buckets
                            .iter()
                            .filter(|b| !cur.buckets.contains(b))
                            .cloned()
                            .collect();
                        let extra: Vec<GroupBucket> = cur
                            .buckets
                            .iter()
                            .filter(|b| !group.buckets.contains(b))
                            .cloned()
                            .collect();
                        if !missing.is_empty() {
                            stats.installed += missing.len();
                            self.set_buckets(device, *id, missing, true).await;
                        }
                        if !extra.is_empty() {
                            stats.removed += extra.len();
                            self.set_buckets(device, *id, extra, false).await;
                        }
                    }
                    Some(_) => {}
                }
            }

            for (key, rule) in &wanted_flows {
                if current_flows.get(key) != Some(rule) {
                    self.set_rule(rule.clone(), true).await;
                    stats.installed += 1;
                }
            }

            for (key, rule) in &current_flows {
                if !wanted_flows.contains_key(key) && rule.persistence == Persistence::Permanent {
                    self.set_rule(rule.clone(), false).await;
                    stats.removed += 1;
                }
            }

            for (id, group) in &current_groups {
                if !wanted_groups.contains_key(id) {
                    self.set_group(group.clone(), false).await;
                    stats.removed += 1;
                }
            }
        }
        if stats != ConvergeStats::default() {
            info!(
                "Converged {} on {} device(s): {} installed, {} removed",
                app_id,
                devices.len(),
                stats.installed,
                stats.removed
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Match;
    use crate::memory::MemorySwitch;

    const APP: &str = "test";

    fn dev(n: u8) -> DeviceId {
        DeviceId::new(format!("of:{}", n))
    }

    fn setup() -> (Arc<MemorySwitch>, FlowProgrammer) {
        let sw = Arc::new(MemorySwitch::new());
        let programmer = FlowProgrammer::new(sw.clone());
        (sw, programmer)
    }

    #[tokio::test]
    async fn set_rule_is_idempotent() {
        let (sw, p) = setup();
        let rule = FlowRule::new(APP, &dev(1), 40, 100)
            .matching(Match::ipv4())
            .actions(vec![Action::Goto(60)]);
        p.set_rule(rule.clone(), true).await;
        p.set_rule(rule.clone(), true).await;
        assert_eq!(sw.flow_count(&dev(1)).await, 1);
        p.set_rule(rule.clone(), false).await;
        p.set_rule(rule, false).await;
        assert_eq!(sw.flow_count(&dev(1)).await, 0);
        assert_eq!(p.failures(), 0);
    }

    #[tokio::test]
    async fn stateful_priority_gets_idle_timeout() {
        let (sw, p) = setup();
        p.set_stateful_idle_timeout(30);
        p.set_rule(FlowRule::new(APP, &dev(1), 60, PRIORITY_STATEFUL_SNAT_RULE), true)
            .await;
        p.set_rule(FlowRule::new(APP, &dev(1), 60, 100), true).await;
        let flows = sw.flows(&dev(1)).await.unwrap();
        let timed: Vec<_> = flows
            .iter()
            .filter(|r| r.persistence == Persistence::IdleTimeout(30))
            .collect();
        assert_eq!(timed.len(), 1);
        assert_eq!(timed[0].priority, PRIORITY_STATEFUL_SNAT_RULE);
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_counted() {
        let (sw, p) = setup();
        sw.set_online(&dev(2), false).await;
        for d in [dev(1), dev(2)] {
            p.connect_tables(APP, &d, 0, 30, true).await;
        }
        assert_eq!(sw.flow_count(&dev(1)).await, 1);
        assert_eq!(p.failures(), 1);
    }

    #[tokio::test]
    async fn converge_installs_once_and_removes_stale() {
        let (sw, p) = setup();
        let stale = FlowRule::new(APP, &dev(1), 30, 5).actions(vec![Action::Drop]);
        let foreign = FlowRule::new("other", &dev(1), 30, 6).actions(vec![Action::Drop]);
        p.set_rule(stale, true).await;
        p.set_rule(foreign, true).await;

        let group = GroupDescription::select(
            APP,
            &dev(1),
            GroupId(9),
            vec![GroupBucket::new(vec![Action::Output(1)])],
        );
        let desired = DesiredState {
            flows: vec![
                FlowProgrammer::transition(APP, &dev(1), 0, 30),
                FlowRule::new(APP, &dev(1), 52, 100)
                    .matching(Match::ipv4().l4_dst(80))
                    .actions(vec![Action::Group(GroupId(9))]),
            ],
            groups: vec![group],
        };

        let first = p.converge(APP, &[dev(1)], &desired).await;
        assert_eq!(first.installed, 3);
        assert_eq!(first.removed, 1);
        assert_eq!(p.failures(), 0);

        let again = p.converge(APP, &[dev(1)], &desired).await;
        assert_eq!(again, ConvergeStats::default());
        // the other application's rule is untouched
        assert_eq!(sw.flow_count(&dev(1)).await, 3);
    }

    #[tokio::test]
    async fn converge_updates_buckets_in_place() {
        let (sw, p) = setup();
        let b1 = GroupBucket::new(vec![Action::Output(1)]);
        let b2 = GroupBucket::new(vec![Action::Output(2)]);
        p.set_group(
            GroupDescription::select(APP, &dev(1), GroupId(3), vec![b1.clone()]),
            true,
        )
        .await;
        let desired = DesiredState {
            flows: vec![],
            groups: vec![GroupDescription::select(APP, &dev(1), GroupId(3), vec![b2.clone()])],
        };
        let stats = p.converge(APP, &[dev(1)], &desired).await;
        assert_eq!(stats, ConvergeStats { installed: 1, removed: 1 });
        let group = sw.group(&dev(1), GroupId(3)).await.unwrap().unwrap();
        assert_eq!(group.buckets, vec![b2]);
    }
}
