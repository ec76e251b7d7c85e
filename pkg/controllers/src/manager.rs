use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use pkg_constants::state::{APP_ELECTION_KEY, RESYNC_INTERVAL_SECS};

use crate::arp::{ArpEvent, ArpReconciler, spawn_arp_learner};
use crate::context::Context;
use crate::ipam::{IpamEvent, IpamReconciler};
use crate::network_policy::{NetworkPolicyReconciler, PolicyEvent};
use crate::node_port::{NodePortEvent, NodePortReconciler};
use crate::runner::{Resync, spawn_reconciler};
use crate::service_nat::{ServiceNatEvent, ServiceNatReconciler};
use crate::snat::{SnatEvent, SnatReconciler, spawn_punt_forwarder};
use crate::switching::{SwitchingEvent, SwitchingReconciler};

/// Owns every running reconciler and the background tasks feeding them.
pub struct ControllerManager {
    ctx: Arc<Context>,
    reconcilers: Vec<Arc<dyn Resync>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerManager {
    /// Spawn all reconcilers, wire them to the stores and start the
    /// leadership watcher and the periodic resync.
    pub fn start(ctx: Arc<Context>) -> Arc<Self> {
        let stores = &ctx.stores;
        let mut reconcilers: Vec<Arc<dyn Resync>> = Vec::new();
        let mut tasks = Vec::new();

        // --- Switching ---
        let switching = spawn_reconciler(Arc::new(SwitchingReconciler::new(ctx.clone())), ctx.clone());
        switching.forward(&stores.nodes, SwitchingEvent::Node);
        switching.forward(&stores.networks, SwitchingEvent::Network);
        switching.forward(&stores.ports, SwitchingEvent::Port);
        reconcilers.push(Arc::new(switching));

        // --- ARP ---
        let arp = spawn_reconciler(Arc::new(ArpReconciler::new(ctx.clone())), ctx.clone());
        arp.forward(&stores.nodes, ArpEvent::Node);
        arp.forward(&stores.networks, ArpEvent::Network);
        arp.forward(&stores.ports, ArpEvent::Port);
        reconcilers.push(Arc::new(arp));
        tasks.push(spawn_arp_learner(ctx.clone()));

        // --- Service NAT ---
        let nat = spawn_reconciler(Arc::new(ServiceNatReconciler::new(ctx.clone())), ctx.clone());
        nat.forward(&stores.services, ServiceNatEvent::Service);
        nat.forward(&stores.endpoints, ServiceNatEvent::Endpoints);
        nat.forward(&stores.nodes, ServiceNatEvent::Node);
        nat.forward(&stores.networks, ServiceNatEvent::Network);
        reconcilers.push(Arc::new(nat));

        // --- Network policy ---
        let policy = spawn_reconciler(Arc::new(NetworkPolicyReconciler::new(ctx.clone())), ctx.clone());
        policy.forward(&stores.policies, PolicyEvent::Policy);
        policy.forward(&stores.pods, PolicyEvent::Pod);
        policy.forward(&stores.namespaces, PolicyEvent::Namespace);
        policy.forward(&stores.nodes, PolicyEvent::Node);
        reconcilers.push(Arc::new(policy));

        // --- Node ports ---
        let node_port = spawn_reconciler(Arc::new(NodePortReconciler::new(ctx.clone())), ctx.clone());
        node_port.forward(&stores.services, NodePortEvent::Service);
        node_port.forward(&stores.nodes, NodePortEvent::Node);
        node_port.forward(&stores.networks, NodePortEvent::Network);
        reconcilers.push(Arc::new(node_port));

        // --- SNAT ---
        let snat = spawn_reconciler(Arc::new(SnatReconciler::new(ctx.clone())), ctx.clone());
        snat.forward(&stores.nodes, SnatEvent::Node);
        tasks.push(spawn_punt_forwarder(ctx.clone(), snat.clone()));
        reconcilers.push(Arc::new(snat));

        // --- IPAM ---
        let ipam = spawn_reconciler(Arc::new(IpamReconciler::new(ctx.clone())), ctx.clone());
        ipam.forward(&stores.networks, IpamEvent::Network);
        ipam.forward(&stores.ports, IpamEvent::Port);
        reconcilers.push(Arc::new(ipam));

        info!("ControllerManager started {} reconcilers", reconcilers.len());

        let manager = Arc::new(Self {
            ctx: ctx.clone(),
            reconcilers,
            tasks,
        });
        manager.spawn_watchers();
        manager
    }

    /// Queue a full resync on every reconciler.
    pub fn resync_all(&self) {
        for r in &self.reconcilers {
            r.request_resync();
        }
        info!("Resync requested on {} reconcilers", self.reconcilers.len());
    }

    pub fn reconciler_names(&self) -> Vec<&'static str> {
        self.reconcilers.iter().map(|r| r.name()).collect()
    }

    fn spawn_watchers(self: &Arc<Self>) {
        // Gaining leadership: everything that happened meanwhile was dropped.
        let manager = Arc::downgrade(self);
        let mut leader_rx = self.ctx.leadership.subscribe(APP_ELECTION_KEY);
        tokio::spawn(async move {
            let mut leading = false;
            loop {
                {
                    let Some(manager) = manager.upgrade() else { break };
                    let now = manager.ctx.is_leader();
                    if now && !leading {
                        info!("Gained leadership, resyncing");
                        manager.resync_all();
                    } else if !now && leading {
                        info!("Lost leadership, standing by");
                    }
                    leading = now;
                }
                if leader_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(RESYNC_INTERVAL_SECS);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.resync_all();
            }
        });

        // Configuration reloads change the rules every reconciler derives.
        let manager = Arc::downgrade(self);
        let mut config_rx = self.ctx.config.subscribe();
        tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let Some(manager) = manager.upgrade() else { break };
                let config = config_rx.borrow_and_update().clone();
                manager
                    .ctx
                    .programmer
                    .set_stateful_idle_timeout(config.stateful_nat_idle_timeout_secs);
                manager.resync_all();
            }
        });
    }
}

impl Drop for ControllerManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::context::Stores;
    use pkg_pipeline::{FlowRule, GroupDescription, MemorySwitch, SwitchDriver};
    use pkg_state::{KvBackend, MemoryStore, StaticLeadership};
    use pkg_types::config::NetworkingConfig;
    use tokio::time::sleep;

    async fn settle() {
        sleep(Duration::from_millis(250)).await;
    }

    #[tokio::test]
    async fn store_events_reach_the_pipeline() {
        let h = harness(NetworkingConfig::default());
        let _manager = ControllerManager::start(h.ctx.clone());

        let s = &h.ctx.stores;
        s.nodes.create(node(1, false)).await.unwrap();
        s.networks.create(network(1)).await.unwrap();
        s.ports.create(port(1, 5)).await.unwrap();
        settle().await;

        assert!(h.switch.flow_count(&bridge(1)).await > 0);
        let allocated = h.ctx.ipam.allocated_ips(&network(1).network_id).await.unwrap();
        assert!(allocated.contains(&ip("10.10.1.5")));
    }

    #[tokio::test]
    async fn follower_programs_nothing_until_it_leads() {
        let h = harness(NetworkingConfig::default());
        h.leadership.set_leader(Some("ctl-b"));
        let _manager = ControllerManager::start(h.ctx.clone());

        h.ctx.stores.nodes.create(node(1, false)).await.unwrap();
        settle().await;
        assert_eq!(h.switch.flow_count(&bridge(1)).await, 0);

        // the leadership edge alone triggers the resync
        h.leadership.set_leader(Some("ctl-a"));
        settle().await;
        assert!(h.switch.flow_count(&bridge(1)).await > 0);
    }

    #[tokio::test]
    async fn config_reload_resyncs() {
        let h = harness(NetworkingConfig::default());
        let _manager = ControllerManager::start(h.ctx.clone());
        h.ctx.stores.nodes.create(node(1, false)).await.unwrap();
        h.ctx.stores.networks.create(network(1)).await.unwrap();
        h.ctx.stores.ports.create(port(1, 5)).await.unwrap();
        h.ctx.stores.ports.create(port(1, 6)).await.unwrap();
        settle().await;
        let proxy = h.switch.flow_count(&bridge(1)).await;

        h.ctx.config.replace(NetworkingConfig {
            arp_mode: pkg_types::config::ArpMode::Broadcast,
            ..Default::default()
        });
        settle().await;
        // two per-port responders give way to one flood rule
        assert_eq!(h.switch.flow_count(&bridge(1)).await, proxy - 1);
    }

    fn controller(
        kv: &Arc<dyn KvBackend>,
        switch: &Arc<MemorySwitch>,
        node_id: &str,
        leader: Option<&str>,
    ) -> (Arc<Context>, Arc<StaticLeadership>) {
        let leadership = Arc::new(StaticLeadership::with_leader(node_id, leader));
        let ctx = Context::new(
            kv.clone(),
            NetworkingConfig::default(),
            switch.clone(),
            leadership.clone(),
        );
        (ctx, leadership)
    }

    async fn snapshot(switch: &MemorySwitch) -> (Vec<FlowRule>, Vec<GroupDescription>) {
        let flows = switch.tables(&bridge(1)).await.flows().to_vec();
        let groups = SwitchDriver::groups(switch, &bridge(1)).await.unwrap();
        (flows, groups)
    }

    /// Node 1 with ports .5 and .6, service web backed by .5 only.
    async fn steady_state(stores: &Stores) {
        stores.nodes.create(node(1, false)).await.unwrap();
        stores.networks.create(network(1)).await.unwrap();
        stores.ports.create(port(1, 5)).await.unwrap();
        stores.ports.create(port(1, 6)).await.unwrap();
        stores.services.create(service("web", "10.96.0.10", 80, None)).await.unwrap();
        stores
            .endpoints
            .create(endpoints("web", &[("10.10.1.5", 8080)]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn leadership_flap_converges_like_a_single_leader() {
        // one controller leading throughout
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let switch = Arc::new(MemorySwitch::new());
        let (solo, _) = controller(&kv, &switch, "ctl-a", Some("ctl-a"));
        let _solo = ControllerManager::start(solo.clone());
        steady_state(&solo.stores).await;
        settle().await;
        let expected = snapshot(&switch).await;
        assert!(!expected.0.is_empty());
        assert_eq!(expected.1.len(), 1);

        // A leads, nobody leads while the state changes, then B takes over
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let switch = Arc::new(MemorySwitch::new());
        let (a, lead_a) = controller(&kv, &switch, "ctl-a", Some("ctl-a"));
        let (b, lead_b) = controller(&kv, &switch, "ctl-b", Some("ctl-a"));
        let _a = ControllerManager::start(a.clone());
        let _b = ControllerManager::start(b.clone());

        steady_state(&a.stores).await;
        a.stores.ports.create(port(1, 7)).await.unwrap();
        let one = endpoints("web", &[("10.10.1.5", 8080)]);
        let two = endpoints("web", &[("10.10.1.5", 8080), ("10.10.1.6", 8080)]);
        a.stores.endpoints.update(two).await.unwrap();
        settle().await;

        for l in [&lead_a, &lead_b] {
            l.set_leader(None);
        }
        settle().await;
        a.stores.ports.remove("port-1-7").await.unwrap();
        a.stores.endpoints.update(one).await.unwrap();
        settle().await;
        // nothing was written while leaderless: port 7 rules are still there
        assert_ne!(snapshot(&switch).await, expected);

        for l in [&lead_a, &lead_b] {
            l.set_leader(Some("ctl-b"));
        }
        settle().await;
        assert_eq!(snapshot(&switch).await, expected);
    }
}
