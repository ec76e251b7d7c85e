//! ClusterIP load balancing.
//!
//! Stateless mode rewrites the client source into the shifted range so the
//! reply can be recognised and un-NATed without connection state. Stateful
//! mode hands translation to the switch's connection tracker.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use pkg_constants::pipeline::{
    ACL_EGRESS_TABLE, APP_SERVICE_NAT, CT_STATE_NEW, CT_STATE_TRACKED, JUMP_TABLE, NAT_TABLE,
    POD_TABLE, PRIORITY_CT_RULE, PRIORITY_NAT_RULE, SERVICE_TABLE,
};
use pkg_network::addressing::{b_class_prefix, node_ip_gateway_map};
use pkg_pipeline::{
    Action, CtAction, CtNat, DesiredState, FlowKey, FlowRule, GroupBucket, GroupDescription, GroupId,
    Match,
};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::config::{NatMode, NetworkingConfig};
use pkg_types::endpoint::Endpoints;
use pkg_types::net::{DeviceId, Protocol};
use pkg_types::network::LogicalNetwork;
use pkg_types::node::{Node, NodeTransition};
use pkg_types::service::Service;

use crate::context::{Context, log_failure};
use crate::runner::Reconciler;

pub enum ServiceNatEvent {
    Service(ResourceEvent<Service>),
    Endpoints(ResourceEvent<Endpoints>),
    Node(ResourceEvent<Node>),
    Network(ResourceEvent<LogicalNetwork>),
}

/// One (cluster IP, port, protocol) of a service and the backends behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub backends: BTreeSet<(Ipv4Addr, u16)>,
}

type ExposureKey = (Ipv4Addr, u16, Protocol);
type BackendKey = (Ipv4Addr, u16, Protocol);

impl Exposure {
    fn key(&self) -> ExposureKey {
        (self.vip, self.port, self.protocol)
    }

    pub fn group_id(&self) -> GroupId {
        GroupId::for_service(self.vip, self.port, self.protocol)
    }
}

/// Every exposure of `service`. Endpoint addresses that are node IPs
/// (host-network pods) are replaced by that node network's gateway.
pub fn exposures(
    service: &Service,
    endpoints: Option<&Endpoints>,
    host_gateways: &HashMap<Ipv4Addr, Ipv4Addr>,
) -> Vec<Exposure> {
    let Some(vip) = service.cluster_ipv4() else {
        return Vec::new();
    };
    service
        .spec
        .ports
        .iter()
        .map(|sp| {
            let backends = endpoints
                .map(|e| e.backends(sp.name.as_deref(), sp.protocol))
                .unwrap_or_default()
                .into_iter()
                .map(|(ip, port)| (host_gateways.get(&ip).copied().unwrap_or(ip), port))
                .collect();
            Exposure {
                vip,
                port: sp.port,
                protocol: sp.protocol,
                backends,
            }
        })
        .collect()
}

// --- Rule builders ---

fn shift_rule(config: &NetworkingConfig, device: &DeviceId, exp: &Exposure) -> FlowRule {
    let selector = Match::ipv4()
        .protocol(exp.protocol)
        .ipv4_dst_host(exp.vip)
        .l4_dst(exp.port);
    match config.nat_mode {
        NatMode::Stateless => FlowRule::new(APP_SERVICE_NAT, device, SERVICE_TABLE, PRIORITY_NAT_RULE)
            .matching(selector)
            .actions(vec![
                Action::LoadSrcPrefix(b_class_prefix(config.shifted_cidr)),
                Action::Group(exp.group_id()),
            ]),
        NatMode::Stateful => FlowRule::new(APP_SERVICE_NAT, device, NAT_TABLE, PRIORITY_NAT_RULE)
            .matching(selector.ct_state(
                CT_STATE_TRACKED | CT_STATE_NEW,
                CT_STATE_TRACKED | CT_STATE_NEW,
            ))
            .actions(vec![Action::Group(exp.group_id())]),
    }
}

fn bucket(config: &NetworkingConfig, backend: (Ipv4Addr, u16)) -> GroupBucket {
    let (ip, port) = backend;
    match config.nat_mode {
        NatMode::Stateless => GroupBucket::new(vec![
            Action::SetIpv4Dst(ip),
            Action::SetL4Dst(port),
            Action::Resubmit(ACL_EGRESS_TABLE),
        ]),
        NatMode::Stateful => GroupBucket::new(vec![
            Action::Conntrack(CtAction {
                commit: true,
                nat: Some(CtNat::Dst {
                    addr: ip,
                    port: Some(port),
                }),
                recirc_table: None,
            }),
            Action::Resubmit(ACL_EGRESS_TABLE),
        ]),
    }
}

fn group(config: &NetworkingConfig, device: &DeviceId, exp: &Exposure) -> GroupDescription {
    GroupDescription::select(
        APP_SERVICE_NAT,
        device,
        exp.group_id(),
        exp.backends.iter().map(|b| bucket(config, *b)).collect(),
    )
}

/// Reply from a backend: restore the client prefix and present the VIP.
fn unshift_rule(
    config: &NetworkingConfig,
    device: &DeviceId,
    exp: &Exposure,
    backend: (Ipv4Addr, u16),
) -> FlowRule {
    FlowRule::new(APP_SERVICE_NAT, device, POD_TABLE, PRIORITY_NAT_RULE)
        .matching(
            Match::ipv4()
                .protocol(exp.protocol)
                .ipv4_src_host(backend.0)
                .l4_src(backend.1),
        )
        .actions(vec![
            Action::LoadDstPrefix(b_class_prefix(config.pod_cidr)),
            Action::SetIpv4Src(exp.vip),
            Action::SetL4Src(exp.port),
            Action::Goto(ACL_EGRESS_TABLE),
        ])
}

/// Per-network entry rules steering service and reply traffic.
fn base_rules(config: &NetworkingConfig, device: &DeviceId, networks: &[LogicalNetwork]) -> Vec<FlowRule> {
    let mut rules = Vec::new();
    for network in networks {
        let from = Match::ipv4().ipv4_src(network.cidr);
        let jump = FlowRule::new(APP_SERVICE_NAT, device, JUMP_TABLE, PRIORITY_CT_RULE);
        match config.nat_mode {
            NatMode::Stateless => {
                rules.push(
                    jump.clone()
                        .matching(from.clone().ipv4_dst(config.service_cidr))
                        .actions(vec![Action::Goto(SERVICE_TABLE)]),
                );
                rules.push(
                    jump.matching(from.ipv4_dst(config.shifted_cidr))
                        .actions(vec![Action::Goto(POD_TABLE)]),
                );
            }
            NatMode::Stateful => {
                let untracked = from.ct_state(0, CT_STATE_TRACKED);
                rules.push(
                    jump.clone()
                        .matching(untracked.clone().ipv4_dst(config.service_cidr))
                        .actions(vec![Action::Conntrack(CtAction {
                            commit: false,
                            nat: Some(CtNat::Restore),
                            recirc_table: Some(NAT_TABLE),
                        })]),
                );
                rules.push(
                    jump.matching(untracked.ipv4_dst(config.pod_cidr))
                        .actions(vec![Action::Conntrack(CtAction {
                            commit: false,
                            nat: Some(CtNat::Restore),
                            recirc_table: Some(ACL_EGRESS_TABLE),
                        })]),
                );
            }
        }
    }
    if config.nat_mode == NatMode::Stateful && !networks.is_empty() {
        // established connections were translated by the restore above
        rules.push(
            FlowRule::new(APP_SERVICE_NAT, device, NAT_TABLE, PRIORITY_CT_RULE)
                .matching(Match::ipv4().ct_state(CT_STATE_TRACKED, CT_STATE_TRACKED | CT_STATE_NEW))
                .actions(vec![Action::Goto(ACL_EGRESS_TABLE)]),
        );
    }
    rules
}

/// Complete rule and group set for `exposures` on `devices`.
pub fn nat_rules(
    config: &NetworkingConfig,
    devices: &[DeviceId],
    networks: &[LogicalNetwork],
    exposures: &[Exposure],
) -> DesiredState {
    let mut desired = DesiredState::default();
    for device in devices {
        let mut flows: BTreeMap<FlowKey, FlowRule> = BTreeMap::new();
        for rule in base_rules(config, device, networks) {
            flows.insert(rule.key(), rule);
        }
        for exp in exposures.iter().filter(|e| !e.backends.is_empty()) {
            desired.groups.push(group(config, device, exp));
            let rule = shift_rule(config, device, exp);
            flows.insert(rule.key(), rule);
            if config.nat_mode == NatMode::Stateless {
                for backend in &exp.backends {
                    let rule = unshift_rule(config, device, exp, *backend);
                    flows.insert(rule.key(), rule);
                }
            }
        }
        desired.flows.extend(flows.into_values());
    }
    desired
}

/// Service NAT, applied incrementally per event and converged on resync.
pub struct ServiceNatReconciler {
    ctx: Arc<Context>,
}

impl ServiceNatReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn host_gateways(&self) -> Result<HashMap<Ipv4Addr, Ipv4Addr>, StoreError> {
        let nodes = self.ctx.stores.nodes.list().await?;
        let networks = self.ctx.stores.networks.list().await?;
        Ok(node_ip_gateway_map(&nodes, &networks))
    }

    async fn endpoints_of(&self, service: &Service) -> Result<Option<Endpoints>, StoreError> {
        Ok(self
            .ctx
            .stores
            .endpoints
            .list()
            .await?
            .into_iter()
            .find(|e| e.namespace == service.namespace && e.name == service.name))
    }

    async fn service_of(&self, endpoints: &Endpoints) -> Result<Option<Service>, StoreError> {
        Ok(self
            .ctx
            .stores
            .services
            .list()
            .await?
            .into_iter()
            .find(|s| s.namespace == endpoints.namespace && s.name == endpoints.name))
    }

    async fn all_exposures(&self) -> Result<Vec<Exposure>, StoreError> {
        let gateways = self.host_gateways().await?;
        let endpoints = self.ctx.stores.endpoints.list().await?;
        let mut out = Vec::new();
        for service in self.ctx.stores.services.list().await? {
            let eps = endpoints
                .iter()
                .find(|e| e.namespace == service.namespace && e.name == service.name);
            out.extend(exposures(&service, eps, &gateways));
        }
        Ok(out)
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let config = self.ctx.config.current();
        let devices = self.ctx.complete_devices().await?;
        let networks = self.ctx.stores.networks.list().await?;
        let exposures = self.all_exposures().await?;
        let desired = nat_rules(&config, &devices, &networks, &exposures);
        self.ctx.programmer.converge(APP_SERVICE_NAT, &devices, &desired).await;
        Ok(())
    }

    /// Program the difference between two exposure sets of one service.
    ///
    /// Adding: reply rule, then bucket; a new group exists before the rule
    /// that sends traffic to it. Removing runs the reverse order.
    async fn apply_diff(&self, old: &[Exposure], new: &[Exposure]) -> Result<(), StoreError> {
        let config = self.ctx.config.current();
        let devices = self.ctx.complete_devices().await?;

        let mut needed: HashSet<BackendKey> = HashSet::new();
        for exp in self.all_exposures().await?.iter().chain(new) {
            needed.extend(exp.backends.iter().map(|(ip, port)| (*ip, *port, exp.protocol)));
        }

        let keys: BTreeSet<ExposureKey> = old.iter().chain(new).map(Exposure::key).collect();
        for key in keys {
            let before = old.iter().find(|e| e.key() == key).filter(|e| !e.backends.is_empty());
            let after = new.iter().find(|e| e.key() == key).filter(|e| !e.backends.is_empty());
            match (before, after) {
                (None, None) => {}
                (Some(b), Some(a)) if b.backends == a.backends => {}
                (None, Some(a)) => {
                    for device in &devices {
                        self.expose(&config, device, a).await;
                    }
                    info!(
                        "Service NAT: exposed {}:{}/{} ({} backends)",
                        a.vip,
                        a.port,
                        a.protocol,
                        a.backends.len()
                    );
                }
                (Some(b), None) => {
                    for device in &devices {
                        self.withdraw(&config, device, b, &needed).await;
                    }
                    info!("Service NAT: withdrew {}:{}/{}", b.vip, b.port, b.protocol);
                }
                (Some(b), Some(a)) => {
                    for device in &devices {
                        self.rebalance(&config, device, b, a, &needed).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn expose(&self, config: &NetworkingConfig, device: &DeviceId, exp: &Exposure) {
        let programmer = &self.ctx.programmer;
        if config.nat_mode == NatMode::Stateless {
            for backend in &exp.backends {
                programmer
                    .set_rule(unshift_rule(config, device, exp, *backend), true)
                    .await;
            }
        }
        programmer.set_group(group(config, device, exp), true).await;
        programmer.set_rule(shift_rule(config, device, exp), true).await;
    }

    async fn withdraw(
        &self,
        config: &NetworkingConfig,
        device: &DeviceId,
        exp: &Exposure,
        needed: &HashSet<BackendKey>,
    ) {
        let programmer = &self.ctx.programmer;
        programmer.set_rule(shift_rule(config, device, exp), false).await;
        programmer.set_group(group(config, device, exp), false).await;
        if config.nat_mode == NatMode::Stateless {
            for backend in &exp.backends {
                if !needed.contains(&(backend.0, backend.1, exp.protocol)) {
                    programmer
                        .set_rule(unshift_rule(config, device, exp, *backend), false)
                        .await;
                }
            }
        }
    }

    async fn rebalance(
        &self,
        config: &NetworkingConfig,
        device: &DeviceId,
        before: &Exposure,
        after: &Exposure,
        needed: &HashSet<BackendKey>,
    ) {
        let programmer = &self.ctx.programmer;
        let id = after.group_id();
        if programmer.has_group(device, id).await {
            for backend in after.backends.difference(&before.backends) {
                if config.nat_mode == NatMode::Stateless {
                    programmer
                        .set_rule(unshift_rule(config, device, after, *backend), true)
                        .await;
                }
                programmer
                    .set_buckets(device, id, vec![bucket(config, *backend)], true)
                    .await;
            }
            for backend in before.backends.difference(&after.backends) {
                programmer
                    .set_buckets(device, id, vec![bucket(config, *backend)], false)
                    .await;
            }
        } else {
            warn!("Service NAT: group {} missing on {}, reinstalling", id, device);
            self.expose(config, device, after).await;
        }
        if config.nat_mode == NatMode::Stateless {
            for backend in before.backends.difference(&after.backends) {
                if !needed.contains(&(backend.0, backend.1, before.protocol)) {
                    programmer
                        .set_rule(unshift_rule(config, device, before, *backend), false)
                        .await;
                }
            }
        }
    }

    async fn on_service(&self, event: ResourceEvent<Service>) -> Result<(), StoreError> {
        let gateways = self.host_gateways().await?;
        let eps = self.endpoints_of(&event.subject).await?;
        let (old, new) = match event.kind {
            EventKind::Created => (Vec::new(), exposures(&event.subject, eps.as_ref(), &gateways)),
            EventKind::Updated => match &event.previous {
                Some(previous) => (
                    exposures(previous, eps.as_ref(), &gateways),
                    exposures(&event.subject, eps.as_ref(), &gateways),
                ),
                None => return Ok(()),
            },
            EventKind::Removed => (exposures(&event.subject, eps.as_ref(), &gateways), Vec::new()),
            EventKind::Transition(_) => return Ok(()),
        };
        self.apply_diff(&old, &new).await
    }

    async fn on_endpoints(&self, event: ResourceEvent<Endpoints>) -> Result<(), StoreError> {
        let Some(service) = self.service_of(&event.subject).await? else {
            return Ok(());
        };
        let gateways = self.host_gateways().await?;
        let (old, new) = match event.kind {
            EventKind::Created => (
                Vec::new(),
                exposures(&service, Some(&event.subject), &gateways),
            ),
            EventKind::Updated => (
                exposures(&service, event.previous.as_ref(), &gateways),
                exposures(&service, Some(&event.subject), &gateways),
            ),
            EventKind::Removed => (
                exposures(&service, Some(&event.subject), &gateways),
                Vec::new(),
            ),
            EventKind::Transition(_) => return Ok(()),
        };
        self.apply_diff(&old, &new).await
    }

    async fn on_node(&self, event: ResourceEvent<Node>) -> Result<(), StoreError> {
        match event.kind {
            EventKind::Created if event.subject.is_complete() => self.converge().await,
            EventKind::Transition(NodeTransition::Complete) => self.converge().await,
            EventKind::Transition(_) | EventKind::Removed => {
                self.ctx
                    .clear_device(APP_SERVICE_NAT, &event.subject.integration_bridge)
                    .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Reconciler for ServiceNatReconciler {
    type Event = ServiceNatEvent;

    fn name(&self) -> &'static str {
        "service-nat"
    }

    async fn handle(&self, event: ServiceNatEvent) {
        let result = match event {
            ServiceNatEvent::Service(ev) => self.on_service(ev).await,
            ServiceNatEvent::Endpoints(ev) => self.on_endpoints(ev).await,
            ServiceNatEvent::Node(ev) => self.on_node(ev).await,
            ServiceNatEvent::Network(_) => self.converge().await,
        };
        log_failure(self.name(), "event", result);
    }

    async fn resync(&self) {
        let result = self.converge().await;
        log_failure(self.name(), "resync", result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::switching::SwitchingReconciler;
    use pkg_constants::pipeline::STAT_INBOUND_TABLE;
    use pkg_pipeline::{Conntrack, Packet, Verdict};
    use pkg_types::endpoint::{EndpointAddress, EndpointPort, EndpointSubset};
    use pkg_types::service::ServicePort;

    const VIP: &str = "10.96.0.10";

    async fn cluster(mode: NatMode, backends: &[(&str, u16)]) -> Harness {
        let h = harness(NetworkingConfig {
            nat_mode: mode,
            ..Default::default()
        });
        let stores = &h.ctx.stores;
        stores.nodes.create(node(1, false)).await.unwrap();
        stores.networks.create(network(1)).await.unwrap();
        for host in [5, 6, 7] {
            stores.ports.create(port(1, host)).await.unwrap();
        }
        stores.services.create(service("web", VIP, 80, None)).await.unwrap();
        stores.endpoints.create(endpoints("web", backends)).await.unwrap();
        SwitchingReconciler::new(h.ctx.clone()).resync().await;
        h
    }

    fn created<T: pkg_types::Resource>(subject: T) -> ResourceEvent<T> {
        ResourceEvent {
            seq: 1,
            kind: EventKind::Created,
            subject,
            previous: None,
        }
    }

    fn updated<T: pkg_types::Resource>(previous: T, subject: T) -> ResourceEvent<T> {
        ResourceEvent {
            seq: 2,
            kind: EventKind::Updated,
            subject,
            previous: Some(previous),
        }
    }

    fn output(verdict: Verdict) -> (u32, Packet) {
        match verdict {
            Verdict::Output { port, packet } => (port, packet),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[tokio::test]
    async fn stateless_round_trip() {
        let h = cluster(NatMode::Stateless, &[("10.10.1.5", 8080)]).await;
        ServiceNatReconciler::new(h.ctx.clone()).resync().await;
        let tables = h.switch.tables(&bridge(1)).await;
        let mut ct = Conntrack::new();

        let request = Packet::tcp((ip("10.10.1.7"), 40000), (ip(VIP), 80)).from_port(7);
        let (out, pkt) = output(tables.trace(&mut ct, request, STAT_INBOUND_TABLE).verdict);
        assert_eq!(out, 5);
        assert_eq!((pkt.ipv4_dst, pkt.l4_dst), (ip("10.10.1.5"), 8080));
        assert_eq!(pkt.ipv4_src, ip("172.10.1.7"));

        let reply = Packet::tcp((ip("10.10.1.5"), 8080), (pkt.ipv4_src, 40000)).from_port(5);
        let (out, pkt) = output(tables.trace(&mut ct, reply, STAT_INBOUND_TABLE).verdict);
        assert_eq!(out, 7);
        assert_eq!((pkt.ipv4_src, pkt.l4_src), (ip(VIP), 80));
        assert_eq!(pkt.ipv4_dst, ip("10.10.1.7"));
        assert!(ct.is_empty());
    }

    #[tokio::test]
    async fn stateful_round_trip() {
        let h = cluster(NatMode::Stateful, &[("10.10.1.5", 8080)]).await;
        ServiceNatReconciler::new(h.ctx.clone()).resync().await;
        let tables = h.switch.tables(&bridge(1)).await;
        let mut ct = Conntrack::new();

        let request = Packet::tcp((ip("10.10.1.7"), 40000), (ip(VIP), 80)).from_port(7);
        let (out, pkt) = output(tables.trace(&mut ct, request.clone(), STAT_INBOUND_TABLE).verdict);
        assert_eq!(out, 5);
        assert_eq!((pkt.ipv4_dst, pkt.l4_dst), (ip("10.10.1.5"), 8080));
        assert_eq!(pkt.ipv4_src, ip("10.10.1.7"));
        assert_eq!(ct.len(), 1);

        // follow-up packets ride the established connection
        let (out, _) = output(tables.trace(&mut ct, request, STAT_INBOUND_TABLE).verdict);
        assert_eq!(out, 5);

        let reply = Packet::tcp((ip("10.10.1.5"), 8080), (ip("10.10.1.7"), 40000)).from_port(5);
        let (out, pkt) = output(tables.trace(&mut ct, reply, STAT_INBOUND_TABLE).verdict);
        assert_eq!(out, 7);
        assert_eq!((pkt.ipv4_src, pkt.l4_src), (ip(VIP), 80));
    }

    #[tokio::test]
    async fn incremental_matches_resync() {
        let h = cluster(NatMode::Stateless, &[("10.10.1.5", 8080), ("10.10.1.6", 8080)]).await;
        let reconciler = ServiceNatReconciler::new(h.ctx.clone());
        // entry rules come from a converge, services from events
        reconciler.resync().await;
        let gid = GroupId::for_service(ip(VIP), 80, Protocol::Tcp);
        assert_eq!(
            h.ctx.programmer.group(&bridge(1), gid).await.unwrap().buckets.len(),
            2
        );

        let before = endpoints("web", &[("10.10.1.5", 8080), ("10.10.1.6", 8080)]);
        let after = endpoints("web", &[("10.10.1.5", 8080)]);
        h.ctx.stores.endpoints.update(after.clone()).await.unwrap();
        reconciler
            .handle(ServiceNatEvent::Endpoints(updated(before, after)))
            .await;

        let incremental = h.switch.tables(&bridge(1)).await;
        assert_eq!(incremental.group(gid).unwrap().buckets.len(), 1);
        let pod_rules = incremental.flows().iter().filter(|r| r.table == POD_TABLE).count();
        assert_eq!(pod_rules, 1);

        let flows_before = incremental.flows().to_vec();
        reconciler.resync().await;
        let converged = h.switch.tables(&bridge(1)).await;
        assert_eq!(converged.flows(), flows_before.as_slice());
    }

    #[tokio::test]
    async fn backend_change_reinstalls_missing_group() {
        let h = cluster(NatMode::Stateless, &[("10.10.1.5", 8080)]).await;
        let reconciler = ServiceNatReconciler::new(h.ctx.clone());
        reconciler.resync().await;
        let gid = GroupId::for_service(ip(VIP), 80, Protocol::Tcp);
        let lost = h.ctx.programmer.group(&bridge(1), gid).await.unwrap();
        h.ctx.programmer.set_group(lost, false).await;

        let before = endpoints("web", &[("10.10.1.5", 8080)]);
        let after = endpoints("web", &[("10.10.1.5", 8080), ("10.10.1.6", 8080)]);
        h.ctx.stores.endpoints.update(after.clone()).await.unwrap();
        reconciler
            .handle(ServiceNatEvent::Endpoints(updated(before, after)))
            .await;

        let tables = h.switch.tables(&bridge(1)).await;
        assert_eq!(tables.group(gid).unwrap().buckets.len(), 2);
        let request = Packet::tcp((ip("10.10.1.7"), 40000), (ip(VIP), 80)).from_port(7);
        let (out, _) = output(tables.trace(&mut Conntrack::new(), request, STAT_INBOUND_TABLE).verdict);
        assert!(out == 5 || out == 6);
    }

    #[tokio::test]
    async fn service_lifecycle_events() {
        let h = cluster(NatMode::Stateless, &[]).await;
        let reconciler = ServiceNatReconciler::new(h.ctx.clone());
        let gid = GroupId::for_service(ip(VIP), 80, Protocol::Tcp);

        // no backends yet: nothing exposed
        reconciler
            .handle(ServiceNatEvent::Service(created(service("web", VIP, 80, None))))
            .await;
        assert!(!h.ctx.programmer.has_group(&bridge(1), gid).await);

        let eps = endpoints("web", &[("10.10.1.5", 8080)]);
        h.ctx.stores.endpoints.update(eps.clone()).await.unwrap();
        reconciler
            .handle(ServiceNatEvent::Endpoints(updated(endpoints("web", &[]), eps)))
            .await;
        assert!(h.ctx.programmer.has_group(&bridge(1), gid).await);
        assert!(
            h.switch
                .tables(&bridge(1))
                .await
                .flows()
                .iter()
                .any(|r| r.table == SERVICE_TABLE)
        );

        let svc = h.ctx.stores.services.remove("svc-web").await.unwrap();
        reconciler
            .handle(ServiceNatEvent::Service(ResourceEvent {
                seq: 3,
                kind: EventKind::Removed,
                subject: svc,
                previous: None,
            }))
            .await;
        let tables = h.switch.tables(&bridge(1)).await;
        assert!(tables.group(gid).is_none());
        assert!(
            !tables
                .flows()
                .iter()
                .any(|r| r.table == SERVICE_TABLE || r.table == POD_TABLE)
        );
        assert_eq!(h.ctx.programmer.failures(), 0);
    }

    #[tokio::test]
    async fn mode_switch_converges() {
        let h = cluster(NatMode::Stateless, &[("10.10.1.5", 8080)]).await;
        let reconciler = ServiceNatReconciler::new(h.ctx.clone());
        reconciler.resync().await;

        h.ctx.config.replace(NetworkingConfig {
            nat_mode: NatMode::Stateful,
            ..Default::default()
        });
        reconciler.resync().await;
        let tables = h.switch.tables(&bridge(1)).await;
        assert!(
            !tables
                .flows()
                .iter()
                .any(|r| r.table == SERVICE_TABLE || r.table == POD_TABLE)
        );
        assert!(tables.flows().iter().any(|r| r.table == NAT_TABLE));
    }

    #[test]
    fn host_network_backends_use_gateway() {
        let svc = service("dns", VIP, 53, None);
        let eps = endpoints("dns", &[("192.168.0.11", 53), ("10.10.1.5", 53)]);
        let gateways = HashMap::from([(ip("192.168.0.11"), ip("10.10.1.1"))]);
        let exps = exposures(&svc, Some(&eps), &gateways);
        assert_eq!(exps.len(), 1);
        assert_eq!(
            exps[0].backends,
            BTreeSet::from([(ip("10.10.1.1"), 53), (ip("10.10.1.5"), 53)])
        );
    }

    #[test]
    fn every_service_port_is_exposed() {
        let mut svc = service("web", VIP, 80, None);
        svc.spec.ports = vec![
            ServicePort {
                name: Some("http".to_string()),
                protocol: Protocol::Tcp,
                port: 80,
                target_port: None,
                node_port: None,
            },
            ServicePort {
                name: Some("dns".to_string()),
                protocol: Protocol::Udp,
                port: 53,
                target_port: None,
                node_port: None,
            },
        ];
        let mut eps = endpoints("web", &[]);
        eps.subsets = vec![EndpointSubset {
            addresses: vec![EndpointAddress {
                ip: "10.10.1.5".to_string(),
                node_name: None,
                pod_id: None,
            }],
            ports: vec![
                EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    protocol: Protocol::Tcp,
                },
                EndpointPort {
                    name: Some("dns".to_string()),
                    port: 5353,
                    protocol: Protocol::Udp,
                },
            ],
        }];
        let exps = exposures(&svc, Some(&eps), &HashMap::new());
        assert_eq!(exps.len(), 2);
        assert_eq!(exps[0].backends, BTreeSet::from([(ip("10.10.1.5"), 8080)]));
        assert_eq!(exps[1].protocol, Protocol::Udp);
        assert_eq!(exps[1].backends, BTreeSet::from([(ip("10.10.1.5"), 5353)]));
        assert_ne!(exps[0].group_id(), exps[1].group_id());
    }

    #[test]
    fn headless_service_has_no_exposure() {
        let svc = service("db", "None", 5432, None);
        assert!(exposures(&svc, None, &HashMap::new()).is_empty());
    }
}
