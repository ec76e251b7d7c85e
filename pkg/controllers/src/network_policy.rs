use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use pkg_constants::pipeline::{
    ACL_EGRESS_TABLE, ACL_INGRESS_TABLE, APP_NETWORK_POLICY, PRIORITY_ACL_ALLOW_RULE,
    PRIORITY_ACL_BLOCK_RULE, ROUTING_TABLE,
};
use pkg_network::addressing::{b_class_prefix, port_range_matches, shift_ip, subtract_nets};
use pkg_pipeline::{Action, DesiredState, FlowKey, FlowRule, Match};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::config::NetworkingConfig;
use pkg_types::namespace::Namespace;
use pkg_types::net::{DeviceId, IntOrString};
use pkg_types::network_policy::{NetworkPolicy, PolicyPeer, PolicyPort, PolicyType};
use pkg_types::node::{Node, NodeTransition};
use pkg_types::pod::Pod;

use crate::context::{Context, log_failure};
use crate::runner::Reconciler;

pub enum PolicyEvent {
    Policy(ResourceEvent<NetworkPolicy>),
    Pod(ResourceEvent<Pod>),
    Namespace(ResourceEvent<Namespace>),
    Node(ResourceEvent<Node>),
}

/// Pods that take part in policy: addressed, not on the host network and
/// still running.
fn selectable(pod: &Pod) -> bool {
    !pod.spec.host_network && pod.ip().is_some() && !pod.is_terminated()
}

struct Peer<'a> {
    net: Ipv4Net,
    pod: Option<&'a Pod>,
}

/// Addresses a peer stands for. An ipBlock yields its cidr minus its
/// excepts, so an except only narrows the block it belongs to.
///
/// Pod peers also yield their shifted address: service traffic under
/// stateless NAT carries the client in the shifted range.
fn resolve_peer<'a>(
    config: &NetworkingConfig,
    policy: &NetworkPolicy,
    peer: &PolicyPeer,
    pods: &'a [Pod],
    namespaces: &[Namespace],
) -> Vec<Peer<'a>> {
    if let Some(block) = &peer.ip_block {
        return subtract_nets(block.cidr, &block.except)
            .into_iter()
            .map(|net| Peer { net, pod: None })
            .collect();
    }
    let in_scope: HashSet<&str> = match &peer.namespace_selector {
        Some(selector) => namespaces
            .iter()
            .filter(|ns| selector.matches(&ns.labels))
            .map(|ns| ns.name.as_str())
            .collect(),
        None => HashSet::from([policy.namespace.as_str()]),
    };
    let shifted = b_class_prefix(config.shifted_cidr);
    pods.iter()
        .filter(|p| selectable(p) && in_scope.contains(p.namespace.as_str()))
        .filter(|p| peer.pod_selector.as_ref().is_none_or(|s| s.matches(&p.labels)))
        .filter_map(|p| p.ip().map(|ip| (p, ip)))
        .flat_map(|(p, ip)| {
            [ip, shift_ip(ip, shifted)].map(|addr| Peer {
                net: Ipv4Net::from(addr),
                pod: Some(p),
            })
        })
        .collect()
}

/// L4 part of an allow rule, one match per port entry (or range chunk).
/// Named ports resolve against `named_on`; unresolved names match nothing.
fn l4_matches(ports: &[PolicyPort], named_on: Option<&Pod>) -> Vec<Match> {
    if ports.is_empty() {
        return vec![Match::ipv4()];
    }
    let mut out = Vec::new();
    for spec in ports {
        let base = Match::ipv4().protocol(spec.protocol);
        match (&spec.port, spec.end_port) {
            (None, _) => out.push(base),
            (Some(IntOrString::Int(start)), Some(end)) if end >= *start => {
                for (port, mask) in port_range_matches(*start, end) {
                    out.push(base.clone().l4_dst_masked(port, mask));
                }
            }
            (Some(IntOrString::Int(port)), _) => out.push(base.l4_dst(*port)),
            (Some(IntOrString::String(name)), _) => {
                if let Some(port) = named_on.and_then(|p| p.container_port(name, Some(spec.protocol))) {
                    out.push(base.l4_dst(port));
                }
            }
        }
    }
    out
}

struct RuleSet<'a> {
    devices: &'a [DeviceId],
    flows: BTreeMap<FlowKey, FlowRule>,
}

impl RuleSet<'_> {
    fn add(&mut self, table: u8, priority: u16, selector: Match, actions: Vec<Action>) {
        for device in self.devices {
            let rule = FlowRule::new(APP_NETWORK_POLICY, device, table, priority)
                .matching(selector.clone())
                .actions(actions.clone());
            self.flows.insert(rule.key(), rule);
        }
    }
}

/// Complete ACL rule set for the cluster.
///
/// An isolated pod gets a block rule in the table of the isolated direction
/// and allow rules above it; allows from every policy add up. A packet
/// passes the egress table (sender's policies) and then the ingress table
/// (receiver's policies).
pub fn acl_rules(
    config: &NetworkingConfig,
    devices: &[DeviceId],
    policies: &[NetworkPolicy],
    pods: &[Pod],
    namespaces: &[Namespace],
) -> DesiredState {
    let mut set = RuleSet {
        devices,
        flows: BTreeMap::new(),
    };
    let shifted = b_class_prefix(config.shifted_cidr);

    for policy in policies {
        let targets: Vec<&Pod> = pods
            .iter()
            .filter(|p| selectable(p) && p.namespace == policy.namespace)
            .filter(|p| policy.pod_selector.matches(&p.labels))
            .collect();

        if policy.isolates(PolicyType::Ingress) {
            for target in &targets {
                let Some(tip) = target.ip() else { continue };
                set.add(
                    ACL_INGRESS_TABLE,
                    PRIORITY_ACL_BLOCK_RULE,
                    Match::ipv4().ipv4_dst_host(tip),
                    vec![Action::Drop],
                );
                // replies from a service VIP
                set.add(
                    ACL_INGRESS_TABLE,
                    PRIORITY_ACL_ALLOW_RULE,
                    Match::ipv4().ipv4_src(config.service_cidr).ipv4_dst_host(tip),
                    vec![Action::Goto(ROUTING_TABLE)],
                );
                for rule in policy.rules(PolicyType::Ingress) {
                    let l4 = l4_matches(&rule.ports, Some(target));
                    let mut sources: Vec<Option<Ipv4Net>> = Vec::new();
                    if rule.peers.is_empty() {
                        sources.push(None);
                    }
                    for peer in &rule.peers {
                        let resolved = resolve_peer(config, policy, peer, pods, namespaces);
                        sources.extend(resolved.into_iter().map(|p| Some(p.net)));
                    }
                    for src in &sources {
                        for m in &l4 {
                            let mut selector = m.clone().ipv4_dst_host(tip);
                            if let Some(net) = src {
                                selector = selector.ipv4_src(*net);
                            }
                            set.add(
                                ACL_INGRESS_TABLE,
                                PRIORITY_ACL_ALLOW_RULE,
                                selector,
                                vec![Action::Goto(ROUTING_TABLE)],
                            );
                        }
                    }
                }
            }
        }

        if policy.isolates(PolicyType::Egress) {
            for target in &targets {
                let Some(tip) = target.ip() else { continue };
                for src in [tip, shift_ip(tip, shifted)] {
                    set.add(
                        ACL_EGRESS_TABLE,
                        PRIORITY_ACL_BLOCK_RULE,
                        Match::ipv4().ipv4_src_host(src),
                        vec![Action::Drop],
                    );
                    for rule in policy.rules(PolicyType::Egress) {
                        let mut dests: Vec<(Option<Ipv4Net>, Option<&Pod>)> = Vec::new();
                        if rule.peers.is_empty() {
                            dests.push((None, None));
                        }
                        for peer in &rule.peers {
                            let resolved = resolve_peer(config, policy, peer, pods, namespaces);
                            dests.extend(resolved.into_iter().map(|p| (Some(p.net), p.pod)));
                        }
                        for (dst, peer_pod) in &dests {
                            for m in l4_matches(&rule.ports, *peer_pod) {
                                let mut selector = m.ipv4_src_host(src);
                                if let Some(net) = dst {
                                    selector = selector.ipv4_dst(*net);
                                }
                                set.add(
                                    ACL_EGRESS_TABLE,
                                    PRIORITY_ACL_ALLOW_RULE,
                                    selector,
                                    vec![Action::Goto(ACL_INGRESS_TABLE)],
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    DesiredState {
        flows: set.flows.into_values().collect(),
        groups: Vec::new(),
    }
}

/// Network policy enforcement. Events recompute the full ACL set and
/// program the difference against what this instance last applied.
pub struct NetworkPolicyReconciler {
    ctx: Arc<Context>,
    applied: Mutex<BTreeMap<FlowKey, FlowRule>>,
}

impl NetworkPolicyReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            applied: Mutex::new(BTreeMap::new()),
        }
    }

    async fn desired(&self) -> Result<(Vec<DeviceId>, DesiredState), StoreError> {
        let config = self.ctx.config.current();
        let devices = self.ctx.complete_devices().await?;
        let policies = self.ctx.stores.policies.list().await?;
        let pods = self.ctx.stores.pods.list().await?;
        let namespaces = self.ctx.stores.namespaces.list().await?;
        let desired = acl_rules(&config, &devices, &policies, &pods, &namespaces);
        Ok((devices, desired))
    }

    async fn reconcile(&self) -> Result<(), StoreError> {
        let (_, desired) = self.desired().await?;
        let wanted: BTreeMap<FlowKey, FlowRule> =
            desired.flows.into_iter().map(|r| (r.key(), r)).collect();
        let mut applied = self.applied.lock().await;

        let mut installed = 0;
        for (key, rule) in &wanted {
            if applied.get(key) != Some(rule) {
                self.ctx.programmer.set_rule(rule.clone(), true).await;
                installed += 1;
            }
        }
        let mut removed = 0;
        for (key, rule) in applied.iter() {
            if !wanted.contains_key(key) {
                self.ctx.programmer.set_rule(rule.clone(), false).await;
                removed += 1;
            }
        }
        if installed + removed > 0 {
            info!("Network policy: {} rule(s) installed, {} removed", installed, removed);
        }
        *applied = wanted;
        Ok(())
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let (devices, desired) = self.desired().await?;
        let mut applied = self.applied.lock().await;
        self.ctx
            .programmer
            .converge(APP_NETWORK_POLICY, &devices, &desired)
            .await;
        *applied = desired.flows.into_iter().map(|r| (r.key(), r)).collect();
        Ok(())
    }

    async fn on_node(&self, event: ResourceEvent<Node>) -> Result<(), StoreError> {
        match event.kind {
            EventKind::Created if event.subject.is_complete() => self.converge().await,
            EventKind::Transition(NodeTransition::Complete) => self.converge().await,
            EventKind::Transition(_) | EventKind::Removed => {
                let device = &event.subject.integration_bridge;
                self.ctx.clear_device(APP_NETWORK_POLICY, device).await;
                self.applied.lock().await.retain(|key, _| &key.device != device);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Reconciler for NetworkPolicyReconciler {
    type Event = PolicyEvent;

    fn name(&self) -> &'static str {
        "network-policy"
    }

    async fn handle(&self, event: PolicyEvent) {
        let result = match event {
            PolicyEvent::Node(ev) => self.on_node(ev).await,
            PolicyEvent::Pod(ev) if matches!(ev.kind, EventKind::Transition(_)) => Ok(()),
            _ => self.reconcile().await,
        };
        log_failure(self.name(), "event", result);
    }

    async fn resync(&self) {
        let result = self.converge().await;
        log_failure(self.name(), "resync", result);
    }
}
