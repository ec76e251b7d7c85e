use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use pkg_constants::pipeline::{
    APP_SWITCHING, ARP_TABLE, FORWARDING_TABLE, PRIORITY_INTERNAL_ROUTING_RULE,
    PRIORITY_SWITCHING_RULE, PRIORITY_TUNNEL_INGRESS_RULE, PRIORITY_TUNNEL_TAG_RULE, ROUTING_TABLE,
    SKELETON_TABLES, STAT_OUTBOUND_TABLE, VTAG_TABLE,
};
use pkg_pipeline::{Action, DesiredState, FlowProgrammer, FlowRule, Match};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::network::LogicalNetwork;
use pkg_types::node::{Node, NodeTransition};
use pkg_types::port::{LogicalPort, PortTransition};

use crate::context::{Context, log_failure};
use crate::runner::Reconciler;

pub enum SwitchingEvent {
    Node(ResourceEvent<Node>),
    Network(ResourceEvent<LogicalNetwork>),
    Port(ResourceEvent<LogicalPort>),
}

/// Table skeleton of a complete node plus L2/L3 forwarding for every
/// active port.
pub struct SwitchingReconciler {
    ctx: Arc<Context>,
}

/// Default transitions along the skeleton, and the tunnel entry that skips
/// segment tagging for traffic already tagged by the sending node.
pub fn skeleton_rules(node: &Node) -> Vec<FlowRule> {
    let device = &node.integration_bridge;
    let mut rules: Vec<FlowRule> = SKELETON_TABLES
        .windows(2)
        .map(|w| FlowProgrammer::transition(APP_SWITCHING, device, w[0], w[1]))
        .collect();
    if let Some(tunnel) = node.tunnel_port {
        rules.push(
            FlowRule::new(APP_SWITCHING, device, VTAG_TABLE, PRIORITY_TUNNEL_INGRESS_RULE)
                .matching(Match::any().in_port(tunnel))
                .actions(vec![Action::Goto(ARP_TABLE)]),
        );
    }
    rules
}

/// Rules one active port needs on every complete node.
pub fn port_rules(port: &LogicalPort, nodes: &[Node], networks: &[LogicalNetwork]) -> Vec<FlowRule> {
    let mut rules = Vec::new();
    let Some(number) = port.port_number.filter(|_| port.is_active()) else {
        return rules;
    };
    let Some(network) = networks.iter().find(|n| n.network_id == port.network_id) else {
        return rules;
    };
    let owner = nodes.iter().find(|n| n.integration_bridge == port.device_id);

    for node in nodes {
        let device = &node.integration_bridge;
        let local = *device == port.device_id;

        if local {
            rules.push(
                FlowRule::new(APP_SWITCHING, device, VTAG_TABLE, PRIORITY_TUNNEL_TAG_RULE)
                    .matching(Match::any().in_port(number))
                    .actions(vec![
                        Action::SetTunnelId(network.segment_id),
                        Action::Goto(ARP_TABLE),
                    ]),
            );
        }

        rules.push(
            FlowRule::new(APP_SWITCHING, device, ROUTING_TABLE, PRIORITY_INTERNAL_ROUTING_RULE)
                .matching(Match::ipv4().ipv4_dst_host(port.ip_address))
                .actions(vec![
                    Action::SetEthDst(port.mac_address),
                    Action::Goto(STAT_OUTBOUND_TABLE),
                ]),
        );

        let forward = FlowRule::new(APP_SWITCHING, device, FORWARDING_TABLE, PRIORITY_SWITCHING_RULE)
            .matching(Match::any().eth_dst(port.mac_address));
        if local {
            rules.push(forward.actions(vec![Action::Output(number)]));
        } else if let (Some(owner), Some(tunnel)) = (owner, node.tunnel_port) {
            rules.push(forward.actions(vec![
                Action::SetTunnelId(network.segment_id),
                Action::SetTunnelDst(owner.node_ip),
                Action::Output(tunnel),
            ]));
        }
    }
    rules
}

pub fn desired_state(nodes: &[Node], networks: &[LogicalNetwork], ports: &[LogicalPort]) -> DesiredState {
    let mut desired = DesiredState::default();
    for node in nodes.iter().filter(|n| n.is_complete()) {
        desired.flows.extend(skeleton_rules(node));
    }
    let complete: Vec<Node> = nodes.iter().filter(|n| n.is_complete()).cloned().collect();
    for port in ports {
        desired.flows.extend(port_rules(port, &complete, networks));
    }
    desired
}

impl SwitchingReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn set_port(&self, port: &LogicalPort, install: bool) -> Result<(), StoreError> {
        let nodes = self.ctx.complete_nodes().await?;
        let networks = self.ctx.stores.networks.list().await?;
        for rule in port_rules(port, &nodes, &networks) {
            self.ctx.programmer.set_rule(rule, install).await;
        }
        info!(
            "Switching: {} port {} ({})",
            if install { "wired" } else { "unwired" },
            port.port_id,
            port.ip_address
        );
        Ok(())
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let nodes = self.ctx.stores.nodes.list().await?;
        let networks = self.ctx.stores.networks.list().await?;
        let ports = self.ctx.stores.ports.list().await?;
        let desired = desired_state(&nodes, &networks, &ports);
        self.ctx.converge(APP_SWITCHING, &desired).await
    }

    async fn on_node(&self, event: ResourceEvent<Node>) -> Result<(), StoreError> {
        match event.kind {
            EventKind::Created if event.subject.is_complete() => self.converge().await,
            EventKind::Transition(NodeTransition::Complete) => {
                info!("Switching: node {} complete, building pipeline", event.subject.hostname);
                self.converge().await
            }
            EventKind::Transition(NodeTransition::Incomplete | NodeTransition::OffBoarded)
            | EventKind::Removed => {
                self.ctx
                    .clear_device(APP_SWITCHING, &event.subject.integration_bridge)
                    .await;
                self.converge().await
            }
            _ => Ok(()),
        }
    }

    async fn on_port(&self, event: ResourceEvent<LogicalPort>) -> Result<(), StoreError> {
        match event.kind {
            EventKind::Created | EventKind::Transition(PortTransition::Activated) => {
                self.set_port(&event.subject, true).await
            }
            EventKind::Transition(PortTransition::Inactivated) => match &event.previous {
                Some(previous) => self.set_port(previous, false).await,
                None => Ok(()),
            },
            EventKind::Removed => self.set_port(&event.subject, false).await,
            EventKind::Updated => match &event.previous {
                Some(previous)
                    if previous.is_active() && event.subject.is_active() && *previous != event.subject =>
                {
                    self.set_port(previous, false).await?;
                    self.set_port(&event.subject, true).await
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Reconciler for SwitchingReconciler {
    type Event = SwitchingEvent;

    fn name(&self) -> &'static str {
        "switching"
    }

    async fn handle(&self, event: SwitchingEvent) {
        let result = match event {
            SwitchingEvent::Node(ev) => self.on_node(ev).await,
            SwitchingEvent::Port(ev) => self.on_port(ev).await,
            SwitchingEvent::Network(ev) => match ev.kind {
                EventKind::Transition(_) => Ok(()),
                _ => self.converge().await,
            },
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
    use pkg_constants::pipeline::STAT_INBOUND_TABLE;
    use pkg_pipeline::{Conntrack, Packet, Verdict};
    use pkg_types::node::NodeState;
    use pkg_types::port::PortState;

    fn event<T: pkg_types::Resource>(kind: EventKind<T::Transition>, subject: T, previous: Option<T>) -> ResourceEvent<T> {
        ResourceEvent {
            seq: 1,
            kind,
            subject,
            previous,
        }
    }

    async fn two_node_cluster() -> Harness {
        let h = harness(Default::default());
        let stores = &h.ctx.stores;
        for n in 1..=2 {
            stores.nodes.create(node(n, false)).await.unwrap();
            stores.networks.create(network(n)).await.unwrap();
        }
        stores.ports.create(port(1, 5)).await.unwrap();
        stores.ports.create(port(1, 7)).await.unwrap();
        stores.ports.create(port(2, 9)).await.unwrap();
        h
    }

    #[tokio::test]
    async fn skeleton_on_complete_node() {
        let h = harness(Default::default());
        h.ctx.stores.nodes.create(node(1, false)).await.unwrap();
        let reconciler = SwitchingReconciler::new(h.ctx.clone());
        reconciler.resync().await;
        // ten transitions plus the tunnel entry
        assert_eq!(h.switch.flow_count(&bridge(1)).await, SKELETON_TABLES.len());
    }

    #[tokio::test]
    async fn local_and_remote_forwarding() {
        let h = two_node_cluster().await;
        let reconciler = SwitchingReconciler::new(h.ctx.clone());
        reconciler.resync().await;

        let tables = h.switch.tables(&bridge(1)).await;
        let mut ct = Conntrack::new();

        let local = Packet::tcp((ip("10.10.1.7"), 40000), (ip("10.10.1.5"), 80)).from_port(7);
        let trace = tables.trace(&mut ct, local, STAT_INBOUND_TABLE);
        let Verdict::Output { port, packet } = trace.verdict else {
            panic!("unexpected verdict {:?}", trace.verdict);
        };
        assert_eq!(port, 5);
        assert_eq!(packet.tunnel_id, Some(101));

        let remote = Packet::tcp((ip("10.10.1.7"), 40000), (ip("10.10.2.9"), 80)).from_port(7);
        let trace = tables.trace(&mut ct, remote, STAT_INBOUND_TABLE);
        let Verdict::Output { port, packet } = trace.verdict else {
            panic!("unexpected verdict {:?}", trace.verdict);
        };
        assert_eq!(port, 1);
        assert_eq!(packet.tunnel_dst, Some(node(2, false).node_ip));
        assert_eq!(packet.tunnel_id, Some(102));

        // and it lands on the owner's port when it arrives through the tunnel
        let tables = h.switch.tables(&bridge(2)).await;
        let trace = tables.trace(&mut ct, packet.from_port(1), STAT_INBOUND_TABLE);
        assert!(matches!(trace.verdict, Verdict::Output { port: 9, .. }));
    }

    #[tokio::test]
    async fn node_leaving_is_cleared() {
        let h = two_node_cluster().await;
        let reconciler = SwitchingReconciler::new(h.ctx.clone());
        reconciler.resync().await;
        assert!(h.switch.flow_count(&bridge(2)).await > 0);

        let mut gone = node(2, false);
        gone.state = NodeState::Incomplete;
        h.ctx.stores.nodes.update(gone.clone()).await.unwrap();
        reconciler
            .handle(SwitchingEvent::Node(event(
                EventKind::Transition(NodeTransition::Incomplete),
                gone,
                Some(node(2, false)),
            )))
            .await;
        assert_eq!(h.switch.flow_count(&bridge(2)).await, 0);
        assert!(h.switch.flow_count(&bridge(1)).await > 0);
    }

    #[tokio::test]
    async fn port_deactivation_unwires() {
        let h = two_node_cluster().await;
        let reconciler = SwitchingReconciler::new(h.ctx.clone());
        reconciler.resync().await;
        let before = h.switch.flow_count(&bridge(1)).await;

        let mut inactive = port(1, 5);
        inactive.state = PortState::Inactive;
        h.ctx.stores.ports.update(inactive.clone()).await.unwrap();
        reconciler
            .handle(SwitchingEvent::Port(event(
                EventKind::Transition(PortTransition::Inactivated),
                inactive,
                Some(port(1, 5)),
            )))
            .await;
        // vtag, routing and forwarding of the port
        assert_eq!(h.switch.flow_count(&bridge(1)).await, before - 3);
    }

    #[tokio::test]
    async fn resync_is_idempotent() {
        let h = two_node_cluster().await;
        let reconciler = SwitchingReconciler::new(h.ctx.clone());
        reconciler.resync().await;
        let first = h.switch.tables(&bridge(1)).await.flows().to_vec();
        reconciler.resync().await;
        let second = h.switch.tables(&bridge(1)).await.flows().to_vec();
        assert_eq!(first, second);
    }
}
