//! Reactive source NAT for pod traffic leaving the cluster.
//!
//! Off-cluster packets fall through internal routing and are punted. For
//! each punted connection a pair of rules is installed: upstream rewrites
//! the pod address to the node's external address and sends it out of the
//! external port; downstream maps replies back to the pod. Both carry the
//! stateful-NAT priority and therefore expire when idle.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use pkg_constants::pipeline::{
    APP_SNAT, JUMP_TABLE, PRIORITY_EXTERNAL_ROUTING_RULE, PRIORITY_STATEFUL_SNAT_RULE, ROUTING_TABLE,
};
use pkg_pipeline::{Action, DesiredState, FlowRule, Match, OutPort, PacketIn};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::config::NetworkingConfig;
use pkg_types::net::{MacAddr, Protocol};
use pkg_types::node::{Node, NodeTransition};

use crate::arp::known_gateway_mac;
use crate::context::{Context, log_failure};
use crate::runner::{Reconciler, ReconcilerHandle};

pub enum SnatEvent {
    Node(ResourceEvent<Node>),
    PacketIn(PacketIn),
}

/// Punt rule for pod traffic with no internal route.
pub fn external_rules(config: &NetworkingConfig, nodes: &[Node]) -> DesiredState {
    let flows = nodes
        .iter()
        .filter(|n| n.is_complete() && n.external_port.is_some())
        .map(|n| {
            FlowRule::new(
                APP_SNAT,
                &n.integration_bridge,
                ROUTING_TABLE,
                PRIORITY_EXTERNAL_ROUTING_RULE,
            )
            .matching(Match::ipv4().ipv4_src(config.pod_cidr))
            .actions(vec![Action::Controller])
        })
        .collect();
    DesiredState {
        flows,
        groups: Vec::new(),
    }
}

/// Upstream and downstream rules for the connection `pin` belongs to.
/// `None` when the node cannot reach the outside.
pub fn connection_rules(node: &Node, pin: &PacketIn, gateway_mac: MacAddr) -> Option<[FlowRule; 2]> {
    let ext_port = node.external_port?;
    let ext_ip = node.external_ip?;
    let pkt = &pin.packet;
    let device = &node.integration_bridge;

    let mut upstream = Match::ipv4()
        .ip_proto(pkt.ip_proto)
        .ipv4_src_host(pkt.ipv4_src)
        .ipv4_dst_host(pkt.ipv4_dst);
    let mut downstream = Match::ipv4()
        .in_port(ext_port)
        .ip_proto(pkt.ip_proto)
        .ipv4_src_host(pkt.ipv4_dst)
        .ipv4_dst_host(ext_ip);
    if pkt.ip_proto == Protocol::Tcp.number() || pkt.ip_proto == Protocol::Udp.number() {
        upstream = upstream.l4_src(pkt.l4_src).l4_dst(pkt.l4_dst);
        downstream = downstream.l4_src(pkt.l4_dst).l4_dst(pkt.l4_src);
    }

    Some([
        FlowRule::new(APP_SNAT, device, ROUTING_TABLE, PRIORITY_STATEFUL_SNAT_RULE)
            .matching(upstream)
            .actions(vec![
                Action::SetIpv4Src(ext_ip),
                Action::SetEthDst(gateway_mac),
                Action::Output(ext_port),
            ]),
        FlowRule::new(APP_SNAT, device, JUMP_TABLE, PRIORITY_STATEFUL_SNAT_RULE)
            .matching(downstream)
            .actions(vec![
                Action::SetIpv4Dst(pkt.ipv4_src),
                Action::Goto(ROUTING_TABLE),
            ]),
    ])
}

pub struct SnatReconciler {
    ctx: Arc<Context>,
}

impl SnatReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let config = self.ctx.config.current();
        let nodes = self.ctx.complete_nodes().await?;
        self.ctx
            .converge(APP_SNAT, &external_rules(&config, &nodes))
            .await
    }

    async fn on_packet_in(&self, pin: PacketIn) -> Result<(), StoreError> {
        let Some(node) = self
            .ctx
            .complete_nodes()
            .await?
            .into_iter()
            .find(|n| n.integration_bridge == pin.device)
        else {
            debug!("SNAT: packet-in from unknown device {}", pin.device);
            return Ok(());
        };
        if node.external_port.is_none() || node.external_ip.is_none() {
            warn!("SNAT: node {} has no external port, dropping punt", node.hostname);
            return Ok(());
        }

        // the ARP reconciler resolves the gateway when the node completes
        let mac = known_gateway_mac(&self.ctx, &node);
        let Some([upstream, downstream]) = connection_rules(&node, &pin, mac) else {
            return Ok(());
        };
        let programmer = &self.ctx.programmer;
        programmer.set_rule(downstream, true).await;
        programmer.set_rule(upstream, true).await;
        info!(
            "SNAT: {}:{} -> {}:{} via {}",
            pin.packet.ipv4_src, pin.packet.l4_src, pin.packet.ipv4_dst, pin.packet.l4_dst, node.hostname
        );
        programmer.emit(&pin.device, OutPort::Table, pin.packet).await;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SnatReconciler {
    type Event = SnatEvent;

    fn name(&self) -> &'static str {
        "snat"
    }

    async fn handle(&self, event: SnatEvent) {
        let result = match event {
            SnatEvent::PacketIn(pin) => self.on_packet_in(pin).await,
            SnatEvent::Node(ev) => match ev.kind {
                EventKind::Transition(NodeTransition::Complete) | EventKind::Created => self.converge().await,
                EventKind::Transition(_) | EventKind::Removed => {
                    self.ctx
                        .clear_device(APP_SNAT, &ev.subject.integration_bridge)
                        .await;
                    Ok(())
                }
                EventKind::Updated => self.converge().await,
            },
        };
        log_failure(self.name(), "event", result);
    }

    async fn resync(&self) {
        let result = self.converge().await;
        log_failure(self.name(), "resync", result);
    }
}

/// Queue IPv4 packets punted from the routing table onto the SNAT reconciler.
pub fn spawn_punt_forwarder(ctx: Arc<Context>, handle: ReconcilerHandle<SnatEvent>) -> tokio::task::JoinHandle<()> {
    let mut rx = ctx.programmer.packet_in();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(pin) if pin.table == ROUTING_TABLE && pin.packet.is_ipv4() => {
                    handle.submit(SnatEvent::PacketIn(pin));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("SNAT punt forwarder lagged, {} packet-ins lost", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::switching::SwitchingReconciler;
    use pkg_constants::pipeline::STAT_INBOUND_TABLE;
    use pkg_pipeline::{Conntrack, Packet, Persistence, Verdict};
    use std::net::Ipv4Addr;
    use tokio::time::Duration;

    const REMOTE: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);
    const GW_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    async fn cluster() -> Harness {
        let h = harness(NetworkingConfig::default());
        let s = &h.ctx.stores;
        s.nodes.create(node(1, true)).await.unwrap();
        s.networks.create(network(1)).await.unwrap();
        s.ports.create(port(1, 5)).await.unwrap();
        h.ctx.macs.learn(ip("192.168.0.1"), GW_MAC);
        SwitchingReconciler::new(h.ctx.clone()).resync().await;
        h
    }

    #[tokio::test]
    async fn punt_installs_connection_rules() {
        let h = cluster().await;
        let snat = SnatReconciler::new(h.ctx.clone());
        snat.resync().await;

        let request = Packet::tcp((ip("10.10.1.5"), 40000), REMOTE).from_port(5);
        let tables = h.switch.tables(&bridge(1)).await;
        let Verdict::Controller(punted) = tables.trace(&mut Conntrack::new(), request.clone(), STAT_INBOUND_TABLE).verdict
        else {
            panic!("expected a punt");
        };

        snat.handle(SnatEvent::PacketIn(PacketIn {
            device: bridge(1),
            table: ROUTING_TABLE,
            packet: punted.clone(),
        }))
        .await;
        let emitted = h.switch.emitted().await;
        assert_eq!(emitted, vec![(bridge(1), OutPort::Table, punted)]);

        let tables = h.switch.tables(&bridge(1)).await;
        let mut ct = Conntrack::new();
        let Verdict::Output { port, packet } = tables.trace(&mut ct, request, STAT_INBOUND_TABLE).verdict else {
            panic!("upstream not delivered");
        };
        assert_eq!(port, 2);
        assert_eq!(packet.ipv4_src, ip("192.168.0.11"));
        assert_eq!(packet.eth_dst, GW_MAC);

        let reply = Packet::tcp(REMOTE, (ip("192.168.0.11"), 40000)).from_port(2);
        let Verdict::Output { port, packet } = tables.trace(&mut ct, reply, STAT_INBOUND_TABLE).verdict else {
            panic!("downstream not delivered");
        };
        assert_eq!(port, 5);
        assert_eq!(packet.ipv4_dst, ip("10.10.1.5"));
    }

    #[tokio::test]
    async fn connection_rules_expire_and_survive_resync() {
        let h = cluster().await;
        let snat = SnatReconciler::new(h.ctx.clone());
        snat.resync().await;
        let packet = Packet::tcp((ip("10.10.1.5"), 40001), REMOTE).from_port(5);
        snat.handle(SnatEvent::PacketIn(PacketIn {
            device: bridge(1),
            table: ROUTING_TABLE,
            packet,
        }))
        .await;

        snat.resync().await;
        let flows = h.ctx.programmer.flows(&bridge(1)).await;
        let expiring: Vec<_> = flows
            .iter()
            .filter(|f| f.app_id == APP_SNAT && f.priority == PRIORITY_STATEFUL_SNAT_RULE)
            .collect();
        assert_eq!(expiring.len(), 2);
        assert!(expiring
            .iter()
            .all(|f| matches!(f.persistence, Persistence::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn unresolved_gateway_does_not_stall_punts() {
        let h = harness(NetworkingConfig::default());
        let s = &h.ctx.stores;
        s.nodes.create(node(1, true)).await.unwrap();
        s.networks.create(network(1)).await.unwrap();
        s.ports.create(port(1, 5)).await.unwrap();
        SwitchingReconciler::new(h.ctx.clone()).resync().await;
        let snat = SnatReconciler::new(h.ctx.clone());
        snat.resync().await;

        let request = Packet::tcp((ip("10.10.1.5"), 40002), REMOTE).from_port(5);
        let punt = snat.handle(SnatEvent::PacketIn(PacketIn {
            device: bridge(1),
            table: ROUTING_TABLE,
            packet: request.clone(),
        }));
        tokio::time::timeout(Duration::from_millis(500), punt)
            .await
            .expect("punt handling waited on ARP");

        let tables = h.switch.tables(&bridge(1)).await;
        let Verdict::Output { packet, .. } = tables.trace(&mut Conntrack::new(), request, STAT_INBOUND_TABLE).verdict
        else {
            panic!("upstream not delivered");
        };
        assert_eq!(packet.eth_dst, NetworkingConfig::default().gateway_mac);
    }

    #[tokio::test]
    async fn internal_node_ignores_punts() {
        let h = harness(NetworkingConfig::default());
        h.ctx.stores.nodes.create(node(1, false)).await.unwrap();
        let snat = SnatReconciler::new(h.ctx.clone());
        snat.resync().await;
        snat.handle(SnatEvent::PacketIn(PacketIn {
            device: bridge(1),
            table: ROUTING_TABLE,
            packet: Packet::tcp((ip("10.10.1.5"), 40000), REMOTE),
        }))
        .await;
        assert_eq!(h.switch.flow_count(&bridge(1)).await, 0);
        assert!(h.switch.emitted().await.is_empty());
    }
}
