use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use pkg_constants::network::{ARP_OP_REPLY, ARP_OP_REQUEST};
use pkg_constants::pipeline::{
    APP_ARP, ARP_TABLE, PRIORITY_ARP_CONTROL_RULE, PRIORITY_ARP_FLOOD_RULE,
    PRIORITY_ARP_GATEWAY_RULE, PRIORITY_ARP_REPLY_RULE,
};
use pkg_pipeline::{Action, DesiredState, FlowRule, Match, OutPort, Packet};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::config::{ArpMode, NetworkingConfig};
use pkg_types::net::MacAddr;
use pkg_types::network::LogicalNetwork;
use pkg_types::node::{Node, NodeTransition};
use pkg_types::port::LogicalPort;

use crate::context::{Context, log_failure};
use crate::runner::Reconciler;

pub enum ArpEvent {
    Node(ResourceEvent<Node>),
    Network(ResourceEvent<LogicalNetwork>),
    Port(ResourceEvent<LogicalPort>),
}

/// ARP handling inside the switches: proxy responders or segment flooding,
/// gateway responders, and punting external ARP replies for MAC learning.
pub struct ArpReconciler {
    ctx: Arc<Context>,
}

pub fn arp_rules(
    config: &NetworkingConfig,
    nodes: &[Node],
    networks: &[LogicalNetwork],
    ports: &[LogicalPort],
) -> DesiredState {
    let mut desired = DesiredState::default();
    for node in nodes.iter().filter(|n| n.is_complete()) {
        let device = &node.integration_bridge;

        for network in networks {
            desired.flows.push(
                FlowRule::new(APP_ARP, device, ARP_TABLE, PRIORITY_ARP_GATEWAY_RULE)
                    .matching(
                        Match::arp()
                            .arp_op(ARP_OP_REQUEST)
                            .arp_tpa(network.gateway_ip),
                    )
                    .actions(vec![Action::ArpReply(config.gateway_mac)]),
            );
            if config.arp_mode == ArpMode::Broadcast {
                desired.flows.push(
                    FlowRule::new(APP_ARP, device, ARP_TABLE, PRIORITY_ARP_FLOOD_RULE)
                        .matching(Match::arp().tunnel_id(network.segment_id))
                        .actions(vec![Action::Flood]),
                );
            }
        }

        if config.arp_mode == ArpMode::Proxy {
            for port in ports.iter().filter(|p| p.is_active()) {
                desired.flows.push(
                    FlowRule::new(APP_ARP, device, ARP_TABLE, PRIORITY_ARP_REPLY_RULE)
                        .matching(
                            Match::arp()
                                .arp_op(ARP_OP_REQUEST)
                                .arp_tpa(port.ip_address),
                        )
                        .actions(vec![Action::ArpReply(port.mac_address)]),
                );
            }
        }

        if let Some(ext) = node.external_port {
            desired.flows.push(
                FlowRule::new(APP_ARP, device, ARP_TABLE, PRIORITY_ARP_CONTROL_RULE)
                    .matching(Match::arp().in_port(ext).arp_op(ARP_OP_REPLY))
                    .actions(vec![Action::Controller]),
            );
        }
    }
    desired
}

impl ArpReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let config = self.ctx.config.current();
        let nodes = self.ctx.stores.nodes.list().await?;
        let networks = self.ctx.stores.networks.list().await?;
        let ports = self.ctx.stores.ports.list().await?;
        let desired = arp_rules(&config, &nodes, &networks, &ports);
        self.ctx.converge(APP_ARP, &desired).await
    }

    /// Resolve the external gateway ahead of the first SNAT punt, off the
    /// reconciler queue.
    fn learn_gateway(&self, node: &Node) {
        if node.external_gateway_ip.is_none() {
            return;
        }
        let ctx = self.ctx.clone();
        let node = node.clone();
        tokio::spawn(async move {
            resolve_gateway_mac(&ctx, &node).await;
        });
    }
}

#[async_trait]
impl Reconciler for ArpReconciler {
    type Event = ArpEvent;

    fn name(&self) -> &'static str {
        "arp"
    }

    async fn handle(&self, event: ArpEvent) {
        let result = match event {
            ArpEvent::Node(ev) => match ev.kind {
                EventKind::Transition(NodeTransition::Complete) => {
                    self.learn_gateway(&ev.subject);
                    self.converge().await
                }
                EventKind::Created if ev.subject.is_complete() => {
                    self.learn_gateway(&ev.subject);
                    self.converge().await
                }
                EventKind::Transition(_) | EventKind::Removed => {
                    self.ctx
                        .clear_device(APP_ARP, &ev.subject.integration_bridge)
                        .await;
                    Ok(())
                }
                EventKind::Created | EventKind::Updated => self.converge().await,
            },
            ArpEvent::Network(_) => self.converge().await,
            ArpEvent::Port(ev) => match ev.kind {
                EventKind::Updated => Ok(()),
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

/// Record sender MACs of ARP replies punted by the switches. Runs on every
/// instance, leader or not.
pub fn spawn_arp_learner(ctx: Arc<Context>) -> tokio::task::JoinHandle<()> {
    let mut rx = ctx.programmer.packet_in();
    tokio::spawn(async move {
        info!("ARP learner started");
        loop {
            match rx.recv().await {
                Ok(pin) => {
                    let pkt = &pin.packet;
                    if !pkt.is_arp() || pkt.arp_op != ARP_OP_REPLY {
                        continue;
                    }
                    if ctx.macs.learn(pkt.ipv4_src, pkt.eth_src) {
                        info!("ARP: learned {} is at {} (via {})", pkt.ipv4_src, pkt.eth_src, pin.device);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("ARP learner lagged, {} packet-ins lost", n),
                Err(RecvError::Closed) => break,
            }
        }
        info!("ARP learner stopped");
    })
}

/// MAC of `node`'s external gateway as learned so far, or the configured
/// gateway MAC. Never sends a request.
pub fn known_gateway_mac(ctx: &Context, node: &Node) -> MacAddr {
    node.external_gateway_ip
        .and_then(|gateway| ctx.macs.get(gateway))
        .unwrap_or(ctx.config.current().gateway_mac)
}

/// MAC of `node`'s external gateway.
///
/// Sends requests out of the external port with a fixed sleep between attempts.
/// When nothing answers, falls back to the configured gateway MAC.
pub async fn resolve_gateway_mac(ctx: &Context, node: &Node) -> MacAddr {
    let config = ctx.config.current();
    let (Some(gateway), Some(ext_port), Some(ext_ip)) =
        (node.external_gateway_ip, node.external_port, node.external_ip)
    else {
        return config.gateway_mac;
    };
    if let Some(mac) = ctx.macs.get(gateway) {
        return mac;
    }
    for attempt in 1..=config.arp_max_retries {
        let request = Packet::arp_request(config.gateway_mac, ext_ip, gateway);
        ctx.programmer
            .emit(&node.integration_bridge, OutPort::Port(ext_port), request)
            .await;
        sleep(Duration::from_millis(config.arp_retry_interval_ms)).await;
        if let Some(mac) = ctx.macs.get(gateway) {
            return mac;
        }
        debug!("ARP: no reply from {} yet (attempt {})", gateway, attempt);
    }
    warn!(
        "ARP: gateway {} of {} unresolved, using {}",
        gateway, node.hostname, config.gateway_mac
    );
    config.gateway_mac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::switching::SwitchingReconciler;
    use pkg_constants::pipeline::STAT_INBOUND_TABLE;
    use pkg_pipeline::{Conntrack, PacketIn, Verdict};

    async fn cluster(mode: ArpMode) -> Harness {
        let h = harness(NetworkingConfig {
            arp_mode: mode,
            ..Default::default()
        });
        h.ctx.stores.nodes.create(node(1, true)).await.unwrap();
        h.ctx.stores.networks.create(network(1)).await.unwrap();
        h.ctx.stores.ports.create(port(1, 5)).await.unwrap();
        h.ctx.stores.ports.create(port(1, 7)).await.unwrap();
        SwitchingReconciler::new(h.ctx.clone()).resync().await;
        ArpReconciler::new(h.ctx.clone()).resync().await;
        h
    }

    #[tokio::test]
    async fn proxy_mode_answers_in_switch() {
        let h = cluster(ArpMode::Proxy).await;
        let tables = h.switch.tables(&bridge(1)).await;
        let asker = port(1, 7);

        let req = Packet::arp_request(asker.mac_address, asker.ip_address, ip("10.10.1.5")).from_port(7);
        let trace = tables.trace(&mut Conntrack::new(), req, STAT_INBOUND_TABLE);
        let Verdict::Output { port: out, packet } = trace.verdict else {
            panic!("unexpected verdict {:?}", trace.verdict);
        };
        assert_eq!(out, 7);
        assert_eq!(packet.eth_src, port(1, 5).mac_address);
        assert_eq!(packet.arp_op, ARP_OP_REPLY);

        let gw = Packet::arp_request(asker.mac_address, asker.ip_address, ip("10.10.1.1")).from_port(7);
        let trace = tables.trace(&mut Conntrack::new(), gw, STAT_INBOUND_TABLE);
        let Verdict::Output { packet, .. } = trace.verdict else {
            panic!("unexpected verdict {:?}", trace.verdict);
        };
        assert_eq!(packet.eth_src, NetworkingConfig::default().gateway_mac);
    }

    #[tokio::test]
    async fn broadcast_mode_floods_segment() {
        let h = cluster(ArpMode::Broadcast).await;
        let tables = h.switch.tables(&bridge(1)).await;
        let asker = port(1, 7);

        let req = Packet::arp_request(asker.mac_address, asker.ip_address, ip("10.10.1.5")).from_port(7);
        let trace = tables.trace(&mut Conntrack::new(), req, STAT_INBOUND_TABLE);
        assert!(matches!(trace.verdict, Verdict::Flood(_)));

        let gw = Packet::arp_request(asker.mac_address, asker.ip_address, ip("10.10.1.1")).from_port(7);
        let trace = tables.trace(&mut Conntrack::new(), gw, STAT_INBOUND_TABLE);
        assert!(matches!(trace.verdict, Verdict::Output { port: 7, .. }));
    }

    #[tokio::test]
    async fn external_replies_are_punted() {
        let h = cluster(ArpMode::Proxy).await;
        let tables = h.switch.tables(&bridge(1)).await;
        let reply = Packet::arp_reply(
            MacAddr([0x52, 0x54, 0, 0, 0, 1]),
            ip("192.168.0.1"),
            NetworkingConfig::default().gateway_mac,
            ip("192.168.0.11"),
        )
        .from_port(2);
        let trace = tables.trace(&mut Conntrack::new(), reply, STAT_INBOUND_TABLE);
        assert!(matches!(trace.verdict, Verdict::Controller(_)));
    }

    #[tokio::test]
    async fn learns_gateway_mac_first_write_wins() {
        let h = harness(NetworkingConfig {
            arp_retry_interval_ms: 100,
            arp_max_retries: 3,
            ..Default::default()
        });
        let _learner = spawn_arp_learner(h.ctx.clone());
        let gw_node = node(1, true);
        let real = MacAddr([0x52, 0x54, 0, 0, 0, 1]);
        let spoof = MacAddr([0x52, 0x54, 0, 0, 0, 2]);

        let switch = h.switch.clone();
        let answer = async move {
            sleep(Duration::from_millis(20)).await;
            for mac in [real, spoof] {
                switch.inject(PacketIn {
                    device: bridge(1),
                    table: ARP_TABLE,
                    packet: Packet::arp_reply(mac, ip("192.168.0.1"), MacAddr::ZERO, ip("192.168.0.11"))
                        .from_port(2),
                });
            }
        };
        let (mac, _) = tokio::join!(resolve_gateway_mac(&h.ctx, &gw_node), answer);
        assert_eq!(mac, real);
        assert_eq!(h.ctx.macs.get(ip("192.168.0.1")), Some(real));

        let requests = h.switch.emitted().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, OutPort::Port(2));
        assert_eq!(requests[0].2.ipv4_dst, ip("192.168.0.1"));
    }

    #[tokio::test]
    async fn complete_node_resolves_its_gateway() {
        let h = harness(NetworkingConfig {
            arp_retry_interval_ms: 5,
            arp_max_retries: 1,
            ..Default::default()
        });
        let gw_node = node(1, true);
        h.ctx.stores.nodes.create(gw_node.clone()).await.unwrap();
        ArpReconciler::new(h.ctx.clone())
            .handle(ArpEvent::Node(ResourceEvent {
                seq: 1,
                kind: EventKind::Created,
                subject: gw_node,
                previous: None,
            }))
            .await;
        sleep(Duration::from_millis(50)).await;

        let requests: Vec<_> = h
            .switch
            .emitted()
            .await
            .into_iter()
            .filter(|(_, out, pkt)| *out == OutPort::Port(2) && pkt.is_arp())
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].2.ipv4_dst, ip("192.168.0.1"));
    }

    #[tokio::test]
    async fn unresolved_gateway_falls_back() {
        let h = harness(NetworkingConfig {
            arp_retry_interval_ms: 5,
            arp_max_retries: 2,
            ..Default::default()
        });
        let mac = resolve_gateway_mac(&h.ctx, &node(1, true)).await;
        assert_eq!(mac, NetworkingConfig::default().gateway_mac);
        assert_eq!(h.switch.emitted().await.len(), 2);
    }
}
