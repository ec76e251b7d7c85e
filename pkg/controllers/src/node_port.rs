//! NodePort exposure.
//!
//! Traffic arriving on a node's external port for `nodeIP:nodePort` is
//! rewritten to the service's cluster IP and source-NATed to the node
//! network's gateway, then handed to service NAT. Replies come back to the
//! gateway, get their client restored by the tracker and leave through the
//! external port again.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::warn;

use pkg_constants::pipeline::{
    APP_NODE_PORT, JUMP_TABLE, NAT_TABLE, NODE_PORT_TABLE, PRIORITY_NODE_PORT_RETURN_RULE,
    PRIORITY_NODE_PORT_RULE, ROUTING_TABLE,
};
use pkg_pipeline::{Action, CtAction, CtNat, DesiredState, FlowKey, FlowRule, Match};
use pkg_state::{EventKind, ResourceEvent, StoreError};
use pkg_types::config::{NatMode, NetworkingConfig};
use pkg_types::net::{MacAddr, Protocol};
use pkg_types::network::LogicalNetwork;
use pkg_types::node::Node;
use pkg_types::service::Service;

use crate::context::{Context, MacTable, log_failure};
use crate::runner::Reconciler;

pub enum NodePortEvent {
    Service(ResourceEvent<Service>),
    Node(ResourceEvent<Node>),
    Network(ResourceEvent<LogicalNetwork>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePortMapping {
    pub node_port: u16,
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

pub fn node_port_mappings(services: &[Service]) -> Vec<NodePortMapping> {
    let mut out = Vec::new();
    for service in services {
        let Some(vip) = service.cluster_ipv4() else { continue };
        for sp in &service.spec.ports {
            if let Some(node_port) = sp.node_port {
                out.push(NodePortMapping {
                    node_port,
                    vip,
                    port: sp.port,
                    protocol: sp.protocol,
                });
            }
        }
    }
    out
}

/// Rules for one node. Nodes without an external port or without a network
/// of their own expose nothing.
pub fn node_rules(
    config: &NetworkingConfig,
    node: &Node,
    networks: &[LogicalNetwork],
    mappings: &[NodePortMapping],
    macs: &MacTable,
) -> Vec<FlowRule> {
    let Some(ext_port) = node.external_port else {
        return Vec::new();
    };
    let Some(gateway) = networks
        .iter()
        .find(|n| n.network_id == node.hostname)
        .map(|n| n.gateway_ip)
    else {
        return Vec::new();
    };
    let device = &node.integration_bridge;
    let next_hop = node
        .external_gateway_ip
        .and_then(|ip| macs.get(ip))
        .unwrap_or(config.gateway_mac);

    let recirc = match config.nat_mode {
        NatMode::Stateless => JUMP_TABLE,
        NatMode::Stateful => NAT_TABLE,
    };

    let mut rules = vec![
        FlowRule::new(APP_NODE_PORT, device, ROUTING_TABLE, PRIORITY_NODE_PORT_RETURN_RULE)
            .matching(
                Match::ipv4()
                    .ipv4_src(config.service_cidr)
                    .ipv4_dst_host(gateway),
            )
            .actions(vec![Action::Conntrack(CtAction {
                commit: false,
                nat: Some(CtNat::Restore),
                recirc_table: Some(NODE_PORT_TABLE),
            })]),
    ];
    for m in mappings {
        rules.push(
            FlowRule::new(APP_NODE_PORT, device, JUMP_TABLE, PRIORITY_NODE_PORT_RULE)
                .matching(
                    Match::ipv4()
                        .in_port(ext_port)
                        .protocol(m.protocol)
                        .ipv4_dst_host(node.node_ip)
                        .l4_dst(m.node_port),
                )
                .actions(vec![
                    Action::SetIpv4Dst(m.vip),
                    Action::SetL4Dst(m.port),
                    Action::Conntrack(CtAction {
                        commit: true,
                        nat: Some(CtNat::Src {
                            addr: gateway,
                            port: None,
                        }),
                        recirc_table: Some(recirc),
                    }),
                ]),
        );
        rules.push(
            FlowRule::new(APP_NODE_PORT, device, NODE_PORT_TABLE, PRIORITY_NODE_PORT_RULE)
                .matching(
                    Match::ipv4()
                        .protocol(m.protocol)
                        .ipv4_src_host(m.vip)
                        .l4_src(m.port),
                )
                .actions(vec![
                    Action::SetIpv4Src(node.node_ip),
                    Action::SetL4Src(m.node_port),
                    Action::SetEthDst(next_hop),
                    Action::Output(ext_port),
                ]),
        );
    }
    rules
}

pub fn node_port_rules(
    config: &NetworkingConfig,
    nodes: &[Node],
    networks: &[LogicalNetwork],
    mappings: &[NodePortMapping],
    macs: &MacTable,
) -> DesiredState {
    let mut flows: BTreeMap<FlowKey, FlowRule> = BTreeMap::new();
    for node in nodes.iter().filter(|n| n.is_complete()) {
        for rule in node_rules(config, node, networks, mappings, macs) {
            flows.insert(rule.key(), rule);
        }
    }
    DesiredState {
        flows: flows.into_values().collect(),
        groups: Vec::new(),
    }
}

pub struct NodePortReconciler {
    ctx: Arc<Context>,
}

impl NodePortReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn converge(&self) -> Result<(), StoreError> {
        let config = self.ctx.config.current();
        let nodes = self.ctx.complete_nodes().await?;
        let networks = self.ctx.stores.networks.list().await?;
        let services = self.ctx.stores.services.list().await?;
        let mappings = node_port_mappings(&services);
        if !mappings.is_empty() {
            for node in nodes.iter().filter(|n| n.external_port.is_none()) {
                warn!("Node {} has no external port, node ports not exposed there", node.hostname);
            }
        }
        let desired = node_port_rules(&config, &nodes, &networks, &mappings, &self.ctx.macs);
        self.ctx.converge(APP_NODE_PORT, &desired).await
    }
}

#[async_trait]
impl Reconciler for NodePortReconciler {
    type Event = NodePortEvent;

    fn name(&self) -> &'static str {
        "node-port"
    }

    async fn handle(&self, event: NodePortEvent) {
        let result = match event {
            NodePortEvent::Node(ev) if !ev.subject.is_complete() => {
                self.ctx
                    .clear_device(APP_NODE_PORT, &ev.subject.integration_bridge)
                    .await;
                Ok(())
            }
            NodePortEvent::Service(ev) if matches!(ev.kind, EventKind::Transition(_)) => Ok(()),
            _ => self.converge().await,
        };
        log_failure(self.name(), "event", result);
    }

    async fn resync(&self) {
        let result = self.converge().await;
        log_failure(self.name(), "resync", result);
    }
}
