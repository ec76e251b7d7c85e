use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use pkg_network::addressing::subnet_hosts;
use pkg_network::IpamError;
use pkg_state::{EventKind, ResourceEvent};
use pkg_types::network::LogicalNetwork;
use pkg_types::port::LogicalPort;

use crate::context::Context;
use crate::runner::Reconciler;

pub enum IpamEvent {
    Network(ResourceEvent<LogicalNetwork>),
    Port(ResourceEvent<LogicalPort>),
}

/// Keeps address pools in step with networks and ports.
pub struct IpamReconciler {
    ctx: Arc<Context>,
}

impl IpamReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn seed(&self, network: &LogicalNetwork) -> Result<(), IpamError> {
        let hosts = subnet_hosts(network.cidr)
            .into_iter()
            .filter(|ip| *ip != network.gateway_ip);
        self.ctx.ipam.initialize_ip_pool(&network.network_id, hosts).await?;
        Ok(())
    }

    async fn on_network(&self, event: ResourceEvent<LogicalNetwork>) -> Result<(), IpamError> {
        match event.kind {
            EventKind::Created => self.seed(&event.subject).await,
            EventKind::Removed => {
                self.ctx.ipam.purge_ip_pool(&event.subject.network_id).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Reserve a port's address, seeding its network's pool first when the
    /// port event overtook the network event.
    async fn reserve(&self, port: &LogicalPort) -> Result<(), IpamError> {
        let ipam = &self.ctx.ipam;
        match ipam.reserve_ip(&port.network_id, port.ip_address).await {
            Err(IpamError::OutOfRange { .. }) => {
                let Some(network) = self.ctx.stores.networks.get(&port.network_id).await? else {
                    warn!(
                        "ipam: port {} references unknown network {}",
                        port.port_id, port.network_id
                    );
                    return Ok(());
                };
                self.seed(&network).await?;
                ipam.reserve_ip(&port.network_id, port.ip_address).await
            }
            other => other,
        }
    }

    async fn on_port(&self, event: ResourceEvent<LogicalPort>) -> Result<(), IpamError> {
        let port = &event.subject;
        match event.kind {
            EventKind::Created => self.reserve(port).await,
            EventKind::Updated => match &event.previous {
                Some(old)
                    if old.network_id != port.network_id || old.ip_address != port.ip_address =>
                {
                    self.ctx.ipam.release_ip(&old.network_id, old.ip_address).await?;
                    self.reserve(port).await
                }
                _ => Ok(()),
            },
            EventKind::Removed => {
                self.ctx.ipam.release_ip(&port.network_id, port.ip_address).await?;
                Ok(())
            }
            EventKind::Transition(_) => Ok(()),
        }
    }

    /// Seed every network's pool, drop pools of vanished networks and
    /// reserve every port's address.
    async fn reconcile_all(&self) -> Result<(), IpamError> {
        let networks = self.ctx.stores.networks.list().await?;
        for network in &networks {
            self.seed(network).await?;
        }

        let known: BTreeSet<&str> = networks.iter().map(|n| n.network_id.as_str()).collect();
        let mut stale = BTreeSet::new();
        for store in [self.ctx.ipam.available_store(), self.ctx.ipam.allocated_store()] {
            for entry in store.list().await? {
                if !known.contains(entry.network_id.as_str()) {
                    stale.insert(entry.network_id);
                }
            }
        }
        for network_id in stale {
            self.ctx.ipam.purge_ip_pool(&network_id).await?;
        }

        for port in self.ctx.stores.ports.list().await? {
            if let Err(e) = self.ctx.ipam.reserve_ip(&port.network_id, port.ip_address).await {
                warn!("ipam: port {} keeps {}: {}", port.port_id, port.ip_address, e);
            }
        }
        Ok(())
    }
}

fn log_ipam(what: &str, result: Result<(), IpamError>) {
    if let Err(e) = result {
        warn!("ipam: {} failed: {}", what, e);
    }
}

#[async_trait]
impl Reconciler for IpamReconciler {
    type Event = IpamEvent;

    fn name(&self) -> &'static str {
        "ipam"
    }

    async fn handle(&self, event: IpamEvent) {
        let result = match event {
            IpamEvent::Network(ev) => self.on_network(ev).await,
            IpamEvent::Port(ev) => self.on_port(ev).await,
        };
        log_ipam("event", result);
    }

    async fn resync(&self) {
        log_ipam("resync", self.reconcile_all().await);
    }
}
