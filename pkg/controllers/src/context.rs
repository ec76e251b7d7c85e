use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use pkg_constants::state::APP_ELECTION_KEY;
use pkg_network::IpamAllocator;
use pkg_pipeline::{DesiredState, FlowProgrammer, SwitchDriver};
use pkg_state::{KvBackend, Leadership, ResourceStore, StoreError};
use pkg_types::config::NetworkingConfig;
use pkg_types::endpoint::Endpoints;
use pkg_types::namespace::Namespace;
use pkg_types::net::{DeviceId, MacAddr};
use pkg_types::network::LogicalNetwork;
use pkg_types::network_policy::NetworkPolicy;
use pkg_types::node::Node;
use pkg_types::pod::Pod;
use pkg_types::port::LogicalPort;
use pkg_types::service::Service;

/// Every resource table the control plane keeps.
#[derive(Clone)]
pub struct Stores {
    pub nodes: Arc<ResourceStore<Node>>,
    pub networks: Arc<ResourceStore<LogicalNetwork>>,
    pub ports: Arc<ResourceStore<LogicalPort>>,
    pub namespaces: Arc<ResourceStore<Namespace>>,
    pub pods: Arc<ResourceStore<Pod>>,
    pub services: Arc<ResourceStore<Service>>,
    pub endpoints: Arc<ResourceStore<Endpoints>>,
    pub policies: Arc<ResourceStore<NetworkPolicy>>,
}

impl Stores {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            nodes: ResourceStore::new(kv.clone()),
            networks: ResourceStore::new(kv.clone()),
            ports: ResourceStore::new(kv.clone()),
            namespaces: ResourceStore::new(kv.clone()),
            pods: ResourceStore::new(kv.clone()),
            services: ResourceStore::new(kv.clone()),
            endpoints: ResourceStore::new(kv.clone()),
            policies: ResourceStore::new(kv),
        }
    }
}

/// Current networking configuration. Readers take a snapshot per event;
/// a reload swaps the whole value at once.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<NetworkingConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: NetworkingConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<NetworkingConfig> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, config: NetworkingConfig) {
        info!(
            "Networking config replaced (nat={}, arp={})",
            config.nat_mode, config.arp_mode
        );
        self.tx.send_replace(Arc::new(config));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NetworkingConfig>> {
        self.tx.subscribe()
    }
}

/// External gateway MACs learned from ARP replies, keyed by gateway IP.
/// The first answer for an address wins.
#[derive(Default)]
pub struct MacTable {
    entries: DashMap<Ipv4Addr, MacAddr>,
}

impl MacTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `mac` for `ip` unless an entry exists. Returns whether it was
    /// stored.
    pub fn learn(&self, ip: Ipv4Addr, mac: MacAddr) -> bool {
        let mut stored = false;
        self.entries.entry(ip).or_insert_with(|| {
            stored = true;
            mac
        });
        stored
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries.get(&ip).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared handles every reconciler works through.
pub struct Context {
    pub stores: Stores,
    pub config: ConfigHandle,
    pub programmer: Arc<FlowProgrammer>,
    pub leadership: Arc<dyn Leadership>,
    pub ipam: Arc<IpamAllocator>,
    pub macs: Arc<MacTable>,
}

impl Context {
    /// Wire stores, IPAM and the flow programmer over one backend.
    pub fn new(
        kv: Arc<dyn KvBackend>,
        config: NetworkingConfig,
        driver: Arc<dyn SwitchDriver>,
        leadership: Arc<dyn Leadership>,
    ) -> Arc<Self> {
        let programmer = FlowProgrammer::new(driver);
        programmer.set_stateful_idle_timeout(config.stateful_nat_idle_timeout_secs);
        Arc::new(Self {
            stores: Stores::new(kv.clone()),
            config: ConfigHandle::new(config),
            programmer: Arc::new(programmer),
            leadership,
            ipam: Arc::new(IpamAllocator::new(kv)),
            macs: Arc::new(MacTable::new()),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader(APP_ELECTION_KEY)
    }

    pub async fn complete_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .stores
            .nodes
            .list()
            .await?
            .into_iter()
            .filter(|n| n.is_complete())
            .collect())
    }

    /// Bridges of every complete node.
    pub async fn complete_devices(&self) -> Result<Vec<DeviceId>, StoreError> {
        Ok(self
            .complete_nodes()
            .await?
            .into_iter()
            .map(|n| n.integration_bridge)
            .collect())
    }

    /// Converge `app_id` to `desired` on every complete node.
    pub async fn converge(&self, app_id: &str, desired: &DesiredState) -> Result<(), StoreError> {
        let devices = self.complete_devices().await?;
        self.programmer.converge(app_id, &devices, desired).await;
        Ok(())
    }

    /// Strip `app_id`'s rules from a node that left the complete state.
    pub async fn clear_device(&self, app_id: &str, device: &DeviceId) {
        let stats = self
            .programmer
            .converge(app_id, std::slice::from_ref(device), &DesiredState::default())
            .await;
        if stats.removed > 0 {
            info!("{}: cleared {} rule(s) from {}", app_id, stats.removed, device);
        }
    }
}

/// Log a reconciler step that failed to read state. Pipeline errors never
/// reach here; they are absorbed by the programmer.
pub(crate) fn log_failure(reconciler: &str, what: &str, result: Result<(), StoreError>) {
    if let Err(e) = result {
        warn!("{}: {} failed: {}", reconciler, what, e);
    }
}
