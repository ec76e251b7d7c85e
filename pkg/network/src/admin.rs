use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use pkg_state::{ResourceStore, StoreError};
use pkg_types::namespace::Namespace;
use pkg_types::network::LogicalNetwork;
use pkg_types::pod::Pod;
use pkg_types::port::LogicalPort;

/// Check-then-act administration of networks, ports, namespaces and pods.
///
/// Every operation that inspects dependents before mutating runs under one
/// admin lock, so a removal can never interleave with a dependent creation.
/// Removals are blocked with `InUse` rather than cascaded.
pub struct NetworkAdmin {
    networks: Arc<ResourceStore<LogicalNetwork>>,
    ports: Arc<ResourceStore<LogicalPort>>,
    namespaces: Arc<ResourceStore<Namespace>>,
    pods: Arc<ResourceStore<Pod>>,
    lock: Mutex<()>,
}

impl NetworkAdmin {
    pub fn new(
        networks: Arc<ResourceStore<LogicalNetwork>>,
        ports: Arc<ResourceStore<LogicalPort>>,
        namespaces: Arc<ResourceStore<Namespace>>,
        pods: Arc<ResourceStore<Pod>>,
    ) -> Self {
        Self {
            networks,
            ports,
            namespaces,
            pods,
            lock: Mutex::new(()),
        }
    }

    // --- Networks ---

    /// Create a network whose CIDR does not overlap any existing one.
    pub async fn create_network(&self, network: LogicalNetwork) -> Result<LogicalNetwork, StoreError> {
        let _guard = self.lock.lock().await;
        if let Some(other) = self
            .networks
            .list()
            .await?
            .into_iter()
            .find(|n| n.cidr.contains(&network.cidr.network()) || network.cidr.contains(&n.cidr.network()))
        {
            return Err(StoreError::InUse {
                kind: "networks".to_string(),
                uid: network.network_id,
                reason: format!("cidr overlaps network {} ({})", other.network_id, other.cidr),
            });
        }
        self.networks.create(network).await
    }

    pub async fn remove_network(&self, network_id: &str) -> Result<LogicalNetwork, StoreError> {
        let _guard = self.lock.lock().await;
        let users = self
            .ports
            .list()
            .await?
            .into_iter()
            .filter(|p| p.network_id == network_id)
            .count();
        if users > 0 {
            return Err(StoreError::InUse {
                kind: "networks".to_string(),
                uid: network_id.to_string(),
                reason: format!("{} port(s) still attached", users),
            });
        }
        let removed = self.networks.remove(network_id).await?;
        info!("Network {} removed", network_id);
        Ok(removed)
    }

    // --- Ports ---

    pub async fn create_port(&self, port: LogicalPort) -> Result<LogicalPort, StoreError> {
        let _guard = self.lock.lock().await;
        if self.networks.get(&port.network_id).await?.is_none() {
            return Err(StoreError::NotFound {
                kind: "networks".to_string(),
                uid: port.network_id,
            });
        }
        self.ports.create(port).await
    }

    pub async fn remove_port(&self, port_id: &str) -> Result<LogicalPort, StoreError> {
        let _guard = self.lock.lock().await;
        self.ports.remove(port_id).await
    }

    // --- Namespaces ---

    pub async fn remove_namespace(&self, uid: &str) -> Result<Namespace, StoreError> {
        let _guard = self.lock.lock().await;
        let ns = self.namespaces.get(uid).await?.ok_or_else(|| StoreError::NotFound {
            kind: "namespaces".to_string(),
            uid: uid.to_string(),
        })?;
        let pods = self
            .pods
            .list()
            .await?
            .into_iter()
            .filter(|p| p.namespace == ns.name)
            .count();
        if pods > 0 {
            return Err(StoreError::InUse {
                kind: "namespaces".to_string(),
                uid: uid.to_string(),
                reason: format!("{} pod(s) still in namespace {}", pods, ns.name),
            });
        }
        self.namespaces.remove(uid).await
    }

    /// Create a pod in an existing namespace.
    pub async fn create_pod(&self, pod: Pod) -> Result<Pod, StoreError> {
        let _guard = self.lock.lock().await;
        let exists = self
            .namespaces
            .list()
            .await?
            .iter()
            .any(|ns| ns.name == pod.namespace);
        if !exists {
            return Err(StoreError::NotFound {
                kind: "namespaces".to_string(),
                uid: pod.namespace,
            });
        }
        self.pods.create(pod).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_state::{KvBackend, MemoryStore};
    use pkg_types::net::{DeviceId, MacAddr};
    use pkg_types::network::NetworkType;
    use pkg_types::port::PortState;
    use std::net::Ipv4Addr;

    fn admin() -> NetworkAdmin {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        NetworkAdmin::new(
            ResourceStore::new(kv.clone()),
            ResourceStore::new(kv.clone()),
            ResourceStore::new(kv.clone()),
            ResourceStore::new(kv),
        )
    }

    fn network(id: &str, cidr: &str) -> LogicalNetwork {
        let cidr: ipnet::Ipv4Net = cidr.parse().unwrap();
        LogicalNetwork {
            network_id: id.to_string(),
            name: id.to_string(),
            network_type: NetworkType::Vxlan,
            segment_id: 100,
            cidr,
            gateway_ip: cidr.hosts().next().unwrap(),
            mtu: None,
        }
    }

    fn port(id: &str, network_id: &str) -> LogicalPort {
        LogicalPort {
            port_id: id.to_string(),
            network_id: network_id.to_string(),
            ip_address: Ipv4Addr::new(10, 10, 1, 5),
            mac_address: MacAddr([0xfe, 0, 0, 0, 0, 5]),
            device_id: DeviceId::new("of:1"),
            port_number: None,
            state: PortState::Inactive,
        }
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            id: format!("ns-{}", name),
            name: name.to_string(),
            labels: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn pod(id: &str, ns: &str) -> Pod {
        Pod {
            id: id.to_string(),
            name: id.to_string(),
            namespace: ns.to_string(),
            labels: Default::default(),
            annotations: None,
            spec: Default::default(),
            status: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn network_removal_blocked_by_ports() {
        let admin = admin();
        admin.create_network(network("node-1", "10.10.1.0/24")).await.unwrap();
        admin.create_port(port("p1", "node-1")).await.unwrap();

        let err = admin.remove_network("node-1").await.unwrap_err();
        assert!(matches!(err, StoreError::InUse { .. }));

        admin.remove_port("p1").await.unwrap();
        admin.remove_network("node-1").await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_networks_rejected() {
        let admin = admin();
        admin.create_network(network("node-1", "10.10.1.0/24")).await.unwrap();
        let err = admin
            .create_network(network("node-2", "10.10.0.0/16"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InUse { .. }));
        admin.create_network(network("node-2", "10.10.2.0/24")).await.unwrap();
    }

    #[tokio::test]
    async fn port_requires_network() {
        let admin = admin();
        let err = admin.create_port(port("p1", "missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn namespace_removal_blocked_by_pods() {
        let admin = admin();
        admin.namespaces.create(namespace("web")).await.unwrap();
        admin.create_pod(pod("p1", "web")).await.unwrap();
        assert!(admin.create_pod(pod("p2", "other")).await.unwrap_err().is_not_found());

        let err = admin.remove_namespace("ns-web").await.unwrap_err();
        assert!(matches!(err, StoreError::InUse { .. }));

        admin.pods.remove("p1").await.unwrap();
        admin.remove_namespace("ns-web").await.unwrap();
    }
}
