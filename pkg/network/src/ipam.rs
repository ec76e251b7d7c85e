use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pkg_state::{KvBackend, ResourceStore, StoreError};
use pkg_types::ipam::IpamEntry;

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("no address available in network {0}")]
    Exhausted(String),

    #[error("{ip} is not part of the pool of network {network}")]
    OutOfRange { network: String, ip: Ipv4Addr },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-network address pools.
///
/// Every address of a pool lives in exactly one of two stores, available or
/// allocated. Allocation and release move an entry between them in a
/// single backend batch, serialized by an allocator-wide lock so two callers
/// can never draw the same address.
pub struct IpamAllocator {
    available: Arc<ResourceStore<IpamEntry>>,
    allocated: Arc<ResourceStore<IpamEntry>>,
    lock: Mutex<()>,
}

impl IpamAllocator {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            available: ResourceStore::named(kv.clone(), "ipam-available"),
            allocated: ResourceStore::named(kv, "ipam-allocated"),
            lock: Mutex::new(()),
        }
    }

    pub fn available_store(&self) -> &Arc<ResourceStore<IpamEntry>> {
        &self.available
    }

    pub fn allocated_store(&self) -> &Arc<ResourceStore<IpamEntry>> {
        &self.allocated
    }

    /// Seed `network_id`'s pool. Addresses already known, in either state,
    /// are left alone. Returns how many were added.
    pub async fn initialize_ip_pool<I>(&self, network_id: &str, ips: I) -> Result<usize, IpamError>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let _guard = self.lock.lock().await;
        let mut added = 0;
        for ip in ips {
            let id = IpamEntry::id_for(network_id, ip);
            if self.available.get(&id).await?.is_some() || self.allocated.get(&id).await?.is_some()
            {
                continue;
            }
            self.available.create(IpamEntry::new(network_id, ip)).await?;
            added += 1;
        }
        info!("IPAM: pool for network {} seeded with {} addresses", network_id, added);
        Ok(added)
    }

    /// Take the lowest available address of `network_id`.
    pub async fn allocate_ip(&self, network_id: &str) -> Result<Ipv4Addr, IpamError> {
        let _guard = self.lock.lock().await;
        let candidate = self
            .available
            .list()
            .await?
            .into_iter()
            .filter(|e| e.network_id == network_id)
            .min_by_key(|e| e.ip_address)
            .ok_or_else(|| IpamError::Exhausted(network_id.to_string()))?;

        self.available
            .move_to(&self.allocated, &candidate.ipam_id)
            .await?;
        info!("IPAM: allocated {} in network {}", candidate.ip_address, network_id);
        Ok(candidate.ip_address)
    }

    /// Mark a specific address as allocated. Reserving an address that is
    /// already allocated succeeds.
    pub async fn reserve_ip(&self, network_id: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let _guard = self.lock.lock().await;
        let id = IpamEntry::id_for(network_id, ip);
        if self.allocated.get(&id).await?.is_some() {
            debug!("IPAM: {} already reserved in network {}", ip, network_id);
            return Ok(());
        }
        if self.available.get(&id).await?.is_none() {
            return Err(IpamError::OutOfRange {
                network: network_id.to_string(),
                ip,
            });
        }
        self.available.move_to(&self.allocated, &id).await?;
        info!("IPAM: reserved {} in network {}", ip, network_id);
        Ok(())
    }

    /// Return an address to the pool. `false` when it was not allocated.
    pub async fn release_ip(&self, network_id: &str, ip: Ipv4Addr) -> Result<bool, IpamError> {
        let _guard = self.lock.lock().await;
        let id = IpamEntry::id_for(network_id, ip);
        if self.allocated.get(&id).await?.is_none() {
            debug!("IPAM: {} is not allocated in network {}", ip, network_id);
            return Ok(false);
        }
        self.allocated.move_to(&self.available, &id).await?;
        info!("IPAM: released {} in network {}", ip, network_id);
        Ok(true)
    }

    /// Drop every entry of `network_id`, allocated or not. Other networks'
    /// pools are untouched.
    pub async fn purge_ip_pool(&self, network_id: &str) -> Result<usize, IpamError> {
        let _guard = self.lock.lock().await;
        let mut removed = 0;
        for store in [&self.available, &self.allocated] {
            for entry in store.list().await? {
                if entry.network_id != network_id {
                    continue;
                }
                match store.remove(&entry.ipam_id).await {
                    Ok(_) => removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!("IPAM: purged {} entries of network {}", removed, network_id);
        Ok(removed)
    }

    pub async fn available_ips(&self, network_id: &str) -> Result<BTreeSet<Ipv4Addr>, IpamError> {
        Self::addresses(&self.available, network_id).await
    }

    pub async fn allocated_ips(&self, network_id: &str) -> Result<BTreeSet<Ipv4Addr>, IpamError> {
        Self::addresses(&self.allocated, network_id).await
    }

    async fn addresses(
        store: &ResourceStore<IpamEntry>,
        network_id: &str,
    ) -> Result<BTreeSet<Ipv4Addr>, IpamError> {
        Ok(store
            .list()
            .await?
            .into_iter()
            .filter(|e| e.network_id == network_id)
            .map(|e| e.ip_address)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{gateway_ip, subnet_hosts};
    use ipnet::Ipv4Net;
    use pkg_state::MemoryStore;

    fn allocator() -> IpamAllocator {
        IpamAllocator::new(Arc::new(MemoryStore::new()))
    }

    async fn seed(ipam: &IpamAllocator, network: &str, cidr: &str) {
        let cidr: Ipv4Net = cidr.parse().unwrap();
        let gw = gateway_ip(cidr).unwrap();
        let hosts = subnet_hosts(cidr).into_iter().filter(|ip| *ip != gw);
        ipam.initialize_ip_pool(network, hosts).await.unwrap();
    }

    #[tokio::test]
    async fn allocate_and_release() {
        let ipam = allocator();
        seed(&ipam, "n1", "10.1.0.0/24").await;
        assert_eq!(ipam.available_ips("n1").await.unwrap().len(), 253);

        let ip = ipam.allocate_ip("n1").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 1, 0, 2));
        assert!(!ipam.available_ips("n1").await.unwrap().contains(&ip));
        assert!(ipam.allocated_ips("n1").await.unwrap().contains(&ip));

        assert!(ipam.release_ip("n1", ip).await.unwrap());
        assert!(ipam.available_ips("n1").await.unwrap().contains(&ip));
        assert!(!ipam.release_ip("n1", ip).await.unwrap());
    }

    #[tokio::test]
    async fn pools_partition_addresses() {
        let ipam = allocator();
        seed(&ipam, "n1", "10.1.0.0/29").await;
        let total = ipam.available_ips("n1").await.unwrap();
        assert_eq!(total.len(), 5);

        let mut taken = BTreeSet::new();
        for _ in 0..5 {
            taken.insert(ipam.allocate_ip("n1").await.unwrap());
        }
        assert_eq!(taken, total);
        assert!(matches!(
            ipam.allocate_ip("n1").await,
            Err(IpamError::Exhausted(_))
        ));

        let avail = ipam.available_ips("n1").await.unwrap();
        let alloc = ipam.allocated_ips("n1").await.unwrap();
        assert!(avail.is_disjoint(&alloc));
        assert_eq!(avail.len() + alloc.len(), 5);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_and_checked() {
        let ipam = allocator();
        seed(&ipam, "n1", "10.1.0.0/24").await;
        let ip = Ipv4Addr::new(10, 1, 0, 50);
        ipam.reserve_ip("n1", ip).await.unwrap();
        ipam.reserve_ip("n1", ip).await.unwrap();
        assert!(ipam.allocated_ips("n1").await.unwrap().contains(&ip));

        let err = ipam
            .reserve_ip("n1", Ipv4Addr::new(10, 2, 0, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn purge_is_scoped_to_network() {
        let ipam = allocator();
        seed(&ipam, "n1", "10.1.0.0/28").await;
        seed(&ipam, "n2", "10.2.0.0/28").await;
        ipam.allocate_ip("n1").await.unwrap();
        ipam.allocate_ip("n2").await.unwrap();

        ipam.purge_ip_pool("n1").await.unwrap();
        assert!(ipam.available_ips("n1").await.unwrap().is_empty());
        assert!(ipam.allocated_ips("n1").await.unwrap().is_empty());
        assert_eq!(ipam.available_ips("n2").await.unwrap().len(), 12);
        assert_eq!(ipam.allocated_ips("n2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reseeding_keeps_allocations() {
        let ipam = allocator();
        seed(&ipam, "n1", "10.1.0.0/29").await;
        let ip = ipam.allocate_ip("n1").await.unwrap();
        seed(&ipam, "n1", "10.1.0.0/29").await;
        assert!(!ipam.available_ips("n1").await.unwrap().contains(&ip));
        assert_eq!(ipam.available_ips("n1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let ipam = Arc::new(allocator());
        seed(&ipam, "n1", "10.1.0.0/26").await;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ipam = ipam.clone();
            handles.push(tokio::spawn(async move { ipam.allocate_ip("n1").await }));
        }
        let mut seen = BTreeSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap().unwrap()));
        }
        assert_eq!(seen.len(), 20);
    }
}
