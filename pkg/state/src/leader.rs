use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::KvBackend;

use pkg_constants::state::{
    LEADER_LEASE_PREFIX, LEADER_LEASE_TTL_SECS, LEADER_RENEW_INTERVAL_DIVISOR,
};

/// Cluster-wide single-writer election, one election per key.
///
/// At most one process observes itself as leader for a key at any instant;
/// there may be none during a handover.
pub trait Leadership: Send + Sync + 'static {
    fn local_node(&self) -> &str;

    /// Current leader for `key`, if any.
    fn leader(&self, key: &str) -> Option<String>;

    fn is_leader(&self, key: &str) -> bool {
        self.leader(key).as_deref() == Some(self.local_node())
    }

    /// Leader-change notifications for `key`.
    fn subscribe(&self, key: &str) -> watch::Receiver<Option<String>>;
}

/// A distributed lease for leader election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub holder_id: String,
    pub acquired_at: chrono::DateTime<Utc>,
    pub renew_at: chrono::DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        let expiry = self.renew_at + chrono::Duration::seconds(self.ttl_seconds as i64);
        Utc::now() > expiry
    }
}

/// Leader election over leases kept in the state backend.
pub struct LeaderElection {
    kv: Arc<dyn KvBackend>,
    node_id: String,
    ttl: Duration,
    renew_interval: Duration,
    leaders: HashMap<String, watch::Sender<Option<String>>>,
}

impl LeaderElection {
    /// Run for election under every key in `keys`.
    pub fn new(kv: Arc<dyn KvBackend>, node_id: String, keys: &[&str]) -> Self {
        let ttl = Duration::from_secs(LEADER_LEASE_TTL_SECS);
        let renew_interval =
            Duration::from_secs(LEADER_LEASE_TTL_SECS / LEADER_RENEW_INTERVAL_DIVISOR);
        let leaders = keys
            .iter()
            .map(|k| (k.to_string(), watch::channel(None).0))
            .collect();

        Self {
            kv,
            node_id,
            ttl,
            renew_interval,
            leaders,
        }
    }

    fn lease_key(key: &str) -> String {
        format!("{}{}", LEADER_LEASE_PREFIX, key)
    }

    fn fresh_lease(&self, key: &str) -> Lease {
        let now = Utc::now();
        Lease {
            id: key.to_string(),
            holder_id: self.node_id.clone(),
            acquired_at: now,
            renew_at: now,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Try to acquire or renew the lease for `key`. Returns the holder.
    async fn try_acquire_or_renew(&self, key: &str) -> anyhow::Result<String> {
        let lease_key = Self::lease_key(key);

        let lease = match self.kv.get(&lease_key).await? {
            Some(data) => {
                let lease: Lease = serde_json::from_slice(&data)?;
                if lease.holder_id == self.node_id {
                    Lease {
                        renew_at: Utc::now(),
                        ..lease
                    }
                } else if lease.is_expired() {
                    info!(
                        "Lease {} expired (held by {}), acquiring for {}",
                        key, lease.holder_id, self.node_id
                    );
                    self.fresh_lease(key)
                } else {
                    return Ok(lease.holder_id);
                }
            }
            None => {
                info!("No lease for {}, acquiring for {}", key, self.node_id);
                self.fresh_lease(key)
            }
        };

        let data = serde_json::to_vec(&lease)?;
        self.kv.put(&lease_key, &data).await?;
        Ok(lease.holder_id)
    }

    /// Release every lease this node holds.
    pub async fn resign(&self) -> anyhow::Result<()> {
        for key in self.leaders.keys() {
            if self.is_leader(key) {
                self.kv.delete(&Self::lease_key(key)).await?;
                info!("Resigned leadership of {}", key);
            }
            self.set_leader(key, None);
        }
        Ok(())
    }

    fn set_leader(&self, key: &str, holder: Option<String>) {
        let Some(tx) = self.leaders.get(key) else {
            return;
        };
        let was_leader = tx.borrow().as_deref() == Some(self.node_id.as_str());
        let is_leader = holder.as_deref() == Some(self.node_id.as_str());
        if is_leader && !was_leader {
            info!("{} is now the leader of {}", self.node_id, key);
        } else if !is_leader && was_leader {
            warn!("{} lost leadership of {}", self.node_id, key);
        }
        tx.send_if_modified(|current| {
            if *current != holder {
                *current = holder;
                true
            } else {
                false
            }
        });
    }

    /// Start the election loop as a background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "LeaderElection started (node_id={}, ttl={}s, renew={}s)",
                self.node_id,
                self.ttl.as_secs(),
                self.renew_interval.as_secs()
            );

            let mut interval = tokio::time::interval(self.renew_interval);
            loop {
                interval.tick().await;
                for key in self.leaders.keys() {
                    match self.try_acquire_or_renew(key).await {
                        Ok(holder) => self.set_leader(key, Some(holder)),
                        Err(e) => {
                            warn!("Leader election error for {}: {}", key, e);
                            self.set_leader(key, None);
                        }
                    }
                }
            }
        })
    }
}

impl Leadership for LeaderElection {
    fn local_node(&self) -> &str {
        &self.node_id
    }

    fn leader(&self, key: &str) -> Option<String> {
        self.leaders.get(key).and_then(|tx| tx.borrow().clone())
    }

    fn subscribe(&self, key: &str) -> watch::Receiver<Option<String>> {
        match self.leaders.get(key) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(None).1,
        }
    }
}

/// Leadership set by hand: single-node runs and tests.
pub struct StaticLeadership {
    node_id: String,
    leader: watch::Sender<Option<String>>,
}

impl StaticLeadership {
    /// A coordinator where this node leads every key.
    pub fn leading(node_id: &str) -> Self {
        let (leader, _) = watch::channel(Some(node_id.to_string()));
        Self {
            node_id: node_id.to_string(),
            leader,
        }
    }

    /// A coordinator where `leader` (possibly another node, or nobody) leads.
    pub fn with_leader(node_id: &str, leader: Option<&str>) -> Self {
        let (tx, _) = watch::channel(leader.map(str::to_string));
        Self {
            node_id: node_id.to_string(),
            leader: tx,
        }
    }

    pub fn set_leader(&self, leader: Option<&str>) {
        self.leader.send_replace(leader.map(str::to_string));
    }
}

impl Leadership for StaticLeadership {
    fn local_node(&self) -> &str {
        &self.node_id
    }

    fn leader(&self, _key: &str) -> Option<String> {
        self.leader.borrow().clone()
    }

    fn subscribe(&self, _key: &str) -> watch::Receiver<Option<String>> {
        self.leader.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStore;

    const KEY: &str = "test.app";

    #[tokio::test]
    async fn first_node_wins_lease() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let a = LeaderElection::new(kv.clone(), "a".to_string(), &[KEY]);
        let b = LeaderElection::new(kv, "b".to_string(), &[KEY]);

        assert_eq!(a.try_acquire_or_renew(KEY).await.unwrap(), "a");
        assert_eq!(b.try_acquire_or_renew(KEY).await.unwrap(), "a");
        assert_eq!(a.try_acquire_or_renew(KEY).await.unwrap(), "a");

        a.set_leader(KEY, Some("a".to_string()));
        b.set_leader(KEY, Some("a".to_string()));
        assert!(a.is_leader(KEY));
        assert!(!b.is_leader(KEY));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let stale = Lease {
            id: KEY.to_string(),
            holder_id: "a".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
            renew_at: Utc::now() - chrono::Duration::seconds(60),
            ttl_seconds: 15,
        };
        kv.put(
            &LeaderElection::lease_key(KEY),
            &serde_json::to_vec(&stale).unwrap(),
        )
        .await
        .unwrap();

        let b = LeaderElection::new(kv, "b".to_string(), &[KEY]);
        assert_eq!(b.try_acquire_or_renew(KEY).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn resign_releases_lease() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let a = LeaderElection::new(kv.clone(), "a".to_string(), &[KEY]);
        let holder = a.try_acquire_or_renew(KEY).await.unwrap();
        a.set_leader(KEY, Some(holder));
        let mut rx = a.subscribe(KEY);
        a.resign().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), None);

        let b = LeaderElection::new(kv, "b".to_string(), &[KEY]);
        assert_eq!(b.try_acquire_or_renew(KEY).await.unwrap(), "b");
    }

    #[test]
    fn static_leadership_flips() {
        let l = StaticLeadership::with_leader("a", None);
        assert!(!l.is_leader(KEY));
        l.set_leader(Some("a"));
        assert!(l.is_leader(KEY));
        l.set_leader(Some("b"));
        assert!(!l.is_leader(KEY));
        assert_eq!(l.leader(KEY).as_deref(), Some("b"));
    }
}
