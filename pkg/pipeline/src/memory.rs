use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, broadcast};

use pkg_types::net::DeviceId;

use crate::driver::{DriverError, SwitchDriver};
use crate::flow::{FlowKey, FlowRule, GroupBucket, GroupDescription, GroupId};
use crate::packet::{OutPort, Packet, PacketIn};
use crate::simulate::DeviceTables;

#[derive(Default)]
struct Fleet {
    devices: HashMap<DeviceId, Tables>,
    offline: HashSet<DeviceId>,
    emitted: Vec<(DeviceId, OutPort, Packet)>,
}

#[derive(Default)]
struct Tables {
    flows: BTreeMap<FlowKey, FlowRule>,
    groups: BTreeMap<GroupId, GroupDescription>,
}

impl Fleet {
    fn online(&mut self, device: &DeviceId) -> Result<&mut Tables, DriverError> {
        if self.offline.contains(device) {
            return Err(DriverError::DeviceUnavailable(device.clone()));
        }
        Ok(self.devices.entry(device.clone()).or_default())
    }
}

/// In-memory switch fleet. Idempotent like a real driver; devices can be
/// taken offline to exercise partial fan-out failure.
pub struct MemorySwitch {
    fleet: Mutex<Fleet>,
    packet_tx: broadcast::Sender<PacketIn>,
}

impl Default for MemorySwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySwitch {
    pub fn new() -> Self {
        let (packet_tx, _) = broadcast::channel(1024);
        Self {
            fleet: Mutex::new(Fleet::default()),
            packet_tx,
        }
    }

    pub async fn set_online(&self, device: &DeviceId, online: bool) {
        let mut fleet = self.fleet.lock().await;
        if online {
            fleet.offline.remove(device);
        } else {
            fleet.offline.insert(device.clone());
        }
    }

    /// Deliver a packet-in as if `device` had punted it.
    pub fn inject(&self, packet_in: PacketIn) {
        let _ = self.packet_tx.send(packet_in);
    }

    /// Every packet-out issued so far.
    pub async fn emitted(&self) -> Vec<(DeviceId, OutPort, Packet)> {
        self.fleet.lock().await.emitted.clone()
    }

    pub async fn flow_count(&self, device: &DeviceId) -> usize {
        self.fleet
            .lock()
            .await
            .devices
            .get(device)
            .map(|t| t.flows.len())
            .unwrap_or(0)
    }

    /// Copy of one device's tables, for tracing packets through it.
    pub async fn tables(&self, device: &DeviceId) -> DeviceTables {
        let fleet = self.fleet.lock().await;
        match fleet.devices.get(device) {
            Some(t) => DeviceTables::new(
                t.flows.values().cloned().collect(),
                t.groups.values().cloned().collect(),
            ),
            None => DeviceTables::default(),
        }
    }
}

#[async_trait]
impl SwitchDriver for MemorySwitch {
    async fn install_flow(&self, rule: FlowRule) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        let tables = fleet.online(&rule.device)?;
        if let Some(id) = rule.actions.iter().find_map(|a| match a {
            crate::flow::Action::Group(id) => Some(*id),
            _ => None,
        }) {
            if !tables.groups.contains_key(&id) {
                return Err(DriverError::Rejected {
                    device: rule.device.clone(),
                    reason: format!("flow references missing group {}", id),
                });
            }
        }
        tables.flows.insert(rule.key(), rule);
        Ok(())
    }

    async fn remove_flow(&self, rule: FlowRule) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        fleet.online(&rule.device)?.flows.remove(&rule.key());
        Ok(())
    }

    async fn install_group(&self, group: GroupDescription) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        let tables = fleet.online(&group.device)?;
        tables.groups.insert(group.id, group);
        Ok(())
    }

    async fn remove_group(&self, device: &DeviceId, id: GroupId) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        fleet.online(device)?.groups.remove(&id);
        Ok(())
    }

    async fn add_buckets(
        &self,
        device: &DeviceId,
        id: GroupId,
        buckets: Vec<GroupBucket>,
    ) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        let group = fleet
            .online(device)?
            .groups
            .get_mut(&id)
            .ok_or_else(|| DriverError::Rejected {
                device: device.clone(),
                reason: format!("no group {}", id),
            })?;
        for bucket in buckets {
            if !group.buckets.contains(&bucket) {
                group.buckets.push(bucket);
            }
        }
        Ok(())
    }

    async fn remove_buckets(
        &self,
        device: &DeviceId,
        id: GroupId,
        buckets: Vec<GroupBucket>,
    ) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        if let Some(group) = fleet.online(device)?.groups.get_mut(&id) {
            group.buckets.retain(|b| !buckets.contains(b));
        }
        Ok(())
    }

    async fn group(
        &self,
        device: &DeviceId,
        id: GroupId,
    ) -> Result<Option<GroupDescription>, DriverError> {
        let mut fleet = self.fleet.lock().await;
        Ok(fleet.online(device)?.groups.get(&id).cloned())
    }

    async fn flows(&self, device: &DeviceId) -> Result<Vec<FlowRule>, DriverError> {
        let mut fleet = self.fleet.lock().await;
        Ok(fleet.online(device)?.flows.values().cloned().collect())
    }

    async fn groups(&self, device: &DeviceId) -> Result<Vec<GroupDescription>, DriverError> {
        let mut fleet = self.fleet.lock().await;
        Ok(fleet.online(device)?.groups.values().cloned().collect())
    }

    async fn emit(
        &self,
        device: &DeviceId,
        port: OutPort,
        packet: Packet,
    ) -> Result<(), DriverError> {
        let mut fleet = self.fleet.lock().await;
        fleet.online(device)?;
        fleet.emitted.push((device.clone(), port, packet));
        Ok(())
    }

    fn packet_in(&self) -> broadcast::Receiver<PacketIn> {
        self.packet_tx.subscribe()
    }
}
