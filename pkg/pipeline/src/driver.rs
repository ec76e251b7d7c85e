use async_trait::async_trait;
use tokio::sync::broadcast;

use pkg_types::net::DeviceId;

use crate::flow::{FlowRule, GroupBucket, GroupDescription, GroupId};
use crate::packet::{OutPort, Packet, PacketIn};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("device {0} is unavailable")]
    DeviceUnavailable(DeviceId),

    #[error("device {device} rejected the request: {reason}")]
    Rejected { device: DeviceId, reason: String },
}

/// Southbound seam to the programmable switch fleet.
///
/// Implementations must tolerate redundant installs and removals of
/// absent rules.
#[async_trait]
pub trait SwitchDriver: Send + Sync + 'static {
    /// Install or replace the rule with the same key.
    async fn install_flow(&self, rule: FlowRule) -> Result<(), DriverError>;

    /// Remove the rule with the same key, if present.
    async fn remove_flow(&self, rule: FlowRule) -> Result<(), DriverError>;

    async fn install_group(&self, group: GroupDescription) -> Result<(), DriverError>;

    async fn remove_group(&self, device: &DeviceId, id: GroupId) -> Result<(), DriverError>;

    /// Append buckets to an existing group, skipping ones already present.
    async fn add_buckets(
        &self,
        device: &DeviceId,
        id: GroupId,
        buckets: Vec<GroupBucket>,
    ) -> Result<(), DriverError>;

    async fn remove_buckets(
        &self,
        device: &DeviceId,
        id: GroupId,
        buckets: Vec<GroupBucket>,
    ) -> Result<(), DriverError>;

    async fn group(
        &self,
        device: &DeviceId,
        id: GroupId,
    ) -> Result<Option<GroupDescription>, DriverError>;

    async fn flows(&self, device: &DeviceId) -> Result<Vec<FlowRule>, DriverError>;

    async fn groups(&self, device: &DeviceId) -> Result<Vec<GroupDescription>, DriverError>;

    /// Packet-out.
    async fn emit(&self, device: &DeviceId, port: OutPort, packet: Packet)
    -> Result<(), DriverError>;

    /// Packets punted to the controller by any device.
    fn packet_in(&self) -> broadcast::Receiver<PacketIn>;
}
