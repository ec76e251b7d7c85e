pub mod driver;
pub mod flow;
pub mod memory;
pub mod packet;
pub mod programmer;
pub mod simulate;

pub use driver::{DriverError, SwitchDriver};
pub use flow::{
    Action, CtAction, CtNat, FlowKey, FlowRule, GroupBucket, GroupDescription, GroupId, Match,
    Persistence,
};
pub use memory::MemorySwitch;
pub use packet::{OutPort, Packet, PacketIn};
pub use programmer::{DesiredState, FlowProgrammer};
pub use simulate::{Conntrack, DeviceTables, Trace, Verdict};
