pub mod addressing;
pub mod admin;
pub mod ipam;

pub use admin::NetworkAdmin;
pub use ipam::{IpamAllocator, IpamError};
