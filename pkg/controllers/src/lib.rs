//! Reconcilers turning cluster state into switch pipeline rules.
//!
//! Each reconciler owns one application id's slice of every switch. It
//! applies store events incrementally and converges its full rule set on
//! resync. Only the elected leader programs switches.

pub mod arp;
pub mod context;
pub mod ipam;
pub mod manager;
pub mod network_policy;
pub mod node_port;
pub mod runner;
pub mod service_nat;
pub mod snat;
pub mod switching;

pub use context::{ConfigHandle, Context, MacTable, Stores};
pub use manager::ControllerManager;
pub use runner::{Reconciler, ReconcilerHandle};
