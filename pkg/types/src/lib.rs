pub mod config;
pub mod endpoint;
pub mod ipam;
pub mod namespace;
pub mod net;
pub mod network;
pub mod network_policy;
pub mod node;
pub mod pod;
pub mod port;
pub mod resource;
pub mod selector;
pub mod service;

pub use resource::{NoTransition, Resource};
