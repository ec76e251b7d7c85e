pub mod client;
pub mod error;
pub mod event;
pub mod leader;
pub mod store;

pub use client::{KvBackend, KvOp, MemoryStore, StateStore};
pub use error::StoreError;
pub use event::{EventKind, ResourceEvent, WatchAction};
pub use leader::{LeaderElection, Leadership, StaticLeadership};
pub use store::ResourceStore;
