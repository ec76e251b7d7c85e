use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// A record kept in a `ResourceStore`, identified by a stable UID.
pub trait Resource:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Edge-triggered sub-event derived by diffing an old and a new value.
    type Transition: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Registry kind, used as the key prefix (`/registry/<KIND>/<uid>`).
    const KIND: &'static str;

    fn uid(&self) -> &str;

    /// Transitions implied by an update from `old` to `new`.
    ///
    /// Must fire only on the specific edge, never on every update.
    fn transitions(_old: &Self, _new: &Self) -> Vec<Self::Transition> {
        Vec::new()
    }
}

/// Transition type for kinds whose status has no meaningful sub-phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoTransition {}
