use serde::{Deserialize, Serialize};

use pkg_types::Resource;

/// Upstream watch notification type, as delivered by the API watch client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind<X> {
    Created,
    Updated,
    Removed,
    /// Edge-triggered status transition derived from an update.
    Transition(X),
}

/// A typed change event emitted by a `ResourceStore`.
///
/// `subject` is the new value (or the removed value for `Removed`);
/// `previous` is the old value for updates and transitions.
#[derive(Debug, Clone)]
pub struct ResourceEvent<T: Resource> {
    pub seq: u64,
    pub kind: EventKind<T::Transition>,
    pub subject: T,
    pub previous: Option<T>,
}

impl<T: Resource> ResourceEvent<T> {
    pub fn is_transition(&self, transition: &T::Transition) -> bool {
        matches!(&self.kind, EventKind::Transition(t) if t == transition)
    }
}

/// A committed mutation, fanned out into one or more `ResourceEvent`s.
#[derive(Debug, Clone)]
pub(crate) enum Change<T> {
    Created(T),
    Updated { old: T, new: T },
    Removed(T),
}

/// Expand a committed mutation into its events: `Updated` first, then any
/// derived transitions in the order the resource reports them.
pub(crate) fn expand<T: Resource>(seq: u64, change: Change<T>) -> Vec<ResourceEvent<T>> {
    match change {
        Change::Created(obj) => vec![ResourceEvent {
            seq,
            kind: EventKind::Created,
            subject: obj,
            previous: None,
        }],
        Change::Removed(obj) => vec![ResourceEvent {
            seq,
            kind: EventKind::Removed,
            subject: obj,
            previous: None,
        }],
        Change::Updated { old, new } => {
            let transitions = T::transitions(&old, &new);
            let mut events = Vec::with_capacity(1 + transitions.len());
            events.push(ResourceEvent {
                seq,
                kind: EventKind::Updated,
                subject: new.clone(),
                previous: Some(old.clone()),
            });
            for t in transitions {
                events.push(ResourceEvent {
                    seq,
                    kind: EventKind::Transition(t),
                    subject: new.clone(),
                    previous: Some(old.clone()),
                });
            }
            events
        }
    }
}
