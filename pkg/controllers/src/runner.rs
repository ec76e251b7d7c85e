use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pkg_state::{ResourceEvent, ResourceStore};
use pkg_types::Resource;

use crate::context::Context;

/// A leadership-gated event consumer owning one slice of the pipeline.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Event: Send + 'static;

    fn name(&self) -> &'static str;

    /// React to one event. Only called while this instance leads.
    async fn handle(&self, event: Self::Event);

    /// Re-derive the complete desired state and converge onto it.
    async fn resync(&self);
}

pub enum Work<E> {
    Event(E),
    Resync,
}

/// Entry point into a running reconciler's queue.
pub struct ReconcilerHandle<E> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Work<E>>,
}

impl<E> Clone for ReconcilerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> ReconcilerHandle<E> {
    pub fn submit(&self, event: E) {
        let _ = self.tx.send(Work::Event(event));
    }

    /// Feed every event of `store` into this queue, mapped by `map`.
    pub fn forward<T, F>(&self, store: &ResourceStore<T>, map: F)
    where
        T: Resource,
        F: Fn(ResourceEvent<T>) -> E + Send + Sync + 'static,
    {
        let tx = self.tx.clone();
        store.add_listener(move |event| {
            let _ = tx.send(Work::Event(map(event)));
        });
    }
}

/// Type-erased resync trigger, so the manager can hold every reconciler.
pub trait Resync: Send + Sync {
    fn name(&self) -> &'static str;
    fn request_resync(&self);
}

impl<E: Send + 'static> Resync for ReconcilerHandle<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request_resync(&self) {
        let _ = self.tx.send(Work::Resync);
    }
}

/// Run `reconciler` on its own task with a single ordered queue.
///
/// Leadership is checked for every item as it is dequeued; items that
/// arrive while another instance leads are dropped, since the new leader's
/// full resync covers them.
pub fn spawn_reconciler<R: Reconciler>(
    reconciler: Arc<R>,
    ctx: Arc<Context>,
) -> ReconcilerHandle<R::Event> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Work<R::Event>>();
    let name = reconciler.name();
    tokio::spawn(async move {
        info!("{} reconciler started", name);
        while let Some(work) = rx.recv().await {
            if !ctx.is_leader() {
                debug!("{}: not leader, dropping work item", name);
                continue;
            }
            match work {
                Work::Event(event) => reconciler.handle(event).await,
                Work::Resync => reconciler.resync().await,
            }
        }
        info!("{} reconciler stopped", name);
    });
    ReconcilerHandle { name, tx }
}
