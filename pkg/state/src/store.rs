use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use pkg_constants::state::REGISTRY_PREFIX;
use pkg_types::Resource;

use crate::client::{KvBackend, KvOp};
use crate::error::StoreError;
use crate::event::{Change, ResourceEvent, WatchAction, expand};

pub type Listener<T> = Arc<dyn Fn(ResourceEvent<T>) + Send + Sync>;

enum Dispatch<T: Resource> {
    Change(u64, Change<T>),
    Listen(Listener<T>),
}

/// A strongly consistent UID → record table for one resource kind.
///
/// Mutations persist synchronously through the backend, then hand the
/// committed change to a dedicated per-store task that derives events and
/// invokes listeners in commit order.
pub struct ResourceStore<T: Resource> {
    kv: Arc<dyn KvBackend>,
    name: String,
    prefix: String,
    write_lock: Mutex<()>,
    seq: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<Dispatch<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> ResourceStore<T> {
    /// A store for `T` keyed under `/registry/<KIND>/`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(kv: Arc<dyn KvBackend>) -> Arc<Self> {
        Self::named(kv, T::KIND)
    }

    /// A store for `T` under a custom registry name, for kinds kept in
    /// more than one table.
    pub fn named(kv: Arc<dyn KvBackend>, name: &str) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(name.to_string(), dispatch_rx));
        Arc::new(Self {
            kv,
            name: name.to_string(),
            prefix: format!("{}{}/", REGISTRY_PREFIX, name),
            write_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            dispatch_tx,
            _kind: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, uid: &str) -> String {
        format!("{}{}", self.prefix, uid)
    }

    fn not_found(&self, uid: &str) -> StoreError {
        StoreError::NotFound {
            kind: self.name.clone(),
            uid: uid.to_string(),
        }
    }

    fn already_exists(&self, uid: &str) -> StoreError {
        StoreError::AlreadyExists {
            kind: self.name.clone(),
            uid: uid.to_string(),
        }
    }

    fn publish(&self, change: Change<T>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.dispatch_tx.send(Dispatch::Change(seq, change));
    }

    /// Register a callback invoked on the store's event task for every
    /// event committed after registration.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(ResourceEvent<T>) + Send + Sync + 'static,
    {
        let _ = self.dispatch_tx.send(Dispatch::Listen(Arc::new(listener)));
    }

    /// Events committed after this call, as a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ResourceEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(move |event| {
            let _ = tx.send(event);
        });
        rx
    }

    /// Sequence number of the last committed mutation.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    async fn read(&self, uid: &str) -> Result<Option<T>, StoreError> {
        match self.kv.get(&self.key(uid)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, obj: &T) -> Result<(), StoreError> {
        let data = serde_json::to_vec(obj)?;
        self.kv.put(&self.key(obj.uid()), &data).await?;
        Ok(())
    }

    /// Insert a new record. Fails with `AlreadyExists` if the UID is taken.
    pub async fn create(&self, obj: T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.create_locked(obj).await
    }

    async fn create_locked(&self, obj: T) -> Result<T, StoreError> {
        if self.read(obj.uid()).await?.is_some() {
            return Err(self.already_exists(obj.uid()));
        }
        self.write(&obj).await?;
        debug!("{} {} created", self.name, obj.uid());
        self.publish(Change::Created(obj.clone()));
        Ok(obj)
    }

    /// Replace an existing record. Fails with `NotFound` if there is none.
    /// Returns the previous value.
    pub async fn update(&self, obj: T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.update_locked(obj).await
    }

    async fn update_locked(&self, obj: T) -> Result<T, StoreError> {
        let old = self
            .read(obj.uid())
            .await?
            .ok_or_else(|| self.not_found(obj.uid()))?;
        self.write(&obj).await?;
        debug!("{} {} updated", self.name, obj.uid());
        self.publish(Change::Updated {
            old: old.clone(),
            new: obj,
        });
        Ok(old)
    }

    /// Delete a record, returning the removed value.
    pub async fn remove(&self, uid: &str) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.remove_locked(uid).await
    }

    async fn remove_locked(&self, uid: &str) -> Result<T, StoreError> {
        let old = self.read(uid).await?.ok_or_else(|| self.not_found(uid))?;
        self.kv.delete(&self.key(uid)).await?;
        debug!("{} {} removed", self.name, uid);
        self.publish(Change::Removed(old.clone()));
        Ok(old)
    }

    pub async fn get(&self, uid: &str) -> Result<Option<T>, StoreError> {
        self.read(uid).await
    }

    pub async fn list(&self) -> Result<Vec<T>, StoreError> {
        self.kv
            .list_prefix(&self.prefix)
            .await?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .collect()
    }

    /// Ingestion entrypoint for the upstream watch client.
    ///
    /// ADDED and MODIFIED upsert; DELETED removes, treating a missing
    /// record as already converged.
    pub async fn apply(&self, action: WatchAction, obj: T) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match action {
            WatchAction::Added | WatchAction::Modified => {
                if self.read(obj.uid()).await?.is_some() {
                    self.update_locked(obj).await?;
                } else {
                    self.create_locked(obj).await?;
                }
            }
            WatchAction::Deleted => match self.remove_locked(obj.uid()).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!("{} {} already gone", self.name, obj.uid());
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    /// Atomically move a record from this store into `dest`.
    ///
    /// Both stores must share the same backend. Fails with `NotFound` if the
    /// record is absent here, `AlreadyExists` if `dest` already holds it.
    pub async fn move_to(&self, dest: &ResourceStore<T>, uid: &str) -> Result<T, StoreError> {
        if !std::ptr::addr_eq(Arc::as_ptr(&self.kv), Arc::as_ptr(&dest.kv)) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "cannot move {} from {} to {}: stores use different backends",
                uid,
                self.name,
                dest.name
            )));
        }
        let _src = self.write_lock.lock().await;
        let _dst = dest.write_lock.lock().await;

        let obj = self.read(uid).await?.ok_or_else(|| self.not_found(uid))?;
        if dest.read(uid).await?.is_some() {
            return Err(dest.already_exists(uid));
        }
        let data = serde_json::to_vec(&obj)?;
        self.kv
            .write_batch(vec![
                KvOp::Delete(self.key(uid)),
                KvOp::Put(dest.key(uid), data),
            ])
            .await?;
        self.publish(Change::Removed(obj.clone()));
        dest.publish(Change::Created(obj.clone()));
        Ok(obj)
    }
}

async fn dispatch_loop<T: Resource>(name: String, mut rx: mpsc::UnboundedReceiver<Dispatch<T>>) {
    let mut listeners: Vec<Listener<T>> = Vec::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            Dispatch::Listen(listener) => listeners.push(listener),
            Dispatch::Change(seq, change) => {
                for event in expand(seq, change) {
                    for listener in &listeners {
                        listener(event.clone());
                    }
                }
            }
        }
    }
    debug!("{} event task stopped", name);
}
