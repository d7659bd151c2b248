//! Client facade.
//!
//! [`SyncClient`] wires the entry store, fetch coordinator, and mutation
//! pipeline together behind one handle. It also owns the background
//! maintenance loops: a poller per kind that opts into interval polling, and
//! the eviction sweeper.

use std::sync::Arc;

use metrics::gauge;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SyncConfig;
use crate::coordinator::FetchCoordinator;
use crate::error::SyncError;
use crate::key::CacheKey;
use crate::kind::ResourceKind;
use crate::mutation::{MutationHandle, MutationPipeline, MutationRequest};
use crate::store::{EntrySnapshot, EntryStore, Subscription};
use crate::transport::ResourceTransport;

pub struct SyncClient {
    store: Arc<EntryStore>,
    coordinator: Arc<FetchCoordinator>,
    pipeline: MutationPipeline,
}

impl SyncClient {
    pub fn new(config: SyncConfig, transport: Arc<dyn ResourceTransport>) -> Self {
        let store = Arc::new(EntryStore::new(config));
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
        ));
        let pipeline = MutationPipeline::new(Arc::clone(&coordinator), transport);
        Self {
            store,
            coordinator,
            pipeline,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Resident snapshot of `key`, without touching the network.
    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        self.store.get(key)
    }

    /// Cached value when fresh, otherwise fetched.
    pub async fn read(&self, key: &CacheKey) -> Result<Value, SyncError> {
        self.coordinator.ensure_fresh(key).await
    }

    /// [`read`](Self::read), deserialized into a domain type.
    pub async fn read_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<T, SyncError> {
        let value = self.read(key).await?;
        serde_json::from_value(value).map_err(|err| SyncError::ValidationFailed {
            message: err.to_string(),
        })
    }

    /// Fetches `key` regardless of freshness.
    pub async fn refetch(&self, key: &CacheKey) -> Result<Value, SyncError> {
        self.coordinator.refetch(key).await
    }

    /// Registers interest in `key` and returns the subscription stream.
    ///
    /// When the resident value is missing or stale a refetch is scheduled
    /// immediately; the subscriber observes it as updates. This is what turns
    /// an invalidated-but-unwatched entry fresh again the moment someone
    /// starts watching it.
    pub fn watch(&self, key: &CacheKey) -> Subscription {
        let subscription = self.store.subscribe(key);
        let fresh = self
            .store
            .get(key)
            .is_some_and(|snapshot| snapshot.is_fresh());
        if !fresh {
            let coordinator = Arc::clone(&self.coordinator);
            let key = key.clone();
            tokio::spawn(async move {
                let _ = coordinator.ensure_fresh(&key).await;
            });
        }
        subscription
    }

    /// Applies `request` optimistically and returns the settling handle.
    pub fn mutate(&self, request: MutationRequest) -> MutationHandle {
        self.pipeline.start(request)
    }

    /// Drops every entry of `kind`. Subscribed entries survive as stale and
    /// are refetched in the background; the count of those is returned.
    pub fn invalidate_kind(&self, kind: ResourceKind) -> usize {
        let subscribed = self.store.invalidate_kind(kind);
        let count = subscribed.len();
        if !subscribed.is_empty() {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                coordinator.refetch_many(&subscribed).await;
            });
        }
        count
    }

    /// The application regained focus.
    pub async fn handle_focus(&self) -> usize {
        self.coordinator.handle_focus().await
    }

    /// Connectivity returned after an offline period.
    pub async fn handle_reconnect(&self) -> usize {
        self.coordinator.handle_reconnect().await
    }

    /// Spawns the per-kind pollers and the eviction sweeper.
    pub fn start_background(&self) -> BackgroundTasks {
        let mut handles = Vec::new();

        for kind in ResourceKind::ALL {
            let Some(interval) = self.store.config().policy(kind).poll_interval() else {
                continue;
            };
            let coordinator = Arc::clone(&self.coordinator);
            handles.push(tokio::spawn(async move {
                let mut ticks = tokio::time::interval(interval);
                ticks.tick().await; // Skip the first immediate tick
                loop {
                    ticks.tick().await;
                    let keys = coordinator.store().pollable_keys(kind);
                    if keys.is_empty() {
                        continue;
                    }
                    let refreshed = coordinator.refetch_many(&keys).await;
                    debug!(kind = %kind, keys = keys.len(), refreshed, "Polled subscribed entries");
                }
            }));
        }

        let store = Arc::clone(&self.store);
        let sweep_interval = self.store.config().sweep_interval();
        handles.push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(sweep_interval);
            ticks.tick().await; // Skip the first immediate tick
            loop {
                ticks.tick().await;
                store.sweep_expired();
                gauge!("agora_sync_resident_entries").set(store.len() as f64);
            }
        }));

        BackgroundTasks { handles }
    }
}

/// Owner of the spawned maintenance loops. Dropping it aborts them.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stops every loop and waits for it to wind down.
    pub async fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
