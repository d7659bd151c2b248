//! Fetch coordination.
//!
//! Decides when to hit the network and makes sure each key has at most one
//! outstanding fetch. Concurrent requesters of the same key attach to one
//! shared future instead of issuing duplicates; distinct keys fetch freely in
//! parallel with no global limit.
//!
//! Transient failures retry with doubling backoff up to the configured cap.
//! Rejections and validation failures never retry.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{SyncError, TransportError};
use crate::key::CacheKey;
use crate::store::EntryStore;
use crate::transport::ResourceTransport;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, SyncError>>>;

pub struct FetchCoordinator {
    store: Arc<EntryStore>,
    transport: Arc<dyn ResourceTransport>,
    in_flight: Arc<DashMap<CacheKey, SharedFetch>>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<EntryStore>, transport: Arc<dyn ResourceTransport>) -> Self {
        Self {
            store,
            transport,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Returns the cached value when it is fresh; otherwise fetches, joining
    /// any fetch already in flight for the key.
    pub async fn ensure_fresh(&self, key: &CacheKey) -> Result<Value, SyncError> {
        if let Some(snapshot) = self.store.get(key) {
            if snapshot.is_fresh() {
                if let Some(value) = snapshot.value {
                    counter!("agora_sync_cache_hits_total", "kind" => key.kind().name())
                        .increment(1);
                    return Ok(value);
                }
            }
        }
        self.join_or_spawn(key).await
    }

    /// Fetches regardless of freshness, still coalescing with any fetch
    /// already in flight.
    pub async fn refetch(&self, key: &CacheKey) -> Result<Value, SyncError> {
        self.join_or_spawn(key).await
    }

    /// Refetches a batch of keys concurrently. Returns how many succeeded;
    /// individual failures are already recorded on their entries.
    pub async fn refetch_many(&self, keys: &[CacheKey]) -> usize {
        let results = join_all(keys.iter().map(|key| self.refetch(key))).await;
        results.iter().filter(|result| result.is_ok()).count()
    }

    /// Foreground/focus regained: refetch stale subscribed entries whose
    /// kind opts into focus refresh.
    pub async fn handle_focus(&self) -> usize {
        let keys: Vec<CacheKey> = self
            .store
            .stale_subscribed_keys()
            .into_iter()
            .filter(|key| self.store.config().policy(key.kind()).refetch_on_focus)
            .collect();
        if keys.is_empty() {
            return 0;
        }
        debug!(keys = keys.len(), "Refetching stale entries on focus");
        self.refetch_many(&keys).await
    }

    /// Connectivity returned: refetch every subscribed entry, fresh or not.
    pub async fn handle_reconnect(&self) -> usize {
        let keys = self.store.subscribed_keys();
        if keys.is_empty() {
            return 0;
        }
        debug!(keys = keys.len(), "Refetching subscribed entries on reconnect");
        self.refetch_many(&keys).await
    }

    async fn join_or_spawn(&self, key: &CacheKey) -> Result<Value, SyncError> {
        let fetch = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                counter!("agora_sync_coalesced_waits_total", "kind" => key.kind().name())
                    .increment(1);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let fetch = self.spawn_fetch(key.clone());
                vacant.insert(fetch.clone());
                fetch
            }
        };
        fetch.await
    }

    fn spawn_fetch(&self, key: CacheKey) -> SharedFetch {
        let store = Arc::clone(&self.store);
        let transport = Arc::clone(&self.transport);
        let in_flight = Arc::clone(&self.in_flight);
        let retry = store.config().retry.clone();

        let task = tokio::spawn(async move {
            let seq = store.begin_fetch(&key);
            let started = Instant::now();
            let result = fetch_with_retries(transport.as_ref(), &key, &retry).await;
            histogram!("agora_sync_fetch_ms", "kind" => key.kind().name())
                .record(started.elapsed().as_secs_f64() * 1000.0);
            in_flight.remove(&key);
            match result {
                Ok(value) => {
                    store.complete_fetch(&key, seq, value.clone());
                    Ok(value)
                }
                Err(error) => {
                    let error = SyncError::from(error);
                    store.fail_fetch(&key, seq, error.clone());
                    Err(error)
                }
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(SyncError::network(format!(
                    "fetch task failed: {join_error}"
                ))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn fetch_with_retries(
    transport: &dyn ResourceTransport,
    key: &CacheKey,
    retry: &RetrySettings,
) -> Result<Value, TransportError> {
    let mut attempt = 0u32;
    loop {
        counter!("agora_sync_fetches_total", "kind" => key.kind().name()).increment(1);
        match transport.fetch(key).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < retry.max_retries => {
                let backoff = retry.backoff(attempt);
                attempt += 1;
                counter!("agora_sync_fetch_retries_total", "kind" => key.kind().name())
                    .increment(1);
                debug!(
                    key = %key,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retrying transient fetch failure"
                );
                sleep(backoff).await;
            }
            Err(error) => {
                warn!(key = %key, attempt, error = %error, "Fetch failed");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Duration;

    use crate::config::SyncConfig;
    use crate::kind::ResourceKind;
    use crate::store::EntryStatus;

    use super::*;

    /// Replays a scripted sequence of fetch outcomes; repeats the last one
    /// once the script runs out.
    struct ScriptedTransport {
        fetches: AtomicUsize,
        script: Mutex<VecDeque<Result<Value, TransportError>>>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Value, TransportError>>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn next_outcome(&self) -> Result<Value, TransportError> {
            let mut script = self.script.lock().expect("script lock");
            if script.len() > 1 {
                script.pop_front().expect("scripted outcome")
            } else {
                script.front().cloned().expect("scripted outcome")
            }
        }
    }

    #[async_trait]
    impl ResourceTransport for ScriptedTransport {
        async fn fetch(&self, _key: &CacheKey) -> Result<Value, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.next_outcome()
        }

        async fn create(
            &self,
            _kind: ResourceKind,
            _payload: &Value,
        ) -> Result<Value, TransportError> {
            unimplemented!("fetch-only transport")
        }

        async fn update(
            &self,
            _kind: ResourceKind,
            _id: &str,
            _payload: &Value,
        ) -> Result<Value, TransportError> {
            unimplemented!("fetch-only transport")
        }

        async fn delete(&self, _kind: ResourceKind, _id: &str) -> Result<(), TransportError> {
            unimplemented!("fetch-only transport")
        }
    }

    fn coordinator(transport: Arc<ScriptedTransport>) -> FetchCoordinator {
        let store = Arc::new(EntryStore::new(SyncConfig::default()));
        FetchCoordinator::new(store, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_coalesce_into_one_fetch() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![Ok(json!(["a"]))])
                .with_delay(Duration::from_millis(100)),
        );
        let coordinator = Arc::new(coordinator(Arc::clone(&transport)));
        let key = CacheKey::list(ResourceKind::Bounty);

        let requests: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let key = key.clone();
                tokio::spawn(async move { coordinator.ensure_fresh(&key).await })
            })
            .collect();

        for request in requests {
            let value = request.await.expect("join").expect("fetch result");
            assert_eq!(value, json!(["a"]));
        }
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn fresh_values_are_served_without_a_fetch() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({"id": "b1"}))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let key = CacheKey::detail(ResourceKind::Bounty, "b1");

        coordinator.ensure_fresh(&key).await.expect("first fetch");
        coordinator.ensure_fresh(&key).await.expect("cached read");

        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn refetch_bypasses_freshness() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({"id": "b1"}))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let key = CacheKey::detail(ResourceKind::Bounty, "b1");

        coordinator.ensure_fresh(&key).await.expect("first fetch");
        coordinator.refetch(&key).await.expect("forced fetch");

        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::network("reset")),
            Err(TransportError::network("reset")),
            Ok(json!({"id": "p1"})),
        ]));
        let coordinator = coordinator(Arc::clone(&transport));
        let key = CacheKey::detail(ResourceKind::Project, "p1");

        let value = coordinator.ensure_fresh(&key).await.expect("eventual value");
        assert_eq!(value, json!({"id": "p1"}));
        assert_eq!(transport.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_and_surface_the_failure() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::network(
            "down",
        ))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let key = CacheKey::list(ResourceKind::Member);

        let error = coordinator.ensure_fresh(&key).await.expect_err("exhausted");
        assert!(matches!(error, SyncError::NetworkFailure { .. }));
        // Initial attempt plus the three configured retries.
        assert_eq!(transport.fetch_count(), 4);

        let snapshot = coordinator.store().get(&key).expect("entry");
        assert_eq!(snapshot.status, EntryStatus::Error);
    }

    #[tokio::test]
    async fn rejections_never_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::rejected(
            404, "not found",
        ))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let key = CacheKey::detail(ResourceKind::MeetingNote, "n1");

        let error = coordinator.ensure_fresh(&key).await.expect_err("rejected");
        assert!(matches!(error, SyncError::Rejected { status: 404, .. }));
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_refetches_only_stale_subscribed_keys() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!([]))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let stale = CacheKey::list(ResourceKind::ForumPost);
        let fresh = CacheKey::list(ResourceKind::MeetingNote);

        coordinator.ensure_fresh(&stale).await.expect("seed stale");
        coordinator.ensure_fresh(&fresh).await.expect("seed fresh");
        let _sub_stale = coordinator.store().subscribe(&stale);
        let _sub_fresh = coordinator.store().subscribe(&fresh);

        // Past the forum-post window (15s), inside the meeting-note one (3m).
        tokio::time::advance(Duration::from_secs(20)).await;

        let refetched = coordinator.handle_focus().await;
        assert_eq!(refetched, 1);
        assert_eq!(transport.fetch_count(), 3);
    }

    #[tokio::test]
    async fn reconnect_refetches_all_subscribed_keys() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!([]))]));
        let coordinator = coordinator(Arc::clone(&transport));
        let a = CacheKey::list(ResourceKind::Bounty);
        let b = CacheKey::list(ResourceKind::Project);

        coordinator.ensure_fresh(&a).await.expect("seed a");
        coordinator.ensure_fresh(&b).await.expect("seed b");
        let _sub_a = coordinator.store().subscribe(&a);
        let _sub_b = coordinator.store().subscribe(&b);

        let refetched = coordinator.handle_reconnect().await;
        assert_eq!(refetched, 2);
        assert_eq!(transport.fetch_count(), 4);
    }
}
