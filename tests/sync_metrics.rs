use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use agora_sync::{
    CacheKey, MutationRequest, ResourceKind, ResourceTransport, SyncClient, SyncConfig,
    TransportError,
};
use async_trait::async_trait;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serde_json::{Value, json};
use serial_test::serial;
use tokio::time::{Duration, advance, sleep};

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

fn snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

fn recorded_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

struct ScriptedTransport {
    fetch_script: Mutex<VecDeque<Result<Value, TransportError>>>,
    mutation_script: Mutex<VecDeque<Result<Value, TransportError>>>,
    fetch_delay: Duration,
}

impl ScriptedTransport {
    fn new(
        fetch_script: Vec<Result<Value, TransportError>>,
        mutation_script: Vec<Result<Value, TransportError>>,
    ) -> Self {
        Self {
            fetch_script: Mutex::new(fetch_script.into()),
            mutation_script: Mutex::new(mutation_script.into()),
            fetch_delay: Duration::ZERO,
        }
    }

    fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    fn next(script: &Mutex<VecDeque<Result<Value, TransportError>>>) -> Result<Value, TransportError> {
        let mut script = script.lock().expect("script lock");
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
        if !self.fetch_delay.is_zero() {
            sleep(self.fetch_delay).await;
        }
        Self::next(&self.fetch_script)
    }

    async fn create(&self, _kind: ResourceKind, _payload: &Value) -> Result<Value, TransportError> {
        Self::next(&self.mutation_script)
    }

    async fn update(
        &self,
        _kind: ResourceKind,
        _id: &str,
        _payload: &Value,
    ) -> Result<Value, TransportError> {
        Self::next(&self.mutation_script)
    }

    async fn delete(&self, _kind: ResourceKind, _id: &str) -> Result<(), TransportError> {
        Self::next(&self.mutation_script).map(|_| ())
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn fetch_paths_emit_expected_metric_keys() {
    snapshotter();

    // Retry then succeed, with enough delay that concurrent readers overlap.
    let transport = Arc::new(
        ScriptedTransport::new(vec![Err(TransportError::network("reset")), Ok(json!([]))], vec![])
            .with_fetch_delay(Duration::from_millis(50)),
    );
    let client = Arc::new(SyncClient::new(
        SyncConfig::default(),
        transport as Arc<dyn ResourceTransport>,
    ));
    let key = CacheKey::list(ResourceKind::Bounty);

    // Two concurrent readers: one fetch, one coalesced wait, one retry.
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let client = Arc::clone(&client);
            let key = key.clone();
            tokio::spawn(async move { client.read(&key).await })
        })
        .collect();
    for reader in readers {
        reader.await.expect("join").expect("fetched value");
    }

    // A fresh re-read is a cache hit.
    client.read(&key).await.expect("cached read");

    // A superseded fetch result is discarded, not applied.
    let store = client.store();
    let seq = store.begin_fetch(&key);
    store.apply_optimistic(&key, json!([{"id": "local"}]));
    assert!(!store.complete_fetch(&key, seq, json!([{"id": "remote"}])));

    // The sweeper evicts the disused entry and reports store residency.
    let background = client.start_background();
    advance(Duration::from_secs(400)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    background.shutdown().await;

    let names = recorded_names();
    let expected = [
        "agora_sync_fetches_total",
        "agora_sync_fetch_retries_total",
        "agora_sync_cache_hits_total",
        "agora_sync_coalesced_waits_total",
        "agora_sync_stale_discards_total",
        "agora_sync_evictions_total",
        "agora_sync_resident_entries",
        "agora_sync_fetch_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn mutation_paths_emit_expected_metric_keys() {
    snapshotter();

    let transport = Arc::new(ScriptedTransport::new(
        vec![Ok(json!([]))],
        vec![
            Ok(json!({"id": "n1", "title": "Retro"})),
            Err(TransportError::rejected(403, "not the author")),
        ],
    ));
    let client = SyncClient::new(SyncConfig::default(), transport as Arc<dyn ResourceTransport>);

    // A resident list gives the settled create something to invalidate.
    let list = CacheKey::list(ResourceKind::MeetingNote);
    client.read(&list).await.expect("seed list");

    client
        .mutate(MutationRequest::create(
            ResourceKind::MeetingNote,
            json!({"title": "Retro"}),
        ))
        .settle()
        .await
        .expect("created");

    client
        .mutate(MutationRequest::update(
            ResourceKind::MeetingNote,
            "n1",
            json!({"title": "Retro notes"}),
        ))
        .settle()
        .await
        .expect_err("rejected");

    let names = recorded_names();
    let expected = [
        "agora_sync_mutations_total",
        "agora_sync_rollbacks_total",
        "agora_sync_invalidations_total",
        "agora_sync_mutation_settle_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
