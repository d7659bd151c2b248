//! Entry store.
//!
//! Authoritative in-memory mapping from cache key to entry. Each entry holds
//! the last known value, freshness bookkeeping, and two per-key sequence
//! counters: `issue_seq` grows on every fetch issuance and local write,
//! `write_seq` records the issuance number of the last applied write. A fetch
//! result only lands when its issuance number is strictly newer than
//! `write_seq`; a slower, older response arriving late is discarded.
//!
//! Subscribers of a key observe writes in the order they were applied to that
//! key. Updates are published while the write lock is held, which is what
//! makes that ordering guarantee hold.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{KindPolicy, SyncConfig};
use crate::error::SyncError;
use crate::key::CacheKey;
use crate::kind::ResourceKind;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "store";
const UPDATE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Entry state
// ============================================================================

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Known key, no fetch has completed yet.
    Idle,
    /// A fetch is in flight. Any previous value stays readable.
    Fetching,
    /// Last fetch or local write succeeded.
    Success,
    /// Last fetch failed after retry exhaustion. Value stays readable.
    Error,
    /// Invalidated; a refetch has not been issued yet.
    StalePending,
}

struct Entry {
    value: Option<Value>,
    status: EntryStatus,
    last_error: Option<SyncError>,
    fetched_at: Option<Instant>,
    last_used: Instant,
    issue_seq: u64,
    write_seq: u64,
    subscribers: usize,
    updates: broadcast::Sender<EntryUpdate>,
}

impl Entry {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            value: None,
            status: EntryStatus::Idle,
            last_error: None,
            fetched_at: None,
            last_used: Instant::now(),
            issue_seq: 0,
            write_seq: 0,
            subscribers: 0,
            updates,
        }
    }
}

/// Read-only view of one entry at a point in time.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub value: Option<Value>,
    pub status: EntryStatus,
    pub last_error: Option<SyncError>,
    pub is_stale: bool,
}

impl EntrySnapshot {
    /// A value exists and is inside its freshness window.
    pub fn is_fresh(&self) -> bool {
        self.value.is_some() && !self.is_stale
    }

    /// Deserializes the cached value, when one exists.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        match &self.value {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| SyncError::ValidationFailed {
                    message: err.to_string(),
                }),
            None => Ok(None),
        }
    }
}

/// Published to subscribers on every applied write to a key.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    pub key: CacheKey,
    pub snapshot: EntrySnapshot,
}

/// Pre-mutation state of one entry, held for the duration of a mutation so
/// rollback can restore it verbatim. `saved = None` records that the entry
/// did not exist.
#[derive(Debug, Clone)]
pub struct RestorePoint {
    key: CacheKey,
    saved: Option<SavedEntry>,
}

impl RestorePoint {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

#[derive(Debug, Clone)]
struct SavedEntry {
    value: Option<Value>,
    status: EntryStatus,
    last_error: Option<SyncError>,
    fetched_at: Option<Instant>,
}

fn is_stale(entry: &Entry, policy: &KindPolicy) -> bool {
    entry.status == EntryStatus::StalePending
        || match entry.fetched_at {
            Some(at) => at.elapsed() >= policy.stale_after(),
            None => true,
        }
}

fn snapshot_of(entry: &Entry, policy: &KindPolicy) -> EntrySnapshot {
    EntrySnapshot {
        value: entry.value.clone(),
        status: entry.status,
        last_error: entry.last_error.clone(),
        is_stale: is_stale(entry, policy),
    }
}

fn notify(entry: &Entry, key: &CacheKey, policy: &KindPolicy) {
    let _ = entry.updates.send(EntryUpdate {
        key: key.clone(),
        snapshot: snapshot_of(entry, policy),
    });
}

fn remove_entry(entries: &mut HashMap<CacheKey, Entry>, key: &CacheKey, config: &SyncConfig) {
    let Some(entry) = entries.get_mut(key) else {
        return;
    };
    if entry.subscribers > 0 {
        // Live subscriptions keep their channel; the entry resets instead.
        entry.issue_seq += 1;
        entry.write_seq = entry.issue_seq;
        entry.value = None;
        entry.status = EntryStatus::Idle;
        entry.last_error = None;
        entry.fetched_at = None;
        notify(entry, key, config.policy(key.kind()));
    } else {
        entries.remove(key);
    }
}

// ============================================================================
// Store
// ============================================================================

/// Owner of all cache entries. Constructed once and shared behind an [`Arc`];
/// tests build isolated instances.
pub struct EntryStore {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    config: SyncConfig,
}

impl EntryStore {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Snapshot of the entry at `key`, marking it as recently used.
    pub fn get(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let entry = entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(snapshot_of(entry, self.config.policy(key.kind())))
    }

    /// Resident keys covered by `prefix`.
    pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        rw_read(&self.entries, SOURCE, "keys_with_prefix")
            .keys()
            .filter(|key| prefix.is_prefix_of(key))
            .cloned()
            .collect()
    }

    /// Subscribed keys of `kind` currently holding a good value. These are
    /// the targets of interval polling.
    pub fn pollable_keys(&self, kind: ResourceKind) -> Vec<CacheKey> {
        rw_read(&self.entries, SOURCE, "pollable_keys")
            .iter()
            .filter(|(key, entry)| {
                key.kind() == kind && entry.subscribers > 0 && entry.status == EntryStatus::Success
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every key with at least one active subscriber.
    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        rw_read(&self.entries, SOURCE, "subscribed_keys")
            .iter()
            .filter(|(_, entry)| entry.subscribers > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Subscribed keys whose value has aged past the kind's freshness window.
    pub fn stale_subscribed_keys(&self) -> Vec<CacheKey> {
        rw_read(&self.entries, SOURCE, "stale_subscribed_keys")
            .iter()
            .filter(|(key, entry)| {
                entry.subscribers > 0 && is_stale(entry, self.config.policy(key.kind()))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        rw_read(&self.entries, SOURCE, "subscriber_count")
            .get(key)
            .map_or(0, |entry| entry.subscribers)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Fetch lifecycle
    // ========================================================================

    /// Records a new fetch issuance for `key` and returns its sequence
    /// number. The entry is created when absent.
    pub fn begin_fetch(&self, key: &CacheKey) -> u64 {
        let mut entries = rw_write(&self.entries, SOURCE, "begin_fetch");
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.issue_seq += 1;
        entry.status = EntryStatus::Fetching;
        notify(entry, key, self.config.policy(key.kind()));
        entry.issue_seq
    }

    /// Applies a successful fetch result, unless a newer write already
    /// landed. Returns whether the value was applied.
    pub fn complete_fetch(&self, key: &CacheKey, seq: u64, value: Value) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "complete_fetch");
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if seq <= entry.write_seq {
            counter!("agora_sync_stale_discards_total", "kind" => key.kind().name()).increment(1);
            debug!(
                key = %key,
                seq,
                write_seq = entry.write_seq,
                "Discarded superseded fetch result"
            );
            return false;
        }
        entry.write_seq = seq;
        entry.value = Some(value);
        entry.status = EntryStatus::Success;
        entry.last_error = None;
        let now = Instant::now();
        entry.fetched_at = Some(now);
        entry.last_used = now;
        notify(entry, key, self.config.policy(key.kind()));
        true
    }

    /// Records a failed fetch. The last good value stays readable. A failure
    /// superseded by a newer write is dropped the same way a superseded
    /// success is.
    pub fn fail_fetch(&self, key: &CacheKey, seq: u64, error: SyncError) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "fail_fetch");
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if seq <= entry.write_seq {
            counter!("agora_sync_stale_discards_total", "kind" => key.kind().name()).increment(1);
            debug!(
                key = %key,
                seq,
                write_seq = entry.write_seq,
                "Discarded superseded fetch failure"
            );
            return false;
        }
        entry.status = EntryStatus::Error;
        entry.last_error = Some(error);
        notify(entry, key, self.config.policy(key.kind()));
        true
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Writes a locally synthesized value ahead of server confirmation. The
    /// write supersedes every fetch currently in flight for the key; their
    /// results will be discarded on arrival.
    pub fn apply_optimistic(&self, key: &CacheKey, value: Value) {
        self.apply_write(key, value, false, "apply_optimistic");
    }

    /// Writes an authoritative server response produced by a mutation. Also
    /// restarts the freshness window.
    pub fn apply_reconciled(&self, key: &CacheKey, value: Value) {
        self.apply_write(key, value, true, "apply_reconciled");
    }

    fn apply_write(&self, key: &CacheKey, value: Value, authoritative: bool, op: &'static str) {
        let mut entries = rw_write(&self.entries, SOURCE, op);
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.issue_seq += 1;
        entry.write_seq = entry.issue_seq;
        entry.value = Some(value);
        entry.status = EntryStatus::Success;
        entry.last_error = None;
        entry.last_used = Instant::now();
        if authoritative {
            entry.fetched_at = Some(Instant::now());
        }
        notify(entry, key, self.config.policy(key.kind()));
    }

    /// Captures the current state of `key` for later rollback.
    pub fn capture(&self, key: &CacheKey) -> RestorePoint {
        let entries = rw_read(&self.entries, SOURCE, "capture");
        let saved = entries.get(key).map(|entry| SavedEntry {
            value: entry.value.clone(),
            status: entry.status,
            last_error: entry.last_error.clone(),
            fetched_at: entry.fetched_at,
        });
        RestorePoint {
            key: key.clone(),
            saved,
        }
    }

    /// Restores a captured state verbatim. Counts as a local write, so fetch
    /// results issued before the restore are discarded when they arrive.
    pub fn restore(&self, point: RestorePoint) {
        let mut entries = rw_write(&self.entries, SOURCE, "restore");
        match point.saved {
            Some(saved) => {
                let entry = entries.entry(point.key.clone()).or_insert_with(Entry::new);
                entry.issue_seq += 1;
                entry.write_seq = entry.issue_seq;
                entry.value = saved.value;
                entry.status = saved.status;
                entry.last_error = saved.last_error;
                entry.fetched_at = saved.fetched_at;
                notify(entry, &point.key, self.config.policy(point.key.kind()));
            }
            None => remove_entry(&mut entries, &point.key, &self.config),
        }
    }

    /// Evicts the entry for a deleted resource. When subscribers are active
    /// the entry resets to empty idle state instead of disappearing.
    pub fn remove(&self, key: &CacheKey) {
        let mut entries = rw_write(&self.entries, SOURCE, "remove");
        remove_entry(&mut entries, key, &self.config);
    }

    // ========================================================================
    // Invalidation and eviction
    // ========================================================================

    /// Marks every resident entry covered by `prefix` as stale without
    /// clearing its value. Returns the subscribed matches, which the caller
    /// refetches immediately; unsubscribed matches wait for their next
    /// subscriber.
    pub fn mark_stale_pending(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut entries = rw_write(&self.entries, SOURCE, "mark_stale_pending");
        let mut subscribed = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if !prefix.is_prefix_of(key) {
                continue;
            }
            entry.status = EntryStatus::StalePending;
            counter!("agora_sync_invalidations_total", "kind" => key.kind().name()).increment(1);
            notify(entry, key, self.config.policy(key.kind()));
            if entry.subscribers > 0 {
                subscribed.push(key.clone());
            }
        }
        subscribed
    }

    /// Drops every entry of `kind`: unsubscribed entries are evicted
    /// outright, subscribed ones are marked stale and returned for refetch.
    pub fn invalidate_kind(&self, kind: ResourceKind) -> Vec<CacheKey> {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_kind");
        let mut subscribed = Vec::new();
        entries.retain(|key, entry| {
            if key.kind() != kind {
                return true;
            }
            if entry.subscribers == 0 {
                return false;
            }
            entry.status = EntryStatus::StalePending;
            subscribed.push(key.clone());
            true
        });
        for key in &subscribed {
            if let Some(entry) = entries.get(key) {
                notify(entry, key, self.config.policy(kind));
            }
        }
        subscribed
    }

    /// Evicts entries with no subscribers that have gone unused past their
    /// kind's disuse window. Returns the eviction count.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "sweep_expired");
        let before = entries.len();
        entries.retain(|key, entry| {
            entry.subscribers > 0
                || entry.last_used.elapsed() < self.config.policy(key.kind()).expire_after()
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            counter!("agora_sync_evictions_total").increment(evicted as u64);
            debug!(evicted, "Evicted expired cache entries");
        }
        evicted
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Registers interest in `key`. The entry is created when absent and the
    /// subscription releases itself on drop.
    pub fn subscribe(self: &Arc<Self>, key: &CacheKey) -> Subscription {
        let rx = {
            let mut entries = rw_write(&self.entries, SOURCE, "subscribe");
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.subscribers += 1;
            entry.last_used = Instant::now();
            entry.updates.subscribe()
        };
        Subscription {
            store: Arc::clone(self),
            key: key.clone(),
            rx,
        }
    }

    fn release(&self, key: &CacheKey) {
        let mut entries = rw_write(&self.entries, SOURCE, "release");
        if let Some(entry) = entries.get_mut(key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

/// Scoped interest in one key. Dropping the subscription releases it on
/// every exit path.
pub struct Subscription {
    store: Arc<EntryStore>,
    key: CacheKey,
    rx: broadcast::Receiver<EntryUpdate>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the subscribed entry.
    pub fn snapshot(&self) -> Option<EntrySnapshot> {
        self.store.get(&self.key)
    }

    /// Next update applied to the key, or `None` once the entry is gone.
    /// Updates arrive in the order the writes were applied.
    pub async fn changed(&mut self) -> Option<EntryUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "Subscriber lagged; skipping missed updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::json;
    use tokio::time::{Duration, advance};

    use super::*;

    fn store() -> Arc<EntryStore> {
        Arc::new(EntryStore::new(SyncConfig::default()))
    }

    #[tokio::test]
    async fn fetch_roundtrip_populates_entry() {
        let store = store();
        let key = CacheKey::detail(ResourceKind::Bounty, "b1");

        assert!(store.get(&key).is_none());

        let seq = store.begin_fetch(&key);
        assert!(store.complete_fetch(&key, seq, json!({"id": "b1", "reward": 50})));

        let snapshot = store.get(&key).expect("entry after fetch");
        assert_eq!(snapshot.status, EntryStatus::Success);
        assert!(snapshot.is_fresh());
        assert_eq!(snapshot.value, Some(json!({"id": "b1", "reward": 50})));
    }

    #[tokio::test]
    async fn older_fetch_result_is_discarded() {
        let store = store();
        let key = CacheKey::list(ResourceKind::ForumPost);

        let seq_a = store.begin_fetch(&key);
        let seq_b = store.begin_fetch(&key);

        assert!(store.complete_fetch(&key, seq_b, json!(["newer"])));
        assert!(!store.complete_fetch(&key, seq_a, json!(["older"])));

        let snapshot = store.get(&key).expect("entry");
        assert_eq!(snapshot.value, Some(json!(["newer"])));
    }

    #[tokio::test]
    async fn local_write_supersedes_in_flight_fetch() {
        let store = store();
        let key = CacheKey::detail(ResourceKind::Project, "p1");

        let seq = store.begin_fetch(&key);
        store.apply_optimistic(&key, json!({"id": "p1", "title": "edited"}));

        assert!(!store.complete_fetch(&key, seq, json!({"id": "p1", "title": "fetched"})));
        let snapshot = store.get(&key).expect("entry");
        assert_eq!(snapshot.value, Some(json!({"id": "p1", "title": "edited"})));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_good_value() {
        let store = store();
        let key = CacheKey::detail(ResourceKind::Member, "m1");

        let seq = store.begin_fetch(&key);
        store.complete_fetch(&key, seq, json!({"id": "m1"}));

        let seq = store.begin_fetch(&key);
        store.fail_fetch(&key, seq, SyncError::network("connection reset"));

        let snapshot = store.get(&key).expect("entry");
        assert_eq!(snapshot.status, EntryStatus::Error);
        assert_eq!(snapshot.value, Some(json!({"id": "m1"})));
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn restore_reverts_to_captured_state() {
        let store = store();
        let existing = CacheKey::detail(ResourceKind::Bounty, "b1");
        let created = CacheKey::detail(ResourceKind::Bounty, "b2");

        let seq = store.begin_fetch(&existing);
        store.complete_fetch(&existing, seq, json!({"id": "b1", "reward": 10}));

        let point_existing = store.capture(&existing);
        let point_created = store.capture(&created);

        store.apply_optimistic(&existing, json!({"id": "b1", "reward": 99}));
        store.apply_optimistic(&created, json!({"id": "b2"}));

        store.restore(point_existing);
        store.restore(point_created);

        let snapshot = store.get(&existing).expect("restored entry");
        assert_eq!(snapshot.value, Some(json!({"id": "b1", "reward": 10})));
        assert!(store.get(&created).is_none());
    }

    #[tokio::test]
    async fn stale_marking_follows_prefix_and_reports_subscribers() {
        let store = store();
        let filtered =
            CacheKey::filtered_list(ResourceKind::ForumPost, &json!({"status": "open"}));
        let detail = CacheKey::detail(ResourceKind::ForumPost, "p1");
        let unrelated = CacheKey::list(ResourceKind::Member);

        for key in [&filtered, &detail, &unrelated] {
            let seq = store.begin_fetch(key);
            store.complete_fetch(key, seq, json!([]));
        }

        let _sub = store.subscribe(&filtered);
        let to_refetch = store.mark_stale_pending(&CacheKey::list(ResourceKind::ForumPost));

        assert_eq!(to_refetch, vec![filtered.clone()]);
        assert!(store.get(&filtered).expect("filtered").is_stale);
        assert!(!store.get(&unrelated).expect("unrelated").is_stale);
        // Unsubscribed matches are stale too; refetch waits for a subscriber.
        assert!(store.get(&detail).expect("detail").is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_expires_after_the_kind_window() {
        let store = store();
        let key = CacheKey::list(ResourceKind::Bounty);

        let seq = store.begin_fetch(&key);
        store.complete_fetch(&key, seq, json!([]));

        advance(Duration::from_secs(10)).await;
        assert!(store.get(&key).expect("entry").is_fresh());

        advance(Duration::from_secs(21)).await;
        assert!(store.get(&key).expect("entry").is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_unsubscribed_disused_entries() {
        let store = store();
        let kept = CacheKey::detail(ResourceKind::Project, "kept");
        let dropped = CacheKey::detail(ResourceKind::Project, "dropped");

        for key in [&kept, &dropped] {
            let seq = store.begin_fetch(key);
            store.complete_fetch(key, seq, json!({}));
        }
        let _sub = store.subscribe(&kept);

        advance(Duration::from_secs(301)).await;
        assert_eq!(store.sweep_expired(), 1);

        assert!(store.get(&kept).is_some());
        assert!(store.get(&dropped).is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_writes_in_applied_order() {
        let store = store();
        let key = CacheKey::detail(ResourceKind::MeetingNote, "n1");
        let mut sub = store.subscribe(&key);

        let seq = store.begin_fetch(&key);
        store.complete_fetch(&key, seq, json!({"rev": 1}));
        store.apply_optimistic(&key, json!({"rev": 2}));

        let first = sub.changed().await.expect("fetching update");
        assert_eq!(first.snapshot.status, EntryStatus::Fetching);
        let second = sub.changed().await.expect("fetch result");
        assert_eq!(second.snapshot.value, Some(json!({"rev": 1})));
        let third = sub.changed().await.expect("optimistic write");
        assert_eq!(third.snapshot.value, Some(json!({"rev": 2})));
    }

    #[tokio::test]
    async fn dropping_subscription_releases_the_key() {
        let store = store();
        let key = CacheKey::list(ResourceKind::Member);

        let sub = store.subscribe(&key);
        assert_eq!(store.subscriber_count(&key), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn remove_resets_subscribed_entries_instead_of_dropping() {
        let store = store();
        let key = CacheKey::detail(ResourceKind::ForumPost, "p1");

        let seq = store.begin_fetch(&key);
        store.complete_fetch(&key, seq, json!({"id": "p1"}));
        let _sub = store.subscribe(&key);

        store.remove(&key);
        let snapshot = store.get(&key).expect("entry kept for subscriber");
        assert_eq!(snapshot.status, EntryStatus::Idle);
        assert!(snapshot.value.is_none());

        let unwatched = CacheKey::detail(ResourceKind::ForumPost, "p2");
        let seq = store.begin_fetch(&unwatched);
        store.complete_fetch(&unwatched, seq, json!({"id": "p2"}));
        store.remove(&unwatched);
        assert!(store.get(&unwatched).is_none());
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = store();
        let key = CacheKey::list(ResourceKind::Bounty);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        let seq = store.begin_fetch(&key);
        assert!(store.complete_fetch(&key, seq, json!([])));
        assert!(store.get(&key).is_some());
    }
}
