//! Mutation pipeline.
//!
//! Executes a create, update, or delete against the server while keeping the
//! cache usable during the round trip. Each invocation walks one state
//! machine:
//!
//! ```text
//! idle -> optimistic-applied -> settling -> reconciled-success
//!                                        -> rolled-back
//! ```
//!
//! The optimistic phase is synchronous: [`MutationPipeline::start`] captures
//! a snapshot of every entry it is about to touch and writes the synthesized
//! value before returning, so the UI reflects the change before the network
//! call begins. Settling happens on a spawned task; once applied, a mutation
//! always reaches one of the two terminal states, even when its handle is
//! dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::FetchCoordinator;
use crate::error::SyncError;
use crate::key::CacheKey;
use crate::kind::ResourceKind;
use crate::planner::{self, MutationDescriptor};
use crate::store::{EntryStore, RestorePoint};
use crate::transport::ResourceTransport;

// ============================================================================
// Request and state types
// ============================================================================

/// Identifier assigned to a locally synthesized item awaiting server
/// confirmation. Reconciliation matches pending items against this value,
/// never against an identifier naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId(Uuid);

impl PendingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PendingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline state, observable while a mutation settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    OptimisticApplied,
    Settling,
    ReconciledSuccess,
    RolledBack,
}

/// One write against the server, with its optimistic projection.
#[derive(Debug, Clone)]
pub enum MutationRequest {
    Create {
        kind: ResourceKind,
        /// Parent resource logically containing the new item, such as the
        /// forum post a reply belongs to.
        parent_id: Option<String>,
        /// Body sent to the server.
        payload: Value,
        /// Item written into resident list views ahead of confirmation. The
        /// pipeline assigns its pending identifier.
        optimistic: Value,
    },
    Update {
        kind: ResourceKind,
        id: String,
        /// Body sent to the server.
        payload: Value,
        /// Fields merged into the cached detail and list items.
        patch: Value,
    },
    Delete {
        kind: ResourceKind,
        id: String,
    },
}

impl MutationRequest {
    pub fn create(kind: ResourceKind, payload: Value) -> Self {
        Self::Create {
            kind,
            parent_id: None,
            optimistic: payload.clone(),
            payload,
        }
    }

    pub fn create_child(
        kind: ResourceKind,
        parent_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::Create {
            kind,
            parent_id: Some(parent_id.into()),
            optimistic: payload.clone(),
            payload,
        }
    }

    pub fn update(kind: ResourceKind, id: impl Into<String>, patch: Value) -> Self {
        Self::Update {
            kind,
            id: id.into(),
            payload: patch.clone(),
            patch,
        }
    }

    pub fn delete(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::Delete {
            kind,
            id: id.into(),
        }
    }

    fn kind(&self) -> ResourceKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
        }
    }

    fn op_name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Observer handle for one started mutation.
///
/// Dropping the handle does not cancel the mutation; the pipeline always
/// drives it to a terminal state.
pub struct MutationHandle {
    state: watch::Receiver<MutationState>,
    task: JoinHandle<Result<Value, SyncError>>,
}

impl MutationHandle {
    pub fn state(&self) -> MutationState {
        *self.state.borrow()
    }

    /// Watch channel mirroring the pipeline state, for UI feedback such as
    /// disabling a submit control while settling.
    pub fn state_changes(&self) -> watch::Receiver<MutationState> {
        self.state.clone()
    }

    /// Resolves with the authoritative server value on reconciled success
    /// (`Value::Null` for deletes), or the typed error after rollback.
    pub async fn settle(self) -> Result<Value, SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => Err(SyncError::network(format!(
                "mutation task failed: {join_error}"
            ))),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct MutationPipeline {
    store: Arc<EntryStore>,
    coordinator: Arc<FetchCoordinator>,
    transport: Arc<dyn ResourceTransport>,
}

struct Prepared {
    restore: Vec<RestorePoint>,
    lists: Vec<CacheKey>,
    detail: Option<CacheKey>,
    pending_id: Option<String>,
}

impl MutationPipeline {
    pub fn new(coordinator: Arc<FetchCoordinator>, transport: Arc<dyn ResourceTransport>) -> Self {
        Self {
            store: Arc::clone(coordinator.store()),
            coordinator,
            transport,
        }
    }

    /// Applies the optimistic projection synchronously and spawns the
    /// settling task.
    pub fn start(&self, request: MutationRequest) -> MutationHandle {
        let (state_tx, state_rx) = watch::channel(MutationState::Idle);

        let prepared = self.apply_optimistic_phase(&request);
        state_tx.send_replace(MutationState::OptimisticApplied);

        let store = Arc::clone(&self.store);
        let coordinator = Arc::clone(&self.coordinator);
        let transport = Arc::clone(&self.transport);
        let task = tokio::spawn(settle(
            store,
            coordinator,
            transport,
            request,
            prepared,
            state_tx,
        ));

        MutationHandle {
            state: state_rx,
            task,
        }
    }

    fn apply_optimistic_phase(&self, request: &MutationRequest) -> Prepared {
        let store = &self.store;
        let lists = store.keys_with_prefix(&CacheKey::list(request.kind()));

        match request {
            MutationRequest::Create { optimistic, .. } => {
                let restore = lists.iter().map(|key| store.capture(key)).collect();
                let pending = PendingId::new();
                let mut item = optimistic.clone();
                if let Value::Object(map) = &mut item {
                    map.insert("id".to_string(), json!(pending.to_string()));
                }
                for key in &lists {
                    with_value(store, key, |value| {
                        let Some(items) = value.as_array_mut() else {
                            return false;
                        };
                        items.insert(0, item.clone());
                        true
                    });
                }
                Prepared {
                    restore,
                    lists,
                    detail: None,
                    pending_id: Some(pending.to_string()),
                }
            }
            MutationRequest::Update { kind, id, patch, .. } => {
                let detail = CacheKey::detail(*kind, id.clone());
                let mut restore = vec![store.capture(&detail)];
                restore.extend(lists.iter().map(|key| store.capture(key)));

                with_value(store, &detail, |value| {
                    merge_fields(value, patch);
                    true
                });
                for key in &lists {
                    with_value(store, key, |value| patch_item(value, id, patch));
                }
                Prepared {
                    restore,
                    lists,
                    detail: Some(detail),
                    pending_id: None,
                }
            }
            MutationRequest::Delete { kind, id } => {
                let detail = CacheKey::detail(*kind, id.clone());
                let mut restore = vec![store.capture(&detail)];
                restore.extend(lists.iter().map(|key| store.capture(key)));

                store.remove(&detail);
                for key in &lists {
                    with_value(store, key, |value| remove_item(value, id));
                }
                Prepared {
                    restore,
                    lists,
                    detail: Some(detail),
                    pending_id: None,
                }
            }
        }
    }
}

async fn settle(
    store: Arc<EntryStore>,
    coordinator: Arc<FetchCoordinator>,
    transport: Arc<dyn ResourceTransport>,
    request: MutationRequest,
    prepared: Prepared,
    state: watch::Sender<MutationState>,
) -> Result<Value, SyncError> {
    state.send_replace(MutationState::Settling);

    let started = Instant::now();
    let kind = request.kind();
    let op = request.op_name();
    let result = match &request {
        MutationRequest::Create { payload, .. } => transport.create(kind, payload).await,
        MutationRequest::Update { id, payload, .. } => transport.update(kind, id, payload).await,
        MutationRequest::Delete { id, .. } => {
            transport.delete(kind, id).await.map(|()| Value::Null)
        }
    };
    histogram!("agora_sync_mutation_settle_ms", "kind" => kind.name())
        .record(started.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(server_value) => {
            reconcile(&store, &request, &prepared, &server_value);
            state.send_replace(MutationState::ReconciledSuccess);
            counter!("agora_sync_mutations_total", "kind" => kind.name(), "op" => op, "outcome" => "success")
                .increment(1);
            debug!(kind = %kind, op, "Mutation reconciled");

            invalidate_after(&store, &coordinator, descriptor_for(&request, &server_value));
            Ok(server_value)
        }
        Err(transport_error) => {
            for point in prepared.restore {
                store.restore(point);
            }
            state.send_replace(MutationState::RolledBack);
            counter!("agora_sync_mutations_total", "kind" => kind.name(), "op" => op, "outcome" => "rolled_back")
                .increment(1);
            counter!("agora_sync_rollbacks_total", "kind" => kind.name()).increment(1);
            warn!(kind = %kind, op, error = %transport_error, "Mutation rolled back");

            // Local values were restored, but the true server state of the
            // affected entries is unknown; refetch rather than trust them.
            invalidate_after(&store, &coordinator, descriptor_for(&request, &Value::Null));
            Err(SyncError::from(transport_error))
        }
    }
}

fn reconcile(store: &EntryStore, request: &MutationRequest, prepared: &Prepared, server: &Value) {
    match request {
        MutationRequest::Create { kind, .. } => {
            let pending_id = prepared.pending_id.as_deref().unwrap_or_default();
            if let Some(server_id) = item_id(server) {
                store.apply_reconciled(&CacheKey::detail(*kind, server_id), server.clone());
            }
            for key in &prepared.lists {
                with_reconciled(store, key, |value| {
                    upsert_item(value, pending_id, server);
                    true
                });
            }
        }
        MutationRequest::Update { id, .. } => {
            if let Some(detail) = &prepared.detail {
                store.apply_reconciled(detail, server.clone());
            }
            for key in &prepared.lists {
                with_reconciled(store, key, |value| replace_item(value, id, server));
            }
        }
        MutationRequest::Delete { .. } => {
            // The detail entry is gone and lists were filtered optimistically.
        }
    }
}

fn descriptor_for(request: &MutationRequest, server: &Value) -> MutationDescriptor {
    match request {
        MutationRequest::Create { kind, parent_id, .. } => {
            let mut descriptor = match parent_id {
                Some(parent) => MutationDescriptor::create_child(*kind, parent.clone()),
                None => MutationDescriptor::create(*kind),
            };
            descriptor.id = item_id(server).map(str::to_string);
            descriptor
        }
        MutationRequest::Update { kind, id, .. } => MutationDescriptor::update(*kind, id.clone()),
        MutationRequest::Delete { kind, id } => MutationDescriptor::delete(*kind, id.clone()),
    }
}

/// Marks planner-selected prefixes stale and refetches the subscribed
/// matches in the background.
fn invalidate_after(
    store: &Arc<EntryStore>,
    coordinator: &Arc<FetchCoordinator>,
    descriptor: MutationDescriptor,
) {
    let mut to_refetch: Vec<CacheKey> = Vec::new();
    for prefix in planner::plan(&descriptor) {
        for key in store.mark_stale_pending(&prefix) {
            if !to_refetch.contains(&key) {
                to_refetch.push(key);
            }
        }
    }
    if to_refetch.is_empty() {
        return;
    }
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move {
        coordinator.refetch_many(&to_refetch).await;
    });
}

// ============================================================================
// Value surgery
// ============================================================================

fn item_id(item: &Value) -> Option<&str> {
    item.get("id").and_then(Value::as_str)
}

/// Shallow merge of `patch`'s fields into `target`. Non-object values are
/// left alone.
fn merge_fields(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (field, value) in patch {
            target.insert(field.clone(), value.clone());
        }
    }
}

fn patch_item(list: &mut Value, id: &str, patch: &Value) -> bool {
    let Some(items) = list.as_array_mut() else {
        return false;
    };
    let mut changed = false;
    for item in items {
        if item_id(item) == Some(id) {
            merge_fields(item, patch);
            changed = true;
        }
    }
    changed
}

fn replace_item(list: &mut Value, id: &str, server_item: &Value) -> bool {
    let Some(items) = list.as_array_mut() else {
        return false;
    };
    let mut changed = false;
    for item in items {
        if item_id(item) == Some(id) {
            *item = server_item.clone();
            changed = true;
        }
    }
    changed
}

fn remove_item(list: &mut Value, id: &str) -> bool {
    let Some(items) = list.as_array_mut() else {
        return false;
    };
    let before = items.len();
    items.retain(|item| item_id(item) != Some(id));
    items.len() != before
}

/// Replace-if-present, else insert. Every pending copy is dropped first, so
/// repeating the same reconciliation never double-applies an insertion.
fn upsert_item(list: &mut Value, pending_id: &str, server_item: &Value) {
    let Some(items) = list.as_array_mut() else {
        return;
    };
    items.retain(|item| item_id(item) != Some(pending_id));
    if let Some(server_id) = item_id(server_item) {
        if let Some(existing) = items
            .iter_mut()
            .find(|item| item_id(item) == Some(server_id))
        {
            *existing = server_item.clone();
            return;
        }
    }
    items.insert(0, server_item.clone());
}

fn with_value<F>(store: &EntryStore, key: &CacheKey, edit: F)
where
    F: FnOnce(&mut Value) -> bool,
{
    if let Some(snapshot) = store.get(key) {
        if let Some(mut value) = snapshot.value {
            if edit(&mut value) {
                store.apply_optimistic(key, value);
            }
        }
    }
}

fn with_reconciled<F>(store: &EntryStore, key: &CacheKey, edit: F)
where
    F: FnOnce(&mut Value) -> bool,
{
    if let Some(snapshot) = store.get(key) {
        if let Some(mut value) = snapshot.value {
            if edit(&mut value) {
                store.apply_reconciled(key, value);
            }
        }
    }
}
