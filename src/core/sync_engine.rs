use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use async_lock::Mutex;
use futures::channel::oneshot;

use crate::core::event_manager::{EventManager, QueryObserver};
use crate::core::query::Query;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::view::{LimboDocumentChange, View};
use crate::error::{cancelled, FirestoreError, FirestoreResult};
use crate::local::local_store::LocalStore;
use crate::local::target_cache::TargetPurpose;
use crate::model::{DocumentKey, Mutation, MutationBatch, MutationBatchResult, MutableDocument};
use crate::remote::online_state::OnlineState;
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_store::RemoteStore;
use crate::remote::remote_syncer::{box_syncer_future, RemoteSyncer, SyncerFuture};
use crate::util::runtime;

/// Limbo resolutions allowed in flight at once; further candidates queue.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Receiver resolved when a write batch is acknowledged or rejected.
pub type WriteAck = oneshot::Receiver<FirestoreResult<()>>;

struct WatchTargetMirror {
    purpose: TargetPurpose,
    remote_keys: BTreeSet<DocumentKey>,
}

struct SyncEngineState {
    views: BTreeMap<i32, View>,
    limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    limbo_keys_by_target: BTreeMap<i32, DocumentKey>,
    enqueued_limbo_keys: VecDeque<DocumentKey>,
    limbo_id_generator: TargetIdGenerator,
    pending_write_callbacks: BTreeMap<i32, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
}

/// The orchestrator: owns the local and remote stores, fans local results
/// out to query listeners, resolves limbo documents, and reconciles
/// online/offline transitions.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    pub fn new(local_store: Arc<LocalStore>, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            inner: Arc::new(SyncEngineInner {
                local_store,
                remote_store: OnceLock::new(),
                event_manager: EventManager::new(),
                state: Mutex::new(SyncEngineState {
                    views: BTreeMap::new(),
                    limbo_targets_by_key: BTreeMap::new(),
                    limbo_keys_by_target: BTreeMap::new(),
                    enqueued_limbo_keys: VecDeque::new(),
                    limbo_id_generator: TargetIdGenerator::for_limbo_resolutions(),
                    pending_write_callbacks: BTreeMap::new(),
                    online_state: OnlineState::Unknown,
                }),
                watch_targets: StdMutex::new(BTreeMap::new()),
                max_concurrent_limbo_resolutions,
            }),
        }
    }

    /// Completes the ownership wiring: the engine owns the remote store,
    /// which talks back only through the narrow syncer capability.
    pub fn set_remote_store(&self, remote_store: RemoteStore) {
        if self.inner.remote_store.set(remote_store).is_err() {
            log::warn!("remote store was already attached");
        }
    }

    /// Capability handed to the remote store at construction.
    pub fn as_remote_syncer(&self) -> Arc<dyn RemoteSyncer> {
        Arc::new(SyncEngineSyncer {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    pub fn remote_store(&self) -> Option<&RemoteStore> {
        self.inner.remote_store.get()
    }

    pub async fn listen(
        &self,
        query: Query,
        observer: QueryObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        self.inner.listen(query, observer).await
    }

    /// Persists the batch locally, surfaces the optimistic snapshots, and
    /// starts pushing it to the backend. The returned ack resolves exactly
    /// once, on acknowledgement or rejection.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<(i32, WriteAck)> {
        self.inner.write(mutations).await
    }

    /// Resolves once every batch enqueued before the call has been
    /// acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<Option<WriteAck>> {
        self.inner.wait_for_pending_writes().await
    }

    pub async fn handle_online_state_change(&self, online_state: OnlineState) {
        self.inner.handle_online_state_change(online_state).await;
    }

    pub async fn active_listen_target_ids(&self) -> BTreeSet<i32> {
        self.inner.active_target_ids().await
    }
}

pub(crate) struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: OnceLock<RemoteStore>,
    event_manager: EventManager,
    state: Mutex<SyncEngineState>,
    /// Mirror of active watch targets for the synchronous metadata queries
    /// the watch aggregator issues mid-stream.
    watch_targets: StdMutex<BTreeMap<i32, WatchTargetMirror>>,
    max_concurrent_limbo_resolutions: usize,
}

impl SyncEngineInner {
    fn mirror_insert(&self, target_id: i32, purpose: TargetPurpose, keys: BTreeSet<DocumentKey>) {
        self.watch_targets.lock().unwrap().insert(
            target_id,
            WatchTargetMirror {
                purpose,
                remote_keys: keys,
            },
        );
    }

    fn mirror_update_keys(&self, target_id: i32, keys: BTreeSet<DocumentKey>) {
        if let Some(mirror) = self.watch_targets.lock().unwrap().get_mut(&target_id) {
            mirror.remote_keys = keys;
        }
    }

    fn mirror_remove(&self, target_id: i32) {
        self.watch_targets.lock().unwrap().remove(&target_id);
    }

    async fn listen(
        self: &Arc<Self>,
        query: Query,
        observer: QueryObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let target_data = self.local_store.allocate_target(query.clone()).await?;
        let target_id = target_data.target_id();

        let initial_snapshot = {
            let mut state = self.state.lock().await;
            if state.views.contains_key(&target_id) {
                None
            } else {
                let query_result = self.local_store.execute_query(&query).await?;
                let mut view = View::new(query.clone(), target_id, query_result.remote_keys.clone());
                self.mirror_insert(target_id, TargetPurpose::Listen, query_result.remote_keys);
                let change = view.update(query_result.documents, None, state.online_state);
                state.views.insert(target_id, view);
                Some(change.snapshot)
            }
        };

        let needs_remote_listen = initial_snapshot.is_some();
        let listener_id = self.event_manager.add_listener(target_id, observer);
        if let Some(Some(snapshot)) = initial_snapshot {
            self.event_manager.emit_snapshot(target_id, snapshot);
        }

        if needs_remote_listen {
            if let Some(remote_store) = self.remote_store.get() {
                remote_store.listen(target_data).await?;
            }
        }

        Ok(ListenerRegistration {
            inner: Arc::downgrade(self),
            target_id,
            listener_id,
            detached: false,
        })
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32, listener_id: u64) -> FirestoreResult<()> {
        if !self.event_manager.remove_listener(target_id, listener_id) {
            return Ok(());
        }
        {
            let mut state = self.state.lock().await;
            state.views.remove(&target_id);
        }
        self.mirror_remove(target_id);
        if let Some(remote_store) = self.remote_store.get() {
            remote_store.unlisten(target_id).await?;
        }
        self.local_store.release_target(target_id).await
    }

    async fn write(self: &Arc<Self>, mutations: Vec<Mutation>) -> FirestoreResult<(i32, WriteAck)> {
        let result = self.local_store.write_locally(mutations).await?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state
                .pending_write_callbacks
                .entry(result.batch_id)
                .or_default()
                .push(tx);
        }
        self.emit_new_snapshots(None).await?;
        if let Some(remote_store) = self.remote_store.get() {
            remote_store.fill_write_pipeline().await?;
        }
        Ok((result.batch_id, rx))
    }

    async fn wait_for_pending_writes(self: &Arc<Self>) -> FirestoreResult<Option<WriteAck>> {
        match self.local_store.highest_unacknowledged_batch_id().await {
            None => Ok(None),
            Some(batch_id) => {
                let (tx, rx) = oneshot::channel();
                let mut state = self.state.lock().await;
                state
                    .pending_write_callbacks
                    .entry(batch_id)
                    .or_default()
                    .push(tx);
                Ok(Some(rx))
            }
        }
    }

    async fn resolve_write_callbacks(&self, batch_id: i32, result: FirestoreResult<()>) {
        let callbacks = {
            let mut state = self.state.lock().await;
            state.pending_write_callbacks.remove(&batch_id)
        };
        for callback in callbacks.into_iter().flatten() {
            let _ = callback.send(result.clone());
        }
    }

    /// Re-executes every active view's query and emits the snapshots that
    /// changed. `event` supplies per-target changes and mismatches when the
    /// trigger was a remote event.
    async fn emit_new_snapshots(self: &Arc<Self>, event: Option<&RemoteEvent>) -> FirestoreResult<()> {
        let limbo_changes = {
            let mut state = self.state.lock().await;
            let online_state = state.online_state;
            let target_ids: Vec<i32> = state.views.keys().copied().collect();
            let mut limbo_changes = Vec::new();

            for target_id in target_ids {
                let query = state.views[&target_id].query().clone();
                let query_result = self.local_store.execute_query(&query).await?;
                let view = state.views.get_mut(&target_id).expect("view exists");
                if event
                    .map(|e| e.target_mismatches.contains(&target_id))
                    .unwrap_or(false)
                {
                    view.handle_target_mismatch();
                }
                let target_change = event.and_then(|e| e.target_changes.get(&target_id));
                let change = view.update(query_result.documents, target_change, online_state);
                self.mirror_update_keys(target_id, view.synced_documents().clone());
                if let Some(snapshot) = change.snapshot {
                    self.event_manager.emit_snapshot(target_id, snapshot);
                }
                limbo_changes.extend(change.limbo_changes);
            }
            limbo_changes
        };

        for change in limbo_changes {
            self.apply_limbo_change(change).await?;
        }
        Ok(())
    }

    async fn apply_limbo_change(self: &Arc<Self>, change: LimboDocumentChange) -> FirestoreResult<()> {
        match change {
            LimboDocumentChange::Added(key) => {
                {
                    let mut state = self.state.lock().await;
                    if state.limbo_targets_by_key.contains_key(&key)
                        || state.enqueued_limbo_keys.contains(&key)
                    {
                        return Ok(());
                    }
                    state.enqueued_limbo_keys.push_back(key);
                }
                self.pump_limbo_queue().await
            }
            LimboDocumentChange::Removed(key) => {
                let target_id = {
                    let mut state = self.state.lock().await;
                    state.enqueued_limbo_keys.retain(|queued| queued != &key);
                    state.limbo_targets_by_key.remove(&key)
                };
                if let Some(target_id) = target_id {
                    self.remove_limbo_target(target_id).await?;
                }
                self.pump_limbo_queue().await
            }
        }
    }

    /// Starts queued limbo resolutions up to the concurrency bound.
    async fn pump_limbo_queue(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.limbo_targets_by_key.len() >= self.max_concurrent_limbo_resolutions {
                    None
                } else {
                    state.enqueued_limbo_keys.pop_front()
                }
            };
            let Some(key) = next else {
                return Ok(());
            };

            let target_id = {
                let mut state = self.state.lock().await;
                let target_id = state.limbo_id_generator.next();
                state.limbo_targets_by_key.insert(key.clone(), target_id);
                state.limbo_keys_by_target.insert(target_id, key.clone());
                target_id
            };
            log::debug!("resolving limbo document {} via target {target_id}", key.path());
            let target_data = self.local_store.allocate_limbo_target(target_id, &key).await?;
            self.mirror_insert(
                target_id,
                TargetPurpose::LimboResolution,
                [key].into_iter().collect(),
            );
            if let Some(remote_store) = self.remote_store.get() {
                remote_store.listen(target_data).await?;
            }
        }
    }

    async fn remove_limbo_target(self: &Arc<Self>, target_id: i32) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(key) = state.limbo_keys_by_target.remove(&target_id) {
                state.limbo_targets_by_key.remove(&key);
            }
        }
        self.mirror_remove(target_id);
        if let Some(remote_store) = self.remote_store.get() {
            remote_store.unlisten(target_id).await?;
        }
        self.local_store.remove_target(target_id).await
    }

    async fn apply_remote_event(self: &Arc<Self>, event: RemoteEvent) -> FirestoreResult<()> {
        self.local_store.apply_remote_event(&event).await?;

        let resolved: Vec<i32> = {
            let state = self.state.lock().await;
            event
                .resolved_limbo_documents
                .iter()
                .filter_map(|key| state.limbo_targets_by_key.get(key).copied())
                .collect()
        };
        for target_id in resolved {
            self.remove_limbo_target(target_id).await?;
        }

        self.emit_new_snapshots(Some(&event)).await?;
        self.pump_limbo_queue().await
    }

    async fn reject_listen(
        self: &Arc<Self>,
        target_id: i32,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let limbo_key = {
            let state = self.state.lock().await;
            state.limbo_keys_by_target.get(&target_id).cloned()
        };

        match limbo_key {
            Some(key) => {
                // A rejected limbo resolution proves nothing about the
                // document except that we cannot read it; treat it as
                // deleted so the view stops showing it.
                log::debug!(
                    "limbo resolution for {} failed ({error}); synthesizing delete",
                    key.path()
                );
                let existing = self.local_store.get_document(&key).await?;
                let version = self
                    .local_store
                    .last_remote_snapshot_version()
                    .await
                    .max(existing.version());
                let mut event = RemoteEvent {
                    snapshot_version: version,
                    ..RemoteEvent::default()
                };
                event
                    .document_updates
                    .insert(key.clone(), MutableDocument::new_no_document(key.clone(), version));
                event.resolved_limbo_documents.insert(key);
                self.apply_remote_event(event).await
            }
            None => {
                {
                    let mut state = self.state.lock().await;
                    state.views.remove(&target_id);
                }
                self.mirror_remove(target_id);
                self.local_store.remove_target(target_id).await?;
                self.event_manager.emit_error(target_id, error);
                Ok(())
            }
        }
    }

    async fn apply_successful_write(
        self: &Arc<Self>,
        result: MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch_id = result.batch_id();
        self.local_store.acknowledge_batch(&result).await?;
        self.resolve_write_callbacks(batch_id, Ok(())).await;
        self.emit_new_snapshots(None).await
    }

    async fn reject_failed_write(
        self: &Arc<Self>,
        batch_id: i32,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        self.local_store.reject_batch(batch_id).await?;
        self.resolve_write_callbacks(batch_id, Err(error)).await;
        self.emit_new_snapshots(None).await
    }

    async fn handle_credential_change(self: &Arc<Self>) -> FirestoreResult<()> {
        let batch_ids = self.local_store.clear_local_writes().await?;
        for batch_id in batch_ids {
            self.resolve_write_callbacks(batch_id, Err(cancelled("credentials changed")))
                .await;
        }
        self.emit_new_snapshots(None).await
    }

    async fn handle_online_state_change(self: &Arc<Self>, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.state.lock().await;
            state.online_state = online_state;
            let mut snapshots = Vec::new();
            for (target_id, view) in state.views.iter_mut() {
                let change = view.apply_online_state_change(online_state);
                if let Some(snapshot) = change.snapshot {
                    snapshots.push((*target_id, snapshot));
                }
            }
            snapshots
        };
        for (target_id, snapshot) in snapshots {
            self.event_manager.emit_snapshot(target_id, snapshot);
        }
    }

    async fn active_target_ids(&self) -> BTreeSet<i32> {
        let state = self.state.lock().await;
        let mut ids: BTreeSet<i32> = state.views.keys().copied().collect();
        ids.extend(state.limbo_keys_by_target.keys().copied());
        ids
    }
}

/// Handle returned from `listen`; dropping it unregisters the listener and,
/// when it was the last one for the target, unlistens the target.
pub struct ListenerRegistration {
    inner: Weak<SyncEngineInner>,
    target_id: i32,
    listener_id: u64,
    detached: bool,
}

impl ListenerRegistration {
    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(inner) = self.inner.upgrade() {
            let target_id = self.target_id;
            let listener_id = self.listener_id;
            runtime::spawn_detached(async move {
                if let Err(err) = inner.unlisten(target_id, listener_id).await {
                    log::warn!("failed to unlisten target {target_id}: {err}");
                }
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Bridge implementing the remote store's callback capability over a weak
/// reference, keeping ownership one-directional.
struct SyncEngineSyncer {
    inner: Weak<SyncEngineInner>,
}

impl RemoteSyncer for SyncEngineSyncer {
    fn apply_remote_event(&self, event: RemoteEvent) -> SyncerFuture<'_, FirestoreResult<()>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => inner.apply_remote_event(event).await,
                None => Ok(()),
            }
        })
    }

    fn reject_listen(
        &self,
        target_id: i32,
        error: FirestoreError,
    ) -> SyncerFuture<'_, FirestoreResult<()>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => inner.reject_listen(target_id, error).await,
                None => Ok(()),
            }
        })
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> SyncerFuture<'_, FirestoreResult<()>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => inner.apply_successful_write(result).await,
                None => Ok(()),
            }
        })
    }

    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: FirestoreError,
    ) -> SyncerFuture<'_, FirestoreResult<()>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => inner.reject_failed_write(batch_id, error).await,
                None => Ok(()),
            }
        })
    }

    fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> SyncerFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => Ok(inner.local_store.next_mutation_batch(after_batch_id).await),
                None => Ok(None),
            }
        })
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        match self.inner.upgrade() {
            Some(inner) => inner
                .watch_targets
                .lock()
                .unwrap()
                .get(&target_id)
                .map(|mirror| mirror.remote_keys.clone())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        }
    }

    fn get_target_purpose(&self, target_id: i32) -> Option<TargetPurpose> {
        self.inner.upgrade().and_then(|inner| {
            inner
                .watch_targets
                .lock()
                .unwrap()
                .get(&target_id)
                .map(|mirror| mirror.purpose)
        })
    }

    fn get_limbo_document_key(&self, target_id: i32) -> Option<DocumentKey> {
        self.inner.upgrade().and_then(|inner| {
            inner
                .watch_targets
                .lock()
                .unwrap()
                .get(&target_id)
                .filter(|mirror| mirror.purpose == TargetPurpose::LimboResolution)
                .and_then(|mirror| mirror.remote_keys.iter().next().cloned())
        })
    }

    fn handle_credential_change(&self) -> SyncerFuture<'_, FirestoreResult<()>> {
        let inner = self.inner.upgrade();
        box_syncer_future(async move {
            match inner {
                Some(inner) => inner.handle_credential_change().await,
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::lru_garbage_collector::LruParams;
    use crate::local::query_engine::QueryEngineParams;
    use crate::model::{FieldValue, ObjectValue, ResourcePath, Timestamp};
    use crate::remote::remote_event::TargetChange;
    use bytes::Bytes;
    use std::collections::BTreeMap as StdBTreeMap;
    use std::sync::Mutex as TestMutex;

    fn engine() -> SyncEngine {
        SyncEngine::new(
            Arc::new(LocalStore::new(
                QueryEngineParams::default(),
                LruParams::default(),
            )),
            DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn rooms_query() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    fn object(entries: &[(&str, FieldValue)]) -> ObjectValue {
        let mut map = StdBTreeMap::new();
        for (name, value) in entries {
            map.insert((*name).to_string(), value.clone());
        }
        ObjectValue::new(map)
    }

    fn snapshot_sink() -> (
        QueryObserver,
        Arc<TestMutex<Vec<crate::core::view_snapshot::ViewSnapshot>>>,
    ) {
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            QueryObserver::from_snapshot_handler(move |snapshot| {
                sink.lock().unwrap().push(snapshot);
            }),
            seen,
        )
    }

    fn event_with_docs(
        target_id: i32,
        docs: &[(&str, i64)],
        current: bool,
        version: i64,
    ) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version: Timestamp::new(version, 0),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            current,
            resume_token: Bytes::from_static(b"rt"),
            ..TargetChange::default()
        };
        for (path, doc_version) in docs {
            let document = MutableDocument::new_found(
                key(path),
                Timestamp::new(*doc_version, 0),
                ObjectValue::empty(),
            );
            change.added_documents.insert(key(path));
            event.document_updates.insert(key(path), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn listen_delivers_initial_cached_snapshot() {
        let engine = engine();
        let (observer, seen) = snapshot_sink();
        let _registration = engine.listen(rooms_query(), observer).await.unwrap();

        let snapshots = seen.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache());
        assert!(snapshots[0].documents().is_empty());
    }

    #[tokio::test]
    async fn remote_event_produces_synced_snapshot() {
        let engine = engine();
        let (observer, seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();

        engine
            .inner
            .apply_remote_event(event_with_docs(
                target_id,
                &[("rooms/a", 1), ("rooms/b", 1)],
                true,
                1,
            ))
            .await
            .unwrap();

        let snapshots = seen.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert_eq!(last.documents().len(), 2);
        assert!(!last.from_cache());
        assert!(!last.has_pending_writes());
    }

    #[tokio::test]
    async fn local_write_gives_optimistic_snapshot_then_ack_clears_it() {
        let engine = engine();
        let (observer, seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();

        engine
            .inner
            .apply_remote_event(event_with_docs(target_id, &[("rooms/a", 1)], true, 1))
            .await
            .unwrap();

        let (batch_id, mut ack) = engine
            .write(vec![Mutation::set(
                key("rooms/a"),
                object(&[("x", FieldValue::from_integer(2))]),
            )])
            .await
            .unwrap();

        {
            let snapshots = seen.lock().unwrap();
            let last = snapshots.last().unwrap();
            assert!(last.has_pending_writes());
            assert!(!last.from_cache());
        }
        assert!(ack.try_recv().unwrap().is_none());

        let batch = engine.local_store().next_mutation_batch(None).await.unwrap();
        let result = MutationBatchResult::new(
            batch,
            Timestamp::new(5, 0),
            vec![crate::model::MutationResult {
                version: Timestamp::new(5, 0),
                transform_results: Vec::new(),
            }],
            Bytes::from_static(b"st"),
        )
        .unwrap();
        assert_eq!(result.batch_id(), batch_id);
        engine.inner.apply_successful_write(result).await.unwrap();

        assert!(ack.try_recv().unwrap().unwrap().is_ok());
        let snapshots = seen.lock().unwrap();
        assert!(!snapshots.last().unwrap().has_pending_writes());
    }

    #[tokio::test]
    async fn rejected_write_surfaces_error_to_waiter() {
        let engine = engine();
        let (batch_id, ack) = engine
            .write(vec![Mutation::set(key("rooms/a"), ObjectValue::empty())])
            .await
            .unwrap();
        engine
            .inner
            .reject_failed_write(batch_id, crate::error::failed_precondition("missing"))
            .await
            .unwrap();
        let result = ack.await.unwrap();
        assert_eq!(
            result.unwrap_err().code_str(),
            "firestore/failed-precondition"
        );
    }

    #[tokio::test]
    async fn unconfirmed_document_spawns_limbo_resolution() {
        let engine = engine();
        let (observer, _seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();

        // Server catches the target up with only rooms/a...
        engine
            .inner
            .apply_remote_event(event_with_docs(target_id, &[("rooms/a", 1)], true, 1))
            .await
            .unwrap();
        // ...but rooms/b is still cached from an earlier, broader event.
        let mut orphan_event = RemoteEvent {
            snapshot_version: Timestamp::new(2, 0),
            ..RemoteEvent::default()
        };
        orphan_event.document_updates.insert(
            key("rooms/b"),
            MutableDocument::new_found(key("rooms/b"), Timestamp::new(2, 0), ObjectValue::empty()),
        );
        engine.inner.apply_remote_event(orphan_event).await.unwrap();

        let state = engine.inner.state.lock().await;
        assert!(state.limbo_targets_by_key.contains_key(&key("rooms/b")));
        // Limbo ids are odd, disjoint from the even query target ids.
        let limbo_id = state.limbo_targets_by_key[&key("rooms/b")];
        assert_eq!(limbo_id % 2, 1);
    }

    #[tokio::test]
    async fn limbo_concurrency_is_bounded() {
        let engine = SyncEngine::new(
            Arc::new(LocalStore::new(
                QueryEngineParams::default(),
                LruParams::default(),
            )),
            1,
        );
        let (observer, _seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();

        engine
            .inner
            .apply_remote_event(event_with_docs(target_id, &[("rooms/a", 1)], true, 1))
            .await
            .unwrap();
        let mut orphan_event = RemoteEvent {
            snapshot_version: Timestamp::new(2, 0),
            ..RemoteEvent::default()
        };
        for path in ["rooms/b", "rooms/c", "rooms/d"] {
            orphan_event.document_updates.insert(
                key(path),
                MutableDocument::new_found(key(path), Timestamp::new(2, 0), ObjectValue::empty()),
            );
        }
        engine.inner.apply_remote_event(orphan_event).await.unwrap();

        let state = engine.inner.state.lock().await;
        assert_eq!(state.limbo_targets_by_key.len(), 1);
        assert_eq!(state.enqueued_limbo_keys.len(), 2);
    }

    #[tokio::test]
    async fn rejected_limbo_resolution_synthesizes_delete() {
        let engine = engine();
        let (observer, seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();

        engine
            .inner
            .apply_remote_event(event_with_docs(target_id, &[("rooms/a", 1)], true, 1))
            .await
            .unwrap();
        let mut orphan_event = RemoteEvent {
            snapshot_version: Timestamp::new(2, 0),
            ..RemoteEvent::default()
        };
        orphan_event.document_updates.insert(
            key("rooms/b"),
            MutableDocument::new_found(key("rooms/b"), Timestamp::new(2, 0), ObjectValue::empty()),
        );
        engine.inner.apply_remote_event(orphan_event).await.unwrap();

        let limbo_target = {
            let state = engine.inner.state.lock().await;
            state.limbo_targets_by_key[&key("rooms/b")]
        };
        engine
            .inner
            .reject_listen(limbo_target, crate::error::permission_denied("nope"))
            .await
            .unwrap();

        {
            let state = engine.inner.state.lock().await;
            assert!(state.limbo_targets_by_key.is_empty());
        }
        let snapshots = seen.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert!(last.keys().all(|k| k != &key("rooms/b")));
    }

    #[tokio::test]
    async fn online_state_change_reverts_snapshots_to_cache() {
        let engine = engine();
        let (observer, seen) = snapshot_sink();
        let registration = engine.listen(rooms_query(), observer).await.unwrap();
        let target_id = registration.target_id();
        engine
            .inner
            .apply_remote_event(event_with_docs(target_id, &[("rooms/a", 1)], true, 1))
            .await
            .unwrap();
        assert!(!seen.lock().unwrap().last().unwrap().from_cache());

        engine.handle_online_state_change(OnlineState::Offline).await;
        assert!(seen.lock().unwrap().last().unwrap().from_cache());
    }

    #[tokio::test]
    async fn wait_for_pending_writes_resolves_after_last_ack() {
        let engine = engine();
        assert!(engine.wait_for_pending_writes().await.unwrap().is_none());

        let (batch_id, _ack) = engine
            .write(vec![Mutation::set(key("rooms/a"), ObjectValue::empty())])
            .await
            .unwrap();
        let waiter = engine.wait_for_pending_writes().await.unwrap().unwrap();

        let batch = engine.local_store().next_mutation_batch(None).await.unwrap();
        let result = MutationBatchResult::new(
            batch,
            Timestamp::new(3, 0),
            vec![crate::model::MutationResult {
                version: Timestamp::new(3, 0),
                transform_results: Vec::new(),
            }],
            Bytes::from_static(b"st"),
        )
        .unwrap();
        assert_eq!(result.batch_id(), batch_id);
        engine.inner.apply_successful_write(result).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }
}
