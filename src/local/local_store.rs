use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_lock::Mutex;

use crate::core::query::Query;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::{DocumentOverlayCache, Overlay};
use crate::local::index_manager::IndexManager;
use crate::local::local_documents::LocalDocumentsView;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::local::mutation_queue::MutationQueue;
use crate::local::query_engine::{QueryEngine, QueryEngineParams};
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::{TargetCache, TargetData, TargetPurpose};
use crate::model::{
    DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult, Timestamp,
};
use crate::remote::remote_event::RemoteEvent;

/// Durability callbacks through which an embedder mirrors cache state to an
/// external store. All methods default to no-ops so purely in-memory use
/// needs no hook.
pub trait PersistenceHook: Send + Sync {
    fn save_target(&self, _target: &TargetData) {}
    fn clear_target(&self, _target_id: i32) {}
    fn save_document(&self, _document: &MutableDocument) {}
    fn clear_document(&self, _key: &DocumentKey) {}
    fn save_overlay(&self, _key: &DocumentKey, _overlay: Option<&Overlay>) {}
}

/// Result of persisting a user write batch.
#[derive(Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    /// Latency-compensated views of every document the batch touched.
    pub changed_documents: BTreeMap<DocumentKey, MutableDocument>,
}

/// Result of executing a query against the local caches.
#[derive(Debug)]
pub struct QueryResult {
    pub documents: Vec<MutableDocument>,
    /// Keys the server last confirmed as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    target_cache: TargetCache,
    index_manager: IndexManager,
    /// Keys no longer referenced by any target, with the sequence number at
    /// which they became orphaned. Input to the garbage collector.
    orphaned_documents: BTreeMap<DocumentKey, u64>,
    target_id_generator: TargetIdGenerator,
    current_sequence_number: u64,
}

impl LocalStoreState {
    fn next_sequence_number(&mut self) -> u64 {
        self.current_sequence_number += 1;
        self.current_sequence_number
    }

    fn approximate_byte_size(&self) -> usize {
        self.remote_documents.approximate_byte_size() + self.target_cache.approximate_byte_size()
    }

    /// Updates orphan bookkeeping for a key after its reference state
    /// changed.
    fn update_orphan_state(&mut self, key: &DocumentKey, sequence_number: u64) {
        if self.target_cache.contains_key(key) || self.mutation_queue.contains_key(key) {
            self.orphaned_documents.remove(key);
        } else if self.remote_documents.contains_key(key) {
            self.orphaned_documents.insert(key.clone(), sequence_number);
        }
    }
}

/// Transactional façade over the document cache, mutation queue, overlay
/// cache, target cache and index manager.
///
/// Every public operation takes the single state lock once and performs all
/// its reads and writes inside that scope, which is what makes the
/// operation atomic with respect to every other one: a transaction commits
/// all of its mutations or none. RemoteStore never touches these caches
/// directly; remote results arrive here as `RemoteEvent`s via SyncEngine.
pub struct LocalStore {
    state: Mutex<LocalStoreState>,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
    hook: Option<Arc<dyn PersistenceHook>>,
}

impl LocalStore {
    pub fn new(query_engine_params: QueryEngineParams, lru_params: LruParams) -> Self {
        Self {
            state: Mutex::new(LocalStoreState {
                remote_documents: RemoteDocumentCache::new(),
                mutation_queue: MutationQueue::new(),
                overlays: DocumentOverlayCache::new(),
                target_cache: TargetCache::new(),
                index_manager: IndexManager::new(),
                orphaned_documents: BTreeMap::new(),
                target_id_generator: TargetIdGenerator::for_target_cache(),
                current_sequence_number: 0,
            }),
            query_engine: QueryEngine::new(query_engine_params),
            garbage_collector: LruGarbageCollector::new(lru_params),
            hook: None,
        }
    }

    pub fn with_persistence_hook(mut self, hook: Arc<dyn PersistenceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Registers a query target, reusing the existing allocation when the
    /// query is already tracked.
    pub async fn allocate_target(&self, query: Query) -> FirestoreResult<TargetData> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.target_cache.get_target_data_for_query(&query) {
            return Ok(existing.clone());
        }
        let sequence_number = state.next_sequence_number();
        let target_id = state.target_id_generator.next();
        let target_data = TargetData::new(query, target_id, sequence_number, TargetPurpose::Listen);
        state.target_cache.add_target_data(target_data.clone());
        if let Some(hook) = &self.hook {
            hook.save_target(&target_data);
        }
        Ok(target_data)
    }

    /// Registers a limbo-resolution target created by the sync engine.
    pub async fn allocate_limbo_target(
        &self,
        target_id: i32,
        key: &DocumentKey,
    ) -> FirestoreResult<TargetData> {
        let mut state = self.state.lock().await;
        let sequence_number = state.next_sequence_number();
        let target_data = TargetData::new(
            Query::document(key),
            target_id,
            sequence_number,
            TargetPurpose::LimboResolution,
        );
        state.target_cache.add_target_data(target_data.clone());
        state
            .target_cache
            .add_matching_keys(&[key.clone()].into_iter().collect(), target_id);
        Ok(target_data)
    }

    /// Unpins a target. The target data stays cached (its resume token makes
    /// a later re-listen cheap) until the garbage collector evicts it; the
    /// caller stops counting it as active.
    pub async fn release_target(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let sequence_number = state.next_sequence_number();
        if let Some(target_data) = state.target_cache.get_target_data(target_id).cloned() {
            state
                .target_cache
                .update_target_data(target_data.with_sequence_number(sequence_number));
        }
        Ok(())
    }

    /// Drops a target and its references immediately (limbo resolutions do
    /// not survive their listen).
    pub async fn remove_target(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let sequence_number = state.next_sequence_number();
        let keys = state.target_cache.matching_keys_for_target(target_id);
        state.target_cache.remove_target_data(target_id);
        for key in keys {
            state.update_orphan_state(&key, sequence_number);
        }
        if let Some(hook) = &self.hook {
            hook.clear_target(target_id);
        }
        Ok(())
    }

    pub async fn get_target_data(&self, target_id: i32) -> Option<TargetData> {
        self.state
            .lock()
            .await
            .target_cache
            .get_target_data(target_id)
            .cloned()
    }

    pub async fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.state
            .lock()
            .await
            .target_cache
            .matching_keys_for_target(target_id)
    }

    /// Persists a user write batch and memoizes its overlays.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let mut state = self.state.lock().await;
        let batch = state
            .mutation_queue
            .add_mutation_batch(Timestamp::now(), mutations)?;
        let keys = batch.keys();
        let state = &mut *state;
        let changed_documents = LocalDocumentsView::recalculate_and_save_overlays(
            &state.remote_documents,
            &state.mutation_queue,
            &mut state.overlays,
            &keys,
        )?;
        if let Some(hook) = &self.hook {
            for key in &keys {
                hook.save_overlay(key, state.overlays.get_overlay(key));
            }
        }
        state.index_manager.update_index_entries(&changed_documents);
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changed_documents,
        })
    }

    /// Applies a write acknowledgement: removes the batch (exactly once, in
    /// FIFO order), folds the server results into the document cache and
    /// recomputes the overlays the batch used to own.
    pub async fn acknowledge_batch(
        &self,
        result: &MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let batch = state.mutation_queue.remove_mutation_batch(result.batch_id())?;

        for key in batch.keys() {
            let mut document = state.remote_documents.get(&key);
            // Monotonic versions: an ack may race a newer watch update; keep
            // whichever state is newest.
            if document.version() < result.commit_version {
                batch.apply_to_remote_document(&mut document, result)?;
                if document.is_valid_document() {
                    state.remote_documents.add(document.clone());
                    if let Some(hook) = &self.hook {
                        hook.save_document(&document);
                    }
                }
            }
        }

        self.rewind_overlays_for_batch(state, &batch)
    }

    /// Applies a write rejection: the batch is dropped without touching the
    /// document cache and affected overlays are recomputed.
    pub async fn reject_batch(
        &self,
        batch_id: i32,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let batch = state.mutation_queue.remove_mutation_batch(batch_id)?;
        self.rewind_overlays_for_batch(state, &batch)
    }

    fn rewind_overlays_for_batch(
        &self,
        state: &mut LocalStoreState,
        batch: &MutationBatch,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut affected = state.overlays.remove_overlays_for_batch_id(batch.batch_id);
        affected.extend(batch.keys());
        let changed_documents = LocalDocumentsView::recalculate_and_save_overlays(
            &state.remote_documents,
            &state.mutation_queue,
            &mut state.overlays,
            &affected,
        )?;
        if let Some(hook) = &self.hook {
            for key in &affected {
                hook.save_overlay(key, state.overlays.get_overlay(key));
            }
        }
        state.index_manager.update_index_entries(&changed_documents);
        let sequence_number = state.next_sequence_number();
        for key in &affected {
            state.update_orphan_state(key, sequence_number);
        }
        Ok(changed_documents)
    }

    pub async fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> Option<MutationBatch> {
        self.state
            .lock()
            .await
            .mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
            .cloned()
    }

    pub async fn highest_unacknowledged_batch_id(&self) -> Option<i32> {
        self.state
            .lock()
            .await
            .mutation_queue
            .highest_unacknowledged_batch_id()
    }

    /// Drops every queued write, returning the abandoned batch ids so their
    /// waiters can be notified. Used on credential change.
    pub async fn clear_local_writes(&self) -> FirestoreResult<Vec<i32>> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let batches = state.mutation_queue.clear();
        let mut affected: BTreeSet<DocumentKey> = BTreeSet::new();
        for batch in &batches {
            state.overlays.remove_overlays_for_batch_id(batch.batch_id);
            affected.extend(batch.keys());
        }
        let changed = LocalDocumentsView::recalculate_and_save_overlays(
            &state.remote_documents,
            &state.mutation_queue,
            &mut state.overlays,
            &affected,
        )?;
        state.index_manager.update_index_entries(&changed);
        Ok(batches.into_iter().map(|batch| batch.batch_id).collect())
    }

    /// Applies a consolidated remote event in one transaction.
    ///
    /// Returns the changed local document views so the sync engine can
    /// update its query views.
    pub async fn apply_remote_event(
        &self,
        event: &RemoteEvent,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let sequence_number = state.next_sequence_number();

        for (target_id, change) in &event.target_changes {
            let Some(target_data) = state.target_cache.get_target_data(*target_id).cloned() else {
                continue;
            };

            state
                .target_cache
                .remove_matching_keys(&change.removed_documents, *target_id);
            let mut added = change.added_documents.clone();
            added.extend(change.modified_documents.iter().cloned());
            state.target_cache.add_matching_keys(&added, *target_id);

            // Resume tokens are only persisted when non-empty; an empty
            // token would forget the stream position.
            let mut updated = target_data.with_sequence_number(sequence_number);
            if !change.resume_token.is_empty() {
                updated = updated
                    .with_resume_token(change.resume_token.clone(), event.snapshot_version);
            }
            if change.current {
                updated = updated.with_last_limbo_free_snapshot_version(event.snapshot_version);
            }
            state.target_cache.update_target_data(updated.clone());
            if let Some(hook) = &self.hook {
                hook.save_target(&updated);
            }

            for key in change.removed_documents.iter() {
                state.update_orphan_state(key, sequence_number);
            }
        }

        for target_id in &event.target_mismatches {
            let Some(target_data) = state.target_cache.get_target_data(*target_id).cloned() else {
                continue;
            };
            let keys = state.target_cache.matching_keys_for_target(*target_id);
            state.target_cache.remove_matching_keys(&keys, *target_id);
            // The reset target re-listens without a resume token so the
            // backend replays its full result set.
            state.target_cache.update_target_data(
                target_data
                    .with_sequence_number(sequence_number)
                    .with_resume_token(bytes::Bytes::new(), Timestamp::zero())
                    .with_last_limbo_free_snapshot_version(Timestamp::zero())
                    .with_purpose(TargetPurpose::ExistenceFilterMismatch),
            );
            for key in keys {
                state.update_orphan_state(&key, sequence_number);
            }
        }

        let mut changed_keys = BTreeSet::new();
        for (key, document) in &event.document_updates {
            let existing = state.remote_documents.get(key);
            // Versions never decrease except via explicit reset.
            if existing.is_valid_document() && document.version() < existing.version() {
                log::debug!(
                    "ignoring stale watch update for {} ({:?} < {:?})",
                    key.path(),
                    document.version(),
                    existing.version()
                );
                continue;
            }
            if document.is_no_document() && !state.target_cache.contains_key(key) {
                // A confirmed delete for an unreferenced key frees the cache
                // entry outright.
                state.remote_documents.remove(key);
                state.orphaned_documents.remove(key);
            } else {
                state.remote_documents.add(document.clone());
                state.update_orphan_state(key, sequence_number);
            }
            if let Some(hook) = &self.hook {
                if document.is_no_document() {
                    hook.clear_document(key);
                } else {
                    hook.save_document(document);
                }
            }
            changed_keys.insert(key.clone());
        }

        if event.snapshot_version > state.target_cache.last_remote_snapshot_version() {
            state
                .target_cache
                .set_last_remote_snapshot_version(event.snapshot_version);
        }

        let changed = LocalDocumentsView::get_documents(
            &state.remote_documents,
            &state.overlays,
            &changed_keys,
        )?;
        state.index_manager.update_index_entries(&changed);
        Ok(changed)
    }

    pub async fn execute_query(&self, query: &Query) -> FirestoreResult<QueryResult> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let (last_limbo_free, remote_keys) =
            match state.target_cache.get_target_data_for_query(query) {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version(),
                    state
                        .target_cache
                        .matching_keys_for_target(target_data.target_id()),
                ),
                None => (Timestamp::zero(), BTreeSet::new()),
            };
        let documents = self.query_engine.get_documents_matching_query(
            &mut state.index_manager,
            &state.remote_documents,
            &state.overlays,
            query,
            last_limbo_free,
            &remote_keys,
        )?;
        Ok(QueryResult {
            documents,
            remote_keys,
        })
    }

    pub async fn get_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let state = self.state.lock().await;
        LocalDocumentsView::get_document(&state.remote_documents, &state.overlays, key)
    }

    pub async fn last_remote_snapshot_version(&self) -> Timestamp {
        self.state
            .lock()
            .await
            .target_cache
            .last_remote_snapshot_version()
    }

    /// One opportunistic garbage collection pass. Skipped entirely while the
    /// caches are below the configured size threshold.
    pub async fn collect_garbage(&self, active_target_ids: &BTreeSet<i32>) -> LruResults {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        if !self
            .garbage_collector
            .should_run(state.approximate_byte_size())
        {
            return LruResults::default();
        }
        self.garbage_collector.collect(
            &mut state.target_cache,
            &mut state.remote_documents,
            &state.mutation_queue,
            &mut state.orphaned_documents,
            active_target_ids,
        )
    }

    pub fn gc_params(&self) -> LruParams {
        *self.garbage_collector.params()
    }

    /// Restores a target persisted by an embedder at startup.
    pub async fn seed_target(&self, target_data: TargetData, keys: BTreeSet<DocumentKey>) {
        let mut state = self.state.lock().await;
        let target_id = target_data.target_id();
        state.target_cache.add_target_data(target_data);
        state.target_cache.add_matching_keys(&keys, target_id);
    }

    /// Restores a cached document persisted by an embedder at startup.
    pub async fn seed_document(&self, document: MutableDocument) {
        let mut state = self.state.lock().await;
        state.remote_documents.add(document);
    }
}
