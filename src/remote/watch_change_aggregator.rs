use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{internal_error, FirestoreResult};
use crate::local::target_cache::TargetPurpose;
use crate::model::{DocumentKey, MutableDocument, Timestamp};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchTargetChange,
};

/// Metadata about active targets the aggregator needs to reason about
/// existing documents.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local cache currently assigns to the target.
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey>;
    /// Purpose of the target, or `None` when it is no longer active.
    fn get_target_purpose(&self, target_id: i32) -> Option<TargetPurpose>;
    /// The document a limbo-resolution target is waiting on.
    fn get_limbo_document_key(&self, target_id: i32) -> Option<DocumentKey>;
}

/// Consolidates individual watch changes into `RemoteEvent`s.
///
/// Tracks per-target accumulation state between snapshots, applies
/// existence-filter repairs, and synthesizes deletes for limbo resolutions
/// that come back current without a document.
pub struct WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    metadata: Arc<P>,
    target_states: HashMap<i32, TargetState>,
    target_documents: HashMap<i32, BTreeSet<DocumentKey>>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_target_mismatches: BTreeSet<i32>,
    snapshot_version: Timestamp,
}

impl<P> WatchChangeAggregator<P>
where
    P: TargetMetadataProvider + 'static,
{
    pub fn new(metadata: Arc<P>) -> Self {
        Self {
            metadata,
            target_states: HashMap::new(),
            target_documents: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_target_mismatches: BTreeSet::new(),
            snapshot_version: Timestamp::zero(),
        }
    }

    pub fn handle_watch_change(&mut self, change: WatchChange) -> FirestoreResult<()> {
        match change {
            WatchChange::TargetChange(target_change) => self.handle_target_change(target_change),
            WatchChange::DocumentChange(doc_change) => {
                self.handle_document_change(doc_change);
                Ok(())
            }
            WatchChange::DocumentDelete(delete) => {
                self.handle_document_delete(delete);
                Ok(())
            }
            WatchChange::ExistenceFilter(filter) => {
                self.handle_existence_filter(filter);
                Ok(())
            }
        }
    }

    fn handle_target_change(&mut self, change: WatchTargetChange) -> FirestoreResult<()> {
        if let Some(error) = change.cause.as_ref() {
            return Err(internal_error(format!(
                "watch target error must be dispatched before aggregation: {error}"
            )));
        }

        let affected: Vec<i32> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in affected {
            if self.metadata.get_target_purpose(target_id).is_none() {
                // Response for a target removed on a previous queue turn;
                // discard instead of resurrecting state for it.
                self.target_states.remove(&target_id);
                self.target_documents.remove(&target_id);
                continue;
            }
            if change.state == TargetChangeState::Remove {
                self.target_states.remove(&target_id);
                self.target_documents.remove(&target_id);
                continue;
            }

            self.ensure_target(target_id);
            let state = self
                .target_states
                .get_mut(&target_id)
                .expect("ensured above");

            match change.state {
                TargetChangeState::NoChange | TargetChangeState::Add => {
                    state.update_resume_token(change.resume_token.clone());
                }
                TargetChangeState::Current => {
                    state.current = true;
                    state.update_resume_token(change.resume_token.clone());
                    state.mark_dirty();
                }
                TargetChangeState::Reset => {
                    state.reset();
                    state.update_resume_token(change.resume_token.clone());
                }
                TargetChangeState::Remove => unreachable!("handled above"),
            }

            if change.state == TargetChangeState::Reset {
                self.target_documents.insert(target_id, BTreeSet::new());
            }
        }

        Ok(())
    }

    fn handle_document_change(&mut self, change: DocumentChange) {
        let key = change.key.clone();

        if let Some(watch_document) = change.new_document {
            let document = MutableDocument::new_found(
                watch_document.key.clone(),
                watch_document.update_time,
                watch_document.fields,
            );
            for target_id in &change.updated_target_ids {
                self.apply_document_update(*target_id, key.clone(), true);
            }
            self.pending_document_updates.insert(key.clone(), document);
        }

        for target_id in &change.removed_target_ids {
            self.apply_document_update(*target_id, key.clone(), false);
        }
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete) {
        let key = delete.key.clone();
        for target_id in delete.removed_target_ids {
            self.apply_document_update(target_id, key.clone(), false);
        }
        let version = delete.read_time.unwrap_or(self.snapshot_version);
        self.pending_document_updates
            .insert(key.clone(), MutableDocument::new_no_document(key, version));
    }

    /// Compares the server's count of matching documents against the local
    /// count.
    ///
    /// On mismatch the supplied bloom filter is probed first: any local key
    /// absent from the filter is certainly deleted and is purged in place.
    /// If no filter was sent, the filter rejects keys it should contain, or
    /// the counts still disagree afterwards, the target is flagged for a
    /// full reset and re-listen.
    fn handle_existence_filter(&mut self, filter: ExistenceFilterChange) {
        let target_id = filter.target_id;
        if self.metadata.get_target_purpose(target_id).is_none() {
            return;
        }
        self.ensure_target(target_id);

        let current_count = self.current_document_count(target_id) as i32;
        if current_count == filter.count {
            return;
        }

        let repaired_count = match &filter.unchanged_names {
            Some(bloom) => {
                let removed = self.purge_keys_absent_from_filter(target_id, bloom);
                log::debug!(
                    "existence filter repair removed {removed} documents from target {target_id}"
                );
                self.current_document_count(target_id) as i32
            }
            None => current_count,
        };

        if repaired_count != filter.count {
            self.reset_target(target_id);
            self.pending_target_mismatches.insert(target_id);
        }
    }

    fn purge_keys_absent_from_filter(
        &mut self,
        target_id: i32,
        bloom: &crate::remote::bloom_filter::BloomFilter,
    ) -> usize {
        let existing: Vec<DocumentKey> = self
            .target_documents
            .get(&target_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for key in existing {
            if !bloom.might_contain(&key.path().canonical_string()) {
                self.apply_document_update(target_id, key, false);
                removed += 1;
            }
        }
        removed
    }

    fn reset_target(&mut self, target_id: i32) {
        if let Some(state) = self.target_states.get_mut(&target_id) {
            state.reset();
            // The reset resumes from scratch; a stale token must not leak
            // into the re-listen.
            state.resume_token = Bytes::new();
        }
        self.target_documents.insert(target_id, BTreeSet::new());
    }

    fn apply_document_update(&mut self, target_id: i32, key: DocumentKey, present: bool) {
        if self.metadata.get_target_purpose(target_id).is_none() {
            return;
        }
        self.ensure_target(target_id);
        let state = self
            .target_states
            .get_mut(&target_id)
            .expect("ensured above");
        let docs = self
            .target_documents
            .get_mut(&target_id)
            .expect("ensured above");

        if present {
            let existed = docs.contains(&key);
            docs.insert(key.clone());
            state.received_documents.insert(key.clone());
            if existed {
                state.modified.insert(key);
            } else {
                state.added.insert(key);
            }
            state.mark_dirty();
        } else if docs.remove(&key) {
            state.removed.insert(key);
            state.mark_dirty();
        }
    }

    fn current_document_count(&self, target_id: i32) -> usize {
        self.target_documents
            .get(&target_id)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn ensure_target(&mut self, target_id: i32) {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new);
        if !self.target_documents.contains_key(&target_id) {
            self.target_documents
                .insert(target_id, self.metadata.get_remote_keys(target_id));
        }
    }

    pub fn set_snapshot_version(&mut self, version: Timestamp) {
        if version > self.snapshot_version {
            self.snapshot_version = version;
        }
    }

    /// Removes all accumulated state for a target; late responses for it are
    /// discarded rather than re-registered.
    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
        self.target_documents.remove(&target_id);
    }

    /// Produces the consolidated event and clears the accumulation state.
    pub fn create_remote_event(&mut self) -> RemoteEvent {
        let mut resolved_limbo_documents = BTreeSet::new();

        // A limbo resolution that reports current without having delivered
        // its document proves the document no longer exists: synthesize the
        // delete the stream never sent.
        let limbo_targets: Vec<(i32, DocumentKey)> = self
            .target_states
            .iter()
            .filter(|(target_id, state)| {
                state.current
                    && self.metadata.get_target_purpose(**target_id)
                        == Some(TargetPurpose::LimboResolution)
            })
            .filter_map(|(target_id, _)| {
                self.metadata
                    .get_limbo_document_key(*target_id)
                    .map(|key| (*target_id, key))
            })
            .collect();
        for (target_id, key) in limbo_targets {
            let received = self
                .target_states
                .get(&target_id)
                .map(|state| state.received_documents.contains(&key))
                .unwrap_or(false);
            if !received && !self.pending_document_updates.contains_key(&key) {
                self.pending_document_updates.insert(
                    key.clone(),
                    MutableDocument::new_no_document(key.clone(), self.snapshot_version),
                );
            }
            resolved_limbo_documents.insert(key);
        }

        let target_changes = self
            .target_states
            .iter_mut()
            .filter_map(|(target_id, state)| {
                state.take_changes().map(|change| (*target_id, change))
            })
            .collect();

        RemoteEvent {
            snapshot_version: self.snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_mismatches),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        }
    }
}

struct TargetState {
    resume_token: Bytes,
    current: bool,
    added: BTreeSet<DocumentKey>,
    modified: BTreeSet<DocumentKey>,
    removed: BTreeSet<DocumentKey>,
    /// Documents actually delivered on this stream for the target; feeds the
    /// limbo synthesized-delete check.
    received_documents: BTreeSet<DocumentKey>,
    dirty: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            resume_token: Bytes::new(),
            current: false,
            added: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
            received_documents: BTreeSet::new(),
            dirty: false,
        }
    }

    fn reset(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.removed.clear();
        self.received_documents.clear();
        self.current = false;
        self.dirty = true;
    }

    fn update_resume_token(&mut self, token: Bytes) {
        if !token.is_empty() {
            self.resume_token = token;
            self.dirty = true;
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn take_changes(&mut self) -> Option<TargetChange> {
        if !self.dirty {
            return None;
        }
        let change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents: std::mem::take(&mut self.added),
            modified_documents: std::mem::take(&mut self.modified),
            removed_documents: std::mem::take(&mut self.removed),
        };
        self.dirty = false;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectValue;
    use crate::remote::bloom_filter::BloomFilter;
    use crate::remote::watch_change::WatchDocument;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMetadata {
        remote_keys: Mutex<BTreeMap<i32, BTreeSet<DocumentKey>>>,
        purposes: Mutex<BTreeMap<i32, TargetPurpose>>,
    }

    impl TestMetadata {
        fn with_target(target_id: i32, purpose: TargetPurpose) -> Arc<Self> {
            let metadata = Self::default();
            metadata.purposes.lock().unwrap().insert(target_id, purpose);
            Arc::new(metadata)
        }

        fn seed_keys(&self, target_id: i32, keys: impl IntoIterator<Item = DocumentKey>) {
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, keys.into_iter().collect());
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_purpose(&self, target_id: i32) -> Option<TargetPurpose> {
            self.purposes.lock().unwrap().get(&target_id).copied()
        }

        fn get_limbo_document_key(&self, target_id: i32) -> Option<DocumentKey> {
            if self.get_target_purpose(target_id) != Some(TargetPurpose::LimboResolution) {
                return None;
            }
            self.get_remote_keys(target_id).into_iter().next()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_change(path: &str, targets: Vec<i32>) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: targets,
            removed_target_ids: vec![],
            key: key(path),
            new_document: Some(WatchDocument {
                key: key(path),
                fields: ObjectValue::empty(),
                update_time: Timestamp::new(1, 0),
            }),
        })
    }

    fn current(target_id: i32, token: &[u8]) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange {
            state: TargetChangeState::Current,
            target_ids: vec![target_id],
            resume_token: Bytes::copy_from_slice(token),
            read_time: None,
            cause: None,
        })
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = TestMetadata::with_target(1, TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_watch_change(doc_change("rooms/eros", vec![1]))
            .unwrap();
        aggregator.handle_watch_change(current(1, b"token")).unwrap();

        let event = aggregator.create_remote_event();
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/eros")));
        assert_eq!(change.resume_token.as_ref(), b"token");
        assert!(event.document_updates.contains_key(&key("rooms/eros")));
    }

    #[test]
    fn responses_for_removed_targets_are_discarded() {
        let metadata = Arc::new(TestMetadata::default());
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator
            .handle_watch_change(doc_change("rooms/eros", vec![9]))
            .unwrap();
        let event = aggregator.create_remote_event();
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn matching_existence_filter_is_a_noop() {
        let metadata = TestMetadata::with_target(1, TargetPurpose::Listen);
        metadata.seed_keys(1, [key("rooms/a")]);
        let mut aggregator = WatchChangeAggregator::new(Arc::clone(&metadata));

        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            }))
            .unwrap();
        let event = aggregator.create_remote_event();
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn mismatch_without_bloom_resets_target() {
        let metadata = TestMetadata::with_target(1, TargetPurpose::Listen);
        metadata.seed_keys(1, [key("rooms/a"), key("rooms/b")]);
        let mut aggregator = WatchChangeAggregator::new(Arc::clone(&metadata));

        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            }))
            .unwrap();
        let event = aggregator.create_remote_event();
        assert!(event.target_mismatches.contains(&1));
    }

    #[test]
    fn bloom_filter_repairs_without_reset() {
        let metadata = TestMetadata::with_target(1, TargetPurpose::Listen);
        metadata.seed_keys(1, [key("rooms/kept"), key("rooms/deleted")]);
        let mut aggregator = WatchChangeAggregator::new(Arc::clone(&metadata));

        let mut bloom = BloomFilter::with_expected_entries(64);
        bloom.insert("rooms/kept");
        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: Some(bloom),
            }))
            .unwrap();

        let event = aggregator.create_remote_event();
        assert!(event.target_mismatches.is_empty());
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.removed_documents.contains(&key("rooms/deleted")));
        assert!(!change.removed_documents.contains(&key("rooms/kept")));
    }

    #[test]
    fn current_limbo_target_synthesizes_delete() {
        let metadata = TestMetadata::with_target(7, TargetPurpose::LimboResolution);
        metadata.seed_keys(7, [key("rooms/limbo")]);
        let mut aggregator = WatchChangeAggregator::new(Arc::clone(&metadata));
        aggregator.set_snapshot_version(Timestamp::new(9, 0));

        aggregator.handle_watch_change(current(7, b"")).unwrap();
        let event = aggregator.create_remote_event();

        let synthesized = event.document_updates.get(&key("rooms/limbo")).unwrap();
        assert!(synthesized.is_no_document());
        assert_eq!(synthesized.version(), Timestamp::new(9, 0));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/limbo")));
    }
}
