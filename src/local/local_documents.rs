use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Timestamp,
};

/// Latency-compensated reads over the document cache, mutation queue and
/// overlay cache.
///
/// The overlay fold is the contract everything else relies on: the local
/// view of a key always equals the base document with every queued mutation
/// applied in batch order, whether it is served from the memoized overlay or
/// recomputed from scratch.
pub struct LocalDocumentsView;

impl LocalDocumentsView {
    /// Returns the local view of a single key.
    pub fn get_document(
        remote_documents: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        let mut document = remote_documents.get(key);
        if let Some(overlay) = overlays.get_overlay(key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, None, Timestamp::now())?;
        }
        Ok(document)
    }

    pub fn get_documents(
        remote_documents: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut result = BTreeMap::new();
        for key in keys {
            result.insert(
                key.clone(),
                Self::get_document(remote_documents, overlays, key)?,
            );
        }
        Ok(result)
    }

    /// Applies overlays onto already-fetched base documents.
    pub fn get_local_view_of_documents(
        overlays: &DocumentOverlayCache,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<()> {
        for (key, document) in documents.iter_mut() {
            if let Some(overlay) = overlays.get_overlay(key) {
                overlay
                    .mutation
                    .apply_to_local_view(document, None, Timestamp::now())?;
            }
        }
        Ok(())
    }

    /// Recomputes and persists overlays for `keys` by replaying the mutation
    /// queue against the base documents.
    ///
    /// Called whenever a batch affecting those keys was added or removed.
    pub fn recalculate_and_save_overlays(
        remote_documents: &RemoteDocumentCache,
        mutation_queue: &MutationQueue,
        overlays: &mut DocumentOverlayCache,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut documents = remote_documents.get_all(keys);
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = keys
            .iter()
            .map(|key| (key.clone(), Some(FieldMask::default())))
            .collect();
        let mut largest_batch_ids: BTreeMap<DocumentKey, i32> = BTreeMap::new();

        let batches = mutation_queue.all_mutation_batches_affecting_document_keys(keys);
        for batch in batches {
            for key in batch.keys() {
                if !keys.contains(&key) {
                    continue;
                }
                let document = documents
                    .get_mut(&key)
                    .expect("documents fetched for every requested key");
                let mask = masks.remove(&key).unwrap_or(Some(FieldMask::default()));
                let mask = batch.apply_to_local_view(document, mask)?;
                masks.insert(key.clone(), mask);
                largest_batch_ids.insert(key, batch.batch_id);
            }
        }

        let mut recalculated: BTreeMap<i32, BTreeMap<DocumentKey, _>> = BTreeMap::new();
        for (key, document) in &documents {
            let overlay =
                calculate_overlay_mutation(document, masks.get(key).and_then(|m| m.as_ref()));
            let batch_id = largest_batch_ids.get(key).copied().unwrap_or(0);
            recalculated
                .entry(batch_id)
                .or_default()
                .insert(key.clone(), overlay);
        }
        for (batch_id, overlays_for_batch) in recalculated {
            overlays.save_overlays(batch_id, overlays_for_batch);
        }

        Ok(documents)
    }

    /// Collection scan feeding the query engine's fallback tier: base
    /// documents from the cache plus keys that only exist as overlays,
    /// folded and filtered by the query.
    pub fn get_documents_matching_query(
        remote_documents: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
        documents_read: &mut usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut candidates = if let Some(collection_id) = query.collection_group_id() {
            remote_documents.get_all_from_collection_group(collection_id)
        } else {
            remote_documents.get_all_from_collection(query.path())
        };
        *documents_read += candidates.len();

        let local_only = if let Some(collection_id) = query.collection_group_id() {
            overlays.get_overlays_for_collection_group(collection_id, -1)
        } else {
            overlays.get_overlays_for_collection(query.path(), -1)
        };
        for key in local_only.keys() {
            candidates
                .entry(key.clone())
                .or_insert_with(|| remote_documents.get(key));
        }

        Self::get_local_view_of_documents(overlays, &mut candidates)?;
        candidates.retain(|_, document| query.matches(document));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, FieldValue, Mutation, ObjectValue};
    use crate::model::{FieldTransform, TransformOperation};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn object(entries: &[(&str, FieldValue)]) -> ObjectValue {
        let mut map = BTreeMap::new();
        for (name, value) in entries {
            map.insert((*name).to_string(), value.clone());
        }
        ObjectValue::new(map)
    }

    struct Fixture {
        remote: RemoteDocumentCache,
        queue: MutationQueue,
        overlays: DocumentOverlayCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                remote: RemoteDocumentCache::new(),
                queue: MutationQueue::new(),
                overlays: DocumentOverlayCache::new(),
            }
        }

        fn write(&mut self, mutations: Vec<Mutation>) {
            let batch = self
                .queue
                .add_mutation_batch(Timestamp::now(), mutations)
                .unwrap();
            LocalDocumentsView::recalculate_and_save_overlays(
                &self.remote,
                &self.queue,
                &mut self.overlays,
                &batch.keys(),
            )
            .unwrap();
        }

        fn local_view(&self, path: &str) -> MutableDocument {
            LocalDocumentsView::get_document(&self.remote, &self.overlays, &key(path)).unwrap()
        }
    }

    #[test]
    fn overlay_matches_full_replay() {
        let mut fx = Fixture::new();
        fx.remote.add(MutableDocument::new_found(
            key("rooms/eros"),
            Timestamp::new(1, 0),
            object(&[("count", FieldValue::from_integer(1))]),
        ));

        fx.write(vec![Mutation::patch(
            key("rooms/eros"),
            ObjectValue::empty(),
            FieldMask::default(),
        )
        .with_transforms(vec![FieldTransform::new(
            field("count"),
            TransformOperation::NumericIncrement(FieldValue::from_integer(2)),
        )])]);
        fx.write(vec![Mutation::patch(
            key("rooms/eros"),
            ObjectValue::empty(),
            FieldMask::default(),
        )
        .with_transforms(vec![FieldTransform::new(
            field("count"),
            TransformOperation::NumericIncrement(FieldValue::from_integer(3)),
        )])]);

        // Memoized overlay result equals folding both queued batches.
        let memoized = fx.local_view("rooms/eros");
        assert_eq!(
            memoized.data().field(&field("count")),
            Some(&FieldValue::from_integer(6))
        );

        let mut replayed = fx.remote.get(&key("rooms/eros"));
        let mut mask = Some(FieldMask::default());
        for batch in fx.queue.batches() {
            mask = batch.apply_to_local_view(&mut replayed, mask).unwrap();
        }
        assert_eq!(replayed.data(), memoized.data());
    }

    #[test]
    fn local_only_document_appears_in_collection_scan() {
        let mut fx = Fixture::new();
        fx.write(vec![Mutation::set(
            key("rooms/new"),
            object(&[("fresh", FieldValue::from_bool(true))]),
        )]);

        let query = Query::collection(crate::model::ResourcePath::from_string("rooms").unwrap());
        let mut reads = 0;
        let results = LocalDocumentsView::get_documents_matching_query(
            &fx.remote,
            &fx.overlays,
            &query,
            &mut reads,
        )
        .unwrap();
        assert!(results.contains_key(&key("rooms/new")));
        assert!(results[&key("rooms/new")].has_local_mutations());
    }

    #[test]
    fn delete_overlay_hides_document() {
        let mut fx = Fixture::new();
        fx.remote.add(MutableDocument::new_found(
            key("rooms/eros"),
            Timestamp::new(1, 0),
            object(&[("x", FieldValue::from_integer(1))]),
        ));
        fx.write(vec![Mutation::delete(key("rooms/eros"))]);

        let doc = fx.local_view("rooms/eros");
        assert!(doc.is_no_document());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn ack_removal_recomputes_overlays() {
        let mut fx = Fixture::new();
        fx.write(vec![Mutation::set(
            key("rooms/eros"),
            object(&[("x", FieldValue::from_integer(1))]),
        )]);
        fx.write(vec![Mutation::patch(
            key("rooms/eros"),
            object(&[("y", FieldValue::from_integer(2))]),
            FieldMask::new([field("y")]),
        )
        // The set created the document locally, so the patch applies.
        ]);

        let first_id = fx.queue.batches().next().unwrap().batch_id;
        fx.queue.remove_mutation_batch(first_id).unwrap();
        LocalDocumentsView::recalculate_and_save_overlays(
            &fx.remote,
            &fx.queue,
            &mut fx.overlays,
            &[key("rooms/eros")].into_iter().collect(),
        )
        .unwrap();

        // Only the patch remains queued; with no base document its
        // precondition fails, so the local view shows no net change.
        let doc = fx.local_view("rooms/eros");
        assert!(!doc.is_found_document());
    }
}
