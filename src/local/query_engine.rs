use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::{LimitType, Query};
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::index_manager::{IndexManager, IndexType};
use crate::local::local_documents::LocalDocumentsView;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{DocumentKey, MutableDocument, Timestamp};

#[derive(Clone, Copy, Debug)]
pub struct QueryEngineParams {
    /// A collection smaller than this is never worth indexing.
    pub index_auto_creation_min_collection_size: usize,
    /// An index pays off when a scan reads more than `result_size * factor`
    /// documents. The default corresponds to a mid-range device; embedders
    /// tune it per device class.
    pub relative_index_read_cost_per_document: f64,
    pub index_auto_creation_enabled: bool,
}

impl Default for QueryEngineParams {
    fn default() -> Self {
        Self {
            index_auto_creation_min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
            index_auto_creation_enabled: true,
        }
    }
}

/// Executes queries against the local caches using a three-tier strategy:
/// direct key lookup, index-served candidates, then a full collection scan.
///
/// The scan tier feeds a read-count heuristic back into the index manager so
/// frequently-scanned query shapes get an index created for them — a
/// self-tuning policy, not merely an accelerator.
pub struct QueryEngine {
    params: QueryEngineParams,
}

impl QueryEngine {
    pub fn new(params: QueryEngineParams) -> Self {
        Self { params }
    }

    pub fn get_documents_matching_query(
        &self,
        index_manager: &mut IndexManager,
        remote_documents: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
        last_limbo_free_snapshot_version: Timestamp,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutableDocument>> {
        // Tier 1: single-document lookup.
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = LocalDocumentsView::get_document(remote_documents, overlays, &key)?;
            return Ok(if document.is_found_document() {
                vec![document]
            } else {
                Vec::new()
            });
        }

        // Tier 2: resolve candidates from an index when one exists. A
        // limited query that has seen limbo documents since its last
        // snapshot cannot trust a narrowed candidate set: a document outside
        // it may sort into the limit.
        let limit_is_safe = query.limit().is_none()
            || !last_limbo_free_snapshot_version.is_zero()
            || !remote_keys.is_empty();
        if limit_is_safe && index_manager.get_index_type(query) != IndexType::None {
            if let Some(candidates) = index_manager.get_candidate_keys(query) {
                let mut documents =
                    LocalDocumentsView::get_documents(remote_documents, overlays, &candidates)?;
                documents.retain(|_, document| query.matches(document));
                return Ok(Self::sort_and_limit(query, documents));
            }
        }

        // Tier 3: full collection (or collection-group) scan.
        let mut documents_read = 0usize;
        let documents = LocalDocumentsView::get_documents_matching_query(
            remote_documents,
            overlays,
            query,
            &mut documents_read,
        )?;
        let result_size = documents.len();
        let results = Self::sort_and_limit(query, documents);

        self.maybe_create_index(index_manager, query, documents_read, result_size, &results);
        Ok(results)
    }

    fn maybe_create_index(
        &self,
        index_manager: &mut IndexManager,
        query: &Query,
        documents_read: usize,
        result_size: usize,
        results: &[MutableDocument],
    ) {
        if !self.params.index_auto_creation_enabled
            || query.indexed_fields().is_empty()
            || index_manager.get_index_type(query) != IndexType::None
        {
            return;
        }
        if documents_read < self.params.index_auto_creation_min_collection_size {
            return;
        }
        let scan_cost = documents_read as f64;
        let indexed_cost =
            result_size as f64 * self.params.relative_index_read_cost_per_document;
        if scan_cost <= indexed_cost {
            return;
        }

        log::debug!(
            "creating index for query {} (scanned {documents_read}, matched {result_size})",
            query.canonical_id()
        );
        index_manager.create_target_indexes(query);
        // Seed the new index with what the scan already materialized; later
        // document changes keep it current.
        let seed: BTreeMap<DocumentKey, MutableDocument> = results
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect();
        index_manager.update_index_entries(&seed);
    }

    fn sort_and_limit(
        query: &Query,
        documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> Vec<MutableDocument> {
        let mut results: Vec<MutableDocument> = documents.into_values().collect();
        results.sort_by(|left, right| query.compare_documents(left, right));
        if let Some(limit) = query.limit() {
            if results.len() > limit {
                match query.limit_type() {
                    LimitType::First => results.truncate(limit),
                    LimitType::Last => {
                        let start = results.len() - limit;
                        results.drain(0..start);
                    }
                }
            }
        }
        results
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(QueryEngineParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, FieldFilter, FilterOperator, OrderBy};
    use crate::model::{FieldPath, FieldValue, ObjectValue, ResourcePath};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn room(id: &str, size: i64) -> MutableDocument {
        let mut map = BTreeMap::new();
        map.insert("size".to_string(), FieldValue::from_integer(size));
        MutableDocument::new_found(
            key(&format!("rooms/{id}")),
            Timestamp::new(1, 0),
            ObjectValue::new(map),
        )
    }

    struct Fixture {
        engine: QueryEngine,
        index_manager: IndexManager,
        remote: RemoteDocumentCache,
        overlays: DocumentOverlayCache,
    }

    impl Fixture {
        fn new(params: QueryEngineParams) -> Self {
            Self {
                engine: QueryEngine::new(params),
                index_manager: IndexManager::new(),
                remote: RemoteDocumentCache::new(),
                overlays: DocumentOverlayCache::new(),
            }
        }

        fn run(&mut self, query: &Query) -> Vec<MutableDocument> {
            self.engine
                .get_documents_matching_query(
                    &mut self.index_manager,
                    &self.remote,
                    &self.overlays,
                    query,
                    Timestamp::new(1, 0),
                    &BTreeSet::new(),
                )
                .unwrap()
        }
    }

    #[test]
    fn document_lookup_short_circuits() {
        let mut fx = Fixture::new(QueryEngineParams::default());
        fx.remote.add(room("eros", 3));
        let query = Query::collection(ResourcePath::from_string("rooms/eros").unwrap());
        let results = fx.run(&query);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key(), &key("rooms/eros"));
    }

    #[test]
    fn scan_orders_and_limits_deterministically() {
        let mut fx = Fixture::new(QueryEngineParams::default());
        fx.remote.add(room("a", 3));
        fx.remote.add(room("b", 1));
        fx.remote.add(room("c", 1));
        fx.remote.add(room("d", 2));

        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::new(field("size"), Direction::Ascending))
            .with_limit(3, LimitType::First);
        let results = fx.run(&query);
        let ids: Vec<_> = results.iter().map(|d| d.key().id().to_string()).collect();
        // Equal sizes tie-break by key.
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn heuristic_creates_index_after_expensive_scan() {
        let mut fx = Fixture::new(QueryEngineParams {
            index_auto_creation_min_collection_size: 10,
            relative_index_read_cost_per_document: 2.0,
            index_auto_creation_enabled: true,
        });
        for i in 0..50 {
            fx.remote.add(room(&format!("r{i:02}"), i % 10));
        }
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).with_filter(
            FieldFilter::new(
                field("size"),
                FilterOperator::Equal,
                FieldValue::from_integer(9),
            ),
        );

        assert_eq!(fx.index_manager.get_index_type(&query), IndexType::None);
        let scanned = fx.run(&query);
        assert_eq!(scanned.len(), 5);
        // 50 reads against 5 matches at factor 2 crosses the threshold.
        assert_eq!(fx.index_manager.get_index_type(&query), IndexType::Full);

        let indexed = fx.run(&query);
        assert_eq!(indexed.len(), 5);
        assert_eq!(scanned, indexed);
    }

    #[test]
    fn cheap_scans_do_not_create_indexes() {
        let mut fx = Fixture::new(QueryEngineParams::default());
        for i in 0..5 {
            fx.remote.add(room(&format!("r{i}"), i));
        }
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).with_filter(
            FieldFilter::new(
                field("size"),
                FilterOperator::GreaterThanOrEqual,
                FieldValue::from_integer(0),
            ),
        );
        fx.run(&query);
        assert_eq!(fx.index_manager.get_index_type(&query), IndexType::None);
    }
}
