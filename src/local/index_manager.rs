use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::core::query::{FilterOperator, Query};
use crate::model::{DocumentKey, FieldPath, FieldValue, MutableDocument};

/// How well the available indexes serve a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No usable index; the query engine must scan the collection.
    None,
    /// Indexes narrow the candidate set but cannot serve the query alone;
    /// candidates must be re-filtered in memory.
    Partial,
    /// Every constrained field is indexed; candidates only need the residual
    /// bound/limit checks.
    Full,
}

/// Orderable wrapper so field values can key the index maps.
#[derive(Clone, Debug)]
struct IndexValue(FieldValue);

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.compare(&other.0) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.compare(&other.0)
    }
}

/// Single-field ascending value index over one collection group.
#[derive(Default)]
struct FieldIndexState {
    entries: BTreeMap<IndexValue, BTreeSet<DocumentKey>>,
    value_by_key: BTreeMap<DocumentKey, IndexValue>,
}

impl FieldIndexState {
    fn remove_key(&mut self, key: &DocumentKey) {
        if let Some(old_value) = self.value_by_key.remove(key) {
            if let Some(keys) = self.entries.get_mut(&old_value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&old_value);
                }
            }
        }
    }

    fn add_entry(&mut self, key: DocumentKey, value: FieldValue) {
        self.remove_key(&key);
        let value = IndexValue(value);
        self.entries
            .entry(value.clone())
            .or_default()
            .insert(key.clone());
        self.value_by_key.insert(key, value);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexId {
    collection_id: String,
    field: FieldPath,
}

/// Maintains client-side field indexes and answers which queries they can
/// accelerate.
///
/// Indexes are created on demand by the query engine's self-tuning heuristic
/// rather than declared up front, and are kept current by LocalStore as
/// documents change.
#[derive(Default)]
pub struct IndexManager {
    indexes: BTreeMap<IndexId, FieldIndexState>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field_index(&mut self, collection_id: impl Into<String>, field: FieldPath) {
        let id = IndexId {
            collection_id: collection_id.into(),
            field,
        };
        self.indexes.entry(id).or_default();
    }

    pub fn has_index(&self, collection_id: &str, field: &FieldPath) -> bool {
        self.indexes.contains_key(&IndexId {
            collection_id: collection_id.to_string(),
            field: field.clone(),
        })
    }

    /// Creates indexes for every field the query constrains.
    pub fn create_target_indexes(&mut self, query: &Query) {
        let Some(collection_id) = query.collection_id() else {
            return;
        };
        let collection_id = collection_id.to_string();
        for field in query.indexed_fields() {
            self.add_field_index(collection_id.clone(), field);
        }
    }

    pub fn get_index_type(&self, query: &Query) -> IndexType {
        let Some(collection_id) = query.collection_id() else {
            return IndexType::None;
        };
        let fields = query.indexed_fields();
        if fields.is_empty() {
            return IndexType::None;
        }
        let indexed = fields
            .iter()
            .filter(|field| self.has_index(collection_id, field))
            .count();
        if indexed == 0 {
            IndexType::None
        } else if indexed == fields.len() {
            IndexType::Full
        } else {
            IndexType::Partial
        }
    }

    /// Re-indexes the given documents across every index on their
    /// collection. No-documents are removed from the indexes.
    pub fn update_index_entries(&mut self, documents: &BTreeMap<DocumentKey, MutableDocument>) {
        for (key, document) in documents {
            let collection_id = key.collection_group().to_string();
            for (id, state) in self.indexes.iter_mut() {
                if id.collection_id != collection_id {
                    continue;
                }
                match document
                    .is_found_document()
                    .then(|| document.data().field(&id.field))
                    .flatten()
                {
                    Some(value) => state.add_entry(key.clone(), value.clone()),
                    None => state.remove_key(key),
                }
            }
        }
    }

    /// Candidate keys for the query, intersected across all usable indexed
    /// filters. Returns `None` when no index narrowed the candidates.
    pub fn get_candidate_keys(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        let collection_id = query.collection_id()?;
        let mut candidates: Option<BTreeSet<DocumentKey>> = None;

        for filter in query.filters() {
            let id = IndexId {
                collection_id: collection_id.to_string(),
                field: filter.field().clone(),
            };
            let Some(state) = self.indexes.get(&id) else {
                continue;
            };
            let Some(matches) = Self::keys_for_filter(state, filter.op(), filter.value()) else {
                continue;
            };
            candidates = Some(match candidates {
                None => matches,
                Some(existing) => existing.intersection(&matches).cloned().collect(),
            });
        }

        candidates
    }

    fn keys_for_filter(
        state: &FieldIndexState,
        op: FilterOperator,
        value: &FieldValue,
    ) -> Option<BTreeSet<DocumentKey>> {
        let value = IndexValue(value.clone());
        let collect = |range: Box<dyn Iterator<Item = &BTreeSet<DocumentKey>> + '_>| {
            range.flat_map(|keys| keys.iter().cloned()).collect()
        };
        match op {
            FilterOperator::Equal => Some(
                state
                    .entries
                    .get(&value)
                    .cloned()
                    .unwrap_or_default(),
            ),
            FilterOperator::LessThan => Some(collect(Box::new(
                state
                    .entries
                    .range((Bound::Unbounded, Bound::Excluded(value)))
                    .map(|(_, keys)| keys),
            ))),
            FilterOperator::LessThanOrEqual => Some(collect(Box::new(
                state
                    .entries
                    .range((Bound::Unbounded, Bound::Included(value)))
                    .map(|(_, keys)| keys),
            ))),
            FilterOperator::GreaterThan => Some(collect(Box::new(
                state
                    .entries
                    .range((Bound::Excluded(value), Bound::Unbounded))
                    .map(|(_, keys)| keys),
            ))),
            FilterOperator::GreaterThanOrEqual => Some(collect(Box::new(
                state
                    .entries
                    .range((Bound::Included(value), Bound::Unbounded))
                    .map(|(_, keys)| keys),
            ))),
            // Membership and negation operators are not served by the
            // single-field value index.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::FieldFilter;
    use crate::model::{ObjectValue, ResourcePath, Timestamp};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn doc(path: &str, size: i64) -> (DocumentKey, MutableDocument) {
        let mut map = BTreeMap::new();
        map.insert("size".to_string(), FieldValue::from_integer(size));
        (
            key(path),
            MutableDocument::new_found(key(path), Timestamp::new(1, 0), ObjectValue::new(map)),
        )
    }

    fn size_query(op: FilterOperator, value: i64) -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).with_filter(
            FieldFilter::new(field("size"), op, FieldValue::from_integer(value)),
        )
    }

    fn manager_with_docs() -> IndexManager {
        let mut manager = IndexManager::new();
        manager.add_field_index("rooms", field("size"));
        let documents: BTreeMap<_, _> = [
            doc("rooms/a", 1),
            doc("rooms/b", 5),
            doc("rooms/c", 10),
        ]
        .into_iter()
        .collect();
        manager.update_index_entries(&documents);
        manager
    }

    #[test]
    fn reports_index_type() {
        let manager = manager_with_docs();
        assert_eq!(
            manager.get_index_type(&size_query(FilterOperator::Equal, 5)),
            IndexType::Full
        );
        let unindexed = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(
                field("owner"),
                FilterOperator::Equal,
                FieldValue::from_string("x"),
            ));
        assert_eq!(manager.get_index_type(&unindexed), IndexType::None);
    }

    #[test]
    fn equality_and_range_candidates() {
        let manager = manager_with_docs();
        let eq = manager
            .get_candidate_keys(&size_query(FilterOperator::Equal, 5))
            .unwrap();
        assert_eq!(eq, [key("rooms/b")].into_iter().collect());

        let gt = manager
            .get_candidate_keys(&size_query(FilterOperator::GreaterThan, 1))
            .unwrap();
        assert_eq!(gt.len(), 2);
    }

    #[test]
    fn updates_replace_stale_entries() {
        let mut manager = manager_with_docs();
        let documents: BTreeMap<_, _> = [doc("rooms/b", 100)].into_iter().collect();
        manager.update_index_entries(&documents);

        let eq = manager
            .get_candidate_keys(&size_query(FilterOperator::Equal, 5))
            .unwrap();
        assert!(eq.is_empty());
        let moved = manager
            .get_candidate_keys(&size_query(FilterOperator::Equal, 100))
            .unwrap();
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn deleted_documents_leave_the_index() {
        let mut manager = manager_with_docs();
        let documents: BTreeMap<_, _> = [(
            key("rooms/b"),
            MutableDocument::new_no_document(key("rooms/b"), Timestamp::new(2, 0)),
        )]
        .into_iter()
        .collect();
        manager.update_index_entries(&documents);
        let eq = manager
            .get_candidate_keys(&size_query(FilterOperator::Equal, 5))
            .unwrap();
        assert!(eq.is_empty());
    }

    #[test]
    fn create_target_indexes_enables_full_serving() {
        let mut manager = IndexManager::new();
        let query = size_query(FilterOperator::GreaterThan, 0);
        assert_eq!(manager.get_index_type(&query), IndexType::None);
        manager.create_target_indexes(&query);
        assert_eq!(manager.get_index_type(&query), IndexType::Full);
    }
}
