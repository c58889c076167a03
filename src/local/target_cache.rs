use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::core::query::Query;
use crate::model::{DocumentKey, Timestamp};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    /// An ordinary client-issued listen.
    Listen,
    /// Re-listen after an existence-filter mismatch; resumes without a token
    /// so the backend replays the full result set.
    ExistenceFilterMismatch,
    /// Single-document listen resolving a limbo document.
    LimboResolution,
}

/// Server-tracked subscription state for one query.
#[derive(Clone, Debug)]
pub struct TargetData {
    query: Query,
    target_id: i32,
    sequence_number: u64,
    purpose: TargetPurpose,
    snapshot_version: Timestamp,
    /// Version through which the target's results are known to contain no
    /// limbo documents; queries below this version must not trust cached
    /// limit results.
    last_limbo_free_snapshot_version: Timestamp,
    resume_token: Bytes,
}

impl TargetData {
    pub fn new(query: Query, target_id: i32, sequence_number: u64, purpose: TargetPurpose) -> Self {
        Self {
            query,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: Timestamp::zero(),
            last_limbo_free_snapshot_version: Timestamp::zero(),
            resume_token: Bytes::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn purpose(&self) -> TargetPurpose {
        self.purpose
    }

    pub fn snapshot_version(&self) -> Timestamp {
        self.snapshot_version
    }

    pub fn last_limbo_free_snapshot_version(&self) -> Timestamp {
        self.last_limbo_free_snapshot_version
    }

    pub fn resume_token(&self) -> &Bytes {
        &self.resume_token
    }

    pub fn with_sequence_number(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_resume_token(mut self, resume_token: Bytes, snapshot_version: Timestamp) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: Timestamp) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

/// Two-way index between document keys and the targets referencing them.
#[derive(Default)]
pub struct ReferenceSet {
    targets_by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    keys_by_target: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn add_reference(&mut self, key: DocumentKey, target_id: i32) {
        self.targets_by_key
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.keys_by_target
            .entry(target_id)
            .or_default()
            .insert(key);
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, target_id: i32) {
        if let Some(targets) = self.targets_by_key.get_mut(key) {
            targets.remove(&target_id);
            if targets.is_empty() {
                self.targets_by_key.remove(key);
            }
        }
        if let Some(keys) = self.keys_by_target.get_mut(&target_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.keys_by_target.remove(&target_id);
            }
        }
    }

    pub fn remove_references_for_target(&mut self, target_id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.keys_by_target.remove(&target_id).unwrap_or_default();
        for key in &keys {
            if let Some(targets) = self.targets_by_key.get_mut(key) {
                targets.remove(&target_id);
                if targets.is_empty() {
                    self.targets_by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn references_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.keys_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.targets_by_key.contains_key(key)
    }
}

/// Tracks which queries are being watched, their resume state, and the
/// key↔target reference index used by view updates and garbage collection.
pub struct TargetCache {
    targets: BTreeMap<i32, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, i32>,
    references: ReferenceSet,
    highest_sequence_number: u64,
    last_remote_snapshot_version: Timestamp,
}

impl TargetCache {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            target_ids_by_canonical_id: BTreeMap::new(),
            references: ReferenceSet::default(),
            highest_sequence_number: 0,
            last_remote_snapshot_version: Timestamp::zero(),
        }
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number());
        self.target_ids_by_canonical_id
            .insert(target_data.query().canonical_id(), target_data.target_id());
        self.targets
            .insert(target_data.target_id(), target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.add_target_data(target_data);
    }

    pub fn remove_target_data(&mut self, target_id: i32) -> Option<TargetData> {
        let removed = self.targets.remove(&target_id);
        if let Some(target_data) = &removed {
            self.target_ids_by_canonical_id
                .remove(&target_data.query().canonical_id());
        }
        self.references.remove_references_for_target(target_id);
        removed
    }

    pub fn get_target_data(&self, target_id: i32) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    /// Looks an active target up by query identity; every target id maps to
    /// exactly one target at a time.
    pub fn get_target_data_for_query(&self, query: &Query) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&query.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
    }

    pub fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) {
        for key in keys {
            self.references.add_reference(key.clone(), target_id);
        }
    }

    pub fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) {
        for key in keys {
            self.references.remove_reference(key, target_id);
        }
    }

    pub fn matching_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.references.references_for_target(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn highest_sequence_number(&self) -> u64 {
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> Timestamp {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: Timestamp) {
        self.last_remote_snapshot_version = version;
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.targets
            .values()
            .map(|t| t.query().canonical_id().len() + t.resume_token().len() + 32)
            .sum()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
        self.target_ids_by_canonical_id.clear();
        self.references = ReferenceSet::default();
        self.last_remote_snapshot_version = Timestamp::zero();
    }
}

impl Default for TargetCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourcePath;

    fn rooms_query() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn lookup_by_query_identity() {
        let mut cache = TargetCache::new();
        cache.add_target_data(TargetData::new(rooms_query(), 2, 1, TargetPurpose::Listen));

        let found = cache.get_target_data_for_query(&rooms_query()).unwrap();
        assert_eq!(found.target_id(), 2);
        assert!(cache
            .get_target_data_for_query(&Query::collection_group("rooms"))
            .is_none());
    }

    #[test]
    fn reference_index_tracks_membership() {
        let mut cache = TargetCache::new();
        cache.add_target_data(TargetData::new(rooms_query(), 2, 1, TargetPurpose::Listen));
        let keys: BTreeSet<_> = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.add_matching_keys(&keys, 2);

        assert!(cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.matching_keys_for_target(2).len(), 2);

        cache.remove_target_data(2);
        assert!(!cache.contains_key(&key("rooms/a")));
    }

    #[test]
    fn highest_sequence_number_tracks_updates() {
        let mut cache = TargetCache::new();
        cache.add_target_data(TargetData::new(rooms_query(), 2, 7, TargetPurpose::Listen));
        assert_eq!(cache.highest_sequence_number(), 7);
    }
}
