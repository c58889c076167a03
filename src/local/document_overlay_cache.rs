use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, Mutation, ResourcePath};

/// Memoized net local mutation for one document key.
///
/// Overlays are a cache over the mutation queue, never a source of truth:
/// they are always derivable by replaying the queued batches for the key.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

#[derive(Default)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| self.overlays.get(key).map(|o| (key.clone(), o.clone())))
            .collect()
    }

    /// Stores the recomputed overlays for a batch. A `None` entry clears the
    /// overlay for that key (the local view carries no net change).
    pub fn save_overlays(
        &mut self,
        largest_batch_id: i32,
        overlays: BTreeMap<DocumentKey, Option<Mutation>>,
    ) {
        for (key, mutation) in overlays {
            self.remove_key(&key);
            if let Some(mutation) = mutation {
                self.overlays
                    .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
                self.keys_by_batch_id
                    .entry(largest_batch_id)
                    .or_default()
                    .insert(key);
            }
        }
    }

    /// Drops every overlay whose largest contributing batch is `batch_id`
    /// and returns the affected keys so the caller can recompute them.
    pub fn remove_overlays_for_batch_id(&mut self, batch_id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.keys_by_batch_id.remove(&batch_id).unwrap_or_default();
        for key in &keys {
            self.overlays.remove(key);
        }
        keys
    }

    /// Overlays for keys in `collection` whose largest batch id is greater
    /// than `since_batch_id`. Feeds documents that only exist locally into
    /// collection scans.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                overlay.largest_batch_id > since_batch_id
                    && &key.collection_path() == collection
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn get_overlays_for_collection_group(
        &self,
        collection_id: &str,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                overlay.largest_batch_id > since_batch_id
                    && key.collection_group() == collection_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn remove_key(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.remove(key) {
            if let Some(keys) = self.keys_by_batch_id.get_mut(&existing.largest_batch_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch_id.remove(&existing.largest_batch_id);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.overlays.clear();
        self.keys_by_batch_id.clear();
    }
}
