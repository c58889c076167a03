use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument, ResourcePath};

/// Cache of the last known server-confirmed state of documents.
///
/// Only LocalStore mutates this map, inside a transaction scope. Entries are
/// full `MutableDocument`s so no-documents (confirmed deletes) are cached
/// alongside found documents.
#[derive(Default)]
pub struct RemoteDocumentCache {
    documents: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, document: MutableDocument) {
        self.documents.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        self.documents.remove(key);
    }

    /// Returns the cached entry, or an invalid document when nothing is
    /// known about the key.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn get_all(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    /// All cached documents that are direct children of `collection`.
    pub fn get_all_from_collection(
        &self,
        collection: &ResourcePath,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.documents
            .iter()
            .filter(|(key, _)| &key.collection_path() == collection)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// All cached documents belonging to the named collection group at any
    /// depth.
    pub fn get_all_from_collection_group(
        &self,
        collection_id: &str,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.documents
            .iter()
            .filter(|(key, _)| key.collection_group() == collection_id)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.documents
            .values()
            .map(MutableDocument::approximate_byte_size)
            .sum()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }
}
