use crate::core::query::Query;
use crate::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub change_type: DocumentChangeType,
    pub document: MutableDocument,
}

/// What a listener receives: the query's current ordered result set plus the
/// per-document deltas since the previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    query: Query,
    documents: Vec<MutableDocument>,
    doc_changes: Vec<DocumentViewChange>,
    from_cache: bool,
    has_pending_writes: bool,
    sync_state_changed: bool,
}

impl ViewSnapshot {
    pub fn new(
        query: Query,
        documents: Vec<MutableDocument>,
        doc_changes: Vec<DocumentViewChange>,
        from_cache: bool,
        has_pending_writes: bool,
        sync_state_changed: bool,
    ) -> Self {
        Self {
            query,
            documents,
            doc_changes,
            from_cache,
            has_pending_writes,
            sync_state_changed,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[MutableDocument] {
        &self.documents
    }

    pub fn doc_changes(&self) -> &[DocumentViewChange] {
        &self.doc_changes
    }

    /// `true` while the snapshot may lag the backend (not yet current, or
    /// the client is offline).
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }

    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.iter().map(MutableDocument::key)
    }
}
