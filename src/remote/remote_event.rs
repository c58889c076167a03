use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::model::{DocumentKey, MutableDocument, Timestamp};

/// Aggregated result of a batch of watch responses, ready to be applied to
/// the local store in one transaction.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    /// Snapshot version the event is consistent at.
    pub snapshot_version: Timestamp,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose local state proved inconsistent (existence-filter
    /// mismatch); they must be re-listened from scratch.
    pub target_mismatches: BTreeSet<i32>,
    /// Upserts and confirmed deletes keyed by document.
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Limbo documents the event authoritatively resolved.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta within a remote event.
#[derive(Debug, Clone, Default)]
pub struct TargetChange {
    pub resume_token: Bytes,
    /// The server reported the target caught up to the snapshot version.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}
