use std::collections::BTreeSet;

use crate::core::query::Query;
use crate::core::view_snapshot::{DocumentChangeType, DocumentViewChange, ViewSnapshot};
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::online_state::OnlineState;
use crate::remote::remote_event::TargetChange;

/// Limbo membership delta produced by a view update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Tracks one query's materialized result set between snapshots.
///
/// The sync engine feeds it freshly executed query results plus the target
/// change from each remote event; the view diffs them against its previous
/// state, maintains the server-confirmed key set, decides `from_cache`, and
/// reports documents that have entered or left limbo.
pub struct View {
    query: Query,
    target_id: i32,
    documents: Vec<MutableDocument>,
    /// Keys the server has confirmed as members of this target.
    synced_documents: BTreeSet<DocumentKey>,
    /// Keys currently being resolved as limbo documents.
    limbo_documents: BTreeSet<DocumentKey>,
    current: bool,
    /// Last sync state communicated to listeners (true = from cache).
    previous_from_cache: Option<bool>,
    has_emitted: bool,
}

impl View {
    pub fn new(query: Query, target_id: i32, remote_keys: BTreeSet<DocumentKey>) -> Self {
        Self {
            query,
            target_id,
            documents: Vec::new(),
            synced_documents: remote_keys,
            limbo_documents: BTreeSet::new(),
            current: false,
            previous_from_cache: None,
            has_emitted: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    /// Applies a freshly computed result set and the optional target change
    /// from the triggering remote event.
    pub fn update(
        &mut self,
        new_documents: Vec<MutableDocument>,
        target_change: Option<&TargetChange>,
        online_state: OnlineState,
    ) -> ViewChange {
        if let Some(change) = target_change {
            for key in &change.removed_documents {
                self.synced_documents.remove(key);
            }
            for key in change
                .added_documents
                .iter()
                .chain(change.modified_documents.iter())
            {
                self.synced_documents.insert(key.clone());
            }
            if change.current {
                self.current = true;
            }
        }
        if online_state == OnlineState::Offline {
            // Offline invalidates "current": snapshots revert to cache until
            // the stream recovers.
            self.current = false;
        }

        let doc_changes = self.diff(&new_documents);
        self.documents = new_documents;

        let limbo_changes = self.update_limbo_documents();
        let from_cache = !self.current || !self.limbo_documents.is_empty();
        let sync_state_changed = self.previous_from_cache != Some(from_cache);
        let has_pending_writes = self
            .documents
            .iter()
            .any(MutableDocument::has_local_mutations);

        let snapshot = if !doc_changes.is_empty() || sync_state_changed || !self.has_emitted {
            self.previous_from_cache = Some(from_cache);
            self.has_emitted = true;
            Some(ViewSnapshot::new(
                self.query.clone(),
                self.documents.clone(),
                doc_changes,
                from_cache,
                has_pending_writes,
                sync_state_changed,
            ))
        } else {
            None
        };

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        self.update(self.documents.clone(), None, online_state)
    }

    /// Clears server-confirmed state after an existence-filter mismatch; the
    /// re-listen rebuilds it from scratch.
    pub fn handle_target_mismatch(&mut self) {
        self.synced_documents.clear();
        self.current = false;
    }

    fn diff(&self, new_documents: &[MutableDocument]) -> Vec<DocumentViewChange> {
        let mut changes = Vec::new();
        let new_keys: BTreeSet<&DocumentKey> =
            new_documents.iter().map(MutableDocument::key).collect();

        for old in &self.documents {
            if !new_keys.contains(old.key()) {
                changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Removed,
                    document: old.clone(),
                });
            }
        }
        for new in new_documents {
            match self.documents.iter().find(|old| old.key() == new.key()) {
                None => changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Added,
                    document: new.clone(),
                }),
                Some(old) if old != new => changes.push(DocumentViewChange {
                    change_type: DocumentChangeType::Modified,
                    document: new.clone(),
                }),
                Some(_) => {}
            }
        }
        changes
    }

    /// A document is in limbo when the view is current, the document shows
    /// up locally, the server has not confirmed it for this target, and no
    /// pending local write explains its presence.
    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let mut candidates = BTreeSet::new();
        for document in &self.documents {
            if document.has_local_mutations() {
                continue;
            }
            if !self.synced_documents.contains(document.key()) {
                candidates.insert(document.key().clone());
            }
        }

        let mut changes = Vec::new();
        for key in self.limbo_documents.difference(&candidates) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        for key in candidates.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        self.limbo_documents = candidates;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectValue, ResourcePath, Timestamp};
    use bytes::Bytes;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found(key(path), Timestamp::new(version, 0), ObjectValue::empty())
    }

    fn local_doc(path: &str) -> MutableDocument {
        let mut document = doc(path, 0);
        document.set_has_local_mutations();
        document
    }

    fn rooms_view() -> View {
        View::new(
            Query::collection(ResourcePath::from_string("rooms").unwrap()),
            2,
            BTreeSet::new(),
        )
    }

    fn current_change(keys: &[&str]) -> TargetChange {
        let mut change = TargetChange {
            current: true,
            resume_token: Bytes::from_static(b"t"),
            ..TargetChange::default()
        };
        for k in keys {
            change.added_documents.insert(key(k));
        }
        change
    }

    #[test]
    fn initial_snapshot_is_from_cache() {
        let mut view = rooms_view();
        let change = view.update(vec![doc("rooms/a", 1)], None, OnlineState::Unknown);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache());
        assert_eq!(snapshot.doc_changes().len(), 1);
    }

    #[test]
    fn current_target_change_clears_from_cache() {
        let mut view = rooms_view();
        view.update(vec![doc("rooms/a", 1)], None, OnlineState::Online);
        let change = view.update(
            vec![doc("rooms/a", 1)],
            Some(&current_change(&["rooms/a"])),
            OnlineState::Online,
        );
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache());
        assert!(snapshot.sync_state_changed());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn unconfirmed_document_enters_limbo_when_current() {
        let mut view = rooms_view();
        view.update(
            vec![doc("rooms/a", 1), doc("rooms/b", 1)],
            Some(&current_change(&["rooms/a"])),
            OnlineState::Online,
        );
        // rooms/b is shown locally but the server never confirmed it.
        let change = view.update(
            vec![doc("rooms/a", 1), doc("rooms/b", 1)],
            None,
            OnlineState::Online,
        );
        assert!(change
            .limbo_changes
            .iter()
            .all(|c| matches!(c, LimboDocumentChange::Added(k) if k == &key("rooms/b"))
                || matches!(c, LimboDocumentChange::Removed(_))));
        assert!(view.limbo_documents.contains(&key("rooms/b")));
    }

    #[test]
    fn locally_mutated_documents_are_not_limbo() {
        let mut view = rooms_view();
        let change = view.update(
            vec![local_doc("rooms/mine")],
            Some(&current_change(&[])),
            OnlineState::Online,
        );
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.has_pending_writes());
    }

    #[test]
    fn going_offline_reverts_to_cache() {
        let mut view = rooms_view();
        view.update(
            vec![doc("rooms/a", 1)],
            Some(&current_change(&["rooms/a"])),
            OnlineState::Online,
        );
        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache());
        assert!(snapshot.sync_state_changed());
    }

    #[test]
    fn no_snapshot_when_nothing_changed() {
        let mut view = rooms_view();
        view.update(vec![doc("rooms/a", 1)], None, OnlineState::Unknown);
        let change = view.update(vec![doc("rooms/a", 1)], None, OnlineState::Unknown);
        assert!(change.snapshot.is_none());
    }
}
