use bytes::Bytes;

use crate::error::FirestoreError;
use crate::model::{DocumentKey, ObjectValue, Timestamp};
use crate::remote::bloom_filter::BloomFilter;

/// One decoded message from the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Affected targets; empty means "all active targets".
    pub target_ids: Vec<i32>,
    pub resume_token: Bytes,
    pub read_time: Option<Timestamp>,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    /// `None` when the change only removes the document from targets.
    pub new_document: Option<WatchDocument>,
}

#[derive(Debug, Clone)]
pub struct WatchDocument {
    pub key: DocumentKey,
    pub fields: ObjectValue,
    pub update_time: Timestamp,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Option<Timestamp>,
    pub removed_target_ids: Vec<i32>,
}

/// Server-side summary of a target's result set, used to detect deletes the
/// stream silently dropped.
#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    /// Number of documents the backend believes match the target.
    pub count: i32,
    /// Optional probabilistic membership summary enabling repair without a
    /// full re-listen.
    pub unchanged_names: Option<BloomFilter>,
}
