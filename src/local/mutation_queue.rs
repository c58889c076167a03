use std::collections::{BTreeSet, VecDeque};

use crate::error::{internal_error, FirestoreResult};
use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp};

/// Ordered log of locally-created writes awaiting acknowledgement.
///
/// Batches are appended in commit order and never reordered. Because write
/// acknowledgement is FIFO per connection, removal only ever happens at the
/// front of the queue. Precondition violations are detected when a batch is
/// applied, never at enqueue time: enqueue always succeeds locally.
#[derive(Default)]
pub struct MutationQueue {
    next_batch_id: i32,
    batches: VecDeque<MutationBatch>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            next_batch_id: 1,
            batches: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Assigns the next batch id and appends the batch.
    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("mutation batches must not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        self.batches.push_back(batch.clone());
        Ok(batch)
    }

    /// Removes an acknowledged or rejected batch. The batch must be the
    /// oldest remaining one.
    pub fn remove_mutation_batch(&mut self, batch_id: i32) -> FirestoreResult<MutationBatch> {
        match self.batches.front() {
            Some(front) if front.batch_id == batch_id => {
                Ok(self.batches.pop_front().expect("front checked above"))
            }
            Some(front) => Err(internal_error(format!(
                "can only remove the oldest batch (requested {batch_id}, oldest {})",
                front.batch_id
            ))),
            None => Err(internal_error(format!(
                "cannot remove batch {batch_id} from an empty queue"
            ))),
        }
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        self.batches
            .iter()
            .find(|batch| batch.batch_id == batch_id)
    }

    /// First batch with id strictly greater than `batch_id` (`None` starts
    /// from the beginning). Drives the write pipeline in batch order.
    pub fn next_mutation_batch_after_batch_id(
        &self,
        batch_id: Option<i32>,
    ) -> Option<&MutationBatch> {
        match batch_id {
            None => self.batches.front(),
            Some(id) => self.batches.iter().find(|batch| batch.batch_id > id),
        }
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<&MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| m.key() == key))
            .collect()
    }

    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<&MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .collect()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> Option<i32> {
        self.batches.back().map(|batch| batch.batch_id)
    }

    /// Whether any queued batch still references `key`. Pinned documents are
    /// exempt from garbage collection.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches
            .iter()
            .any(|batch| batch.mutations.iter().any(|m| m.key() == key))
    }

    pub fn batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.iter()
    }

    pub fn clear(&mut self) -> Vec<MutationBatch> {
        self.batches.drain(..).collect()
    }
}
