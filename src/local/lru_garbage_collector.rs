use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::time::Duration;

use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::model::DocumentKey;

#[derive(Clone, Copy, Debug)]
pub struct LruParams {
    /// Collection is skipped entirely while the caches stay below this size.
    /// Collection is a relaxation, never required for correctness.
    pub cache_size_collection_threshold_bytes: usize,
    /// Percentile of sequence numbers to collect per run.
    pub percentile_to_collect: usize,
    /// Upper bound on sequence numbers considered in one run, keeping a
    /// single pass cheap on very large caches.
    pub maximum_sequence_numbers_to_collect: usize,
    /// Interval between opportunistic runs.
    pub gc_interval: Duration,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold_bytes: 1024 * 1024,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
            gc_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Keeps the `max_elements` smallest sequence numbers seen so far.
///
/// An order-statistics selection over a bounded buffer: the largest retained
/// value is the Nth-percentile cutoff without sorting the full population.
struct RollingSequenceNumberBuffer {
    max_elements: usize,
    heap: BinaryHeap<u64>,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            max_elements,
            heap: BinaryHeap::with_capacity(max_elements + 1),
        }
    }

    fn add(&mut self, sequence_number: u64) {
        if self.heap.len() < self.max_elements {
            self.heap.push(sequence_number);
        } else if let Some(&largest) = self.heap.peek() {
            if sequence_number < largest {
                self.heap.pop();
                self.heap.push(sequence_number);
            }
        }
    }

    fn max_value(&self) -> Option<u64> {
        self.heap.peek().copied()
    }
}

/// Evicts least-recently-used targets and orphaned documents.
///
/// Invariant: nothing referenced by an active target, a pending mutation, or
/// a sequence number newer than the cutoff is ever evicted.
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    pub fn should_run(&self, cache_size_bytes: usize) -> bool {
        cache_size_bytes >= self.params.cache_size_collection_threshold_bytes
    }

    /// Runs one collection pass.
    ///
    /// `orphaned_documents` maps keys no longer referenced by any target to
    /// the sequence number at which they became orphaned; entries that are
    /// evicted (or re-referenced) are removed from it.
    pub fn collect(
        &self,
        target_cache: &mut TargetCache,
        remote_documents: &mut RemoteDocumentCache,
        mutation_queue: &MutationQueue,
        orphaned_documents: &mut BTreeMap<DocumentKey, u64>,
        active_target_ids: &BTreeSet<i32>,
    ) -> LruResults {
        let population = target_cache.target_count() + orphaned_documents.len();
        let to_collect = (population * self.params.percentile_to_collect / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        if to_collect == 0 {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        }

        let mut buffer = RollingSequenceNumberBuffer::new(to_collect);
        for target in target_cache.targets() {
            buffer.add(target.sequence_number());
        }
        for sequence_number in orphaned_documents.values() {
            buffer.add(*sequence_number);
        }
        let Some(upper_bound) = buffer.max_value() else {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        };

        let stale_targets: Vec<i32> = target_cache
            .targets()
            .filter(|target| {
                target.sequence_number() <= upper_bound
                    && !active_target_ids.contains(&target.target_id())
            })
            .map(|target| target.target_id())
            .collect();
        for target_id in &stale_targets {
            let released = target_cache.matching_keys_for_target(*target_id);
            target_cache.remove_target_data(*target_id);
            // Documents released by an evicted target become orphan
            // candidates at the cutoff sequence number.
            for key in released {
                if !target_cache.contains_key(&key) {
                    orphaned_documents.entry(key).or_insert(upper_bound);
                }
            }
        }

        let evictable: Vec<DocumentKey> = orphaned_documents
            .iter()
            .filter(|(key, sequence_number)| {
                **sequence_number <= upper_bound
                    && !target_cache.contains_key(key)
                    && !mutation_queue.contains_key(key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &evictable {
            remote_documents.remove(key);
            orphaned_documents.remove(key);
        }

        let results = LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed: stale_targets.len(),
            documents_removed: evictable.len(),
        };
        log::debug!(
            "LRU collection removed {} targets and {} documents (cutoff {upper_bound})",
            results.targets_removed,
            results.documents_removed
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::local::target_cache::{TargetData, TargetPurpose};
    use crate::model::{Mutation, ObjectValue, ResourcePath, Timestamp};
    use crate::model::MutableDocument;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn query(path: &str) -> Query {
        Query::collection(ResourcePath::from_string(path).unwrap())
    }

    fn collector() -> LruGarbageCollector {
        LruGarbageCollector::new(LruParams {
            percentile_to_collect: 100,
            ..LruParams::default()
        })
    }

    #[test]
    fn skips_below_size_threshold() {
        let gc = LruGarbageCollector::new(LruParams::default());
        assert!(!gc.should_run(10));
        assert!(gc.should_run(LruParams::default().cache_size_collection_threshold_bytes));
    }

    #[test]
    fn active_targets_survive() {
        let gc = collector();
        let mut targets = TargetCache::new();
        let mut documents = RemoteDocumentCache::new();
        let queue = MutationQueue::new();
        let mut orphaned = BTreeMap::new();

        targets.add_target_data(TargetData::new(query("rooms"), 2, 1, TargetPurpose::Listen));
        targets.add_target_data(TargetData::new(query("halls"), 4, 2, TargetPurpose::Listen));

        let active: BTreeSet<i32> = [2].into_iter().collect();
        let results = gc.collect(&mut targets, &mut documents, &queue, &mut orphaned, &active);

        assert_eq!(results.targets_removed, 1);
        assert!(targets.get_target_data(2).is_some());
        assert!(targets.get_target_data(4).is_none());
    }

    #[test]
    fn pinned_documents_survive() {
        let gc = collector();
        let mut targets = TargetCache::new();
        let mut documents = RemoteDocumentCache::new();
        let mut queue = MutationQueue::new();
        let mut orphaned = BTreeMap::new();

        documents.add(MutableDocument::new_found(
            key("rooms/pinned"),
            Timestamp::new(1, 0),
            ObjectValue::empty(),
        ));
        documents.add(MutableDocument::new_found(
            key("rooms/stale"),
            Timestamp::new(1, 0),
            ObjectValue::empty(),
        ));
        queue
            .add_mutation_batch(
                Timestamp::now(),
                vec![Mutation::set(key("rooms/pinned"), ObjectValue::empty())],
            )
            .unwrap();
        orphaned.insert(key("rooms/pinned"), 1);
        orphaned.insert(key("rooms/stale"), 1);

        let results = gc.collect(
            &mut targets,
            &mut documents,
            &queue,
            &mut orphaned,
            &BTreeSet::new(),
        );

        assert_eq!(results.documents_removed, 1);
        assert!(documents.contains_key(&key("rooms/pinned")));
        assert!(!documents.contains_key(&key("rooms/stale")));
    }

    #[test]
    fn collection_is_idempotent() {
        let gc = collector();
        let mut targets = TargetCache::new();
        let mut documents = RemoteDocumentCache::new();
        let queue = MutationQueue::new();
        let mut orphaned = BTreeMap::new();

        targets.add_target_data(TargetData::new(query("rooms"), 2, 1, TargetPurpose::Listen));
        documents.add(MutableDocument::new_found(
            key("rooms/a"),
            Timestamp::new(1, 0),
            ObjectValue::empty(),
        ));
        orphaned.insert(key("rooms/a"), 1);

        let first = gc.collect(
            &mut targets,
            &mut documents,
            &queue,
            &mut orphaned,
            &BTreeSet::new(),
        );
        assert!(first.targets_removed + first.documents_removed > 0);

        let second = gc.collect(
            &mut targets,
            &mut documents,
            &queue,
            &mut orphaned,
            &BTreeSet::new(),
        );
        assert_eq!(second.targets_removed, 0);
        assert_eq!(second.documents_removed, 0);
    }

    #[test]
    fn percentile_bounds_the_eviction() {
        let gc = LruGarbageCollector::new(LruParams {
            percentile_to_collect: 10,
            ..LruParams::default()
        });
        let mut targets = TargetCache::new();
        let mut documents = RemoteDocumentCache::new();
        let queue = MutationQueue::new();
        let mut orphaned = BTreeMap::new();

        for i in 0..20u64 {
            targets.add_target_data(TargetData::new(
                query(&format!("c{i}")),
                (i as i32 + 1) * 2,
                i + 1,
                TargetPurpose::Listen,
            ));
        }
        let results = gc.collect(
            &mut targets,
            &mut documents,
            &queue,
            &mut orphaned,
            &BTreeSet::new(),
        );
        // 10% of 20 entries: only the two oldest targets go.
        assert_eq!(results.targets_removed, 2);
        assert_eq!(targets.target_count(), 18);
    }
}
