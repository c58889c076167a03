use std::collections::BTreeSet;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::target_cache::TargetPurpose;
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult};
use crate::remote::remote_event::RemoteEvent;

pub type SyncerFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_syncer_future<'a, F, T>(future: F) -> SyncerFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Narrow capability through which the remote store reaches the rest of the
/// engine.
///
/// The remote store owns no cache state; every result it produces flows
/// through this interface, which keeps the ownership one-directional: the
/// sync engine owns the remote store, never the other way around.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consolidated event produced by the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> SyncerFuture<'_, FirestoreResult<()>>;

    /// A watch target was rejected by the backend.
    fn reject_listen(
        &self,
        target_id: i32,
        error: FirestoreError,
    ) -> SyncerFuture<'_, FirestoreResult<()>>;

    /// A mutation batch was committed.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> SyncerFuture<'_, FirestoreResult<()>>;

    /// A mutation batch was rejected with a permanent error.
    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: FirestoreError,
    ) -> SyncerFuture<'_, FirestoreResult<()>>;

    /// Next pending batch after the given id, in batch order.
    fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> SyncerFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    /// Keys the local cache currently assigns to a target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Purpose of an active target, `None` once it is unlistened.
    fn get_target_purpose(&self, target_id: i32) -> Option<TargetPurpose>;

    /// The document a limbo-resolution target is waiting on.
    fn get_limbo_document_key(&self, target_id: i32) -> Option<DocumentKey>;

    /// Credentials changed; pending user callbacks must be resolved and
    /// caches re-keyed.
    fn handle_credential_change(&self) -> SyncerFuture<'_, FirestoreResult<()>> {
        box_syncer_future(async { Ok(()) })
    }
}
