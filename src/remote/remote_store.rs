use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::target_cache::{TargetData, TargetPurpose};
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult, Timestamp};
use crate::remote::codec::{WireCodec, WriteResponse};
use crate::remote::credentials::TokenProviderArc;
use crate::remote::listen_stream::{ListenStream, WatchStreamDelegate};
use crate::remote::online_state::{OnlineStateCallback, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::transport::Transport;
use crate::remote::watch_change::{WatchChange, WatchTargetChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::write_stream::{WriteStream, WriteStreamDelegate};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffParams;

/// In-flight writes kept on the stream at once.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons why the remote store keeps the network down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

struct SyncerMetadata {
    syncer: Arc<dyn RemoteSyncer>,
}

impl TargetMetadataProvider for SyncerMetadata {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_purpose(&self, target_id: i32) -> Option<TargetPurpose> {
        self.syncer.get_target_purpose(target_id)
    }

    fn get_limbo_document_key(&self, target_id: i32) -> Option<DocumentKey> {
        self.syncer.get_limbo_document_key(target_id)
    }
}

struct RemoteStoreState {
    listen_targets: BTreeMap<i32, TargetData>,
    watch_stream: Option<Arc<ListenStream>>,
    write_stream: Option<Arc<WriteStream>>,
    aggregator: Option<WatchChangeAggregator<SyncerMetadata>>,
    write_pipeline: VecDeque<MutationBatch>,
    last_batch_id: Option<i32>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch_stream: None,
            write_stream: None,
            aggregator: None,
            write_pipeline: VecDeque::new(),
            last_batch_id: None,
            offline_causes: BTreeSet::new(),
        }
    }
}

/// Owns the two logical streams and consolidates their responses.
///
/// Never mutates cache state directly: everything it learns is handed to the
/// injected [`RemoteSyncer`], and everything it sends it first asked the
/// syncer for.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn WireCodec>,
        credentials: TokenProviderArc,
        syncer: Arc<dyn RemoteSyncer>,
        queue: AsyncQueue,
        online_state_callback: OnlineStateCallback,
        backoff_params: BackoffParams,
    ) -> Self {
        let online_state = OnlineStateTracker::new(queue, online_state_callback);
        Self {
            inner: Arc::new(RemoteStoreInner {
                state: Mutex::new(RemoteStoreState::default()),
                transport,
                codec,
                credentials,
                syncer,
                online_state,
                backoff_params,
            }),
        }
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
        }
        self.inner.ensure_streams().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.disable_network(OfflineCause::UserDisabled).await
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.inner.disable_network(OfflineCause::Shutdown).await
    }

    /// Registers a listen target; sent immediately when the watch stream is
    /// up, otherwise on the next (re)connect.
    pub async fn listen(&self, target: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target).await
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Polls the mutation queue and pushes pending batches onto the write
    /// stream, keeping at most [`MAX_PENDING_WRITES`] in flight.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Tears the streams down, lets the syncer re-key its state, and
    /// reconnects with fresh credentials.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.inner.syncer.handle_credential_change().await?;
        self.inner
            .disable_network(OfflineCause::CredentialChange)
            .await?;
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
        }
        self.inner.ensure_streams().await
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn WireCodec>,
    credentials: TokenProviderArc,
    syncer: Arc<dyn RemoteSyncer>,
    online_state: OnlineStateTracker,
    backoff_params: BackoffParams,
}

impl RemoteStoreInner {
    fn can_use_network(state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty()
    }

    async fn disable_network(self: &Arc<Self>, cause: OfflineCause) -> FirestoreResult<()> {
        let (watch, write) = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(cause);
            state.aggregator = None;
            (state.watch_stream.take(), state.write_stream.take())
        };
        if let Some(stream) = watch {
            stream.stop();
        }
        if let Some(stream) = write {
            stream.stop();
        }
        self.online_state
            .set(crate::remote::online_state::OnlineState::Offline);
        Ok(())
    }

    async fn ensure_streams(self: &Arc<Self>) -> FirestoreResult<()> {
        self.online_state
            .set(crate::remote::online_state::OnlineState::Unknown);
        self.start_watch_stream().await?;
        self.start_write_stream().await?;
        self.fill_write_pipeline().await
    }

    async fn listen(self: &Arc<Self>, target: TargetData) -> FirestoreResult<()> {
        let target_id = target.target_id();
        let (stream, should_start) = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target.clone());
            (
                state.watch_stream.clone(),
                Self::can_use_network(&state),
            )
        };

        if let Some(stream) = stream {
            stream.watch(&target).await
        } else if should_start {
            self.start_watch_stream().await
        } else {
            Ok(())
        }
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> FirestoreResult<()> {
        let (stream, now_empty) = {
            let mut state = self.state.lock().await;
            state.listen_targets.remove(&target_id);
            if let Some(aggregator) = state.aggregator.as_mut() {
                aggregator.remove_target(target_id);
            }
            (state.watch_stream.clone(), state.listen_targets.is_empty())
        };
        if let Some(stream) = &stream {
            stream.unwatch(target_id).await?;
        }
        if now_empty {
            let taken = {
                let mut state = self.state.lock().await;
                state.aggregator = None;
                state.watch_stream.take()
            };
            if let Some(stream) = taken {
                stream.stop();
            }
        }
        Ok(())
    }

    async fn start_watch_stream(self: &Arc<Self>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if !Self::can_use_network(&state)
            || state.watch_stream.is_some()
            || state.listen_targets.is_empty()
        {
            return Ok(());
        }
        state.aggregator = Some(WatchChangeAggregator::new(Arc::new(SyncerMetadata {
            syncer: Arc::clone(&self.syncer),
        })));
        let delegate = Arc::new(RemoteWatchDelegate {
            inner: Arc::downgrade(self),
        });
        let stream = Arc::new(ListenStream::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            Arc::clone(&self.codec),
            self.backoff_params,
            delegate,
        ));
        state.watch_stream = Some(stream);
        self.online_state.handle_watch_stream_start();
        Ok(())
    }

    async fn start_write_stream(self: &Arc<Self>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if !Self::can_use_network(&state)
            || state.write_stream.is_some()
            || state.write_pipeline.is_empty()
        {
            return Ok(());
        }
        let delegate = Arc::new(RemoteWriteDelegate {
            inner: Arc::downgrade(self),
        });
        let stream = Arc::new(WriteStream::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            Arc::clone(&self.codec),
            self.backoff_params,
            delegate,
        ));
        state.write_stream = Some(stream);
        Ok(())
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let (should_fetch, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    Self::can_use_network(&state)
                        && state.write_pipeline.len() < MAX_PENDING_WRITES,
                    state.last_batch_id,
                )
            };
            if !should_fetch {
                break;
            }

            let batch = match self.syncer.next_mutation_batch(last_batch_id).await? {
                Some(batch) if !batch.is_empty() => batch,
                _ => break,
            };

            let stream = {
                let mut state = self.state.lock().await;
                state.last_batch_id = Some(batch.batch_id);
                state.write_pipeline.push_back(batch.clone());
                state.write_stream.clone()
            };

            match stream {
                Some(stream) => {
                    // Send failures here are transient: the batch stays in
                    // the pipeline and is resent after the next handshake.
                    if stream.handshake_complete().await {
                        if let Err(err) = stream.write(&batch).await {
                            log::debug!(
                                "failed to send batch {}; will resend after reconnect: {err}",
                                batch.batch_id
                            );
                            break;
                        }
                    }
                }
                None => self.start_write_stream().await?,
            }
        }
        Ok(())
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange) -> FirestoreResult<()> {
        self.online_state.handle_stream_event();

        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(error) = target_change.cause.clone() {
                return self.handle_target_error(target_change.clone(), error).await;
            }
        }

        let event = {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.aggregator.as_mut() else {
                return Ok(());
            };
            if let Some(version) = snapshot_version_for_change(&change) {
                aggregator.set_snapshot_version(version);
            }
            aggregator.handle_watch_change(change)?;
            aggregator.create_remote_event()
        };

        if event.is_empty() {
            return Ok(());
        }

        // Track the freshest resume tokens so reconnects resume where the
        // stream left off.
        let mismatches: Vec<i32> = {
            let mut state = self.state.lock().await;
            for (target_id, target_change) in &event.target_changes {
                if target_change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target) = state.listen_targets.get_mut(target_id) {
                    *target = target.clone().with_resume_token(
                        target_change.resume_token.clone(),
                        event.snapshot_version,
                    );
                }
            }
            event.target_mismatches.iter().copied().collect()
        };

        self.syncer.apply_remote_event(event).await?;
        self.relisten_mismatched_targets(&mismatches).await
    }

    /// Targets whose existence filter could not be repaired re-listen from
    /// scratch: no resume token, `ExistenceFilterMismatch` purpose.
    async fn relisten_mismatched_targets(
        self: &Arc<Self>,
        target_ids: &[i32],
    ) -> FirestoreResult<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let (stream, targets) = {
            let mut state = self.state.lock().await;
            let mut targets = Vec::new();
            for target_id in target_ids {
                if let Some(target) = state.listen_targets.get_mut(target_id) {
                    *target = target
                        .clone()
                        .with_resume_token(Bytes::new(), Timestamp::zero())
                        .with_purpose(TargetPurpose::ExistenceFilterMismatch);
                    targets.push(target.clone());
                }
            }
            (state.watch_stream.clone(), targets)
        };
        if let Some(stream) = stream {
            for target in targets {
                stream.unwatch(target.target_id()).await?;
                stream.watch(&target).await?;
            }
        }
        Ok(())
    }

    async fn handle_target_error(
        self: &Arc<Self>,
        change: WatchTargetChange,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let affected: Vec<i32> = if change.target_ids.is_empty() {
            let state = self.state.lock().await;
            state.listen_targets.keys().copied().collect()
        } else {
            change.target_ids
        };

        for target_id in affected {
            let known = {
                let mut state = self.state.lock().await;
                let known = state.listen_targets.remove(&target_id).is_some();
                if let Some(aggregator) = state.aggregator.as_mut() {
                    aggregator.remove_target(target_id);
                }
                known
            };
            if known {
                self.syncer.reject_listen(target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    async fn targets_for_reconnect(self: &Arc<Self>) -> Vec<TargetData> {
        let mut state = self.state.lock().await;
        // The previous connection's accumulation state is meaningless on a
        // fresh stream.
        state.aggregator = Some(WatchChangeAggregator::new(Arc::new(SyncerMetadata {
            syncer: Arc::clone(&self.syncer),
        })));
        state.listen_targets.values().cloned().collect()
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> FirestoreResult<()> {
        self.online_state.handle_stream_event();
        let batch = {
            let mut state = self.state.lock().await;
            match state.write_pipeline.pop_front() {
                Some(batch) => batch,
                None => {
                    log::warn!("write response with an empty pipeline; dropping");
                    return Ok(());
                }
            }
        };

        let commit_version = response
            .commit_version
            .unwrap_or_else(Timestamp::zero);
        let result = MutationBatchResult::new(
            batch,
            commit_version,
            response.write_results,
            response.stream_token,
        )?;
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_error(self: &Arc<Self>, error: &FirestoreError) {
        // Transient failures leave the pipeline untouched: the stream
        // reconnects and resends after its next handshake. Permanent codes
        // reject the head batch, which is the one the backend refused.
        if !error.code.is_permanent_write_error() {
            log::debug!("transient write stream error, will retry: {error}");
            return;
        }
        let front = {
            let mut state = self.state.lock().await;
            state.write_pipeline.pop_front()
        };
        if let Some(batch) = front {
            if let Err(err) = self
                .syncer
                .reject_failed_write(batch.batch_id, error.clone())
                .await
            {
                log::warn!("failed to reject write batch {}: {err}", batch.batch_id);
            }
            if let Err(err) = self.fill_write_pipeline().await {
                log::warn!("failed to refill write pipeline: {err}");
            }
        }
    }
}

struct RemoteWatchDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WatchStreamDelegate for RemoteWatchDelegate {
    async fn on_watch_open(&self) -> Vec<TargetData> {
        match self.inner.upgrade() {
            Some(inner) => inner.targets_for_reconnect().await,
            None => Vec::new(),
        }
    }

    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_watch_error(&self, error: &FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.online_state.handle_watch_stream_failure(error);
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_handshake_complete(&self) -> Vec<MutationBatch> {
        match self.inner.upgrade() {
            Some(inner) => {
                let state = inner.state.lock().await;
                state.write_pipeline.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_response(response).await,
            None => Ok(()),
        }
    }

    async fn on_write_error(&self, error: &FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_error(error).await;
        }
    }
}

fn snapshot_version_for_change(change: &WatchChange) -> Option<Timestamp> {
    match change {
        WatchChange::TargetChange(change) => change.read_time,
        WatchChange::DocumentDelete(delete) => delete.read_time,
        WatchChange::DocumentChange(change) => change
            .new_document
            .as_ref()
            .map(|document| document.update_time),
        _ => None,
    }
}
