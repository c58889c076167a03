use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::event_manager::QueryObserver;
use crate::core::query::Query;
use crate::core::sync_engine::{
    ListenerRegistration, SyncEngine, WriteAck, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
use crate::error::{internal_error, FirestoreResult};
use crate::local::local_store::LocalStore;
use crate::local::lru_garbage_collector::LruParams;
use crate::local::query_engine::QueryEngineParams;
use crate::model::Mutation;
use crate::remote::codec::WireCodec;
use crate::remote::credentials::TokenProviderArc;
use crate::remote::online_state::{OnlineState, OnlineStateCallback};
use crate::remote::remote_store::RemoteStore;
use crate::remote::transport::Transport;
use crate::util::async_queue::{AsyncQueue, TimerId};
use crate::util::backoff::BackoffParams;

#[derive(Clone, Default)]
pub struct FirestoreSettings {
    pub backoff: BackoffParams,
    pub query_engine: QueryEngineParams,
    pub lru: LruParams,
    pub max_concurrent_limbo_resolutions: Option<usize>,
}

/// Top-level handle wiring the engine together.
///
/// Owns the task queue, the sync engine (which owns the local and remote
/// stores) and the garbage collection schedule. There are no globals: a
/// client is opened at startup, passed around by reference, and shut down
/// once.
pub struct FirestoreClient {
    queue: AsyncQueue,
    sync_engine: SyncEngine,
    shut_down: Arc<AtomicBool>,
}

impl FirestoreClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn WireCodec>,
        credentials: TokenProviderArc,
        settings: FirestoreSettings,
        online_state_observer: Option<OnlineStateCallback>,
    ) -> Arc<Self> {
        let queue = AsyncQueue::new();
        let local_store = Arc::new(LocalStore::new(
            settings.query_engine,
            settings.lru,
        ));
        let sync_engine = SyncEngine::new(
            local_store,
            settings
                .max_concurrent_limbo_resolutions
                .unwrap_or(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS),
        );

        // Online-state transitions funnel through the task queue so they
        // serialize with user operations and remote events.
        let callback: OnlineStateCallback = {
            let engine = sync_engine.clone();
            let queue = queue.clone();
            Arc::new(move |state: OnlineState| {
                let engine = engine.clone();
                let observer = online_state_observer.clone();
                queue.enqueue(async move {
                    engine.handle_online_state_change(state).await;
                    if let Some(observer) = observer {
                        observer(state);
                    }
                });
            })
        };

        let remote_store = RemoteStore::new(
            transport,
            codec,
            credentials,
            sync_engine.as_remote_syncer(),
            queue.clone(),
            callback,
            settings.backoff,
        );
        sync_engine.set_remote_store(remote_store);

        let client = Arc::new(Self {
            queue,
            sync_engine,
            shut_down: Arc::new(AtomicBool::new(false)),
        });
        client.schedule_garbage_collection();
        client
    }

    /// Brings the network up; queries start as cache-only and upgrade once
    /// the watch stream catches up.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.remote_store()?.enable_network().await
    }

    pub async fn listen(
        &self,
        query: Query,
        observer: QueryObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        self.sync_engine.listen(query, observer).await
    }

    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<(i32, WriteAck)> {
        self.sync_engine.write(mutations).await
    }

    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<Option<WriteAck>> {
        self.sync_engine.wait_for_pending_writes().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.remote_store()?.enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.remote_store()?.disable_network().await
    }

    /// Credentials changed: streams restart with fresh tokens and pending
    /// write waiters are cancelled.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.remote_store()?.handle_credential_change().await
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        self.sync_engine.local_store()
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.remote_store()?.shutdown().await?;
        self.queue.shut_down();
        Ok(())
    }

    fn remote_store(&self) -> FirestoreResult<&RemoteStore> {
        self.sync_engine
            .remote_store()
            .ok_or_else(|| internal_error("client started without a remote store"))
    }

    fn schedule_garbage_collection(self: &Arc<Self>) {
        let interval = self.local_store().gc_params().gc_interval;
        Self::schedule_gc_pass(
            self.queue.clone(),
            self.sync_engine.clone(),
            Arc::clone(&self.shut_down),
            interval,
        );
    }

    fn schedule_gc_pass(
        queue: AsyncQueue,
        sync_engine: SyncEngine,
        shut_down: Arc<AtomicBool>,
        interval: Duration,
    ) {
        let reschedule_queue = queue.clone();
        queue.enqueue_after_delay(TimerId::GarbageCollectionDelay, interval, async move {
            if shut_down.load(Ordering::SeqCst) {
                return;
            }
            let active = sync_engine.active_listen_target_ids().await;
            let results = sync_engine.local_store().collect_garbage(&active).await;
            if results.did_run {
                log::debug!(
                    "garbage collection removed {} targets, {} documents",
                    results.targets_removed,
                    results.documents_removed
                );
            }
            Self::schedule_gc_pass(reschedule_queue, sync_engine, shut_down, interval);
        });
    }
}
