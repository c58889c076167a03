use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::target_cache::TargetData;
use crate::remote::codec::WireCodec;
use crate::remote::credentials::TokenProviderArc;
use crate::remote::persistent_stream::{
    PersistentStream, PersistentStreamHandle, StreamEventHandler,
};
use crate::remote::transport::{StreamHandle, StreamKind, Transport};
use crate::remote::watch_change::WatchChange;
use crate::util::backoff::BackoffParams;

#[async_trait]
pub trait WatchStreamDelegate: Send + Sync + 'static {
    /// A (re)connection opened; returns the targets to (re)register on it.
    async fn on_watch_open(&self) -> Vec<TargetData>;
    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()>;
    async fn on_watch_error(&self, error: &FirestoreError);
}

/// The listen half of the protocol: registers targets and feeds decoded
/// watch changes to the delegate.
pub struct ListenStream {
    handler: Arc<ListenHandler>,
    handle: PersistentStreamHandle,
}

impl ListenStream {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: TokenProviderArc,
        codec: Arc<dyn WireCodec>,
        backoff_params: BackoffParams,
        delegate: Arc<dyn WatchStreamDelegate>,
    ) -> Self {
        let handler = Arc::new(ListenHandler {
            codec,
            delegate,
            stream: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let handle = PersistentStream::new(
            transport,
            credentials,
            Arc::clone(&handler),
            StreamKind::Listen,
            backoff_params,
        )
        .start();
        Self { handler, handle }
    }

    /// Registers a target on the open connection. A no-op while disconnected;
    /// the delegate re-sends targets on the next `on_watch_open`.
    pub async fn watch(&self, target: &TargetData) -> FirestoreResult<()> {
        let stream = self.handler.stream.lock().await.clone();
        if let Some(stream) = stream {
            let payload = self.handler.codec.encode_add_target(target)?;
            stream.send(payload).await?;
        }
        Ok(())
    }

    pub async fn unwatch(&self, target_id: i32) -> FirestoreResult<()> {
        let stream = self.handler.stream.lock().await.clone();
        if let Some(stream) = stream {
            let payload = self.handler.codec.encode_remove_target(target_id)?;
            stream.send(payload).await?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.handler.running.store(false, Ordering::SeqCst);
        self.handle.stop();
    }
}

struct ListenHandler {
    codec: Arc<dyn WireCodec>,
    delegate: Arc<dyn WatchStreamDelegate>,
    stream: Mutex<Option<Arc<dyn StreamHandle>>>,
    running: AtomicBool,
}

#[async_trait]
impl StreamEventHandler for ListenHandler {
    fn label(&self) -> &'static str {
        "listen"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>) -> FirestoreResult<()> {
        *self.stream.lock().await = Some(Arc::clone(&stream));
        // Re-register every active target on the fresh connection, resuming
        // from the tokens the local store last persisted.
        for target in self.delegate.on_watch_open().await {
            let payload = self.codec.encode_add_target(&target)?;
            stream.send(payload).await?;
        }
        Ok(())
    }

    async fn on_message(&self, payload: Bytes) -> FirestoreResult<()> {
        match self.codec.decode_watch_change(&payload)? {
            Some(change) => self.delegate.on_watch_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self) {
        *self.stream.lock().await = None;
    }

    async fn on_error(&self, error: &FirestoreError) {
        *self.stream.lock().await = None;
        self.delegate.on_watch_error(error).await;
    }
}
