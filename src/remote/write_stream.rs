use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::model::MutationBatch;
use crate::remote::codec::{WireCodec, WriteResponse};
use crate::remote::credentials::TokenProviderArc;
use crate::remote::persistent_stream::{
    PersistentStream, PersistentStreamHandle, StreamEventHandler,
};
use crate::remote::transport::{StreamHandle, StreamKind, Transport};
use crate::util::backoff::BackoffParams;

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The handshake response arrived; returns the in-flight batches that
    /// must be (re)sent on this connection, in batch order.
    async fn on_handshake_complete(&self) -> Vec<MutationBatch>;
    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()>;
    async fn on_write_error(&self, error: &FirestoreError);
}

/// The write half of the protocol.
///
/// Every connection starts with a handshake exchange that yields the stream
/// token; subsequent batches are sent in batch order, each tagged with the
/// last received token so the backend can dedupe resends.
pub struct WriteStream {
    handler: Arc<WriteHandler>,
    handle: PersistentStreamHandle,
}

impl WriteStream {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: TokenProviderArc,
        codec: Arc<dyn WireCodec>,
        backoff_params: BackoffParams,
        delegate: Arc<dyn WriteStreamDelegate>,
    ) -> Self {
        let handler = Arc::new(WriteHandler {
            codec,
            delegate,
            state: Mutex::new(WriteStreamState {
                stream: None,
                handshake_complete: false,
                last_stream_token: None,
            }),
            running: AtomicBool::new(true),
        });
        let handle = PersistentStream::new(
            transport,
            credentials,
            Arc::clone(&handler),
            StreamKind::Write,
            backoff_params,
        )
        .start();
        Self { handler, handle }
    }

    pub async fn handshake_complete(&self) -> bool {
        self.handler.state.lock().await.handshake_complete
    }

    pub async fn write(&self, batch: &MutationBatch) -> FirestoreResult<()> {
        let (stream, token) = {
            let state = self.handler.state.lock().await;
            if !state.handshake_complete {
                return Err(internal_error(
                    "cannot write mutations before handshake completes",
                ));
            }
            let stream = state
                .stream
                .clone()
                .ok_or_else(|| internal_error("write stream is not open"))?;
            let token = state
                .last_stream_token
                .clone()
                .ok_or_else(|| internal_error("missing stream token"))?;
            (stream, token)
        };
        let payload = self.handler.codec.encode_write_request(&token, batch)?;
        stream.send(payload).await
    }

    pub fn stop(&self) {
        self.handler.running.store(false, Ordering::SeqCst);
        self.handle.stop();
    }
}

struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    last_stream_token: Option<Bytes>,
}

struct WriteHandler {
    codec: Arc<dyn WireCodec>,
    delegate: Arc<dyn WriteStreamDelegate>,
    state: Mutex<WriteStreamState>,
    running: AtomicBool,
}

#[async_trait]
impl StreamEventHandler for WriteHandler {
    fn label(&self) -> &'static str {
        "write"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.stream = Some(Arc::clone(&stream));
            state.handshake_complete = false;
            state.last_stream_token = None;
        }
        let handshake = self.codec.encode_write_handshake()?;
        stream.send(handshake).await
    }

    async fn on_message(&self, payload: Bytes) -> FirestoreResult<()> {
        let response = self.codec.decode_write_response(&payload)?;
        let first_response = {
            let mut state = self.state.lock().await;
            state.last_stream_token = Some(response.stream_token.clone());
            if !state.handshake_complete {
                state.handshake_complete = true;
                true
            } else {
                false
            }
        };

        if first_response {
            // Resend whatever was in flight when the previous connection
            // dropped; the stream token lets the backend dedupe.
            let batches = self.delegate.on_handshake_complete().await;
            let (stream, token) = {
                let state = self.state.lock().await;
                match (&state.stream, &state.last_stream_token) {
                    (Some(stream), Some(token)) => (Arc::clone(stream), token.clone()),
                    _ => return Ok(()),
                }
            };
            for batch in batches {
                let payload = self.codec.encode_write_request(&token, &batch)?;
                stream.send(payload).await?;
            }
            Ok(())
        } else {
            self.delegate.on_write_response(response).await
        }
    }

    async fn on_close(&self) {
        let mut state = self.state.lock().await;
        state.stream = None;
        state.handshake_complete = false;
    }

    async fn on_error(&self, error: &FirestoreError) {
        {
            let mut state = self.state.lock().await;
            state.stream = None;
            state.handshake_complete = false;
        }
        self.delegate.on_write_error(error).await;
    }
}
