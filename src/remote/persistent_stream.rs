use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::remote::credentials::TokenProviderArc;
use crate::remote::transport::{StreamHandle, StreamKind, Transport};
use crate::util::backoff::{BackoffParams, ExponentialBackoff};
use crate::util::runtime;

/// Receives lifecycle events from a [`PersistentStream`].
#[async_trait]
pub trait StreamEventHandler: Send + Sync + 'static {
    fn label(&self) -> &'static str;
    /// Returning `false` ends the reconnect loop for good.
    fn should_continue(&self) -> bool;
    async fn on_open(&self, stream: Arc<dyn StreamHandle>) -> FirestoreResult<()>;
    async fn on_message(&self, payload: Bytes) -> FirestoreResult<()>;
    async fn on_close(&self);
    async fn on_error(&self, error: &FirestoreError);
}

/// A logical stream that outlives individual connections.
///
/// The lifecycle is `Initial → Auth → Open → Backoff → Initial`: a token is
/// fetched before every connection attempt, failures feed the exponential
/// backoff, and the loop reopens the stream until stopped. `Unauthenticated`
/// errors invalidate the cached token before the retry;
/// `ResourceExhausted` jumps the backoff straight to its cap.
pub struct PersistentStream<H>
where
    H: StreamEventHandler,
{
    transport: Arc<dyn Transport>,
    credentials: TokenProviderArc,
    handler: Arc<H>,
    kind: StreamKind,
    backoff_params: BackoffParams,
    running: Arc<AtomicBool>,
}

impl<H> PersistentStream<H>
where
    H: StreamEventHandler,
{
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: TokenProviderArc,
        handler: Arc<H>,
        kind: StreamKind,
        backoff_params: BackoffParams,
    ) -> Self {
        Self {
            transport,
            credentials,
            handler,
            kind,
            backoff_params,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn start(self) -> PersistentStreamHandle {
        let running = Arc::clone(&self.running);
        runtime::spawn_detached(async move {
            self.run().await;
        });
        PersistentStreamHandle { running }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handler.should_continue()
    }

    fn note_error(&self, backoff: &mut ExponentialBackoff, error: &FirestoreError) {
        match error.code {
            FirestoreErrorCode::Unauthenticated => self.credentials.invalidate_token(),
            FirestoreErrorCode::ResourceExhausted => backoff.reset_to_max(),
            _ => {}
        }
    }

    async fn run(self) {
        let label = self.handler.label();
        let mut backoff = ExponentialBackoff::new(self.backoff_params);

        while self.is_running() {
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                log::debug!("{label} stream backing off for {delay:?}");
                runtime::sleep(delay).await;
            }
            if !self.is_running() {
                break;
            }

            let token = match self.credentials.get_token().await {
                Ok(token) => token,
                Err(err) => {
                    self.note_error(&mut backoff, &err);
                    self.handler.on_error(&err).await;
                    continue;
                }
            };

            let stream = match self.transport.open_stream(self.kind, token).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.note_error(&mut backoff, &err);
                    self.handler.on_error(&err).await;
                    continue;
                }
            };

            if !self.is_running() {
                stream.close().await;
                break;
            }
            if let Err(err) = self.handler.on_open(Arc::clone(&stream)).await {
                self.note_error(&mut backoff, &err);
                self.handler.on_error(&err).await;
                stream.close().await;
                continue;
            }

            self.process_stream(&mut backoff, stream).await;
        }

        self.handler.on_close().await;
    }

    async fn process_stream(&self, backoff: &mut ExponentialBackoff, stream: Arc<dyn StreamHandle>) {
        loop {
            if !self.is_running() {
                stream.close().await;
                return;
            }
            match stream.next().await {
                Some(Ok(payload)) => {
                    // Any delivered message proves the connection is healthy.
                    backoff.reset();
                    if let Err(err) = self.handler.on_message(payload).await {
                        self.note_error(backoff, &err);
                        self.handler.on_error(&err).await;
                        stream.close().await;
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.note_error(backoff, &err);
                    self.handler.on_error(&err).await;
                    stream.close().await;
                    return;
                }
                None => {
                    self.handler.on_close().await;
                    return;
                }
            }
        }
    }
}

pub struct PersistentStreamHandle {
    running: Arc<AtomicBool>,
}

impl PersistentStreamHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
