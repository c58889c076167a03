use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{unavailable, FirestoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

/// One open bidirectional stream.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    async fn send(&self, message: Bytes) -> FirestoreResult<()>;
    /// Next inbound message; `None` once the peer closed the stream.
    async fn next(&self) -> Option<FirestoreResult<Bytes>>;
    async fn close(&self);
}

/// Injected connection factory. Reconnects and backoff live in the engine,
/// not here: a transport only knows how to open one stream at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: StreamKind,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

/// Channel-backed transport for tests and local simulation.
///
/// `InMemoryTransport::pair` returns the client transport plus a server
/// endpoint that accepts the streams the client opens.
pub struct InMemoryTransport {
    acceptor: Sender<ServerStream>,
    connected: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, InMemoryServer) {
        let (acceptor, incoming) = async_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        (
            Arc::new(Self {
                acceptor,
                connected: Arc::clone(&connected),
            }),
            InMemoryServer {
                incoming,
                connected,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open_stream(
        &self,
        kind: StreamKind,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(unavailable("simulated network outage"));
        }
        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        let server_stream = ServerStream {
            kind,
            auth_token,
            tx: server_tx,
            rx: server_rx,
        };
        self.acceptor
            .send(server_stream)
            .await
            .map_err(|_| unavailable("server endpoint dropped"))?;
        Ok(Arc::new(ChannelStream {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

struct ChannelStream {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

#[async_trait]
impl StreamHandle for ChannelStream {
    async fn send(&self, message: Bytes) -> FirestoreResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| unavailable("stream closed"))
    }

    async fn next(&self) -> Option<FirestoreResult<Bytes>> {
        self.rx.recv().await.ok().map(Ok)
    }

    async fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

/// Server side of the in-memory pair; tests drive the backend through it.
pub struct InMemoryServer {
    incoming: Receiver<ServerStream>,
    connected: Arc<AtomicBool>,
}

impl InMemoryServer {
    pub async fn accept(&self) -> Option<ServerStream> {
        self.incoming.recv().await.ok()
    }

    /// Simulates losing or regaining network connectivity for future opens.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

pub struct ServerStream {
    kind: StreamKind,
    auth_token: Option<String>,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl ServerStream {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub async fn send(&self, message: Bytes) -> FirestoreResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| unavailable("client went away"))
    }

    pub async fn next(&self) -> Option<Bytes> {
        self.rx.recv().await.ok()
    }

    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}
