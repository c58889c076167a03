pub mod bloom_filter;
pub mod codec;
pub mod credentials;
pub mod listen_stream;
pub mod online_state;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod transport;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod write_stream;

pub use bloom_filter::BloomFilter;
pub use codec::{DatabaseId, JsonWireCodec, WireCodec, WriteResponse};
pub use credentials::{NoopTokenProvider, TokenProvider, TokenProviderArc};
pub use online_state::{OnlineState, OnlineStateCallback, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_syncer_future, RemoteSyncer, SyncerFuture};
pub use transport::{InMemoryServer, InMemoryTransport, ServerStream, StreamKind, Transport};
pub use watch_change::{
    DocumentChange, DocumentDelete, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchDocument, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
