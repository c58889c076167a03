pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_cache;

pub use document_overlay_cache::{DocumentOverlayCache, Overlay};
pub use index_manager::{IndexManager, IndexType};
pub use local_documents::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, PersistenceHook, QueryResult};
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
pub use mutation_queue::MutationQueue;
pub use query_engine::{QueryEngine, QueryEngineParams};
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::{ReferenceSet, TargetCache, TargetData, TargetPurpose};
