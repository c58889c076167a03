pub mod client;
pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use client::{FirestoreClient, FirestoreSettings};
pub use event_manager::{EventManager, QueryObserver};
pub use query::{Bound, Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use sync_engine::{
    ListenerRegistration, SyncEngine, WriteAck, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, View, ViewChange};
pub use view_snapshot::{DocumentChangeType, DocumentViewChange, ViewSnapshot};
