//! Offline-first Firestore client engine.
//!
//! A client-side, eventually-consistent document cache that reconciles local
//! optimistic writes against the server watch/write protocol, survives
//! offline periods, and evicts stale state under a size budget.
//!
//! The layering mirrors the data flow: user operations enter through
//! [`core::SyncEngine`] (or the [`core::FirestoreClient`] façade), are
//! persisted and read through [`local::LocalStore`], and reach the network
//! via [`remote::RemoteStore`]; watch and write responses flow back the same
//! way and end up as [`core::ViewSnapshot`]s delivered to listeners.
//!
//! Authentication, the wire codec, the transport and durable storage are
//! injected collaborators, not part of the engine: see
//! [`remote::TokenProvider`], [`remote::WireCodec`], [`remote::Transport`]
//! and [`local::PersistenceHook`].

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;

pub use crate::core::{
    FirestoreClient, FirestoreSettings, ListenerRegistration, Query, QueryObserver, SyncEngine,
    ViewSnapshot,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::{DocumentKey, FieldValue, MutableDocument, Mutation, ObjectValue, Timestamp};
pub use remote::OnlineState;
