use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use crate::core::view_snapshot::ViewSnapshot;
use crate::error::FirestoreError;

pub type SnapshotCallback = Arc<dyn Fn(ViewSnapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(FirestoreError) + Send + Sync>;

/// Caller-supplied observer for one listen.
#[derive(Clone)]
pub struct QueryObserver {
    pub on_snapshot: SnapshotCallback,
    pub on_error: ErrorCallback,
}

impl QueryObserver {
    pub fn from_snapshot_handler<F>(handler: F) -> Self
    where
        F: Fn(ViewSnapshot) + Send + Sync + 'static,
    {
        Self {
            on_snapshot: Arc::new(handler),
            on_error: Arc::new(|error| log::warn!("listen error: {error}")),
        }
    }
}

struct ListenerEntry {
    id: u64,
    observer: QueryObserver,
}

struct TargetListeners {
    entries: Vec<ListenerEntry>,
    last_snapshot: Option<ViewSnapshot>,
}

/// Fans view snapshots out to the observers registered per target.
#[derive(Default)]
pub struct EventManager {
    listeners: StdMutex<BTreeMap<i32, TargetListeners>>,
    counter: StdMutex<u64>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer; a previously delivered snapshot for the target
    /// is replayed immediately so late listeners catch up.
    pub fn add_listener(&self, target_id: i32, observer: QueryObserver) -> u64 {
        let id = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            *counter
        };
        let replay = {
            let mut listeners = self.listeners.lock().unwrap();
            let target = listeners.entry(target_id).or_insert_with(|| TargetListeners {
                entries: Vec::new(),
                last_snapshot: None,
            });
            target.entries.push(ListenerEntry {
                id,
                observer: observer.clone(),
            });
            target.last_snapshot.clone()
        };
        if let Some(snapshot) = replay {
            (observer.on_snapshot)(snapshot);
        }
        id
    }

    /// Removes a listener; returns `true` when the target has no listeners
    /// left and should be unlistened.
    pub fn remove_listener(&self, target_id: i32, listener_id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let Some(target) = listeners.get_mut(&target_id) else {
            return false;
        };
        target.entries.retain(|entry| entry.id != listener_id);
        if target.entries.is_empty() {
            listeners.remove(&target_id);
            true
        } else {
            false
        }
    }

    pub fn emit_snapshot(&self, target_id: i32, snapshot: ViewSnapshot) {
        let callbacks: Vec<SnapshotCallback> = {
            let mut listeners = self.listeners.lock().unwrap();
            match listeners.get_mut(&target_id) {
                Some(target) => {
                    target.last_snapshot = Some(snapshot.clone());
                    target
                        .entries
                        .iter()
                        .map(|entry| Arc::clone(&entry.observer.on_snapshot))
                        .collect()
                }
                None => Vec::new(),
            }
        };
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }

    pub fn emit_error(&self, target_id: i32, error: FirestoreError) {
        let callbacks: Vec<ErrorCallback> = {
            let mut listeners = self.listeners.lock().unwrap();
            match listeners.remove(&target_id) {
                Some(target) => target
                    .entries
                    .iter()
                    .map(|entry| Arc::clone(&entry.observer.on_error))
                    .collect(),
                None => Vec::new(),
            }
        };
        for callback in callbacks {
            callback(error.clone());
        }
    }
}
