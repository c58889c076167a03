use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::error::FirestoreError;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Connection state surfaced to listeners alongside snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No definite signal yet; snapshots stay optimistic.
    Unknown,
    Online,
    /// The backend is unreachable; queries serve from cache.
    Offline,
}

pub type OnlineStateCallback = Arc<dyn Fn(OnlineState) + Send + Sync>;

/// Failures tolerated while `Unknown` before giving up and going `Offline`.
const MAX_WATCH_STREAM_FAILURES: usize = 1;

/// How long a newly started watch stream may stay silent before the client
/// is declared offline.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: usize,
    watchdog: Option<DelayedOperation>,
}

/// Derives the user-visible online state from watch stream behaviour.
///
/// One failed attempt with no prior `Online` observation flips the state to
/// `Offline`, as does the watchdog firing with no response. Recovery to
/// `Online` happens the instant any stream event succeeds.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    state: StdMutex<TrackerState>,
    queue: AsyncQueue,
    callback: OnlineStateCallback,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, callback: OnlineStateCallback) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: StdMutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    watchdog: None,
                }),
                queue,
                callback,
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.inner.state.lock().unwrap().state
    }

    /// Called when the watch stream starts connecting; arms the watchdog
    /// that forces `Offline` if nothing arrives in time.
    pub fn handle_watch_stream_start(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        if guard.state != OnlineState::Unknown || guard.watchdog.is_some() {
            return;
        }
        let tracker = self.clone();
        let watchdog = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            ONLINE_STATE_TIMEOUT,
            async move {
                let changed = {
                    let mut guard = tracker.inner.state.lock().unwrap();
                    guard.watchdog = None;
                    if guard.state == OnlineState::Unknown {
                        log::debug!("watch stream silent for {ONLINE_STATE_TIMEOUT:?}; going offline");
                        Self::transition(&mut guard, OnlineState::Offline)
                    } else {
                        false
                    }
                };
                if changed {
                    (tracker.inner.callback)(OnlineState::Offline);
                }
            },
        );
        guard.watchdog = Some(watchdog);
    }

    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let (changed, new_state) = {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.state == OnlineState::Online {
                // One failure after being online only downgrades to Unknown;
                // a second consecutive one goes Offline below.
                guard.watch_stream_failures = 0;
                (Self::transition(&mut guard, OnlineState::Unknown), OnlineState::Unknown)
            } else {
                guard.watch_stream_failures += 1;
                if guard.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    log::debug!("watch stream failed while offline-prone: {error}");
                    Self::clear_watchdog(&mut guard);
                    (Self::transition(&mut guard, OnlineState::Offline), OnlineState::Offline)
                } else {
                    (false, guard.state)
                }
            }
        };
        if changed {
            (self.inner.callback)(new_state);
        }
    }

    /// Any successful stream event makes the client online immediately.
    pub fn handle_stream_event(&self) {
        self.set(OnlineState::Online);
    }

    pub fn set(&self, state: OnlineState) {
        let changed = {
            let mut guard = self.inner.state.lock().unwrap();
            Self::clear_watchdog(&mut guard);
            guard.watch_stream_failures = 0;
            Self::transition(&mut guard, state)
        };
        if changed {
            (self.inner.callback)(state);
        }
    }

    fn transition(guard: &mut TrackerState, state: OnlineState) -> bool {
        if guard.state == state {
            return false;
        }
        guard.state = state;
        true
    }

    fn clear_watchdog(guard: &mut TrackerState) {
        if let Some(watchdog) = guard.watchdog.take() {
            watchdog.cancel();
        }
    }
}
