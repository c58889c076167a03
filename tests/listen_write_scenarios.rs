//! End-to-end scenarios driving the full client over the in-memory
//! transport, with the test acting as the backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use firestore_offline::core::{FirestoreClient, FirestoreSettings, Query, QueryObserver};
use firestore_offline::model::{
    DocumentKey, FieldValue, Mutation, MutationResult, ObjectValue, ResourcePath, Timestamp,
};
use firestore_offline::remote::{
    BloomFilter, DatabaseId, DocumentChange, ExistenceFilterChange, InMemoryServer,
    InMemoryTransport, JsonWireCodec, NoopTokenProvider, ServerStream, StreamKind,
    TargetChangeState, WatchChange, WatchDocument, WatchTargetChange, WriteResponse,
};
use firestore_offline::ViewSnapshot;

fn codec() -> JsonWireCodec {
    JsonWireCodec::new(DatabaseId::default_database("project"))
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms_query() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap())
}

fn object(entries: &[(&str, FieldValue)]) -> ObjectValue {
    let mut map = BTreeMap::new();
    for (name, value) in entries {
        map.insert((*name).to_string(), value.clone());
    }
    ObjectValue::new(map)
}

struct Backend {
    server: InMemoryServer,
    codec: JsonWireCodec,
}

impl Backend {
    async fn accept(&self, kind: StreamKind) -> ServerStream {
        loop {
            let stream = self.server.accept().await.expect("transport closed");
            if stream.kind() == kind {
                return stream;
            }
        }
    }

    async fn next_json(&self, stream: &ServerStream) -> JsonValue {
        let payload = stream.next().await.expect("client frame");
        serde_json::from_slice(&payload).expect("client frames are JSON")
    }

    async fn send_doc(
        &self,
        stream: &ServerStream,
        target_ids: Vec<i32>,
        path: &str,
        version: i64,
        entries: &[(&str, FieldValue)],
    ) {
        let change = WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: vec![],
            key: key(path),
            new_document: Some(WatchDocument {
                key: key(path),
                fields: object(entries),
                update_time: Timestamp::new(version, 0),
            }),
        });
        stream
            .send(self.codec.encode_watch_change(&change).unwrap())
            .await
            .unwrap();
    }

    async fn send_current(&self, stream: &ServerStream, target_ids: Vec<i32>, version: i64) {
        let change = WatchChange::TargetChange(WatchTargetChange {
            state: TargetChangeState::Current,
            target_ids,
            resume_token: Bytes::from_static(b"resume-token"),
            read_time: Some(Timestamp::new(version, 0)),
            cause: None,
        });
        stream
            .send(self.codec.encode_watch_change(&change).unwrap())
            .await
            .unwrap();
    }

    async fn send_existence_filter(
        &self,
        stream: &ServerStream,
        target_id: i32,
        count: i32,
        bloom: Option<BloomFilter>,
    ) {
        let change = WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count,
            unchanged_names: bloom,
        });
        stream
            .send(self.codec.encode_watch_change(&change).unwrap())
            .await
            .unwrap();
    }
}

struct Fixture {
    client: Arc<FirestoreClient>,
    backend: Backend,
    snapshots: Arc<Mutex<Vec<ViewSnapshot>>>,
}

impl Fixture {
    async fn new() -> Self {
        let (transport, server) = InMemoryTransport::pair();
        let client = FirestoreClient::new(
            transport,
            Arc::new(codec()),
            Arc::new(NoopTokenProvider),
            FirestoreSettings::default(),
            None,
        );
        client.start().await.unwrap();
        Self {
            client,
            backend: Backend {
                server,
                codec: codec(),
            },
            snapshots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn observer(&self) -> QueryObserver {
        let sink = Arc::clone(&self.snapshots);
        QueryObserver::from_snapshot_handler(move |snapshot| {
            sink.lock().unwrap().push(snapshot);
        })
    }

    fn last_snapshot(&self) -> Option<ViewSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    async fn wait_for_snapshot<F>(&self, description: &str, predicate: F) -> ViewSnapshot
    where
        F: Fn(&ViewSnapshot) -> bool,
    {
        for _ in 0..200 {
            if let Some(snapshot) = self.last_snapshot() {
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for snapshot: {description}");
    }
}

fn add_target_id(frame: &JsonValue) -> Option<i64> {
    frame
        .get("addTarget")
        .and_then(|t| t.get("targetId"))
        .and_then(JsonValue::as_i64)
}

#[tokio::test(flavor = "current_thread")]
async fn watch_snapshot_then_local_write_then_ack() {
    let fx = Fixture::new().await;
    let _registration = fx
        .client
        .listen(rooms_query(), fx.observer())
        .await
        .unwrap();

    // Initial snapshot is served from the (empty) cache.
    let initial = fx
        .wait_for_snapshot("initial cached snapshot", |s| s.from_cache())
        .await;
    assert!(initial.documents().is_empty());

    // The client connects and registers the target.
    let watch = fx.backend.accept(StreamKind::Listen).await;
    let frame = fx.backend.next_json(&watch).await;
    let target_id = add_target_id(&frame).expect("addTarget frame") as i32;

    // Backend: A@v1, B@v1, then CURRENT with a resume token.
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/a", 1, &[("x", FieldValue::from_integer(1))])
        .await;
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/b", 1, &[])
        .await;
    fx.backend.send_current(&watch, vec![target_id], 1).await;

    let synced = fx
        .wait_for_snapshot("synced snapshot with both docs", |s| {
            !s.from_cache() && s.documents().len() == 2
        })
        .await;
    assert!(!synced.has_pending_writes());
    let ids: Vec<&str> = synced.documents().iter().map(|d| d.key().id()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    // Local write: the snapshot updates immediately and optimistically.
    let (_batch_id, ack) = fx
        .client
        .write(vec![Mutation::set(
            key("rooms/a"),
            object(&[("x", FieldValue::from_integer(2))]),
        )])
        .await
        .unwrap();

    let pending = fx
        .wait_for_snapshot("optimistic snapshot", |s| s.has_pending_writes())
        .await;
    assert!(!pending.from_cache());
    let updated = pending
        .documents()
        .iter()
        .find(|d| d.key().id() == "a")
        .unwrap();
    assert_eq!(
        updated
            .data()
            .field(&firestore_offline::model::FieldPath::from_dot_separated("x").unwrap()),
        Some(&FieldValue::from_integer(2))
    );

    // Backend side of the write stream: handshake, then the batch.
    let write = fx.backend.accept(StreamKind::Write).await;
    let handshake = fx.backend.next_json(&write).await;
    assert!(handshake.get("database").is_some());
    write
        .send(
            fx.backend
                .codec
                .encode_write_response(&WriteResponse {
                    stream_token: Bytes::from_static(b"t0"),
                    commit_version: None,
                    write_results: vec![],
                })
                .unwrap(),
        )
        .await
        .unwrap();

    let request = fx.backend.next_json(&write).await;
    assert_eq!(
        request.get("writes").and_then(|w| w.as_array()).map(Vec::len),
        Some(1)
    );
    write
        .send(
            fx.backend
                .codec
                .encode_write_response(&WriteResponse {
                    stream_token: Bytes::from_static(b"t1"),
                    commit_version: Some(Timestamp::new(2, 0)),
                    write_results: vec![MutationResult {
                        version: Timestamp::new(2, 0),
                        transform_results: vec![],
                    }],
                })
                .unwrap(),
        )
        .await
        .unwrap();

    // Ack clears the pending-writes flag.
    assert!(ack.await.unwrap().is_ok());
    let acked = fx
        .wait_for_snapshot("acknowledged snapshot", |s| !s.has_pending_writes())
        .await;
    assert_eq!(acked.documents().len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn existence_filter_with_bloom_repairs_without_relisten() {
    let fx = Fixture::new().await;
    let _registration = fx
        .client
        .listen(rooms_query(), fx.observer())
        .await
        .unwrap();

    let watch = fx.backend.accept(StreamKind::Listen).await;
    let frame = fx.backend.next_json(&watch).await;
    let target_id = add_target_id(&frame).expect("addTarget frame") as i32;

    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/kept", 1, &[])
        .await;
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/dropped", 1, &[])
        .await;
    fx.backend.send_current(&watch, vec![target_id], 1).await;
    fx.wait_for_snapshot("both docs synced", |s| {
        !s.from_cache() && s.documents().len() == 2
    })
    .await;

    // The backend now believes only one document matches; the bloom filter
    // names the survivor.
    let mut bloom = BloomFilter::with_expected_entries(64);
    bloom.insert("rooms/kept");
    fx.backend
        .send_existence_filter(&watch, target_id, 1, Some(bloom))
        .await;

    // The purged document enters limbo resolution on a dedicated target.
    let frame = fx.backend.next_json(&watch).await;
    let limbo_id = add_target_id(&frame).expect("limbo addTarget") as i32;
    assert_ne!(limbo_id, target_id);
    assert_eq!(limbo_id % 2, 1, "limbo targets use the odd id sequence");

    // Limbo target reports current without the document: it is gone.
    fx.backend.send_current(&watch, vec![limbo_id], 2).await;

    let repaired = fx
        .wait_for_snapshot("repaired snapshot", |s| s.documents().len() == 1)
        .await;
    assert_eq!(repaired.documents()[0].key().id(), "kept");

    // The original target was never re-listened: the only frame after the
    // repair is the limbo target teardown.
    let frame = fx.backend.next_json(&watch).await;
    assert_eq!(
        frame.get("removeTarget").and_then(JsonValue::as_i64),
        Some(limbo_id as i64)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn existence_filter_without_bloom_resets_and_relistens() {
    let fx = Fixture::new().await;
    let _registration = fx
        .client
        .listen(rooms_query(), fx.observer())
        .await
        .unwrap();

    let watch = fx.backend.accept(StreamKind::Listen).await;
    let frame = fx.backend.next_json(&watch).await;
    let target_id = add_target_id(&frame).expect("addTarget frame") as i32;

    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/a", 1, &[])
        .await;
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/b", 1, &[])
        .await;
    fx.backend.send_current(&watch, vec![target_id], 1).await;
    fx.wait_for_snapshot("both docs synced", |s| {
        !s.from_cache() && s.documents().len() == 2
    })
    .await;

    // Count mismatch with no filter payload: full reset.
    fx.backend
        .send_existence_filter(&watch, target_id, 1, None)
        .await;

    let frame = fx.backend.next_json(&watch).await;
    assert_eq!(
        frame.get("removeTarget").and_then(JsonValue::as_i64),
        Some(target_id as i64)
    );
    let frame = fx.backend.next_json(&watch).await;
    assert_eq!(add_target_id(&frame), Some(target_id as i64));
    // The re-listen starts from scratch, without a resume token.
    assert!(frame.get("addTarget").unwrap().get("resumeToken").is_none());

    // The backend replays the surviving document and marks the target
    // current again.
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/a", 2, &[])
        .await;
    fx.backend.send_current(&watch, vec![target_id], 2).await;

    // rooms/b is unconfirmed after the reset; its limbo resolution confirms
    // the deletion.
    let frame = fx.backend.next_json(&watch).await;
    let limbo_id = add_target_id(&frame).expect("limbo addTarget") as i32;
    fx.backend.send_current(&watch, vec![limbo_id], 3).await;

    let repaired = fx
        .wait_for_snapshot("post-reset snapshot", |s| {
            !s.from_cache() && s.documents().len() == 1
        })
        .await;
    assert_eq!(repaired.documents()[0].key().id(), "a");
}

#[tokio::test(flavor = "current_thread")]
async fn network_outage_degrades_to_cache_and_recovers() {
    let fx = Fixture::new().await;
    let _registration = fx
        .client
        .listen(rooms_query(), fx.observer())
        .await
        .unwrap();

    let watch = fx.backend.accept(StreamKind::Listen).await;
    let frame = fx.backend.next_json(&watch).await;
    let target_id = add_target_id(&frame).expect("addTarget frame") as i32;
    fx.backend
        .send_doc(&watch, vec![target_id], "rooms/a", 1, &[])
        .await;
    fx.backend.send_current(&watch, vec![target_id], 1).await;
    fx.wait_for_snapshot("synced", |s| !s.from_cache() && s.documents().len() == 1)
        .await;

    // Kill the connection; the stream fails and the client goes offline,
    // serving the cached result.
    fx.backend.server.set_connected(false);
    watch.close();
    fx.wait_for_snapshot("offline cached snapshot", |s| {
        s.from_cache() && s.documents().len() == 1
    })
    .await;

    // Connectivity returns; the client re-listens with its resume token and
    // upgrades back to a synced snapshot.
    fx.backend.server.set_connected(true);
    let watch = fx.backend.accept(StreamKind::Listen).await;
    let frame = fx.backend.next_json(&watch).await;
    assert_eq!(add_target_id(&frame), Some(target_id as i64));
    assert!(frame.get("addTarget").unwrap().get("resumeToken").is_some());
    fx.backend.send_current(&watch, vec![target_id], 2).await;

    fx.wait_for_snapshot("recovered snapshot", |s| {
        !s.from_cache() && s.documents().len() == 1
    })
    .await;
}
