use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{
    internal_error, invalid_argument, map_status_code, FirestoreResult,
};
use crate::local::target_cache::TargetData;
use crate::model::{
    DocumentKey, FieldPath, FieldValue, Mutation, MutationBatch, MutationResult, ObjectValue,
    Precondition, Timestamp, TransformOperation, ValueKind,
};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchDocument, WatchTargetChange,
};

/// Decoded response from the write stream.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: Option<Timestamp>,
    pub write_results: Vec<MutationResult>,
}

/// Injected wire codec: converts between the engine's typed messages and the
/// serialized stream payloads. The engine treats it as a pure function pair;
/// the exact bytes are the codec's business.
pub trait WireCodec: Send + Sync + 'static {
    fn encode_add_target(&self, target: &TargetData) -> FirestoreResult<Bytes>;
    fn encode_remove_target(&self, target_id: i32) -> FirestoreResult<Bytes>;
    fn decode_watch_change(&self, payload: &Bytes) -> FirestoreResult<Option<WatchChange>>;

    fn encode_write_handshake(&self) -> FirestoreResult<Bytes>;
    fn encode_write_request(
        &self,
        stream_token: &Bytes,
        batch: &MutationBatch,
    ) -> FirestoreResult<Bytes>;
    fn decode_write_response(&self, payload: &Bytes) -> FirestoreResult<WriteResponse>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseId {
    pub project_id: String,
    pub database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default_database(project_id: impl Into<String>) -> Self {
        Self::new(project_id, "(default)")
    }

    fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.project_id, self.database
        )
    }
}

/// Default JSON codec used by tests and the in-memory backend.
#[derive(Clone)]
pub struct JsonWireCodec {
    database_id: DatabaseId,
}

impl JsonWireCodec {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    fn key_to_name(&self, key: &DocumentKey) -> String {
        format!(
            "{}/documents/{}",
            self.database_name(),
            key.path().canonical_string()
        )
    }

    fn name_to_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let marker = "/documents/";
        let index = name
            .find(marker)
            .ok_or_else(|| invalid_argument(format!("malformed document name: {name}")))?;
        DocumentKey::from_string(&name[index + marker.len()..])
    }

    fn encode_timestamp(timestamp: Timestamp) -> JsonValue {
        json!({ "seconds": timestamp.seconds, "nanos": timestamp.nanos })
    }

    fn decode_timestamp(value: &JsonValue) -> FirestoreResult<Timestamp> {
        let seconds = value
            .get("seconds")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("timestamp missing seconds"))?;
        let nanos = value
            .get("nanos")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0) as i32;
        Ok(Timestamp::new(seconds, nanos))
    }

    fn encode_value(&self, value: &FieldValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(b) => json!({ "booleanValue": b }),
            ValueKind::Integer(i) => json!({ "integerValue": i.to_string() }),
            ValueKind::Double(d) => json!({ "doubleValue": d }),
            ValueKind::Timestamp(t) => json!({ "timestampValue": Self::encode_timestamp(*t) }),
            ValueKind::String(s) => json!({ "stringValue": s }),
            ValueKind::Bytes(b) => json!({ "bytesValue": BASE64_STANDARD.encode(b) }),
            ValueKind::Reference(r) => json!({ "referenceValue": r }),
            ValueKind::Array(values) => json!({
                "arrayValue": {
                    "values": values.iter().map(|v| self.encode_value(v)).collect::<Vec<_>>()
                }
            }),
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.encode_fields(map) } }),
        }
    }

    fn encode_fields(&self, object: &ObjectValue) -> JsonValue {
        let mut fields = Map::new();
        for (name, value) in object.fields() {
            fields.insert(name.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FieldValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("value must be an object"))?;
        let (kind, payload) = object
            .iter()
            .next()
            .ok_or_else(|| invalid_argument("empty value object"))?;
        match kind.as_str() {
            "nullValue" => Ok(FieldValue::null()),
            "booleanValue" => Ok(FieldValue::from_bool(
                payload
                    .as_bool()
                    .ok_or_else(|| invalid_argument("booleanValue must be a bool"))?,
            )),
            "integerValue" => {
                let parsed = match payload {
                    JsonValue::String(s) => s
                        .parse::<i64>()
                        .map_err(|_| invalid_argument("bad integerValue"))?,
                    JsonValue::Number(n) => n
                        .as_i64()
                        .ok_or_else(|| invalid_argument("bad integerValue"))?,
                    _ => return Err(invalid_argument("bad integerValue")),
                };
                Ok(FieldValue::from_integer(parsed))
            }
            "doubleValue" => Ok(FieldValue::from_double(
                payload
                    .as_f64()
                    .ok_or_else(|| invalid_argument("bad doubleValue"))?,
            )),
            "timestampValue" => Ok(FieldValue::from_timestamp(Self::decode_timestamp(payload)?)),
            "stringValue" => Ok(FieldValue::from_string(
                payload
                    .as_str()
                    .ok_or_else(|| invalid_argument("bad stringValue"))?,
            )),
            "bytesValue" => {
                let bytes = BASE64_STANDARD
                    .decode(
                        payload
                            .as_str()
                            .ok_or_else(|| invalid_argument("bad bytesValue"))?,
                    )
                    .map_err(|err| invalid_argument(format!("bad bytesValue: {err}")))?;
                Ok(FieldValue::from_bytes(bytes))
            }
            "referenceValue" => Ok(FieldValue::from_reference(
                payload
                    .as_str()
                    .ok_or_else(|| invalid_argument("bad referenceValue"))?,
            )),
            "arrayValue" => {
                let values = payload
                    .get("values")
                    .and_then(JsonValue::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|entry| self.decode_value(entry))
                            .collect::<FirestoreResult<Vec<_>>>()
                    })
                    .transpose()?
                    .unwrap_or_default();
                Ok(FieldValue::from_array(values))
            }
            "mapValue" => {
                let object = payload
                    .get("fields")
                    .map(|fields| self.decode_fields(fields))
                    .transpose()?
                    .unwrap_or_else(ObjectValue::empty);
                Ok(FieldValue::from_map(object.into_fields()))
            }
            other => Err(invalid_argument(format!("unknown value kind: {other}"))),
        }
    }

    fn decode_fields(&self, value: &JsonValue) -> FirestoreResult<ObjectValue> {
        let mut result = BTreeMap::new();
        if let Some(fields) = value.as_object() {
            for (name, value) in fields {
                result.insert(name.clone(), self.decode_value(value)?);
            }
        }
        Ok(ObjectValue::new(result))
    }

    fn encode_precondition(precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(time) => {
                Some(json!({ "updateTime": Self::encode_timestamp(*time) }))
            }
        }
    }

    fn encode_transform(&self, path: &FieldPath, operation: &TransformOperation) -> JsonValue {
        let mut transform = Map::new();
        transform.insert("fieldPath".into(), json!(path.canonical_string()));
        match operation {
            TransformOperation::ServerTimestamp => {
                transform.insert("setToServerValue".into(), json!("REQUEST_TIME"));
            }
            TransformOperation::ArrayUnion(values) => {
                transform.insert(
                    "appendMissingElements".into(),
                    json!({
                        "values": values.iter().map(|v| self.encode_value(v)).collect::<Vec<_>>()
                    }),
                );
            }
            TransformOperation::ArrayRemove(values) => {
                transform.insert(
                    "removeAllFromArray".into(),
                    json!({
                        "values": values.iter().map(|v| self.encode_value(v)).collect::<Vec<_>>()
                    }),
                );
            }
            TransformOperation::NumericIncrement(operand) => {
                transform.insert("increment".into(), self.encode_value(operand));
            }
        }
        JsonValue::Object(transform)
    }

    fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert(
                    "update".into(),
                    json!({
                        "name": self.key_to_name(key),
                        "fields": self.encode_fields(value),
                    }),
                );
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert(
                    "update".into(),
                    json!({
                        "name": self.key_to_name(key),
                        "fields": self.encode_fields(data),
                    }),
                );
                write.insert(
                    "updateMask".into(),
                    json!({
                        "fieldPaths": field_mask
                            .paths()
                            .map(FieldPath::canonical_string)
                            .collect::<Vec<_>>()
                    }),
                );
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".into(), json!(self.key_to_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".into(), json!(self.key_to_name(key)));
            }
        }

        let transforms: Vec<JsonValue> = mutation
            .field_transforms()
            .iter()
            .map(|t| self.encode_transform(t.field_path(), t.operation()))
            .collect();
        if !transforms.is_empty() {
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = Self::encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    fn decode_target_change(&self, value: &JsonValue) -> FirestoreResult<WatchChange> {
        let state = match value
            .get("targetChangeType")
            .and_then(JsonValue::as_str)
            .unwrap_or("NO_CHANGE")
        {
            "ADD" => TargetChangeState::Add,
            "REMOVE" => TargetChangeState::Remove,
            "CURRENT" => TargetChangeState::Current,
            "RESET" => TargetChangeState::Reset,
            _ => TargetChangeState::NoChange,
        };
        let target_ids = numeric_array(value.get("targetIds"));
        let resume_token = value
            .get("resumeToken")
            .and_then(JsonValue::as_str)
            .and_then(|token| BASE64_STANDARD.decode(token).ok())
            .map(Bytes::from)
            .unwrap_or_default();
        let read_time = value
            .get("readTime")
            .map(Self::decode_timestamp)
            .transpose()?;
        let cause = value.get("cause").map(|cause| {
            let code = cause.get("code").and_then(JsonValue::as_i64).unwrap_or(13) as i32;
            let message = cause
                .get("message")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            map_status_code(code, message)
        });

        Ok(WatchChange::TargetChange(WatchTargetChange {
            state,
            target_ids,
            resume_token,
            read_time,
            cause,
        }))
    }

    fn decode_document_change(&self, value: &JsonValue) -> FirestoreResult<WatchChange> {
        let document = value
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange missing document"))?;
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("watch document missing name"))?;
        let key = self.name_to_key(name)?;
        let fields = document
            .get("fields")
            .map(|fields| self.decode_fields(fields))
            .transpose()?
            .unwrap_or_else(ObjectValue::empty);
        let update_time = document
            .get("updateTime")
            .map(Self::decode_timestamp)
            .transpose()?
            .unwrap_or_else(Timestamp::zero);

        Ok(WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: numeric_array(value.get("targetIds")),
            removed_target_ids: numeric_array(value.get("removedTargetIds")),
            key: key.clone(),
            new_document: Some(WatchDocument {
                key,
                fields,
                update_time,
            }),
        }))
    }

    fn decode_document_delete(&self, value: &JsonValue) -> FirestoreResult<WatchChange> {
        let name = value
            .get("document")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
        Ok(WatchChange::DocumentDelete(DocumentDelete {
            key: self.name_to_key(name)?,
            read_time: value
                .get("readTime")
                .map(Self::decode_timestamp)
                .transpose()?,
            removed_target_ids: numeric_array(value.get("removedTargetIds")),
        }))
    }

    fn decode_existence_filter(&self, value: &JsonValue) -> FirestoreResult<WatchChange> {
        let target_id = value
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
        let count = value
            .get("count")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("filter missing count"))? as i32;
        let unchanged_names = value
            .get("unchangedNames")
            .map(|names| -> FirestoreResult<BloomFilter> {
                let bits = names
                    .get("bits")
                    .ok_or_else(|| invalid_argument("unchangedNames missing bits"))?;
                let bitmap = bits
                    .get("bitmap")
                    .and_then(JsonValue::as_str)
                    .map(|b| BASE64_STANDARD.decode(b))
                    .transpose()
                    .map_err(|err| invalid_argument(format!("bad bloom bitmap: {err}")))?
                    .unwrap_or_default();
                let padding = bits
                    .get("padding")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0) as u32;
                let hash_count = names
                    .get("hashCount")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0) as u32;
                BloomFilter::new(bitmap, padding, hash_count)
            })
            .transpose()
            // An unusable filter payload falls back to the reset path rather
            // than failing the stream.
            .unwrap_or_else(|err| {
                log::warn!("ignoring undecodable bloom filter: {err}");
                None
            });

        Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count,
            unchanged_names,
        }))
    }

    // Server-side encoders used by tests and the in-memory backend.

    pub fn encode_watch_change(&self, change: &WatchChange) -> FirestoreResult<Bytes> {
        let value = match change {
            WatchChange::TargetChange(target_change) => {
                let mut body = Map::new();
                body.insert(
                    "targetChangeType".into(),
                    json!(match target_change.state {
                        TargetChangeState::NoChange => "NO_CHANGE",
                        TargetChangeState::Add => "ADD",
                        TargetChangeState::Remove => "REMOVE",
                        TargetChangeState::Current => "CURRENT",
                        TargetChangeState::Reset => "RESET",
                    }),
                );
                body.insert("targetIds".into(), json!(target_change.target_ids));
                if !target_change.resume_token.is_empty() {
                    body.insert(
                        "resumeToken".into(),
                        json!(BASE64_STANDARD.encode(&target_change.resume_token)),
                    );
                }
                if let Some(read_time) = target_change.read_time {
                    body.insert("readTime".into(), Self::encode_timestamp(read_time));
                }
                if let Some(cause) = &target_change.cause {
                    body.insert(
                        "cause".into(),
                        json!({ "code": grpc_code(cause), "message": cause.to_string() }),
                    );
                }
                json!({ "targetChange": body })
            }
            WatchChange::DocumentChange(change) => {
                let document = change
                    .new_document
                    .as_ref()
                    .ok_or_else(|| internal_error("cannot encode removal-only change"))?;
                json!({
                    "documentChange": {
                        "document": {
                            "name": self.key_to_name(&document.key),
                            "fields": self.encode_fields(&document.fields),
                            "updateTime": Self::encode_timestamp(document.update_time),
                        },
                        "targetIds": change.updated_target_ids,
                        "removedTargetIds": change.removed_target_ids,
                    }
                })
            }
            WatchChange::DocumentDelete(delete) => {
                let mut body = Map::new();
                body.insert("document".into(), json!(self.key_to_name(&delete.key)));
                if let Some(read_time) = delete.read_time {
                    body.insert("readTime".into(), Self::encode_timestamp(read_time));
                }
                body.insert("removedTargetIds".into(), json!(delete.removed_target_ids));
                json!({ "documentDelete": body })
            }
            WatchChange::ExistenceFilter(filter) => {
                let mut body = Map::new();
                body.insert("targetId".into(), json!(filter.target_id));
                body.insert("count".into(), json!(filter.count));
                if let Some(bloom) = &filter.unchanged_names {
                    body.insert(
                        "unchangedNames".into(),
                        json!({
                            "bits": {
                                "bitmap": BASE64_STANDARD.encode(bloom.bitmap()),
                                "padding": bloom.padding(),
                            },
                            "hashCount": bloom.hash_count(),
                        }),
                    );
                }
                json!({ "filter": body })
            }
        };
        to_bytes(&value)
    }

    pub fn encode_write_response(&self, response: &WriteResponse) -> FirestoreResult<Bytes> {
        let mut body = Map::new();
        body.insert(
            "streamToken".into(),
            json!(BASE64_STANDARD.encode(&response.stream_token)),
        );
        if let Some(commit_version) = response.commit_version {
            body.insert("commitTime".into(), Self::encode_timestamp(commit_version));
        }
        body.insert(
            "writeResults".into(),
            json!(response
                .write_results
                .iter()
                .map(|result| {
                    json!({
                        "updateTime": Self::encode_timestamp(result.version),
                        "transformResults": result
                            .transform_results
                            .iter()
                            .map(|v| self.encode_value(v))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>()),
        );
        to_bytes(&JsonValue::Object(body))
    }
}

impl WireCodec for JsonWireCodec {
    fn encode_add_target(&self, target: &TargetData) -> FirestoreResult<Bytes> {
        let query = target.query();
        let mut body = Map::new();
        body.insert("targetId".into(), json!(target.target_id()));
        let mut target_spec = Map::new();
        target_spec.insert("path".into(), json!(query.path().canonical_string()));
        if let Some(group) = query.collection_group_id() {
            target_spec.insert("collectionGroup".into(), json!(group));
        }
        target_spec.insert("canonicalId".into(), json!(query.canonical_id()));
        body.insert("target".into(), JsonValue::Object(target_spec));
        if !target.resume_token().is_empty() {
            body.insert(
                "resumeToken".into(),
                json!(BASE64_STANDARD.encode(target.resume_token())),
            );
        }
        to_bytes(&json!({ "database": self.database_name(), "addTarget": body }))
    }

    fn encode_remove_target(&self, target_id: i32) -> FirestoreResult<Bytes> {
        to_bytes(&json!({ "database": self.database_name(), "removeTarget": target_id }))
    }

    fn decode_watch_change(&self, payload: &Bytes) -> FirestoreResult<Option<WatchChange>> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode watch message: {err}")))?;
        if let Some(target_change) = value.get("targetChange") {
            return self.decode_target_change(target_change).map(Some);
        }
        if let Some(document_change) = value.get("documentChange") {
            return self.decode_document_change(document_change).map(Some);
        }
        if let Some(document_delete) = value.get("documentDelete") {
            return self.decode_document_delete(document_delete).map(Some);
        }
        if let Some(filter) = value.get("filter") {
            return self.decode_existence_filter(filter).map(Some);
        }
        Ok(None)
    }

    fn encode_write_handshake(&self) -> FirestoreResult<Bytes> {
        to_bytes(&json!({ "database": self.database_name() }))
    }

    fn encode_write_request(
        &self,
        stream_token: &Bytes,
        batch: &MutationBatch,
    ) -> FirestoreResult<Bytes> {
        to_bytes(&json!({
            "database": self.database_name(),
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": batch
                .mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        }))
    }

    fn decode_write_response(&self, payload: &Bytes) -> FirestoreResult<WriteResponse> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode write response: {err}")))?;
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| BASE64_STANDARD.decode(token))
            .transpose()
            .map_err(|err| internal_error(format!("invalid stream token: {err}")))?
            .map(Bytes::from)
            .ok_or_else(|| internal_error("write response missing streamToken"))?;
        let commit_version = value
            .get("commitTime")
            .map(Self::decode_timestamp)
            .transpose()?;
        let write_results = value
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(|entry| {
                        let version = entry
                            .get("updateTime")
                            .map(Self::decode_timestamp)
                            .transpose()?
                            .or(commit_version)
                            .unwrap_or_else(Timestamp::zero);
                        let transform_results = entry
                            .get("transformResults")
                            .and_then(JsonValue::as_array)
                            .map(|values| {
                                values
                                    .iter()
                                    .map(|v| self.decode_value(v))
                                    .collect::<FirestoreResult<Vec<_>>>()
                            })
                            .transpose()?
                            .unwrap_or_default();
                        Ok(MutationResult {
                            version,
                            transform_results,
                        })
                    })
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|v| v as i32))
                .collect()
        })
        .unwrap_or_default()
}

fn to_bytes(value: &JsonValue) -> FirestoreResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| internal_error(format!("failed to encode message: {err}")))
}

fn grpc_code(error: &crate::error::FirestoreError) -> i32 {
    use crate::error::FirestoreErrorCode::*;
    match error.code {
        Cancelled => 1,
        InvalidArgument => 3,
        DeadlineExceeded => 4,
        NotFound => 5,
        AlreadyExists => 6,
        PermissionDenied => 7,
        ResourceExhausted => 8,
        FailedPrecondition => 9,
        Aborted => 10,
        Internal => 13,
        Unavailable => 14,
        Unauthenticated => 16,
    }
}
