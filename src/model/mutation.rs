use std::collections::BTreeSet;

use bytes::Bytes;

use crate::error::{internal_error, FirestoreResult};
use crate::model::{
    DocumentKey, FieldPath, FieldValue, MutableDocument, ObjectValue, Timestamp, ValueKind,
};

/// Set of field paths affected by a patch; paths in the mask with no value in
/// the patch data mean "delete this field".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    paths: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|mask| mask.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        let mut paths = self.paths.clone();
        paths.extend(other.paths.iter().cloned());
        FieldMask { paths }
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.paths.insert(path);
    }
}

/// Server-side value transformation applied atomically with a write.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FieldValue>),
    ArrayRemove(Vec<FieldValue>),
    NumericIncrement(FieldValue),
}

impl TransformOperation {
    /// Resolves the transform against the previous local view of the field.
    ///
    /// The server timestamp resolves to a wall-clock estimate until the write
    /// is acknowledged; increments add to the last local value so repeated
    /// local applications stay consistent with what the backend will compute.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FieldValue>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<FieldValue> {
        match self {
            TransformOperation::ServerTimestamp => {
                Ok(FieldValue::from_timestamp(local_write_time))
            }
            TransformOperation::ArrayUnion(elements) => Ok(array_union(previous, elements)),
            TransformOperation::ArrayRemove(elements) => Ok(array_remove(previous, elements)),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Replaces the local estimate with the authoritative server result.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FieldValue>,
        transform_result: Option<&FieldValue>,
    ) -> FirestoreResult<FieldValue> {
        match transform_result {
            Some(result) => Ok(result.clone()),
            // Acks from older backends may omit transform results; fall back
            // to the deterministic local computation at the commit time.
            None => self.apply_to_local_view(previous, Timestamp::now()),
        }
    }
}

fn array_union(existing: Option<&FieldValue>, additions: &[FieldValue]) -> FieldValue {
    let mut values = match existing.map(FieldValue::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => Vec::new(),
    };
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FieldValue::from_array(values)
}

fn array_remove(existing: Option<&FieldValue>, removals: &[FieldValue]) -> FieldValue {
    let values = match existing.map(FieldValue::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => Vec::new(),
    };
    let filtered: Vec<FieldValue> = values
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FieldValue::from_array(filtered)
}

fn numeric_increment(
    existing: Option<&FieldValue>,
    operand: &FieldValue,
) -> FirestoreResult<FieldValue> {
    let result = match (existing.map(FieldValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            match current.checked_add(*delta) {
                Some(sum) => FieldValue::from_integer(sum),
                None => FieldValue::from_double(*current as f64 + *delta as f64),
            }
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            FieldValue::from_double(*current + *delta as f64)
        }
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            FieldValue::from_double(*current as f64 + *delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => {
            FieldValue::from_double(*current + *delta)
        }
        (_, ValueKind::Integer(delta)) => FieldValue::from_integer(*delta),
        (_, ValueKind::Double(delta)) => FieldValue::from_double(*delta),
        (_, _) => {
            return Err(internal_error(
                "increment transform requires a numeric operand",
            ))
        }
    };
    Ok(result)
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Guard the backend evaluates before applying a mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_validated_by(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => document.is_found_document() == *exists,
            Precondition::UpdateTime(time) => {
                document.is_found_document() && document.version() == *time
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }
}

/// Per-write server acknowledgement.
#[derive(Clone, Debug, Default)]
pub struct MutationResult {
    pub version: Timestamp,
    pub transform_results: Vec<FieldValue>,
}

/// A single locally-created write.
///
/// A closed union: every consumer switches over the four kinds explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replace the whole document (or create it).
    Set {
        key: DocumentKey,
        value: ObjectValue,
        field_transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    /// Merge the masked fields into the existing document.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        field_transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// No-op write used to assert a precondition inside a batch.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            field_transforms: Vec::new(),
            precondition: Precondition::None,
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            field_transforms: Vec::new(),
            precondition: Precondition::Exists(true),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_transforms(self, transforms: Vec<FieldTransform>) -> Self {
        match self {
            Mutation::Set {
                key,
                value,
                precondition,
                ..
            } => Mutation::Set {
                key,
                value,
                field_transforms: transforms,
                precondition,
            },
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
                ..
            } => Mutation::Patch {
                key,
                data,
                field_mask,
                field_transforms: transforms,
                precondition,
            },
            other => other,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            _ => &[],
        }
    }

    /// Applies an acknowledged mutation to the cached document.
    ///
    /// The backend has already committed the write; preconditions are only
    /// consulted to decide whether the resulting state is knowable (a patch
    /// whose precondition no longer holds leaves the document unknown).
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        debug_assert_eq!(self.key(), document.key());
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut data = value.clone();
                apply_transform_results(
                    &mut data,
                    document.data(),
                    field_transforms,
                    &result.transform_results,
                )?;
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_validated_by(document) {
                    document.convert_to_unknown(result.version);
                    return Ok(());
                }
                let mut patched = document.data().clone();
                apply_patch(&mut patched, data, field_mask);
                apply_transform_results(
                    &mut patched,
                    document.data(),
                    field_transforms,
                    &result.transform_results,
                )?;
                document
                    .convert_to_found(result.version, patched)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
        Ok(())
    }

    /// Applies this mutation to the latency-compensated local view.
    ///
    /// Returns the accumulated mask of locally mutated fields; `None` means
    /// "the whole document" (after a set or delete).
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<Option<FieldMask>> {
        debug_assert_eq!(self.key(), document.key());
        match self {
            Mutation::Set {
                value,
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_validated_by(document) {
                    return Ok(previous_mask);
                }
                let mut data = value.clone();
                apply_local_transforms(
                    &mut data,
                    document.data(),
                    field_transforms,
                    local_write_time,
                )?;
                let version = document.version();
                document
                    .convert_to_found(version, data)
                    .set_has_local_mutations();
                Ok(None)
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_validated_by(document) {
                    return Ok(previous_mask);
                }
                let mut patched = document.data().clone();
                apply_patch(&mut patched, data, field_mask);
                apply_local_transforms(
                    &mut patched,
                    document.data(),
                    field_transforms,
                    local_write_time,
                )?;
                let version = document.version();
                document
                    .convert_to_found(version, patched)
                    .set_has_local_mutations();

                Ok(previous_mask.map(|mask| {
                    let mut mask = mask.union(field_mask);
                    for transform in field_transforms {
                        mask.insert(transform.field_path().clone());
                    }
                    mask
                }))
            }
            Mutation::Delete { precondition, .. } => {
                if !precondition.is_validated_by(document) {
                    return Ok(previous_mask);
                }
                document
                    .convert_to_no_document(Timestamp::zero())
                    .set_has_local_mutations();
                Ok(None)
            }
            Mutation::Verify { .. } => Ok(previous_mask),
        }
    }
}

fn apply_patch(target: &mut ObjectValue, data: &ObjectValue, mask: &FieldMask) {
    for path in mask.paths() {
        match data.field(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn apply_local_transforms(
    target: &mut ObjectValue,
    base: &ObjectValue,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) -> FirestoreResult<()> {
    for transform in transforms {
        // Transforms resolve against the previous overlaid value, which at
        // this point is present in `target` for earlier transforms in the
        // same write and in `base` otherwise.
        let previous = target
            .field(transform.field_path())
            .or_else(|| base.field(transform.field_path()))
            .cloned();
        let value = transform
            .operation()
            .apply_to_local_view(previous.as_ref(), local_write_time)?;
        target.set(transform.field_path(), value);
    }
    Ok(())
}

fn apply_transform_results(
    target: &mut ObjectValue,
    base: &ObjectValue,
    transforms: &[FieldTransform],
    results: &[FieldValue],
) -> FirestoreResult<()> {
    for (index, transform) in transforms.iter().enumerate() {
        let previous = base.field(transform.field_path()).cloned();
        let value = transform
            .operation()
            .apply_to_remote_document(previous.as_ref(), results.get(index))?;
        target.set(transform.field_path(), value);
    }
    Ok(())
}

/// Builds the memoized overlay for a document from its mutated-field mask.
///
/// `mask == None` collapses to a single set (or delete when the local view is
/// a no-document); a masked result collapses to a patch carrying only the
/// surviving local values. Returns `None` when the document carries no local
/// changes.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    match mask {
        None => {
            if document.is_no_document() {
                Some(Mutation::delete(document.key().clone()))
            } else {
                Some(Mutation::set(document.key().clone(), document.data().clone()))
            }
        }
        Some(mask) => {
            if mask.is_empty() {
                return None;
            }
            let mut data = ObjectValue::empty();
            let mut overlay_mask = FieldMask::default();
            for path in mask.paths() {
                if overlay_mask.covers(path) {
                    continue;
                }
                match document.data().field(path) {
                    Some(value) => data.set(path, value.clone()),
                    // An ancestor of the deleted field may itself be gone;
                    // widen the mask to the highest missing ancestor.
                    None => {
                        let segments = path.segments();
                        if segments.len() > 1 {
                            let parent =
                                FieldPath::new(segments[..segments.len() - 1].iter().cloned())
                                    .expect("non-empty parent path");
                            overlay_mask.insert(parent);
                            continue;
                        }
                    }
                }
                overlay_mask.insert(path.clone());
            }
            Some(Mutation::Patch {
                key: document.key().clone(),
                data,
                field_mask: overlay_mask,
                field_transforms: Vec::new(),
                precondition: Precondition::None,
            })
        }
    }
}

/// Ordered, atomically-applied group of mutations sharing one batch id.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: i32, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies the batch's acknowledged results to a cached document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            let mutation_result = result.mutation_results.get(index).ok_or_else(|| {
                internal_error("mutation batch result is missing a write result")
            })?;
            mutation.apply_to_remote_document(document, mutation_result)?;
        }
        Ok(())
    }

    /// Applies the batch to the latency-compensated view of a document.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> FirestoreResult<Option<FieldMask>> {
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time)?;
            }
        }
        Ok(mutated_fields)
    }
}

/// Acknowledgement of a committed batch, pairing each mutation with its
/// server result.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: Timestamp,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: Timestamp,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "expected {} write results, got {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
        })
    }

    pub fn batch_id(&self) -> i32 {
        self.batch.batch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn object(entries: &[(&str, FieldValue)]) -> ObjectValue {
        let mut map = BTreeMap::new();
        for (name, value) in entries {
            map.insert((*name).to_string(), value.clone());
        }
        ObjectValue::new(map)
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[("old", FieldValue::from_bool(true))]),
        );
        let mutation = Mutation::set(key(), object(&[("x", FieldValue::from_integer(2))]));
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap();
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(
            doc.data().field(&path("x")),
            Some(&FieldValue::from_integer(2))
        );
        assert!(doc.data().field(&path("old")).is_none());
    }

    #[test]
    fn patch_only_touches_masked_fields() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[
                ("keep", FieldValue::from_string("yes")),
                ("drop", FieldValue::from_string("no")),
            ]),
        );
        let mutation = Mutation::patch(
            key(),
            object(&[("keep", FieldValue::from_string("updated"))]),
            FieldMask::new([path("keep"), path("drop")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap()
            .unwrap();
        assert!(mask.covers(&path("keep")));
        assert_eq!(
            doc.data().field(&path("keep")),
            Some(&FieldValue::from_string("updated"))
        );
        // Masked but absent from the patch data: deleted.
        assert!(doc.data().field(&path("drop")).is_none());
    }

    #[test]
    fn patch_on_missing_document_is_skipped() {
        let mut doc = MutableDocument::new_invalid(key());
        let mutation = Mutation::patch(
            key(),
            object(&[("x", FieldValue::from_integer(1))]),
            FieldMask::new([path("x")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap();
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn increment_resolves_against_previous_local_value() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[("count", FieldValue::from_integer(5))]),
        );
        let mutation = Mutation::patch(
            key(),
            ObjectValue::empty(),
            FieldMask::default(),
        )
        .with_transforms(vec![FieldTransform::new(
            path("count"),
            TransformOperation::NumericIncrement(FieldValue::from_integer(3)),
        )]);
        mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap();
        assert_eq!(
            doc.data().field(&path("count")),
            Some(&FieldValue::from_integer(8))
        );

        // Applying a second increment folds on top of the first estimate.
        mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(3, 0))
            .unwrap();
        assert_eq!(
            doc.data().field(&path("count")),
            Some(&FieldValue::from_integer(11))
        );
    }

    #[test]
    fn increment_overflow_degrades_to_double() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[("count", FieldValue::from_integer(i64::MAX))]),
        );
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::default())
            .with_transforms(vec![FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FieldValue::from_integer(1)),
            )]);
        mutation
            .apply_to_local_view(&mut doc, None, Timestamp::new(2, 0))
            .unwrap();
        match doc.data().field(&path("count")).unwrap().kind() {
            ValueKind::Double(_) => {}
            other => panic!("expected double after overflow, got {other:?}"),
        }
    }

    #[test]
    fn server_timestamp_uses_local_estimate_then_server_result() {
        let mut doc = MutableDocument::new_invalid(key());
        let mutation = Mutation::set(key(), ObjectValue::empty()).with_transforms(vec![
            FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
        ]);
        mutation
            .apply_to_local_view(&mut doc, None, Timestamp::new(10, 0))
            .unwrap();
        assert_eq!(
            doc.data().field(&path("at")),
            Some(&FieldValue::from_timestamp(Timestamp::new(10, 0)))
        );

        let result = MutationResult {
            version: Timestamp::new(20, 0),
            transform_results: vec![FieldValue::from_timestamp(Timestamp::new(19, 0))],
        };
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.has_committed_mutations());
        assert_eq!(
            doc.data().field(&path("at")),
            Some(&FieldValue::from_timestamp(Timestamp::new(19, 0)))
        );
        assert_eq!(doc.version(), Timestamp::new(20, 0));
    }

    #[test]
    fn array_union_and_remove() {
        let base = FieldValue::from_array(vec![
            FieldValue::from_string("a"),
            FieldValue::from_string("b"),
        ]);
        let unioned = TransformOperation::ArrayUnion(vec![
            FieldValue::from_string("b"),
            FieldValue::from_string("c"),
        ])
        .apply_to_local_view(Some(&base), Timestamp::zero())
        .unwrap();
        match unioned.kind() {
            ValueKind::Array(values) => assert_eq!(values.len(), 3),
            _ => panic!("expected array"),
        }

        let removed = TransformOperation::ArrayRemove(vec![FieldValue::from_string("a")])
            .apply_to_local_view(Some(&base), Timestamp::zero())
            .unwrap();
        match removed.kind() {
            ValueKind::Array(values) => {
                assert_eq!(values, &vec![FieldValue::from_string("b")]);
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn rejected_patch_precondition_leaves_unknown_document_on_ack() {
        let mut doc = MutableDocument::new_invalid(key());
        let mutation = Mutation::patch(
            key(),
            object(&[("x", FieldValue::from_integer(1))]),
            FieldMask::new([path("x")]),
        );
        let result = MutationResult {
            version: Timestamp::new(5, 0),
            transform_results: Vec::new(),
        };
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.is_unknown_document());
    }

    #[test]
    fn overlay_collapses_to_set_without_mask() {
        let mut doc = MutableDocument::new_invalid(key());
        Mutation::set(key(), object(&[("x", FieldValue::from_integer(1))]))
            .apply_to_local_view(&mut doc, None, Timestamp::new(1, 0))
            .unwrap();
        match calculate_overlay_mutation(&doc, None) {
            Some(Mutation::Set { .. }) => {}
            other => panic!("expected set overlay, got {other:?}"),
        }
    }

    #[test]
    fn overlay_collapses_to_patch_with_mask() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[("x", FieldValue::from_integer(1))]),
        );
        let mask = Mutation::patch(
            key(),
            object(&[("x", FieldValue::from_integer(2))]),
            FieldMask::new([path("x")]),
        )
        .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
        .unwrap();
        match calculate_overlay_mutation(&doc, mask.as_ref()) {
            Some(Mutation::Patch { field_mask, .. }) => {
                assert!(field_mask.covers(&path("x")));
            }
            other => panic!("expected patch overlay, got {other:?}"),
        }
    }

    #[test]
    fn overlay_for_local_delete_is_delete() {
        let mut doc = MutableDocument::new_found(
            key(),
            Timestamp::new(1, 0),
            object(&[("x", FieldValue::from_integer(1))]),
        );
        Mutation::delete(key())
            .apply_to_local_view(&mut doc, None, Timestamp::new(2, 0))
            .unwrap();
        match calculate_overlay_mutation(&doc, None) {
            Some(Mutation::Delete { .. }) => {}
            other => panic!("expected delete overlay, got {other:?}"),
        }
    }
}
