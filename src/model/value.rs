use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{FieldPath, Timestamp};

/// Field-value tree stored in a document.
///
/// The wire representation is produced by the injected codec; this type only
/// defines structure, equality and the total order used by queries and
/// indexes.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Reference(String),
    Array(Vec<FieldValue>),
    Map(ObjectValue),
}

/// Map of field names to values; the root of every document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: Vec<u8>) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_array(values: Vec<FieldValue>) -> Self {
        Self {
            kind: ValueKind::Array(values),
        }
    }

    pub fn from_map(map: BTreeMap<String, FieldValue>) -> Self {
        Self {
            kind: ValueKind::Map(ObjectValue::new(map)),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    fn type_order(&self) -> u8 {
        match &self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::String(_) => 4,
            ValueKind::Bytes(_) => 5,
            ValueKind::Reference(_) => 6,
            ValueKind::Array(_) => 8,
            ValueKind::Map(_) => 9,
        }
    }

    /// Total order across all value kinds: values of different types compare
    /// by type order; numbers compare cross-type so `1 == 1.0` sorts stably.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
            (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
            (ValueKind::Double(a), ValueKind::Double(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (ValueKind::Integer(a), ValueKind::Double(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (ValueKind::Double(a), ValueKind::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
            (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
            (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
            (ValueKind::Reference(a), ValueKind::Reference(b)) => a.cmp(b),
            (ValueKind::Array(a), ValueKind::Array(b)) => {
                for (l, r) in a.iter().zip(b.iter()) {
                    match l.compare(r) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            (ValueKind::Map(a), ValueKind::Map(b)) => {
                for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                    match lk.cmp(rk).then_with(|| lv.compare(rv)) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.fields().len().cmp(&b.fields().len())
            }
            _ => Ordering::Equal,
        }
    }
}

impl ObjectValue {
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FieldValue> {
        self.fields
    }

    /// Resolves the value at a (possibly nested) field path.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut current = &self.fields;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.get(segment)?;
            if index == segments.len() - 1 {
                return Some(value);
            }
            match value.kind() {
                ValueKind::Map(child) => current = &child.fields,
                _ => return None,
            }
        }
        None
    }

    /// Sets `value` at `path`, creating intermediate maps as needed.
    pub fn set(&mut self, path: &FieldPath, value: FieldValue) {
        Self::set_at_segments(&mut self.fields, path.segments(), value);
    }

    fn set_at_segments(
        fields: &mut BTreeMap<String, FieldValue>,
        segments: &[String],
        value: FieldValue,
    ) {
        let (first, rest) = match segments.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            fields.insert(first.clone(), value);
            return;
        }

        let child = match fields.get_mut(first) {
            Some(existing) => match &mut existing.kind {
                ValueKind::Map(map) => map,
                _ => {
                    *existing = FieldValue::from_map(BTreeMap::new());
                    match &mut existing.kind {
                        ValueKind::Map(map) => map,
                        _ => unreachable!(),
                    }
                }
            },
            None => {
                fields.insert(first.clone(), FieldValue::from_map(BTreeMap::new()));
                match &mut fields.get_mut(first).expect("just inserted").kind {
                    ValueKind::Map(map) => map,
                    _ => unreachable!(),
                }
            }
        };
        Self::set_at_segments(&mut child.fields, rest, value);
    }

    /// Removes the value at `path`; empty intermediate maps are dropped.
    pub fn delete(&mut self, path: &FieldPath) {
        Self::delete_at_segments(&mut self.fields, path.segments());
    }

    fn delete_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String]) {
        let (first, rest) = match segments.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            fields.remove(first);
            return;
        }
        if let Some(value) = fields.get_mut(first) {
            if let ValueKind::Map(child) = &mut value.kind {
                Self::delete_at_segments(&mut child.fields, rest);
                if child.fields.is_empty() {
                    fields.remove(first);
                }
            }
        }
    }

    /// Rough in-memory footprint used by the cache size accounting.
    pub fn approximate_byte_size(&self) -> usize {
        fn value_size(value: &FieldValue) -> usize {
            match value.kind() {
                ValueKind::Null | ValueKind::Boolean(_) => 1,
                ValueKind::Integer(_) | ValueKind::Double(_) => 8,
                ValueKind::Timestamp(_) => 12,
                ValueKind::String(s) | ValueKind::Reference(s) => s.len(),
                ValueKind::Bytes(b) => b.len(),
                ValueKind::Array(values) => values.iter().map(value_size).sum(),
                ValueKind::Map(map) => map.approximate_byte_size(),
            }
        }
        self.fields
            .iter()
            .map(|(name, value)| name.len() + value_size(value))
            .sum()
    }
}
