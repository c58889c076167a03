use std::cmp::Ordering;

use crate::model::{DocumentKey, FieldPath, FieldValue, MutableDocument, ResourcePath, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FieldValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FieldValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    fn matches(&self, document: &MutableDocument) -> bool {
        let value = if self.field.is_document_id() {
            Some(FieldValue::from_reference(
                document.key().path().canonical_string(),
            ))
        } else {
            document.data().field(&self.field).cloned()
        };

        match value {
            Some(value) => self.matches_value(&value),
            None => match self.op {
                FilterOperator::NotEqual => self.matches_value(&FieldValue::null()),
                _ => false,
            },
        }
    }

    fn matches_value(&self, value: &FieldValue) -> bool {
        match self.op {
            FilterOperator::Equal => value == &self.value,
            FilterOperator::NotEqual => value != &self.value,
            FilterOperator::LessThan => value.compare(&self.value) == Ordering::Less,
            FilterOperator::LessThanOrEqual => value.compare(&self.value) != Ordering::Greater,
            FilterOperator::GreaterThan => value.compare(&self.value) == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => value.compare(&self.value) != Ordering::Less,
            FilterOperator::ArrayContains => match value.kind() {
                ValueKind::Array(values) => values.iter().any(|candidate| candidate == &self.value),
                _ => false,
            },
            FilterOperator::ArrayContainsAny => match (value.kind(), self.value.kind()) {
                (ValueKind::Array(values), ValueKind::Array(needles)) => needles
                    .iter()
                    .any(|needle| values.iter().any(|candidate| candidate == needle)),
                _ => false,
            },
            FilterOperator::In => match self.value.kind() {
                ValueKind::Array(values) => values.iter().any(|needle| needle == value),
                _ => false,
            },
            FilterOperator::NotIn => match self.value.kind() {
                ValueKind::Array(values) => {
                    !matches!(value.kind(), ValueKind::Null)
                        && values.iter().all(|needle| needle != value)
                }
                _ => false,
            },
        }
    }

    fn canonical_string(&self) -> String {
        format!(
            "{}{:?}{:?}",
            self.field.canonical_string(),
            self.op,
            self.value
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Cursor over the order-by positions of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FieldValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FieldValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FieldValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (index, order) in order_by.iter().enumerate() {
            let Some(bound_value) = self.position.get(index) else {
                break;
            };
            let doc_value = if order.field().is_document_id() {
                FieldValue::from_reference(document.key().path().canonical_string())
            } else {
                document
                    .data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or_else(FieldValue::null)
            };
            let mut ordering = bound_value.compare(&doc_value);
            if order.direction() == Direction::Descending {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// Normalized query over one collection or collection group.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<usize>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            path: ResourcePath::root(),
            collection_group: Some(collection_id.into()),
            ..Self::collection(ResourcePath::root())
        }
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::collection(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit(mut self, limit: usize, limit_type: LimitType) -> Self {
        self.limit = Some(limit);
        self.limit_type = limit_type;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// The collection id the query scans, used for index lookups.
    pub fn collection_id(&self) -> Option<&str> {
        self.collection_group
            .as_deref()
            .or_else(|| self.path.last_segment())
    }

    /// Order-by list with the key tiebreak appended, which makes query
    /// results fully deterministic.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let has_key_ordering = order_by
            .iter()
            .any(|order| order.field().is_document_id());
        if !has_key_ordering {
            let direction = order_by
                .last()
                .map(|order| order.direction())
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches_key(&self, key: &DocumentKey) -> bool {
        if let Some(group) = &self.collection_group {
            key.collection_group() == group && self.path.is_prefix_of(key.path())
        } else if self.path.is_document_path() {
            key.path() == &self.path
        } else {
            &key.collection_path() == &self.path
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_key(document.key())
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            let ordering = bound.compare_to_document(&order_by, document);
            let within = if bound.inclusive() {
                ordering != Ordering::Greater
            } else {
                ordering == Ordering::Less
            };
            if !within {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            let ordering = bound.compare_to_document(&order_by, document);
            let within = if bound.inclusive() {
                ordering != Ordering::Less
            } else {
                ordering == Ordering::Greater
            };
            if !within {
                return false;
            }
        }
        true
    }

    /// Comparator induced by the normalized order-by list.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field().is_document_id() {
                left.key().cmp(right.key())
            } else {
                let left_value = left
                    .data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or_else(FieldValue::null);
                let right_value = right
                    .data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or_else(FieldValue::null);
                left_value.compare(&right_value)
            };
            let ordering = if order.direction() == Direction::Descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable identity for target-cache lookups; queries with the same
    /// canonical id share a watch target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_string());
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            id.push_str(&order.field().canonical_string());
            id.push_str(match order.direction() {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!(
                "|l:{limit}{}",
                match self.limit_type {
                    LimitType::First => "f",
                    LimitType::Last => "l",
                }
            ));
        }
        if let Some(bound) = &self.start_at {
            id.push_str(&format!("|sa:{}{:?}", bound.inclusive(), bound.position()));
        }
        if let Some(bound) = &self.end_at {
            id.push_str(&format!("|ea:{}{:?}", bound.inclusive(), bound.position()));
        }
        id
    }

    /// Whether the query's filter/order shape is fully described by the given
    /// ordered list of field paths (used by the index manager).
    pub fn indexed_fields(&self) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = Vec::new();
        for filter in &self.filters {
            if !fields.contains(filter.field()) {
                fields.push(filter.field().clone());
            }
        }
        for order in &self.explicit_order_by {
            if !order.field().is_document_id() && !fields.contains(order.field()) {
                fields.push(order.field().clone());
            }
        }
        fields
    }
}
