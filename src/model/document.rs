use crate::model::{DocumentKey, ObjectValue, Timestamp};

/// What the cache knows about a document's existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// Nothing is known; the document was never read from the backend.
    Invalid,
    /// The backend confirmed the document does not exist.
    NoDocument,
    /// The document exists and `data` holds its fields.
    FoundDocument,
    /// A mutation was acknowledged but the resulting state was never
    /// observed, so existence is unknown until the next watch update.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document in the local cache, tagged with how much the client knows
/// about it.
///
/// The version is the server commit timestamp at which the current state was
/// observed. It never decreases over the document's lifetime except through
/// an explicit target reset.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: Timestamp,
    data: ObjectValue,
    state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: Timestamp::zero(),
            data: ObjectValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: Timestamp, data: ObjectValue) -> Self {
        Self {
            key,
            document_type: DocumentType::FoundDocument,
            version,
            data,
            state: DocumentState::Synced,
        }
    }

    pub fn new_no_document(key: DocumentKey, version: Timestamp) -> Self {
        Self {
            key,
            document_type: DocumentType::NoDocument,
            version,
            data: ObjectValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_unknown(key: DocumentKey, version: Timestamp) -> Self {
        Self {
            key,
            document_type: DocumentType::UnknownDocument,
            version,
            data: ObjectValue::empty(),
            state: DocumentState::HasCommittedMutations,
        }
    }

    pub fn convert_to_found(&mut self, version: Timestamp, data: ObjectValue) -> &mut Self {
        self.document_type = DocumentType::FoundDocument;
        self.version = version;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: Timestamp) -> &mut Self {
        self.document_type = DocumentType::NoDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: Timestamp) -> &mut Self {
        self.document_type = DocumentType::UnknownDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = Timestamp::zero();
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + self.data.approximate_byte_size() + 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn fields() -> ObjectValue {
        let mut map = BTreeMap::new();
        map.insert("owner".to_string(), FieldValue::from_string("jonny"));
        ObjectValue::new(map)
    }

    #[test]
    fn found_document_roundtrip() {
        let doc = MutableDocument::new_found(key(), Timestamp::new(1, 0), fields());
        assert!(doc.is_found_document());
        assert!(!doc.has_pending_writes());
        assert_eq!(doc.version(), Timestamp::new(1, 0));
    }

    #[test]
    fn local_mutations_clear_the_version() {
        let mut doc = MutableDocument::new_found(key(), Timestamp::new(1, 0), fields());
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_zero());
    }

    #[test]
    fn invalid_document_is_not_valid() {
        let doc = MutableDocument::new_invalid(key());
        assert!(!doc.is_valid_document());
        assert!(!doc.is_found_document());
    }
}
