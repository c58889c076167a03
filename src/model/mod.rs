pub mod document;
pub mod document_key;
pub mod field_path;
pub mod mutation;
pub mod resource_path;
pub mod timestamp;
pub mod value;

pub use document::{DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationBatch,
    MutationBatchResult, MutationResult, Precondition, TransformOperation,
};
pub use resource_path::ResourcePath;
pub use timestamp::Timestamp;
pub use value::{FieldValue, ObjectValue, ValueKind};
