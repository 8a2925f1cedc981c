//! Error types for granule accumulation.

use thiserror::Error;

/// Errors from merging an arrival into the pending table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccumulateError {
    /// The type was already satisfied for this granule. State is unchanged.
    #[error("Granule {id} already has file type {type_name}")]
    DuplicateType { id: String, type_name: String },

    /// Two records with different ids were merged. Indicates a routing bug.
    #[error("Cannot merge granule {incoming} into granule {existing}")]
    IdMismatch { existing: String, incoming: String },
}

impl AccumulateError {
    /// Whether the error is an expected, benign occurrence.
    pub fn is_benign(&self) -> bool {
        matches!(self, AccumulateError::DuplicateType { .. })
    }
}
