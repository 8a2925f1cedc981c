//! Accumulated state for one granule.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::error::AccumulateError;

/// Everything observed so far for one granule id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleRecord {
    pub id: String,
    /// File types seen for this granule.
    pub satisfied_types: BTreeSet<String>,
    /// Path of the file fed to stage 1, once it has arrived.
    pub trigger_file: Option<PathBuf>,
    /// Companion flags raised by ancillary types.
    pub ancillary_flags: BTreeSet<String>,
}

impl GranuleRecord {
    /// An empty record for a newly seen id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            satisfied_types: BTreeSet::new(),
            trigger_file: None,
            ancillary_flags: BTreeSet::new(),
        }
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.satisfied_types.contains(type_name)
    }

    /// Merge another record for the same granule into this one.
    ///
    /// Types and flags are unioned. The first known trigger path is kept.
    pub fn merge(&mut self, other: GranuleRecord) -> Result<(), AccumulateError> {
        if self.id != other.id {
            return Err(AccumulateError::IdMismatch {
                existing: self.id.clone(),
                incoming: other.id,
            });
        }

        self.satisfied_types.extend(other.satisfied_types);
        self.ancillary_flags.extend(other.ancillary_flags);
        if self.trigger_file.is_none() {
            self.trigger_file = other.trigger_file;
        }
        Ok(())
    }
}
