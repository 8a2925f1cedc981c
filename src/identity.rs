//! Filename classification into (file type, granule id).
//!
//! An [`IdentityExtractor`] holds an ordered, immutable list of
//! [`FileTypeSpec`]s. The first spec whose pattern matches a filename decides
//! its type. The granule id is the concatenation, in order of occurrence, of
//! the `id` capture across *every* match of that pattern, so schemes that split
//! the id over repeated token positions are supported.

use regex::Regex;
use std::path::Path;
use thiserror::Error;

use crate::config::ConfigError;

/// Name of the capture group carrying the granule id.
pub const ID_GROUP: &str = "id";

/// Errors raised while classifying a filename.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("No file type pattern matches '{filename}'")]
    NoPatternMatch { filename: String },

    #[error("Pattern for '{type_name}' matched '{filename}' but captured an empty id")]
    MissingIdGroup { type_name: String, filename: String },
}

/// A configured file type.
#[derive(Debug, Clone)]
pub struct FileTypeSpec {
    pub name: String,
    pub id_pattern: Regex,
    pub required: bool,
}

impl FileTypeSpec {
    /// Compile a spec, rejecting patterns without an `id` group.
    pub fn new(name: &str, pattern: &str, required: bool) -> Result<Self, ConfigError> {
        let id_pattern = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        if !id_pattern.capture_names().flatten().any(|n| n == ID_GROUP) {
            return Err(ConfigError::MissingIdGroup {
                name: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            id_pattern,
            required,
        })
    }
}

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub type_name: String,
    pub granule_id: String,
}

/// Classifies filenames against an ordered list of file type specs.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    specs: Vec<FileTypeSpec>,
}

impl IdentityExtractor {
    pub fn new(specs: Vec<FileTypeSpec>) -> Self {
        Self { specs }
    }

    /// Names of the types flagged as required, in priority order.
    pub fn required_types(&self) -> Vec<String> {
        self.specs
            .iter()
            .filter(|s| s.required)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Classify a bare filename.
    pub fn classify(&self, filename: &str) -> Result<Classification, ClassifyError> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.id_pattern.is_match(filename))
            .ok_or_else(|| ClassifyError::NoPatternMatch {
                filename: filename.to_string(),
            })?;

        let granule_id: String = spec
            .id_pattern
            .captures_iter(filename)
            .filter_map(|caps| caps.name(ID_GROUP))
            .map(|m| m.as_str())
            .collect();

        if granule_id.is_empty() {
            return Err(ClassifyError::MissingIdGroup {
                type_name: spec.name.clone(),
                filename: filename.to_string(),
            });
        }

        Ok(Classification {
            type_name: spec.name.clone(),
            granule_id,
        })
    }

    /// Classify the final component of a path.
    pub fn classify_path(&self, path: &Path) -> Result<Classification, ClassifyError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        self.classify(&filename)
    }
}
