//! Completeness predicate for a granule.

use std::collections::{BTreeMap, BTreeSet};

use super::record::GranuleRecord;

/// Decides when a granule has everything the pipeline needs.
///
/// Two deployment forms are supported:
/// - a plain list of required type names;
/// - the list plus companion flags, each raised when its ancillary type is seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionRule {
    required_types: BTreeSet<String>,
    /// flag name -> file type raising it
    ancillary_flags: BTreeMap<String, String>,
}

impl CompletionRule {
    /// Complete once every listed type has been seen.
    pub fn types<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_types: required.into_iter().map(Into::into).collect(),
            ancillary_flags: BTreeMap::new(),
        }
    }

    /// Additionally require each flag, raised when its mapped type is seen.
    pub fn with_flags<I, F, T>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = (F, T)>,
        F: Into<String>,
        T: Into<String>,
    {
        self.ancillary_flags
            .extend(flags.into_iter().map(|(f, t)| (f.into(), t.into())));
        self
    }

    pub fn required_types(&self) -> &BTreeSet<String> {
        &self.required_types
    }

    /// Flags raised by an arrival of `type_name`.
    pub fn flags_raised_by<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.ancillary_flags
            .iter()
            .filter(move |(_, t)| t.as_str() == type_name)
            .map(|(f, _)| f.as_str())
    }

    pub fn is_complete(&self, record: &GranuleRecord) -> bool {
        self.required_types
            .iter()
            .all(|t| record.satisfied_types.contains(t))
            && self
                .ancillary_flags
                .keys()
                .all(|f| record.ancillary_flags.contains(f))
    }

    /// Required types and flags not yet seen, for progress logging.
    pub fn missing(&self, record: &GranuleRecord) -> Vec<String> {
        let types = self
            .required_types
            .iter()
            .filter(|t| !record.satisfied_types.contains(*t))
            .cloned();
        let flags = self
            .ancillary_flags
            .keys()
            .filter(|f| !record.ancillary_flags.contains(*f))
            .map(|f| format!("flag:{f}"));
        types.chain(flags).collect()
    }
}
