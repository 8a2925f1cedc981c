//! Data-quality gate read from the trigger file's metadata.
//!
//! The gate runs `<tool> -x -A <file>` (an h5dump-style XML attribute dump)
//! and looks at every attribute whose name contains the configured attribute
//! name. The granule is disqualified when at least one such attribute is found
//! and every one of its `DataFromFile` values equals the disqualifying value
//! (for VIIRS: an ascending/descending indicator of `0` means daytime only).
//! A dump without the attribute does not disqualify.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::config::GateConfig;

use super::command::CommandRunner;
use super::error::DispatchError;

/// Outcome of a successful inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Qualified,
    Disqualified { attribute: String, value: String },
}

pub struct MetadataGate {
    tool: PathBuf,
    attribute: String,
    disqualifying_value: String,
    runner: Arc<dyn CommandRunner>,
}

static ATTRIBUTE_BLOCK: OnceLock<Option<Regex>> = OnceLock::new();
static DATA_VALUE: OnceLock<Option<Regex>> = OnceLock::new();

fn attribute_block() -> Option<&'static Regex> {
    ATTRIBUTE_BLOCK
        .get_or_init(|| {
            Regex::new(r#"(?s)<(?:[\w-]+:)?Attribute\s[^>]*?Name="(?P<name>[^"]*)"[^>]*>(?P<body>.*?)</(?:[\w-]+:)?Attribute>"#).ok()
        })
        .as_ref()
}

fn data_value() -> Option<&'static Regex> {
    DATA_VALUE
        .get_or_init(|| {
            Regex::new(r"(?s)<(?:[\w-]+:)?DataFromFile>(?P<value>.*?)</(?:[\w-]+:)?DataFromFile>").ok()
        })
        .as_ref()
}

impl MetadataGate {
    pub fn new(config: &GateConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tool: config.tool.clone(),
            attribute: config.attribute.clone(),
            disqualifying_value: config.disqualifying_value.trim().to_string(),
            runner,
        }
    }

    /// Dump the metadata of `file` and evaluate it.
    ///
    /// `Err` means the tool could not produce a dump; callers proceed in that case.
    pub async fn inspect(&self, file: &Path) -> Result<GateVerdict, DispatchError> {
        let args: Vec<OsString> = vec!["-x".into(), "-A".into(), file.as_os_str().to_owned()];

        let output = self.runner.run(&self.tool, &args).await.map_err(|e| {
            DispatchError::GateCheckFailed {
                file: file.to_path_buf(),
                reason: format!("failed to launch {}: {e}", self.tool.display()),
            }
        })?;

        if !output.success {
            return Err(DispatchError::GateCheckFailed {
                file: file.to_path_buf(),
                reason: format!(
                    "{} ended with {}: {}",
                    self.tool.display(),
                    output.status_text(),
                    output.stderr.trim()
                ),
            });
        }

        Ok(self.evaluate(&output.stdout))
    }

    /// Evaluate an XML attribute dump.
    pub fn evaluate(&self, dump: &str) -> GateVerdict {
        let (Some(attribute_block), Some(data_value)) = (attribute_block(), data_value()) else {
            tracing::error!("[gate] attribute patterns failed to compile, not gating");
            return GateVerdict::Qualified;
        };

        let values: Vec<&str> = attribute_block
            .captures_iter(dump)
            .filter(|caps| caps["name"].contains(&self.attribute))
            .flat_map(|caps| {
                let body = caps.name("body").map(|m| m.as_str()).unwrap_or("");
                data_value
                    .captures_iter(body)
                    .filter_map(|v| v.name("value"))
                    .map(|m| m.as_str().trim())
                    .collect::<Vec<_>>()
            })
            .collect();

        if values.is_empty() {
            crate::debug_event!("gate", "attribute not found", "{}", self.attribute);
            return GateVerdict::Qualified;
        }

        if values.iter().all(|v| *v == self.disqualifying_value) {
            GateVerdict::Disqualified {
                attribute: self.attribute.clone(),
                value: self.disqualifying_value.clone(),
            }
        } else {
            GateVerdict::Qualified
        }
    }
}
