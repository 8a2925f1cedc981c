//! Gated two-stage dispatch of a completed granule.
//!
//! ```text
//!   gate: <tool> -x -A <trigger>            (optional, skip on disqualifying marker)
//!   detect: <detect_binary> <trigger> -output <TAG>_<id>_<version>.csv <detect_args>
//!   fit:    <fit_binary> <detect csv> -output <TAG>_<id>_<version>.csv <fit_args>
//! ```
//!
//! Stage 2 only runs when stage 1 exited successfully. Output names are
//! deterministic, so a repeated granule id overwrites its earlier products.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{PipelineConfig, Settings};
use crate::granule::GranuleRecord;

use super::command::{CommandOutput, CommandRunner};
use super::error::{DispatchError, Stage};
use super::gate::{GateVerdict, MetadataGate};

/// What happened to a granule handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Both stages ran; paths of their products.
    Processed {
        detect_output: PathBuf,
        fit_output: PathBuf,
    },
    /// The gate rejected the granule. Not an error.
    Skipped { reason: String },
}

/// Consumer of completed granules.
///
/// The engine hands every completed record to one of these on its own task.
#[async_trait]
pub trait GranuleProcessor: Send + Sync {
    async fn process(&self, record: GranuleRecord) -> Result<DispatchOutcome, DispatchError>;
}

pub struct Dispatcher {
    pipeline: PipelineConfig,
    output_dir: PathBuf,
    version: String,
    gate: Option<MetadataGate>,
    runner: Arc<dyn CommandRunner>,
}

impl Dispatcher {
    pub fn from_settings(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Self {
        let gate = settings
            .gate
            .enabled
            .then(|| MetadataGate::new(&settings.gate, Arc::clone(&runner)));

        Self {
            pipeline: settings.pipeline.clone(),
            output_dir: settings.output_dir.clone(),
            version: settings.version.clone(),
            gate,
            runner,
        }
    }

    /// `<output_dir>/<tag>_<id>_<version>.csv`
    pub fn product_path(&self, tag: &str, granule_id: &str) -> PathBuf {
        self.output_dir
            .join(format!("{tag}_{granule_id}_{}.csv", self.version))
    }

    /// Run the gate and both stages for `record`.
    pub async fn dispatch(&self, record: &GranuleRecord) -> Result<DispatchOutcome, DispatchError> {
        let trigger = record
            .trigger_file
            .as_deref()
            .ok_or_else(|| DispatchError::MissingTrigger {
                granule: record.id.clone(),
            })?;

        if let Some(gate) = &self.gate {
            match gate.inspect(trigger).await {
                Ok(GateVerdict::Qualified) => {
                    crate::debug_event!("gate", "qualified", "{}", record.id);
                }
                Ok(GateVerdict::Disqualified { attribute, value }) => {
                    let reason = format!("{attribute} is {value}");
                    crate::log_event!("gate", "skipped", "{} ({reason})", record.id);
                    return Ok(DispatchOutcome::Skipped { reason });
                }
                Err(e) => {
                    // Without a dump there is no evidence against the granule.
                    tracing::warn!("[gate] {e}, processing anyway");
                }
            }
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| DispatchError::OutputDir {
                path: self.output_dir.clone(),
                source,
            })?;

        let detect_output = self.product_path(&self.pipeline.detect_tag, &record.id);
        self.run_stage(
            Stage::Detect,
            &record.id,
            &self.pipeline.detect_binary,
            trigger,
            &detect_output,
            &self.pipeline.detect_args,
        )
        .await?;

        let fit_output = self.product_path(&self.pipeline.fit_tag, &record.id);
        self.run_stage(
            Stage::Fit,
            &record.id,
            &self.pipeline.fit_binary,
            &detect_output,
            &fit_output,
            &self.pipeline.fit_args,
        )
        .await?;

        crate::log_event!(
            "dispatch",
            "processed",
            "{} -> {}",
            record.id,
            fit_output.display()
        );
        Ok(DispatchOutcome::Processed {
            detect_output,
            fit_output,
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        granule: &str,
        binary: &Path,
        input: &Path,
        output: &Path,
        extra: &[String],
    ) -> Result<CommandOutput, DispatchError> {
        let mut args: Vec<OsString> = Vec::with_capacity(extra.len() + 3);
        args.push(input.as_os_str().to_owned());
        args.push("-output".into());
        args.push(output.as_os_str().to_owned());
        args.extend(extra.iter().map(OsString::from));

        crate::log_event!("dispatch", stage, "{granule}");

        let result = self
            .runner
            .run(binary, &args)
            .await
            .map_err(|e| DispatchError::StageFailed {
                stage,
                granule: granule.to_string(),
                reason: format!("failed to launch {}: {e}", binary.display()),
                output: String::new(),
            })?;

        if !result.success {
            return Err(DispatchError::StageFailed {
                stage,
                granule: granule.to_string(),
                reason: result.status_text(),
                output: result.combined(),
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl GranuleProcessor for Dispatcher {
    async fn process(&self, record: GranuleRecord) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch(&record).await
    }
}
