//! Configuration for the granule watcher.
//!
//! Settings are layered with figment:
//! - Default values
//! - Config file (TOML, or JSON when the file ends in `.json`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `GW_` and use double underscores
//! to separate nested levels:
//! - `GW_WATCHER__MODE=poll` sets `watcher.mode`
//! - `GW_PIPELINE__DETECT_BINARY=/opt/vnf/detect` sets `pipeline.detect_binary`
//! - `GW_OUTPUT_DIR=/output` sets `output_dir`

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::identity::FileTypeSpec;

/// Config file looked up in the current directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "granule-watch.toml";

/// Errors raised while loading or validating settings. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Invalid pattern for file type '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Pattern for file type '{name}' has no named capture group 'id'")]
    MissingIdGroup { name: String },

    #[error("File type '{name}' is configured more than once")]
    DuplicateFileType { name: String },

    #[error("File type name must not be empty")]
    EmptyFileTypeName,

    #[error("Trigger type '{name}' is not a configured file type")]
    UnknownTriggerType { name: String },

    #[error("Ancillary flag '{flag}' refers to unknown file type '{type_name}'")]
    UnknownAncillaryType { flag: String, type_name: String },

    #[error("Invalid watcher setting: {0}")]
    InvalidWatcher(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Directory receiving instrument files (or the root of runs in `runs` mode)
    #[serde(default = "default_dir")]
    pub watch_dir: PathBuf,

    /// Directory receiving pipeline products
    #[serde(default = "default_dir")]
    pub output_dir: PathBuf,

    /// Version string embedded in product file names
    #[serde(default = "default_version")]
    pub version: String,

    /// File types in classification priority order
    #[serde(default = "default_file_types")]
    pub file_types: Vec<FileTypeConfig>,

    /// Companion flags: flag name -> file type that raises it
    #[serde(default)]
    pub require_ancillary_flags: BTreeMap<String, String>,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct FileTypeConfig {
    pub name: String,

    /// Regular expression with a named capture group `id`
    pub pattern: String,

    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Stage 1 executable
    #[serde(default = "default_detect_binary")]
    pub detect_binary: PathBuf,

    /// Stage 2 executable
    #[serde(default = "default_fit_binary")]
    pub fit_binary: PathBuf,

    /// Product tag for stage 1 output
    #[serde(default = "default_detect_tag")]
    pub detect_tag: String,

    /// Product tag for stage 2 output
    #[serde(default = "default_fit_tag")]
    pub fit_tag: String,

    /// File type whose path is fed to stage 1
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,

    /// Arguments appended after `<input> -output <path>` for stage 1
    #[serde(default = "default_detect_args")]
    pub detect_args: Vec<String>,

    /// Arguments appended after `<input> -output <path>` for stage 2
    #[serde(default = "default_fit_args")]
    pub fit_args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metadata dump tool, invoked as `<tool> -x -A <trigger file>`
    #[serde(default = "default_gate_tool")]
    pub tool: PathBuf,

    /// Substring of the attribute name inspected in the dump
    #[serde(default = "default_gate_attribute")]
    pub attribute: String,

    /// Attribute value that marks the granule as not qualifying
    #[serde(default = "default_disqualifying_value")]
    pub disqualifying_value: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// OS change notifications on `watch_dir`
    Push,
    /// Periodic directory listing of `watch_dir`
    Poll,
    /// `watch_dir/<run>/<subdirectory>/<file>` layout, one nested poll per run
    Runs,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_watch_mode")]
    pub mode: WatchMode,

    /// Poll period in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Wait between the two size samples of the stability check
    #[serde(default = "default_quiescence_secs")]
    pub quiescence_secs: u64,

    /// Quiet period for bursts of push notifications
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Result directory inside each run (`runs` mode)
    #[serde(default = "default_subdirectory")]
    pub subdirectory: String,

    /// Only run directories starting with this prefix are watched (`runs` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_prefix: Option<String>,

    /// Emit files already present when a poll watch starts
    #[serde(default = "default_false")]
    pub scan_existing: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_version() -> String {
    "v2.1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_detect_binary() -> PathBuf {
    PathBuf::from("vnf_detect")
}
fn default_fit_binary() -> PathBuf {
    PathBuf::from("vnf_fit")
}
fn default_detect_tag() -> String {
    "VNFD".to_string()
}
fn default_fit_tag() -> String {
    "VNFL".to_string()
}
fn default_trigger_type() -> String {
    "SVM10".to_string()
}
fn default_detect_args() -> Vec<String> {
    ["-cloud", "0"].iter().map(|s| s.to_string()).collect()
}
fn default_fit_args() -> Vec<String> {
    [
        "-plot", "1", "-map", "1", "-localmax", "1", "-size", "100", "-font", "10",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_gate_tool() -> PathBuf {
    PathBuf::from("h5dump")
}
fn default_gate_attribute() -> String {
    "Ascending/Descending_Indicator".to_string()
}
fn default_disqualifying_value() -> String {
    "0".to_string()
}
fn default_watch_mode() -> WatchMode {
    WatchMode::Push
}
fn default_period_secs() -> u64 {
    15
}
fn default_quiescence_secs() -> u64 {
    3
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_subdirectory() -> String {
    "result".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// VIIRS products needed by the detection/fit pipeline.
const DEFAULT_TYPES: [&str; 11] = [
    "GMTCO", "IICMO", "SVDNB", "SVM07", "SVM08", "SVM10", "SVM12", "SVM13", "SVM14", "SVM15",
    "SVM16",
];

fn default_file_types() -> Vec<FileTypeConfig> {
    DEFAULT_TYPES
        .iter()
        .map(|name| FileTypeConfig {
            name: name.to_string(),
            pattern: format!("^{name}_(?P<id>[^_]+_[^_]+_[^_]+_[^_]+)_"),
            required: true,
        })
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_dir: default_dir(),
            output_dir: default_dir(),
            version: default_version(),
            file_types: default_file_types(),
            require_ancillary_flags: BTreeMap::new(),
            pipeline: PipelineConfig::default(),
            gate: GateConfig::default(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detect_binary: default_detect_binary(),
            fit_binary: default_fit_binary(),
            detect_tag: default_detect_tag(),
            fit_tag: default_fit_tag(),
            trigger_type: default_trigger_type(),
            detect_args: default_detect_args(),
            fit_args: default_fit_args(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: default_gate_tool(),
            attribute: default_gate_attribute(),
            disqualifying_value: default_disqualifying_value(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: default_watch_mode(),
            period_secs: default_period_secs(),
            quiescence_secs: default_quiescence_secs(),
            debounce_ms: default_debounce_ms(),
            subdirectory: default_subdirectory(),
            run_prefix: None,
            scan_existing: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatcherConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_secs(self.quiescence_secs)
    }
}

impl Settings {
    /// Load configuration from all sources.
    ///
    /// An explicit `path` must exist. Without one, `granule-watch.toml` in the
    /// current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                figment = Self::merge_file(figment, path)?;
            }
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    figment = Self::merge_file(figment, &fallback)?;
                }
            }
        }

        let settings: Settings = figment
            .merge(
                Env::prefixed("GW_").map(|key| key.as_str().to_lowercase().replace("__", ".").into()),
            )
            .extract()
            .map_err(Box::new)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load configuration from a specific file without environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Serialized::defaults(Settings::default()));
        let settings: Settings = Self::merge_file(figment, path.as_ref())?
            .extract()
            .map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    fn merge_file(figment: Figment, path: &Path) -> Result<Figment, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(figment.merge(Json::file_exact(path)))
        } else {
            Ok(figment.merge(Toml::file_exact(path)))
        }
    }

    /// Check every cross-field constraint. A failure here stops the process
    /// before any watch is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.file_type_specs()?;

        if self.watcher.period_secs == 0 {
            return Err(ConfigError::InvalidWatcher(
                "period_secs must be greater than zero".to_string(),
            ));
        }
        if self.watcher.mode == WatchMode::Runs && self.watcher.subdirectory.trim().is_empty() {
            return Err(ConfigError::InvalidWatcher(
                "runs mode needs a non-empty subdirectory".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile the configured file types into classification specs.
    ///
    /// The trigger type is always required, even if the config marks it
    /// optional: stage 1 cannot run without it.
    pub fn file_type_specs(&self) -> Result<Vec<FileTypeSpec>, ConfigError> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.file_types.len());

        for ft in &self.file_types {
            if ft.name.trim().is_empty() {
                return Err(ConfigError::EmptyFileTypeName);
            }
            if !seen.insert(ft.name.as_str()) {
                return Err(ConfigError::DuplicateFileType {
                    name: ft.name.clone(),
                });
            }
            let required = ft.required || ft.name == self.pipeline.trigger_type;
            specs.push(FileTypeSpec::new(&ft.name, &ft.pattern, required)?);
        }

        if !seen.contains(self.pipeline.trigger_type.as_str()) {
            return Err(ConfigError::UnknownTriggerType {
                name: self.pipeline.trigger_type.clone(),
            });
        }

        for (flag, type_name) in &self.require_ancillary_flags {
            if !seen.contains(type_name.as_str()) {
                return Err(ConfigError::UnknownAncillaryType {
                    flag: flag.clone(),
                    type_name: type_name.clone(),
                });
            }
        }

        Ok(specs)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
