//! Configuration for ideaforge.
//!
//! Settings are read from `ideaforge.toml` and layered file → environment →
//! explicit overrides, with defaults for everything.
//!
//! # Configuration File Format
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/ideaforge"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! directory = "/var/log/ideaforge"
//!
//! [workflows]
//! pipeline = ["idea-validation", "mvp-specification", "technical-design", "story-generation"]
//!
//! [[workflows.aliases]]
//! canonical = "idea-validation"
//! aliases = ["discovery", "ideation"]
//!
//! [outputs]
//! min_output_bytes = 50
//! legacy_output_recovery = true
//! ```

use anyhow::{Context, Result};
use ideaforge_common::workflow::{AliasClass, WorkflowCatalog, default_pipeline};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// File name looked up by [`Config::load_or_default`].
pub const CONFIG_FILE: &str = "ideaforge.toml";

/// Environment variable that overrides `storage.data_dir`.
pub const DATA_DIR_ENV: &str = "IDEAFORGE_DATA_DIR";

/// Where records are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all projects (default: platform data dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Logging settings consumed by [`crate::telemetry::init_logging`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for daily-rolling log files (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// Parsed format, falling back to pretty output.
    pub fn log_format(&self) -> LogFormat {
        self.format.parse().unwrap_or_default()
    }
}

/// Workflow identity and gating order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    /// Workflows in the order they gate one another.
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<String>,
    /// Extra alias classes, merged into the built-in rename history.
    #[serde(default)]
    pub aliases: Vec<AliasClass>,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline(),
            aliases: Vec::new(),
        }
    }
}

/// Agent output handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    /// Minimum file size for an agent output to count as real output.
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Recover text from agent files written as legacy object dumps.
    #[serde(default = "default_legacy_output_recovery")]
    pub legacy_output_recovery: bool,
}

fn default_min_output_bytes() -> u64 {
    50
}

fn default_legacy_output_recovery() -> bool {
    true
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            min_output_bytes: default_min_output_bytes(),
            legacy_output_recovery: default_legacy_output_recovery(),
        }
    }
}

/// The complete `ideaforge.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    #[serde(default)]
    pub outputs: OutputsConfig,
    /// Set by [`Config::with_data_dir`]; beats the environment.
    #[serde(skip)]
    data_dir_override: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ideaforge.toml")
    }

    /// Load `ideaforge.toml` from `dir`, or defaults if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize ideaforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Use `data_dir` regardless of file or environment settings.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        self.storage.data_dir = Some(data_dir.clone());
        self.data_dir_override = Some(data_dir);
        self
    }

    /// Storage root (override → env → file → platform default).
    pub fn data_dir(&self) -> PathBuf {
        self.resolve_data_dir(std::env::var_os(DATA_DIR_ENV))
    }

    fn resolve_data_dir(&self, env_value: Option<OsString>) -> PathBuf {
        if let Some(ref dir) = self.data_dir_override {
            return dir.clone();
        }
        if let Some(value) = env_value.filter(|v| !v.is_empty()) {
            return PathBuf::from(value);
        }
        if let Some(ref dir) = self.storage.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("ideaforge"))
            .unwrap_or_else(|| PathBuf::from(".ideaforge"))
    }

    /// Alias resolver and gating order built from the workflows section.
    pub fn catalog(&self) -> WorkflowCatalog {
        WorkflowCatalog::with_aliases(self.workflows.aliases.clone())
            .with_pipeline(self.workflows.pipeline.clone())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.logging.format.parse::<LogFormat>().is_err() {
            warnings.push(format!(
                "Invalid logging.format '{}': should be 'pretty' or 'json'",
                self.logging.format
            ));
        }

        if self.workflows.pipeline.iter().any(|w| w.trim().is_empty()) {
            warnings.push("workflows.pipeline contains an empty workflow name".to_string());
        }

        for class in &self.workflows.aliases {
            if class.canonical.trim().is_empty() {
                warnings.push("workflows.aliases entry has an empty canonical name".to_string());
            }
        }

        for name in self.catalog().conflicting_names() {
            warnings.push(format!(
                "Workflow name '{}' appears in more than one alias class; the first class wins",
                name
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.log_format(), LogFormat::Pretty);
        assert_eq!(config.outputs.min_output_bytes, 50);
        assert!(config.outputs.legacy_output_recovery);
        assert_eq!(config.workflows.pipeline.len(), 4);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::parse(
            r#"
[storage]
data_dir = "/srv/ideaforge"

[logging]
level = "debug"
format = "json"

[workflows]
pipeline = ["discovery", "architect"]

[[workflows.aliases]]
canonical = "idea-validation"
aliases = ["ideation"]

[outputs]
min_output_bytes = 10
legacy_output_recovery = false
"#,
        )
        .unwrap();

        assert_eq!(
            config.storage.data_dir.as_deref(),
            Some(Path::new("/srv/ideaforge"))
        );
        assert_eq!(config.logging.log_format(), LogFormat::Json);
        assert_eq!(config.outputs.min_output_bytes, 10);
        assert!(!config.outputs.legacy_output_recovery);

        let catalog = config.catalog();
        assert!(catalog.equivalent("ideation", "discovery"));
        assert_eq!(catalog.pipeline(), &["idea-validation", "mvp-specification"]);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.storage.data_dir.is_none());
        assert_eq!(config.workflows.pipeline, default_pipeline());
    }

    #[test]
    fn test_parse_invalid_toml_errors() {
        let result = Config::parse("[storage\ndata_dir = ");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse ideaforge.toml")
        );
    }

    #[test]
    fn test_data_dir_precedence() {
        let config = Config::parse("[storage]\ndata_dir = \"/from/file\"\n").unwrap();
        assert_eq!(
            config.resolve_data_dir(Some(OsString::from("/from/env"))),
            PathBuf::from("/from/env")
        );
        assert_eq!(config.resolve_data_dir(None), PathBuf::from("/from/file"));
        assert_eq!(
            config.resolve_data_dir(Some(OsString::new())),
            PathBuf::from("/from/file")
        );
        let explicit = config.with_data_dir("/explicit");
        assert_eq!(
            explicit.resolve_data_dir(Some(OsString::from("/from/env"))),
            PathBuf::from("/explicit")
        );
        let platform = Config::default().resolve_data_dir(None);
        assert!(platform.ends_with("ideaforge") || platform == Path::new(".ideaforge"));
    }

    #[test]
    fn test_validate_warns_on_bad_format_and_conflicts() {
        let config = Config::parse(
            r#"
[logging]
format = "xml"

[[workflows.aliases]]
canonical = "market-scan"
aliases = ["discovery"]
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("xml"));
        assert!(warnings[1].contains("discovery"));
    }

    #[test]
    fn test_load_or_default_and_save_roundtrip() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path()).unwrap();
        assert!(config.storage.data_dir.is_none());

        let config = config.with_data_dir(dir.path().join("data"));
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let reloaded = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(reloaded.storage.data_dir, Some(dir.path().join("data")));
    }
}
