//! Configuration module for docsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for docsync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Directory holding one metadata database per sync root.
    pub data_dir: PathBuf,
    /// Ignore rules shared by every sync root.
    pub ignore: IgnoreConfig,
    pub roots: Vec<RootConfig>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

/// Name-based ignore rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Wildcard patterns matched against file names.
    pub file_names: Vec<String>,
    /// Wildcard patterns matched against every folder name of a path.
    pub folder_names: Vec<String>,
    /// Whether symbolic links are skipped.
    pub symlinks: bool,
}

/// One synchronized local directory and its remote counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Unique name, also used for the database file name.
    pub name: String,
    /// Absolute local directory.
    pub local_path: PathBuf,
    /// Absolute folder path in the repository.
    pub remote_path: String,
    pub repository: RepositoryConfig,
    /// Milliseconds between incremental sync requests.
    pub poll_interval_ms: u64,
    /// Milliseconds within which a delete and a create are merged into a move.
    pub debounce_ms: u64,
    /// Size of one upload chunk in bytes.
    pub chunk_size_bytes: u64,
    /// Absolute local folders excluded from synchronization.
    pub ignored_folders: Vec<PathBuf>,
    pub debug: DebugConfig,
}

/// Repository connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository adapter: currently only `directory`.
    pub kind: String,
    /// Adapter-specific location (the repository directory for `directory`).
    pub location: PathBuf,
}

/// Developer switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Drop every local filesystem event at admission time.
    pub drop_local_events: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/docsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("docsync")
            .join("config.yaml")
    }

    /// Looks up a root by name.
    pub fn root(&self, name: &str) -> Option<&RootConfig> {
        self.roots.iter().find(|r| r.name == name)
    }
}

impl RootConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Database file for this root below `data_dir`.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.db", self.name))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("docsync"),
            ignore: IgnoreConfig::default(),
            roots: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            file_names: ["*~", ".*", "*.sync", "*.part", "*.swp", "~$*"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            folder_names: vec![".*".to_string()],
            symlinks: true,
        }
    }
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            local_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("DocSync"),
            remote_path: "/".to_string(),
            repository: RepositoryConfig::default(),
            poll_interval_ms: 5_000,
            debounce_ms: 1_000,
            chunk_size_bytes: 1024 * 1024,
            ignored_folders: Vec::new(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: "directory".to_string(),
            location: PathBuf::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"roots[0].poll_interval_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

/// Valid values for `roots[].repository.kind`.
const VALID_REPOSITORY_KINDS: &[&str] = &["directory"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: String, message: String| {
            errors.push(ValidationError { field, message });
        };

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level".into(),
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            push(
                "logging.format".into(),
                format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            );
        }

        // --- ignore ---
        for (i, pattern) in self.ignore.file_names.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(pattern) {
                push(format!("ignore.file_names[{i}]"), e.to_string());
            }
        }
        for (i, pattern) in self.ignore.folder_names.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(pattern) {
                push(format!("ignore.folder_names[{i}]"), e.to_string());
            }
        }

        // --- roots ---
        for (i, root) in self.roots.iter().enumerate() {
            let field = |name: &str| format!("roots[{i}].{name}");

            if root.name.trim().is_empty() {
                push(field("name"), "must not be empty".into());
            } else if root
                .name
                .chars()
                .any(|c| !(c.is_alphanumeric() || c == '-' || c == '_'))
            {
                push(
                    field("name"),
                    "may only contain letters, digits, '-' and '_'".into(),
                );
            }
            if self.roots[..i].iter().any(|other| other.name == root.name) {
                push(field("name"), format!("duplicate root name '{}'", root.name));
            }
            if !root.local_path.is_absolute() {
                push(
                    field("local_path"),
                    format!("must be absolute: {}", root.local_path.display()),
                );
            }
            if let Some(other) = self.roots[..i].iter().find(|other| {
                other.local_path.starts_with(&root.local_path)
                    || root.local_path.starts_with(&other.local_path)
            }) {
                push(
                    field("local_path"),
                    format!("overlaps with root '{}'", other.name),
                );
            }
            if !root.remote_path.starts_with('/') {
                push(
                    field("remote_path"),
                    format!("must start with '/': {}", root.remote_path),
                );
            }
            if !VALID_REPOSITORY_KINDS.contains(&root.repository.kind.as_str()) {
                push(
                    field("repository.kind"),
                    format!(
                        "invalid kind '{}'; valid options: {}",
                        root.repository.kind,
                        VALID_REPOSITORY_KINDS.join(", ")
                    ),
                );
            }
            if root.repository.location.as_os_str().is_empty() {
                push(field("repository.location"), "must not be empty".into());
            }
            if root.poll_interval_ms == 0 {
                push(field("poll_interval_ms"), "must be greater than 0".into());
            }
            if root.debounce_ms == 0 {
                push(field("debounce_ms"), "must be greater than 0".into());
            }
            if root.chunk_size_bytes == 0 {
                push(field("chunk_size_bytes"), "must be greater than 0".into());
            }
            for (j, folder) in root.ignored_folders.iter().enumerate() {
                if !folder.starts_with(&root.local_path) {
                    push(
                        field(&format!("ignored_folders[{j}]")),
                        format!("not inside {}", root.local_path.display()),
                    );
                }
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use docsync_core::config::{ConfigBuilder, RootConfig};
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .logging_level("debug")
///     .data_dir(PathBuf::from("/var/lib/docsync"))
///     .root(RootConfig {
///         name: "docs".into(),
///         local_path: PathBuf::from("/home/user/Docs"),
///         ..RootConfig::default()
///     })
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.config.data_dir = dir;
        self
    }

    pub fn ignore_file_names(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore.file_names = patterns;
        self
    }

    pub fn ignore_folder_names(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore.folder_names = patterns;
        self
    }

    pub fn ignore_symlinks(mut self, ignore: bool) -> Self {
        self.config.ignore.symlinks = ignore;
        self
    }

    /// Appends a sync root.
    pub fn root(mut self, root: RootConfig) -> Self {
        self.config.roots.push(root);
        self
    }

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
