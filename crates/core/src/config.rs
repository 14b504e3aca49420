//! TOML-based configuration for TaskMerge.
//!
//! The [`EngineConfig`] is constructed once at startup and handed to every
//! component that needs it. Secrets for the resolution agent are referenced
//! by `_env` fields naming environment variables and resolved via
//! [`EngineConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Repository and storage locations.
    pub engine: EngineSection,

    /// Merge strategy tuning.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Semantic analyzer settings.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Resolution agent settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Repository operation settings.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Timeline tracker settings.
    #[serde(default)]
    pub timeline: TimelineConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Repository location, integration branch and data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Path to the main repository (the one worktrees were created from).
    pub repo_path: PathBuf,

    /// Integration branch that task branches are merged into.
    #[serde(default = "default_target_branch")]
    pub target_branch: String,

    /// Directory for the database, timeline log and merge reports.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_target_branch() -> String {
    "main".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".taskmerge")
}
fn default_log_level() -> String {
    "info".into()
}

impl EngineSection {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("taskmerge.db")
    }

    pub fn timeline_path(&self) -> PathBuf {
        self.data_dir.join("timeline.log")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Strategy selection and commit identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Minimum confidence for resolving a semantic conflict by ordered
    /// concatenation.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,

    /// Region kinds eligible for the last-committed-wins rule.
    #[serde(default = "default_precedence_kinds")]
    pub precedence_kinds: Vec<String>,

    /// Maximum wait for the merge lock before reporting the target busy.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Author name for merge commits.
    #[serde(default = "default_author_name")]
    pub commit_author_name: String,

    /// Author email for merge commits.
    #[serde(default = "default_author_email")]
    pub commit_author_email: String,
}

fn default_semantic_threshold() -> f64 {
    0.6
}
fn default_precedence_kinds() -> Vec<String> {
    vec!["imports".into(), "list_tail".into()]
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_author_name() -> String {
    "taskmerge".into()
}
fn default_author_email() -> String {
    "merge@taskmerge.local".into()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: default_semantic_threshold(),
            precedence_kinds: default_precedence_kinds(),
            lock_timeout_ms: default_lock_timeout_ms(),
            commit_author_name: default_author_name(),
            commit_author_email: default_author_email(),
        }
    }
}

impl MergeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Semantic analyzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Glob patterns (relative paths) always analyzed as a single whole-file
    /// region, e.g. lockfiles and generated code.
    #[serde(default = "default_whole_file_patterns")]
    pub whole_file_patterns: Vec<String>,

    /// Files larger than this are analyzed as a single region.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

fn default_whole_file_patterns() -> Vec<String> {
    vec!["**/*.lock".into(), "*.lock".into(), "**/*.min.js".into()]
}
fn default_max_file_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            whole_file_patterns: default_whole_file_patterns(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// External resolution agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Program invoked with the resolution context on stdin. When unset,
    /// conflicts the auto merger cannot handle go straight to unresolved.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variable holding the agent's API key, forwarded to the
    /// agent process as `TASKMERGE_AGENT_KEY`.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Lines of surrounding context sent on each side of the conflict.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Timeout and retry policy for each agent call.
    #[serde(default = "default_resolver_retry")]
    pub retry: RetrySettings,

    /// Resolved API key (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_context_lines() -> usize {
    5
}
fn default_resolver_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        base_delay_ms: 1_000,
        timeout_ms: 120_000,
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            api_key_env: None,
            context_lines: default_context_lines(),
            retry: default_resolver_retry(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Repository operation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Retry policy for transient repository failures.
    #[serde(default = "default_repository_retry")]
    pub retry: RetrySettings,
}

fn default_repository_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 4,
        base_delay_ms: 200,
        timeout_ms: 30_000,
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            retry: default_repository_retry(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Timeline tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Time allowance for one hook-triggered `record_commit` call.
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
}

fn default_budget_ms() -> u64 {
    250
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            budget_ms: default_budget_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry settings
// ---------------------------------------------------------------------------

/// Serialized form of a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub timeout_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Build a config with defaults for everything except the repository.
    pub fn for_repo<P: Into<PathBuf>>(repo_path: P, data_dir: P) -> Self {
        Self {
            engine: EngineSection {
                repo_path: repo_path.into(),
                target_branch: default_target_branch(),
                data_dir: data_dir.into(),
                log_level: default_log_level(),
            },
            merge: MergeConfig::default(),
            analyzer: AnalyzerConfig::default(),
            resolver: ResolverConfig::default(),
            repository: RepositoryConfig::default(),
            timeline: TimelineConfig::default(),
        }
    }

    /// Load an [`EngineConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning but does not fail; the agent simply
    /// runs without a key.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.resolver.api_key_env {
            self.resolver.api_key = resolve_optional_env(env_name, "resolver.api_key_env");
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.target_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engine.target_branch".into(),
                detail: "target branch must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.merge.semantic_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "merge.semantic_threshold".into(),
                detail: "threshold must be within [0, 1]".into(),
            });
        }
        for kind in &self.merge.precedence_kinds {
            if !matches!(kind.as_str(), "imports" | "list_tail") {
                return Err(ConfigError::InvalidValue {
                    field: "merge.precedence_kinds".into(),
                    detail: format!("'{}' is not a low-risk region kind", kind),
                });
            }
        }
        if self.resolver.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver.retry.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.repository.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "repository.retry.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if matches!(self.resolver.command.as_deref(), Some(c) if c.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "resolver.command".into(),
                detail: "command must not be empty when set".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[engine]
repo_path = "/srv/repo"
target_branch = "integration"
data_dir = "/tmp/taskmerge"
log_level = "debug"

[merge]
semantic_threshold = 0.75
precedence_kinds = ["imports"]
lock_timeout_ms = 1500

[analyzer]
whole_file_patterns = ["Cargo.lock"]
max_file_bytes = 4096

[resolver]
command = "merge-agent"
args = ["--json"]
api_key_env = "TASKMERGE_TEST_KEY"
context_lines = 3

[resolver.retry]
max_attempts = 2
base_delay_ms = 10
timeout_ms = 500

[repository.retry]
max_attempts = 5
base_delay_ms = 50
timeout_ms = 1000

[timeline]
budget_ms = 100
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: EngineConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.engine.target_branch, "integration");
        assert_eq!(config.merge.semantic_threshold, 0.75);
        assert_eq!(config.merge.precedence_kinds, vec!["imports"]);
        assert_eq!(config.resolver.command.as_deref(), Some("merge-agent"));
        assert_eq!(config.resolver.retry.max_attempts, 2);
        assert_eq!(config.repository.retry.max_attempts, 5);
        assert_eq!(config.timeline.budget_ms, 100);
        assert_eq!(
            config.engine.db_path(),
            PathBuf::from("/tmp/taskmerge/taskmerge.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmerge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = EngineConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.engine.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = EngineConfig::load_from_file("/nonexistent/taskmerge.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[engine]
repo_path = "."
"#;
        let config: EngineConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.engine.target_branch, "main");
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.merge.semantic_threshold, 0.6);
        assert_eq!(config.merge.precedence_kinds, vec!["imports", "list_tail"]);
        assert!(config.resolver.command.is_none());
        assert_eq!(config.resolver.context_lines, 5);
        assert_eq!(config.timeline.budget_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config: EngineConfig = toml::from_str(sample_toml()).unwrap();
        config.merge.semantic_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "merge.semantic_threshold"
        ));
    }

    #[test]
    fn test_validate_rejects_structural_precedence_kind() {
        let mut config: EngineConfig = toml::from_str(sample_toml()).unwrap();
        config.merge.precedence_kinds.push("function".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "merge.precedence_kinds"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config: EngineConfig = toml::from_str(sample_toml()).unwrap();
        config.resolver.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TASKMERGE_TEST_KEY", "sk-test");
        let mut config: EngineConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.resolver.api_key.as_deref(), Some("sk-test"));
        std::env::remove_var("TASKMERGE_TEST_KEY");
    }
}
