//! Quarry configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{QuarryError, QuarryResult};
use crate::resolver::ResolverOptions;

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "quarry.toml";

/// Main configuration, read from `quarry.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    /// Reject unknown top-level argument keys
    pub strict_options: bool,

    /// Deepest allowed argument nesting
    pub max_argument_depth: usize,

    /// Longest accepted query, in bytes
    pub max_query_length: usize,

    /// Per-query timeout in milliseconds (none by default)
    pub timeout_ms: Option<u64>,

    /// Schema description for the memory store (toml or json)
    pub schema_path: Option<PathBuf>,

    /// JSON records to seed the memory store with
    pub fixture_path: Option<PathBuf>,

    /// Database URL; when set, queries go to SQL instead of memory
    pub database_url: Option<String>,

    /// HTTP bind address for `quarry serve`
    pub bind_address: String,

    /// Seconds an HTTP session may sit idle before it is evicted
    pub session_ttl_secs: u64,

    /// Most HTTP sessions kept at once
    pub max_sessions: usize,
}

impl Default for QuarryConfig {
    fn default() -> Self {
        let resolver = ResolverOptions::default();
        Self {
            strict_options: resolver.strict_options,
            max_argument_depth: resolver.max_argument_depth,
            max_query_length: resolver.max_query_length,
            timeout_ms: None,
            schema_path: None,
            fixture_path: None,
            database_url: None,
            bind_address: "127.0.0.1:3000".to_string(),
            session_ttl_secs: 1800,
            max_sessions: 10_000,
        }
    }
}

impl QuarryConfig {
    /// Create a new configuration builder
    pub fn builder() -> QuarryConfigBuilder {
        QuarryConfigBuilder::default()
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> QuarryResult<Self> {
        toml::from_str(content)
            .map_err(|e| QuarryError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load a configuration file. Relative paths inside it are resolved
    /// against the file's directory.
    pub fn from_file(path: &Path) -> QuarryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            QuarryError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            config.schema_path = config.schema_path.map(|p| base.join(p));
            config.fixture_path = config.fixture_path.map(|p| base.join(p));
        }

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Explicit path, else `./quarry.toml`, else the user config directory,
    /// else defaults.
    pub fn load(explicit: Option<&Path>) -> QuarryResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(&local);
        }

        if let Some(path) = Self::user_config_path() {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// `~/.config/quarry/config.toml` (or the platform equivalent).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("quarry").join("config.toml"))
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            strict_options: self.strict_options,
            max_argument_depth: self.max_argument_depth,
            max_query_length: self.max_query_length,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Builder for QuarryConfig
#[derive(Debug, Default)]
pub struct QuarryConfigBuilder {
    config: QuarryConfig,
}

impl QuarryConfigBuilder {
    /// Start from an existing configuration
    pub fn from_config(config: QuarryConfig) -> Self {
        Self { config }
    }

    pub fn strict_options(mut self, strict: bool) -> Self {
        self.config.strict_options = strict;
        self
    }

    pub fn max_argument_depth(mut self, depth: usize) -> Self {
        self.config.max_argument_depth = depth;
        self
    }

    pub fn max_query_length(mut self, length: usize) -> Self {
        self.config.max_query_length = length;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = Some(ms);
        self
    }

    /// Set the schema path
    pub fn schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schema_path = Some(path.into());
        self
    }

    /// Set the fixture path
    pub fn fixture(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.fixture_path = Some(path.into());
        self
    }

    /// Set the database URL
    pub fn database(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = Some(url.into());
        self
    }

    /// Set the bind address
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set how long idle HTTP sessions are kept
    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.config.session_ttl_secs = secs;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> QuarryConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = QuarryConfig::default();
        assert!(config.strict_options);
        assert_eq!(config.max_argument_depth, 32);
        assert_eq!(config.max_query_length, 65536);
        assert_eq!(config.bind_address, "127.0.0.1:3000");
        assert_eq!(config.timeout(), None);
        assert_eq!(config.session_ttl(), Duration::from_secs(1800));
        assert_eq!(config.max_sessions, 10_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = QuarryConfig::from_toml_str(
            r#"
            strict_options = false
            timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert!(!config.strict_options);
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.max_argument_depth, 32);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = QuarryConfig::from_toml_str("max_argument_depth = 'deep'").unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_file_paths_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        std::fs::write(&path, "schema_path = 'schema.toml'\nfixture_path = 'data.json'\n").unwrap();

        let config = QuarryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.schema_path, Some(dir.path().join("schema.toml")));
        assert_eq!(config.fixture_path, Some(dir.path().join("data.json")));
    }

    #[test]
    fn test_builder() {
        let config = QuarryConfig::builder()
            .strict_options(false)
            .database("sqlite::memory:")
            .bind("0.0.0.0:8080")
            .build();
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.resolver_options().strict_options, false);
        assert_eq!(config.bind_address, "0.0.0.0:8080");
    }
}
