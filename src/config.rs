// Configuration management for phpls

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name looked up in the project root
pub const CONFIG_FILE: &str = ".phpls.toml";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub indexing: IndexingConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Glob handed to file discovery
    pub include: String,
    pub exclude: Vec<String>,
    pub watch: bool,
    /// Files parsed concurrently during a sweep
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Snapshot location, relative to the project root
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub completion_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            indexing: IndexingConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-project".to_string(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            include: "**/*.php".to_string(),
            exclude: vec![
                ".git/".to_string(),
                "node_modules/".to_string(),
                ".phpls/".to_string(),
            ],
            watch: false,
            concurrency: 8,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: ".phpls/index.db".to_string(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            completion_limit: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from project directory
    /// Looks for .phpls.toml in the project root
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            tracing::debug!("No {} in {}, using defaults", CONFIG_FILE, project_dir.as_ref().display());
            return Self::default();
        }

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Could not load config from {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Absolute snapshot path for a project root
    pub fn cache_path(&self, project_dir: &Path) -> PathBuf {
        let path = Path::new(&self.cache.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.name.is_empty() {
            return Err(anyhow::anyhow!("Project name cannot be empty"));
        }

        if self.indexing.include.is_empty() {
            return Err(anyhow::anyhow!("Include glob cannot be empty"));
        }
        if self.indexing.concurrency == 0 {
            return Err(anyhow::anyhow!("Indexing concurrency must be greater than 0"));
        }

        if self.cache.enabled && self.cache.path.is_empty() {
            return Err(anyhow::anyhow!("Cache path cannot be empty when the cache is enabled"));
        }

        if self.query.completion_limit == 0 {
            return Err(anyhow::anyhow!("Completion limit must be greater than 0"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        let valid_formats = ["compact", "pretty", "full"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        Ok(())
    }
}

/// Simple exclude pattern matching
///
/// `dir/` matches a directory at any depth, `*.ext` matches a suffix,
/// `**/name/**` matches a path segment, anything else is a substring.
pub fn matches_pattern(file_path: &str, pattern: &str) -> bool {
    let file_path = file_path.replace('\\', "/");
    if let Some(dir) = pattern.strip_suffix('/') {
        file_path.starts_with(pattern) || file_path.contains(&format!("/{}/", dir))
    } else if let Some(segment) = pattern
        .strip_prefix("**/")
        .and_then(|rest| rest.strip_suffix("/**"))
    {
        file_path.starts_with(&format!("{}/", segment)) || file_path.contains(&format!("/{}/", segment))
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        file_path.ends_with(suffix)
    } else {
        file_path.contains(pattern)
    }
}
