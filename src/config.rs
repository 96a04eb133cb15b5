// Configuration management for kindex

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::indexer::queue::LaneCapacities;

/// Per-project configuration file, looked up in the project root
pub const CONFIG_FILE: &str = ".kindex.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub indexing: IndexingConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub watch: bool,
    pub extensions: Vec<String>,
}

/// Capacities of the edit, scan and index lanes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub edit_capacity: usize,
    pub scan_capacity: usize,
    pub index_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base directory for per-project caches; platform cache dir when unset
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
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
            exclude: vec![
                "build/".to_string(),
                "out/".to_string(),
                ".gradle/".to_string(),
                ".idea/".to_string(),
                ".git/".to_string(),
                "**/generated/**".to_string(),
            ],
            include: vec![],
            watch: false,
            extensions: vec!["kt".to_string(), "kts".to_string()],
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let lanes = LaneCapacities::default();
        Self {
            edit_capacity: lanes.edit,
            scan_capacity: lanes.scan,
            index_capacity: lanes.index,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            indexing: IndexingConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
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
    /// Looks for .kindex.toml in the project root
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);
        if !config_path.is_file() {
            tracing::debug!("No {} in {}, using defaults", CONFIG_FILE, project_dir.as_ref().display());
            return Self::default();
        }

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Check if a file should be indexed based on include/exclude patterns.
    ///
    /// `relative_paths` are the file's path relative to the project root and to
    /// the content root holding it. Directory patterns such as `build/` are
    /// anchored at those roots, so a package directory named `build` is kept.
    pub fn should_index_file(&self, relative_paths: &[&str]) -> bool {
        let matches_any = |pattern: &String| relative_paths.iter().any(|path| matches_pattern(path, pattern));

        if self.indexing.exclude.iter().any(matches_any) {
            return false;
        }

        // If include patterns are specified, file must match at least one
        if !self.indexing.include.is_empty() {
            return self.indexing.include.iter().any(matches_any);
        }

        true
    }

    pub fn lane_capacities(&self) -> LaneCapacities {
        LaneCapacities {
            edit: self.queue.edit_capacity,
            scan: self.queue.scan_capacity,
            index: self.queue.index_capacity,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.name.is_empty() {
            return Err(anyhow::anyhow!("Project name cannot be empty"));
        }

        if self.indexing.extensions.is_empty() {
            return Err(anyhow::anyhow!("At least one source file extension is required"));
        }
        if let Some(ext) = self.indexing.extensions.iter().find(|e| e.is_empty() || e.starts_with('.')) {
            return Err(anyhow::anyhow!("Invalid extension {:?}: give it without the leading dot", ext));
        }

        if self.queue.edit_capacity == 0 || self.queue.scan_capacity == 0 || self.queue.index_capacity == 0 {
            return Err(anyhow::anyhow!("Queue lane capacities must be greater than 0"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        let valid_formats = ["compact", "pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        Ok(())
    }
}

/// Glob-lite matching: root-anchored `dir/`, `*.ext`, `**/name/**` at any depth and plain substrings
fn matches_pattern(file_path: &str, pattern: &str) -> bool {
    if pattern.ends_with('/') {
        file_path.starts_with(pattern)
    } else if let Some(suffix) = pattern.strip_prefix("*.") {
        file_path.ends_with(&format!(".{}", suffix)) || file_path.contains(&format!(".{}.", suffix))
    } else if let Some(inner) = pattern.strip_prefix("**/").and_then(|p| p.strip_suffix("/**")) {
        file_path.starts_with(&format!("{}/", inner)) || file_path.contains(&format!("/{}/", inner))
    } else {
        file_path.contains(pattern)
    }
}
