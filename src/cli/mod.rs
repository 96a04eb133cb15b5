// CLI command implementations

pub mod index;
pub mod modules;
pub mod query;
pub mod stats;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;

use kindex::config::Config;
use kindex::index::db::IndexDatabase;
use kindex::project::cache::CacheDir;
use kindex::query::QueryEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn project_root(project: &str) -> Result<PathBuf> {
    Path::new(project)
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project))
}

pub fn cache_dir(root: &Path, config: &Config) -> Result<CacheDir> {
    CacheDir::for_project(root, config.cache.dir.as_deref()).context("Failed to open cache directory")
}

/// Read-only access to a previously built index, without starting a session
pub fn open_query_engine(root: &Path, config: &Config) -> Result<QueryEngine> {
    let cache = cache_dir(root, config)?;
    let db_path = cache.index_db_path();
    if !db_path.exists() {
        anyhow::bail!("No index for {}; run `kindex index` first", root.display());
    }
    let db = IndexDatabase::open(&db_path).context("Failed to open index store")?;
    Ok(QueryEngine::new(db))
}
