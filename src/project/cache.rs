// Per-project cache directory: index store and resolved module graph

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::document::{self, ModuleRecord};
use super::ModuleGraph;

const INDEX_DB_FILE: &str = "index.db";
const MODULES_FILE: &str = "modules.json";

/// Resolved module graph as persisted next to the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedModuleGraph {
    pub build_system: String,
    pub token: String,
    pub resolved_at: DateTime<Utc>,
    pub modules: Vec<ModuleRecord>,
}

impl CachedModuleGraph {
    pub fn new(build_system: &str, token: String, graph: &ModuleGraph) -> Self {
        Self {
            build_system: build_system.to_string(),
            token,
            resolved_at: Utc::now(),
            modules: document::serialize(graph),
        }
    }
}

/// Base directory for all project caches: `$XDG_CACHE_HOME/kindex`, then
/// `~/.cache/kindex`, then the system temp dir.
pub fn default_cache_base() -> PathBuf {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        if !xdg_cache.is_empty() {
            return PathBuf::from(xdg_cache).join("kindex");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".cache").join("kindex");
    }

    std::env::temp_dir().join("kindex")
}

/// Stable 16 hex digit identifier for a project root
pub fn project_hash(project_root: &Path) -> String {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let hash = blake3::hash(canonical.to_string_lossy().as_bytes());
    hash.to_hex()[..16].to_string()
}

#[derive(Debug, Clone)]
pub struct CacheDir {
    dir: PathBuf,
}

impl CacheDir {
    /// Cache directory for `project_root` under `base` (or the default base)
    pub fn for_project(project_root: &Path, base: Option<&Path>) -> io::Result<Self> {
        let base = base.map(Path::to_path_buf).unwrap_or_else(default_cache_base);
        let dir = base.join(project_hash(project_root));
        fs::create_dir_all(&dir)?;
        debug!("Cache directory for {}: {}", project_root.display(), dir.display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.dir.join(INDEX_DB_FILE)
    }

    pub fn module_graph_path(&self) -> PathBuf {
        self.dir.join(MODULES_FILE)
    }

    /// Load the cached module graph. A missing or malformed file reads as absent.
    pub fn load_module_graph(&self) -> Option<CachedModuleGraph> {
        let path = self.module_graph_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cached module graph {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("Ignoring malformed cached module graph {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist the module graph, replacing any previous one atomically
    pub fn store_module_graph(&self, cached: &CachedModuleGraph) -> io::Result<()> {
        let path = self.module_graph_path();
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(cached)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        debug!("Stored module graph ({} modules) at {}", cached.modules.len(), path.display());
        Ok(())
    }

    pub fn invalidate_module_graph(&self) -> io::Result<()> {
        match fs::remove_file(self.module_graph_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
