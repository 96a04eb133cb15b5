// Build system selection and cached module graph resolution

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::{CacheDir, CachedModuleGraph};
use super::document::{self, DocumentError};
use super::gradle::GradleBuildSystem;
use super::workspace_json::WorkspaceJsonBuildSystem;
use super::{GraphError, ModuleGraph};
use crate::index::last_modified_millis;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no supported build system in {root} (looked for {markers})")]
    NoBuildSystem { root: PathBuf, markers: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid project description {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: DocumentError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("project model for {root} unavailable: {reason}")]
    ProjectModel { root: PathBuf, reason: String },
}

/// A freshly resolved graph together with its validity token
#[derive(Debug)]
pub struct Resolution {
    pub graph: ModuleGraph,
    pub token: String,
}

/// Adapter turning one build system's description of a project into a module graph
pub trait BuildSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Files whose presence selects this build system and whose mtimes gate the cache
    fn marker_files(&self, project_root: &Path) -> Vec<PathBuf>;

    fn is_present(&self, project_root: &Path) -> bool {
        self.marker_files(project_root).iter().any(|p| p.is_file())
    }

    /// `Ok(None)` when `cached_token` is still valid and the cached graph may be reused
    fn resolve_modules_if_needed(
        &self,
        project_root: &Path,
        cached_token: Option<&str>,
    ) -> Result<Option<Resolution>, ResolveError>;
}

/// Newest modification time among existing `paths`, in ms
pub fn newest_mtime_millis(paths: &[PathBuf]) -> i64 {
    paths
        .iter()
        .filter_map(|p| last_modified_millis(p).ok())
        .max()
        .unwrap_or(0)
}

/// A token is valid when no tracked file changed after it was issued
pub fn token_is_valid(token: Option<&str>, paths: &[PathBuf]) -> bool {
    match token.and_then(|t| t.parse::<i64>().ok()) {
        Some(token) => newest_mtime_millis(paths) <= token,
        None => false,
    }
}

/// Selects a build system adapter by priority and resolves through the cache
pub struct BuildSystemResolver {
    adapters: Vec<Box<dyn BuildSystem>>,
}

impl Default for BuildSystemResolver {
    fn default() -> Self {
        Self::new(vec![
            Box::new(WorkspaceJsonBuildSystem),
            Box::new(<GradleBuildSystem>::default()),
        ])
    }
}

impl BuildSystemResolver {
    /// Adapters are consulted in the given order
    pub fn new(adapters: Vec<Box<dyn BuildSystem>>) -> Self {
        Self { adapters }
    }

    pub fn select(&self, project_root: &Path) -> Result<&dyn BuildSystem, ResolveError> {
        self.adapters
            .iter()
            .find(|adapter| adapter.is_present(project_root))
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| ResolveError::NoBuildSystem {
                root: project_root.to_path_buf(),
                markers: self
                    .adapters
                    .iter()
                    .flat_map(|a| a.marker_files(project_root))
                    .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Resolve the project's module graph, reusing the cached one while its token holds.
    /// `force` ignores the cache entirely.
    pub fn resolve(&self, project_root: &Path, cache: &CacheDir, force: bool) -> Result<ModuleGraph, ResolveError> {
        let adapter = self.select(project_root)?;
        info!("Using {} build system for {}", adapter.name(), project_root.display());

        let cached = if force {
            None
        } else {
            self.load_cached(adapter, cache)
        };

        let token = cached.as_ref().map(|(token, _)| token.as_str());
        match adapter.resolve_modules_if_needed(project_root, token)? {
            Some(resolution) => {
                info!("Resolved {} modules", resolution.graph.len());
                let record = CachedModuleGraph::new(adapter.name(), resolution.token, &resolution.graph);
                if let Err(e) = cache.store_module_graph(&record) {
                    warn!("Failed to cache module graph: {}", e);
                }
                Ok(resolution.graph)
            }
            None => match cached {
                Some((_, graph)) => {
                    info!("Reusing cached module graph ({} modules)", graph.len());
                    Ok(graph)
                }
                // Adapter accepted a token we never handed it
                None => self.resolve(project_root, cache, true),
            },
        }
    }

    fn load_cached(&self, adapter: &dyn BuildSystem, cache: &CacheDir) -> Option<(String, ModuleGraph)> {
        let cached = cache.load_module_graph()?;
        if cached.build_system != adapter.name() {
            debug!(
                "Cached module graph came from {}, not {}; ignoring",
                cached.build_system,
                adapter.name()
            );
            return None;
        }
        match document::deserialize(cached.modules) {
            Ok(graph) => Some((cached.token, graph)),
            Err(e) => {
                warn!("Ignoring invalid cached module graph: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ModuleSpec;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Adapter with a fixed marker that counts fresh resolutions
    struct Counting {
        marker: &'static str,
        resolutions: Arc<AtomicUsize>,
    }

    impl BuildSystem for Counting {
        fn name(&self) -> &'static str {
            self.marker
        }

        fn marker_files(&self, project_root: &Path) -> Vec<PathBuf> {
            vec![project_root.join(self.marker)]
        }

        fn resolve_modules_if_needed(
            &self,
            project_root: &Path,
            cached_token: Option<&str>,
        ) -> Result<Option<Resolution>, ResolveError> {
            let markers = self.marker_files(project_root);
            if token_is_valid(cached_token, &markers) {
                return Ok(None);
            }
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Resolution {
                graph: ModuleGraph::from_specs(vec![ModuleSpec::source(self.marker)])?,
                token: newest_mtime_millis(&markers).to_string(),
            }))
        }
    }

    fn counting(marker: &'static str) -> (Box<dyn BuildSystem>, Arc<AtomicUsize>) {
        let resolutions = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Counting {
                marker,
                resolutions: resolutions.clone(),
            }),
            resolutions,
        )
    }

    #[test]
    fn test_token_validity() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        fs::write(&marker, "x").unwrap();
        let paths = vec![marker];
        let newest = newest_mtime_millis(&paths);

        assert!(token_is_valid(Some(&newest.to_string()), &paths));
        assert!(token_is_valid(Some(&(newest + 1).to_string()), &paths));
        assert!(!token_is_valid(Some(&(newest - 1).to_string()), &paths));
        assert!(!token_is_valid(Some("garbage"), &paths));
        assert!(!token_is_valid(None, &paths));
    }

    #[test]
    fn test_selects_first_present_adapter() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("second"), "").unwrap();
        let (first, _) = counting("first");
        let (second, _) = counting("second");
        let resolver = BuildSystemResolver::new(vec![first, second]);
        assert_eq!(resolver.select(dir.path()).unwrap().name(), "second");

        fs::write(dir.path().join("first"), "").unwrap();
        assert_eq!(resolver.select(dir.path()).unwrap().name(), "first");
    }

    #[test]
    fn test_missing_build_system_is_fatal() {
        let dir = tempdir().unwrap();
        let err = BuildSystemResolver::default().select(dir.path()).err().unwrap();
        let message = err.to_string();
        assert!(matches!(err, ResolveError::NoBuildSystem { .. }));
        assert!(message.contains("workspace.json"));
        assert!(message.contains("settings.gradle.kts"));
    }

    #[test]
    fn test_cached_graph_reused_until_marker_changes() {
        let project = tempdir().unwrap();
        let base = tempdir().unwrap();
        fs::write(project.path().join("marker"), "v1").unwrap();
        let cache = CacheDir::for_project(project.path(), Some(base.path())).unwrap();
        let (adapter, resolutions) = counting("marker");
        let resolver = BuildSystemResolver::new(vec![adapter]);

        let graph = resolver.resolve(project.path(), &cache, false).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);

        resolver.resolve(project.path(), &cache, false).unwrap();
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);

        resolver.resolve(project.path(), &cache, true).unwrap();
        assert_eq!(resolutions.load(Ordering::SeqCst), 2);

        // Push the stored token into the past
        let mut cached = cache.load_module_graph().unwrap();
        cached.token = "0".to_string();
        cache.store_module_graph(&cached).unwrap();
        resolver.resolve(project.path(), &cache, false).unwrap();
        assert_eq!(resolutions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_malformed_cache_resolves_fresh() {
        let project = tempdir().unwrap();
        let base = tempdir().unwrap();
        fs::write(project.path().join("marker"), "v1").unwrap();
        let cache = CacheDir::for_project(project.path(), Some(base.path())).unwrap();
        fs::write(cache.module_graph_path(), "[[[").unwrap();

        let (adapter, resolutions) = counting("marker");
        let resolver = BuildSystemResolver::new(vec![adapter]);
        assert_eq!(resolver.resolve(project.path(), &cache, false).unwrap().len(), 1);
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert!(cache.load_module_graph().is_some());
    }
}
