// Hand-authored `workspace.json` module graphs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::document::{self, DocumentError, ModuleRecord};
use super::resolver::{newest_mtime_millis, token_is_valid, BuildSystem, Resolution, ResolveError};

pub const WORKSPACE_FILE: &str = "workspace.json";

/// Reads the module graph document straight from the project root.
/// Relative roots are resolved against the project root.
pub struct WorkspaceJsonBuildSystem;

impl BuildSystem for WorkspaceJsonBuildSystem {
    fn name(&self) -> &'static str {
        WORKSPACE_FILE
    }

    fn marker_files(&self, project_root: &Path) -> Vec<PathBuf> {
        vec![project_root.join(WORKSPACE_FILE)]
    }

    fn resolve_modules_if_needed(
        &self,
        project_root: &Path,
        cached_token: Option<&str>,
    ) -> Result<Option<Resolution>, ResolveError> {
        let markers = self.marker_files(project_root);
        if token_is_valid(cached_token, &markers) {
            debug!("{} unchanged since last resolution", WORKSPACE_FILE);
            return Ok(None);
        }

        let path = &markers[0];
        let token = newest_mtime_millis(&markers).to_string();
        let text = fs::read_to_string(path).map_err(|source| ResolveError::Io {
            path: path.clone(),
            source,
        })?;

        let records: Vec<ModuleRecord> = serde_json::from_str(&text).map_err(|e| ResolveError::Document {
            path: path.clone(),
            source: DocumentError::Json(e),
        })?;

        let records = records
            .into_iter()
            .map(|record| absolutize(project_root, record))
            .collect();

        let graph = document::deserialize(records).map_err(|e| ResolveError::Document {
            path: path.clone(),
            source: DocumentError::Graph(e),
        })?;

        Ok(Some(Resolution { graph, token }))
    }
}

fn absolutize(project_root: &Path, mut record: ModuleRecord) -> ModuleRecord {
    let join = |p: PathBuf| if p.is_absolute() { p } else { project_root.join(p) };
    record.content_roots = record.content_roots.into_iter().map(join).collect();
    record.binary_roots = record.binary_roots.into_iter().map(join).collect();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WORKSPACE: &str = r#"[
        {"id": "app", "isSource": true, "dependencies": ["core", "stdlib"], "contentRoots": ["app/src"]},
        {"id": "core", "isSource": true, "dependencies": ["stdlib"], "contentRoots": ["core/src"], "languageVersion": "1.9"},
        {"id": "stdlib", "isSource": false, "binaryRoots": ["/opt/kotlin/stdlib.jar"]}
    ]"#;

    #[test]
    fn test_resolves_document_with_relative_roots() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(WORKSPACE_FILE), WORKSPACE).unwrap();

        let resolution = WorkspaceJsonBuildSystem
            .resolve_modules_if_needed(dir.path(), None)
            .unwrap()
            .unwrap();

        let graph = resolution.graph;
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.find("app").unwrap().content_roots, vec![dir.path().join("app/src")]);
        assert_eq!(graph.roots().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["app"]);

        let stdlib = graph.find("stdlib").unwrap();
        assert!(!stdlib.is_source());
        assert!(matches!(
            &stdlib.kind,
            crate::project::ModuleKind::Library { binary_roots, .. } if binary_roots[0] == Path::new("/opt/kotlin/stdlib.jar")
        ));

        // Unchanged document keeps the token valid
        let again = WorkspaceJsonBuildSystem
            .resolve_modules_if_needed(dir.path(), Some(&resolution.token))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_invalid_document_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(WORKSPACE_FILE), r#"[{"id": "a", "isSource": true, "dependencies": ["a"]}]"#)
            .unwrap();

        let err = WorkspaceJsonBuildSystem
            .resolve_modules_if_needed(dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, ResolveError::Document { .. }));
    }
}
