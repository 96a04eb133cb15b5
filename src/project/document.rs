// Flat, portable module graph document

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{
    GraphError, ModuleGraph, ModuleKind, ModuleSpec, ModuleSpecKind, DEFAULT_LANGUAGE_VERSION,
    DEFAULT_PLATFORM_VERSION,
};

/// One module, linked to others by id only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub content_roots: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary_roots: Vec<PathBuf>,
    pub is_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_sdk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_sources: Option<String>,
}

impl From<ModuleRecord> for ModuleSpec {
    fn from(record: ModuleRecord) -> Self {
        let kind = if record.is_source {
            ModuleSpecKind::Source {
                language_version: record
                    .language_version
                    .unwrap_or_else(|| DEFAULT_LANGUAGE_VERSION.to_string()),
                platform_version: record
                    .platform_version
                    .unwrap_or_else(|| DEFAULT_PLATFORM_VERSION.to_string()),
            }
        } else {
            ModuleSpecKind::Library {
                binary_roots: record.binary_roots,
                is_sdk: record.is_sdk,
                sources: record.library_sources,
            }
        };
        ModuleSpec {
            id: record.id,
            dependencies: record.dependencies,
            content_roots: record.content_roots,
            kind,
        }
    }
}

/// Flatten a graph, visiting each module once starting from the roots
pub fn serialize(graph: &ModuleGraph) -> Vec<ModuleRecord> {
    let mut visited = HashSet::with_capacity(graph.len());
    let mut records = Vec::with_capacity(graph.len());

    // Every module is reachable from some root; the arena sweep is a safety net
    let entry_points = graph
        .roots
        .iter()
        .copied()
        .chain((0..graph.len()).map(super::ModuleIdx));

    for entry in entry_points {
        let mut worklist = vec![entry];
        while let Some(idx) = worklist.pop() {
            if !visited.insert(idx) {
                continue;
            }
            records.push(to_record(graph, idx));
            // Reversed so dependencies are emitted in declaration order
            worklist.extend(graph.module(idx).dependencies.iter().rev().copied());
        }
    }

    records
}

fn to_record(graph: &ModuleGraph, idx: super::ModuleIdx) -> ModuleRecord {
    let module = graph.module(idx);
    let dependencies = module.dependencies.iter().map(|&d| graph.module(d).id.clone()).collect();

    match &module.kind {
        ModuleKind::Source {
            language_version,
            platform_version,
        } => ModuleRecord {
            id: module.id.clone(),
            dependencies,
            content_roots: module.content_roots.clone(),
            binary_roots: Vec::new(),
            is_source: true,
            language_version: Some(language_version.clone()),
            platform_version: Some(platform_version.clone()),
            is_sdk: false,
            library_sources: None,
        },
        ModuleKind::Library {
            binary_roots,
            is_sdk,
            sources,
        } => ModuleRecord {
            id: module.id.clone(),
            dependencies,
            content_roots: module.content_roots.clone(),
            binary_roots: binary_roots.clone(),
            is_source: false,
            language_version: None,
            platform_version: None,
            is_sdk: *is_sdk,
            library_sources: sources.map(|s| graph.module(s).id.clone()),
        },
    }
}

/// Rebuild a graph from records; dangling ids, duplicates and cycles are rejected
pub fn deserialize(records: Vec<ModuleRecord>) -> Result<ModuleGraph, GraphError> {
    ModuleGraph::from_specs(records.into_iter().map(ModuleSpec::from).collect())
}

pub fn to_json(graph: &ModuleGraph) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&serialize(graph))
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed module graph document: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub fn from_json(text: &str) -> Result<ModuleGraph, DocumentError> {
    let records: Vec<ModuleRecord> = serde_json::from_str(text)?;
    Ok(deserialize(records)?)
}
