// Project model: module dependency graph and build system resolution

pub mod cache;
pub mod document;
pub mod gradle;
pub mod resolver;
pub mod workspace_json;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Kotlin language version assumed when a build does not declare one
pub const DEFAULT_LANGUAGE_VERSION: &str = "2.1";

/// JVM target assumed when a build does not declare one
pub const DEFAULT_PLATFORM_VERSION: &str = "17";

/// Index of a module inside its graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdx(usize);

impl ModuleIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Source or library specific module attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    Source {
        language_version: String,
        platform_version: String,
    },
    Library {
        binary_roots: Vec<PathBuf>,
        is_sdk: bool,
        sources: Option<ModuleIdx>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: String,
    pub dependencies: Vec<ModuleIdx>,
    pub content_roots: Vec<PathBuf>,
    pub kind: ModuleKind,
}

impl Module {
    pub fn is_source(&self) -> bool {
        matches!(self.kind, ModuleKind::Source { .. })
    }

    /// Whether `path` lies under one of this module's content roots
    pub fn contains(&self, path: &Path) -> bool {
        self.content_roots.iter().any(|root| path.starts_with(root))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate module id `{0}`")]
    DuplicateModule(String),

    #[error("module `{module}` depends on unknown module `{dependency}`")]
    UnknownDependency { module: String, dependency: String },

    #[error("dependency cycle through module `{0}`")]
    Cycle(String),
}

/// A module as declared by a build system, with dependencies still named by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub id: String,
    pub dependencies: Vec<String>,
    pub content_roots: Vec<PathBuf>,
    pub kind: ModuleSpecKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSpecKind {
    Source {
        language_version: String,
        platform_version: String,
    },
    Library {
        binary_roots: Vec<PathBuf>,
        is_sdk: bool,
        sources: Option<String>,
    },
}

impl ModuleSpec {
    pub fn source(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            content_roots: Vec::new(),
            kind: ModuleSpecKind::Source {
                language_version: DEFAULT_LANGUAGE_VERSION.to_string(),
                platform_version: DEFAULT_PLATFORM_VERSION.to_string(),
            },
        }
    }

    pub fn library(id: impl Into<String>, binary_roots: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            content_roots: Vec::new(),
            kind: ModuleSpecKind::Library {
                binary_roots,
                is_sdk: false,
                sources: None,
            },
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn content_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.content_roots.push(root.into());
        self
    }
}

/// Immutable DAG of modules.
///
/// The arena stores every module after all of its dependencies, so arena
/// order is a valid dependency order.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    by_id: HashMap<String, ModuleIdx>,
    roots: Vec<ModuleIdx>,
}

impl ModuleGraph {
    /// Build a graph from id-linked specs, validating identity and acyclicity
    pub fn from_specs(specs: Vec<ModuleSpec>) -> Result<Self, GraphError> {
        let mut spec_by_id: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec_by_id.insert(spec.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateModule(spec.id.clone()));
            }
        }

        let mut dep_indices: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let mut deps = Vec::with_capacity(spec.dependencies.len());
            for dep in &spec.dependencies {
                let Some(&j) = spec_by_id.get(dep.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        module: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                deps.push(j);
            }
            dep_indices.push(deps);
        }
        for spec in &specs {
            if let ModuleSpecKind::Library { sources: Some(src), .. } = &spec.kind {
                if !spec_by_id.contains_key(src.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        module: spec.id.clone(),
                        dependency: src.clone(),
                    });
                }
            }
        }

        let order = topological_order(&specs, &dep_indices)?;

        // spec index -> arena index
        let mut placed = vec![ModuleIdx(0); specs.len()];
        for (arena_pos, &spec_idx) in order.iter().enumerate() {
            placed[spec_idx] = ModuleIdx(arena_pos);
        }

        let mut modules = Vec::with_capacity(specs.len());
        let mut by_id = HashMap::with_capacity(specs.len());
        for &spec_idx in &order {
            let spec = &specs[spec_idx];
            let kind = match &spec.kind {
                ModuleSpecKind::Source {
                    language_version,
                    platform_version,
                } => ModuleKind::Source {
                    language_version: language_version.clone(),
                    platform_version: platform_version.clone(),
                },
                ModuleSpecKind::Library {
                    binary_roots,
                    is_sdk,
                    sources,
                } => ModuleKind::Library {
                    binary_roots: binary_roots.clone(),
                    is_sdk: *is_sdk,
                    sources: sources.as_ref().map(|id| placed[spec_by_id[id.as_str()]]),
                },
            };
            by_id.insert(spec.id.clone(), ModuleIdx(modules.len()));
            modules.push(Module {
                id: spec.id.clone(),
                dependencies: dep_indices[spec_idx].iter().map(|&j| placed[j]).collect(),
                content_roots: spec.content_roots.clone(),
                kind,
            });
        }

        let referenced: HashSet<ModuleIdx> = modules.iter().flat_map(|m| m.dependencies.iter().copied()).collect();
        let roots = (0..modules.len())
            .map(ModuleIdx)
            .filter(|idx| !referenced.contains(idx))
            .collect();

        Ok(Self { modules, by_id, roots })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, idx: ModuleIdx) -> &Module {
        &self.modules[idx.0]
    }

    pub fn find(&self, id: &str) -> Option<&Module> {
        self.by_id.get(id).map(|&idx| self.module(idx))
    }

    pub fn index_of(&self, id: &str) -> Option<ModuleIdx> {
        self.by_id.get(id).copied()
    }

    /// Modules never referenced as a dependency
    pub fn roots(&self) -> impl Iterator<Item = &Module> + '_ {
        self.roots.iter().map(move |&idx| self.module(idx))
    }

    pub fn dependencies(&self, module: &Module) -> impl Iterator<Item = &Module> + '_ {
        module.dependencies.clone().into_iter().map(move |idx| self.module(idx))
    }

    /// All modules, every dependency before its dependents
    pub fn dependency_order(&self) -> impl Iterator<Item = &Module> + '_ {
        self.modules.iter()
    }

    /// Source modules in dependency order, then library modules in dependency order
    pub fn scan_order(&self) -> Vec<&Module> {
        let (mut sources, libraries): (Vec<&Module>, Vec<&Module>) =
            self.dependency_order().partition(|m| m.is_source());
        sources.extend(libraries);
        sources
    }

    /// Transitive closure of `start`, including `start` itself, in dependency order
    pub fn reachable_from(&self, start: ModuleIdx) -> Vec<&Module> {
        let mut seen = vec![false; self.modules.len()];
        let mut worklist = vec![start];
        while let Some(idx) = worklist.pop() {
            if std::mem::replace(&mut seen[idx.0], true) {
                continue;
            }
            worklist.extend(self.modules[idx.0].dependencies.iter().copied());
        }
        self.modules.iter().enumerate().filter(|(i, _)| seen[*i]).map(|(_, m)| m).collect()
    }

    /// Module owning `path`, preferring the most specific content root
    pub fn module_for_path(&self, path: &Path) -> Option<&Module> {
        self.modules
            .iter()
            .filter_map(|m| {
                m.content_roots
                    .iter()
                    .filter(|root| path.starts_with(root))
                    .map(|root| root.components().count())
                    .max()
                    .map(|depth| (depth, m))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, m)| m)
    }

    /// Every content root of every module, deduplicated, in scan order
    pub fn content_roots(&self) -> Vec<&Path> {
        let mut seen = HashSet::new();
        self.scan_order()
            .into_iter()
            .flat_map(|m| m.content_roots.iter())
            .filter(|root| seen.insert(root.as_path()))
            .map(|root| root.as_path())
            .collect()
    }
}

/// Post-order over the dependency relation with an explicit stack.
/// Returns spec indices with every dependency ahead of its dependents.
fn topological_order(specs: &[ModuleSpec], deps: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }

    let mut marks = vec![Mark::New; specs.len()];
    let mut order = Vec::with_capacity(specs.len());

    for start in 0..specs.len() {
        if marks[start] != Mark::New {
            continue;
        }
        // (node, next dependency to visit)
        let mut stack = vec![(start, 0usize)];
        marks[start] = Mark::Open;

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            if let Some(&dep) = deps[node].get(cursor) {
                frame.1 += 1;
                match marks[dep] {
                    Mark::Done => {}
                    Mark::Open => return Err(GraphError::Cycle(specs[dep].id.clone())),
                    Mark::New => {
                        marks[dep] = Mark::Open;
                        stack.push((dep, 0));
                    }
                }
            } else {
                marks[node] = Mark::Done;
                order.push(node);
                stack.pop();
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> ModuleGraph {
        ModuleGraph::from_specs(vec![
            ModuleSpec::source("app").depends_on("left").depends_on("right").content_root("/p/app"),
            ModuleSpec::source("left").depends_on("core").content_root("/p/left"),
            ModuleSpec::source("right").depends_on("core").depends_on("stdlib"),
            ModuleSpec::source("core").content_root("/p/core").depends_on("stdlib"),
            ModuleSpec::library("stdlib", vec![PathBuf::from("/jars/stdlib.jar")]),
        ])
        .unwrap()
    }

    fn position(order: &[&Module], id: &str) -> usize {
        order.iter().position(|m| m.id == id).unwrap()
    }

    #[test]
    fn test_dependency_order_places_dependencies_first() {
        let graph = diamond();
        let order: Vec<&Module> = graph.dependency_order().collect();
        assert_eq!(order.len(), 5);
        for module in &order {
            for dep in graph.dependencies(module) {
                assert!(position(&order, &dep.id) < position(&order, &module.id));
            }
        }
    }

    #[test]
    fn test_roots_are_unreferenced_modules() {
        let graph = diamond();
        let roots: Vec<&str> = graph.roots().map(|m| m.id.as_str()).collect();
        assert_eq!(roots, vec!["app"]);
    }

    #[test]
    fn test_scan_order_puts_sources_first() {
        let graph = diamond();
        let order = graph.scan_order();
        assert_eq!(order.last().unwrap().id, "stdlib");
        assert!(order[..4].iter().all(|m| m.is_source()));
        assert!(position(&order, "core") < position(&order, "left"));
    }

    #[test]
    fn test_reachable_from_handles_diamonds() {
        let graph = diamond();
        let left = graph.index_of("left").unwrap();
        let ids: Vec<&str> = graph.reachable_from(left).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"core") && ids.contains(&"stdlib") && ids.contains(&"left"));
    }

    #[test]
    fn test_module_for_path_prefers_deepest_root() {
        let graph = ModuleGraph::from_specs(vec![
            ModuleSpec::source("outer").content_root("/p"),
            ModuleSpec::source("inner").content_root("/p/inner/src"),
        ])
        .unwrap();

        assert_eq!(graph.module_for_path(Path::new("/p/inner/src/A.kt")).unwrap().id, "inner");
        assert_eq!(graph.module_for_path(Path::new("/p/B.kt")).unwrap().id, "outer");
        assert!(graph.module_for_path(Path::new("/elsewhere/C.kt")).is_none());
    }

    #[test]
    fn test_rejects_duplicates_unknowns_and_cycles() {
        let dup = ModuleGraph::from_specs(vec![ModuleSpec::source("a"), ModuleSpec::source("a")]);
        assert_eq!(dup.unwrap_err(), GraphError::DuplicateModule("a".to_string()));

        let unknown = ModuleGraph::from_specs(vec![ModuleSpec::source("a").depends_on("ghost")]);
        assert!(matches!(unknown, Err(GraphError::UnknownDependency { .. })));

        let cycle = ModuleGraph::from_specs(vec![
            ModuleSpec::source("a").depends_on("b"),
            ModuleSpec::source("b").depends_on("c"),
            ModuleSpec::source("c").depends_on("a"),
        ]);
        assert!(matches!(cycle, Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_library_sources_link() {
        let mut lib = ModuleSpec::library("lib", vec![PathBuf::from("/jars/lib.jar")]);
        if let ModuleSpecKind::Library { sources, .. } = &mut lib.kind {
            *sources = Some("lib-sources".to_string());
        }
        let graph = ModuleGraph::from_specs(vec![
            lib,
            ModuleSpec::library("lib-sources", vec![PathBuf::from("/jars/lib-sources.jar")]),
        ])
        .unwrap();

        let ModuleKind::Library { sources: Some(idx), .. } = &graph.find("lib").unwrap().kind else {
            panic!("expected library with sources");
        };
        assert_eq!(graph.module(*idx).id, "lib-sources");
    }
}
