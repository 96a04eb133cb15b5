// Gradle build system adapter

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::resolver::{newest_mtime_millis, token_is_valid, BuildSystem, Resolution, ResolveError};
use super::{ModuleGraph, ModuleSpec, ModuleSpecKind, DEFAULT_LANGUAGE_VERSION, DEFAULT_PLATFORM_VERSION};

const SETTINGS_FILES: &[&str] = &["settings.gradle.kts", "settings.gradle"];
const BUILD_FILES: &[&str] = &["build.gradle.kts", "build.gradle"];
const MAIN_SOURCE_DIRS: &[&str] = &["src/main/kotlin", "src/main/java"];
const TEST_SOURCE_DIRS: &[&str] = &["src/test/kotlin", "src/test/java"];

static INCLUDE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*include\s*\(?([^)\n]*)\)?").unwrap());
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());
static PROJECT_DEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"project\(\s*(?:path\s*[=:]\s*)?["']([^"']+)["']\s*\)"#).unwrap());
static FILES_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"files\(([^)]*)\)").unwrap());
static KOTLIN_PLUGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:kotlin\(\s*"[\w.-]+"\s*\)|id\(\s*"org\.jetbrains\.kotlin\.[\w.-]+"\s*\))\s*version\s*"([^"]+)""#)
        .unwrap()
});
static JVM_TOOLCHAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"jvmToolchain\(\s*(\d+)\s*\)").unwrap());
static JVM_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"jvmTarget\s*(?:=|\.set\()\s*(?:JvmTarget\.JVM_)?"?([\d_.]+)"?"#).unwrap());

/// What the build tool knows about one Gradle project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradleProject {
    /// Gradle path, `:` for the root project
    pub path: String,
    pub main_source_dirs: Vec<PathBuf>,
    pub test_source_dirs: Vec<PathBuf>,
    /// Gradle paths of `project(...)` dependencies
    pub project_dependencies: Vec<String>,
    pub jar_dependencies: Vec<PathBuf>,
    pub kotlin_version: Option<String>,
    pub jvm_target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectModel {
    pub projects: Vec<GradleProject>,
    /// JDK home, recorded as the platform SDK library
    pub sdk_home: Option<PathBuf>,
}

/// Source of Gradle project models
pub trait ProjectModelProvider: Send + Sync {
    fn load(&self, project_root: &Path) -> Result<ProjectModel, ResolveError>;

    /// Files that invalidate a previously loaded model when they change
    fn build_files(&self, project_root: &Path) -> Vec<PathBuf>;
}

/// Reads `settings.gradle(.kts)` and per-project build scripts by convention,
/// without running Gradle.
pub struct ConventionModelProvider {
    sdk_home: Option<PathBuf>,
}

impl Default for ConventionModelProvider {
    fn default() -> Self {
        Self::new(std::env::var_os("JAVA_HOME").map(PathBuf::from))
    }
}

impl ConventionModelProvider {
    pub fn new(sdk_home: Option<PathBuf>) -> Self {
        Self { sdk_home }
    }

    fn settings_file(project_root: &Path) -> Option<PathBuf> {
        SETTINGS_FILES
            .iter()
            .map(|name| project_root.join(name))
            .find(|p| p.is_file())
    }

    fn build_file(project_dir: &Path) -> Option<PathBuf> {
        BUILD_FILES.iter().map(|name| project_dir.join(name)).find(|p| p.is_file())
    }

    fn included_projects(&self, settings: &str) -> Vec<String> {
        let mut paths = Vec::new();
        for line in settings.lines() {
            let line = line.split("//").next().unwrap_or("");
            if let Some(caps) = INCLUDE.captures(line) {
                for quoted in QUOTED.captures_iter(&caps[1]) {
                    let path = quoted[1].trim();
                    let path = if path.starts_with(':') {
                        path.to_string()
                    } else {
                        format!(":{}", path)
                    };
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }
        paths
    }

    fn read_project(&self, project_root: &Path, gradle_path: &str) -> Result<GradleProject, ResolveError> {
        let dir = project_dir(project_root, gradle_path);
        let existing = |dirs: &[&str]| -> Vec<PathBuf> {
            dirs.iter().map(|d| dir.join(d)).filter(|p| p.is_dir()).collect()
        };

        let mut project = GradleProject {
            path: gradle_path.to_string(),
            main_source_dirs: existing(MAIN_SOURCE_DIRS),
            test_source_dirs: existing(TEST_SOURCE_DIRS),
            ..Default::default()
        };

        let Some(build_file) = Self::build_file(&dir) else {
            return Ok(project);
        };
        let script = fs::read_to_string(&build_file).map_err(|source| ResolveError::Io {
            path: build_file.clone(),
            source,
        })?;

        for line in script.lines() {
            let line = line.split("//").next().unwrap_or("");
            for caps in PROJECT_DEP.captures_iter(line) {
                let dep = caps[1].to_string();
                if dep != gradle_path && !project.project_dependencies.contains(&dep) {
                    project.project_dependencies.push(dep);
                }
            }
            for caps in FILES_CALL.captures_iter(line) {
                for quoted in QUOTED.captures_iter(&caps[1]) {
                    let jar = &quoted[1];
                    if jar.ends_with(".jar") {
                        let jar = PathBuf::from(jar);
                        let jar = if jar.is_absolute() { jar } else { dir.join(jar) };
                        if !project.jar_dependencies.contains(&jar) {
                            project.jar_dependencies.push(jar);
                        }
                    }
                }
            }
        }

        project.kotlin_version = KOTLIN_PLUGIN.captures(&script).map(|c| c[1].to_string());
        project.jvm_target = JVM_TOOLCHAIN
            .captures(&script)
            .or_else(|| JVM_TARGET.captures(&script))
            .map(|c| c[1].replace('_', "."));

        Ok(project)
    }
}

impl ProjectModelProvider for ConventionModelProvider {
    fn load(&self, project_root: &Path) -> Result<ProjectModel, ResolveError> {
        let mut gradle_paths = Vec::new();
        if let Some(settings) = Self::settings_file(project_root) {
            let text = fs::read_to_string(&settings).map_err(|source| ResolveError::Io {
                path: settings.clone(),
                source,
            })?;
            gradle_paths = self.included_projects(&text);
        }

        let mut projects = Vec::with_capacity(gradle_paths.len() + 1);
        let root = self.read_project(project_root, ":")?;
        // The root project only counts when it has sources or nothing else exists
        let has_root = gradle_paths.is_empty() || !root.main_source_dirs.is_empty() || !root.test_source_dirs.is_empty();

        for path in &gradle_paths {
            let mut project = self.read_project(project_root, path)?;
            project.kotlin_version = project.kotlin_version.or_else(|| root.kotlin_version.clone());
            project.jvm_target = project.jvm_target.or_else(|| root.jvm_target.clone());
            projects.push(project);
        }
        if has_root {
            projects.insert(0, root);
        }

        debug!("Gradle model: {} projects", projects.len());
        Ok(ProjectModel {
            projects,
            sdk_home: self.sdk_home.clone(),
        })
    }

    fn build_files(&self, project_root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = SETTINGS_FILES
            .iter()
            .chain(BUILD_FILES)
            .map(|name| project_root.join(name))
            .collect();

        if let Some(settings) = Self::settings_file(project_root) {
            if let Ok(text) = fs::read_to_string(settings) {
                for path in self.included_projects(&text) {
                    let dir = project_dir(project_root, &path);
                    files.extend(BUILD_FILES.iter().map(|name| dir.join(name)));
                }
            }
        }
        files
    }
}

/// Directory of a Gradle project path such as `:libs:core`
fn project_dir(project_root: &Path, gradle_path: &str) -> PathBuf {
    gradle_path
        .split(':')
        .filter(|segment| !segment.is_empty())
        .fold(project_root.to_path_buf(), |dir, segment| dir.join(segment))
}

/// Module ids of every project in `model`.
///
/// Subprojects use their Gradle path with `.` separators. The root project is
/// named after its directory, suffixed with `.root` while that clashes with a
/// subproject module.
fn module_ids(project_root: &Path, model: &ProjectModel) -> BTreeMap<String, String> {
    let is_root = |path: &str| path.trim_start_matches(':').is_empty();
    let mut ids = BTreeMap::new();
    let mut taken = BTreeSet::new();
    for project in model.projects.iter().filter(|p| !is_root(p.path.as_str())) {
        let id = project.path.trim_start_matches(':').replace(':', ".");
        taken.insert(format!("{}.test", id));
        taken.insert(id.clone());
        ids.insert(project.path.clone(), id);
    }

    let mut root_id = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    while taken.contains(&root_id) || taken.contains(&format!("{}.test", root_id)) {
        root_id.push_str(".root");
    }
    for project in model.projects.iter().filter(|p| is_root(p.path.as_str())) {
        ids.insert(project.path.clone(), root_id.clone());
    }
    ids
}

fn language_version(kotlin_version: Option<&str>) -> String {
    kotlin_version
        .and_then(|v| {
            let mut parts = v.split('.');
            Some(format!("{}.{}", parts.next()?, parts.next()?))
        })
        .unwrap_or_else(|| DEFAULT_LANGUAGE_VERSION.to_string())
}

/// Turn a project model into module specs: one source module per non-empty
/// source set, one library per jar, plus the JDK when known.
pub fn model_to_specs(project_root: &Path, model: &ProjectModel) -> Vec<ModuleSpec> {
    let mut specs = Vec::new();
    let mut libraries: BTreeSet<PathBuf> = BTreeSet::new();

    let sdk_id = model.sdk_home.as_ref().map(|home| {
        let mut sdk = ModuleSpec::library("sdk:jdk", vec![home.clone()]);
        if let ModuleSpecKind::Library { is_sdk, .. } = &mut sdk.kind {
            *is_sdk = true;
        }
        specs.push(sdk);
        "sdk:jdk".to_string()
    });

    // Projects without a main source set cannot be depended on
    let with_main: BTreeSet<&str> = model
        .projects
        .iter()
        .filter(|p| !p.main_source_dirs.is_empty())
        .map(|p| p.path.as_str())
        .collect();

    let ids = module_ids(project_root, model);
    for project in &model.projects {
        let Some(id) = ids.get(&project.path).cloned() else {
            continue;
        };
        let language_version = language_version(project.kotlin_version.as_deref());
        let platform_version = project
            .jvm_target
            .clone()
            .unwrap_or_else(|| DEFAULT_PLATFORM_VERSION.to_string());

        let mut dependencies: Vec<String> = project
            .project_dependencies
            .iter()
            .filter(|dep| with_main.contains(dep.as_str()))
            .filter_map(|dep| ids.get(dep).cloned())
            .collect();
        for jar in &project.jar_dependencies {
            dependencies.push(library_id(jar));
            libraries.insert(jar.clone());
        }
        dependencies.extend(sdk_id.clone());

        let source_set = |name: String, roots: &[PathBuf], deps: Vec<String>| ModuleSpec {
            id: name,
            dependencies: deps,
            content_roots: roots.to_vec(),
            kind: ModuleSpecKind::Source {
                language_version: language_version.clone(),
                platform_version: platform_version.clone(),
            },
        };

        if !project.main_source_dirs.is_empty() {
            specs.push(source_set(id.clone(), &project.main_source_dirs, dependencies.clone()));
        }
        if !project.test_source_dirs.is_empty() {
            let mut test_deps = dependencies;
            if !project.main_source_dirs.is_empty() {
                test_deps.insert(0, id.clone());
            }
            specs.push(source_set(format!("{}.test", id), &project.test_source_dirs, test_deps));
        }
    }

    // A sources jar may also be declared as a dependency of its own
    let mut emitted = BTreeSet::new();
    for jar in libraries {
        let id = library_id(&jar);
        let mut library = ModuleSpec::library(id.clone(), vec![jar.clone()]);
        if let Some(sources_jar) = sources_jar(&jar) {
            let sources_id = library_id(&sources_jar);
            if let ModuleSpecKind::Library { sources, .. } = &mut library.kind {
                *sources = Some(sources_id.clone());
            }
            if emitted.insert(sources_id.clone()) {
                specs.push(ModuleSpec::library(sources_id, vec![sources_jar]));
            }
        }
        if emitted.insert(id) {
            specs.push(library);
        }
    }

    specs
}

fn library_id(jar: &Path) -> String {
    format!("lib:{}", jar.display())
}

/// `foo.jar` -> `foo-sources.jar` when it exists alongside
fn sources_jar(jar: &Path) -> Option<PathBuf> {
    let stem = jar.file_stem()?.to_string_lossy();
    let candidate = jar.with_file_name(format!("{}-sources.jar", stem));
    candidate.is_file().then_some(candidate)
}

pub struct GradleBuildSystem<P: ProjectModelProvider = ConventionModelProvider> {
    provider: P,
}

impl Default for GradleBuildSystem {
    fn default() -> Self {
        Self::new(ConventionModelProvider::default())
    }
}

impl<P: ProjectModelProvider> GradleBuildSystem<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: ProjectModelProvider> BuildSystem for GradleBuildSystem<P> {
    fn name(&self) -> &'static str {
        "gradle"
    }

    fn marker_files(&self, project_root: &Path) -> Vec<PathBuf> {
        SETTINGS_FILES
            .iter()
            .chain(BUILD_FILES)
            .map(|name| project_root.join(name))
            .collect()
    }

    fn resolve_modules_if_needed(
        &self,
        project_root: &Path,
        cached_token: Option<&str>,
    ) -> Result<Option<Resolution>, ResolveError> {
        let build_files = self.provider.build_files(project_root);
        if token_is_valid(cached_token, &build_files) {
            debug!("Gradle build files unchanged since last resolution");
            return Ok(None);
        }

        let token = newest_mtime_millis(&build_files).to_string();
        let model = self.provider.load(project_root)?;
        if model.projects.is_empty() {
            warn!("Gradle project {} declares no source sets", project_root.display());
        }

        let graph = ModuleGraph::from_specs(model_to_specs(project_root, &model))?;
        Ok(Some(Resolution { graph, token }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ModuleKind;
    use tempfile::tempdir;

    fn write(path: PathBuf, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn multi_project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            root.join("settings.gradle.kts"),
            "rootProject.name = \"demo\"\ninclude(\":app\", \":libs:core\")\n// include(\":ghost\")\n",
        );
        write(
            root.join("build.gradle.kts"),
            "plugins {\n    kotlin(\"jvm\") version \"1.9.24\"\n}\nkotlin { jvmToolchain(21) }\n",
        );
        write(
            root.join("app/build.gradle.kts"),
            "dependencies {\n    implementation(project(\":libs:core\"))\n    implementation(files(\"libs/gson.jar\"))\n}\n",
        );
        write(root.join("app/libs/gson.jar"), "");
        write(root.join("app/libs/gson-sources.jar"), "");
        write(root.join("app/src/main/kotlin/Main.kt"), "fun main() {}\n");
        write(root.join("app/src/test/kotlin/MainTest.kt"), "class MainTest\n");
        write(root.join("libs/core/build.gradle"), "dependencies { }\n");
        write(root.join("libs/core/src/main/kotlin/Core.kt"), "class Core\n");
        dir
    }

    #[test]
    fn test_convention_provider_reads_settings_and_scripts() {
        let dir = multi_project();
        let model = ConventionModelProvider::new(None).load(dir.path()).unwrap();

        let paths: Vec<&str> = model.projects.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec![":app", ":libs:core"]);

        let app = &model.projects[0];
        assert_eq!(app.project_dependencies, vec![":libs:core".to_string()]);
        assert_eq!(app.jar_dependencies, vec![dir.path().join("app/libs/gson.jar")]);
        assert_eq!(app.kotlin_version.as_deref(), Some("1.9.24"));
        assert_eq!(app.jvm_target.as_deref(), Some("21"));
    }

    #[test]
    fn test_gradle_graph() {
        let dir = multi_project();
        let gradle = GradleBuildSystem::new(ConventionModelProvider::new(Some(PathBuf::from("/opt/jdk"))));
        let resolution = gradle.resolve_modules_if_needed(dir.path(), None).unwrap().unwrap();
        let graph = resolution.graph;

        let app = graph.find("app").unwrap();
        let deps: Vec<&str> = graph.dependencies(app).map(|m| m.id.as_str()).collect();
        let gson = format!("lib:{}", dir.path().join("app/libs/gson.jar").display());
        assert_eq!(deps, vec!["libs.core", gson.as_str(), "sdk:jdk"]);
        assert_eq!(
            app.kind,
            ModuleKind::Source {
                language_version: "1.9".to_string(),
                platform_version: "21".to_string(),
            }
        );

        let test = graph.find("app.test").unwrap();
        assert_eq!(graph.dependencies(test).next().unwrap().id, "app");

        let ModuleKind::Library { sources: Some(sources), .. } = graph.find(&gson).unwrap().kind else {
            panic!("gson should carry its sources jar");
        };
        assert!(graph.module(sources).id.ends_with("gson-sources.jar"));
        assert!(matches!(graph.find("sdk:jdk").unwrap().kind, ModuleKind::Library { is_sdk: true, .. }));

        let again = gradle
            .resolve_modules_if_needed(dir.path(), Some(&resolution.token))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_single_project_build() {
        let dir = tempdir().unwrap();
        write(dir.path().join("build.gradle"), "apply plugin: 'kotlin'\n");
        write(dir.path().join("src/main/kotlin/A.kt"), "class A\n");

        let gradle = GradleBuildSystem::new(ConventionModelProvider::new(None));
        let graph = gradle.resolve_modules_if_needed(dir.path(), None).unwrap().unwrap().graph;
        assert_eq!(graph.len(), 1);
        let module = graph.dependency_order().next().unwrap();
        assert_eq!(module.content_roots, vec![dir.path().join("src/main/kotlin")]);
    }

    #[test]
    fn test_language_version_from_plugin_version() {
        assert_eq!(language_version(Some("2.0.21")), "2.0");
        assert_eq!(language_version(Some("2")), DEFAULT_LANGUAGE_VERSION);
        assert_eq!(language_version(None), DEFAULT_LANGUAGE_VERSION);
    }

    #[test]
    fn test_sources_jar_declared_as_dependency() {
        let dir = tempdir().unwrap();
        write(
            dir.path().join("build.gradle.kts"),
            "dependencies {\n    implementation(files(\"libs/a.jar\", \"libs/a-sources.jar\"))\n}\n",
        );
        write(dir.path().join("libs/a.jar"), "");
        write(dir.path().join("libs/a-sources.jar"), "");
        write(dir.path().join("src/main/kotlin/A.kt"), "class A\n");

        let gradle = GradleBuildSystem::new(ConventionModelProvider::new(None));
        let graph = gradle.resolve_modules_if_needed(dir.path(), None).unwrap().unwrap().graph;
        assert_eq!(graph.len(), 3);

        let jar = format!("lib:{}", dir.path().join("libs/a.jar").display());
        let ModuleKind::Library { sources: Some(sources), .. } = graph.find(&jar).unwrap().kind else {
            panic!("a.jar should carry its sources jar");
        };
        assert!(graph.module(sources).id.ends_with("a-sources.jar"));
    }

    #[test]
    fn test_root_project_named_like_subproject() {
        let model = ProjectModel {
            projects: vec![
                GradleProject {
                    path: ":".to_string(),
                    main_source_dirs: vec![PathBuf::from("/work/app/src/main/kotlin")],
                    ..Default::default()
                },
                GradleProject {
                    path: ":app".to_string(),
                    main_source_dirs: vec![PathBuf::from("/work/app/app/src/main/kotlin")],
                    test_source_dirs: vec![PathBuf::from("/work/app/app/src/test/kotlin")],
                    project_dependencies: vec![":".to_string()],
                    ..Default::default()
                },
            ],
            sdk_home: None,
        };

        let specs = model_to_specs(Path::new("/work/app"), &model);
        let ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["app.root", "app", "app.test"]);
        assert_eq!(specs[1].dependencies, vec!["app.root"]);
        assert!(ModuleGraph::from_specs(specs).is_ok());
    }
}
