use anyhow::{Context, Result};
use std::path::Path;

use super::{cache_dir, OutputFormat};
use kindex::config::Config;
use kindex::project::resolver::BuildSystemResolver;
use kindex::project::{document, ModuleKind};

pub fn show_modules(root: &Path, config: &Config, refresh: bool, format: OutputFormat) -> Result<()> {
    let cache = cache_dir(root, config)?;
    let graph = BuildSystemResolver::default()
        .resolve(root, &cache, refresh)
        .context("Failed to resolve module graph")?;

    if format == OutputFormat::Json {
        println!("{}", document::to_json(&graph)?);
        return Ok(());
    }

    println!("{} modules, dependencies first:", graph.len());
    for module in graph.dependency_order() {
        let kind = match &module.kind {
            ModuleKind::Source {
                language_version,
                platform_version,
            } => format!("source, Kotlin {}, JVM {}", language_version, platform_version),
            ModuleKind::Library { is_sdk: true, .. } => "sdk".to_string(),
            ModuleKind::Library { binary_roots, .. } => format!("library, {} binary roots", binary_roots.len()),
        };
        println!("  {} ({})", module.id, kind);
        for dependency in graph.dependencies(module) {
            println!("    -> {}", dependency.id);
        }
    }
    Ok(())
}
