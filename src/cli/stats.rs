use anyhow::Result;
use std::path::Path;

use super::{open_query_engine, OutputFormat};
use kindex::config::Config;

pub fn show_stats(root: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_query_engine(root, config)?;
    let stats = engine.stats()?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("kindex statistics v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", root.display());
    println!("\nIndex Statistics:");
    println!("  Total files: {}", stats.total_files);
    println!("  Indexed files: {}", stats.indexed_files);
    println!("  Declarations: {}", stats.total_declarations);
    println!("  Packages: {}", stats.total_packages);

    let db_path = super::cache_dir(root, config)?.index_db_path();
    println!("  Index size: {:.2} MB", get_db_size(&db_path)?);

    Ok(())
}

fn get_db_size(db_path: &Path) -> Result<f64> {
    let metadata = std::fs::metadata(db_path)?;
    Ok(metadata.len() as f64 / (1024.0 * 1024.0))
}
