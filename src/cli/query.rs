use anyhow::Result;
use std::path::Path;

use super::{open_query_engine, OutputFormat};
use kindex::config::Config;
use kindex::query::CompletionItem;

pub fn complete(
    root: &Path,
    config: &Config,
    prefix: &str,
    receiver: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_query_engine(root, config)?;
    let items: Vec<CompletionItem> = engine
        .complete(prefix, receiver, limit)?
        .into_iter()
        .map(CompletionItem::from)
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No declarations starting with '{}'", prefix);
            }
            for item in items {
                println!("{:<32} {:<16} {}", item.fq_name, item.kind, item.detail);
            }
        }
    }
    Ok(())
}

pub fn package_files(root: &Path, config: &Config, fq_name: &str, format: OutputFormat) -> Result<()> {
    let files = open_query_engine(root, config)?.files_in_package(fq_name)?;
    print_list(&files, format, &format!("No files in package '{}'", fq_name))
}

pub fn subpackages(root: &Path, config: &Config, prefix: &str, format: OutputFormat) -> Result<()> {
    let segments = open_query_engine(root, config)?.subpackages(prefix)?;
    print_list(&segments, format, &format!("No subpackages under '{}'", prefix))
}

fn print_list(entries: &[String], format: OutputFormat, empty: &str) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text if entries.is_empty() => println!("{}", empty),
        OutputFormat::Text => entries.iter().for_each(|entry| println!("{}", entry)),
    }
    Ok(())
}
