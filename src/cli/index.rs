use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use kindex::config::Config;
use kindex::IndexSession;

pub async fn index_project(root: PathBuf, config: Config, watch: bool, rebuild: bool) -> Result<()> {
    let should_watch = watch || config.indexing.watch;

    println!("kindex v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", root.display());
    println!("Config: {}", if config.project.name != "unnamed-project" { "loaded" } else { "default" });
    println!("Watch: {}", should_watch);
    println!("Rebuild: {}", rebuild);

    let mut session = tokio::task::block_in_place(|| IndexSession::open(&root, config, rebuild))?;
    println!("Modules: {}", session.module_graph().len());
    println!("Index: {}", session.cache_dir().index_db_path().display());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message("Indexing...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let progress = tokio::task::block_in_place(|| session.wait_for_indexing());
    spinner.finish_and_clear();

    let stats = session.query().stats()?;
    println!("\nIndexing complete!");
    println!(
        "Scanned {}, indexed {}, unchanged {}, failed {}",
        progress.scanned, progress.indexed, progress.skipped, progress.failed
    );
    println!("Files: {} ({} indexed)", stats.total_files, stats.indexed_files);
    println!("Declarations: {}", stats.total_declarations);
    println!("Packages: {}", stats.total_packages);

    if should_watch {
        println!("\nWatching for file changes. Press Ctrl+C to stop.");
        let watcher = session.file_watcher();
        tokio::select! {
            result = watcher.watch() => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping watcher"),
        }
    } else {
        println!("Run with --watch to monitor for changes.");
    }

    tokio::task::block_in_place(|| session.shutdown());
    Ok(())
}
