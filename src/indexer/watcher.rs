// File watcher for incremental updates

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use super::scanner::SourceFilter;
use super::IndexCommand;
use crate::project::ModuleGraph;

/// Turns disk changes under the module content roots into index-lane work
pub struct FileWatcher {
    queue: Arc<WorkQueue<IndexCommand>>,
    graph: Arc<ModuleGraph>,
    filter: SourceFilter,
}

impl FileWatcher {
    pub fn new(queue: Arc<WorkQueue<IndexCommand>>, graph: Arc<ModuleGraph>, filter: SourceFilter) -> Self {
        Self { queue, graph, filter }
    }

    /// Watch every existing content root until the surrounding task is dropped
    pub async fn watch(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(256);

        // notify calls back on its own thread, outside the runtime
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("Failed to forward file event: {}", e);
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            Config::default(),
        )?;

        let mut watched = 0;
        for root in self.graph.content_roots() {
            if !root.is_dir() {
                debug!("Skipping missing content root {}", root.display());
                continue;
            }
            watcher.watch(root, RecursiveMode::Recursive)?;
            watched += 1;
        }
        info!("File watcher started on {} content roots", watched);

        while let Some(event) = rx.recv().await {
            let commands = self.commands_for_event(&event);
            if commands.is_empty() {
                continue;
            }
            let queue = self.queue.clone();
            // Submitting blocks while the index lane is full
            if let Err(e) = tokio::task::spawn_blocking(move || {
                for command in commands {
                    queue.submit_index(command);
                }
            })
            .await
            {
                warn!("Failed to submit file changes: {}", e);
            }
        }

        Ok(())
    }

    /// Index work implied by one file system event
    pub fn commands_for_event(&self, event: &Event) -> Vec<IndexCommand> {
        debug!("File event: {:?}", event);

        let mut commands = Vec::new();
        for path in &event.paths {
            if !self.is_tracked(path) {
                continue;
            }
            match event.kind {
                EventKind::Remove(_) => {
                    info!("File removed: {}", path.display());
                    commands.push(IndexCommand::RemoveFile(path.clone()));
                }
                // Renames report the old name as a modification of a path that is gone
                EventKind::Create(_) | EventKind::Modify(_) => {
                    if path.is_file() {
                        info!("File changed: {}", path.display());
                        commands.push(IndexCommand::IndexFile(path.clone()));
                    } else if !path.exists() {
                        info!("File moved away: {}", path.display());
                        commands.push(IndexCommand::RemoveFile(path.clone()));
                    }
                }
                _ => {}
            }
        }
        commands
    }

    fn is_tracked(&self, path: &Path) -> bool {
        self.graph.module_for_path(path).is_some() && self.filter.accepts(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config as KindexConfig;
    use crate::indexer::kotlin::KotlinExtractor;
    use crate::indexer::queue::LaneCapacities;
    use crate::project::ModuleSpec;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
    use std::time::Duration;
    use tempfile::tempdir;

    fn watcher(root: &Path) -> FileWatcher {
        let graph = ModuleGraph::from_specs(vec![ModuleSpec::source("app").content_root(root.join("src"))]).unwrap();
        let filter = SourceFilter::new(root, Arc::new(KindexConfig::default()), Arc::new(KotlinExtractor::default()));
        FileWatcher::new(Arc::new(WorkQueue::new(LaneCapacities::default())), Arc::new(graph), filter)
    }

    fn paths(commands: &[IndexCommand]) -> Vec<String> {
        commands
            .iter()
            .map(|c| match c {
                IndexCommand::IndexFile(p) => format!("index {}", p.file_name().unwrap().to_string_lossy()),
                IndexCommand::RemoveFile(p) => format!("remove {}", p.file_name().unwrap().to_string_lossy()),
                other => format!("{:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_create_and_modify_index_tracked_sources() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/A.kt"), "package a\n").unwrap();
        std::fs::write(dir.path().join("src/readme.md"), "").unwrap();
        std::fs::write(dir.path().join("Outside.kt"), "").unwrap();
        let watcher = watcher(dir.path());

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(dir.path().join("src/A.kt"))
            .add_path(dir.path().join("src/readme.md"))
            .add_path(dir.path().join("Outside.kt"));
        assert_eq!(paths(&watcher.commands_for_event(&event)), vec!["index A.kt"]);

        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(dir.path().join("src/A.kt"));
        assert_eq!(paths(&watcher.commands_for_event(&event)), vec!["index A.kt"]);
    }

    #[test]
    fn test_remove_and_rename() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/New.kt"), "package a\n").unwrap();
        let watcher = watcher(dir.path());

        let event = Event::new(EventKind::Remove(RemoveKind::File)).add_path(dir.path().join("src/Gone.kt"));
        assert_eq!(paths(&watcher.commands_for_event(&event)), vec!["remove Gone.kt"]);

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(dir.path().join("src/Old.kt"))
            .add_path(dir.path().join("src/New.kt"));
        assert_eq!(paths(&watcher.commands_for_event(&event)), vec!["remove Old.kt", "index New.kt"]);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/A.kt"), "").unwrap();
        let watcher = watcher(dir.path());

        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(dir.path().join("src/A.kt"));
        assert!(watcher.commands_for_event(&event).is_empty());
    }

    /// Drain `queue` into `seen` until `label` shows up
    async fn wait_for(queue: &WorkQueue<IndexCommand>, seen: &mut Vec<String>, label: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.iter().any(|s| s == label) {
            assert!(tokio::time::Instant::now() < deadline, "no {:?} among {:?}", label, seen);
            while !queue.is_empty() {
                seen.extend(paths(&[queue.take()]));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_watch_forwards_disk_changes() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        let watcher = watcher(&root);
        let file = root.join("src/W.kt");

        let changes = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut seen = Vec::new();
            std::fs::write(&file, "package w\n").unwrap();
            wait_for(&watcher.queue, &mut seen, "index W.kt").await;
            std::fs::remove_file(&file).unwrap();
            wait_for(&watcher.queue, &mut seen, "remove W.kt").await;
            seen
        };

        tokio::select! {
            result = watcher.watch() => panic!("watch loop ended: {:?}", result.err()),
            seen = changes => {
                let first_index = seen.iter().position(|s| s == "index W.kt").unwrap();
                let last_remove = seen.iter().rposition(|s| s == "remove W.kt").unwrap();
                assert!(first_index < last_remove);
            }
        }
    }
}
