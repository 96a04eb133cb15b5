// Index pipeline: commands, the single index worker and its progress reporting

pub mod extractor;
pub mod kotlin;
pub mod queue;
pub mod scanner;
pub mod watcher;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::index::db::{IndexDatabase, StoreError};
use crate::index::staleness::should_skip;
use crate::index::{last_modified_millis, FileRecord};
use extractor::{ExtractError, FileHandle, SemanticExtractor};
use queue::WorkQueue;

/// Work items consumed by the index worker
#[derive(Debug, Clone)]
pub enum IndexCommand {
    /// Record package and timestamps of a file without extracting declarations
    ScanFile(PathBuf),
    /// Extract and store the declarations of a file on disk
    IndexFile(PathBuf),
    /// Extract and store the declarations of an in-memory edit
    IndexModifiedFile(FileHandle),
    /// Forget a file that disappeared from disk
    RemoveFile(PathBuf),
    SourceScanFinished,
    IndexingFinished,
    Stop,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("index store already closed")]
    Closed,
}

/// Counters published by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexProgress {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub source_scans_finished: usize,
    pub batches_finished: usize,
}

/// Shared view of worker progress that callers can block on
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<IndexProgress>,
    changed: Condvar,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IndexProgress {
        self.state.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut IndexProgress)) {
        f(&mut self.state.lock());
        self.changed.notify_all();
    }

    /// Block until at least `batches` `IndexingFinished` markers were processed
    pub fn wait_for_batches(&self, batches: usize) -> IndexProgress {
        let mut state = self.state.lock();
        while state.batches_finished < batches {
            self.changed.wait(&mut state);
        }
        state.clone()
    }
}

/// Canonical form of `path` used as the file key.
///
/// Files that no longer exist keep their canonical parent so a removal finds
/// the key the file was indexed under.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Latest unsaved text of every file open in the editor.
///
/// While a file is listed here, disk-driven scans and index commands use this
/// text instead of the file on disk.
#[derive(Default)]
pub struct OpenEdits {
    files: Mutex<HashMap<PathBuf, FileHandle>>,
}

impl OpenEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `handle` unless a newer edit of the same file is held.
    /// Returns the handle keyed by its canonical path.
    pub fn record(&self, handle: FileHandle) -> FileHandle {
        let handle = FileHandle {
            path: canonical_path(&handle.path),
            ..handle
        };
        let mut files = self.files.lock();
        let newer_held = files
            .get(&handle.path)
            .map_or(false, |held| held.modification_stamp > handle.modification_stamp);
        if !newer_held {
            files.insert(handle.path.clone(), handle.clone());
        }
        handle
    }

    /// Held edit of a canonical path
    pub fn get(&self, path: &Path) -> Option<FileHandle> {
        self.files.lock().get(path).cloned()
    }

    /// Forget the edit of `path`; returns whether one was held
    pub fn discard(&self, path: &Path) -> bool {
        self.files.lock().remove(&canonical_path(path)).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Scanned,
    Indexed,
    Skipped,
    Removed,
    SourceScanFinished,
    BatchFinished,
}

/// Single consumer of the work queue and the only writer of the store
pub struct IndexWorker {
    db: Option<IndexDatabase>,
    extractor: Arc<dyn SemanticExtractor>,
    queue: Arc<WorkQueue<IndexCommand>>,
    progress: Arc<ProgressTracker>,
    edits: Arc<OpenEdits>,
}

impl IndexWorker {
    pub fn new(
        db: IndexDatabase,
        extractor: Arc<dyn SemanticExtractor>,
        queue: Arc<WorkQueue<IndexCommand>>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            db: Some(db),
            extractor,
            queue,
            progress,
            edits: Arc::new(OpenEdits::new()),
        }
    }

    /// Share the editor overlay consulted by disk-driven commands
    pub fn with_open_edits(mut self, edits: Arc<OpenEdits>) -> Self {
        self.edits = edits;
        self
    }

    /// Run the worker on its own thread inside `span`
    pub fn spawn(self, span: tracing::Span) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("kindex-worker".to_string())
            .spawn(move || {
                let _entered = span.enter();
                self.run();
            })
    }

    /// Consume commands until `Stop`, then close the store
    pub fn run(mut self) {
        info!("Index worker started");
        loop {
            let command = self.queue.take();
            if matches!(command, IndexCommand::Stop) {
                break;
            }
            let label = command_label(&command);
            // A panicking extractor fails its file, not the worker
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.handle(command)));
            match result {
                Ok(Ok(outcome)) => self.progress.update(|p| match outcome {
                    Outcome::Scanned => p.scanned += 1,
                    Outcome::Indexed => p.indexed += 1,
                    Outcome::Skipped => p.skipped += 1,
                    Outcome::Removed => p.removed += 1,
                    Outcome::SourceScanFinished => p.source_scans_finished += 1,
                    Outcome::BatchFinished => p.batches_finished += 1,
                }),
                Ok(Err(e)) => {
                    warn!("{} failed: {}", label, e);
                    self.progress.update(|p| p.failed += 1);
                }
                Err(payload) => {
                    warn!("{} panicked: {}", label, panic_message(payload.as_ref()));
                    self.progress.update(|p| p.failed += 1);
                }
            }
        }
        self.close();
        info!("Index worker stopped");
    }

    fn handle(&self, command: IndexCommand) -> Result<Outcome, IndexError> {
        let db = self.db.as_ref().ok_or(IndexError::Closed)?;
        match command {
            IndexCommand::ScanFile(path) => self.scan_file(db, &path),
            IndexCommand::IndexFile(path) => {
                let path = canonical_path(&path);
                let handle = self.edits.get(&path).unwrap_or_else(|| FileHandle::on_disk(path));
                self.index_file(db, handle)
            }
            IndexCommand::IndexModifiedFile(handle) => self.index_file(db, handle),
            IndexCommand::RemoveFile(path) => {
                let key = canonical_path(&path).to_string_lossy().into_owned();
                if db.remove_file(&key)? {
                    debug!("Removed {} from the index", key);
                    Ok(Outcome::Removed)
                } else {
                    Ok(Outcome::Skipped)
                }
            }
            IndexCommand::SourceScanFinished => {
                info!("Source module scan finished");
                Ok(Outcome::SourceScanFinished)
            }
            IndexCommand::IndexingFinished => {
                let stats = db.get_stats()?;
                info!(
                    "Indexing finished: {} files, {} declarations",
                    stats.indexed_files, stats.total_declarations
                );
                Ok(Outcome::BatchFinished)
            }
            // Handled by the run loop
            IndexCommand::Stop => Ok(Outcome::Skipped),
        }
    }

    fn scan_file(&self, db: &IndexDatabase, path: &Path) -> Result<Outcome, IndexError> {
        let path = canonical_path(path);
        if self.edits.get(&path).is_some() {
            debug!("{} has unsaved edits, leaving its record to the edit", path.display());
            return Ok(Outcome::Skipped);
        }
        let key = path.to_string_lossy().into_owned();
        let last_modified = last_modified_millis(&path).map_err(|source| ExtractError::Read {
            path: path.clone(),
            source,
        })?;

        let candidate = FileRecord::new(key.as_str(), "", last_modified, 0);
        let existing = db.file_record(&key)?;
        if should_skip(existing.as_ref(), &candidate) {
            return Ok(Outcome::Skipped);
        }

        let unit = FileHandle::on_disk(path).load()?;
        let package = self.extractor.read_package(&unit)?;
        db.upsert_file(&unit.record(package))?;
        Ok(Outcome::Scanned)
    }

    fn index_file(&self, db: &IndexDatabase, handle: FileHandle) -> Result<Outcome, IndexError> {
        let handle = FileHandle {
            path: canonical_path(&handle.path),
            ..handle
        };
        let unit = handle.load()?;

        // Header records from a scan only say the file exists; they never make extraction redundant
        let candidate = unit.record("");
        let existing = db.file_record(&candidate.path)?;
        if let Some(existing) = existing.as_ref().filter(|r| r.indexed) {
            if should_skip(Some(existing), &candidate) {
                return Ok(Outcome::Skipped);
            }
        }

        let extraction = self.extractor.extract(&unit)?;
        db.replace_file(&extraction.record, &extraction.declarations)?;
        debug!("Indexed {} ({} declarations)", candidate.path, extraction.declarations.len());
        Ok(Outcome::Indexed)
    }

    /// Release the store; later calls are no-ops
    pub fn close(&mut self) {
        if let Some(db) = self.db.take() {
            if let Err(e) = db.close() {
                warn!("Failed to close index store: {}", e);
            }
        }
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn command_label(command: &IndexCommand) -> String {
    match command {
        IndexCommand::ScanFile(path) => format!("scan {}", path.display()),
        IndexCommand::IndexFile(path) => format!("index {}", path.display()),
        IndexCommand::IndexModifiedFile(handle) => {
            format!("index edit {} #{}", handle.path.display(), handle.modification_stamp)
        }
        IndexCommand::RemoveFile(path) => format!("remove {}", path.display()),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::extractor::{Extraction, SourceUnit};
    use crate::indexer::kotlin::KotlinExtractor;
    use crate::indexer::queue::LaneCapacities;
    use tempfile::tempdir;

    struct Pipeline {
        db: IndexDatabase,
        queue: Arc<WorkQueue<IndexCommand>>,
        progress: Arc<ProgressTracker>,
        edits: Arc<OpenEdits>,
    }

    impl Pipeline {
        fn new(db_path: &Path) -> Self {
            Self {
                db: IndexDatabase::open(db_path).unwrap(),
                queue: Arc::new(WorkQueue::new(LaneCapacities::default())),
                progress: Arc::new(ProgressTracker::new()),
                edits: Arc::new(OpenEdits::new()),
            }
        }

        /// Queue `commands` on the index lane and run the worker to completion on this thread
        fn run(&self, extractor: Arc<dyn SemanticExtractor>, commands: Vec<IndexCommand>) -> IndexProgress {
            for command in commands {
                self.queue.submit_index(command);
            }
            self.queue.submit_index(IndexCommand::Stop);
            IndexWorker::new(self.db.clone(), extractor, self.queue.clone(), self.progress.clone())
                .with_open_edits(self.edits.clone())
                .run();
            self.progress.snapshot()
        }
    }

    fn kotlin() -> Arc<dyn SemanticExtractor> {
        Arc::new(KotlinExtractor::default())
    }

    fn names(db: &IndexDatabase, path: &Path) -> Vec<String> {
        let key = canonical_path(path).to_string_lossy().into_owned();
        db.declarations_in_file(&key).unwrap().into_iter().map(|d| d.fq_name).collect()
    }

    #[test]
    fn test_scan_then_index_then_idle_pass() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("Main.kt");
        std::fs::write(&source, "package demo\n\nfun foo() {}\n\nclass Bar {\n    val baz: String = \"\"\n}\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        let progress = pipeline.run(
            kotlin(),
            vec![
                IndexCommand::ScanFile(source.clone()),
                IndexCommand::IndexFile(source.clone()),
                IndexCommand::IndexingFinished,
            ],
        );
        assert_eq!(progress.scanned, 1);
        assert_eq!(progress.indexed, 1);
        assert_eq!(progress.batches_finished, 1);
        assert_eq!(names(&pipeline.db, &source), vec!["demo.foo", "demo.Bar", "demo.Bar.baz"]);

        let writes = pipeline.db.write_count();
        let progress = pipeline.run(
            kotlin(),
            vec![IndexCommand::ScanFile(source.clone()), IndexCommand::IndexFile(source)],
        );
        assert_eq!(progress.skipped, 2);
        assert_eq!(pipeline.db.write_count(), writes);
    }

    #[test]
    fn test_header_record_does_not_suppress_extraction() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("A.kt");
        std::fs::write(&source, "package a\nfun one() = 1\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        pipeline.run(kotlin(), vec![IndexCommand::ScanFile(source.clone())]);

        let key = canonical_path(&source).to_string_lossy().into_owned();
        let record = pipeline.db.file_record(&key).unwrap().unwrap();
        assert!(!record.indexed);
        assert_eq!(record.package_fq_name, "a");
        assert!(names(&pipeline.db, &source).is_empty());

        pipeline.run(kotlin(), vec![IndexCommand::IndexFile(source.clone())]);
        assert!(pipeline.db.file_record(&key).unwrap().unwrap().indexed);
        assert_eq!(names(&pipeline.db, &source), vec!["a.one"]);
    }

    #[test]
    fn test_edit_then_disk_reload() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("E.kt");
        std::fs::write(&source, "package e\nfun onDisk() {}\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        let edit = pipeline
            .edits
            .record(FileHandle::edited(&source, 3, "package e\nfun inMemory() {}\n"));
        pipeline.run(kotlin(), vec![IndexCommand::IndexModifiedFile(edit)]);
        assert_eq!(names(&pipeline.db, &source), vec!["e.inMemory"]);

        // An older edit arriving late changes nothing
        let progress = pipeline.run(
            kotlin(),
            vec![IndexCommand::IndexModifiedFile(FileHandle::edited(
                &source,
                2,
                "package e\nfun stale() {}\n",
            ))],
        );
        assert_eq!(progress.skipped, 1);
        assert_eq!(names(&pipeline.db, &source), vec!["e.inMemory"]);

        // Disk passes over an open file keep its unsaved text
        let writes = pipeline.db.write_count();
        let progress = pipeline.run(
            kotlin(),
            vec![IndexCommand::ScanFile(source.clone()), IndexCommand::IndexFile(source.clone())],
        );
        assert_eq!(progress.skipped, 3);
        assert_eq!(pipeline.db.write_count(), writes);
        assert_eq!(names(&pipeline.db, &source), vec!["e.inMemory"]);

        // Once the edit is discarded the disk text wins again
        assert!(pipeline.edits.discard(&source));
        pipeline.run(kotlin(), vec![IndexCommand::IndexFile(source.clone())]);
        assert_eq!(names(&pipeline.db, &source), vec!["e.onDisk"]);
    }

    #[test]
    fn test_edit_queued_before_scan_survives_scan() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("S.kt");
        std::fs::write(&source, "package s\nfun onDisk() {}\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        pipeline
            .edits
            .record(FileHandle::edited(&source, 1, "package s\nfun early() {}\n"));
        let progress = pipeline.run(
            kotlin(),
            vec![IndexCommand::ScanFile(source.clone()), IndexCommand::IndexFile(source.clone())],
        );
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.indexed, 1);
        assert_eq!(names(&pipeline.db, &source), vec!["s.early"]);

        let key = canonical_path(&source).to_string_lossy().into_owned();
        assert_eq!(pipeline.db.file_record(&key).unwrap().unwrap().modification_stamp, 1);
    }

    #[test]
    fn test_open_edits_keep_newest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("N.kt");
        std::fs::write(&source, "").unwrap();
        let edits = OpenEdits::new();

        edits.record(FileHandle::edited(&source, 5, "five"));
        let late = edits.record(FileHandle::edited(dir.path().join(".").join("N.kt"), 4, "four"));
        assert_eq!(late.path, canonical_path(&source));
        assert_eq!(late.modification_stamp, 4);

        let held = edits.get(&canonical_path(&source)).unwrap();
        assert_eq!(held.modification_stamp, 5);
        assert_eq!(edits.len(), 1);
        assert!(edits.discard(&source));
        assert!(!edits.discard(&source));
        assert!(edits.is_empty());
    }

    #[test]
    fn test_remove_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("R.kt");
        std::fs::write(&source, "package r\nclass Gone\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        pipeline.run(kotlin(), vec![IndexCommand::IndexFile(source.clone())]);
        assert_eq!(pipeline.db.files_in_package("r").unwrap().len(), 1);

        std::fs::remove_file(&source).unwrap();
        let progress = pipeline.run(kotlin(), vec![IndexCommand::RemoveFile(source.clone())]);
        assert_eq!(progress.removed, 1);
        assert!(pipeline.db.files_in_package("r").unwrap().is_empty());
        assert_eq!(pipeline.db.get_stats().unwrap().total_declarations, 0);
    }

    struct Failing;

    impl SemanticExtractor for Failing {
        fn can_extract(&self, _path: &Path) -> bool {
            true
        }

        fn read_package(&self, unit: &SourceUnit) -> Result<String, ExtractError> {
            Err(ExtractError::Syntax {
                path: unit.path.clone(),
                message: "broken".to_string(),
            })
        }

        fn extract(&self, unit: &SourceUnit) -> Result<Extraction, ExtractError> {
            Err(ExtractError::Syntax {
                path: unit.path.clone(),
                message: "broken".to_string(),
            })
        }
    }

    #[test]
    fn test_failures_do_not_stop_the_worker() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("F.kt");
        std::fs::write(&source, "package f\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        let progress = pipeline.run(
            Arc::new(Failing),
            vec![
                IndexCommand::IndexFile(source.clone()),
                IndexCommand::ScanFile(source),
                IndexCommand::IndexFile(dir.path().join("missing.kt")),
                IndexCommand::IndexingFinished,
            ],
        );
        assert_eq!(progress.failed, 3);
        assert_eq!(progress.batches_finished, 1);
        assert_eq!(pipeline.db.get_stats().unwrap().total_files, 0);
    }

    struct Panicking;

    impl SemanticExtractor for Panicking {
        fn can_extract(&self, _path: &Path) -> bool {
            true
        }

        fn read_package(&self, _unit: &SourceUnit) -> Result<String, ExtractError> {
            panic!("package reader blew up")
        }

        fn extract(&self, _unit: &SourceUnit) -> Result<Extraction, ExtractError> {
            panic!("extractor blew up")
        }
    }

    #[test]
    fn test_extractor_panic_fails_the_file_only() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("P.kt");
        std::fs::write(&source, "package p\n").unwrap();

        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        let handle = IndexWorker::new(
            pipeline.db.clone(),
            Arc::new(Panicking),
            pipeline.queue.clone(),
            pipeline.progress.clone(),
        )
        .spawn(tracing::info_span!("test"))
        .unwrap();

        pipeline.queue.submit_index(IndexCommand::IndexFile(source.clone()));
        pipeline.queue.submit_index(IndexCommand::ScanFile(source));
        pipeline.queue.submit_index(IndexCommand::IndexingFinished);
        let progress = pipeline.progress.wait_for_batches(1);
        assert_eq!(progress.failed, 2);
        assert_eq!(progress.batches_finished, 1);

        pipeline.queue.submit_index(IndexCommand::Stop);
        assert!(handle.join().is_ok());
        assert_eq!(pipeline.db.get_stats().unwrap().total_files, 0);
    }

    #[test]
    fn test_spawned_worker_reports_batches() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(&dir.path().join("index.db"));
        let handle = IndexWorker::new(pipeline.db.clone(), kotlin(), pipeline.queue.clone(), pipeline.progress.clone())
            .spawn(tracing::info_span!("test"))
            .unwrap();

        pipeline.queue.submit_index(IndexCommand::IndexingFinished);
        pipeline.queue.submit_index(IndexCommand::IndexingFinished);
        assert_eq!(pipeline.progress.wait_for_batches(2).batches_finished, 2);

        pipeline.queue.submit_index(IndexCommand::Stop);
        handle.join().unwrap();
    }

    #[test]
    fn test_canonical_path_of_removed_file() {
        let dir = tempdir().unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();
        assert_eq!(canonical_path(&dir.path().join("gone.kt")), canonical_dir.join("gone.kt"));
    }
}
