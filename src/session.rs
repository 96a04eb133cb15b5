// Index session: owns the store, the work queue and the pipeline threads

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{error, info, info_span, warn};

use crate::config::Config;
use crate::index::db::IndexDatabase;
use crate::indexer::extractor::{FileHandle, SemanticExtractor};
use crate::indexer::kotlin::KotlinExtractor;
use crate::indexer::queue::WorkQueue;
use crate::indexer::scanner::{ScanSummary, Scanner, SourceFilter};
use crate::indexer::watcher::FileWatcher;
use crate::indexer::{canonical_path, IndexCommand, IndexProgress, IndexWorker, OpenEdits, ProgressTracker};
use crate::project::cache::CacheDir;
use crate::project::resolver::BuildSystemResolver;
use crate::project::ModuleGraph;
use crate::query::QueryEngine;

struct ScanRun {
    handle: JoinHandle<ScanSummary>,
    stop: Arc<AtomicBool>,
}

/// A running index over one project.
///
/// Opening resolves the module graph, starts the index worker and launches a
/// full scan. Every scan and every `flush` ends in one indexing batch that
/// `wait_for_indexing` can block on.
pub struct IndexSession {
    project_root: PathBuf,
    config: Arc<Config>,
    cache: CacheDir,
    resolver: BuildSystemResolver,
    db: IndexDatabase,
    extractor: Arc<dyn SemanticExtractor>,
    graph: Arc<ModuleGraph>,
    queue: Arc<WorkQueue<IndexCommand>>,
    progress: Arc<ProgressTracker>,
    edits: Arc<OpenEdits>,
    span: tracing::Span,
    worker: Option<JoinHandle<()>>,
    scanner: Option<ScanRun>,
    batches_submitted: usize,
}

impl IndexSession {
    /// Open a session with the bundled build system adapters.
    /// `rebuild` drops the cached module graph and every stored entry first.
    pub fn open(project_root: &Path, config: Config, rebuild: bool) -> Result<Self> {
        Self::open_with(project_root, config, BuildSystemResolver::default(), rebuild)
    }

    pub fn open_with(project_root: &Path, config: Config, resolver: BuildSystemResolver, rebuild: bool) -> Result<Self> {
        let project_root = project_root
            .canonicalize()
            .with_context(|| format!("Project directory {} not found", project_root.display()))?;
        let span = info_span!("session", root = %project_root.display());
        let _entered = span.enter();

        let cache = CacheDir::for_project(&project_root, config.cache.dir.as_deref())
            .context("Failed to create cache directory")?;
        let graph = resolver
            .resolve(&project_root, &cache, rebuild)
            .context("Failed to resolve module graph")?;
        info!("Module graph has {} modules", graph.len());

        let db = IndexDatabase::open(cache.index_db_path()).context("Failed to open index store")?;
        if rebuild {
            info!("Rebuilding index from scratch");
            db.clear().context("Failed to clear index store")?;
        }

        let extractor: Arc<dyn SemanticExtractor> = Arc::new(KotlinExtractor::new(config.indexing.extensions.clone()));
        let queue = Arc::new(WorkQueue::new(config.lane_capacities()));
        let progress = Arc::new(ProgressTracker::new());
        let edits = Arc::new(OpenEdits::new());

        let worker = IndexWorker::new(db.clone(), extractor.clone(), queue.clone(), progress.clone())
            .with_open_edits(edits.clone())
            .spawn(span.clone())
            .context("Failed to start index worker")?;
        drop(_entered);

        let mut session = Self {
            project_root,
            config: Arc::new(config),
            cache,
            resolver,
            db,
            extractor,
            graph: Arc::new(graph),
            queue,
            progress,
            edits,
            span,
            worker: Some(worker),
            scanner: None,
            batches_submitted: 0,
        };
        session.start_scan()?;
        Ok(session)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.cache
    }

    pub fn module_graph(&self) -> Arc<ModuleGraph> {
        self.graph.clone()
    }

    pub fn query(&self) -> QueryEngine {
        QueryEngine::new(self.db.clone())
    }

    pub fn progress(&self) -> IndexProgress {
        self.progress.snapshot()
    }

    /// Queue an in-memory edit ahead of all background work.
    ///
    /// The file stays open until `close_edit`: scans, reloads and watcher
    /// events index its latest edit instead of the text on disk.
    pub fn edit(&self, handle: FileHandle) {
        let handle = self.edits.record(handle);
        self.queue.submit_edit(IndexCommand::IndexModifiedFile(handle));
    }

    /// Drop the unsaved text of `path` and index the file from disk again
    pub fn close_edit(&self, path: &Path) {
        if self.edits.discard(path) {
            self.queue.submit_index(IndexCommand::IndexFile(canonical_path(path)));
        }
    }

    /// Close the current batch so `wait_for_indexing` also covers work queued so far
    pub fn flush(&mut self) {
        self.queue.submit_index(IndexCommand::IndexingFinished);
        self.batches_submitted += 1;
    }

    /// Block until every batch submitted so far has been processed
    pub fn wait_for_indexing(&self) -> IndexProgress {
        self.progress.wait_for_batches(self.batches_submitted)
    }

    /// Re-resolve the module graph, bypassing the cache, and rescan the project
    pub fn reload(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _entered = span.enter();
        info!("Reloading project");
        self.stop_scanner();

        let graph = self
            .resolver
            .resolve(&self.project_root, &self.cache, true)
            .context("Failed to resolve module graph")?;
        self.graph = Arc::new(graph);
        self.start_scan()
    }

    /// Watcher feeding disk changes under the current content roots into the index lane
    pub fn file_watcher(&self) -> FileWatcher {
        FileWatcher::new(self.queue.clone(), self.graph.clone(), self.source_filter())
    }

    /// Stop scanning, drain the queue and close the store. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop_scanner();
        if let Some(worker) = self.worker.take() {
            self.queue.submit_index(IndexCommand::Stop);
            if worker.join().is_err() {
                error!("Index worker panicked");
            }
            info!("Index session for {} closed", self.project_root.display());
        }
    }

    fn source_filter(&self) -> SourceFilter {
        SourceFilter::new(&self.project_root, self.config.clone(), self.extractor.clone())
            .with_content_roots(self.graph.content_roots().into_iter().map(Path::to_path_buf))
    }

    fn start_scan(&mut self) -> Result<()> {
        let scanner = Scanner::new(self.graph.clone(), self.source_filter(), self.queue.clone());
        let stop = scanner.stop_handle();
        let handle = scanner.spawn(self.span.clone()).context("Failed to start scanner")?;
        self.scanner = Some(ScanRun { handle, stop });
        self.batches_submitted += 1;
        Ok(())
    }

    fn stop_scanner(&mut self) {
        if let Some(run) = self.scanner.take() {
            run.stop.store(true, Ordering::Release);
            match run.handle.join() {
                Ok(summary) if summary.stopped => info!("Scanner stopped"),
                Ok(_) => {}
                Err(_) => warn!("Scanner panicked"),
            }
        }
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
