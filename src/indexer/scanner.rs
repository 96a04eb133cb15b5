// Project scanner feeding the work queue from the module graph

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::extractor::SemanticExtractor;
use super::queue::{Lane, WorkQueue};
use super::IndexCommand;
use crate::config::Config;
use crate::project::{Module, ModuleGraph};

/// Decides which files under the content roots are indexable sources
#[derive(Clone)]
pub struct SourceFilter {
    project_root: PathBuf,
    content_roots: Vec<PathBuf>,
    config: Arc<Config>,
    extractor: Arc<dyn SemanticExtractor>,
}

impl SourceFilter {
    pub fn new(project_root: impl Into<PathBuf>, config: Arc<Config>, extractor: Arc<dyn SemanticExtractor>) -> Self {
        Self {
            project_root: project_root.into(),
            content_roots: Vec::new(),
            config,
            extractor,
        }
    }

    /// Content roots that directory patterns are anchored at, besides the project root
    pub fn with_content_roots(mut self, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        self.content_roots = roots.into_iter().collect();
        self
    }

    /// Include/exclude patterns are matched against the paths relative to the
    /// project root and to the innermost content root holding the file
    pub fn accepts(&self, path: &Path) -> bool {
        if !self.extractor.can_extract(path) {
            return false;
        }
        let in_project = path.strip_prefix(&self.project_root).unwrap_or(path).to_string_lossy();
        let in_root = self
            .content_roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|relative| relative.components().count())
            .map(|relative| relative.to_string_lossy());

        let mut candidates = vec![in_project.as_ref()];
        candidates.extend(in_root.as_deref());
        self.config.should_index_file(&candidates)
    }
}

/// What one scanner run submitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub source_files: usize,
    pub library_files: usize,
    pub stopped: bool,
}

/// Producer that walks every module and submits scan and index work.
///
/// The first pass records file headers on the scan lane, source modules in
/// dependency order before library modules. The second pass submits the same
/// files for extraction on the index lane. `IndexingFinished` always closes
/// the run, also when it was stopped early.
pub struct Scanner {
    graph: Arc<ModuleGraph>,
    filter: SourceFilter,
    queue: Arc<WorkQueue<IndexCommand>>,
    stop: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(graph: Arc<ModuleGraph>, filter: SourceFilter, queue: Arc<WorkQueue<IndexCommand>>) -> Self {
        Self {
            graph,
            filter,
            queue,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that asks a running scanner to stop between files
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn spawn(self, span: tracing::Span) -> std::io::Result<JoinHandle<ScanSummary>> {
        thread::Builder::new().name("kindex-scanner".to_string()).spawn(move || {
            let _entered = span.enter();
            self.run()
        })
    }

    pub fn run(&self) -> ScanSummary {
        let order = self.graph.scan_order();
        let (sources, libraries): (Vec<&Module>, Vec<&Module>) = order.into_iter().partition(|m| m.is_source());
        info!("Scanning {} source and {} library modules", sources.len(), libraries.len());

        let mut summary = ScanSummary::default();
        let mut stopped = false;

        // Header pass
        summary.source_files = self.submit_all(&sources, Lane::Scan, IndexCommand::ScanFile, &mut stopped);
        if !stopped {
            self.queue.submit_scan(IndexCommand::SourceScanFinished);
        }
        summary.library_files = self.submit_all(&libraries, Lane::Scan, IndexCommand::ScanFile, &mut stopped);

        // Extraction pass
        self.submit_all(&sources, Lane::Index, IndexCommand::IndexFile, &mut stopped);
        self.submit_all(&libraries, Lane::Index, IndexCommand::IndexFile, &mut stopped);

        self.queue.submit_index(IndexCommand::IndexingFinished);
        summary.stopped = stopped;
        if stopped {
            info!("Scan stopped early");
        } else {
            info!(
                "Scan submitted {} source and {} library files",
                summary.source_files, summary.library_files
            );
        }
        summary
    }

    fn submit_all(
        &self,
        modules: &[&Module],
        lane: Lane,
        command: fn(PathBuf) -> IndexCommand,
        stopped: &mut bool,
    ) -> usize {
        let mut seen = HashSet::new();
        let mut submitted = 0;
        for module in modules {
            for path in self.module_files(module) {
                if *stopped || self.stop.load(Ordering::Acquire) {
                    *stopped = true;
                    return submitted;
                }
                if seen.insert(path.clone()) {
                    self.queue.submit(lane, command(path));
                    submitted += 1;
                }
            }
        }
        submitted
    }

    /// Indexable files whose most specific content root belongs to `module`
    fn module_files<'a>(&'a self, module: &'a Module) -> impl Iterator<Item = PathBuf> + 'a {
        debug!("Walking module {}", module.id);
        module
            .content_roots
            .iter()
            .flat_map(|root| WalkDir::new(root).sort_by_file_name().into_iter().filter_map(|e| e.ok()))
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(move |path| self.filter.accepts(path))
            .filter(move |path| self.graph.module_for_path(path).map(|m| m.id == module.id).unwrap_or(false))
    }
}
