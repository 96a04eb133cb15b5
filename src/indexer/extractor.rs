// Boundary between the indexer and the semantic analysis of source files

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::index::{last_modified_millis, Declaration, FileRecord};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {message}")]
    Syntax { path: PathBuf, message: String },

    #[error("no extractor for {0}")]
    Unsupported(PathBuf),
}

/// A file as seen by the editor: its disk path, edit stamp and, for unsaved
/// edits, the in-memory text.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub path: PathBuf,
    pub modification_stamp: u64,
    pub text: Option<Arc<str>>,
}

impl FileHandle {
    /// A file known only from disk
    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modification_stamp: 0,
            text: None,
        }
    }

    /// An in-memory edit of `path`
    pub fn edited(path: impl Into<PathBuf>, modification_stamp: u64, text: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            modification_stamp,
            text: Some(text.into()),
        }
    }

    /// Load the unit to hand to an extractor, reading from disk when no text is held
    pub fn load(&self) -> Result<SourceUnit, ExtractError> {
        let read_err = |source| ExtractError::Read {
            path: self.path.clone(),
            source,
        };
        let last_modified = match last_modified_millis(&self.path) {
            Ok(millis) => millis,
            // An unsaved buffer may not exist on disk yet
            Err(_) if self.text.is_some() => 0,
            Err(e) => return Err(read_err(e)),
        };
        let text = match &self.text {
            Some(text) => text.clone(),
            None => Arc::from(std::fs::read_to_string(&self.path).map_err(read_err)?),
        };
        Ok(SourceUnit {
            path: self.path.clone(),
            text,
            last_modified,
            modification_stamp: self.modification_stamp,
        })
    }
}

/// Loaded source text plus the metadata that ends up in its file record
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: PathBuf,
    pub text: Arc<str>,
    pub last_modified: i64,
    pub modification_stamp: u64,
}

impl SourceUnit {
    pub fn path_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Header-only record for this unit (`indexed == false`)
    pub fn record(&self, package_fq_name: impl Into<String>) -> FileRecord {
        FileRecord::new(self.path_key(), package_fq_name, self.last_modified, self.modification_stamp)
    }
}

/// Result of a full extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub record: FileRecord,
    pub declarations: Vec<Declaration>,
}

/// Produces declaration facts for one language
pub trait SemanticExtractor: Send + Sync {
    fn can_extract(&self, path: &Path) -> bool;

    /// Package of the unit, without extracting declarations
    fn read_package(&self, unit: &SourceUnit) -> Result<String, ExtractError>;

    /// Full extraction; the returned record has `indexed == true`
    fn extract(&self, unit: &SourceUnit) -> Result<Extraction, ExtractError>;
}
