// Query execution engine

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::index::db::{IndexDatabase, IndexStats, Partition};
use crate::index::{Declaration, Span};

/// Completion candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionItem {
    pub name: String,
    pub fq_name: String,
    pub kind: String,
    pub detail: String,
    pub file: String,
    pub span: Span,
}

impl From<Declaration> for CompletionItem {
    fn from(declaration: Declaration) -> Self {
        Self {
            kind: declaration.kind_str().to_string(),
            detail: declaration.signature(),
            name: declaration.name,
            fq_name: declaration.fq_name,
            file: declaration.file,
            span: declaration.span,
        }
    }
}

/// Query engine.
///
/// Reads go through their own pooled connections and never wait on the
/// index worker.
#[derive(Clone)]
pub struct QueryEngine {
    db: IndexDatabase,
}

impl QueryEngine {
    pub fn new(db: IndexDatabase) -> Self {
        Self { db }
    }

    /// Declarations whose name starts with `prefix`, in name order.
    ///
    /// With an owner filter, members and extensions must belong to that type
    /// (fully qualified or by simple name); declarations without an owner
    /// always match.
    pub fn complete(&self, prefix: &str, owner: Option<&str>, limit: usize) -> Result<Vec<Declaration>> {
        let mut results = Vec::new();
        for entry in self.db.prefix_search::<Declaration>(Partition::Declarations, prefix) {
            if results.len() >= limit {
                break;
            }
            let (_, declaration) = entry?;
            if let Some(owner) = owner {
                if !owner_matches(declaration.owner_type(), owner) {
                    continue;
                }
            }
            results.push(declaration);
        }
        Ok(results)
    }

    /// Paths of the files declaring `package_fq_name`, sorted
    pub fn files_in_package(&self, package_fq_name: &str) -> Result<Vec<String>> {
        Ok(self.db.files_in_package(package_fq_name)?)
    }

    /// Immediate child segments of `package_prefix` among all known packages.
    ///
    /// The empty prefix lists top-level segments.
    pub fn subpackages(&self, package_prefix: &str) -> Result<Vec<String>> {
        let search = if package_prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", package_prefix)
        };

        let mut segments = BTreeSet::new();
        for key in self
            .db
            .prefix_search::<BTreeSet<String>>(Partition::Packages, search.as_bytes())
            .keys()
        {
            let key = String::from_utf8_lossy(&key?).into_owned();
            if let Some(segment) = key[search.len()..].split('.').next().filter(|s| !s.is_empty()) {
                segments.insert(segment.to_string());
            }
        }
        Ok(segments.into_iter().collect())
    }

    /// Declarations of one file in source order
    pub fn declarations_in_file(&self, path: &str) -> Result<Vec<Declaration>> {
        Ok(self.db.declarations_in_file(path)?)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        Ok(self.db.get_stats()?)
    }
}

fn owner_matches(declared: Option<&str>, wanted: &str) -> bool {
    match declared {
        None => true,
        Some(declared) => {
            declared == wanted
                || declared
                    .strip_suffix(wanted)
                    .map_or(false, |qualifier| qualifier.ends_with('.'))
                || wanted
                    .strip_suffix(declared)
                    .map_or(false, |qualifier| qualifier.ends_with('.'))
        }
    }
}
