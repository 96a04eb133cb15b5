use std::collections::{BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::schema::{init_schema, read_schema_version, SCHEMA_VERSION};
use super::{Declaration, FileRecord};

/// Type alias for connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Rows fetched per round trip by a prefix scan
const PREFIX_PAGE_SIZE: usize = 256;

/// Errors raised by the persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("value codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Logical partitions of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Meta,
    /// path -> FileRecord
    Files,
    /// package fq-name -> sorted set of paths
    Packages,
    /// declaration key -> Declaration
    Declarations,
    /// path -> declaration keys of that file
    FileDeclarations,
}

impl Partition {
    pub fn table(&self) -> &'static str {
        match self {
            Partition::Meta => "meta",
            Partition::Files => "files",
            Partition::Packages => "packages",
            Partition::Declarations => "declarations",
            Partition::FileDeclarations => "file_declarations",
        }
    }
}

/// Key of a declaration in the declarations partition.
///
/// The name leads so a prefix scan over names walks matches in name order;
/// file and start offset make the key unique.
pub fn declaration_key(declaration: &Declaration) -> String {
    format!("{}\0{}\0{:012}", declaration.name, declaration.file, declaration.span.start)
}

/// Smallest byte string greater than every string starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Embedded ordered key-value store backed by SQLite.
///
/// Clones share one connection pool. WAL journaling lets the single index
/// writer proceed while readers query concurrently.
#[derive(Clone)]
pub struct IndexDatabase {
    pool: ConnectionPool,
    db_path: PathBuf,
    writes: Arc<AtomicU64>,
}

impl IndexDatabase {
    /// Create or open a store, recreating it when the schema version differs
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        info!("Opening index store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if discard_incompatible_store(&db_path)? {
            info!("Recreated index store at {}", db_path.display());
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(10))?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }

        Ok(Self {
            pool,
            db_path,
            writes: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Number of key mutations applied through this store since it was opened
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn put<V: Serialize>(&self, partition: Partition, key: impl AsRef<[u8]>, value: &V) -> StoreResult<()> {
        self.write_batch(|batch| batch.put(partition, key, value))
    }

    pub fn get<V: DeserializeOwned>(&self, partition: Partition, key: impl AsRef<[u8]>) -> StoreResult<Option<V>> {
        let conn = self.get_conn()?;
        read_value(&conn, partition, key.as_ref())
    }

    pub fn remove(&self, partition: Partition, key: impl AsRef<[u8]>) -> StoreResult<bool> {
        self.write_batch(|batch| batch.remove(partition, key))
    }

    /// Lazily iterate `(key, value)` pairs whose key starts with `prefix`, in key order
    pub fn prefix_search<V: DeserializeOwned>(&self, partition: Partition, prefix: impl AsRef<[u8]>) -> PrefixIter<V> {
        PrefixIter::new(self.pool.clone(), partition, prefix.as_ref(), PREFIX_PAGE_SIZE)
    }

    /// Number of entries in a partition
    pub fn count(&self, partition: Partition) -> StoreResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", partition.table()), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    /// Apply a group of mutations atomically
    pub fn write_batch<R>(&self, f: impl FnOnce(&mut WriteBatch<'_>) -> StoreResult<R>) -> StoreResult<R> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut batch = WriteBatch { tx, writes: 0 };
        let result = f(&mut batch)?;
        let writes = batch.writes;
        batch.tx.commit()?;
        self.writes.fetch_add(writes, Ordering::AcqRel);
        Ok(result)
    }

    /// Delete every entry except the schema marker
    pub fn clear(&self) -> StoreResult<()> {
        self.write_batch(|batch| {
            for partition in [
                Partition::Files,
                Partition::Packages,
                Partition::Declarations,
                Partition::FileDeclarations,
            ] {
                let removed = batch.tx.execute(&format!("DELETE FROM {}", partition.table()), [])?;
                batch.writes += removed as u64;
            }
            Ok(())
        })
    }

    /// Flush the write-ahead log and release this handle
    pub fn close(self) -> StoreResult<()> {
        let conn = self.get_conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        info!("Closed index store at {}", self.db_path.display());
        Ok(())
    }

    /// Release this handle and remove the store from disk
    pub fn destroy(self) -> StoreResult<()> {
        let Self { pool, db_path, .. } = self;
        drop(pool);
        delete_store_files(&db_path)
    }

    // Typed file and declaration operations

    pub fn file_record(&self, path: &str) -> StoreResult<Option<FileRecord>> {
        self.get(Partition::Files, path)
    }

    /// Upsert a file record, keeping package membership in step
    pub fn upsert_file(&self, record: &FileRecord) -> StoreResult<()> {
        self.write_batch(|batch| batch.upsert_file(record))
    }

    /// Store a freshly extracted file: declarations replaced wholesale, record upserted
    pub fn replace_file(&self, record: &FileRecord, declarations: &[Declaration]) -> StoreResult<()> {
        debug!("Replacing {} declarations for {}", declarations.len(), record.path);
        self.write_batch(|batch| {
            batch.replace_declarations(&record.path, declarations)?;
            batch.upsert_file(record)
        })
    }

    /// Forget a file entirely. Returns whether it was known.
    pub fn remove_file(&self, path: &str) -> StoreResult<bool> {
        self.write_batch(|batch| batch.remove_file(path))
    }

    pub fn files_in_package(&self, package_fq_name: &str) -> StoreResult<Vec<String>> {
        let files: Option<BTreeSet<String>> = self.get(Partition::Packages, package_fq_name)?;
        Ok(files.map(|set| set.into_iter().collect()).unwrap_or_default())
    }

    pub fn declarations_in_file(&self, path: &str) -> StoreResult<Vec<Declaration>> {
        let keys: Vec<String> = self.get(Partition::FileDeclarations, path)?.unwrap_or_default();
        let conn = self.get_conn()?;
        let mut declarations = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(declaration) = read_value(&conn, Partition::Declarations, key.as_bytes())? {
                declarations.push(declaration);
            }
        }
        declarations.sort_by_key(|d: &Declaration| d.span.start);
        Ok(declarations)
    }

    /// Get index statistics
    pub fn get_stats(&self) -> StoreResult<IndexStats> {
        let mut indexed_files = 0;
        for entry in self.prefix_search::<FileRecord>(Partition::Files, b"") {
            let (_, record) = entry?;
            if record.indexed {
                indexed_files += 1;
            }
        }

        Ok(IndexStats {
            total_files: self.count(Partition::Files)?,
            indexed_files,
            total_declarations: self.count(Partition::Declarations)?,
            total_packages: self.count(Partition::Packages)?,
            store_writes: self.write_count(),
        })
    }
}

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub indexed_files: usize,
    pub total_declarations: usize,
    pub total_packages: usize,
    pub store_writes: u64,
}

/// Mutations applied inside one SQLite transaction
pub struct WriteBatch<'conn> {
    tx: Transaction<'conn>,
    writes: u64,
}

impl WriteBatch<'_> {
    pub fn put<V: Serialize>(&mut self, partition: Partition, key: impl AsRef<[u8]>, value: &V) -> StoreResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.tx.execute(
            &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", partition.table()),
            params![key.as_ref(), encoded],
        )?;
        self.writes += 1;
        Ok(())
    }

    /// Read through the batch, observing its own uncommitted writes
    pub fn get<V: DeserializeOwned>(&self, partition: Partition, key: impl AsRef<[u8]>) -> StoreResult<Option<V>> {
        read_value(&self.tx, partition, key.as_ref())
    }

    pub fn remove(&mut self, partition: Partition, key: impl AsRef<[u8]>) -> StoreResult<bool> {
        let removed = self.tx.execute(
            &format!("DELETE FROM {} WHERE key = ?1", partition.table()),
            params![key.as_ref()],
        )?;
        self.writes += removed as u64;
        Ok(removed > 0)
    }

    pub fn upsert_file(&mut self, record: &FileRecord) -> StoreResult<()> {
        let previous: Option<FileRecord> = self.get(Partition::Files, &record.path)?;
        let package_changed = previous
            .as_ref()
            .map_or(true, |prev| prev.package_fq_name != record.package_fq_name);

        if package_changed {
            if let Some(prev) = &previous {
                self.remove_from_package(&prev.package_fq_name, &record.path)?;
            }
            self.add_to_package(&record.package_fq_name, &record.path)?;
        }

        self.put(Partition::Files, &record.path, record)
    }

    pub fn replace_declarations(&mut self, path: &str, declarations: &[Declaration]) -> StoreResult<()> {
        self.remove_declarations(path)?;

        let mut keys = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            let key = declaration_key(declaration);
            self.put(Partition::Declarations, &key, declaration)?;
            keys.push(key);
        }

        if !keys.is_empty() {
            self.put(Partition::FileDeclarations, path, &keys)?;
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> StoreResult<bool> {
        let previous: Option<FileRecord> = self.get(Partition::Files, path)?;
        self.remove_declarations(path)?;

        match previous {
            Some(prev) => {
                self.remove_from_package(&prev.package_fq_name, path)?;
                self.remove(Partition::Files, path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_declarations(&mut self, path: &str) -> StoreResult<()> {
        let stale: Option<Vec<String>> = self.get(Partition::FileDeclarations, path)?;
        if let Some(keys) = stale {
            for key in keys {
                self.remove(Partition::Declarations, key.as_bytes())?;
            }
            self.remove(Partition::FileDeclarations, path)?;
        }
        Ok(())
    }

    fn add_to_package(&mut self, package: &str, path: &str) -> StoreResult<()> {
        let mut files: BTreeSet<String> = self.get(Partition::Packages, package)?.unwrap_or_default();
        if files.insert(path.to_string()) {
            self.put(Partition::Packages, package, &files)?;
        }
        Ok(())
    }

    fn remove_from_package(&mut self, package: &str, path: &str) -> StoreResult<()> {
        let Some(mut files) = self.get::<BTreeSet<String>>(Partition::Packages, package)? else {
            return Ok(());
        };
        if !files.remove(path) {
            return Ok(());
        }
        if files.is_empty() {
            self.remove(Partition::Packages, package)?;
        } else {
            self.put(Partition::Packages, package, &files)?;
        }
        Ok(())
    }
}

/// Lazy, paged scan over one key prefix.
///
/// Each page is read on a short-lived pooled connection, so holding the
/// iterator never pins a connection or blocks the writer.
pub struct PrefixIter<V> {
    pool: ConnectionPool,
    partition: Partition,
    prefix: Vec<u8>,
    upper: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    page: VecDeque<(Vec<u8>, Vec<u8>)>,
    page_size: usize,
    exhausted: bool,
    _value: PhantomData<fn() -> V>,
}

impl<V: DeserializeOwned> PrefixIter<V> {
    fn new(pool: ConnectionPool, partition: Partition, prefix: &[u8], page_size: usize) -> Self {
        Self {
            pool,
            partition,
            prefix: prefix.to_vec(),
            upper: prefix_upper_bound(prefix),
            last_key: None,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
            _value: PhantomData,
        }
    }

    /// Iterate keys only, skipping value decoding
    pub fn keys(self) -> impl Iterator<Item = StoreResult<Vec<u8>>> {
        KeysOnly(self)
    }

    fn fetch_page(&mut self) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let lower = self.last_key.as_deref().unwrap_or(self.prefix.as_slice());
        let lower_op = if self.last_key.is_some() { ">" } else { ">=" };
        let limit = self.page_size as i64;

        let rows = match &self.upper {
            Some(upper) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key, value FROM {} WHERE key {} ?1 AND key < ?2 ORDER BY key LIMIT ?3",
                    self.partition.table(),
                    lower_op
                ))?;
                let rows = stmt
                    .query_map(params![lower, upper, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key, value FROM {} WHERE key {} ?1 ORDER BY key LIMIT ?2",
                    self.partition.table(),
                    lower_op
                ))?;
                let rows = stmt
                    .query_map(params![lower, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>, _>>()?;
                rows
            }
        };

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((key, _)) = rows.last() {
            self.last_key = Some(key.clone());
        }
        self.page.extend(rows);
        Ok(())
    }

    fn next_raw(&mut self) -> Option<StoreResult<(Vec<u8>, Vec<u8>)>> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

impl<V: DeserializeOwned> Iterator for PrefixIter<V> {
    type Item = StoreResult<(Vec<u8>, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.next_raw()?;
        Some(raw.and_then(|(key, value)| Ok((key, serde_json::from_slice(&value)?))))
    }
}

struct KeysOnly<V>(PrefixIter<V>);

impl<V: DeserializeOwned> Iterator for KeysOnly<V> {
    type Item = StoreResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.0.next_raw()?;
        Some(raw.map(|(key, _)| key))
    }
}

fn read_value<V: DeserializeOwned>(conn: &Connection, partition: Partition, key: &[u8]) -> StoreResult<Option<V>> {
    let raw: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", partition.table()),
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Delete an existing store whose schema marker is missing or stale.
/// Returns true when something was deleted.
fn discard_incompatible_store(db_path: &Path) -> StoreResult<bool> {
    if !db_path.exists() {
        return Ok(false);
    }

    // Unreadable files count as incompatible
    let version = Connection::open(db_path)
        .and_then(|conn| read_schema_version(&conn))
        .unwrap_or(None);

    if version == Some(SCHEMA_VERSION) {
        return Ok(false);
    }

    warn!(
        "Index store at {} has schema {:?}, expected {}; recreating",
        db_path.display(),
        version,
        SCHEMA_VERSION
    );
    delete_store_files(db_path)?;
    Ok(true)
}

fn delete_store_files(db_path: &Path) -> StoreResult<()> {
    let mut candidates = vec![db_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_os_string();
        sidecar.push(suffix);
        candidates.push(PathBuf::from(sidecar));
    }

    for path in candidates {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }
    }
    Ok(())
}
