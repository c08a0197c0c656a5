//! The partitioned-dataset handle and its verbs.
//!
//! A [`ChunkFrame`] is a cheap immutable value: a dataset directory, an
//! optional column projection, the shard-key set the dataset is currently
//! certified hard-sharded by, and the deferred operation log. Every verb
//! consumes the handle and returns a new one; cloning a handle first keeps
//! the original usable with its log untouched.
//!
//! Verbs are lazy — they only append to the log — except the ones that must
//! see global dataset state: hard [`group_by`](ChunkFrame::group_by),
//! frame-to-frame [`join`](ChunkFrame::join)s, [`write`](ChunkFrame::write),
//! and [`map_to_disk`](ChunkFrame::map_to_disk) perform I/O immediately.
//! Because most errors surface only when the log is replayed, a bad column
//! reference is reported at `collect`/`write` time, not at the verb that
//! introduced it.
//!
//! The on-disk chunks are shared, never owned: several handles may reference
//! the same directory, and chunks outlive every handle. The engine assumes a
//! single writer per dataset directory at a time; concurrent repartitions of
//! one directory, or a repartition racing a collect, are the orchestration
//! layer's problem, not detected here.
//!
//! ```no_run
//! use chunkframe::{Engine, ExecConfig, col, lit, open};
//! # use chunkframe::Result;
//!
//! # fn main() -> Result<()> {
//! let engine = Engine::new(ExecConfig::default())?;
//! let sales = open(&engine, "data/sales")?;
//!
//! let summary = sales
//!     .filter(col("amount").gt(lit(0)))
//!     .group_by(&["region"], true)?
//!     .summarize(vec![("total", chunkframe::Agg::sum("amount"))]);
//!
//! let table = summary.collect()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::executor::{ChunkExecutor, ExecConfig, RayonPool, WorkerPool};
use crate::expr::{Agg, Expr, SortKey};
use crate::join::{self, JoinKind, JoinOperand};
use crate::ops::{Operation, replay};
use crate::shard;
use crate::store::{BlockStore, ChunkStore, chunk_file_name, ensure_destination};
#[cfg(feature = "ingest-csv")]
use crate::table::Value;
use crate::table::Table;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Shared execution context: the chunk store, the worker pool, and the
/// configuration, threaded explicitly instead of living in a global.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn ChunkStore>,
    pub(crate) pool: Arc<dyn WorkerPool>,
    pub(crate) config: ExecConfig,
}

impl Engine {
    /// Engine with the default adapters: [`BlockStore`] chunks and a
    /// dedicated rayon pool sized by the config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if the worker pool cannot be built.
    pub fn new(config: ExecConfig) -> Result<Self> {
        let pool = RayonPool::from_config(&config)?;
        Ok(Self::with_adapters(
            Arc::new(BlockStore),
            Arc::new(pool),
            config,
        ))
    }

    /// Engine over caller-supplied adapters.
    pub fn with_adapters(
        store: Arc<dyn ChunkStore>,
        pool: Arc<dyn WorkerPool>,
        config: ExecConfig,
    ) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    fn executor(&self) -> ChunkExecutor {
        ChunkExecutor::new(Arc::clone(&self.store), Arc::clone(&self.pool))
    }
}

/// A lazy handle onto a partitioned dataset.
#[derive(Clone)]
pub struct ChunkFrame {
    pub(crate) engine: Engine,
    pub(crate) location: PathBuf,
    pub(crate) projection: Option<Vec<String>>,
    pub(crate) shard_keys: Vec<String>,
    pub(crate) log: Vec<Operation>,
    /// Keeps planner-owned scratch datasets alive for as long as any handle
    /// references them.
    pub(crate) guard: Option<Arc<TempDir>>,
}

impl std::fmt::Debug for ChunkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFrame")
            .field("location", &self.location)
            .field("projection", &self.projection)
            .field("shard_keys", &self.shard_keys)
            .field("ops", &self.log.len())
            .finish_non_exhaustive()
    }
}

/// Attach a handle to an existing chunk directory.
///
/// The dataset carries no shard-key certification until a hard group-by
/// establishes one.
///
/// # Errors
///
/// Returns [`Error::ChunkNotFound`] if the directory does not exist.
pub fn open(engine: &Engine, dir: impl AsRef<Path>) -> Result<ChunkFrame> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::ChunkNotFound {
            path: dir.to_path_buf(),
        });
    }
    Ok(ChunkFrame::bare(engine.clone(), dir.to_path_buf()))
}

/// Split an in-memory table into `chunks` row-contiguous chunks under `dir`.
///
/// An empty table still writes one (empty) chunk so the schema is recorded.
///
/// # Errors
///
/// Returns [`Error::DestinationExists`] if `dir` is non-empty and
/// `overwrite` is false.
pub fn from_table(
    engine: &Engine,
    table: &Table,
    dir: impl AsRef<Path>,
    chunks: usize,
    overwrite: bool,
) -> Result<ChunkFrame> {
    let dir = dir.as_ref();
    ensure_destination(dir, overwrite)?;
    let rows = table.n_rows();
    let per_chunk = rows.div_ceil(chunks.max(1)).max(1);
    let extension = engine.store.extension();
    let mut index = 0;
    let mut start = 0;
    while start < rows {
        let end = (start + per_chunk).min(rows);
        let part = table.take(&(start..end).collect::<Vec<_>>());
        engine
            .store
            .write(&dir.join(chunk_file_name(index, extension)), &part)?;
        index += 1;
        start = end;
    }
    if index == 0 {
        engine
            .store
            .write(&dir.join(chunk_file_name(0, extension)), &table.empty_like())?;
    }
    Ok(ChunkFrame::bare(engine.clone(), dir.to_path_buf()))
}

/// Write the given tables as the chunks of a new dataset, one chunk per
/// table, in order. All parts must share a schema.
///
/// # Errors
///
/// Returns [`Error::MalformedTable`] on a schema mismatch between parts and
/// [`Error::DestinationExists`] if the guard trips.
pub fn from_chunks(
    engine: &Engine,
    parts: Vec<Table>,
    dir: impl AsRef<Path>,
    overwrite: bool,
) -> Result<ChunkFrame> {
    let dir = dir.as_ref();
    if let Some(first) = parts.first() {
        for part in &parts[1..] {
            if part.names() != first.names() {
                return Err(Error::MalformedTable(format!(
                    "chunk schema {:?} disagrees with {:?}",
                    part.names(),
                    first.names()
                )));
            }
        }
    }
    ensure_destination(dir, overwrite)?;
    let extension = engine.store.extension();
    for (i, part) in parts.iter().enumerate() {
        engine
            .store
            .write(&dir.join(chunk_file_name(i, extension)), part)?;
    }
    Ok(ChunkFrame::bare(engine.clone(), dir.to_path_buf()))
}

/// Stream a CSV file into chunks of `rows_per_chunk` rows.
///
/// A header row is required and becomes the column names. Cell types are
/// inferred per value: integer, then float, then boolean; an empty field is
/// null; anything else is a string.
///
/// # Errors
///
/// Returns [`Error::Csv`] on malformed input and
/// [`Error::DestinationExists`] if the guard trips.
#[cfg(feature = "ingest-csv")]
pub fn from_csv(
    engine: &Engine,
    path: impl AsRef<Path>,
    dir: impl AsRef<Path>,
    rows_per_chunk: usize,
    overwrite: bool,
) -> Result<ChunkFrame> {
    use crate::table::Column;

    let dir = dir.as_ref();
    ensure_destination(dir, overwrite)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path.as_ref())?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let per_chunk = rows_per_chunk.max(1);
    let extension = engine.store.extension();

    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); headers.len()];
    let mut buffered = 0usize;
    let mut index = 0usize;
    let flush = |columns: &mut Vec<Vec<Value>>, index: &mut usize| -> Result<()> {
        let part = Table::new(
            headers
                .iter()
                .zip(columns.iter_mut())
                .map(|(name, values)| Column::new(name.clone(), std::mem::take(values)))
                .collect(),
        )?;
        engine
            .store
            .write(&dir.join(chunk_file_name(*index, extension)), &part)?;
        *index += 1;
        Ok(())
    };

    for record in reader.records() {
        let record = record?;
        for (field, column) in record.iter().zip(columns.iter_mut()) {
            column.push(infer_value(field));
        }
        buffered += 1;
        if buffered == per_chunk {
            flush(&mut columns, &mut index)?;
            buffered = 0;
        }
    }
    if buffered > 0 || index == 0 {
        flush(&mut columns, &mut index)?;
    }
    Ok(ChunkFrame::bare(engine.clone(), dir.to_path_buf()))
}

#[cfg(feature = "ingest-csv")]
fn infer_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = field.parse::<f64>() {
        return Value::Float(f);
    }
    if field.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if field.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::Str(field.to_string())
}

impl ChunkFrame {
    fn bare(engine: Engine, location: PathBuf) -> Self {
        Self {
            engine,
            location,
            projection: None,
            shard_keys: Vec::new(),
            log: Vec::new(),
            guard: None,
        }
    }

    /// Handle over a planner-owned scratch dataset; the scratch directory
    /// lives as long as any clone of the handle.
    pub(crate) fn attached(engine: Engine, scratch: TempDir, shard_keys: Vec<String>) -> Self {
        Self {
            engine,
            location: scratch.path().to_path_buf(),
            projection: None,
            shard_keys,
            log: Vec::new(),
            guard: Some(Arc::new(scratch)),
        }
    }

    fn append(mut self, op: Operation) -> Self {
        if !op.preserves_shard_keys(&self.shard_keys) {
            self.shard_keys.clear();
        }
        self.log.push(op);
        self
    }

    /// The dataset directory this handle reads.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Columns this dataset is currently certified hard-sharded by; empty
    /// means no guarantee.
    #[must_use]
    pub fn shard_keys(&self) -> &[String] {
        &self.shard_keys
    }

    /// The deferred operations accumulated on this handle, in order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.log
    }

    /// Number of chunk files currently in the dataset directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn n_chunks(&self) -> Result<usize> {
        Ok(self.engine.store.list_chunks(&self.location)?.len())
    }

    // ---- lazy verbs ----

    /// Keep the named columns, in the given order.
    #[must_use]
    pub fn select(self, columns: &[&str]) -> Self {
        self.append(Operation::Select(to_names(columns)))
    }

    /// Rename columns via `(old, new)` pairs.
    #[must_use]
    pub fn rename(self, renames: &[(&str, &str)]) -> Self {
        self.append(Operation::Rename(
            renames
                .iter()
                .map(|(old, new)| ((*old).to_string(), (*new).to_string()))
                .collect(),
        ))
    }

    /// Keep rows whose predicate evaluates to true.
    #[must_use]
    pub fn filter(self, predicate: Expr) -> Self {
        self.append(Operation::Filter(predicate))
    }

    /// Assign columns; existing columns are replaced, new ones appended.
    /// Assignments apply in sequence and see earlier ones.
    #[must_use]
    pub fn mutate(self, assignments: Vec<(&str, Expr)>) -> Self {
        self.append(Operation::Mutate(to_assignments(assignments)))
    }

    /// Like [`mutate`](Self::mutate), but keep only the assigned columns.
    #[must_use]
    pub fn transmute(self, assignments: Vec<(&str, Expr)>) -> Self {
        self.append(Operation::Transmute(to_assignments(assignments)))
    }

    /// Sort the rows within each chunk. Chunk-local: this does not order the
    /// dataset globally.
    #[must_use]
    pub fn arrange(self, keys: Vec<SortKey>) -> Self {
        self.append(Operation::Arrange(keys))
    }

    /// Narrow the columns read from disk. This is an I/O projection applied
    /// before the log replays, so it must include every column the logged
    /// operations reference — apply it before other verbs.
    #[must_use]
    pub fn keep(mut self, columns: &[&str]) -> Self {
        if !self
            .shard_keys
            .iter()
            .all(|k| columns.contains(&k.as_str()))
        {
            self.shard_keys.clear();
        }
        self.projection = Some(to_names(columns));
        self
    }

    /// Defer an arbitrary per-chunk transform.
    #[must_use]
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Table) -> anyhow::Result<Table> + Send + Sync + 'static,
    {
        self.append(Operation::MapChunk(Arc::new(f)))
    }

    // ---- grouping ----

    /// Group by key columns, yielding a [`Grouped`] to summarize.
    ///
    /// With `hard = false` the grouping is chunk-local: each chunk
    /// aggregates whatever rows it happens to hold, so a key split across
    /// chunks yields one row per chunk. With `hard = true` the dataset is
    /// first repartitioned so every distinct key combination is co-located
    /// in exactly one chunk — a full read-and-rewrite of the dataset, and
    /// the only way to certify shard keys.
    ///
    /// # Errors
    ///
    /// With `hard = true`, returns [`Error::Repartition`] on any failure of
    /// the read/hash/write/swap sequence; the original chunk set is left
    /// intact.
    pub fn group_by(self, keys: &[&str], hard: bool) -> Result<Grouped> {
        let keys = to_names(keys);
        if !hard {
            return Ok(Grouped { frame: self, keys });
        }
        let buckets = self
            .engine
            .config
            .target_chunks
            .unwrap_or(self.n_chunks()?)
            .max(1);
        shard::repartition(&self, &keys, buckets)?;
        let frame = Self {
            engine: self.engine,
            location: self.location,
            projection: None,
            shard_keys: keys.clone(),
            log: Vec::new(),
            guard: self.guard,
        };
        Ok(Grouped { frame, keys })
    }

    // ---- joins ----

    /// Join against another frame or an in-memory table.
    ///
    /// The planner repartitions only when chunk-local correctness requires
    /// it (see the [`join`](crate::join) module); broadcast joins stay lazy,
    /// repartitioning joins execute eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedJoin`] for right joins, and any
    /// repartition or execution failure for eager paths.
    pub fn join(
        self,
        rhs: impl Into<JoinOperand>,
        kind: JoinKind,
        by: &[&str],
    ) -> Result<ChunkFrame> {
        join::plan(self, rhs.into(), kind, to_names(by))
    }

    // ---- terminals ----

    /// Replay the log on every chunk and row-bind the results in chunk-index
    /// order (intra-chunk row order preserved, regardless of worker
    /// completion order).
    ///
    /// The combined table must fit in memory; the engine does not enforce a
    /// ceiling, so sizing the result is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns the first failing chunk's error, tagged with its identifier.
    pub fn collect(self) -> Result<Table> {
        let chunks = self.engine.store.list_chunks(&self.location)?;
        self.engine
            .executor()
            .collect(&chunks, self.projection.as_deref(), &self.log)
    }

    /// Like [`collect`](Self::collect), but return the per-chunk tables
    /// without combining them.
    ///
    /// # Errors
    ///
    /// Returns the first failing chunk's error, tagged with its identifier.
    pub fn collect_list(self) -> Result<Vec<Table>> {
        let chunks = self.engine.store.list_chunks(&self.location)?;
        self.engine
            .executor()
            .run(&chunks, self.projection.as_deref(), &self.log)
    }

    /// Replay the log and write the results as a new dataset at `target`.
    ///
    /// The destination is checked before any write. A failure mid-write may
    /// leave a partially written target for the caller to clean up; only
    /// repartition's chunk-set swap is atomic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DestinationExists`] if `target` is non-empty and
    /// `overwrite` is false, else the first failing chunk's error.
    pub fn write(self, target: impl AsRef<Path>, overwrite: bool) -> Result<ChunkFrame> {
        let target = target.as_ref();
        let chunks = self.engine.store.list_chunks(&self.location)?;
        self.engine.executor().write_dataset(
            &chunks,
            self.projection.as_deref(),
            &self.log,
            target,
            overwrite,
        )?;
        // The written dataset is fully materialized; a still-valid shard-key
        // certification carries over to it.
        Ok(Self {
            shard_keys: self.shard_keys,
            ..Self::bare(self.engine, target.to_path_buf())
        })
    }

    /// Eagerly apply a per-chunk transform and persist the result as a new
    /// dataset. The lazy counterpart is [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// As for [`write`](Self::write); map-function failures surface as task
    /// errors carrying the chunk identifier.
    pub fn map_to_disk<F>(
        self,
        f: F,
        target: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<ChunkFrame>
    where
        F: Fn(Table) -> anyhow::Result<Table> + Send + Sync + 'static,
    {
        self.map(f).write(target, overwrite)
    }

    /// Read a single chunk by index, with the projection and log applied.
    ///
    /// Returns `Ok(None)` when the chunk file is absent — the one
    /// recoverable missing-chunk path; executor-wide operations treat a
    /// missing chunk as fatal.
    ///
    /// # Errors
    ///
    /// Propagates read and replay failures of a present chunk.
    pub fn chunk(&self, index: usize) -> Result<Option<Table>> {
        let path = self
            .location
            .join(chunk_file_name(index, self.engine.store.extension()));
        if !self.engine.store.exists(&path) {
            return Ok(None);
        }
        let table = self.engine.store.read(&path, self.projection.as_deref())?;
        replay(table, &self.log).map(Some)
    }
}

/// A grouped frame awaiting aggregation.
pub struct Grouped {
    frame: ChunkFrame,
    keys: Vec<String>,
}

impl Grouped {
    /// Aggregate each group, producing `(output name, aggregation)` columns
    /// after the key columns. Appends to the log; the grouping semantics
    /// (chunk-local vs global) were fixed by
    /// [`group_by`](ChunkFrame::group_by).
    #[must_use]
    pub fn summarize(self, aggs: Vec<(&str, Agg)>) -> ChunkFrame {
        self.frame.append(Operation::Summarize {
            keys: self.keys,
            aggs: aggs
                .into_iter()
                .map(|(name, agg)| (name.to_string(), agg))
                .collect(),
        })
    }

    /// Drop the grouping without aggregating. After a hard group-by this is
    /// how to get the repartitioned, shard-key-certified frame back.
    #[must_use]
    pub fn ungroup(self) -> ChunkFrame {
        self.frame
    }

    /// The grouping key columns.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl std::fmt::Debug for Grouped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grouped")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

fn to_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

fn to_assignments(assignments: Vec<(&str, Expr)>) -> Vec<(String, Expr)> {
    assignments
        .into_iter()
        .map(|(name, expr)| (name.to_string(), expr))
        .collect()
}
