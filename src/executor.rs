//! Fan-out/fan-in execution of the operation log across chunks.
//!
//! The executor turns a chunk list plus a log into independent worker tasks,
//! dispatches them through a [`WorkerPool`], and combines the results per
//! terminal action. Tasks share nothing mutable; the only coordination points
//! are submission and collection here. The calling thread suspends at fan-in
//! until every task completes or one fails.
//!
//! Failure semantics: the first failing chunk (in chunk-index order) aborts
//! the call, tagged with that chunk's identifier; results of sibling tasks
//! are discarded at fan-in. A failed write-to-dataset call may leave a
//! partially written target directory for the caller to clean up — atomicity
//! is guaranteed only for the repartition chunk-set swap, not here.

use crate::error::{Error, Result};
use crate::ops::{Operation, replay};
use crate::store::{ChunkStore, chunk_file_name, ensure_destination};
use crate::table::Table;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One per-chunk unit of work: a closure over the chunk path, the log, and
/// the store.
pub type Task = Box<dyn FnOnce() -> Result<Table> + Send>;

/// Executes a batch of independent per-chunk tasks, possibly in parallel.
///
/// The returned vector must be indexed correspondingly to the input order
/// regardless of completion order, and errors must be delivered per task,
/// distinguishable from successes.
pub trait WorkerPool: Send + Sync {
    fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<Table>>;
}

/// Execution configuration, threaded explicitly into the engine — there is
/// no ambient global to configure.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecConfig {
    /// Worker thread count for the default pool. `None` sizes to the
    /// available CPU cores.
    pub workers: Option<usize>,
    /// Target chunk count for repartitioning. `None` keeps the current
    /// chunk count of the dataset being repartitioned.
    pub target_chunks: Option<usize>,
}

/// The default pool: a dedicated rayon thread pool.
pub struct RayonPool {
    pool: rayon::ThreadPool,
}

impl RayonPool {
    /// Build a pool with the given number of worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if the thread pool cannot be built.
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Build a pool sized by [`ExecConfig::workers`], defaulting to the
    /// core count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if the thread pool cannot be built.
    pub fn from_config(config: &ExecConfig) -> Result<Self> {
        Self::new(config.workers.unwrap_or_else(num_cpus::get))
    }
}

impl WorkerPool for RayonPool {
    fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<Table>> {
        // Indexed parallel iteration keeps results in input order even when
        // tasks complete out of order.
        self.pool
            .install(|| tasks.into_par_iter().map(|task| task()).collect())
    }
}

/// In-order single-threaded pool, useful for debugging and deterministic
/// tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialPool;

impl WorkerPool for SerialPool {
    fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<Table>> {
        tasks.into_iter().map(|task| task()).collect()
    }
}

/// Replays a log over a chunk list and combines the results.
pub(crate) struct ChunkExecutor {
    store: Arc<dyn ChunkStore>,
    pool: Arc<dyn WorkerPool>,
}

impl ChunkExecutor {
    pub(crate) fn new(store: Arc<dyn ChunkStore>, pool: Arc<dyn WorkerPool>) -> Self {
        Self { store, pool }
    }

    /// Replay `log` on every chunk and return the per-chunk results in
    /// chunk-index order (the collect-list terminal).
    pub(crate) fn run(
        &self,
        chunks: &[PathBuf],
        projection: Option<&[String]>,
        log: &[Operation],
    ) -> Result<Vec<Table>> {
        tracing::debug!(chunks = chunks.len(), ops = log.len(), "fan-out: replay");
        let tasks: Vec<Task> = chunks
            .iter()
            .map(|path| {
                let store = Arc::clone(&self.store);
                let path = path.clone();
                let projection: Option<Vec<String>> = projection.map(<[String]>::to_vec);
                let log = log.to_vec();
                Box::new(move || {
                    let table = store.read(&path, projection.as_deref())?;
                    replay(table, &log)
                }) as Task
            })
            .collect();
        let results = self.pool.submit_batch(tasks);
        tracing::debug!(chunks = chunks.len(), "fan-in: replay");
        first_error(chunks, results)
    }

    /// Row-bind every chunk's result in chunk-index order (the collect
    /// terminal). Intra-chunk row order is preserved.
    ///
    /// The combined table must fit in memory; the engine cannot know the
    /// caller's memory budget, so bounding the result size is the caller's
    /// responsibility.
    pub(crate) fn collect(
        &self,
        chunks: &[PathBuf],
        projection: Option<&[String]>,
        log: &[Operation],
    ) -> Result<Table> {
        Table::rbind(self.run(chunks, projection, log)?)
    }

    /// Replay and write each chunk's result as a chunk of a new dataset in
    /// `target`. Output files are written from the workers.
    pub(crate) fn write_dataset(
        &self,
        chunks: &[PathBuf],
        projection: Option<&[String]>,
        log: &[Operation],
        target: &Path,
        overwrite: bool,
    ) -> Result<()> {
        ensure_destination(target, overwrite)?;
        tracing::debug!(chunks = chunks.len(), dest = %target.display(), "fan-out: write");
        let extension = self.store.extension().to_string();
        let tasks: Vec<Task> = chunks
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let store = Arc::clone(&self.store);
                let path = path.clone();
                let projection: Option<Vec<String>> = projection.map(<[String]>::to_vec);
                let log = log.to_vec();
                let out_path = target.join(chunk_file_name(i, &extension));
                Box::new(move || {
                    let table = store.read(&path, projection.as_deref())?;
                    let table = replay(table, &log)?;
                    store.write(&out_path, &table)?;
                    Ok(Table::default())
                }) as Task
            })
            .collect();
        let results = self.pool.submit_batch(tasks);
        first_error(chunks, results)?;
        Ok(())
    }
}

/// Tag an error with the chunk it came from.
pub(crate) fn task_error(chunk: &Path, source: Error) -> Error {
    let chunk = chunk
        .file_name()
        .map_or_else(|| chunk.display().to_string(), |n| n.to_string_lossy().into_owned());
    Error::Task {
        chunk,
        source: Box::new(source),
    }
}

fn first_error(chunks: &[PathBuf], results: Vec<Result<Table>>) -> Result<Vec<Table>> {
    let mut out = Vec::with_capacity(results.len());
    for (path, result) in chunks.iter().zip(results) {
        match result {
            Ok(table) => out.push(table),
            Err(e) => return Err(task_error(path, e)),
        }
    }
    Ok(out)
}
