//! Test utilities: builders, assertions, and failure-injecting adapter
//! doubles.
//!
//! Shipped as a public module so downstream crates can test code built on
//! the engine with the same tools the engine tests itself with:
//! temp-dir-backed datasets, quick table builders, unordered table equality,
//! a store that fails on the Nth write (repartition atomicity), and a pool
//! that completes tasks out of order (collect ordering).

use crate::error::{Error, Result};
use crate::executor::{ExecConfig, SerialPool, Task, WorkerPool};
use crate::frame::Engine;
use crate::store::{BlockStore, ChunkStore};
use crate::table::{Column, Table, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// A temporary directory for datasets, deleted when dropped.
pub struct DataDir {
    #[allow(dead_code)]
    temp_dir: TempDir,
    path: PathBuf,
}

impl DataDir {
    /// Create a new temporary data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        Ok(Self { temp_dir, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for a named dataset directory inside this data dir. Not created
    /// yet — ingestion constructors create it.
    #[must_use]
    pub fn dataset(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Default for DataDir {
    fn default() -> Self {
        Self::new().expect("Failed to create temporary data directory")
    }
}

/// A serial, in-order engine over the default store, for deterministic
/// assertions.
#[must_use]
pub fn probe_engine() -> Engine {
    Engine::with_adapters(
        Arc::new(BlockStore),
        Arc::new(SerialPool),
        ExecConfig::default(),
    )
}

/// Build an integer column.
#[must_use]
pub fn int_col(name: &str, values: &[i64]) -> Column {
    Column::new(name, values.iter().map(|&v| Value::Int(v)).collect())
}

/// Build a float column.
#[must_use]
pub fn float_col(name: &str, values: &[f64]) -> Column {
    Column::new(name, values.iter().map(|&v| Value::Float(v)).collect())
}

/// Build a string column.
#[must_use]
pub fn str_col(name: &str, values: &[&str]) -> Column {
    Column::new(
        name,
        values.iter().map(|&v| Value::Str(v.to_string())).collect(),
    )
}

/// Build a boolean column.
#[must_use]
pub fn bool_col(name: &str, values: &[bool]) -> Column {
    Column::new(name, values.iter().map(|&v| Value::Bool(v)).collect())
}

/// Build a table from columns, panicking on an invalid schema.
///
/// # Panics
///
/// Panics if the columns violate the table invariants.
#[must_use]
pub fn table_of(columns: Vec<Column>) -> Table {
    Table::new(columns).expect("invalid test table")
}

/// Assert two tables are identical, rows in the same order.
///
/// # Panics
///
/// Panics with a detailed message if the tables differ.
pub fn assert_tables_equal(actual: &Table, expected: &Table) {
    assert_eq!(
        actual.names(),
        expected.names(),
        "column mismatch:\n  Expected: {:?}\n  Actual: {:?}",
        expected.names(),
        actual.names()
    );
    assert_eq!(
        actual.n_rows(),
        expected.n_rows(),
        "row count mismatch:\n  Expected: {} rows\n  Actual: {} rows",
        expected.n_rows(),
        actual.n_rows()
    );
    for r in 0..actual.n_rows() {
        assert_eq!(
            actual.row(r),
            expected.row(r),
            "row mismatch at index {r}:\n  Expected: {:?}\n  Actual: {:?}",
            expected.row(r),
            actual.row(r)
        );
    }
}

/// Assert two tables hold the same rows, ignoring row order. Useful for
/// results whose row order is unspecified (joins, repartitioned datasets).
///
/// # Panics
///
/// Panics if the row multisets differ.
pub fn assert_tables_equal_unordered(actual: &Table, expected: &Table) {
    assert_eq!(
        actual.names(),
        expected.names(),
        "column mismatch:\n  Expected: {:?}\n  Actual: {:?}",
        expected.names(),
        actual.names()
    );
    let mut a: Vec<Vec<Value>> = (0..actual.n_rows()).map(|r| actual.row(r)).collect();
    let mut e: Vec<Vec<Value>> = (0..expected.n_rows()).map(|r| expected.row(r)).collect();
    a.sort();
    e.sort();
    assert_eq!(
        a, e,
        "row multiset mismatch (rows shown sorted):\n  Expected: {e:?}\n  Actual: {a:?}"
    );
}

/// A chunk store double whose writes start failing after a budget of
/// successes — for exercising repartition atomicity.
pub struct FlakyStore {
    inner: Arc<dyn ChunkStore>,
    writes_left: AtomicUsize,
}

impl FlakyStore {
    /// Allow `successful_writes` writes, then fail every subsequent one.
    #[must_use]
    pub fn failing_after(inner: Arc<dyn ChunkStore>, successful_writes: usize) -> Self {
        Self {
            inner,
            writes_left: AtomicUsize::new(successful_writes),
        }
    }
}

impl ChunkStore for FlakyStore {
    fn read(&self, path: &Path, columns: Option<&[String]>) -> Result<Table> {
        self.inner.read(path, columns)
    }

    fn write(&self, path: &Path, table: &Table) -> Result<()> {
        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if !allowed {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.write(path, table)
    }

    fn list_chunks(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_chunks(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn extension(&self) -> &str {
        self.inner.extension()
    }
}

/// A worker pool that runs tasks on real threads with reversed delays, so
/// later tasks complete first — for verifying that fan-in delivers results
/// in chunk-index order regardless of completion order.
pub struct JitterPool {
    step: Duration,
}

impl JitterPool {
    /// Delay task `i` of `n` by `step_ms * (n - i)` milliseconds.
    #[must_use]
    pub fn new(step_ms: u64) -> Self {
        Self {
            step: Duration::from_millis(step_ms),
        }
    }
}

impl WorkerPool for JitterPool {
    fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<Table>> {
        let n = tasks.len();
        std::thread::scope(|scope| {
            let handles: Vec<_> = tasks
                .into_iter()
                .enumerate()
                .map(|(i, task)| {
                    let delay = self.step * (n - i) as u32;
                    scope.spawn(move || {
                        std::thread::sleep(delay);
                        task()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("jitter worker panicked"))
                .collect()
        })
    }
}
