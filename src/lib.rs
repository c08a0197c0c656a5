//! # Chunkframe
//!
//! An **out-of-core data frame engine** for Rust: a tabular dataset larger
//! than memory is partitioned into file-backed chunks, and relational verbs
//! run over it chunk-at-a-time across a worker pool.
//!
//! ## Key Features
//!
//! - **Lazy relational verbs** - select, rename, filter, mutate, transmute,
//!   arrange, group-by/summarize, and arbitrary per-chunk maps accumulate in
//!   a deferred operation log
//! - **Hard group-by** - deterministic hash repartitioning co-locates every
//!   distinct key combination in exactly one chunk, with an atomic chunk-set
//!   swap
//! - **Join planning** - broadcast joins for in-memory tables, pair-wise
//!   chunk joins for co-partitioned datasets, automatic repartitioning when
//!   correctness requires it
//! - **Chunk-parallel execution** - independent per-chunk tasks over a rayon
//!   pool, with collected rows always in chunk-index order
//! - **Swappable adapters** - the chunk codec ([`ChunkStore`]) and the worker
//!   pool ([`WorkerPool`]) are trait seams with default implementations
//! - **Typed errors** - every failure mode is a matchable [`Error`] variant
//!   carrying the chunk, column, or path it came from
//!
//! ## Quick Start
//!
//! ```no_run
//! use chunkframe::*;
//!
//! # fn main() -> Result<()> {
//! let engine = Engine::new(ExecConfig::default())?;
//!
//! // Ingest a CSV into 100k-row chunks, then aggregate out-of-core.
//! let orders = from_csv(&engine, "orders.csv", "data/orders", 100_000, false)?;
//!
//! let totals = orders
//!     .filter(col("status").eq(lit("shipped")))
//!     .group_by(&["customer"], true)?
//!     .summarize(vec![
//!         ("orders", Agg::Count),
//!         ("spend", Agg::sum("amount")),
//!     ]);
//!
//! let table = totals.collect()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Laziness and eagerness
//!
//! A [`ChunkFrame`] is immutable: every verb returns a new handle whose log
//! is the old log plus one entry. Nothing touches disk until a terminal
//! action ([`collect`](ChunkFrame::collect),
//! [`collect_list`](ChunkFrame::collect_list), [`write`](ChunkFrame::write))
//! replays the log per chunk — which also means data errors surface at the
//! terminal, not at the verb that caused them.
//!
//! The exceptions are the operations whose correctness depends on which rows
//! share a chunk: a hard [`group_by`](ChunkFrame::group_by) and a
//! frame-to-frame [`join`](ChunkFrame::join) repartition eagerly, because a
//! deferred repartition would make log entries depend on global dataset
//! state and break per-chunk independence.
//!
//! ## Module Overview
//!
//! - [`frame`] - the dataset handle, its verbs, and ingestion
//! - [`table`] / [`expr`] - in-memory tables, cell values, expressions and
//!   aggregations
//! - [`ops`] - the operation log and its replay
//! - [`shard`] - stable hashing and hard repartitioning
//! - [`join`] - the join planner and the chunk-local hash join
//! - [`executor`] - worker pool adapters and fan-out/fan-in
//! - [`store`] - the chunk store adapter and the default block format
//! - [`testing`] - builders, assertions, and failure-injecting doubles
//!
//! ## Feature Flags
//!
//! - `ingest-csv` *(default)* - chunked CSV ingestion via [`from_csv`]

pub mod error;
pub mod executor;
pub mod expr;
pub mod frame;
pub mod join;
pub mod ops;
pub mod shard;
pub mod store;
pub mod table;
pub mod testing;

// General re-exports
pub use error::{Error, Result};
pub use executor::{ExecConfig, RayonPool, SerialPool, Task, WorkerPool};
pub use expr::{Agg, ArithOp, CmpOp, Expr, SortKey, col, lit};
pub use frame::{ChunkFrame, Engine, Grouped, from_chunks, from_table, open};
pub use join::{JoinKind, JoinOperand};
pub use ops::{MapFn, Operation, replay};
pub use shard::{bucket_of, stable_hash};
pub use store::{BlockStore, ChunkStore};
pub use table::{Column, Table, Value};

// Gated re-exports
#[cfg(feature = "ingest-csv")]
pub use frame::from_csv;
