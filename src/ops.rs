//! The deferred operation log and its replay.
//!
//! Every lazy verb appends one [`Operation`] to a handle's log; a terminal
//! action replays the whole log against each chunk independently. Operations
//! are pure per-chunk transforms: nothing here may depend on cross-chunk
//! state (grouping and join correctness are resolved by repartitioning
//! *before* the log runs, never inside it).

use crate::error::{Error, Result};
use crate::expr::{Agg, Expr, SortKey};
use crate::table::{Column, Table, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A user-supplied per-chunk transform carried by [`Operation::MapChunk`].
pub type MapFn = dyn Fn(Table) -> anyhow::Result<Table> + Send + Sync;

/// One deferred per-chunk operation.
///
/// All variants except `MapChunk` are plain data, so a log can be inspected
/// (and its shard-key effects analyzed) without executing it.
#[derive(Clone)]
pub enum Operation {
    /// Keep the named columns, in the given order.
    Select(Vec<String>),
    /// Rename columns via `(old, new)` pairs.
    Rename(Vec<(String, String)>),
    /// Keep rows whose predicate evaluates to `Bool(true)`.
    Filter(Expr),
    /// Assign columns in sequence; later assignments see earlier ones.
    Mutate(Vec<(String, Expr)>),
    /// Like `Mutate`, but the output keeps only the assigned columns.
    Transmute(Vec<(String, Expr)>),
    /// Stable sort of the rows currently in the chunk. Chunk-local: no
    /// global ordering across chunks is implied.
    Arrange(Vec<SortKey>),
    /// Group and aggregate the rows currently in the chunk. Only sound as a
    /// global group-by when the dataset is hard-sharded by a superset of
    /// `keys`.
    Summarize {
        keys: Vec<String>,
        aggs: Vec<(String, Agg)>,
    },
    /// An arbitrary per-chunk transform.
    MapChunk(Arc<MapFn>),
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(cols) => f.debug_tuple("Select").field(cols).finish(),
            Self::Rename(pairs) => f.debug_tuple("Rename").field(pairs).finish(),
            Self::Filter(expr) => f.debug_tuple("Filter").field(expr).finish(),
            Self::Mutate(asgn) => f.debug_tuple("Mutate").field(asgn).finish(),
            Self::Transmute(asgn) => f.debug_tuple("Transmute").field(asgn).finish(),
            Self::Arrange(keys) => f.debug_tuple("Arrange").field(keys).finish(),
            Self::Summarize { keys, aggs } => f
                .debug_struct("Summarize")
                .field("keys", keys)
                .field("aggs", aggs)
                .finish(),
            Self::MapChunk(_) => f.write_str("MapChunk(..)"),
        }
    }
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Select(_) => "select",
            Self::Rename(_) => "rename",
            Self::Filter(_) => "filter",
            Self::Mutate(_) => "mutate",
            Self::Transmute(_) => "transmute",
            Self::Arrange(_) => "arrange",
            Self::Summarize { .. } => "summarize",
            Self::MapChunk(_) => "map",
        }
    }

    /// Whether appending this operation keeps a shard-key certification
    /// truthful. Conservative: anything that could move, create, or rewrite
    /// key cells clears the certification.
    pub(crate) fn preserves_shard_keys(&self, shard_keys: &[String]) -> bool {
        if shard_keys.is_empty() {
            return true;
        }
        match self {
            // A chunk-local reorder cannot move a row across chunks.
            Self::Arrange(_) => true,
            Self::Select(cols) => shard_keys.iter().all(|k| cols.contains(k)),
            Self::Rename(pairs) => pairs.iter().all(|(old, _)| !shard_keys.contains(old)),
            Self::Mutate(asgn) => asgn.iter().all(|(name, _)| !shard_keys.contains(name)),
            // Keys stay co-located when every shard key is a group key: a
            // group's single output row lands in the chunk that held it.
            Self::Summarize { keys, .. } => shard_keys.iter().all(|k| keys.contains(k)),
            Self::Filter(_) | Self::Transmute(_) | Self::MapChunk(_) => false,
        }
    }

    /// Apply this operation to an in-memory table.
    pub(crate) fn apply(&self, table: Table) -> Result<Table> {
        match self {
            Self::Select(cols) => select(&table, cols),
            Self::Rename(pairs) => rename(table, pairs),
            Self::Filter(pred) => {
                let mut keep = Vec::new();
                for r in 0..table.n_rows() {
                    if pred.eval(&table, r, self.name())?.truthy() {
                        keep.push(r);
                    }
                }
                Ok(table.take(&keep))
            }
            Self::Mutate(asgn) => mutate(table, asgn, self.name()),
            Self::Transmute(asgn) => {
                let out = mutate(table, asgn, self.name())?;
                let names: Vec<String> = asgn.iter().map(|(n, _)| n.clone()).collect();
                select(&out, &names)
            }
            Self::Arrange(keys) => arrange(&table, keys),
            Self::Summarize { keys, aggs } => summarize(&table, keys, aggs),
            Self::MapChunk(f) => f(table).map_err(Error::Map),
        }
    }
}

/// Apply a log to a table, left to right. The first failing operation aborts
/// the replay and its error names the operation and the offending column.
///
/// Replay is deterministic: the same log against the same table yields the
/// same result.
///
/// # Errors
///
/// Propagates the first operation failure, most commonly [`Error::Schema`].
pub fn replay(mut table: Table, log: &[Operation]) -> Result<Table> {
    for op in log {
        table = op.apply(table)?;
    }
    Ok(table)
}

fn select(table: &Table, cols: &[String]) -> Result<Table> {
    let mut out = Vec::with_capacity(cols.len());
    for name in cols {
        let c = table
            .column(name)
            .ok_or_else(|| Error::schema("select", name))?;
        out.push(c.clone());
    }
    Table::new(out)
}

fn rename(table: Table, pairs: &[(String, String)]) -> Result<Table> {
    let mut columns: Vec<Column> = table.columns().to_vec();
    for (old, new) in pairs {
        let c = columns
            .iter_mut()
            .find(|c| &c.name == old)
            .ok_or_else(|| Error::schema("rename", old))?;
        c.name = new.clone();
    }
    Table::new(columns)
}

fn mutate(mut table: Table, asgn: &[(String, Expr)], op: &str) -> Result<Table> {
    for (name, expr) in asgn {
        let mut values = Vec::with_capacity(table.n_rows());
        for r in 0..table.n_rows() {
            values.push(expr.eval(&table, r, op)?);
        }
        table.set_column(name, values);
    }
    Ok(table)
}

fn arrange(table: &Table, keys: &[SortKey]) -> Result<Table> {
    let resolved: Vec<(usize, bool)> = keys
        .iter()
        .map(|k| {
            table
                .column_index(&k.column)
                .map(|i| (i, k.descending))
                .ok_or_else(|| Error::schema("arrange", k.column.clone()))
        })
        .collect::<Result<_>>()?;

    let mut order: Vec<usize> = (0..table.n_rows()).collect();
    order.sort_by(|&a, &b| {
        for &(c, desc) in &resolved {
            let col = &table.columns()[c];
            let ord = col.values[a].cmp(&col.values[b]);
            let ord = if desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(table.take(&order))
}

fn summarize(table: &Table, keys: &[String], aggs: &[(String, Agg)]) -> Result<Table> {
    let key_idx: Vec<usize> = keys
        .iter()
        .map(|k| {
            table
                .column_index(k)
                .ok_or_else(|| Error::schema("summarize", k))
        })
        .collect::<Result<_>>()?;

    // Groups in first-occurrence order, so output is deterministic.
    let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
    for r in 0..table.n_rows() {
        let key: Vec<Value> = key_idx
            .iter()
            .map(|&c| table.columns()[c].values[r].clone())
            .collect();
        match index.get(&key) {
            Some(&g) => groups[g].1.push(r),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![r]));
            }
        }
    }

    let mut columns = Vec::with_capacity(keys.len() + aggs.len());
    for (j, name) in keys.iter().enumerate() {
        let values = groups.iter().map(|(key, _)| key[j].clone()).collect();
        columns.push(Column::new(name.clone(), values));
    }
    for (name, agg) in aggs {
        let mut values = Vec::with_capacity(groups.len());
        for (_, rows) in &groups {
            values.push(agg.eval(table, rows)?);
        }
        columns.push(Column::new(name.clone(), values));
    }
    Table::new(columns)
}
