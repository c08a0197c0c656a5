//! The join planner and the chunk-local hash join.
//!
//! A chunk-local join is only correct when every pair of rows that could
//! match lives in the same chunk pair. The planner decides per operand shape
//! whether that already holds:
//!
//! - in-memory right, any kind but full: no repartition needed — the table is
//!   broadcast to every chunk as a deferred map operation (lazy);
//! - in-memory right, full: the left side is hard-repartitioned by the join
//!   keys and the right rows are bucketed with the same hash, so each
//!   right-unmatched row is emitted by exactly one chunk;
//! - frame against frame: if both sides are certified hard-sharded by the
//!   join keys with equal chunk counts, chunk *i* joins chunk *i* directly;
//!   otherwise both sides are repartitioned into planner-owned scratch space
//!   first.
//!
//! Repartitioning joins execute eagerly: deferring past a repartition would
//! make a log entry depend on global dataset state, which breaks the
//! per-chunk independence the executor relies on.
//!
//! Right joins are refused — flip the operands and use a left join.

use crate::error::{Error, Result};
use crate::executor::{Task, task_error};
use crate::frame::ChunkFrame;
use crate::ops::{Operation, replay};
use crate::shard::{bucket_of, scatter};
use crate::store::{ChunkStore, chunk_file_name};
use crate::table::{Column, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Supported join kinds. `Right` exists only so the refusal is typed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Matches only.
    Inner,
    /// All left rows; unmatched right columns null-filled.
    Left,
    /// Left rows with at least one match, left columns only.
    Semi,
    /// Left rows with no match, left columns only.
    Anti,
    /// All rows from both sides, the unmatched side null-filled.
    Full,
    /// Unsupported; always refused.
    Right,
}

/// The right operand of a join: another partitioned frame, or a small
/// in-memory table to broadcast.
pub enum JoinOperand {
    Frame(ChunkFrame),
    Table(Table),
}

impl From<ChunkFrame> for JoinOperand {
    fn from(frame: ChunkFrame) -> Self {
        JoinOperand::Frame(frame)
    }
}

impl From<Table> for JoinOperand {
    fn from(table: Table) -> Self {
        JoinOperand::Table(table)
    }
}

pub(crate) fn plan(
    left: ChunkFrame,
    rhs: JoinOperand,
    kind: JoinKind,
    by: Vec<String>,
) -> Result<ChunkFrame> {
    if kind == JoinKind::Right {
        return Err(Error::UnsupportedJoin(
            "right join; flip the operands and use a left join".into(),
        ));
    }
    if by.is_empty() {
        return Err(Error::UnsupportedJoin("join with no key columns".into()));
    }
    match rhs {
        JoinOperand::Table(table) if kind != JoinKind::Full => broadcast(left, table, kind, by),
        JoinOperand::Table(table) => full_against_table(left, table, by),
        JoinOperand::Frame(right) => frame_join(left, right, kind, by),
    }
}

/// Broadcast the right table to every chunk as a deferred map operation.
fn broadcast(left: ChunkFrame, right: Table, kind: JoinKind, by: Vec<String>) -> Result<ChunkFrame> {
    for key in &by {
        if !right.has_column(key) {
            return Err(Error::schema("join", key));
        }
    }
    tracing::debug!(kind = ?kind, "broadcast join deferred to the operation log");
    let right = Arc::new(right);
    Ok(left.map(move |chunk| {
        join_tables(&chunk, &right, kind, &by).map_err(anyhow::Error::from)
    }))
}

/// Full join against an in-memory table: repartition the left by the join
/// keys, bucket the right rows with the same hash, and full-join pair-wise.
fn full_against_table(left: ChunkFrame, right: Table, by: Vec<String>) -> Result<ChunkFrame> {
    let key_idx: Vec<usize> = by
        .iter()
        .map(|k| right.column_index(k).ok_or_else(|| Error::schema("join", k)))
        .collect::<Result<_>>()?;

    let engine = left.engine.clone();
    let buckets = engine
        .config
        .target_chunks
        .unwrap_or(left.n_chunks()?)
        .max(1);

    let left_scratch = tempfile::tempdir()?;
    scatter(&left, &by, buckets, left_scratch.path()).map_err(wrap_repartition)?;

    let mut right_parts = vec![right.empty_like(); buckets];
    for r in 0..right.n_rows() {
        let key: Vec<Value> = key_idx
            .iter()
            .map(|&c| right.columns()[c].values[r].clone())
            .collect();
        right_parts[bucket_of(&key, buckets)].push_row(right.row(r));
    }

    let store = Arc::clone(&engine.store);
    let left_chunks = store.list_chunks(left_scratch.path())?;
    let out_dir = TempDir::new()?;
    let extension = store.extension().to_string();
    let tasks: Vec<Task> = left_chunks
        .iter()
        .cloned()
        .zip(right_parts)
        .enumerate()
        .map(|(i, (left_path, right_part))| {
            let store = Arc::clone(&store);
            let by = by.clone();
            let out_path = out_dir.path().join(chunk_file_name(i, &extension));
            Box::new(move || {
                let left_part = store.read(&left_path, None)?;
                let joined = join_tables(&left_part, &right_part, JoinKind::Full, &by)?;
                store.write(&out_path, &joined)?;
                Ok(Table::default())
            }) as Task
        })
        .collect();
    let results = engine.pool.submit_batch(tasks);
    check_pair_results(&left_chunks, results)?;

    Ok(ChunkFrame::attached(engine, out_dir, by))
}

/// One side of a frame-to-frame join, normalized for pair-wise execution.
struct Side {
    store: Arc<dyn ChunkStore>,
    chunks: Vec<PathBuf>,
    projection: Option<Vec<String>>,
    log: Vec<Operation>,
    _scratch: Option<TempDir>,
}

impl Side {
    fn of(frame: &ChunkFrame) -> Result<Side> {
        let store = Arc::clone(&frame.engine.store);
        let chunks = store.list_chunks(&frame.location)?;
        Ok(Side {
            store,
            chunks,
            projection: frame.projection.clone(),
            log: frame.log.clone(),
            _scratch: None,
        })
    }

    fn scattered(frame: &ChunkFrame, by: &[String], buckets: usize) -> Result<Side> {
        let scratch = tempfile::tempdir()?;
        scatter(frame, by, buckets, scratch.path()).map_err(wrap_repartition)?;
        let store = Arc::clone(&frame.engine.store);
        let chunks = store.list_chunks(scratch.path())?;
        Ok(Side {
            store,
            chunks,
            projection: None,
            log: Vec::new(),
            _scratch: Some(scratch),
        })
    }

    /// Task-side read of pair member `i`. A side with no chunks at all
    /// (an empty dataset) contributes an empty key-only table.
    fn reader(&self, index: usize, by: &[String]) -> Task {
        let path = self.chunks.get(index).cloned();
        let store = Arc::clone(&self.store);
        let projection = self.projection.clone();
        let log = self.log.clone();
        let by = by.to_vec();
        Box::new(move || match path {
            Some(path) => {
                let table = store.read(&path, projection.as_deref())?;
                replay(table, &log)
            }
            None => Table::new(by.iter().map(|k| Column::new(k.clone(), Vec::new())).collect()),
        })
    }
}

fn frame_join(
    left: ChunkFrame,
    right: ChunkFrame,
    kind: JoinKind,
    by: Vec<String>,
) -> Result<ChunkFrame> {
    let engine = left.engine.clone();
    let left_n = left.n_chunks()?;
    let right_n = right.n_chunks()?;
    let co_partitioned = left.shard_keys() == by.as_slice()
        && right.shard_keys() == by.as_slice()
        && left_n == right_n
        && left_n > 0;

    let (left_side, right_side) = if co_partitioned {
        tracing::debug!(chunks = left_n, "join sides already co-partitioned; no repartition");
        (Side::of(&left)?, Side::of(&right)?)
    } else {
        let buckets = engine
            .config
            .target_chunks
            .unwrap_or(left_n.max(right_n))
            .max(1);
        tracing::debug!(buckets, "repartitioning both join sides by the join keys");
        (
            Side::scattered(&left, &by, buckets)?,
            Side::scattered(&right, &by, buckets)?,
        )
    };

    let pairs = left_side.chunks.len().max(right_side.chunks.len());
    let out_dir = TempDir::new()?;
    let extension = engine.store.extension().to_string();
    let mut pair_ids = Vec::with_capacity(pairs);
    let tasks: Vec<Task> = (0..pairs)
        .map(|i| {
            pair_ids.push(
                left_side
                    .chunks
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from(format!("pair-{i}"))),
            );
            let read_left = left_side.reader(i, &by);
            let read_right = right_side.reader(i, &by);
            let store = Arc::clone(&engine.store);
            let by = by.clone();
            let out_path = out_dir.path().join(chunk_file_name(i, &extension));
            Box::new(move || {
                let joined = join_tables(&read_left()?, &read_right()?, kind, &by)?;
                store.write(&out_path, &joined)?;
                Ok(Table::default())
            }) as Task
        })
        .collect();
    let results = engine.pool.submit_batch(tasks);
    check_pair_results(&pair_ids, results)?;

    Ok(ChunkFrame::attached(engine, out_dir, by))
}

fn wrap_repartition(e: Error) -> Error {
    match e {
        already @ Error::Repartition { .. } => already,
        other => Error::Repartition {
            source: Box::new(other),
        },
    }
}

fn check_pair_results(ids: &[PathBuf], results: Vec<Result<Table>>) -> Result<()> {
    for (id, result) in ids.iter().zip(results) {
        if let Err(e) = result {
            return Err(task_error(id, e));
        }
    }
    Ok(())
}

/// Relational hash join of two in-memory tables.
///
/// Output schema: all left columns, then right non-key columns; a right
/// column whose name collides with a left column is suffixed `_y`. Semi and
/// anti joins return the left columns only. For full joins the key columns
/// are merged — a right-only row carries its key values in the left key
/// columns.
pub(crate) fn join_tables(
    left: &Table,
    right: &Table,
    kind: JoinKind,
    by: &[String],
) -> Result<Table> {
    let left_key: Vec<usize> = by
        .iter()
        .map(|k| left.column_index(k).ok_or_else(|| Error::schema("join", k)))
        .collect::<Result<_>>()?;
    let right_key: Vec<usize> = by
        .iter()
        .map(|k| right.column_index(k).ok_or_else(|| Error::schema("join", k)))
        .collect::<Result<_>>()?;

    let key_of = |table: &Table, idx: &[usize], row: usize| -> Vec<Value> {
        idx.iter()
            .map(|&c| table.columns()[c].values[row].clone())
            .collect()
    };

    if matches!(kind, JoinKind::Semi | JoinKind::Anti) {
        let right_keys: HashSet<Vec<Value>> = (0..right.n_rows())
            .map(|r| key_of(right, &right_key, r))
            .collect();
        let want = kind == JoinKind::Semi;
        let keep: Vec<usize> = (0..left.n_rows())
            .filter(|&r| right_keys.contains(&key_of(left, &left_key, r)) == want)
            .collect();
        return Ok(left.take(&keep));
    }

    // Right payload columns and their output names.
    let right_payload: Vec<usize> = (0..right.n_cols())
        .filter(|i| !right_key.contains(i))
        .collect();
    let payload_names: Vec<String> = right_payload
        .iter()
        .map(|&i| {
            let name = &right.columns()[i].name;
            if left.has_column(name) {
                format!("{name}_y")
            } else {
                name.clone()
            }
        })
        .collect();

    let left_width = left.n_cols();
    let mut cells: Vec<Vec<Value>> = vec![Vec::new(); left_width + right_payload.len()];

    let mut emit = |left_row: Option<usize>, right_row: Option<usize>| {
        for (ci, c) in left.columns().iter().enumerate() {
            let v = match left_row {
                Some(r) => c.values[r].clone(),
                // Right-only row: merged key columns take the right key
                // values, everything else is null.
                None => match left_key.iter().position(|&k| k == ci) {
                    Some(j) => {
                        right.columns()[right_key[j]].values[right_row.expect("right row")].clone()
                    }
                    None => Value::Null,
                },
            };
            cells[ci].push(v);
        }
        for (pi, &rc) in right_payload.iter().enumerate() {
            let v = match right_row {
                Some(r) => right.columns()[rc].values[r].clone(),
                None => Value::Null,
            };
            cells[left_width + pi].push(v);
        }
    };

    // Build on the smaller side for inner joins; directional kinds build on
    // the right so the left drives the probe.
    if kind == JoinKind::Inner && left.n_rows() < right.n_rows() {
        let mut left_map: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for r in 0..left.n_rows() {
            left_map.entry(key_of(left, &left_key, r)).or_default().push(r);
        }
        for rr in 0..right.n_rows() {
            if let Some(rows) = left_map.get(&key_of(right, &right_key, rr)) {
                for &lr in rows {
                    emit(Some(lr), Some(rr));
                }
            }
        }
    } else {
        let mut right_map: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for r in 0..right.n_rows() {
            right_map
                .entry(key_of(right, &right_key, r))
                .or_default()
                .push(r);
        }
        let mut right_matched = vec![false; right.n_rows()];
        for lr in 0..left.n_rows() {
            match right_map.get(&key_of(left, &left_key, lr)) {
                Some(rows) => {
                    for &rr in rows {
                        right_matched[rr] = true;
                        emit(Some(lr), Some(rr));
                    }
                }
                None => {
                    if kind != JoinKind::Inner {
                        emit(Some(lr), None);
                    }
                }
            }
        }
        if kind == JoinKind::Full {
            for (rr, matched) in right_matched.iter().enumerate() {
                if !matched {
                    emit(None, Some(rr));
                }
            }
        }
    }

    let names: Vec<String> = left
        .names()
        .into_iter()
        .map(str::to_string)
        .chain(payload_names)
        .collect();
    Table::new(
        names
            .into_iter()
            .zip(cells)
            .map(|(name, values)| Column::new(name, values))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left() -> Table {
        Table::new(vec![
            Column::new(
                "id",
                vec![
                    Value::Str("a".into()),
                    Value::Str("a".into()),
                    Value::Str("b".into()),
                    Value::Str("c".into()),
                ],
            ),
            Column::new(
                "n",
                vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
            ),
        ])
        .unwrap()
    }

    fn right() -> Table {
        Table::new(vec![
            Column::new(
                "id",
                vec![Value::Str("a".into()), Value::Str("d".into())],
            ),
            Column::new("n", vec![Value::Int(10), Value::Int(40)]),
            Column::new(
                "tag",
                vec![Value::Str("x".into()), Value::Str("y".into())],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn inner_keeps_matches_and_suffixes_collisions() -> Result<()> {
        let by = vec!["id".to_string()];
        let out = join_tables(&left(), &right(), JoinKind::Inner, &by)?;
        assert_eq!(out.names(), vec!["id", "n", "n_y", "tag"]);
        assert_eq!(out.n_rows(), 2);
        Ok(())
    }

    #[test]
    fn left_null_fills_unmatched() -> Result<()> {
        let by = vec!["id".to_string()];
        let out = join_tables(&left(), &right(), JoinKind::Left, &by)?;
        assert_eq!(out.n_rows(), 4);
        let b_row = out.row(2);
        assert_eq!(b_row[0], Value::Str("b".into()));
        assert_eq!(b_row[2], Value::Null);
        assert_eq!(b_row[3], Value::Null);
        Ok(())
    }

    #[test]
    fn semi_and_anti_partition_the_left() -> Result<()> {
        let by = vec!["id".to_string()];
        let semi = join_tables(&left(), &right(), JoinKind::Semi, &by)?;
        let anti = join_tables(&left(), &right(), JoinKind::Anti, &by)?;
        assert_eq!(semi.names(), vec!["id", "n"]);
        assert_eq!(semi.n_rows(), 2);
        assert_eq!(anti.n_rows(), 2);
        assert_eq!(semi.n_rows() + anti.n_rows(), left().n_rows());
        Ok(())
    }

    #[test]
    fn full_merges_keys_for_right_only_rows() -> Result<()> {
        let by = vec!["id".to_string()];
        let out = join_tables(&left(), &right(), JoinKind::Full, &by)?;
        assert_eq!(out.n_rows(), 5);
        let last = out.row(4);
        assert_eq!(last[0], Value::Str("d".into()));
        assert_eq!(last[1], Value::Null);
        assert_eq!(last[2], Value::Int(40));
        Ok(())
    }
}
