//! Hash sharding and the hard repartition.
//!
//! [`stable_hash`] assigns rows to buckets deterministically across runs and
//! platforms: each key cell feeds the hasher as a type tag plus a canonical
//! little-endian payload (strings length-delimited), in column order, so
//! multi-column keys mix every column and `["a", "b"]` hashes differently
//! from `["b", "a"]`.
//!
//! [`repartition`] is the "hard" operation: it forces a handle's log, reads
//! every chunk, redistributes all rows by key hash, and atomically swaps the
//! dataset's chunk set. Every bucket is written, empty ones included, so the
//! bucket-to-chunk-file mapping is the identity — the join planner pairs
//! chunk *i* with chunk *i* by file name on the strength of this.

use crate::error::{Error, Result};
use crate::executor::ChunkExecutor;
use crate::frame::ChunkFrame;
use crate::store::chunk_file_name;
use crate::table::Value;
use std::fs;
use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;
use twox_hash::XxHash64;

const SHARD_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Deterministic, platform-stable hash of a key-column value tuple.
///
/// Sensitive to column order; identical tuples always hash identically,
/// independent of any unrelated columns' values.
#[must_use]
pub fn stable_hash(key: &[Value]) -> u64 {
    let mut h = XxHash64::with_seed(SHARD_SEED);
    for v in key {
        match v {
            Value::Null => h.write_u8(0),
            Value::Bool(b) => {
                h.write_u8(1);
                h.write_u8(u8::from(*b));
            }
            Value::Int(i) => {
                h.write_u8(2);
                h.write(&i.to_le_bytes());
            }
            Value::Float(f) => {
                h.write_u8(3);
                h.write(&f.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                h.write_u8(4);
                h.write(&(s.len() as u64).to_le_bytes());
                h.write(s.as_bytes());
            }
        }
    }
    h.finish()
}

/// Bucket assignment for a key tuple: `stable_hash(key) mod buckets`.
#[must_use]
pub fn bucket_of(key: &[Value], buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    (stable_hash(key) % buckets as u64) as usize
}

/// Force a handle's log and scatter all of its rows into `buckets` chunk
/// files under `dest` (expected fresh/empty). Writes every bucket, empties
/// included. A dataset with no chunks scatters to nothing.
///
/// This is the O(total rows) read-everything-rewrite-everything step; it
/// emits a warning-level event so callers see the cost.
pub(crate) fn scatter(
    frame: &ChunkFrame,
    keys: &[String],
    buckets: usize,
    dest: &Path,
) -> Result<()> {
    let store = Arc::clone(&frame.engine.store);
    let chunks = store.list_chunks(&frame.location)?;
    let executor = ChunkExecutor::new(Arc::clone(&store), Arc::clone(&frame.engine.pool));
    let parts = executor.run(&chunks, frame.projection.as_deref(), &frame.log)?;

    let total_rows: usize = parts.iter().map(crate::table::Table::n_rows).sum();
    tracing::warn!(
        rows = total_rows,
        source_chunks = parts.len(),
        buckets,
        "hard repartition reads and rewrites the entire dataset; avoid repeating it within one plan"
    );

    let Some(first) = parts.first() else {
        return Ok(());
    };
    let schema = first.empty_like();
    let mut out = vec![schema.clone(); buckets];

    for part in &parts {
        if part.names() != schema.names() {
            return Err(Error::MalformedTable(format!(
                "chunk schema {:?} disagrees with {:?}",
                part.names(),
                schema.names()
            )));
        }
        let key_idx: Vec<usize> = keys
            .iter()
            .map(|k| {
                part.column_index(k)
                    .ok_or_else(|| Error::schema("group_by", k))
            })
            .collect::<Result<_>>()?;
        for r in 0..part.n_rows() {
            let key: Vec<Value> = key_idx
                .iter()
                .map(|&c| part.columns()[c].values[r].clone())
                .collect();
            out[bucket_of(&key, buckets)].push_row(part.row(r));
        }
    }

    let extension = store.extension();
    for (i, bucket) in out.iter().enumerate() {
        store.write(&dest.join(chunk_file_name(i, extension)), bucket)?;
    }
    Ok(())
}

/// Hard-repartition a dataset in place: scatter into a staging sibling
/// directory, then swap it for the live chunk set.
///
/// The swap is atomic from the caller's perspective: on any failure before
/// it, the staging directory is discarded and the original chunk set is
/// untouched; if the swap itself fails half-way the original set is moved
/// back.
///
/// # Errors
///
/// All failures surface as [`Error::Repartition`] wrapping the cause.
pub(crate) fn repartition(frame: &ChunkFrame, keys: &[String], buckets: usize) -> Result<()> {
    scatter_and_swap(frame, keys, buckets).map_err(|e| Error::Repartition {
        source: Box::new(e),
    })
}

fn scatter_and_swap(frame: &ChunkFrame, keys: &[String], buckets: usize) -> Result<()> {
    let dir = frame.location.as_path();
    let parent = match dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // Staged as a sibling so both renames stay on one filesystem. Dropping
    // the TempDir on an early error cleans the staging area up.
    let staging = tempfile::Builder::new()
        .prefix(".repartition-")
        .tempdir_in(parent)?;
    scatter(frame, keys, buckets, staging.path())?;

    let staged = staging.keep();
    let stem = dir
        .file_name()
        .map_or_else(|| "dataset".to_string(), |n| n.to_string_lossy().into_owned());
    let retired = parent.join(format!(".{stem}-retired"));
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    fs::rename(dir, &retired)?;
    if let Err(e) = fs::rename(&staged, dir) {
        // Put the original chunk set back before reporting.
        let _ = fs::rename(&retired, dir);
        let _ = fs::remove_dir_all(&staged);
        return Err(Error::Io(e));
    }
    let _ = fs::remove_dir_all(&retired);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let key = vec![Value::Str("alpha".into()), Value::Int(7)];
        assert_eq!(stable_hash(&key), stable_hash(&key));
        assert_eq!(stable_hash(&key), stable_hash(&key.clone()));
    }

    #[test]
    fn hash_mixes_every_column() {
        let ab = vec![Value::Str("a".into()), Value::Str("b".into())];
        let ba = vec![Value::Str("b".into()), Value::Str("a".into())];
        assert_ne!(stable_hash(&ab), stable_hash(&ba));

        let a1 = vec![Value::Str("a".into()), Value::Int(1)];
        let a2 = vec![Value::Str("a".into()), Value::Int(2)];
        assert_ne!(stable_hash(&a1), stable_hash(&a2));
    }

    #[test]
    fn string_encoding_is_length_delimited() {
        // ("ab", "c") must not collide with ("a", "bc").
        let ab_c = vec![Value::Str("ab".into()), Value::Str("c".into())];
        let a_bc = vec![Value::Str("a".into()), Value::Str("bc".into())];
        assert_ne!(stable_hash(&ab_c), stable_hash(&a_bc));
    }

    #[test]
    fn buckets_stay_in_range() {
        for i in 0..100i64 {
            let b = bucket_of(&[Value::Int(i)], 7);
            assert!(b < 7);
        }
    }
}
