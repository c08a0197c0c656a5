//! Chunk storage: the adapter trait and the default `block` file format.
//!
//! The engine talks to chunk files only through [`ChunkStore`], so the
//! on-disk codec is swappable (tests wrap it with failure-injecting doubles).
//! The bundled [`BlockStore`] writes one postcard block per column behind a
//! small header, which makes column-subset reads cheap: unrequested columns
//! are seeked over and never enter memory.
//!
//! # File layout
//!
//! ```text
//! magic "CFB1" | u32 header length | postcard header | column blocks...
//! ```
//!
//! The header records the row count and each column's name and block length;
//! block offsets are the running sum of the lengths. Writes stage to a
//! temporary file in the target directory and persist by rename, so a
//! concurrent reader never observes a half-written chunk.

use crate::error::{Error, Result};
use crate::table::{Column, Table, Value};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Uniform interface to a directory of chunk files.
///
/// Implementations must keep `list_chunks` stable and reproducible
/// (lexicographic by file name), because chunk-index order defines the row
/// order of collected results.
pub trait ChunkStore: Send + Sync {
    /// Read a chunk into a table, optionally restricted to a column subset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChunkNotFound`] if the path is absent and
    /// [`Error::Schema`] if a requested column is not in the chunk.
    fn read(&self, path: &Path, columns: Option<&[String]>) -> Result<Table>;

    /// Create or replace the chunk at `path`, atomically with respect to
    /// concurrent readers.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be staged or persisted.
    fn write(&self, path: &Path, table: &Table) -> Result<()>;

    /// Enumerate the chunk files of a dataset directory in stable
    /// (lexicographic) order. A missing directory lists as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list_chunks(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Whether a chunk file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// File extension of this store's chunk files, without the dot.
    fn extension(&self) -> &str {
        "cfb"
    }
}

const MAGIC: &[u8; 4] = b"CFB1";

#[derive(Serialize, Deserialize)]
struct BlockHeader {
    rows: u64,
    columns: Vec<BlockSpan>,
}

#[derive(Serialize, Deserialize)]
struct BlockSpan {
    name: String,
    len: u64,
}

/// The default chunk codec: column blocks behind a postcard header.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockStore;

impl ChunkStore for BlockStore {
    fn read(&self, path: &Path, columns: Option<&[String]>) -> Result<Table> {
        let mut f = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ChunkNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidChunk {
                path: path.to_path_buf(),
                reason: "bad magic",
            });
        }
        let mut len_buf = [0u8; 4];
        f.read_exact(&mut len_buf)?;
        let header_len = u32::from_le_bytes(len_buf) as usize;
        let mut header_buf = vec![0u8; header_len];
        f.read_exact(&mut header_buf)?;
        let header: BlockHeader = postcard::from_bytes(&header_buf)?;

        if let Some(requested) = columns {
            for name in requested {
                if !header.columns.iter().any(|s| &s.name == name) {
                    return Err(Error::schema("projection", name));
                }
            }
        }

        let mut offset = (4 + 4 + header_len) as u64;
        let mut out = Vec::new();
        for span in &header.columns {
            let start = offset;
            offset += span.len;
            let wanted = columns.is_none_or(|req| req.iter().any(|r| r == &span.name));
            if !wanted {
                continue;
            }
            f.seek(SeekFrom::Start(start))?;
            let mut block = vec![0u8; span.len as usize];
            f.read_exact(&mut block)?;
            let values: Vec<Value> = postcard::from_bytes(&block)?;
            if values.len() as u64 != header.rows {
                return Err(Error::InvalidChunk {
                    path: path.to_path_buf(),
                    reason: "column length disagrees with header row count",
                });
            }
            out.push(Column::new(span.name.clone(), values));
        }
        Table::new(out)
    }

    fn write(&self, path: &Path, table: &Table) -> Result<()> {
        let mut spans = Vec::with_capacity(table.n_cols());
        let mut blocks = Vec::with_capacity(table.n_cols());
        for c in table.columns() {
            let block = postcard::to_allocvec(&c.values)?;
            spans.push(BlockSpan {
                name: c.name.clone(),
                len: block.len() as u64,
            });
            blocks.push(block);
        }
        let header = postcard::to_allocvec(&BlockHeader {
            rows: table.n_rows() as u64,
            columns: spans,
        })?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        // Stage in the target directory so the final rename stays on one
        // filesystem.
        let mut staged = tempfile::Builder::new().prefix(".staged-").tempfile_in(dir)?;
        staged.write_all(MAGIC)?;
        staged.write_all(&(header.len() as u32).to_le_bytes())?;
        staged.write_all(&header)?;
        for block in &blocks {
            staged.write_all(block)?;
        }
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn list_chunks(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension()))
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Chunk file name for a bucket or sequence index. Zero-padded so
/// lexicographic listing order equals index order.
pub(crate) fn chunk_file_name(index: usize, extension: &str) -> String {
    format!("{index:06}.{extension}")
}

/// Destination guard shared by every write-a-new-dataset path: fail before
/// touching anything if the target is non-empty and overwrite was not
/// requested; clear it when overwrite was.
///
/// # Errors
///
/// Returns [`Error::DestinationExists`] when the guard trips.
pub(crate) fn ensure_destination(dir: &Path, overwrite: bool) -> Result<()> {
    if dir.exists() {
        let non_empty = fs::read_dir(dir)?.next().is_some();
        if non_empty {
            if !overwrite {
                return Err(Error::DestinationExists {
                    dir: dir.to_path_buf(),
                });
            }
            fs::remove_dir_all(dir)?;
        }
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(vec![
            Column::new("id", vec![Value::Str("a".into()), Value::Str("b".into())]),
            Column::new("n", vec![Value::Int(1), Value::Int(2)]),
            Column::new("f", vec![Value::Float(0.5), Value::Null]),
        ])
        .unwrap()
    }

    #[test]
    fn round_trips_a_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(chunk_file_name(0, "cfb"));
        let store = BlockStore;
        store.write(&path, &sample())?;
        assert!(store.exists(&path));
        assert_eq!(store.read(&path, None)?, sample());
        Ok(())
    }

    #[test]
    fn subset_read_returns_requested_columns_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(chunk_file_name(0, "cfb"));
        let store = BlockStore;
        store.write(&path, &sample())?;
        let got = store.read(&path, Some(&["n".to_string()]))?;
        assert_eq!(got.names(), vec!["n"]);
        assert_eq!(got.n_rows(), 2);

        let missing = store.read(&path, Some(&["nope".to_string()]));
        assert!(matches!(missing, Err(Error::Schema { .. })));
        Ok(())
    }

    #[test]
    fn missing_chunk_is_distinguishable() {
        let store = BlockStore;
        let err = store.read(Path::new("/nonexistent/000000.cfb"), None);
        assert!(matches!(err, Err(Error::ChunkNotFound { .. })));
    }

    #[test]
    fn listing_is_lexicographic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlockStore;
        for i in [2usize, 0, 1, 10] {
            store.write(&dir.path().join(chunk_file_name(i, "cfb")), &sample())?;
        }
        fs::write(dir.path().join("notes.txt"), b"ignored")?;
        let names: Vec<String> = store
            .list_chunks(dir.path())?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["000000.cfb", "000001.cfb", "000002.cfb", "000010.cfb"]
        );
        Ok(())
    }
}
