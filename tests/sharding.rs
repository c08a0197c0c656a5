use chunkframe::testing::*;
use chunkframe::{
    Agg, BlockStore, Engine, Error, ExecConfig, SerialPool, Table, Value, col, from_chunks, lit,
    open,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn chunk_ids(part: &Table) -> HashSet<Value> {
    part.column("id")
        .map(|c| c.values.iter().cloned().collect())
        .unwrap_or_default()
}

/// The three-chunk scenario: after a hard group-by on `id`, every output
/// chunk holds all rows for any `id` it contains, and nothing is lost.
#[test]
fn hard_group_by_co_locates_every_key() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![
            str_col("id", &["a", "a", "b", "d"]),
            int_col("n", &[1, 2, 3, 4]),
        ]),
        table_of(vec![
            str_col("id", &["a", "a", "b", "d"]),
            int_col("n", &[4, 5, 6, 7]),
        ]),
        table_of(vec![
            str_col("id", &["a", "b", "c"]),
            int_col("n", &[4, 5, 6]),
        ]),
    ];
    let original = Table::rbind(parts.clone())?;
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?;

    let sharded = frame.group_by(&["id"], true)?.ungroup();
    assert_eq!(sharded.n_chunks()?, 3);

    let chunks = sharded.clone().collect_list()?;
    for (i, left) in chunks.iter().enumerate() {
        for right in &chunks[i + 1..] {
            let shared: Vec<_> = chunk_ids(left).intersection(&chunk_ids(right)).cloned().collect();
            assert!(shared.is_empty(), "ids split across chunks: {shared:?}");
        }
    }

    // The 11-row (id, n) multiset survives the rewrite.
    assert_tables_equal_unordered(&sharded.collect()?, &original);
    Ok(())
}

#[test]
fn co_location_holds_for_skewed_keys() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let ids: Vec<String> = (0..60).map(|i| format!("k{}", i % 7)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let data = table_of(vec![
        str_col("id", &id_refs),
        int_col("n", &(0..60).collect::<Vec<_>>()),
    ]);
    let frame = chunkframe::from_table(&engine, &data, dd.dataset("ds"), 4, false)?;

    let sharded = frame.group_by(&["id"], true)?.ungroup();
    let mut seen: HashMap<Value, usize> = HashMap::new();
    for (i, part) in sharded.collect_list()?.iter().enumerate() {
        for id in chunk_ids(part) {
            if let Some(prev) = seen.insert(id.clone(), i) {
                panic!("id {id:?} found in chunks {prev} and {i}");
            }
        }
    }
    assert_eq!(seen.len(), 7);
    Ok(())
}

#[test]
fn hard_summarize_yields_one_row_per_key() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![
            str_col("id", &["a", "a", "b", "d"]),
            int_col("n", &[1, 2, 3, 4]),
        ]),
        table_of(vec![
            str_col("id", &["a", "a", "b", "d"]),
            int_col("n", &[4, 5, 6, 7]),
        ]),
        table_of(vec![
            str_col("id", &["a", "b", "c"]),
            int_col("n", &[4, 5, 6]),
        ]),
    ];
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?;

    let out = frame
        .group_by(&["id"], true)?
        .summarize(vec![("total", Agg::sum("n"))])
        .collect()?;

    let expected = table_of(vec![
        str_col("id", &["a", "b", "c", "d"]),
        int_col("total", &[16, 14, 6, 11]),
    ]);
    assert_tables_equal_unordered(&out, &expected);
    Ok(())
}

/// Bucket assignment depends only on the key values, so two datasets that
/// share ids land them at the same chunk index regardless of their other
/// columns.
#[test]
fn bucket_assignment_ignores_unrelated_columns() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let config = ExecConfig {
        target_chunks: Some(4),
        ..ExecConfig::default()
    };
    let engine = Engine::with_adapters(Arc::new(BlockStore), Arc::new(SerialPool), config);

    let a = table_of(vec![
        str_col("id", &["a", "b", "c", "d", "e"]),
        int_col("x", &[1, 2, 3, 4, 5]),
    ]);
    let b = table_of(vec![
        str_col("id", &["e", "d", "c", "b", "a"]),
        float_col("y", &[0.1, 0.2, 0.3, 0.4, 0.5]),
    ]);
    let fa = chunkframe::from_table(&engine, &a, dd.dataset("a"), 2, false)?
        .group_by(&["id"], true)?
        .ungroup();
    let fb = chunkframe::from_table(&engine, &b, dd.dataset("b"), 3, false)?
        .group_by(&["id"], true)?
        .ungroup();

    let map_of = |frame: chunkframe::ChunkFrame| -> chunkframe::Result<HashMap<Value, usize>> {
        let mut m = HashMap::new();
        for (i, part) in frame.collect_list()?.iter().enumerate() {
            for id in chunk_ids(part) {
                m.insert(id, i);
            }
        }
        Ok(m)
    };
    assert_eq!(map_of(fa)?, map_of(fb)?);
    Ok(())
}

#[test]
fn empty_buckets_are_written_as_empty_chunks() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![str_col("id", &["a", "a"]), int_col("n", &[1, 2])]),
        table_of(vec![str_col("id", &["a"]), int_col("n", &[3])]),
        table_of(vec![str_col("id", &["a"]), int_col("n", &[4])]),
    ];
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?;

    let sharded = frame.group_by(&["id"], true)?.ungroup();
    assert_eq!(sharded.n_chunks()?, 3);

    let chunks = sharded.collect_list()?;
    let sizes: Vec<usize> = chunks.iter().map(Table::n_rows).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 4);
    assert_eq!(sizes.iter().filter(|&&s| s > 0).count(), 1);
    // Empty chunks still carry the schema.
    for part in &chunks {
        assert_eq!(part.names(), vec!["id", "n"]);
    }
    Ok(())
}

#[test]
fn repartition_forces_the_pending_log() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![str_col("id", &["a", "b"]), int_col("n", &[1, 2])]),
        table_of(vec![str_col("id", &["a", "b"]), int_col("n", &[3, 4])]),
    ];
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?
        .mutate(vec![("m", col("n").mul(lit(10)))]);

    let sharded = frame.group_by(&["id"], true)?.ungroup();
    // The log was consumed by the rewrite, not carried forward.
    assert!(sharded.operations().is_empty());

    let expected = table_of(vec![
        str_col("id", &["a", "b", "a", "b"]),
        int_col("n", &[1, 2, 3, 4]),
        int_col("m", &[10, 20, 30, 40]),
    ]);
    assert_tables_equal_unordered(&sharded.collect()?, &expected);
    Ok(())
}

/// A write failure mid-repartition must leave the original chunk set fully
/// intact, with no partial output visible anywhere.
#[test]
fn failed_repartition_leaves_the_dataset_intact() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let dir = dd.dataset("ds");
    let plain = probe_engine();
    let parts = vec![
        table_of(vec![str_col("id", &["a", "b"]), int_col("n", &[1, 2])]),
        table_of(vec![str_col("id", &["c", "a"]), int_col("n", &[3, 4])]),
    ];
    let frame = from_chunks(&plain, parts.clone(), &dir, false)?;
    let before = frame.collect()?;

    // One bucket write succeeds, the next fails.
    let flaky = Engine::with_adapters(
        Arc::new(FlakyStore::failing_after(Arc::new(BlockStore), 1)),
        Arc::new(SerialPool),
        ExecConfig::default(),
    );
    let err = open(&flaky, &dir)?.group_by(&["id"], true).unwrap_err();
    assert!(matches!(err, Error::Repartition { .. }), "got {err}");

    // Original chunks untouched, staging cleaned up.
    let reopened = open(&plain, &dir)?;
    assert_eq!(reopened.n_chunks()?, 2);
    assert_tables_equal(&reopened.collect()?, &before);
    let entries: Vec<_> = std::fs::read_dir(dd.path())?
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["ds"], "leftover staging state: {entries:?}");
    Ok(())
}
