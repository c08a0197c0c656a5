use chunkframe::testing::*;
use chunkframe::{Agg, Column, Error, SortKey, Value, col, from_chunks, from_table, lit};

fn keys(frame: &chunkframe::ChunkFrame) -> Vec<&str> {
    frame.shard_keys().iter().map(String::as_str).collect()
}

#[test]
fn verb_chain_replays_per_chunk() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "b", "c", "d"]),
        int_col("n", &[1, 2, 3, 4]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 2, false)?;

    let out = frame
        .filter(col("n").ge(lit(2)))
        .mutate(vec![("m", col("n").mul(lit(10)))])
        .select(&["id", "m"])
        .collect()?;

    let expected = table_of(vec![
        str_col("id", &["b", "c", "d"]),
        int_col("m", &[20, 30, 40]),
    ]);
    assert_tables_equal(&out, &expected);
    Ok(())
}

#[test]
fn appending_a_verb_leaves_the_old_handle_untouched() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![int_col("n", &[1, 2, 3, 4, 5])]);
    let base = from_table(&engine, &data, dd.dataset("ds"), 2, false)?;

    let filtered = base.clone().filter(col("n").gt(lit(3)));

    assert_eq!(base.operations().len(), 0);
    assert_eq!(filtered.operations().len(), 1);
    assert_eq!(base.clone().collect()?.n_rows(), 5);
    assert_eq!(filtered.collect()?.n_rows(), 2);
    Ok(())
}

#[test]
fn rename_and_transmute() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "b"]),
        int_col("n", &[3, 4]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 1, false)?;

    let out = frame
        .rename(&[("n", "count")])
        .transmute(vec![("id", col("id")), ("double", col("count").add(col("count")))])
        .collect()?;

    let expected = table_of(vec![
        str_col("id", &["a", "b"]),
        int_col("double", &[6, 8]),
    ]);
    assert_tables_equal(&out, &expected);
    Ok(())
}

#[test]
fn arrange_sorts_within_chunks_only() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![int_col("n", &[3, 1, 2])]),
        table_of(vec![int_col("n", &[9, 7, 8])]),
    ];
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?;

    let sorted = frame.arrange(vec![SortKey::desc("n")]);
    let chunks = sorted.clone().collect_list()?;
    assert_tables_equal(&chunks[0], &table_of(vec![int_col("n", &[3, 2, 1])]));
    assert_tables_equal(&chunks[1], &table_of(vec![int_col("n", &[9, 8, 7])]));

    // Concatenation follows chunk order: not a global sort.
    let out = sorted.collect()?;
    assert_tables_equal(&out, &table_of(vec![int_col("n", &[3, 2, 1, 9, 8, 7])]));
    Ok(())
}

#[test]
fn soft_group_by_aggregates_chunk_locally() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let parts = vec![
        table_of(vec![
            str_col("id", &["a", "a", "b"]),
            int_col("n", &[1, 2, 3]),
        ]),
        table_of(vec![str_col("id", &["b", "c"]), int_col("n", &[4, 5])]),
    ];
    let frame = from_chunks(&engine, parts, dd.dataset("ds"), false)?;

    let out = frame
        .group_by(&["id"], false)?
        .summarize(vec![("rows", Agg::Count), ("total", Agg::sum("n"))])
        .collect()?;

    // "b" straddles two chunks, so it shows up once per chunk.
    let expected = table_of(vec![
        str_col("id", &["a", "b", "b", "c"]),
        int_col("rows", &[2, 1, 1, 1]),
        int_col("total", &[3, 3, 4, 5]),
    ]);
    assert_tables_equal(&out, &expected);
    Ok(())
}

#[test]
fn summarize_handles_null_cells() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "a", "b"]),
        Column::new("n", vec![Value::Int(1), Value::Null, Value::Null]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 1, false)?;

    let out = frame
        .group_by(&["id"], false)?
        .summarize(vec![("total", Agg::sum("n")), ("rows", Agg::Count)])
        .collect()?;

    let expected = table_of(vec![
        str_col("id", &["a", "b"]),
        Column::new("total", vec![Value::Int(1), Value::Null]),
        int_col("rows", &[2, 1]),
    ]);
    assert_tables_equal(&out, &expected);
    Ok(())
}

#[test]
fn schema_errors_surface_at_collect_time() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![int_col("n", &[1, 2])]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 1, false)?;

    // Appending the bad verb succeeds; the error is reported at replay.
    let bad = frame.filter(col("nope").gt(lit(0)));
    let err = bad.collect().unwrap_err();
    match err {
        Error::Task { chunk, source } => {
            assert_eq!(chunk, "000000.cfb");
            match *source {
                Error::Schema { op, column } => {
                    assert_eq!(op, "filter");
                    assert_eq!(column, "nope");
                }
                other => panic!("expected schema error, got {other}"),
            }
        }
        other => panic!("expected task error, got {other}"),
    }
    Ok(())
}

#[test]
fn replaying_the_same_log_twice_is_deterministic() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "b", "a", "c"]),
        int_col("n", &[4, 3, 2, 1]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 2, false)?
        .filter(col("n").gt(lit(1)))
        .arrange(vec![SortKey::asc("n")]);

    let first = frame.clone().collect()?;
    let second = frame.collect()?;
    assert_tables_equal(&first, &second);
    Ok(())
}

#[test]
fn chunk_lookup_is_recoverable_for_missing_chunks() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![int_col("n", &[1, 2, 3, 4])]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 2, false)?;

    let frame = frame.mutate(vec![("m", col("n").mul(lit(2)))]);
    let first = frame.chunk(0)?.expect("chunk 0 exists");
    assert_eq!(first.names(), vec!["n", "m"]);
    assert_eq!(first.n_rows(), 2);

    assert!(frame.chunk(99)?.is_none());
    Ok(())
}

#[test]
fn keep_narrows_the_columns_read() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "b"]),
        int_col("n", &[1, 2]),
        float_col("f", &[0.5, 1.5]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 1, false)?;

    let out = frame.keep(&["n"]).collect()?;
    assert_eq!(out.names(), vec!["n"]);
    assert_eq!(out.n_rows(), 2);
    Ok(())
}

#[test]
fn empty_table_round_trips_with_schema() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![str_col("id", &[]), int_col("n", &[])]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 3, false)?;

    assert_eq!(frame.n_chunks()?, 1);
    let out = frame.collect()?;
    assert_eq!(out.names(), vec!["id", "n"]);
    assert_eq!(out.n_rows(), 0);
    Ok(())
}

#[test]
fn hard_group_by_certifies_and_verbs_invalidate() -> anyhow::Result<()> {
    let dd = DataDir::new()?;
    let engine = probe_engine();
    let data = table_of(vec![
        str_col("id", &["a", "b", "a", "c"]),
        int_col("n", &[1, 2, 3, 4]),
    ]);
    let frame = from_table(&engine, &data, dd.dataset("ds"), 2, false)?;
    assert!(frame.shard_keys().is_empty());

    let sharded = frame.group_by(&["id"], true)?.ungroup();
    assert_eq!(keys(&sharded), ["id"]);

    // Chunk-local reorders and key-preserving column ops keep the
    // certification.
    assert_eq!(keys(&sharded.clone().arrange(vec![SortKey::asc("n")])), ["id"]);
    assert_eq!(keys(&sharded.clone().select(&["id"])), ["id"]);
    assert_eq!(keys(&sharded.clone().rename(&[("n", "m")])), ["id"]);
    assert_eq!(
        keys(&sharded.clone().mutate(vec![("m", col("n").add(lit(1)))])),
        ["id"]
    );

    // Anything that could move or rewrite key cells clears it.
    assert!(keys(&sharded.clone().select(&["n"])).is_empty());
    assert!(keys(&sharded.clone().rename(&[("id", "key")])).is_empty());
    assert!(keys(&sharded.clone().mutate(vec![("id", lit("x"))])).is_empty());
    assert!(keys(&sharded.clone().filter(col("n").gt(lit(1)))).is_empty());
    assert!(keys(&sharded.clone().map(Ok)).is_empty());

    // Summarizing by a superset of the shard keys keeps rows co-located.
    let summarized = sharded
        .clone()
        .group_by(&["id"], false)?
        .summarize(vec![("total", Agg::sum("n"))]);
    assert_eq!(keys(&summarized), ["id"]);
    Ok(())
}
