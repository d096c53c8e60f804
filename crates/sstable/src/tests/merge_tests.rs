use crate::*;
use anyhow::Result;
use memtable::IndexEntry;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn build(dir: &Path, name: &str, entries: Vec<IndexEntry>) -> Result<Arc<SSTable>> {
    Ok(Arc::new(SSTableWriter::build(entries, &dir.join(name), 4)?))
}

fn all_entries(t: &Arc<SSTable>) -> Result<Vec<IndexEntry>> {
    Ok(t.iter()?.collect::<memtable::Result<_>>()?)
}

fn keep_all(_: &IndexEntry) -> bool {
    true
}

// -------------------- basic merge --------------------

#[test]
fn merge_four_tables_with_predicate() -> Result<()> {
    let dir = tempdir()?;
    let mut tables = Vec::new();
    for i in 0..4u32 {
        let entries = (0..10i64)
            .map(|j| IndexEntry::new(i, j, 10 * i as i64 + j))
            .collect();
        tables.push(build(dir.path(), &format!("in{}.sst", i), entries)?);
    }

    let even = |e: &IndexEntry| e.position % 2 == 0;
    let merged = Arc::new(merge_tables(&tables, &dir.path().join("out.sst"), 4, &even)?);

    assert_eq!(merged.len(), 20);
    let all = all_entries(&merged)?;
    assert!(all.iter().all(|e| e.position % 2 == 0));
    for pair in all.windows(2) {
        assert!(pair[0] > pair[1]);
    }
    merged.verify_integrity()?;
    Ok(())
}

#[test]
fn merge_interleaves_overlapping_tables() -> Result<()> {
    let dir = tempdir()?;
    let a = build(
        dir.path(),
        "a.sst",
        vec![IndexEntry::new(5, 0, 1), IndexEntry::new(5, 2, 3), IndexEntry::new(1, 0, 7)],
    )?;
    let b = build(
        dir.path(),
        "b.sst",
        vec![IndexEntry::new(5, 1, 2), IndexEntry::new(9, 0, 0), IndexEntry::new(5, 2, 4)],
    )?;

    let merged = Arc::new(merge_tables(&[a, b], &dir.path().join("ab.sst"), 4, &keep_all)?);
    assert_eq!(
        all_entries(&merged)?,
        vec![
            IndexEntry::new(9, 0, 0),
            IndexEntry::new(5, 2, 4),
            IndexEntry::new(5, 2, 3),
            IndexEntry::new(5, 1, 2),
            IndexEntry::new(5, 0, 1),
            IndexEntry::new(1, 0, 7),
        ]
    );
    Ok(())
}

#[test]
fn exact_duplicates_across_inputs_are_written_once() -> Result<()> {
    let dir = tempdir()?;
    let a = build(dir.path(), "a.sst", vec![IndexEntry::new(3, 1, 10), IndexEntry::new(3, 0, 5)])?;
    let b = build(dir.path(), "b.sst", vec![IndexEntry::new(3, 1, 10)])?;
    let c = build(dir.path(), "c.sst", vec![IndexEntry::new(3, 1, 10), IndexEntry::new(3, 0, 5)])?;

    let merged = Arc::new(merge_tables(&[a, b, c], &dir.path().join("d.sst"), 4, &keep_all)?);
    assert_eq!(
        all_entries(&merged)?,
        vec![IndexEntry::new(3, 1, 10), IndexEntry::new(3, 0, 5)]
    );
    Ok(())
}

#[test]
fn collision_across_tables_prefers_newer_position() -> Result<()> {
    let dir = tempdir()?;
    let older = build(dir.path(), "old.sst", vec![IndexEntry::new(0xDEAD, 0, 100)])?;
    let newer = build(dir.path(), "new.sst", vec![IndexEntry::new(0xDEAD, 0, 200)])?;

    let merged = merge_tables(&[older, newer], &dir.path().join("m.sst"), 4, &keep_all)?;
    assert_eq!(merged.lookup_exact(0xDEAD, 0)?, Some(200));
    assert_eq!(merged.len(), 2);
    Ok(())
}

#[test]
fn merge_dropping_everything_yields_empty_table() -> Result<()> {
    let dir = tempdir()?;
    let a = build(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 1)])?;
    let none = |_: &IndexEntry| false;
    let merged = merge_tables(&[a], &dir.path().join("empty.sst"), 4, &none)?;
    assert!(merged.is_empty());
    merged.verify_integrity()?;
    assert_eq!(merged.latest_entry(1)?, None);
    Ok(())
}

#[test]
fn merge_leaves_inputs_untouched() -> Result<()> {
    let dir = tempdir()?;
    let a = build(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 1)])?;
    let b = build(dir.path(), "b.sst", vec![IndexEntry::new(2, 0, 2)])?;
    let _ = merge_tables(&[a.clone(), b.clone()], &dir.path().join("ab.sst"), 4, &keep_all)?;

    assert_eq!(a.ref_count(), 0, "merge must release its handles");
    assert_eq!(b.ref_count(), 0);
    assert_eq!(a.lookup_exact(1, 0)?, Some(1));
    assert_eq!(b.lookup_exact(2, 0)?, Some(2));
    Ok(())
}

#[test]
fn merge_iterator_is_lazy_and_ordered() -> Result<()> {
    let dir = tempdir()?;
    let tables: Vec<Arc<SSTable>> = (0..3u32)
        .map(|i| {
            build(
                dir.path(),
                &format!("{}.sst", i),
                (0..100i64).map(|v| IndexEntry::new(i % 2, v, v * 3 + i as i64)).collect(),
            )
        })
        .collect::<Result<_>>()?;

    let mut iter = MergeIterator::new(&tables, &keep_all)?;
    let mut prev: Option<IndexEntry> = None;
    let mut n = 0;
    while let Some(e) = iter.next_entry()? {
        if let Some(p) = prev {
            assert!(p > e);
        }
        prev = Some(e);
        n += 1;
    }
    assert_eq!(n, 300);
    Ok(())
}
