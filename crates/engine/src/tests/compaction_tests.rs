use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::tempdir;

/// Hands out paths in a directory that does not exist, so every write fails.
struct BrokenNames(PathBuf);

impl FileNameProvider for BrokenNames {
    fn next_path(&self) -> PathBuf {
        self.0.join("missing").join("x.sst")
    }
}

#[test]
fn full_level_merges_into_next() -> Result<()> {
    let dir = tempdir()?;
    let names = SequentialFileNames::new(dir.path(), "m");
    let mut manifest = TableManifest::empty(4, 4);

    let mut deleted = Vec::new();
    for i in 0..4u32 {
        let t = build_table(dir.path(), &format!("raw{}.sst", i), vec![IndexEntry::new(i, 0, i as i64)])?;
        let res = manifest.add_table(t, 0, 1, &keep_all, &names)?;
        if i < 3 {
            assert!(res.to_delete.is_empty());
            assert_eq!(res.manifest.tables_per_level(), vec![i as usize + 1]);
        }
        deleted = res.to_delete;
        manifest = res.manifest;
    }

    assert_eq!(deleted.len(), 4);
    assert_eq!(manifest.tables_per_level(), vec![0, 1]);
    assert_eq!(manifest.prepare_checkpoint(), 0);
    assert_eq!(manifest.commit_checkpoint(), 1);

    for t in &deleted {
        t.mark_for_destruction();
    }
    assert_eq!(count_sst_files(dir.path()), 1);

    let merged = &manifest.levels()[1][0];
    assert_eq!(merged.len(), 4);
    for i in 0..4u32 {
        assert_eq!(merged.lookup_exact(i, 0)?, Some(i as i64));
    }
    Ok(())
}

#[test]
fn merges_cascade_upward() -> Result<()> {
    let dir = tempdir()?;
    let names = SequentialFileNames::new(dir.path(), "m");
    let mut manifest = TableManifest::empty(2, 4);
    let mut deleted = 0;

    for i in 0..4i64 {
        let t = build_table(dir.path(), &format!("raw{}.sst", i), vec![IndexEntry::new(9, i, i * 10)])?;
        let res = manifest.add_table(t, i * 10, i, &keep_all, &names)?;
        deleted = res.to_delete.len();
        for t in &res.to_delete {
            t.mark_for_destruction();
        }
        manifest = res.manifest;
    }

    // the fourth add merges level 0, which fills level 1, which merges too
    assert_eq!(deleted, 4);
    assert_eq!(manifest.tables_per_level(), vec![0, 0, 1]);
    assert_eq!(count_sst_files(dir.path()), 1);
    assert_eq!(manifest.commit_checkpoint(), 3);

    let top = &manifest.levels()[2][0];
    let versions: Vec<i64> = top.iter()?.map(|e| e.map(|e| e.version)).collect::<memtable::Result<_>>()?;
    assert_eq!(versions, vec![3, 2, 1, 0]);
    Ok(())
}

#[test]
fn add_table_leaves_the_base_manifest_alone() -> Result<()> {
    let dir = tempdir()?;
    let names = SequentialFileNames::new(dir.path(), "m");
    let base = TableManifest::empty(4, 4);
    let t = build_table(dir.path(), "raw.sst", vec![IndexEntry::new(1, 0, 0)])?;

    let res = base.add_table(t.clone(), 0, 0, &keep_all, &names)?;
    assert_eq!(base.table_count(), 0);
    assert_eq!(base.commit_checkpoint(), -1);
    assert!(res.manifest.contains(&t));
    assert_eq!(res.manifest.tables_not_in(&base).len(), 1);
    Ok(())
}

#[test]
fn merge_drops_entries_the_predicate_rejects() -> Result<()> {
    let dir = tempdir()?;
    let names = SequentialFileNames::new(dir.path(), "m");
    let mut manifest = TableManifest::empty(2, 4);
    let keep_even_streams = |e: &IndexEntry| e.stream % 2 == 0;

    for i in 0..2u32 {
        let t = build_table(
            dir.path(),
            &format!("raw{}.sst", i),
            vec![IndexEntry::new(i, 0, 1), IndexEntry::new(i + 2, 0, 2)],
        )?;
        manifest = manifest.add_table(t, 2, 2, &keep_even_streams, &names)?.manifest;
    }

    let merged = &manifest.levels()[1][0];
    assert_eq!(merged.len(), 2);
    assert_eq!(merged.lookup_exact(0, 0)?, Some(1));
    assert_eq!(merged.lookup_exact(2, 0)?, Some(2));
    assert_eq!(merged.lookup_exact(1, 0)?, None);
    assert_eq!(merged.lookup_exact(3, 0)?, None);
    Ok(())
}

#[test]
fn failed_merge_reports_error_and_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let good = SequentialFileNames::new(dir.path(), "m");
    let broken = BrokenNames(dir.path().to_path_buf());

    let a = build_table(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 0)])?;
    let b = build_table(dir.path(), "b.sst", vec![IndexEntry::new(1, 1, 1)])?;
    let base = TableManifest::empty(2, 4).add_table(a, 0, 0, &keep_all, &good)?.manifest;

    let err = base.add_table(b.clone(), 1, 1, &keep_all, &broken).unwrap_err();
    assert!(matches!(err, IndexError::Io(_)));
    assert_eq!(base.tables_per_level(), vec![1]);
    assert_eq!(base.commit_checkpoint(), 0);
    // inputs are still usable
    assert_eq!(b.lookup_exact(1, 1)?, Some(1));
    assert_eq!(count_sst_files(dir.path()), 2);
    Ok(())
}

#[test]
fn negative_checkpoints_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let names = SequentialFileNames::new(dir.path(), "m");
    let t = build_table(dir.path(), "raw.sst", vec![IndexEntry::new(1, 0, 0)])?;
    let err = TableManifest::empty(4, 4)
        .add_table(Arc::clone(&t), -5, 0, &keep_all, &names)
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
    Ok(())
}
