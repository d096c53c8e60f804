use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

fn with_checksum(body: &str) -> String {
    format!("{:08X}\n{}", crc32fast::hash(body.as_bytes()), body)
}

#[test]
fn missing_file_loads_as_empty() -> Result<()> {
    let dir = tempdir()?;
    let m = TableManifest::load_from_file(&dir.path().join(MANIFEST_FILENAME), 4, 4, true)?;
    assert_eq!(m.table_count(), 0);
    assert_eq!(m.prepare_checkpoint(), -1);
    assert_eq!(m.commit_checkpoint(), -1);
    Ok(())
}

#[test]
fn empty_manifest_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    TableManifest::empty(4, 4).save_to_file(&path)?;

    let loaded = TableManifest::load_from_file(&path, 4, 4, true)?;
    assert_eq!(loaded.table_count(), 0);
    assert_eq!(loaded.prepare_checkpoint(), -1);
    assert_eq!(loaded.commit_checkpoint(), -1);
    assert!(!dir.path().join("MANIFEST.tmp").exists());
    Ok(())
}

#[test]
fn levels_and_checkpoints_survive_reload() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    let a = build_table(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 10)])?;
    let b = build_table(dir.path(), "b.sst", vec![IndexEntry::new(2, 0, 20)])?;
    let c = build_table(dir.path(), "c.sst", vec![IndexEntry::new(3, 0, 30)])?;

    let mut m = TableManifest::empty(4, 4);
    m.levels = vec![vec![a, b], vec![], vec![c]];
    m.prepare_checkpoint = 30;
    m.commit_checkpoint = 31;
    m.save_to_file(&path)?;

    let loaded = TableManifest::load_from_file(&path, 4, 4, true)?;
    assert_eq!(loaded.tables_per_level(), vec![2, 0, 1]);
    assert_eq!(loaded.prepare_checkpoint(), 30);
    assert_eq!(loaded.commit_checkpoint(), 31);
    let names: Vec<(usize, usize, String)> = loaded
        .entries()
        .map(|(l, i, t)| (l, i, t.file_name()))
        .collect();
    assert_eq!(
        names,
        vec![
            (0, 0, "a.sst".to_string()),
            (0, 1, "b.sst".to_string()),
            (2, 0, "c.sst".to_string()),
        ]
    );
    assert_eq!(loaded.levels()[2][0].lookup_exact(3, 0)?, Some(30));
    Ok(())
}

#[test]
fn rendered_text_has_expected_layout() -> Result<()> {
    let dir = tempdir()?;
    let a = build_table(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 10)])?;
    let mut m = TableManifest::empty(4, 4);
    m.levels = vec![vec![a]];
    m.prepare_checkpoint = 5;
    m.commit_checkpoint = 6;

    let text = m.render();
    let lines: Vec<&str> = text.split('\n').collect();
    assert_eq!(lines[1..], ["1", "5/6", "0,0,a.sst", ""]);
    assert_eq!(lines[0], format!("{:08X}", crc32fast::hash(text[9..].as_bytes())));
    Ok(())
}

#[test]
fn checksum_mismatch_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    TableManifest::empty(4, 4).save_to_file(&path)?;

    let text = fs::read_to_string(&path)?.replace("-1/-1", "-1/7");
    fs::write(&path, text)?;
    let err = TableManifest::load_from_file(&path, 4, 4, true).unwrap_err();
    assert!(matches!(err, IndexError::CorruptManifest(_)));
    assert!(err.is_corruption());
    Ok(())
}

#[test]
fn unknown_version_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    fs::write(&path, with_checksum("2\n-1/-1\n"))?;
    assert!(matches!(
        TableManifest::load_from_file(&path, 4, 4, true),
        Err(IndexError::CorruptManifest(_))
    ));
    Ok(())
}

#[test]
fn malformed_structure_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    build_table(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 10)])?;
    build_table(dir.path(), "b.sst", vec![IndexEntry::new(1, 1, 11)])?;

    for body in [
        "1\n",
        "1\nnot-a-checkpoint\n",
        "1\n0/0\n0,a.sst\n",
        "1\n0/0\n0,1,a.sst\n",
        "1\n0/0\n1,0,a.sst\n0,0,b.sst\n",
        "1\n0/0\n0,0,../a.sst\n",
        "1\n0/0\n0,0,a.sst",
    ] {
        fs::write(&path, with_checksum(body))?;
        assert!(
            matches!(
                TableManifest::load_from_file(&path, 4, 4, false),
                Err(IndexError::CorruptManifest(_))
            ),
            "body {:?} should be rejected",
            body
        );
    }
    Ok(())
}

#[test]
fn missing_table_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    fs::write(&path, with_checksum("1\n0/0\n0,0,gone.sst\n"))?;
    assert!(matches!(
        TableManifest::load_from_file(&path, 4, 4, true),
        Err(IndexError::CorruptManifest(_))
    ));
    Ok(())
}

#[test]
fn damaged_table_fails_verification() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    let table_path = dir.path().join("a.sst");
    build_table(dir.path(), "a.sst", vec![IndexEntry::new(1, 0, 10), IndexEntry::new(1, 1, 11)])?;
    fs::write(&path, with_checksum("1\n0/0\n0,0,a.sst\n"))?;

    let mut bytes = fs::read(&table_path)?;
    bytes[10] ^= 0x55;
    fs::write(&table_path, &bytes)?;

    let err = TableManifest::load_from_file(&path, 4, 4, true).unwrap_err();
    assert!(matches!(err, IndexError::CorruptIndex { .. }));
    // without verification the damage goes unnoticed at load time
    assert!(TableManifest::load_from_file(&path, 4, 4, false).is_ok());
    Ok(())
}
