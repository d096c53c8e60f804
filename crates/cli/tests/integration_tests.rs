/// End-to-end tests for the stream index shell.
/// Tests cover: add/get, latest/oldest, ranges, flushes and compaction, restart recovery, bad input
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Helper to run CLI commands and capture output
fn run_cli_command(dir: &Path, command: &str) -> String {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("cargo")
        .args(["run", "-q", "-p", "cli", "--"])
        .env("STREAMINDEX_DIR", dir.join("index").to_str().unwrap())
        .env("STREAMINDEX_LOG_PATH", dir.join("events.log").to_str().unwrap())
        .env("STREAMINDEX_MEMTABLE_SIZE", "4") // tiny memtables to force flushes
        .env("STREAMINDEX_TABLES_PER_LEVEL", "2") // merge every second table
        .env("STREAMINDEX_CACHE_DEPTH", "3")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn CLI");

    {
        let stdin = child.stdin.as_mut().expect("Failed to open stdin");
        stdin
            .write_all(command.as_bytes())
            .expect("Failed to write to stdin");
        stdin.write_all(b"EXIT\n").expect("Failed to write EXIT");
    }

    let output = child.wait_with_output().expect("Failed to read output");
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn count_sst_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map(|x| x == "sst").unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn test_add_and_get() {
    let dir = tempdir().unwrap();
    let output = run_cli_command(dir.path(), "ADD orders-1 0\nADD orders-1 1\nGET orders-1 1\n");

    assert!(output.contains("OK 0"));
    assert!(output.contains("OK 20"));
    assert!(output.contains("> 20\n"));
    assert!(output.contains("bye"));
}

#[test]
fn test_missing_version_is_nil() {
    let dir = tempdir().unwrap();
    let output = run_cli_command(dir.path(), "ADD s 0\nGET s 7\nGET other 0\n");
    assert_eq!(output.matches("(nil)").count(), 2);
}

#[test]
fn test_latest_and_oldest() {
    let dir = tempdir().unwrap();
    let commands = "ADD s 3\nADD s 1\nADD s 2\nLATEST s\nOLDEST s\nLATEST nobody\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("3 0\n"));
    assert!(output.contains("1 20\n"));
    assert!(output.contains("(nil)"));
}

#[test]
fn test_range_newest_first() {
    let dir = tempdir().unwrap();
    let mut commands = String::new();
    for v in 0..6 {
        commands.push_str(&format!("ADD s {}\n", v));
    }
    commands.push_str("RANGE s 2 4\nRANGE s 10 20\n");
    let output = run_cli_command(dir.path(), &commands);

    let r4 = output.find("4 -> 80").expect("version 4 listed");
    let r3 = output.find("3 -> 60").expect("version 3 listed");
    let r2 = output.find("2 -> 40").expect("version 2 listed");
    assert!(r4 < r3 && r3 < r2);
    assert!(output.contains("(3 entries)"));
    assert!(output.contains("(empty)"));
}

#[test]
fn test_raw_hash_streams() {
    let dir = tempdir().unwrap();
    let output = run_cli_command(dir.path(), "ADD #dead 0\nADD #DEAD 1\nLATEST #dead\n");
    assert!(output.contains("1 20\n"));
}

#[test]
fn test_flushes_create_tables() {
    let dir = tempdir().unwrap();
    let mut commands = String::new();
    for v in 0..12 {
        commands.push_str(&format!("ADD s {}\n", v));
    }
    commands.push_str("STATS\n");
    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("TableIndex"));
    let index_dir = dir.path().join("index");
    assert!(index_dir.join("MANIFEST").exists());
    // 3 flushes with fan-out 2: one level-1 table plus one level-0 table
    assert_eq!(count_sst_files(&index_dir), 2);
}

#[test]
fn test_recovery_across_restarts() {
    let dir = tempdir().unwrap();
    let mut commands = String::new();
    for v in 0..10 {
        commands.push_str(&format!("ADD s {}\n", v));
    }
    run_cli_command(dir.path(), &commands);

    // two tables persisted, the last two events only in the log
    let output = run_cli_command(dir.path(), "LATEST s\nGET s 0\nGET s 8\nRANGE s 0 100\n");
    assert!(output.contains("9 180\n"));
    assert!(output.contains("> 0\n"));
    assert!(output.contains("> 160\n"));
    assert!(output.contains("(10 entries)"));
}

#[test]
fn test_bad_input() {
    let dir = tempdir().unwrap();
    let output = run_cli_command(
        dir.path(),
        "ADD s\nADD s x\nGET s -1\nRANGE s 1\nFROB\n\nADD s 0\n",
    );

    assert_eq!(output.matches("ERR").count(), 5);
    assert!(output.contains("ERR unknown command: FROB"));
    assert!(output.contains("OK 0"));
}
