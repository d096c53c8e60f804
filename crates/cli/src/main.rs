//! # CLI - stream index shell
//!
//! A REPL over an event log and the stream index built from it. Each `ADD`
//! appends an event to the log and indexes it; on startup the index replays
//! whatever part of the log it has not persisted yet. Reads commands from
//! stdin, so it works interactively and piped.
//!
//! ## Commands
//!
//! ```text
//! ADD stream version          Append an event, print its log position
//! GET stream version          Position of that version (or "(nil)")
//! LATEST stream               Highest version and its position
//! OLDEST stream               Lowest version and its position
//! RANGE stream start end      Versions start..=end, newest first
//! STATS                       Print index state
//! EXIT / QUIT                 Shut down gracefully
//! ```
//!
//! Stream names are hashed with 32-bit FNV-1a; `#1f2e3d4c` passes a raw
//! hash instead.
//!
//! ## Configuration
//!
//! The index reads the `STREAMINDEX_*` variables documented in the `config`
//! crate. The shell adds:
//!
//! ```text
//! STREAMINDEX_LOG_PATH  event log file           (default: "data/events.log")
//! STREAMINDEX_LOG_SYNC  fsync every log append   (default: "true")
//! RUST_LOG              tracing filter, stderr   (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! stream index started (dir=data/index, log=data/events.log, tables=0)
//! > ADD orders-1 0
//! OK 0
//! > GET orders-1 0
//! 0
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::{Context, Result};
use config::IndexConfig;
use engine::TableIndex;
use eventlog::{EventLog, EventLogWriter};
use shell::{Command, Shell};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let config = IndexConfig::from_env();
    let log_path = env_or("STREAMINDEX_LOG_PATH", "data/events.log");
    let log_sync: bool = env_or("STREAMINDEX_LOG_SYNC", "true").parse().unwrap_or(true);

    if let Some(parent) = Path::new(&log_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let writer = EventLogWriter::create(&log_path, log_sync)
        .with_context(|| format!("failed to open event log {}", log_path))?;

    let index = TableIndex::new(config, Arc::new(EventLog::new(&log_path)));
    index
        .initialize(writer.position() as i64)
        .context("failed to initialize stream index")?;

    info!(log = %log_path, log_position = writer.position(), "stream index initialized");
    println!(
        "stream index started (dir={}, log={}, tables={})",
        index.dir().display(),
        log_path,
        index.manifest().table_count()
    );
    println!("Commands: ADD stream version | GET stream version | LATEST stream | OLDEST stream");
    println!("          RANGE stream start end | STATS | EXIT");

    let mut shell = Shell::new(index, writer);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write!(out, "> ")?;
    out.flush()?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        match Command::parse(&line) {
            Ok(Some(Command::Exit)) => {
                writeln!(out, "bye")?;
                break;
            }
            Ok(Some(cmd)) => shell.execute(cmd, &mut out)?,
            Ok(None) => {}
            Err(msg) => writeln!(out, "ERR {}", msg)?,
        }
        write!(out, "> ")?;
        out.flush()?;
    }

    shell.shutdown()?;
    info!("stream index shut down");
    Ok(())
}
