//! Command parsing and execution for the REPL.

use anyhow::Result;
use engine::TableIndex;
use eventlog::{EventLogWriter, EventRecord};
use std::io::{self, Write};
use tracing::warn;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// `#<hex>` is taken as a raw hash, anything else is hashed by name.
pub fn stream_hash(arg: &str) -> Result<u32, String> {
    match arg.strip_prefix('#') {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| format!("bad stream hash '{}'", arg)),
        None => Ok(fnv1a32(arg.as_bytes())),
    }
}

fn number(arg: Option<&str>, what: &str, usage: &str) -> Result<i64, String> {
    let arg = arg.ok_or_else(|| format!("usage: {}", usage))?;
    arg.parse()
        .map_err(|_| format!("{} must be an integer, got '{}'", what, arg))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { stream: u32, version: i64 },
    Get { stream: u32, version: i64 },
    Latest(u32),
    Oldest(u32),
    Range { stream: u32, start: i64, end: i64 },
    Stats,
    Exit,
}

impl Command {
    /// `Ok(None)` for a blank line; `Err` carries the message to print.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };
        let cmd = cmd.to_uppercase();
        let usage = match cmd.as_str() {
            "ADD" => "ADD stream version",
            "GET" => "GET stream version",
            "LATEST" => "LATEST stream",
            "OLDEST" => "OLDEST stream",
            "RANGE" => "RANGE stream start end",
            _ => "",
        };
        let stream = |arg: Option<&str>| -> Result<u32, String> {
            stream_hash(arg.ok_or_else(|| format!("usage: {}", usage))?)
        };

        let parsed = match cmd.as_str() {
            "ADD" => Command::Add {
                stream: stream(parts.next())?,
                version: number(parts.next(), "version", usage)?,
            },
            "GET" => Command::Get {
                stream: stream(parts.next())?,
                version: number(parts.next(), "version", usage)?,
            },
            "LATEST" => Command::Latest(stream(parts.next())?),
            "OLDEST" => Command::Oldest(stream(parts.next())?),
            "RANGE" => Command::Range {
                stream: stream(parts.next())?,
                start: number(parts.next(), "start", usage)?,
                end: number(parts.next(), "end", usage)?,
            },
            "STATS" => Command::Stats,
            "EXIT" | "QUIT" => Command::Exit,
            _ => return Err(format!("unknown command: {}", cmd)),
        };
        if parts.next().is_some() && !matches!(parsed, Command::Stats | Command::Exit) {
            return Err(format!("usage: {}", usage));
        }
        Ok(Some(parsed))
    }
}

/// The index plus the log it is built from.
pub struct Shell {
    index: TableIndex,
    writer: EventLogWriter,
}

impl Shell {
    pub fn new(index: TableIndex, writer: EventLogWriter) -> Self {
        Self { index, writer }
    }

    /// Runs one command, writing its response to `out`. Command failures are
    /// reported as `ERR ...` lines; only failures to write `out` are returned.
    pub fn execute<W: Write>(&mut self, cmd: Command, out: &mut W) -> io::Result<()> {
        match cmd {
            Command::Add { stream, version } => {
                let position = match self.writer.append(&EventRecord { stream, version }) {
                    Ok(p) => p as i64,
                    Err(e) => {
                        warn!(stream, version, error = %e, "event log append failed");
                        return writeln!(out, "ERR append failed: {}", e);
                    }
                };
                match self.index.add(position, stream, version, position) {
                    Ok(()) => writeln!(out, "OK {}", position),
                    Err(e) => {
                        warn!(stream, version, position, error = %e, "indexing failed");
                        writeln!(out, "ERR index failed: {}", e)
                    }
                }
            }
            Command::Get { stream, version } => match self.index.lookup_exact(stream, version) {
                Ok(Some(position)) => writeln!(out, "{}", position),
                Ok(None) => writeln!(out, "(nil)"),
                Err(e) => writeln!(out, "ERR read failed: {}", e),
            },
            Command::Latest(stream) => self.print_entry(self.index.latest_entry(stream), out),
            Command::Oldest(stream) => self.print_entry(self.index.oldest_entry(stream), out),
            Command::Range { stream, start, end } => match self.index.range(stream, start, end) {
                Ok(entries) if entries.is_empty() => writeln!(out, "(empty)"),
                Ok(entries) => {
                    for e in &entries {
                        writeln!(out, "{} -> {}", e.version, e.position)?;
                    }
                    writeln!(out, "({} entries)", entries.len())
                }
                Err(e) => writeln!(out, "ERR range failed: {}", e),
            },
            Command::Stats => {
                writeln!(out, "{:?}", self.index)?;
                if let Some(err) = self.index.last_background_error() {
                    writeln!(out, "last background error: {}", err)?;
                }
                Ok(())
            }
            Command::Exit => Ok(()),
        }
    }

    fn print_entry<W: Write>(
        &self,
        entry: engine::Result<Option<engine::IndexEntry>>,
        out: &mut W,
    ) -> io::Result<()> {
        match entry {
            Ok(Some(e)) => writeln!(out, "{} {}", e.version, e.position),
            Ok(None) => writeln!(out, "(nil)"),
            Err(e) => writeln!(out, "ERR read failed: {}", e),
        }
    }

    /// Syncs the log and closes the index. The live memtable is not
    /// flushed; it is rebuilt from the log on the next start.
    pub fn shutdown(mut self) -> Result<()> {
        self.writer.sync_to_disk()?;
        self.index.close(false)?;
        Ok(())
    }
}
