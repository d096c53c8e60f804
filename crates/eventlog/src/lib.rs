//! # Event log
//!
//! A minimal append-only log of `(stream hash, version)` events, used to
//! drive and recover the stream index. The byte offset at which a record
//! starts is its log position; every record commits itself, so its commit
//! position equals its position.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][stream: u32 LE][version: i64 LE]
//! ```
//!
//! `record_len` covers the CRC and the body but not itself, so it is always
//! 16. A partially written record at the tail (crash mid-append) is treated
//! as the end of the log and cut off when a writer reopens the file.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventlog::{EventLogWriter, EventRecord, EventLog};
//!
//! let mut w = EventLogWriter::create("events.log", true).unwrap();
//! let pos = w.append(&EventRecord { stream: 7, version: 0 }).unwrap();
//! assert_eq!(pos, 0);
//! drop(w);
//!
//! let log = EventLog::new("events.log");
//! let events = log.read_all().unwrap();
//! assert_eq!(events.len(), 1);
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use engine::{LogReader, LogRecord};
use memtable::IndexError;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Body bytes: stream hash + version.
const BODY_LEN: usize = 4 + 8;
/// Value of the `record_len` field.
const RECORD_LEN: u32 = BODY_LEN as u32 + 4;
/// Bytes a record occupies on disk.
pub const FRAME_LEN: u64 = 4 + RECORD_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub stream: u32,
    pub version: i64,
}

/// Errors that can occur while reading or writing the log.
#[derive(Debug, Error)]
pub enum LogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or has an impossible length.
    #[error("corrupt record at position {0}")]
    Corrupt(u64),

    /// Rejected before anything was written.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl From<LogError> for IndexError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(io) => IndexError::Io(io),
            other => IndexError::RecoveryFailed(other.to_string()),
        }
    }
}

/// Append-only log writer.
///
/// Each record is framed in a reusable buffer and written with a single
/// `write_all`. With `sync`, every append is followed by `fsync`.
pub struct EventLogWriter {
    file: File,
    sync: bool,
    buf: Vec<u8>,
    position: u64,
}

impl EventLogWriter {
    /// Opens (or creates) the log for appending. A torn record at the tail
    /// is truncated away first.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, LogError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let end = valid_end(path)?;
        if end < len {
            warn!(path = %path.display(), len, end, "truncating torn record at log tail");
            file.set_len(end)?;
        }
        Ok(Self {
            file,
            sync,
            buf: Vec::with_capacity(FRAME_LEN as usize),
            position: end,
        })
    }

    /// Appends `record` and returns its position.
    pub fn append(&mut self, record: &EventRecord) -> Result<u64, LogError> {
        if record.version < 0 {
            return Err(LogError::InvalidRecord(format!(
                "version must be >= 0, got {}",
                record.version
            )));
        }

        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 8]);
        self.buf.write_u32::<LittleEndian>(record.stream)?;
        self.buf.write_i64::<LittleEndian>(record.version)?;

        let mut hasher = Crc32::new();
        hasher.update(&self.buf[8..]);
        let crc = hasher.finalize();
        self.buf[0..4].copy_from_slice(&RECORD_LEN.to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_all()?;
        }

        let position = self.position;
        self.position += FRAME_LEN;
        Ok(position)
    }

    /// Position the next record will get, i.e. the end of the log.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn sync_to_disk(&mut self) -> Result<(), LogError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// End of the last complete record in the file at `path` (0 if missing).
fn valid_end(path: &Path) -> Result<u64, LogError> {
    let mut reader = match EventLogReader::open(path, 0) {
        Ok(r) => r,
        Err(LogError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    while reader.next_record()?.is_some() {}
    Ok(reader.position())
}

/// Sequential reader over any `Read` implementor.
pub struct EventLogReader<R: Read> {
    rdr: BufReader<R>,
    position: u64,
}

impl EventLogReader<File> {
    /// Opens the log and positions the reader at `from`, which must be a
    /// record boundary.
    pub fn open<P: AsRef<Path>>(path: P, from: u64) -> Result<Self, LogError> {
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(from))?;
        Ok(Self::from_reader(f, from))
    }
}

impl<R: Read> EventLogReader<R> {
    /// `reader` must already be at `position`.
    pub fn from_reader(reader: R, position: u64) -> Self {
        Self {
            rdr: BufReader::new(reader),
            position,
        }
    }

    /// End of the last record read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record and its position. `None` at the end of the
    /// log, including a torn tail.
    pub fn next_record(&mut self) -> Result<Option<(u64, EventRecord)>, LogError> {
        let record_len = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        };
        if record_len != RECORD_LEN {
            return Err(LogError::Corrupt(self.position));
        }

        let mut frame = [0u8; 4 + BODY_LEN];
        match self.rdr.read_exact(&mut frame) {
            Ok(()) => {}
            // truncated tail
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        }

        let mut hasher = Crc32::new();
        hasher.update(&frame[4..]);
        let crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if hasher.finalize() != crc {
            return Err(LogError::Corrupt(self.position));
        }

        let mut body = &frame[4..];
        let stream = body.read_u32::<LittleEndian>()?;
        let version = body.read_i64::<LittleEndian>()?;
        let position = self.position;
        self.position += FRAME_LEN;
        Ok(Some((position, EventRecord { stream, version })))
    }

    /// Calls `apply` for every remaining record.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), LogError>
    where
        F: FnMut(u64, EventRecord),
    {
        while let Some((position, record)) = self.next_record()? {
            apply(position, record);
        }
        Ok(())
    }
}

/// A log file as seen by the index.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record with its position. A missing file reads as empty.
    pub fn read_all(&self) -> Result<Vec<(u64, EventRecord)>, LogError> {
        let mut reader = match EventLogReader::open(&self.path, 0) {
            Ok(r) => r,
            Err(LogError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        reader.replay(|p, r| out.push((p, r)))?;
        Ok(out)
    }
}

impl LogReader for EventLog {
    fn replay(
        &self,
        from: i64,
        to: i64,
        visit: &mut dyn FnMut(LogRecord) -> memtable::Result<()>,
    ) -> memtable::Result<i64> {
        // every record commits itself, so nothing before `from` is pending
        let from = from.max(0);
        let mut reader = match EventLogReader::open(&self.path, from as u64) {
            Ok(r) => r,
            Err(LogError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut visited = 0u64;
        while let Some((position, record)) = reader.next_record()? {
            // positions stay far below i64::MAX
            let position = position as i64;
            if position >= to {
                return Ok(position);
            }
            visit(LogRecord {
                commit_position: position,
                stream: record.stream,
                version: record.version,
                position,
            })?;
            visited += 1;
        }
        debug!(path = %self.path.display(), from, visited, "log replay reached end");
        Ok(reader.position() as i64)
    }
}
