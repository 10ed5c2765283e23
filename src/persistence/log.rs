//! Append-only mutation log with crash-safe replay.
//!
//! The log is JSON Lines: one [`LogRecord`] per line. A crash mid-write leaves
//! at most one partial trailing line, which replay detects and truncates so the
//! file always holds a valid prefix.
//!
//! # fsync Strategy
//!
//! - Critical records: `sync_all()` immediately after the write
//! - Non-critical records: no fsync; they reach disk with the next critical
//!   record or an explicit [`MutationLog::sync`]

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::atomic::fsync_file;
use super::mutation::{LogRecord, StoreMutation};

/// Errors that can occur during mutation log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for mutation log operations.
pub type Result<T> = std::result::Result<T, EventLogError>;

/// Records recovered by [`MutationLog::replay_from`].
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<LogRecord>,
    /// One past the highest sequence number seen, if any record was read.
    pub next_seq: Option<u64>,
}

/// An append-only mutation log.
pub struct MutationLog {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl MutationLog {
    /// Opens (creating if needed) a log ready to append at `next_seq`.
    ///
    /// Call [`MutationLog::replay_from`] first on an existing file so that any
    /// partial trailing line has been truncated.
    pub fn open(path: impl AsRef<Path>, next_seq: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok(MutationLog {
            file,
            path,
            next_seq,
        })
    }

    /// Appends a mutation stamped with `ts`, syncing if it is critical.
    pub fn append(&mut self, mutation: StoreMutation, ts: DateTime<Utc>) -> Result<LogRecord> {
        let record = LogRecord {
            seq: self.next_seq,
            ts,
            mutation,
        };

        let json = serde_json::to_string(&record)?;
        writeln!(self.file, "{}", json)?;

        if record.is_critical() {
            fsync_file(&self.file)?;
        }

        self.next_seq += 1;
        Ok(record)
    }

    /// Forces pending non-critical records to disk.
    pub fn sync(&self) -> io::Result<()> {
        fsync_file(&self.file)
    }

    /// Current byte length of the log, recorded as `log_position` in snapshots.
    pub fn position(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays records from a byte offset, truncating any invalid tail.
    ///
    /// A missing file or an offset at or past EOF yields an empty replay.
    /// Reading stops at the first line that does not parse or whose sequence
    /// number does not increase; the file is cut at the start of that line.
    pub fn replay_from(path: impl AsRef<Path>, offset: u64) -> Result<Replay> {
        let path = path.as_ref();

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(Replay::default());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;

        let mut records = Vec::new();
        let mut valid_end = offset;
        let mut pos = offset;
        let mut max_seq: Option<u64> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            pos += read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                valid_end = pos;
                continue;
            }
            // A line without its newline was cut off mid-write even if it
            // happens to parse.
            if !line.ends_with('\n') {
                break;
            }

            match serde_json::from_str::<LogRecord>(trimmed) {
                Ok(record) if max_seq.is_none_or(|prev| record.seq > prev) => {
                    max_seq = Some(record.seq);
                    records.push(record);
                    valid_end = pos;
                }
                _ => break,
            }
        }

        if valid_end < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_end)?;
            fsync_file(&file)?;
        }

        Ok(Replay {
            records,
            next_seq: max_seq.map(|s| s + 1),
        })
    }
}
