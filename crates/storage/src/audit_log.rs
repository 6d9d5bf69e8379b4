// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL audit log with group commit support.
//!
//! Entries are durably stored before the corresponding in-memory mutation
//! becomes visible, enabling crash recovery via checkpoint + replay and
//! post-hoc rollback. Group commit batches writes (~10ms) for performance.
//!
//! Each entry is a single line of JSON holding one [`AuditEntry`]; `seq` is
//! assigned at append time and is strictly monotonically increasing.

use fm_core::{AuditEntry, EntityKind};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Flush interval for group commit (~10ms batches)
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum entries to buffer before forcing flush
const FLUSH_THRESHOLD: usize = 100;

/// Errors that can occur in audit log operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only JSONL audit log with group commit.
///
/// Entries are buffered in memory and flushed to disk either when
/// `needs_flush()` reports the interval elapsed or the buffer filled, or
/// explicitly via `flush()` (the durability point).
pub struct AuditLog {
    file: File,
    path: PathBuf,
    /// Highest sequence number assigned so far
    last_seq: u64,
    /// Buffered JSON lines waiting to be flushed (without trailing newline)
    write_buffer: Vec<Vec<u8>>,
    last_flush: Instant,
}

impl AuditLog {
    /// Open or create an audit log at the given path.
    ///
    /// Scans existing entries to find the highest assigned sequence. A
    /// corrupt tail is rotated to `.bak`, preserving the valid prefix.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;

        let (mut last_seq, corrupt) = Self::scan(&file)?;

        if corrupt {
            let valid_lines = Self::read_valid_lines(&file)?;
            drop(file);

            let bak_path = crate::checkpoint::rotate_bak_path(path);
            warn!(
                path = %path.display(),
                bak = %bak_path.display(),
                valid_entries = valid_lines.len(),
                "Corrupt audit log detected, rotating to .bak and preserving valid entries",
            );
            std::fs::rename(path, &bak_path)?;

            {
                let mut new_file = File::create(path)?;
                for line in &valid_lines {
                    new_file.write_all(line.as_bytes())?;
                    new_file.write_all(b"\n")?;
                }
                new_file.sync_all()?;
            }

            file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
            last_seq = Self::scan(&file)?.0;
        }

        Ok(Self {
            file,
            path: path.to_owned(),
            last_seq,
            write_buffer: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    /// Scan the log for the highest sequence number.
    ///
    /// Returns `(max_seq, corrupt)` where `corrupt` is true if a parse
    /// error was encountered (not just EOF).
    fn scan(file: &File) -> Result<(u64, bool), AuditError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut max_seq = 0u64;
        let mut corrupt = false;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    corrupt = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let entry: AuditEntry = match serde_json::from_str(trimmed) {
                Ok(e) => e,
                Err(_) => {
                    corrupt = true;
                    break;
                }
            };

            max_seq = max_seq.max(entry.seq);
        }

        Ok((max_seq, corrupt))
    }

    /// Read all valid (parseable) lines, stopping at the first corrupt entry.
    fn read_valid_lines(file: &File) -> Result<Vec<String>, AuditError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut valid_lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let _: AuditEntry = match serde_json::from_str(trimmed) {
                Ok(e) => e,
                Err(_) => break,
            };

            valid_lines.push(trimmed.to_string());
        }

        Ok(valid_lines)
    }

    /// Append an entry, assigning the next sequence number.
    ///
    /// Returns the assigned sequence. The entry is NOT durable until
    /// `flush()` is called.
    pub fn append(&mut self, mut entry: AuditEntry) -> Result<u64, AuditError> {
        self.last_seq += 1;
        entry.seq = self.last_seq;
        let json_bytes = serde_json::to_vec(&entry)?;
        self.write_buffer.push(json_bytes);
        Ok(entry.seq)
    }

    /// Check if flush is needed (interval elapsed or buffer full).
    pub fn needs_flush(&self) -> bool {
        !self.write_buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL
                || self.write_buffer.len() >= FLUSH_THRESHOLD)
    }

    /// Flush all buffered entries to disk with a single fsync.
    ///
    /// This is the durability point - after flush returns successfully,
    /// all buffered entries are guaranteed to be on disk.
    pub fn flush(&mut self) -> Result<(), AuditError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        for mut json_bytes in self.write_buffer.drain(..) {
            json_bytes.push(b'\n');
            self.file.write_all(&json_bytes)?;
        }

        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Highest sequence number assigned so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Iterate over all entries with `seq > after`, in sequence order.
    ///
    /// Used for recovery (replaying from a checkpoint). Flushes buffered
    /// writes first so they are readable.
    pub fn entries_after(&mut self, after: u64) -> Result<Vec<AuditEntry>, AuditError> {
        self.flush()?;
        self.read_entries(|entry| entry.seq > after)
    }

    /// Range-scan entries for one entity, optionally bounded by `up_to` seq.
    ///
    /// Used by rollback to reconstruct a prior entity version.
    pub fn entries_for(
        &mut self,
        entity: EntityKind,
        entity_id: &str,
        up_to: Option<u64>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        self.flush()?;
        self.read_entries(|entry| {
            entry.entity == entity
                && entry.entity_id == entity_id
                && up_to.map(|bound| entry.seq <= bound).unwrap_or(true)
        })
    }

    fn read_entries(
        &self,
        keep: impl Fn(&AuditEntry) -> bool,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let entry: AuditEntry = match serde_json::from_str(trimmed) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Corrupt audit entry during scan, stopping at corruption point");
                    break;
                }
            };

            if keep(&entry) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Drop entries below the given sequence number.
    ///
    /// Called after a successful checkpoint to reclaim disk space. Creates
    /// a new log file holding only entries with `seq >= keep_from`.
    pub fn truncate_before(&mut self, keep_from: u64) -> Result<(), AuditError> {
        self.flush()?;

        let kept = self.read_entries(|entry| entry.seq >= keep_from)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            for entry in &kept {
                let json_bytes = serde_json::to_vec(entry)?;
                tmp_file.write_all(&json_bytes)?;
                tmp_file.write_all(b"\n")?;
            }
            tmp_file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().create(true).read(true).append(true).open(&self.path)?;

        Ok(())
    }
}

#[cfg(test)]
#[path = "audit_log_tests.rs"]
mod tests;
