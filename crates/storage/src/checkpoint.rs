// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State checkpoints: zstd-compressed JSON snapshots of [`MaterializedState`].
//!
//! A checkpoint bounds replay time after a crash and gates audit-log
//! truncation. One is also written before every rollback so the pre-rollback
//! state stays recoverable.

use crate::audit_log::AuditError;
use crate::state::MaterializedState;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// zstd level for checkpoint files; favors write speed over ratio.
const COMPRESSION_LEVEL: i32 = 3;

/// A persisted state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub taken_at_ms: u64,
    pub state: MaterializedState,
}

impl Checkpoint {
    pub fn new(taken_at_ms: u64, state: MaterializedState) -> Self {
        Self { taken_at_ms, state }
    }

    /// Sequence up to which the checkpoint covers the audit log.
    pub fn applied_seq(&self) -> u64 {
        self.state.applied_seq
    }

    /// Write the checkpoint atomically (tmp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut encoder = zstd::Encoder::new(file, COMPRESSION_LEVEL)?;
            serde_json::to_writer(&mut encoder, self)?;
            let file = encoder.finish()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a checkpoint, tolerating absence and corruption.
    ///
    /// A corrupt file is rotated to `.bak` and treated as missing; recovery
    /// then replays the audit log from the beginning.
    pub fn load(path: &Path) -> Result<Option<Self>, AuditError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let decoder = match zstd::Decoder::new(file) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, rotating to .bak");
                std::fs::rename(path, rotate_bak_path(path))?;
                return Ok(None);
            }
        };

        match serde_json::from_reader(decoder) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, rotating to .bak");
                std::fs::rename(path, rotate_bak_path(path))?;
                Ok(None)
            }
        }
    }
}

/// Next free `.bak` path for a corrupt file (`.bak`, `.bak1`, `.bak2`, ...).
pub fn rotate_bak_path(path: &Path) -> PathBuf {
    let base = path.with_extension("bak");
    if !base.exists() {
        return base;
    }
    for n in 1u32.. {
        let candidate = path.with_extension(format!("bak{}", n));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("bak rotation exhausted u32 range")
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
