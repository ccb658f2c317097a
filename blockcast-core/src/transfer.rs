//! Receive-side transfer state: block bitmap, staging file, once-only finalization.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{BlockIdentity, FileIdentity};
use crate::protocol::BLOCK_SIZE;

/// Completion phase. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Blocks or the destination path are still missing.
    Pending,
    /// All blocks and the path are known; the staging file is not yet moved.
    ByteComplete,
    /// The staging file has been moved to its destination.
    Finalized,
}

/// Assembly of one file from unordered, possibly duplicated blocks.
#[derive(Debug)]
pub struct TransferState {
    file: FileIdentity,
    destination: Option<PathBuf>,
    received: Vec<bool>,
    remaining: u32,
    staging_path: PathBuf,
    staging: Option<File>,
    phase: Phase,
    goodbye_received: bool,
}

impl TransferState {
    /// Create the state and its staging file inside `staging_dir`.
    pub fn create(file: FileIdentity, staging_dir: &Path) -> Result<Self> {
        let staging_path =
            staging_dir.join(format!("{}-{}.part", file.digest_hex(), Uuid::new_v4()));
        let staging = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging_path)
            .map_err(|e| Error::file_io(&staging_path, e))?;
        debug!(%file, staging = %staging_path.display(), "created transfer state");
        Ok(Self {
            file,
            destination: None,
            received: vec![false; file.block_count() as usize],
            remaining: file.block_count(),
            staging_path,
            staging: Some(staging),
            phase: Phase::Pending,
            goodbye_received: false,
        })
    }

    pub fn file(&self) -> &FileIdentity {
        &self.file
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Blocks not yet recorded. Equals the number of unset bits.
    pub fn remaining_blocks(&self) -> u32 {
        self.remaining
    }

    pub fn is_received(&self, block_num: u32) -> bool {
        self.received
            .get(block_num as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Blocks still missing, in order.
    pub fn missing_blocks(&self) -> impl Iterator<Item = BlockIdentity> + '_ {
        self.file
            .blocks()
            .filter(|block| !self.received[block.block_num() as usize])
    }

    /// Set the destination path from an INFO message. Finalizes when this
    /// was the last missing piece. Ignored once finalized, and an empty path
    /// never counts as a destination.
    pub fn set_destination(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            warn!(file = %self.file, "ignoring empty destination path");
            return Ok(());
        }
        if self.phase == Phase::Finalized {
            if self.destination.as_deref() != Some(path.as_path()) {
                debug!(file = %self.file, path = %path.display(), "transfer already finalized, ignoring new path");
            }
            return Ok(());
        }
        self.destination = Some(path);
        self.advance()
    }

    /// Stage one block. Returns `true` when the block was new; a duplicate
    /// delivery changes nothing.
    pub fn record_block(&mut self, block_num: u32, payload: &[u8]) -> Result<bool> {
        let Some(seen) = self.received.get(block_num as usize).copied() else {
            warn!(file = %self.file, block_num, "block number out of range");
            return Ok(false);
        };
        if seen {
            return Ok(false);
        }
        let Some(staging) = self.staging.as_mut() else {
            return Ok(false);
        };
        let offset = u64::from(block_num) * BLOCK_SIZE as u64;
        staging
            .seek(SeekFrom::Start(offset))
            .and_then(|_| staging.write_all(payload))
            .map_err(|e| Error::file_io(&self.staging_path, e))?;
        self.received[block_num as usize] = true;
        self.remaining -= 1;
        self.advance()?;
        Ok(true)
    }

    /// True once every block and the destination path are known.
    pub fn is_byte_complete(&self) -> bool {
        self.phase >= Phase::ByteComplete
    }

    pub fn set_goodbye_received(&mut self) {
        self.goodbye_received = true;
    }

    pub fn goodbye_received(&self) -> bool {
        self.goodbye_received
    }

    /// Data complete and the distributor's goodbye acknowledged.
    pub fn is_fully_synchronized(&self) -> bool {
        self.is_byte_complete() && self.goodbye_received
    }

    fn advance(&mut self) -> Result<()> {
        if self.phase == Phase::Pending && self.remaining == 0 && self.destination.is_some() {
            self.phase = Phase::ByteComplete;
        }
        if self.phase == Phase::ByteComplete {
            self.finalize()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(destination) = self.destination.clone() else {
            return Ok(());
        };
        if let Some(staging) = self.staging.take() {
            staging
                .sync_all()
                .map_err(|e| Error::file_io(&self.staging_path, e))?;
        }
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
        }
        move_file(&self.staging_path, &destination)?;
        self.phase = Phase::Finalized;
        info!(file = %self.file, path = %destination.display(), "transfer complete");
        Ok(())
    }
}

impl Drop for TransferState {
    fn drop(&mut self) {
        if self.phase != Phase::Finalized {
            self.staging.take();
            let _ = fs::remove_file(&self.staging_path);
        }
    }
}

/// Rename, falling back to copy + remove when the two paths are on
/// different filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| Error::file_io(to, e))?;
    fs::remove_file(from).map_err(|e| Error::file_io(from, e))
}
