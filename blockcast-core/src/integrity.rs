//! Integrity: whole-file SHA-256 digest and the file identity derived from it.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::identity::{FileIdentity, DIGEST_LEN};
use crate::protocol::BLOCK_SIZE;

/// Digest everything `reader` yields. Returns the digest and the byte count.
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<([u8; DIGEST_LEN], u64)> {
    let mut hasher = Sha256::new();
    let len = io::copy(reader, &mut hasher)?;
    Ok((hasher.finalize().into(), len))
}

/// Number of blocks needed for `len` bytes.
pub fn block_count(len: u64) -> u32 {
    len.div_ceil(BLOCK_SIZE as u64) as u32
}

/// Compute the identity of the file at `path`.
pub fn identify_file(path: &Path) -> Result<FileIdentity> {
    let mut file = File::open(path).map_err(|e| Error::file_io(path, e))?;
    let (digest, len) = digest_reader(&mut file).map_err(|e| Error::file_io(path, e))?;
    Ok(FileIdentity::new(digest, block_count(len)))
}
