//! Identity types: file, block within a file, and participating host.

use std::fmt;

use crate::protocol::BLOCK_SIZE;
use crate::wire::FixedLayout;

/// Length of a file content digest (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// A file version: whole-content digest plus number of blocks.
///
/// Ordering is lexicographic by digest, then by block count, so two values are
/// equal only when both the content and the size agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIdentity {
    digest: [u8; DIGEST_LEN],
    block_count: u32,
}

impl FileIdentity {
    pub fn new(digest: [u8; DIGEST_LEN], block_count: u32) -> Self {
        Self {
            digest,
            block_count,
        }
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Lowercase hex rendering of the digest, used for staging file names.
    pub fn digest_hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Identity of block `block_num` of this file, or `None` when out of range.
    pub fn block(&self, block_num: u32) -> Option<BlockIdentity> {
        (block_num < self.block_count).then_some(BlockIdentity {
            file: *self,
            block_num,
        })
    }

    /// Every block of this file, in order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockIdentity> + '_ {
        (0..self.block_count).map(move |block_num| BlockIdentity {
            file: *self,
            block_num,
        })
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.digest_hex();
        write!(f, "{}/{}", &hex[..12], self.block_count)
    }
}

impl FixedLayout for FileIdentity {
    const SIZE: usize = DIGEST_LEN + 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&self.block_count.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[..DIGEST_LEN]);
        let block_count = u32::from_be_bytes([
            bytes[DIGEST_LEN],
            bytes[DIGEST_LEN + 1],
            bytes[DIGEST_LEN + 2],
            bytes[DIGEST_LEN + 3],
        ]);
        Self {
            digest,
            block_count,
        }
    }
}

/// One block of a file. Doubles as a cursor over `[0, block_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdentity {
    file: FileIdentity,
    block_num: u32,
}

impl BlockIdentity {
    pub fn file(&self) -> &FileIdentity {
        &self.file
    }

    pub fn block_num(&self) -> u32 {
        self.block_num
    }

    /// Byte position of this block within the file.
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.block_num) * BLOCK_SIZE as u64
    }

    /// The following block, or `None` past the last one.
    pub fn next(&self) -> Option<BlockIdentity> {
        self.block_num
            .checked_add(1)
            .and_then(|n| self.file.block(n))
    }

    /// True when the block number lies inside the file's block range.
    pub fn in_range(&self) -> bool {
        self.block_num < self.file.block_count
    }
}

impl fmt::Display for BlockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file, self.block_num)
    }
}

impl FixedLayout for BlockIdentity {
    const SIZE: usize = FileIdentity::SIZE + 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.file.write_to(out);
        out.extend_from_slice(&self.block_num.to_be_bytes());
    }

    // Decoding does not range-check; a foreign or corrupt block number is the
    // handler's call to reject.
    fn read_from(bytes: &[u8]) -> Self {
        let file = FileIdentity::read_from(&bytes[..FileIdentity::SIZE]);
        let n = &bytes[FileIdentity::SIZE..Self::SIZE];
        Self {
            file,
            block_num: u32::from_be_bytes([n[0], n[1], n[2], n[3]]),
        }
    }
}

/// Opaque participant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostIdentity(u32);

impl HostIdentity {
    pub const fn new(id: u32) -> Self {
        HostIdentity(id)
    }

    /// Identity derived from the current process id.
    pub fn from_process() -> Self {
        HostIdentity(std::process::id())
    }

    /// Random identity.
    pub fn random() -> Self {
        HostIdentity(rand::random())
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FixedLayout for HostIdentity {
    const SIZE: usize = 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        HostIdentity(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
