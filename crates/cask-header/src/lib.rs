//! # cask-header
//!
//! The metadata header of a Cask container: the whole namespace tree, the
//! file table, the free-block set and the used-block index. Everything the
//! block store needs to find file content lives here, and all of it must
//! encode into the fixed [`HEADER_SIZE`] region at the start of the
//! container.
//!
//! ## Layout of a container
//!
//! ```text
//! [0, HEADER_SIZE)                                encoded header, zero padded
//! [HEADER_SIZE + b*BLOCK_SIZE, +BLOCK_SIZE)        data block b
//! ```

pub mod codec;

pub use codec::{decode, encode, encode_region, encoded_len};

use std::collections::{BTreeMap, BTreeSet, HashSet};

use cask_tree::{Directory, FileId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one data block in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Size of the reserved header region in bytes
pub const HEADER_SIZE: usize = 4096;

/// Header magic: "CASK" in little-endian
pub const HEADER_MAGIC: u32 = 0x4B53_4143;

/// Header format version. Bump on incompatible changes.
pub const HEADER_VERSION: u16 = 1;

/// Errors produced while encoding, decoding or validating a header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header needs {encoded} bytes but only {limit} are reserved")]
    Capacity { encoded: usize, limit: usize },

    #[error("Invalid header magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Unsupported header version: {0}")]
    UnsupportedVersion(u16),

    #[error("Header checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Failed to encode header: {0}")]
    Encode(String),

    #[error("Malformed header: {0}")]
    Malformed(String),

    #[error("Inconsistent header: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, HeaderError>;

/// Size and block list of one file, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtent {
    pub size: u64,
    pub blocks: Vec<u64>,
}

impl FileExtent {
    /// Number of blocks needed to hold `size` bytes
    pub fn blocks_for(size: u64) -> usize {
        size.div_ceil(BLOCK_SIZE as u64) as usize
    }

    /// Live bytes in the last block; 0 when the size is block aligned.
    pub fn tail_len(&self) -> usize {
        (self.size % BLOCK_SIZE as u64) as usize
    }
}

/// In-memory form of the header region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Root of the namespace
    pub root: Directory,
    /// File id → extent
    pub files: BTreeMap<FileId, FileExtent>,
    /// Blocks available for reuse, consumed smallest first
    pub free_blocks: BTreeSet<u64>,
    /// Block → owning file. A lookup aid for defragmentation, not ownership.
    pub used_blocks: BTreeMap<u64, FileId>,
    next_file_id: u64,
}

impl Default for MetadataHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataHeader {
    /// Header of an empty container: a bare root and no blocks.
    pub fn new() -> Self {
        Self {
            root: Directory::root(),
            files: BTreeMap::new(),
            free_blocks: BTreeSet::new(),
            used_blocks: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    pub fn next_file_id(&self) -> u64 {
        self.next_file_id
    }

    /// Assign a fresh file id and register an empty extent for it.
    pub fn register_file(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        self.files.insert(id, FileExtent::default());
        id
    }

    pub fn extent(&self, id: FileId) -> Option<&FileExtent> {
        self.files.get(&id)
    }

    pub fn extent_mut(&mut self, id: FileId) -> Option<&mut FileExtent> {
        self.files.get_mut(&id)
    }

    /// Check the cross-structure invariants.
    ///
    /// - free and used blocks are disjoint
    /// - every extent's block count matches its size, and each of its blocks
    ///   maps back to it in the used index
    /// - the used index holds no entry that no extent claims
    /// - the tree and the file table name the same set of ids
    pub fn verify(&self) -> Result<()> {
        if let Some(block) = self
            .free_blocks
            .iter()
            .find(|b| self.used_blocks.contains_key(b))
        {
            return Err(HeaderError::Inconsistent(format!(
                "block {} is both free and used",
                block
            )));
        }

        let mut claimed = 0usize;
        for (id, extent) in &self.files {
            if id.0 >= self.next_file_id {
                return Err(HeaderError::Inconsistent(format!(
                    "file {} is beyond the id counter {}",
                    id, self.next_file_id
                )));
            }
            if extent.blocks.len() != FileExtent::blocks_for(extent.size) {
                return Err(HeaderError::Inconsistent(format!(
                    "file {} holds {} blocks for {} bytes",
                    id,
                    extent.blocks.len(),
                    extent.size
                )));
            }
            for block in &extent.blocks {
                if self.used_blocks.get(block) != Some(id) {
                    return Err(HeaderError::Inconsistent(format!(
                        "block {} of file {} is missing from the used index",
                        block, id
                    )));
                }
            }
            claimed += extent.blocks.len();
        }
        if claimed != self.used_blocks.len() {
            return Err(HeaderError::Inconsistent(format!(
                "used index has {} entries but files claim {}",
                self.used_blocks.len(),
                claimed
            )));
        }

        let tree_ids = self.root.file_ids();
        let unique: HashSet<FileId> = tree_ids.iter().copied().collect();
        if unique.len() != tree_ids.len() {
            return Err(HeaderError::Inconsistent(
                "a file id appears twice in the namespace".to_string(),
            ));
        }
        if unique.len() != self.files.len() || !unique.iter().all(|id| self.files.contains_key(id)) {
            return Err(HeaderError::Inconsistent(
                "namespace and file table disagree".to_string(),
            ));
        }

        Ok(())
    }
}
