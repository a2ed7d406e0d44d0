//! Container file management and the block engine

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cask_header::{FileExtent, MetadataHeader, BLOCK_SIZE, HEADER_SIZE};
use cask_tree::FileId;
use tracing::{debug, info, warn};

use crate::{Result, StoreError};

/// Outcome of a defragmentation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragReport {
    /// Blocks copied to a lower number
    pub moved_blocks: u64,
    /// Blocks below the high-water mark that no index knew about
    pub reclaimed_gaps: u64,
    /// Blocks in use after compaction
    pub used_blocks: u64,
    /// Container length after truncation
    pub container_len: u64,
}

/// Owner of an open container file.
///
/// Every positioned access seeks immediately before it reads or writes;
/// there is no caching layer.
pub struct BlockStore {
    file: File,
    path: PathBuf,
    header: MetadataHeader,
    /// First never-allocated block number
    high_water: u64,
    /// Header changed since the last flush
    dirty: bool,
}

/// Container offset of byte `offset` inside `block`
fn block_offset(block: u64, offset: usize) -> u64 {
    HEADER_SIZE as u64 + block * BLOCK_SIZE as u64 + offset as u64
}

fn missing_file(id: FileId) -> StoreError {
    StoreError::Consistency(format!("file {} has no entry in the file table", id))
}

/// Return every block of `id` to the free set and clear its extent.
fn release_blocks(header: &mut MetadataHeader, id: FileId) -> Result<Vec<u64>> {
    let extent = header.files.get_mut(&id).ok_or_else(|| missing_file(id))?;
    let blocks = std::mem::take(&mut extent.blocks);
    extent.size = 0;

    for block in &blocks {
        if header.used_blocks.remove(block) != Some(id) {
            return Err(StoreError::Consistency(format!(
                "block {} of file {} is not indexed to it",
                block, id
            )));
        }
        header.free_blocks.insert(*block);
    }
    Ok(blocks)
}

/// Release a file's blocks and drop it from the file table.
///
/// The namespace node is left alone; detaching it is the caller's job.
/// Returns the number of blocks freed.
pub fn reclaim_file(header: &mut MetadataHeader, id: FileId) -> Result<usize> {
    let released = release_blocks(header, id)?;
    header.files.remove(&id);
    Ok(released.len())
}

impl BlockStore {
    /// Open a container, creating and initialising it when empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let mut store = Self {
                file,
                path,
                header: MetadataHeader::new(),
                high_water: 0,
                dirty: true,
            };
            store.flush_header()?;
            info!(path = %store.path.display(), "Initialized empty container");
            return Ok(store);
        }

        let mut region = vec![0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut region)?;
        let header = cask_header::decode(&region)?;
        let high_water = (len - HEADER_SIZE as u64).div_ceil(BLOCK_SIZE as u64);

        info!(
            path = %path.display(),
            files = header.files.len(),
            used_blocks = header.used_blocks.len(),
            free_blocks = header.free_blocks.len(),
            high_water,
            "Opened container"
        );

        Ok(Self {
            file,
            path,
            header,
            high_water,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &MetadataHeader {
        &self.header
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn used_block_count(&self) -> usize {
        self.header.used_blocks.len()
    }

    /// Free block numbers in ascending order
    pub fn free_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.header.free_blocks.iter().copied()
    }

    pub fn extent(&self, id: FileId) -> Result<&FileExtent> {
        self.header.extent(id).ok_or_else(|| missing_file(id))
    }

    fn extent_mut(&mut self, id: FileId) -> Result<&mut FileExtent> {
        self.header.extent_mut(id).ok_or_else(|| missing_file(id))
    }

    /// Block numbers of a file in content order
    pub fn file_blocks(&self, id: FileId) -> Result<&[u64]> {
        Ok(&self.extent(id)?.blocks)
    }

    pub fn container_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Encode the header and write it over the whole header region.
    ///
    /// The region is zero padded, so its last byte is always written and the
    /// full region stays reserved whatever the encoded length.
    pub fn flush_header(&mut self) -> Result<()> {
        let region = cask_header::encode_region(&self.header)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&region)?;
        self.dirty = false;
        debug!(
            used_blocks = self.header.used_blocks.len(),
            free_blocks = self.header.free_blocks.len(),
            "Flushed header"
        );
        Ok(())
    }

    /// Apply a metadata mutation, then flush.
    ///
    /// The header is rolled back when the mutation fails, when the result
    /// would not fit the header region, or when the flush itself fails.
    pub fn commit<T, E>(
        &mut self,
        mutate: impl FnOnce(&mut MetadataHeader) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let snapshot = self.header.clone();
        let value = match mutate(&mut self.header) {
            Ok(value) => value,
            Err(err) => {
                self.header = snapshot;
                return Err(err);
            }
        };
        if let Err(err) = self.flush_header() {
            self.header = snapshot;
            return Err(err.into());
        }
        Ok(value)
    }

    /// Run a block-level operation, restoring header and high-water mark
    /// if it fails.
    fn staged<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let header = self.header.clone();
        let high_water = self.high_water;
        match op(self) {
            Ok(value) => {
                self.dirty = true;
                Ok(value)
            }
            Err(err) => {
                self.header = header;
                self.high_water = high_water;
                Err(err)
            }
        }
    }

    fn ensure_capacity(&self) -> Result<()> {
        let encoded = cask_header::encoded_len(&self.header)?;
        if encoded > HEADER_SIZE {
            return Err(StoreError::Capacity {
                encoded,
                limit: HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Smallest free block, or the high-water mark when none is free.
    pub fn allocate_block(&mut self) -> u64 {
        if let Some(block) = self.header.free_blocks.pop_first() {
            return block;
        }
        let block = self.high_water;
        self.high_water += 1;
        block
    }

    /// Allocate enough blocks for `len` bytes and index them to `id`.
    fn allocate_run(&mut self, id: FileId, len: usize) -> Vec<u64> {
        let count = FileExtent::blocks_for(len as u64);
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let block = self.allocate_block();
            self.header.used_blocks.insert(block, id);
            blocks.push(block);
        }
        blocks
    }

    fn write_at(&mut self, block: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(block_offset(block, offset)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Copy the raw bytes of one block. A block at the end of the container
    /// may be stored short; the missing bytes are copied as zeros.
    fn copy_block(&mut self, from: u64, to: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        self.file.seek(SeekFrom::Start(block_offset(from, 0)))?;
        (&mut self.file)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut buf)?;
        buf.resize(BLOCK_SIZE, 0);
        self.write_at(to, 0, &buf)
    }

    /// Replace a file's content.
    ///
    /// All currently held blocks are released first and fresh ones are
    /// allocated, even when the new content is shorter.
    pub fn write(&mut self, id: FileId, bytes: &[u8]) -> Result<()> {
        self.staged(|store| {
            let released = release_blocks(&mut store.header, id)?;
            let blocks = store.allocate_run(id, bytes.len());

            let extent = store.extent_mut(id)?;
            extent.blocks = blocks.clone();
            extent.size = bytes.len() as u64;
            store.ensure_capacity()?;

            for (block, chunk) in blocks.iter().zip(bytes.chunks(BLOCK_SIZE)) {
                store.write_at(*block, 0, chunk)?;
            }

            debug!(
                file = %id,
                size = bytes.len(),
                released = released.len(),
                blocks = ?blocks,
                "Wrote file"
            );
            Ok(())
        })
    }

    /// Append to a file, topping up its partial last block first.
    pub fn append(&mut self, id: FileId, bytes: &[u8]) -> Result<()> {
        self.staged(|store| {
            let (tail, last) = {
                let extent = store.extent(id)?;
                (extent.tail_len(), extent.blocks.last().copied())
            };
            let fill = if tail == 0 {
                0
            } else {
                (BLOCK_SIZE - tail).min(bytes.len())
            };
            let (head, rest) = bytes.split_at(fill);

            let blocks = store.allocate_run(id, rest.len());
            let extent = store.extent_mut(id)?;
            extent.blocks.extend_from_slice(&blocks);
            extent.size += bytes.len() as u64;
            store.ensure_capacity()?;

            if !head.is_empty() {
                let last = last.ok_or_else(|| {
                    StoreError::Consistency(format!(
                        "file {} has a partial tail but no blocks",
                        id
                    ))
                })?;
                store.write_at(last, tail, head)?;
            }
            for (block, chunk) in blocks.iter().zip(rest.chunks(BLOCK_SIZE)) {
                store.write_at(*block, 0, chunk)?;
            }

            debug!(
                file = %id,
                appended = bytes.len(),
                filled = head.len(),
                new_blocks = ?blocks,
                "Appended to file"
            );
            Ok(())
        })
    }

    /// Read a file's full content.
    pub fn read(&self, id: FileId) -> Result<Vec<u8>> {
        let extent = self.extent(id)?;
        if extent.blocks.len() != FileExtent::blocks_for(extent.size) {
            return Err(StoreError::Consistency(format!(
                "file {} holds {} blocks for {} bytes",
                id,
                extent.blocks.len(),
                extent.size
            )));
        }

        let mut contents = vec![0u8; extent.size as usize];
        let mut file = &self.file;
        for (block, chunk) in extent.blocks.iter().zip(contents.chunks_mut(BLOCK_SIZE)) {
            file.seek(SeekFrom::Start(block_offset(*block, 0)))?;
            file.read_exact(chunk)?;
        }
        Ok(contents)
    }

    /// Release a file's blocks and drop its table entry.
    pub fn remove(&mut self, id: FileId) -> Result<()> {
        let freed = reclaim_file(&mut self.header, id)?;
        self.dirty = true;
        debug!(file = %id, freed, "Removed file blocks");
        Ok(())
    }

    /// Blocks below the high-water mark that are neither used nor free are
    /// returned to the free set so compaction can fill them.
    fn reclaim_gaps(&mut self) -> u64 {
        let gaps: Vec<u64> = (0..self.high_water)
            .filter(|block| {
                !self.header.used_blocks.contains_key(block)
                    && !self.header.free_blocks.contains(block)
            })
            .collect();
        if !gaps.is_empty() {
            warn!(count = gaps.len(), "Reclaiming unindexed blocks");
        }
        self.header.free_blocks.extend(gaps.iter().copied());
        gaps.len() as u64
    }

    /// Compact the container.
    ///
    /// Repeatedly moves the highest used block into the lowest free block
    /// until every used block sits below every free block, then truncates
    /// the container right after the last used block.
    pub fn defragment(&mut self) -> Result<DefragReport> {
        let reclaimed_gaps = self.reclaim_gaps();
        let mut moved_blocks = 0u64;

        loop {
            let Some(&free) = self.header.free_blocks.first() else {
                break;
            };
            let Some((&used, &owner)) = self.header.used_blocks.last_key_value() else {
                break;
            };
            if used < free {
                break;
            }

            let position = self
                .header
                .extent(owner)
                .and_then(|extent| extent.blocks.iter().position(|&b| b == used))
                .ok_or_else(|| {
                    StoreError::Consistency(format!(
                        "block {} is indexed to file {} which does not hold it",
                        used, owner
                    ))
                })?;

            self.copy_block(used, free)?;

            self.header.free_blocks.remove(&free);
            self.header.used_blocks.remove(&used);
            self.header.used_blocks.insert(free, owner);
            self.header.free_blocks.insert(used);
            self.extent_mut(owner)?.blocks[position] = free;
            self.dirty = true;

            moved_blocks += 1;
            debug!(from = used, to = free, file = %owner, "Relocated block");
        }

        let used_count = self.header.used_blocks.len() as u64;
        if let Some((&last, &owner)) = self.header.used_blocks.last_key_value() {
            if last >= used_count {
                return Err(StoreError::Consistency(format!(
                    "block {} of file {} lies beyond the compacted end {}",
                    last, owner, used_count
                )));
            }
        }
        self.header.free_blocks.retain(|&block| block < used_count);

        let container_len = block_offset(used_count, 0);
        self.file.set_len(container_len)?;
        self.high_water = used_count;
        self.dirty = true;

        info!(
            moved_blocks,
            reclaimed_gaps,
            used_blocks = used_count,
            container_len,
            "Defragmented container"
        );

        Ok(DefragReport {
            moved_blocks,
            reclaimed_gaps,
            used_blocks: used_count,
            container_len,
        })
    }

    /// Flush a dirty header and release the file handle.
    pub fn close(mut self) -> Result<()> {
        if self.dirty {
            self.flush_header()?;
        }
        self.file.sync_all()?;
        debug!(path = %self.path.display(), "Closed container");
        Ok(())
    }

    /// Release the file handle, then delete the container file.
    pub fn delete_container(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path)?;
        info!(path = %path.display(), "Deleted container");
        Ok(())
    }
}
