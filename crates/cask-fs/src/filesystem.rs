use std::collections::HashSet;
use std::path::Path;

use cask_store::{reclaim_file, BlockStore, DefragReport, StoreError};
use cask_tree::{Directory, FileId, FileNode, Node};
use tracing::{debug, info, warn};

use crate::path::{self, validate_name};
use crate::{FsError, PathReason, Result};

/// Behaviour switches for an open filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Flush the header after every write and append, not only after
    /// structural changes
    pub write_through: bool,
    /// Compact the container when it is closed
    pub defragment_on_close: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            write_through: true,
            defragment_on_close: false,
        }
    }
}

/// Summary of a container's namespace and block usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub high_water: u64,
    pub container_len: u64,
    /// Encoded header length, out of `HEADER_SIZE`
    pub header_bytes: usize,
}

/// Resolve `segments` below `root`, each one naming a directory.
fn walk<'a>(root: &'a Directory, path: &str, segments: &[&str]) -> Result<&'a Directory> {
    segments.iter().try_fold(root, |dir, segment| {
        dir.directory(segment).map_err(|err| FsError::path(path, err))
    })
}

fn walk_mut<'a>(
    root: &'a mut Directory,
    path: &str,
    segments: &[&str],
) -> Result<&'a mut Directory> {
    let mut dir = root;
    for segment in segments {
        dir = dir
            .directory_mut(segment)
            .map_err(|err| FsError::path(path, err))?;
    }
    Ok(dir)
}

/// A filesystem living inside one container file.
///
/// Not safe for concurrent use: one process, one handle.
pub struct FileSystem {
    store: BlockStore,
    options: FsOptions,
}

impl FileSystem {
    /// Open a container with default options, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, FsOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: FsOptions) -> Result<Self> {
        let store = BlockStore::open(path)?;
        debug!(
            write_through = options.write_through,
            defragment_on_close = options.defragment_on_close,
            "Filesystem ready"
        );
        Ok(Self { store, options })
    }

    /// The underlying block store, for inspection
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    fn root(&self) -> &Directory {
        &self.store.header().root
    }

    fn file_id(&self, path: &str) -> Result<FileId> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Err(FsError::path(path, PathReason::NotAFile("/".to_string())));
        };
        let file = walk(self.root(), path, parents)?
            .file(name)
            .map_err(|err| FsError::path(path, err))?;
        Ok(file.id())
    }

    fn sync_header(&mut self) -> Result<()> {
        if self.options.write_through {
            self.store.flush_header()?;
        }
        Ok(())
    }

    // ==================== Namespace ====================

    /// Create a directory. Succeeds without change if it already exists.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Ok(());
        };

        match walk(self.root(), path, parents)?.node(name) {
            Ok(Node::Directory(_)) => return Ok(()),
            Ok(Node::File(_)) => return Err(FsError::exists(name)),
            Err(_) => {}
        }

        self.store.commit(|header| {
            walk_mut(&mut header.root, path, parents)?.add(Directory::new(name));
            Ok::<_, FsError>(())
        })?;
        debug!(path, "Created directory");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn remove_directory(&mut self, path: &str) -> Result<()> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Err(FsError::path(path, PathReason::Root));
        };

        let dir = walk(self.root(), path, parents)?
            .directory(name)
            .map_err(|err| FsError::path(path, err))?;
        if !dir.is_empty() {
            return Err(FsError::NotEmpty {
                path: path.to_string(),
            });
        }

        self.store.commit(|header| {
            walk_mut(&mut header.root, path, parents)?.remove(name);
            Ok::<_, FsError>(())
        })?;
        debug!(path, "Removed directory");
        Ok(())
    }

    /// Create an empty file. Succeeds without change if it already exists.
    pub fn create_file(&mut self, path: &str) -> Result<()> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Err(FsError::exists("/"));
        };

        match walk(self.root(), path, parents)?.node(name) {
            Ok(Node::File(_)) => return Ok(()),
            Ok(Node::Directory(_)) => return Err(FsError::exists(name)),
            Err(_) => {}
        }

        let id = self.store.commit(|header| {
            let id = header.register_file();
            walk_mut(&mut header.root, path, parents)?.add(FileNode::new(name, id));
            Ok::<_, FsError>(id)
        })?;
        debug!(path, file = %id, "Created file");
        Ok(())
    }

    /// Remove a file and return its blocks to the free set.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Err(FsError::path(path, PathReason::NotAFile("/".to_string())));
        };

        let id = walk(self.root(), path, parents)?
            .file(name)
            .map_err(|err| FsError::path(path, err))?
            .id();

        let freed = self.store.commit(|header| {
            let freed = reclaim_file(header, id)?;
            walk_mut(&mut header.root, path, parents)?.remove(name);
            Ok::<_, FsError>(freed)
        })?;
        debug!(path, file = %id, freed, "Removed file");
        Ok(())
    }

    /// Give a node a new name within its parent.
    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Err(FsError::path(path, PathReason::Root));
        };

        let parent = walk(self.root(), path, parents)?;
        parent.node(name).map_err(|err| FsError::path(path, err))?;
        if parent.contains(new_name) {
            return Err(FsError::exists(new_name));
        }

        self.store.commit(|header| {
            let parent = walk_mut(&mut header.root, path, parents)?;
            let mut node = parent
                .remove(name)
                .ok_or_else(|| FsError::path(path, PathReason::Missing(name.to_string())))?;
            node.rename(new_name);
            parent.add(node);
            Ok::<_, FsError>(())
        })?;
        debug!(path, new_name, "Renamed");
        Ok(())
    }

    /// Move a node into the directory at `destination`, keeping its name.
    pub fn move_node(&mut self, source: &str, destination: &str) -> Result<()> {
        let src = path::segments(source)?;
        let dst = path::segments(destination)?;
        let Some((&name, parents)) = src.split_last() else {
            return Err(FsError::path(source, PathReason::Root));
        };

        let root = self.root();
        let node = walk(root, source, parents)?
            .node(name)
            .map_err(|err| FsError::path(source, err))?;
        let target = walk(root, destination, &dst)?;
        if node.is_directory() && dst.starts_with(&src) {
            return Err(FsError::path(destination, PathReason::IntoOwnSubtree));
        }
        // Detach and re-attach under the same parent leaves the tree as it was
        if dst == parents {
            debug!(source, destination, "Move into current parent");
            return Ok(());
        }
        if target.contains(name) {
            return Err(FsError::exists(name));
        }

        self.store.commit(|header| {
            let node = walk_mut(&mut header.root, source, parents)?
                .remove(name)
                .ok_or_else(|| FsError::path(source, PathReason::Missing(name.to_string())))?;
            walk_mut(&mut header.root, destination, &dst)?.add(node);
            Ok::<_, FsError>(())
        })?;
        debug!(source, destination, "Moved");
        Ok(())
    }

    /// Names of a directory's direct children (unordered)
    pub fn directory_contents(&self, path: &str) -> Result<HashSet<String>> {
        let segments = path::segments(path)?;
        Ok(walk(self.root(), path, &segments)?.contents())
    }

    /// Whether a node exists at `path`. Malformed paths are still errors.
    pub fn exists(&self, path: &str) -> Result<bool> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Ok(true);
        };
        Ok(walk(self.root(), path, parents)
            .map(|parent| parent.contains(name))
            .unwrap_or(false))
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        let segments = path::segments(path)?;
        let Some((&name, parents)) = segments.split_last() else {
            return Ok(true);
        };
        let node = walk(self.root(), path, parents)?
            .node(name)
            .map_err(|err| FsError::path(path, err))?;
        Ok(node.is_directory())
    }

    // ==================== Content ====================

    /// Replace a file's content.
    pub fn write_to_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let id = self.file_id(path)?;
        self.store.write(id, bytes)?;
        self.sync_header()?;
        debug!(path, size = bytes.len(), "Wrote file");
        Ok(())
    }

    /// Append to a file's content.
    pub fn append_to_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let id = self.file_id(path)?;
        self.store.append(id, bytes)?;
        self.sync_header()?;
        debug!(path, appended = bytes.len(), "Appended to file");
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.file_id(path)?;
        Ok(self.store.read(id)?)
    }

    pub fn file_size(&self, path: &str) -> Result<u64> {
        let id = self.file_id(path)?;
        Ok(self.store.extent(id)?.size)
    }

    /// Block numbers backing a file, in content order
    pub fn file_blocks(&self, path: &str) -> Result<Vec<u64>> {
        let id = self.file_id(path)?;
        Ok(self.store.file_blocks(id)?.to_vec())
    }

    // ==================== Container ====================

    /// Compact the container and persist the new layout.
    pub fn defragment(&mut self) -> Result<DefragReport> {
        let report = self.store.defragment()?;
        self.store.flush_header()?;
        Ok(report)
    }

    pub fn stats(&self) -> Result<FsStats> {
        let header = self.store.header();
        let tree = header.root.stats();
        Ok(FsStats {
            files: tree.file_count,
            directories: tree.dir_count,
            total_bytes: header.files.values().map(|extent| extent.size).sum(),
            used_blocks: self.store.used_block_count() as u64,
            free_blocks: self.store.free_blocks().count() as u64,
            high_water: self.store.high_water(),
            container_len: self.store.container_len()?,
            header_bytes: cask_header::encoded_len(header).map_err(StoreError::from)?,
        })
    }

    /// Flush pending metadata and release the container.
    ///
    /// A failed compaction on close still flushes the header; the first
    /// error is returned.
    pub fn close(mut self) -> Result<()> {
        let compacted = if self.options.defragment_on_close {
            self.defragment().map(|_| ())
        } else {
            Ok(())
        };
        if let Err(err) = &compacted {
            warn!(error = %err, "Defragment on close failed, flushing anyway");
        }
        let path = self.store.path().to_path_buf();
        let closed = self.store.close().map_err(FsError::from);
        compacted.and(closed)?;
        info!(path = %path.display(), "Closed filesystem");
        Ok(())
    }

    /// Release the container and delete it from the host filesystem.
    pub fn delete_container(self) -> Result<()> {
        self.store.delete_container()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_failed_create_leaves_tree_unchanged() {
        let temp = tempdir().unwrap();
        let mut fs = FileSystem::open(temp.path().join("t.cask")).unwrap();
        let before = fs.store().header().clone();

        assert!(fs.create_file("/missing/a.txt").is_err());
        assert_eq!(fs.store().header(), &before);
    }

    #[test]
    fn test_structural_change_is_flushed() {
        let temp = tempdir().unwrap();
        let mut fs = FileSystem::open(temp.path().join("t.cask")).unwrap();
        fs.create_directory("/d").unwrap();
        assert!(!fs.store().is_dirty());
    }

    #[test]
    fn test_write_without_write_through_leaves_header_dirty() {
        let temp = tempdir().unwrap();
        let options = FsOptions {
            write_through: false,
            ..FsOptions::default()
        };
        let mut fs = FileSystem::open_with(temp.path().join("t.cask"), options).unwrap();
        fs.create_file("/a").unwrap();
        fs.write_to_file("/a", b"data").unwrap();
        assert!(fs.store().is_dirty());
    }
}
