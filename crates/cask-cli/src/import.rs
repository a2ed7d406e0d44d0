//! Copy a host directory tree into a container.

use std::path::Path;

use anyhow::{Context, Result};
use cask_fs::FileSystem;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

/// Create `path` and every missing ancestor.
pub fn ensure_directories(fs: &mut FileSystem, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in cask_fs::path::segments(path)? {
        current.push('/');
        current.push_str(segment);
        fs.create_directory(&current)?;
    }
    Ok(())
}

/// Container path for `relative` below `prefix`.
fn container_path(prefix: &str, relative: &Path) -> Result<String> {
    let mut path = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        let name = component
            .as_os_str()
            .to_str()
            .with_context(|| format!("Non UTF-8 name in {}", relative.display()))?;
        path.push('/');
        path.push_str(name);
    }
    Ok(path)
}

/// Recursively import `host_dir` under `prefix`.
///
/// Directories are created before their contents; regular files are copied
/// whole. Symlinks and other special files are skipped.
pub fn import_tree(fs: &mut FileSystem, host_dir: &Path, prefix: &str) -> Result<ImportSummary> {
    if !host_dir.is_dir() {
        anyhow::bail!("{} is not a directory", host_dir.display());
    }
    ensure_directories(fs, prefix)?;

    let mut summary = ImportSummary::default();
    for entry in WalkDir::new(host_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(host_dir)
            .with_context(|| format!("{} escaped the import root", entry.path().display()))?;
        let target = container_path(prefix, relative)?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs.create_directory(&target)?;
            summary.directories += 1;
        } else if file_type.is_file() {
            let bytes = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            fs.create_file(&target)?;
            fs.write_to_file(&target, &bytes)?;
            summary.files += 1;
            summary.bytes += bytes.len() as u64;
            debug!(path = %target, size = bytes.len(), "Imported file");
        } else {
            warn!(path = %entry.path().display(), "Skipping special file");
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_container_path_joins_components() {
        assert_eq!(
            container_path("/", Path::new("a/b.txt")).unwrap(),
            "/a/b.txt"
        );
        assert_eq!(
            container_path("/dst/", Path::new("x")).unwrap(),
            "/dst/x"
        );
    }

    #[test]
    fn test_import_tree() {
        let host = tempdir().unwrap();
        std::fs::create_dir_all(host.path().join("src/nested")).unwrap();
        std::fs::write(host.path().join("README"), b"readme").unwrap();
        std::fs::write(host.path().join("src/nested/lib.rs"), b"fn main() {}").unwrap();

        let temp = tempdir().unwrap();
        let mut fs = FileSystem::open(temp.path().join("import.cask")).unwrap();
        let summary = import_tree(&mut fs, host.path(), "/proj").unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.bytes, 18);
        assert_eq!(fs.read_file("/proj/README").unwrap(), b"readme");
        assert_eq!(
            fs.read_file("/proj/src/nested/lib.rs").unwrap(),
            b"fn main() {}"
        );
    }

    #[test]
    fn test_ensure_directories() {
        let temp = tempdir().unwrap();
        let mut fs = FileSystem::open(temp.path().join("dirs.cask")).unwrap();
        ensure_directories(&mut fs, "/a/b/c").unwrap();
        ensure_directories(&mut fs, "/a/b/c").unwrap();
        assert!(fs.is_directory("/a/b/c").unwrap());
    }
}
