//! # cask-fs
//!
//! A hierarchical filesystem stored inside one host file.
//!
//! [`FileSystem`] is the public surface: it validates absolute `/`-separated
//! paths, edits the namespace tree and hands byte-level work to the block
//! store. Every structural change is flushed to the container header before
//! the call returns.
//!
//! ```no_run
//! use cask_fs::FileSystem;
//!
//! let mut fs = FileSystem::open("data.cask")?;
//! fs.create_directory("/docs")?;
//! fs.create_file("/docs/a.txt")?;
//! fs.write_to_file("/docs/a.txt", b"hello")?;
//! assert_eq!(fs.read_file("/docs/a.txt")?, b"hello");
//! fs.close()?;
//! # Ok::<(), cask_fs::FsError>(())
//! ```

mod filesystem;
pub mod path;

pub use filesystem::{FileSystem, FsOptions, FsStats};

pub use cask_store::{DefragReport, BLOCK_SIZE, HEADER_SIZE};
pub use cask_tree::FileId;

use cask_header::HeaderError;
use cask_store::StoreError;
use cask_tree::TreeError;
use thiserror::Error;

/// Why a path was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathReason {
    #[error("path must start with '/'")]
    NotAbsolute,

    #[error("empty path segment")]
    EmptySegment,

    #[error("no such entry '{0}'")]
    Missing(String),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("'{0}' is not a file")]
    NotAFile(String),

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("not permitted on the root directory")]
    Root,

    #[error("cannot move a directory into its own subtree")]
    IntoOwnSubtree,
}

impl From<TreeError> for PathReason {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound(name) => PathReason::Missing(name),
            TreeError::NotADirectory(name) => PathReason::NotADirectory(name),
            TreeError::NotAFile(name) => PathReason::NotAFile(name),
        }
    }
}

/// Errors returned by filesystem operations
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Invalid path {path}: {reason}")]
    Path { path: String, reason: PathReason },

    #[error("Already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Header needs {encoded} bytes but only {limit} are reserved")]
    Capacity { encoded: usize, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Corrupt header: {0}")]
    CorruptHeader(HeaderError),
}

impl FsError {
    pub(crate) fn path(path: &str, reason: impl Into<PathReason>) -> Self {
        FsError::Path {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn exists(name: &str) -> Self {
        FsError::AlreadyExists {
            name: name.to_string(),
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(err) => FsError::Io(err),
            StoreError::Capacity { encoded, limit } => FsError::Capacity { encoded, limit },
            StoreError::CorruptHeader(err) => FsError::CorruptHeader(err),
            StoreError::Consistency(msg) => FsError::Consistency(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
