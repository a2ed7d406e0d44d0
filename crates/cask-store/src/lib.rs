//! # cask-store
//!
//! Block storage engine for Cask containers.
//!
//! A container is one host file: a fixed header region followed by
//! `BLOCK_SIZE` data blocks addressed by number. [`BlockStore`] owns that
//! file and the decoded [`MetadataHeader`], and implements block
//! allocation, whole-file write, append, read, reclamation and
//! defragmentation.
//!
//! Access is single-threaded and unsynchronised: one process, one handle.

mod store;

pub use store::{reclaim_file, BlockStore, DefragReport};

pub use cask_header::{FileExtent, MetadataHeader, BLOCK_SIZE, HEADER_SIZE};

use cask_header::HeaderError;
use thiserror::Error;

/// Errors that can occur during block store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header needs {encoded} bytes but only {limit} are reserved")]
    Capacity { encoded: usize, limit: usize },

    #[error("Corrupt header: {0}")]
    CorruptHeader(HeaderError),

    #[error("Consistency error: {0}")]
    Consistency(String),
}

impl From<HeaderError> for StoreError {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::Capacity { encoded, limit } => StoreError::Capacity { encoded, limit },
            other => StoreError::CorruptHeader(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
