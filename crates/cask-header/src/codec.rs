//! Binary encoding of [`MetadataHeader`].
//!
//! ```text
//! offset  field      size
//! ------  ---------  ----
//!  0      magic      4    (0x4B534143, "CASK")
//!  4      version    2
//!  6      flags      2    (reserved, 0)
//!  8      body_len   4
//! 12      crc32      4    (crc32 of body)
//! 16      body       body_len
//! ```
//!
//! The body is a stream of records `tag:u8 len:u32 payload[len]`. Each
//! payload is one bincode value (varint integers, little endian). Decoders
//! skip tags they do not know, so new records can be added without a
//! version bump.

use std::collections::{BTreeMap, BTreeSet};

use bincode::{DefaultOptions, Options};
use cask_tree::{Directory, FileId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    FileExtent, HeaderError, MetadataHeader, Result, HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION,
};

/// Bytes before the record stream
pub const PREAMBLE_SIZE: usize = 16;

/// Bytes before each record payload: tag and length
const RECORD_PREFIX: usize = 5;

const TAG_NEXT_FILE_ID: u8 = 1;
const TAG_ROOT: u8 = 2;
const TAG_FILES: u8 = 3;
const TAG_FREE: u8 = 4;
const TAG_USED: u8 = 5;

fn options() -> impl Options {
    DefaultOptions::new().reject_trailing_bytes()
}

/// Encode a header into its exact byte form (no padding, no size limit).
pub fn encode(header: &MetadataHeader) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    write_record(&mut body, TAG_NEXT_FILE_ID, &header.next_file_id)?;
    write_record(&mut body, TAG_ROOT, &header.root)?;
    write_record(&mut body, TAG_FILES, &header.files)?;
    write_record(&mut body, TAG_FREE, &header.free_blocks)?;
    write_record(&mut body, TAG_USED, &header.used_blocks)?;

    let mut out = Vec::with_capacity(PREAMBLE_SIZE + body.len());
    out.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
    out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Length of [`encode`]'s output
pub fn encoded_len(header: &MetadataHeader) -> Result<usize> {
    Ok(encode(header)?.len())
}

/// Encode into a zero-padded region of exactly [`HEADER_SIZE`] bytes.
///
/// Fails with [`HeaderError::Capacity`] when the encoding does not fit;
/// nothing is produced in that case.
pub fn encode_region(header: &MetadataHeader) -> Result<Vec<u8>> {
    let bytes = encode(header)?;
    if bytes.len() > HEADER_SIZE {
        return Err(HeaderError::Capacity {
            encoded: bytes.len(),
            limit: HEADER_SIZE,
        });
    }
    let mut region = vec![0u8; HEADER_SIZE];
    region[..bytes.len()].copy_from_slice(&bytes);
    Ok(region)
}

/// Decode a header region (trailing padding is ignored) and verify it.
pub fn decode(region: &[u8]) -> Result<MetadataHeader> {
    if region.len() < PREAMBLE_SIZE {
        return Err(HeaderError::Malformed(format!(
            "region is {} bytes, preamble needs {}",
            region.len(),
            PREAMBLE_SIZE
        )));
    }

    let magic = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
    if magic != HEADER_MAGIC {
        return Err(HeaderError::BadMagic(magic));
    }
    let version = u16::from_le_bytes([region[4], region[5]]);
    if version != HEADER_VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }
    let body_len = u32::from_le_bytes([region[8], region[9], region[10], region[11]]) as usize;
    let stored = u32::from_le_bytes([region[12], region[13], region[14], region[15]]);

    let body = region
        .get(PREAMBLE_SIZE..PREAMBLE_SIZE + body_len)
        .ok_or_else(|| {
            HeaderError::Malformed(format!("body length {} exceeds the region", body_len))
        })?;
    let computed = crc32fast::hash(body);
    if computed != stored {
        return Err(HeaderError::ChecksumMismatch { stored, computed });
    }

    let mut next_file_id = None;
    let mut root: Option<Directory> = None;
    let mut files: BTreeMap<FileId, FileExtent> = BTreeMap::new();
    let mut free_blocks: BTreeSet<u64> = BTreeSet::new();
    let mut used_blocks: BTreeMap<u64, FileId> = BTreeMap::new();

    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < RECORD_PREFIX {
            return Err(HeaderError::Malformed(format!(
                "{} stray bytes after the last record",
                rest.len()
            )));
        }
        let tag = rest[0];
        let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let payload = rest
            .get(RECORD_PREFIX..RECORD_PREFIX + len)
            .ok_or_else(|| {
                HeaderError::Malformed(format!("record {} overruns the body", tag))
            })?;
        rest = &rest[RECORD_PREFIX + len..];

        match tag {
            TAG_NEXT_FILE_ID => next_file_id = Some(read_record(tag, payload)?),
            TAG_ROOT => root = Some(read_record(tag, payload)?),
            TAG_FILES => files = read_record(tag, payload)?,
            TAG_FREE => free_blocks = read_record(tag, payload)?,
            TAG_USED => used_blocks = read_record(tag, payload)?,
            // Unknown record: written by a newer format revision
            _ => {}
        }
    }

    let header = MetadataHeader {
        root: root.ok_or_else(|| HeaderError::Malformed("missing root record".to_string()))?,
        files,
        free_blocks,
        used_blocks,
        next_file_id: next_file_id
            .ok_or_else(|| HeaderError::Malformed("missing file id record".to_string()))?,
    };
    header.verify()?;
    Ok(header)
}

fn write_record<T: Serialize + ?Sized>(body: &mut Vec<u8>, tag: u8, value: &T) -> Result<()> {
    let payload = options()
        .serialize(value)
        .map_err(|e| HeaderError::Encode(format!("record {}: {}", tag, e)))?;
    body.push(tag);
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);
    Ok(())
}

/// Decode one payload. Trailing bytes inside the payload are an error.
fn read_record<T: DeserializeOwned>(tag: u8, payload: &[u8]) -> Result<T> {
    options()
        .with_limit(HEADER_SIZE as u64)
        .deserialize(payload)
        .map_err(|e| HeaderError::Malformed(format!("record {}: {}", tag, e)))
}
