//! Absolute path parsing

use crate::{FsError, PathReason, Result};

/// Split an absolute path into its segments.
///
/// `/` alone yields no segments. One trailing `/` is tolerated; any other
/// empty segment is rejected, as are `.` and `..`.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(FsError::path(path, PathReason::NotAbsolute));
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    rest.split('/')
        .map(|segment| match segment {
            "" => Err(FsError::path(path, PathReason::EmptySegment)),
            "." | ".." => Err(FsError::path(
                path,
                PathReason::InvalidName(segment.to_string()),
            )),
            _ => Ok(segment),
        })
        .collect()
}

/// Check a single entry name as used by rename.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::path(name, PathReason::InvalidName(name.to_string())));
    }
    Ok(())
}
