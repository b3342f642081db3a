//! Filesystem sandbox helpers
//!
//! Every path derived from client input is verified to resolve, after
//! symlink evaluation, inside its sandbox root. Request names additionally
//! go through repeated percent-decoding so overlong encodings and NUL
//! injection cannot smuggle separators past the check.

use std::path::{Path, PathBuf};

use crate::errors::FsError;

/// Maximum percent-decode passes applied to request names
const DECODE_PASSES: usize = 3;

/// Percent-decode a request name repeatedly, then reject separators,
/// traversal sequences, and NUL bytes. Returns the fully decoded name.
pub fn sanitize_name(raw: &str) -> Result<String, FsError> {
    let mut name = raw.to_string();
    for _ in 0..DECODE_PASSES {
        let decoded = percent_decode(&name);
        if decoded == name {
            break;
        }
        name = decoded;
    }

    if name.is_empty()
        || name.contains('\0')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(FsError::InvalidName {
            name: raw.to_string(),
        });
    }
    Ok(name)
}

fn percent_decode(input: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Verify that `path` resolves inside `root` after symlink evaluation.
/// For paths that do not exist yet, the nearest existing ancestor is
/// canonicalized and the remainder re-appended.
pub fn validate_within_root(path: &Path, root: &Path) -> Result<PathBuf, FsError> {
    let canonical_root = root.canonicalize().map_err(|source| FsError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let canonical = if path.exists() {
        path.canonicalize().map_err(|source| FsError::Io {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        let parent = path.parent().ok_or_else(|| FsError::PathEscape {
            path: path.to_path_buf(),
        })?;
        let file_name = path.file_name().ok_or_else(|| FsError::PathEscape {
            path: path.to_path_buf(),
        })?;
        let canonical_parent = parent.canonicalize().map_err(|source| FsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        canonical_parent.join(file_name)
    };

    if canonical.starts_with(&canonical_root) {
        Ok(canonical)
    } else {
        Err(FsError::PathEscape {
            path: path.to_path_buf(),
        })
    }
}
