//! Build context transcoding: zip archive in, gzip-compressed tar out.
//!
//! Output is a pure function of the input bytes. Entries keep their zip
//! order and every tar header is normalised (mtime, uid and gid are zero), so
//! the same upload always produces the same artifact.

use std::io::{Cursor, Read};

use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use zip::result::ZipError;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Errors produced while converting an uploaded archive.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("archive is not a readable zip file: {0}")]
    Malformed(#[from] ZipError),

    #[error("archive entry {0:?} escapes the build context")]
    UnsafePath(String),

    #[error("archive entry {0:?} is a symbolic link, which is not supported")]
    Unsupported(String),

    #[error("archive exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("failed to write tar stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Size bounds applied while transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeLimits {
    /// Cap on the sum of all uncompressed entry sizes.
    pub max_uncompressed_bytes: u64,
}

impl Default for TranscodeLimits {
    fn default() -> Self {
        Self {
            max_uncompressed_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Convert a zip archive into a `.tar.gz` with the default limits.
pub fn transcode(raw: &[u8]) -> Result<Vec<u8>, TranscodeError> {
    transcode_with_limits(raw, TranscodeLimits::default())
}

/// Convert a zip archive into a `.tar.gz`.
pub fn transcode_with_limits(
    raw: &[u8],
    limits: TranscodeLimits,
) -> Result<Vec<u8>, TranscodeError> {
    if u64::try_from(raw.len()).unwrap_or(u64::MAX) > limits.max_uncompressed_bytes {
        return Err(TranscodeError::TooLarge {
            limit: limits.max_uncompressed_bytes,
        });
    }
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))?;
    let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut remaining = limits.max_uncompressed_bytes;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let path = entry
            .enclosed_name()
            .ok_or_else(|| TranscodeError::UnsafePath(name.clone()))?;
        let unix_mode = entry.unix_mode();
        if unix_mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            return Err(TranscodeError::Unsupported(name));
        }

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if entry.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(unix_mode.map_or(DEFAULT_DIR_MODE, |m| m & 0o7777));
            header.set_size(0);
            tar.append_data(&mut header, &path, std::io::empty())?;
            continue;
        }

        if entry.size() > remaining {
            return Err(TranscodeError::TooLarge {
                limit: limits.max_uncompressed_bytes,
            });
        }
        // Declared sizes can lie; never read more than the remaining budget.
        let mut data = Vec::new();
        entry
            .by_ref()
            .take(remaining.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(ZipError::Io)?;
        let len = data.len() as u64;
        if len > remaining {
            return Err(TranscodeError::TooLarge {
                limit: limits.max_uncompressed_bytes,
            });
        }
        remaining -= len;

        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(unix_mode.map_or(DEFAULT_FILE_MODE, |m| m & 0o7777));
        header.set_size(len);
        tar.append_data(&mut header, &path, data.as_slice())?;
    }

    let gz = tar.into_inner()?;
    Ok(gz.finish()?)
}
