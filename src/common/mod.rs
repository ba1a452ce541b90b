//! Common utilities and types module.
//!
//! Holds the descriptive archive data model shared by the codec, the cipher
//! layer and the engine, plus entry path normalisation and the DOS timestamp
//! conversions the container uses.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::compress::CompressionMethod;
use crate::crypto::EncryptionHeader;
use crate::error::{CodecError, PathRejection};

/// Default mode recorded for entries whose source carries no permission bits.
pub const DEFAULT_FILE_MODE: u32 = 0o100644;
pub const DEFAULT_DIR_MODE: u32 = 0o040755;

/// One logical file inside an archive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative, forward-slash separated path. Unique within the archive.
    pub path: String,
    pub uncompressed_size: u64,
    /// Size of the payload as stored, ciphertext included for sealed entries.
    pub compressed_size: u64,
    /// CRC-32 of the uncompressed plaintext.
    pub crc32: u32,
    pub method: CompressionMethod,
    /// Last-modified time, at the container's 2-second resolution.
    pub modified: NaiveDateTime,
    /// Unix mode bits (file type and permissions).
    pub permissions: u32,
    /// `None` means the entry is stored in clear.
    pub encryption: Option<EncryptionHeader>,
    /// Byte offset of the entry's local header in the archive stream.
    pub header_offset: u64,
}

impl ArchiveEntry {
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// Ordered entries of one archive plus its global comment.
///
/// Purely descriptive: it owns no file handles and is rebuilt on every read.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub entries: Vec<ArchiveEntry>,
    pub comment: String,
    /// Length of the whole serialized archive stream.
    pub total_length: u64,
}

impl ArchiveManifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn position(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    pub fn total_uncompressed(&self) -> u64 {
        self.entries.iter().map(|e| e.uncompressed_size).sum()
    }

    pub fn total_compressed(&self) -> u64 {
        self.entries.iter().map(|e| e.compressed_size).sum()
    }

    pub fn has_encrypted_entries(&self) -> bool {
        self.entries.iter().any(ArchiveEntry::is_encrypted)
    }
}

/// Normalize an entry path: backslashes become forward slashes, `.` segments
/// and repeated slashes are dropped.
pub fn normalize_path(path: &str) -> String {
    let s = path.replace('\\', "/");
    let segs: Vec<&str> = s
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();
    let mut out = segs.join("/");
    if s.starts_with('/') {
        out.insert(0, '/');
    }
    // a trailing slash marks a directory entry; keep it
    if s.ends_with('/') && !segs.is_empty() {
        out.push('/');
    }
    out
}

/// Normalizes `raw` and checks it is acceptable as an archive entry path.
pub fn validate_entry_path(raw: &str) -> Result<String, CodecError> {
    let reject = |reason| CodecError::InvalidPath {
        path: raw.to_string(),
        reason,
    };
    if raw.contains('\0') {
        return Err(reject(PathRejection::NulByte));
    }
    let path = normalize_path(raw);
    if path.is_empty() || path == "/" || path == "." {
        return Err(reject(PathRejection::Empty));
    }
    if path.starts_with('/') || has_drive_prefix(&path) {
        return Err(reject(PathRejection::Absolute));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(reject(PathRejection::ParentTraversal));
    }
    if path.len() > u16::MAX as usize {
        return Err(reject(PathRejection::TooLong));
    }
    Ok(path)
}

fn has_drive_prefix(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

fn dos_max() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2107, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 58))
        .unwrap_or_default()
}

/// Clamp a timestamp into the DOS range and round seconds down to even.
pub fn normalize_timestamp(t: NaiveDateTime) -> NaiveDateTime {
    let t = t.clamp(dos_epoch(), dos_max());
    let truncated = t.with_nanosecond(0).unwrap_or(t);
    truncated
        .with_second(truncated.second() & !1)
        .unwrap_or(truncated)
}

pub fn timestamp_from_system(t: std::time::SystemTime) -> NaiveDateTime {
    normalize_timestamp(DateTime::<Utc>::from(t).naive_utc())
}

/// The earliest representable time, used by deterministic archives.
pub fn deterministic_timestamp() -> NaiveDateTime {
    dos_epoch()
}

/// Returns `(time, date)` in MS-DOS format.
pub fn to_dos_datetime(t: &NaiveDateTime) -> (u16, u16) {
    let t = normalize_timestamp(*t);
    let time = ((t.hour() as u16) << 11) | ((t.minute() as u16) << 5) | ((t.second() as u16) / 2);
    let date =
        (((t.year() - 1980) as u16) << 9) | ((t.month() as u16) << 5) | (t.day() as u16);
    (time, date)
}

/// Decode an MS-DOS `(time, date)` pair. Out-of-range fields fall back to 1980-01-01.
pub fn from_dos_datetime(time: u16, date: u16) -> NaiveDateTime {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .unwrap_or_else(dos_epoch)
}
