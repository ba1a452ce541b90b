//! Filesystem helpers.
//!
//! On Unix we re-export std::fs and apply POSIX permission bits on extraction.
//! On other platforms permission bits are read as defaults and never written.
//! Everything that maps an archive path onto the destination tree goes through
//! [`safe_join`], so no entry can land outside the extraction root.

use std::fs::{File, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::common::{self, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::error::{CodecError, PathRejection};

pub use std::fs::*;

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
/// No-op off Unix: POSIX permission bits are not preserved.
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
/// Mode bits (file type included) to record for a source file.
pub fn file_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
pub fn file_mode(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else if meta.permissions().readonly() {
        DEFAULT_FILE_MODE & !0o222
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Default mode for an entry of the given kind, used by deterministic archives.
pub fn default_mode(is_dir: bool) -> u32 {
    if is_dir {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Maps an archive entry path onto `root`. The path is validated again here so
/// a hostile manifest cannot escape `root` even if it slipped past parsing.
pub fn safe_join(root: &Path, entry_path: &str) -> Result<PathBuf, CodecError> {
    let rel = common::validate_entry_path(entry_path)?;
    let mut out = root.to_path_buf();
    for comp in Path::new(rel.trim_end_matches('/')).components() {
        match comp {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => {
                return Err(CodecError::InvalidPath {
                    path: entry_path.to_string(),
                    reason: PathRejection::ParentTraversal,
                })
            }
        }
    }
    Ok(out)
}

pub fn modified_time(meta: &Metadata) -> NaiveDateTime {
    match meta.modified() {
        Ok(t) => common::timestamp_from_system(t),
        Err(_) => common::deterministic_timestamp(),
    }
}

/// Sets the modification time of an existing file.
pub fn set_modified(path: &Path, t: &NaiveDateTime) -> io::Result<()> {
    let when: SystemTime = Utc.from_utc_datetime(t).into();
    let file = File::options().write(true).open(path)?;
    file.set_modified(when)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_stays_under_root() {
        let root = Path::new("/srv/out");
        assert_eq!(safe_join(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert_eq!(safe_join(root, "docs/").unwrap(), root.join("docs"));
        assert!(safe_join(root, "../x").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "a/../../x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn permissions_and_mtime_are_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        set_unix_permissions(&path, 0o100600).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let t = chrono::NaiveDate::from_ymd_opt(2001, 9, 9)
            .unwrap()
            .and_hms_opt(1, 46, 40)
            .unwrap();
        set_modified(&path, &t).unwrap();
        assert_eq!(modified_time(&std::fs::metadata(&path).unwrap()), t);
    }
}
