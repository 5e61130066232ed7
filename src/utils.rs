//! Utility functions

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// A file modification time with nanosecond precision.
///
/// Orders like the underlying timestamps; [`FileTime::oldest`] sorts before
/// every real timestamp and doubles as "never".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FileTime {
    secs: i64,
    nanos: u32,
}

impl FileTime {
    pub fn oldest() -> Self {
        Self { secs: i64::MIN, nanos: 0 }
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::oldest() && *self != Self::default()
    }
}

impl From<SystemTime> for FileTime {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self { secs: d.as_secs() as i64, nanos: d.subsec_nanos() },
            Err(e) => {
                let d = e.duration();
                Self { secs: -(d.as_secs() as i64), nanos: d.subsec_nanos() }
            }
        }
    }
}

/// Reads the modification time of `path`, or `None` if the file is gone.
pub fn file_time(path: &Path) -> Option<FileTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(Into::into)
}

/// Returns the canonical form of `path` without UNC prefixes on Windows.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| Error::io(err, path))
}

/// Lexically cleans a path: resolves `.` and `..` components without
/// touching the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves `path` against `base` if it is relative, then cleans it.
pub fn resolve_path(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        clean_path(path)
    } else {
        clean_path(&base.join(path))
    }
}

/// Splits an absolute file path into its directory and file name parts.
pub fn split_file_path(path: &Path) -> (PathBuf, String) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    (dir, name)
}

/// The file name without its last extension, `liba.so.1` -> `liba.so`.
pub fn base_name(path: &Path) -> String {
    path.file_stem().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// The file name without any extensions, `liba.so.1` -> `liba`.
pub fn complete_base_name(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Creates the parent directory of `path` and all of its ancestors.
pub fn create_parent_dir_all(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::io(err, parent))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("/a/./b")), PathBuf::from("/a/b"));
    }

    #[test]
    fn resolve_relative_against_base() {
        assert_eq!(resolve_path(Path::new("/base"), "x/y.o"), PathBuf::from("/base/x/y.o"));
        assert_eq!(resolve_path(Path::new("/base"), "/abs/y.o"), PathBuf::from("/abs/y.o"));
    }

    #[test]
    fn base_names() {
        assert_eq!(base_name(Path::new("/x/liba.so.1")), "liba.so");
        assert_eq!(complete_base_name(Path::new("/x/liba.so.1")), "liba");
        assert_eq!(complete_base_name(Path::new("/x/main.c")), "main");
    }

    #[test]
    fn file_time_ordering() {
        assert!(FileTime::oldest() < FileTime::now());
        assert!(!FileTime::default().is_valid());
    }
}
