#![forbid(unsafe_code)]
//! Shared types for the arcfs overlay.
//!
//! Path splitting and mount-relative tokenization, the stat/dirent wire
//! model handed back through requests, DOS timestamp conversion, and the
//! little-endian field readers used by the archive decoder.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper bits of mode).
pub const S_IFMT: u32 = 0xF000;
/// Regular file.
pub const S_IFREG: u32 = 0x8000;
/// Directory.
pub const S_IFDIR: u32 = 0x4000;

/// First virtual descriptor minted by a dispatcher.
///
/// Keeps the virtual space clear of stdin/stdout/stderr and the low
/// descriptors a process typically holds at startup.
pub const FIRST_VIRTUAL_FD: i64 = 10;

/// Archive-local entry number (position in the central directory).
///
/// Doubles as the cache file stem: entry 7 extracts to `7.cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u32);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Path splitting ──────────────────────────────────────────────────────────

fn is_separator(c: char) -> bool {
    c == '/' || (cfg!(windows) && c == '\\')
}

/// Strip a leading NT namespace prefix (`\\?\`) on Windows.
///
/// Paths occasionally arrive in NT form rather than DOS form; everything
/// downstream wants the plain path.
#[must_use]
pub fn strip_nt_prefix(path: &str) -> &str {
    if cfg!(windows) {
        if let Some(rest) = path.strip_prefix("\\\\?\\") {
            return rest;
        }
    }
    path
}

/// Split a path into its non-empty segments.
///
/// The second return signals whether the path ended in a separator
/// (directory intent). Repeated separators produce no empty segments.
#[must_use]
pub fn split_path(path: &str) -> (Vec<String>, bool) {
    let ends_with_separator = path.chars().next_back().is_some_and(is_separator);
    let parts = path
        .split(is_separator)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect();
    (parts, ends_with_separator)
}

/// Tokenize `path` relative to `mount_point`.
///
/// Strips the NT prefix, drops `mount_point.len()` leading bytes, then
/// splits the remainder. An empty result addresses the mount root.
#[must_use]
pub fn relative_parts(mount_point: &str, path: &str) -> Vec<String> {
    let stripped = strip_nt_prefix(path);
    let relative = stripped.get(mount_point.len()..).unwrap_or("");
    split_path(relative).0
}

// ── DOS timestamps ──────────────────────────────────────────────────────────

/// Convert a ZIP DOS date/time pair to seconds since the Unix epoch.
///
/// Fields outside the representable range (DOS dates can encode e.g.
/// month 0) collapse to 0 rather than failing the whole parse.
#[must_use]
pub fn dos_to_unix(dos_date: u16, dos_time: u16) -> i64 {
    let year = i32::from((dos_date >> 9) & 0x7f) + 1980;
    let month = u32::from((dos_date >> 5) & 0x0f);
    let day = u32::from(dos_date & 0x1f);
    let hour = u32::from((dos_time >> 11) & 0x1f);
    let minute = u32::from((dos_time >> 5) & 0x3f);
    let second = u32::from((dos_time << 1) & 0x3e);

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

// ── Stat buffer ─────────────────────────────────────────────────────────────

/// The stat result carried back through a request.
///
/// Archive entries fill dev/ino/uid/gid with zeros and set all four
/// timestamps to the entry's last-modified time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBuf {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub btime: i64,
}

impl StatBuf {
    /// Stat for a regular archive file entry.
    #[must_use]
    pub fn regular(size: u64, timestamp: i64) -> Self {
        Self {
            mode: S_IFREG,
            size,
            atime: timestamp,
            mtime: timestamp,
            ctime: timestamp,
            btime: timestamp,
            ..Self::default()
        }
    }

    /// Stat for an archive directory entry.
    #[must_use]
    pub fn directory(timestamp: i64) -> Self {
        Self {
            mode: S_IFDIR,
            atime: timestamp,
            mtime: timestamp,
            ctime: timestamp,
            btime: timestamp,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirentKind {
    File,
    Dir,
    Link,
    Unknown,
}

/// One entry yielded by scandir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    pub name: String,
    pub kind: DirentKind,
}

impl Dirent {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: DirentKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

// ── Little-endian field readers ─────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_simple_path() {
        let (parts, ends) = split_path("a/b/c");
        assert_eq!(parts, ["a", "b", "c"]);
        assert!(!ends);
    }

    #[test]
    fn split_drops_empty_segments() {
        let (parts, ends) = split_path("//a///b//");
        assert_eq!(parts, ["a", "b"]);
        assert!(ends);
    }

    #[test]
    fn split_empty_path() {
        let (parts, ends) = split_path("");
        assert!(parts.is_empty());
        assert!(!ends);
    }

    #[test]
    fn split_root_only() {
        let (parts, ends) = split_path("/");
        assert!(parts.is_empty());
        assert!(ends);
    }

    #[test]
    fn relative_parts_strips_mount_point() {
        assert_eq!(
            relative_parts("/app", "/app/public/index.html"),
            ["public", "index.html"]
        );
    }

    #[test]
    fn relative_parts_mount_root() {
        assert!(relative_parts("/app", "/app").is_empty());
        assert!(relative_parts("/app", "/app/").is_empty());
    }

    #[test]
    fn relative_parts_short_path() {
        // A path shorter than the mount point addresses nothing.
        assert!(relative_parts("/mount/point", "/m").is_empty());
    }

    #[test]
    fn nt_prefix_noop_on_unix() {
        #[cfg(not(windows))]
        assert_eq!(strip_nt_prefix("\\\\?\\C:\\x"), "\\\\?\\C:\\x");
        #[cfg(windows)]
        assert_eq!(strip_nt_prefix("\\\\?\\C:\\x"), "C:\\x");
    }

    #[test]
    fn dos_time_epoch_1990() {
        // 1990-01-01 00:00:00: year=10, month=1, day=1.
        let date = (10 << 9) | (1 << 5) | 1;
        assert_eq!(dos_to_unix(date, 0), 631_152_000);
    }

    #[test]
    fn dos_time_fields() {
        // 2020-06-15 12:30:10.
        let date = (40 << 9) | (6 << 5) | 15;
        let time = (12 << 11) | (30 << 5) | 5;
        let expected = NaiveDate::from_ymd_opt(2020, 6, 15)
            .unwrap()
            .and_hms_opt(12, 30, 10)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(dos_to_unix(date, time), expected);
    }

    #[test]
    fn dos_time_invalid_collapses_to_zero() {
        // Month 0 is not representable.
        assert_eq!(dos_to_unix(10 << 9, 0), 0);
    }

    #[test]
    fn stat_buf_classes() {
        let file = StatBuf::regular(42, 100);
        assert!(file.is_file());
        assert!(!file.is_dir());
        assert_eq!(file.size, 42);
        assert_eq!(file.mtime, 100);
        assert_eq!(file.btime, 100);
        assert_eq!(file.dev, 0);

        let dir = StatBuf::directory(7);
        assert!(dir.is_dir());
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn le_readers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert!(read_le_u32(&bytes, 2).is_err());
    }
}
