#![forbid(unsafe_code)]
//! Archive mounts.
//!
//! A mount binds a ZIP container to a mount-point prefix: mounting
//! parses the central directory into an [`ArchiveIndex`] and brings the
//! on-disk cache up to date (extracting every member on a cold cache,
//! validating cache files on a warm one). The per-operation handlers
//! serve stat/fstat/scandir from the index and retarget open/read/close
//! at the cache files, so reads are plain real-file I/O.

mod index;

pub use index::{ArchiveIndex, DirNode, ExtractState, FileNode, Node, NodeId};

use arcfs_cache::CacheLayout;
use arcfs_error::{ArcError, Result};
use arcfs_loop::{FsCallback, FsRequest, LoopHandle};
use arcfs_types::{relative_parts, split_path, Dirent, DirentKind, StatBuf};
use arcfs_zip::ZipReader;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn enoent() -> i64 {
    -i64::from(libc::ENOENT)
}

fn finish_or_schedule(loop_: &LoopHandle, req: &mut FsRequest, cb: Option<FsCallback>) -> i64 {
    match cb {
        None => req.result,
        Some(cb) => {
            loop_.schedule(std::mem::take(req), cb);
            0
        }
    }
}

#[derive(Debug)]
struct MountInner {
    cache: CacheLayout,
    zip: Option<ZipReader>,
    index: ArchiveIndex,
    digest: String,
    extract_on_mount: bool,
    is_unsafe: bool,
    /// real descriptor of an open cache file → the entry it serves.
    open_files: HashMap<i64, NodeId>,
}

/// One mounted archive.
#[derive(Debug)]
pub struct ArchiveMount {
    mount_point: String,
    archive_path: PathBuf,
    inner: Mutex<MountInner>,
}

impl ArchiveMount {
    #[must_use]
    pub fn new(
        mount_point: impl Into<String>,
        archive_path: impl Into<PathBuf>,
        cache: CacheLayout,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            archive_path: archive_path.into(),
            inner: Mutex::new(MountInner {
                cache,
                zip: None,
                index: ArchiveIndex::new(),
                digest: String::new(),
                extract_on_mount: false,
                is_unsafe: false,
                open_files: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    #[must_use]
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.lock().zip.is_some()
    }

    /// Latched when cache I/O failed mid-mount; entries involved stay
    /// `NotExtracted` and open against them yields `EIO`.
    #[must_use]
    pub fn is_unsafe(&self) -> bool {
        self.inner.lock().is_unsafe
    }

    /// Whether the last mount had to populate a cold cache.
    #[must_use]
    pub fn extracted_on_mount(&self) -> bool {
        self.inner.lock().extract_on_mount
    }

    /// True when every file entry has a validated cache file.
    #[must_use]
    pub fn all_extracted(&self) -> bool {
        self.inner
            .lock()
            .index
            .files()
            .all(|file| file.state == ExtractState::Extracted)
    }

    /// Mount the archive: digest it, prepare the cache directory, parse
    /// the central directory, and extract or validate every member.
    ///
    /// This is the one deliberately blocking path in the overlay.
    pub fn mount(&self) -> Result<()> {
        if self.is_mounted() {
            return Err(ArcError::AlreadyMounted(self.mount_point.clone()));
        }

        let file = File::open(&self.archive_path)
            .map_err(|_| ArcError::ArchiveNotFound(self.archive_path.display().to_string()))?;
        let digest = arcfs_cache::file_digest(&file)?;

        let cache = self.inner.lock().cache.clone();
        cache
            .ensure_root()
            .map_err(|err| ArcError::FailedToCreateCache(err.to_string()))?;
        let (_, created) = cache
            .ensure_archive_dir(&digest)
            .map_err(|err| ArcError::FailedToCreateCache(err.to_string()))?;
        let extract_on_mount = created;

        let zip = ZipReader::from_file(file)?;
        let end = zip.read_end_record()?;
        let records = zip.read_central_directory(&end)?;

        let mut index = ArchiveIndex::new();
        let mut is_unsafe = false;
        for record in &records {
            let Some(node) = index.insert(record) else {
                continue;
            };
            if extract_on_mount {
                extract_entry(&zip, &mut index, &cache, &digest, node, &mut is_unsafe);
            } else {
                validate_entry(&mut index, &cache, &digest, node, &mut is_unsafe);
            }
        }

        let mut inner = self.inner.lock();
        inner.zip = Some(zip);
        inner.index = index;
        inner.digest = digest;
        inner.extract_on_mount = extract_on_mount;
        inner.is_unsafe = is_unsafe;
        inner.open_files.clear();
        info!(
            target: "arcfs::mount",
            mount = %self.mount_point,
            archive = %self.archive_path.display(),
            entries = records.len(),
            cold_cache = extract_on_mount,
            "mounted"
        );
        Ok(())
    }

    /// Release the reader, the index, and the open-file table.
    ///
    /// Cache files stay on disk so a later mount can skip extraction.
    pub fn unmount(&self) {
        let mut inner = self.inner.lock();
        inner.zip = None;
        inner.index = ArchiveIndex::new();
        inner.open_files.clear();
        debug!(target: "arcfs::mount", mount = %self.mount_point, "unmounted");
    }

    /// The cache file backing `full_path`, if it names a file entry.
    #[must_use]
    pub fn cache_file_path(&self, full_path: &str) -> Option<PathBuf> {
        let parts = relative_parts(&self.mount_point, full_path);
        let inner = self.inner.lock();
        let node = inner.index.resolve(&parts)?;
        match inner.index.node(node) {
            Node::File(file) => Some(inner.cache.entry_path(&inner.digest, file.id)),
            Node::Dir(_) => None,
        }
    }

    // ── Operation handlers ──────────────────────────────────────────────

    pub fn fs_stat(
        &self,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        let parts = relative_parts(&self.mount_point, path);
        {
            let inner = self.inner.lock();
            match inner.index.resolve(&parts) {
                None => req.result = enoent(),
                Some(node) => {
                    req.result = 0;
                    req.stat = Some(match inner.index.node(node) {
                        Node::File(file) => StatBuf::regular(file.size, file.mtime),
                        Node::Dir(dir) => StatBuf::directory(dir.mtime),
                    });
                }
            }
        }
        finish_or_schedule(loop_, req, cb)
    }

    pub fn fs_fstat(
        &self,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        real_fd: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        {
            let inner = self.inner.lock();
            match inner.open_files.get(&real_fd) {
                None => req.result = -i64::from(libc::EBADF),
                Some(&node) => {
                    req.result = 0;
                    req.stat = Some(match inner.index.node(node) {
                        Node::File(file) => StatBuf::regular(file.size, file.mtime),
                        Node::Dir(dir) => StatBuf::directory(dir.mtime),
                    });
                }
            }
        }
        finish_or_schedule(loop_, req, cb)
    }

    /// Open an entry by retargeting the call at its cache file.
    ///
    /// `ENOENT` for missing entries and directories, `EIO` when the
    /// entry has no validated cache file. The async form opens through a
    /// shadow request so the caller's captured path survives; the shadow
    /// outcome is copied back before the dispatcher completion fires.
    pub fn fs_open(
        self: &Arc<Self>,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        flags: i32,
        path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        let parts = relative_parts(&self.mount_point, path);
        let resolved = {
            let inner = self.inner.lock();
            match inner.index.resolve(&parts) {
                None => Err(enoent()),
                Some(node) => match inner.index.node(node) {
                    Node::Dir(_) => Err(enoent()),
                    Node::File(file) if file.state != ExtractState::Extracted => {
                        Err(-i64::from(libc::EIO))
                    }
                    Node::File(file) => {
                        Ok((node, inner.cache.entry_path(&inner.digest, file.id)))
                    }
                },
            }
        };

        let (node, cache_path) = match resolved {
            Err(code) => {
                req.result = code;
                return finish_or_schedule(loop_, req, cb);
            }
            Ok(found) => found,
        };
        let cache_path = cache_path.to_string_lossy().into_owned();

        match cb {
            None => {
                // The real open runs on a shadow request so the caller's
                // captured virtual path survives on their request.
                let mut shadow = FsRequest::new();
                let r = loop_.fs_open(&mut shadow, &cache_path, flags, 0o777, None);
                req.result = shadow.result;
                if r >= 0 {
                    self.inner.lock().open_files.insert(r, node);
                }
                r
            }
            Some(cb) => {
                let mount = Arc::clone(self);
                let user_req = std::mem::take(req);
                let mut shadow = FsRequest::new();
                loop_.fs_open(
                    &mut shadow,
                    &cache_path,
                    flags,
                    0o777,
                    Some(Box::new(move |done: FsRequest| {
                        let mut user_req = user_req;
                        if done.result >= 0 {
                            mount.inner.lock().open_files.insert(done.result, node);
                        }
                        user_req.result = done.result;
                        cb(user_req);
                    })),
                )
            }
        }
    }

    pub fn fs_read(
        &self,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        real_fd: i64,
        buf: Vec<u8>,
        offset: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        if !self.inner.lock().open_files.contains_key(&real_fd) {
            req.data = buf;
            req.result = -i64::from(libc::EBADF);
            return finish_or_schedule(loop_, req, cb);
        }
        loop_.fs_read(req, real_fd, buf, offset, cb)
    }

    pub fn fs_close(
        &self,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        real_fd: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        if self.inner.lock().open_files.remove(&real_fd).is_none() {
            req.result = -i64::from(libc::EBADF);
            return finish_or_schedule(loop_, req, cb);
        }
        loop_.fs_close(req, real_fd, cb)
    }

    /// Enumerate a directory: subdirectories first, then files, each in
    /// name order.
    pub fn fs_scandir(
        &self,
        loop_: &LoopHandle,
        req: &mut FsRequest,
        path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        let parts = relative_parts(&self.mount_point, path);
        {
            let inner = self.inner.lock();
            match inner.index.resolve(&parts) {
                None => req.result = enoent(),
                Some(node) => match inner.index.node(node) {
                    Node::File(_) => req.result = -i64::from(libc::ENOTDIR),
                    Node::Dir(dir) => {
                        let mut entries = Vec::with_capacity(dir.dirs.len() + dir.files.len());
                        for name in dir.dirs.keys() {
                            entries.push(Dirent::new(name.clone(), DirentKind::Dir));
                        }
                        for name in dir.files.keys() {
                            entries.push(Dirent::new(name.clone(), DirentKind::File));
                        }
                        req.result = entries.len() as i64;
                        req.set_entries(entries);
                    }
                },
            }
        }
        finish_or_schedule(loop_, req, cb)
    }
}

// ── Extraction ──────────────────────────────────────────────────────────────

fn extract_entry(
    zip: &ZipReader,
    index: &mut ArchiveIndex,
    cache: &CacheLayout,
    digest: &str,
    node: NodeId,
    is_unsafe: &mut bool,
) {
    let Some(file) = index.file_mut(node) else {
        return;
    };
    if file.state != ExtractState::NotExtracted {
        return;
    }
    file.state = ExtractState::Extracting;
    let (entry, offset, method, compressed, uncompressed) = (
        file.id,
        file.offset,
        file.method,
        file.compressed_size,
        file.size,
    );

    let state = match zip.read_entry_data_at(offset, method, compressed, uncompressed) {
        Ok(payload) => {
            let target = cache.entry_path(digest, entry);
            match fs::write(&target, &payload) {
                Ok(()) => ExtractState::Extracted,
                Err(err) => {
                    warn!(
                        target: "arcfs::mount",
                        cache_file = %target.display(),
                        %err,
                        "failed to write cache file"
                    );
                    *is_unsafe = true;
                    ExtractState::NotExtracted
                }
            }
        }
        Err(err) => {
            warn!(target: "arcfs::mount", %entry, %err, "failed to decompress entry");
            ExtractState::NotExtracted
        }
    };

    if let Some(file) = index.file_mut(node) {
        file.state = state;
    }
}

fn validate_entry(
    index: &mut ArchiveIndex,
    cache: &CacheLayout,
    digest: &str,
    node: NodeId,
    is_unsafe: &mut bool,
) {
    let Some(file) = index.file_mut(node) else {
        return;
    };
    if file.state != ExtractState::NotExtracted {
        return;
    }
    file.state = ExtractState::Extracting;
    let entry = file.id;

    let target = cache.entry_path(digest, entry);
    let state = match File::open(&target) {
        Ok(_) => ExtractState::Extracted,
        Err(err) => {
            warn!(
                target: "arcfs::mount",
                cache_file = %target.display(),
                %err,
                "failed to validate cache file"
            );
            *is_unsafe = true;
            ExtractState::NotExtracted
        }
    };

    if let Some(file) = index.file_mut(node) {
        file.state = state;
    }
}

// ── Whole-archive extraction ────────────────────────────────────────────────

/// Unpack every member of `archive_path` under `dest`, without mounting.
///
/// Directory markers become directories; entries whose names climb out
/// of `dest` (absolute or `..`) are skipped.
pub fn extract_to(archive_path: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let dest = dest.as_ref();

    let zip = match ZipReader::open(archive_path) {
        Ok(zip) => zip,
        Err(ArcError::Io(_)) => {
            return Err(ArcError::ArchiveNotFound(
                archive_path.display().to_string(),
            ));
        }
        Err(err) => return Err(err),
    };
    let end = zip.read_end_record()?;

    for record in zip.read_central_directory(&end)? {
        let (parts, _) = split_path(&record.name);
        if parts.is_empty() || parts.iter().any(|part| part == "..") {
            warn!(target: "arcfs::mount", entry = %record.name, "skipping unsafe entry name");
            continue;
        }
        let mut target = dest.to_path_buf();
        for part in &parts {
            target.push(part);
        }

        if record.is_dir {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let payload = zip.read_entry_data(&record)?;
            fs::write(&target, payload)?;
        }
    }
    Ok(())
}
