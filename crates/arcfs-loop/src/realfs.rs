//! Synchronous real-filesystem operation bodies.
//!
//! Each function fills a request in place: result code, stat buffer,
//! entries, or string result. The async forms in `lib.rs` run these same
//! bodies on the blocking pool, so sync and async observe identical
//! semantics by construction.
//!
//! Open files are held in a [`FileTable`] keyed by their OS descriptor;
//! the descriptor number is what travels through requests.

use crate::request::FsRequest;
use arcfs_error::errno_result;
use arcfs_types::{Dirent, DirentKind, StatBuf};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Open real files, keyed by OS descriptor.
#[derive(Debug, Default)]
pub struct FileTable {
    files: Mutex<HashMap<i64, Arc<File>>>,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, file: File) -> i64 {
        let fd = i64::from(file.as_raw_fd());
        self.files.lock().insert(fd, Arc::new(file));
        fd
    }

    fn get(&self, fd: i64) -> Option<Arc<File>> {
        self.files.lock().get(&fd).cloned()
    }

    fn remove(&self, fd: i64) -> Option<Arc<File>> {
        self.files.lock().remove(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

fn bad_descriptor() -> i64 {
    -i64::from(libc::EBADF)
}

fn finish(req: &mut FsRequest, res: std::io::Result<i64>) {
    req.result = match res {
        Ok(value) => value,
        Err(err) => errno_result(&err),
    };
}

fn stat_from_metadata(meta: &fs::Metadata) -> StatBuf {
    let btime = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);
    StatBuf {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        btime,
    }
}

fn system_time_from_secs(secs: f64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}

pub(crate) fn stat(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    match fs::metadata(path) {
        Ok(meta) => {
            req.stat = Some(stat_from_metadata(&meta));
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn lstat(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            req.stat = Some(stat_from_metadata(&meta));
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn fstat(table: &FileTable, req: &mut FsRequest, fd: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    match file.metadata() {
        Ok(meta) => {
            req.stat = Some(stat_from_metadata(&meta));
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn open(table: &FileTable, req: &mut FsRequest, path: &str, flags: i32, mode: u32) {
    req.path = Some(path.to_owned());

    let mut opts = OpenOptions::new();
    let access = flags & libc::O_ACCMODE;
    opts.read(access == libc::O_RDONLY || access == libc::O_RDWR);
    opts.write(access == libc::O_WRONLY || access == libc::O_RDWR);
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    opts.mode(mode);
    let extra =
        flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL);
    if extra != 0 {
        opts.custom_flags(extra);
    }

    match opts.open(path) {
        Ok(file) => req.result = table.insert(file),
        Err(err) => req.result = errno_result(&err),
    }
}

/// Read into `req.data` at `offset` (`-1` reads at the file cursor).
pub(crate) fn read(table: &FileTable, req: &mut FsRequest, fd: i64, offset: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    let res = if offset >= 0 {
        file.read_at(&mut req.data, offset as u64)
    } else {
        (&*file).read(&mut req.data)
    };
    finish(req, res.map(|n| n as i64));
}

pub(crate) fn write(table: &FileTable, req: &mut FsRequest, fd: i64, offset: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    let res = if offset >= 0 {
        file.write_at(&req.data, offset as u64)
    } else {
        (&*file).write(&req.data)
    };
    finish(req, res.map(|n| n as i64));
}

pub(crate) fn close(table: &FileTable, req: &mut FsRequest, fd: i64) {
    req.result = match table.remove(fd) {
        Some(_) => 0,
        None => bad_descriptor(),
    };
}

pub(crate) fn scandir(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    let iter = match fs::read_dir(path) {
        Ok(iter) => iter,
        Err(err) => {
            req.result = errno_result(&err);
            return;
        }
    };

    let mut entries = Vec::new();
    for item in iter {
        match item {
            Ok(entry) => entries.push(dirent_from(&entry)),
            Err(err) => {
                req.result = errno_result(&err);
                return;
            }
        }
    }
    req.result = entries.len() as i64;
    req.set_entries(entries);
}

fn dirent_from(entry: &fs::DirEntry) -> Dirent {
    let kind = entry.file_type().map_or(DirentKind::Unknown, |t| {
        if t.is_dir() {
            DirentKind::Dir
        } else if t.is_symlink() {
            DirentKind::Link
        } else if t.is_file() {
            DirentKind::File
        } else {
            DirentKind::Unknown
        }
    });
    Dirent::new(entry.file_name().to_string_lossy().into_owned(), kind)
}

pub(crate) fn realpath(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    match fs::canonicalize(path) {
        Ok(resolved) => {
            req.link = Some(resolved.display().to_string());
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn fsync(table: &FileTable, req: &mut FsRequest, fd: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    finish(req, file.sync_all().map(|()| 0));
}

pub(crate) fn fdatasync(table: &FileTable, req: &mut FsRequest, fd: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    finish(req, file.sync_data().map(|()| 0));
}

pub(crate) fn ftruncate(table: &FileTable, req: &mut FsRequest, fd: i64, len: i64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    finish(req, file.set_len(len.max(0) as u64).map(|()| 0));
}

pub(crate) fn sendfile(
    table: &FileTable,
    req: &mut FsRequest,
    out_fd: i64,
    in_fd: i64,
    in_offset: i64,
    length: usize,
) {
    let (Some(out), Some(input)) = (table.get(out_fd), table.get(in_fd)) else {
        req.result = bad_descriptor();
        return;
    };

    let mut buf = vec![0_u8; length];
    let mut filled = 0_usize;
    if in_offset >= 0 {
        let mut offset = in_offset as u64;
        while filled < length {
            match input.read_at(&mut buf[filled..], offset) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(err) => {
                    req.result = errno_result(&err);
                    return;
                }
            }
        }
    } else {
        while filled < length {
            match (&*input).read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    req.result = errno_result(&err);
                    return;
                }
            }
        }
    }

    finish(req, (&*out).write_all(&buf[..filled]).map(|()| filled as i64));
}

pub(crate) fn futime(table: &FileTable, req: &mut FsRequest, fd: i64, atime: f64, mtime: f64) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    let times = FileTimes::new()
        .set_accessed(system_time_from_secs(atime))
        .set_modified(system_time_from_secs(mtime));
    finish(req, file.set_times(times).map(|()| 0));
}

pub(crate) fn fchmod(table: &FileTable, req: &mut FsRequest, fd: i64, mode: u32) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    finish(
        req,
        file.set_permissions(Permissions::from_mode(mode)).map(|()| 0),
    );
}

pub(crate) fn fchown(table: &FileTable, req: &mut FsRequest, fd: i64, uid: u32, gid: u32) {
    let Some(file) = table.get(fd) else {
        req.result = bad_descriptor();
        return;
    };
    finish(
        req,
        std::os::unix::fs::fchown(&*file, Some(uid), Some(gid)).map(|()| 0),
    );
}

pub(crate) fn chown(req: &mut FsRequest, path: &str, uid: u32, gid: u32) {
    req.path = Some(path.to_owned());
    finish(
        req,
        std::os::unix::fs::chown(path, Some(uid), Some(gid)).map(|()| 0),
    );
}

pub(crate) fn lchown(req: &mut FsRequest, path: &str, uid: u32, gid: u32) {
    req.path = Some(path.to_owned());
    finish(
        req,
        std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map(|()| 0),
    );
}

pub(crate) fn mkdir(req: &mut FsRequest, path: &str, mode: u32) {
    req.path = Some(path.to_owned());
    finish(
        req,
        fs::DirBuilder::new().mode(mode).create(path).map(|()| 0),
    );
}

/// Create a unique directory from a `...XXXXXX` template.
pub(crate) fn mkdtemp(req: &mut FsRequest, template: &str) {
    req.path = Some(template.to_owned());
    let stem = template.strip_suffix("XXXXXX").unwrap_or(template);
    let stem_path = Path::new(stem);
    let parent = match stem_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let prefix = stem_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match tempfile::Builder::new().prefix(&prefix).tempdir_in(parent) {
        Ok(dir) => {
            req.link = Some(dir.keep().display().to_string());
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn rmdir(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    finish(req, fs::remove_dir(path).map(|()| 0));
}

pub(crate) fn unlink(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    finish(req, fs::remove_file(path).map(|()| 0));
}

pub(crate) fn rename(req: &mut FsRequest, path: &str, new_path: &str) {
    req.path = Some(path.to_owned());
    finish(req, fs::rename(path, new_path).map(|()| 0));
}

pub(crate) fn access(req: &mut FsRequest, path: &str, mode: i32) {
    req.path = Some(path.to_owned());
    match fs::metadata(path) {
        Ok(meta) => {
            if mode & libc::W_OK != 0 && meta.permissions().readonly() {
                req.result = -i64::from(libc::EACCES);
            } else {
                req.result = 0;
            }
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn chmod(req: &mut FsRequest, path: &str, mode: u32) {
    req.path = Some(path.to_owned());
    finish(
        req,
        fs::set_permissions(path, Permissions::from_mode(mode)).map(|()| 0),
    );
}

pub(crate) fn utime(req: &mut FsRequest, path: &str, atime: f64, mtime: f64) {
    req.path = Some(path.to_owned());
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            req.result = errno_result(&err);
            return;
        }
    };
    let times = FileTimes::new()
        .set_accessed(system_time_from_secs(atime))
        .set_modified(system_time_from_secs(mtime));
    finish(req, file.set_times(times).map(|()| 0));
}

pub(crate) fn link(req: &mut FsRequest, path: &str, new_path: &str) {
    req.path = Some(path.to_owned());
    finish(req, fs::hard_link(path, new_path).map(|()| 0));
}

pub(crate) fn symlink(req: &mut FsRequest, path: &str, new_path: &str) {
    req.path = Some(path.to_owned());
    finish(req, std::os::unix::fs::symlink(path, new_path).map(|()| 0));
}

pub(crate) fn readlink(req: &mut FsRequest, path: &str) {
    req.path = Some(path.to_owned());
    match fs::read_link(path) {
        Ok(target) => {
            req.link = Some(target.display().to_string());
            req.result = 0;
        }
        Err(err) => req.result = errno_result(&err),
    }
}

pub(crate) fn copyfile(req: &mut FsRequest, path: &str, new_path: &str) {
    req.path = Some(path.to_owned());
    finish(req, fs::copy(path, new_path).map(|_| 0));
}
