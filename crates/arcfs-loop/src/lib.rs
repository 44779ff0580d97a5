#![forbid(unsafe_code)]
//! Event-loop facade for the arcfs overlay.
//!
//! Wraps a tokio runtime handle and exposes the real-filesystem
//! primitives the dispatcher delegates to, each in dual form: with no
//! callback the operation runs synchronously on the caller's thread and
//! the return value is the result; with a callback the same body runs on
//! the blocking pool and the callback fires on a later loop iteration.
//!
//! [`LoopHandle::schedule`] is the deferred-completion path: it delivers
//! an already-finished request through the loop so a caller's stack
//! always unwinds before its callback runs, even for operations that
//! never touched the disk.

mod realfs;
mod request;

pub use realfs::FileTable;
pub use request::{FsCallback, FsOp, FsRequest};

use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::error;

/// Handle to the loop hosting the overlay.
///
/// Cheap to clone; all clones share one open-file table.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tokio: Handle,
    files: Arc<FileTable>,
}

impl LoopHandle {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            tokio: handle,
            files: Arc::new(FileTable::new()),
        }
    }

    /// Bind to the runtime the caller is already inside.
    ///
    /// Panics outside a tokio runtime context, matching
    /// `Handle::current`.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// The shared open-file table (exposed for diagnostics and tests).
    #[must_use]
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Deliver a finished request's callback on a future loop iteration.
    ///
    /// The callback runs exactly once, on the loop, never re-entrantly
    /// from the caller's stack.
    pub fn schedule(&self, req: FsRequest, cb: FsCallback) {
        self.tokio.spawn(async move { cb(req) });
    }

    /// Run an operation body sync or async depending on `cb`.
    ///
    /// Async form: the caller's request is taken (left empty), the body
    /// runs on the blocking pool, and the finished request is handed to
    /// the callback on the loop. Return value is 0 on submit.
    fn run<F>(&self, req: &mut FsRequest, op: FsOp, cb: Option<FsCallback>, body: F) -> i64
    where
        F: FnOnce(&FileTable, &mut FsRequest) + Send + 'static,
    {
        match cb {
            None => {
                req.init(op);
                body(&self.files, req);
                req.result
            }
            Some(cb) => {
                let mut owned = std::mem::take(req);
                owned.init(op);
                let files = Arc::clone(&self.files);
                self.tokio.spawn(async move {
                    let done = tokio::task::spawn_blocking(move || {
                        body(&files, &mut owned);
                        owned
                    })
                    .await;
                    match done {
                        Ok(done) => cb(done),
                        // A panicking body loses the request; nothing sane
                        // can be delivered to the callback.
                        Err(err) => error!(target: "arcfs::loop", %err, "blocking body failed"),
                    }
                });
                0
            }
        }
    }

    pub fn fs_stat(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Stat, cb, move |_, req| realfs::stat(req, &path))
    }

    pub fn fs_lstat(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Lstat, cb, move |_, req| realfs::lstat(req, &path))
    }

    pub fn fs_fstat(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        self.run(req, FsOp::Fstat, cb, move |t, req| realfs::fstat(t, req, file))
    }

    pub fn fs_open(
        &self,
        req: &mut FsRequest,
        path: &str,
        flags: i32,
        mode: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Open, cb, move |t, req| {
            realfs::open(t, req, &path, flags, mode);
        })
    }

    /// Read `buf.len()` bytes at `offset` (`-1` = file cursor).
    ///
    /// The buffer travels through `req.data` and comes back with the
    /// request; the result is the byte count.
    pub fn fs_read(
        &self,
        req: &mut FsRequest,
        file: i64,
        buf: Vec<u8>,
        offset: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        req.data = buf;
        self.run(req, FsOp::Read, cb, move |t, req| {
            realfs::read(t, req, file, offset);
        })
    }

    pub fn fs_write(
        &self,
        req: &mut FsRequest,
        file: i64,
        buf: Vec<u8>,
        offset: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        req.data = buf;
        self.run(req, FsOp::Write, cb, move |t, req| {
            realfs::write(t, req, file, offset);
        })
    }

    pub fn fs_close(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        self.run(req, FsOp::Close, cb, move |t, req| realfs::close(t, req, file))
    }

    pub fn fs_scandir(
        &self,
        req: &mut FsRequest,
        path: &str,
        _flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Scandir, cb, move |_, req| {
            realfs::scandir(req, &path);
        })
    }

    pub fn fs_realpath(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Realpath, cb, move |_, req| {
            realfs::realpath(req, &path);
        })
    }

    pub fn fs_fsync(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        self.run(req, FsOp::Fsync, cb, move |t, req| realfs::fsync(t, req, file))
    }

    pub fn fs_fdatasync(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        self.run(req, FsOp::Fdatasync, cb, move |t, req| {
            realfs::fdatasync(t, req, file);
        })
    }

    pub fn fs_ftruncate(
        &self,
        req: &mut FsRequest,
        file: i64,
        len: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        self.run(req, FsOp::Ftruncate, cb, move |t, req| {
            realfs::ftruncate(t, req, file, len);
        })
    }

    pub fn fs_sendfile(
        &self,
        req: &mut FsRequest,
        out_fd: i64,
        in_fd: i64,
        in_offset: i64,
        length: usize,
        cb: Option<FsCallback>,
    ) -> i64 {
        self.run(req, FsOp::Sendfile, cb, move |t, req| {
            realfs::sendfile(t, req, out_fd, in_fd, in_offset, length);
        })
    }

    pub fn fs_futime(
        &self,
        req: &mut FsRequest,
        file: i64,
        atime: f64,
        mtime: f64,
        cb: Option<FsCallback>,
    ) -> i64 {
        self.run(req, FsOp::Futime, cb, move |t, req| {
            realfs::futime(t, req, file, atime, mtime);
        })
    }

    pub fn fs_fchmod(
        &self,
        req: &mut FsRequest,
        file: i64,
        mode: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        self.run(req, FsOp::Fchmod, cb, move |t, req| {
            realfs::fchmod(t, req, file, mode);
        })
    }

    pub fn fs_fchown(
        &self,
        req: &mut FsRequest,
        file: i64,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        self.run(req, FsOp::Fchown, cb, move |t, req| {
            realfs::fchown(t, req, file, uid, gid);
        })
    }

    pub fn fs_chown(
        &self,
        req: &mut FsRequest,
        path: &str,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Chown, cb, move |_, req| {
            realfs::chown(req, &path, uid, gid);
        })
    }

    pub fn fs_lchown(
        &self,
        req: &mut FsRequest,
        path: &str,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Lchown, cb, move |_, req| {
            realfs::lchown(req, &path, uid, gid);
        })
    }

    pub fn fs_mkdir(
        &self,
        req: &mut FsRequest,
        path: &str,
        mode: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Mkdir, cb, move |_, req| {
            realfs::mkdir(req, &path, mode);
        })
    }

    pub fn fs_mkdtemp(&self, req: &mut FsRequest, template: &str, cb: Option<FsCallback>) -> i64 {
        let template = template.to_owned();
        self.run(req, FsOp::Mkdtemp, cb, move |_, req| {
            realfs::mkdtemp(req, &template);
        })
    }

    pub fn fs_rmdir(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Rmdir, cb, move |_, req| realfs::rmdir(req, &path))
    }

    pub fn fs_unlink(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Unlink, cb, move |_, req| realfs::unlink(req, &path))
    }

    pub fn fs_rename(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        let new_path = new_path.to_owned();
        self.run(req, FsOp::Rename, cb, move |_, req| {
            realfs::rename(req, &path, &new_path);
        })
    }

    pub fn fs_access(
        &self,
        req: &mut FsRequest,
        path: &str,
        mode: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Access, cb, move |_, req| {
            realfs::access(req, &path, mode);
        })
    }

    pub fn fs_chmod(
        &self,
        req: &mut FsRequest,
        path: &str,
        mode: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Chmod, cb, move |_, req| {
            realfs::chmod(req, &path, mode);
        })
    }

    pub fn fs_utime(
        &self,
        req: &mut FsRequest,
        path: &str,
        atime: f64,
        mtime: f64,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Utime, cb, move |_, req| {
            realfs::utime(req, &path, atime, mtime);
        })
    }

    pub fn fs_link(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        let new_path = new_path.to_owned();
        self.run(req, FsOp::Link, cb, move |_, req| {
            realfs::link(req, &path, &new_path);
        })
    }

    pub fn fs_symlink(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        _flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        let new_path = new_path.to_owned();
        self.run(req, FsOp::Symlink, cb, move |_, req| {
            realfs::symlink(req, &path, &new_path);
        })
    }

    pub fn fs_readlink(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        let path = path.to_owned();
        self.run(req, FsOp::Readlink, cb, move |_, req| {
            realfs::readlink(req, &path);
        })
    }

    pub fn fs_copyfile(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        _flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        let path = path.to_owned();
        let new_path = new_path.to_owned();
        self.run(req, FsOp::Copyfile, cb, move |_, req| {
            realfs::copyfile(req, &path, &new_path);
        })
    }
}
