#![forbid(unsafe_code)]
//! The overlay dispatcher.
//!
//! [`VfsManager`] exposes the full filesystem surface. Path-keyed calls
//! route to the archive mount with the longest mount-point prefix match
//! (anchored at the start of the path) or fall through to the real
//! filesystem; descriptor-keyed calls translate the virtual descriptor
//! through the [`DescriptorTable`] first. Both routes preserve the
//! caller's sync/async shape: no callback means the return value is the
//! result, a callback means it fires exactly once on a later loop
//! iteration with the finished request.
//!
//! During an async call the user callback and virtual descriptor ride in
//! a sheath parked in the request's user-data slot; the dispatcher's
//! internal completion unsheathes before handing the request back.

mod table;

pub use table::{DescriptorTable, Source};

use arcfs_cache::CacheLayout;
use arcfs_error::{ArcError, Result};
use arcfs_loop::{FsCallback, FsOp, FsRequest, LoopHandle};
use arcfs_mount::ArchiveMount;
use arcfs_types::{strip_nt_prefix, Dirent};
use parking_lot::Mutex;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, trace};

fn enoent() -> i64 {
    -i64::from(libc::ENOENT)
}

fn ecanceled() -> i64 {
    -i64::from(libc::ECANCELED)
}

// ── Request sheath ──────────────────────────────────────────────────────────

/// Per-request context for an async call in flight.
///
/// Attached to the request's user-data slot on entry, removed inside the
/// dispatcher's internal completion before the user callback runs. The
/// caller's own user-data is saved and restored around it.
struct Sheath {
    cb: FsCallback,
    virtual_fd: i64,
    mount: Option<Arc<ArchiveMount>>,
    saved_user_data: Option<Box<dyn Any + Send>>,
}

impl Sheath {
    fn attach(
        req: &mut FsRequest,
        cb: FsCallback,
        virtual_fd: i64,
        mount: Option<Arc<ArchiveMount>>,
    ) {
        let saved_user_data = req.user_data.take();
        req.user_data = Some(Box::new(Self {
            cb,
            virtual_fd,
            mount,
            saved_user_data,
        }));
    }

    fn detach(req: &mut FsRequest) -> Option<Self> {
        let boxed = req.user_data.take()?;
        match boxed.downcast::<Self>() {
            Ok(sheath) => {
                let mut sheath = *sheath;
                req.user_data = sheath.saved_user_data.take();
                Some(sheath)
            }
            Err(other) => {
                req.user_data = Some(other);
                None
            }
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ManagerInner {
    mounts: Vec<Arc<ArchiveMount>>,
    table: DescriptorTable,
}

/// The overlay dispatcher: owns the mounts and the descriptor table.
pub struct VfsManager {
    loop_: LoopHandle,
    cache: CacheLayout,
    inner: Mutex<ManagerInner>,
}

impl VfsManager {
    /// Create a dispatcher bound to `loop_`.
    ///
    /// The cache root (default `<tmp>/archive_cache`) is created up
    /// front so mounts only have to make their own subdirectory.
    pub fn new(loop_: LoopHandle, cache_root: Option<PathBuf>) -> Result<Arc<Self>> {
        let cache = match cache_root {
            Some(root) => CacheLayout::new(root),
            None => CacheLayout::at_default(),
        };
        cache
            .ensure_root()
            .map_err(|err| ArcError::FailedToCreateCache(err.to_string()))?;
        Ok(Arc::new(Self {
            loop_,
            cache,
            inner: Mutex::new(ManagerInner::default()),
        }))
    }

    #[must_use]
    pub fn cache_root(&self) -> &Path {
        self.cache.root()
    }

    #[must_use]
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Mount an archive at `mount_point`. Blocking; see the mount crate.
    pub fn mount(&self, archive_path: impl AsRef<Path>, mount_point: &str) -> Result<()> {
        let mount = Arc::new(ArchiveMount::new(
            mount_point,
            archive_path.as_ref(),
            self.cache.clone(),
        ));
        mount.mount()?;
        self.inner.lock().mounts.push(mount);
        info!(
            target: "arcfs::vfs",
            archive = %archive_path.as_ref().display(),
            mount_point,
            "archive mounted"
        );
        Ok(())
    }

    /// Unmount every archive and drop all descriptor mappings.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        for mount in &inner.mounts {
            mount.unmount();
        }
        inner.mounts.clear();
        inner.table.clear();
    }

    /// The mount whose mount point is the longest prefix of `path`.
    ///
    /// Matches are anchored at the start of the (NT-stripped) path, so
    /// nested mount points resolve to the deepest one.
    fn find_mount(&self, path: &str) -> Option<Arc<ArchiveMount>> {
        let stripped = strip_nt_prefix(path);
        let inner = self.inner.lock();
        inner
            .mounts
            .iter()
            .filter(|mount| stripped.starts_with(mount.mount_point()))
            .max_by_key(|mount| mount.mount_point().len())
            .cloned()
    }

    /// The real path backing `path`: the cache file for archive members
    /// (empty when the entry is not a file), the path itself otherwise.
    ///
    /// This is what dlopen-style consumers use to load libraries that
    /// live inside an archive.
    #[must_use]
    pub fn true_file_path(&self, path: &str) -> String {
        match self.find_mount(path) {
            None => path.to_owned(),
            Some(mount) => mount
                .cache_file_path(path)
                .map(|cache| cache.display().to_string())
                .unwrap_or_default(),
        }
    }

    // ── Internal completions ────────────────────────────────────────────

    fn on_path_complete(mut req: FsRequest) {
        let Some(sheath) = Sheath::detach(&mut req) else {
            return;
        };
        trace!(target: "arcfs::vfs", op = ?req.op, result = req.result, "completed");
        (sheath.cb)(req);
    }

    fn on_descriptor_complete(mut req: FsRequest) {
        let Some(sheath) = Sheath::detach(&mut req) else {
            return;
        };
        req.file = sheath.virtual_fd;
        trace!(target: "arcfs::vfs", op = ?req.op, result = req.result, file = req.file, "completed");
        (sheath.cb)(req);
    }

    /// Completion for open: mints the virtual descriptor once the real
    /// one is known, then exposes only the virtual value.
    fn open_completion(self: &Arc<Self>) -> FsCallback {
        let manager = Arc::clone(self);
        Box::new(move |mut req: FsRequest| {
            let Some(sheath) = Sheath::detach(&mut req) else {
                return;
            };
            if req.result >= 0 {
                let virtual_fd = manager
                    .inner
                    .lock()
                    .table
                    .insert(req.result, sheath.mount.clone());
                trace!(target: "arcfs::vfs", real_fd = req.result, virtual_fd, "open mapped");
                req.result = virtual_fd;
                req.file = virtual_fd;
            }
            (sheath.cb)(req);
        })
    }

    /// Completion for close: retires the virtual descriptor.
    fn close_completion(self: &Arc<Self>) -> FsCallback {
        let manager = Arc::clone(self);
        Box::new(move |mut req: FsRequest| {
            let Some(sheath) = Sheath::detach(&mut req) else {
                return;
            };
            manager.inner.lock().table.remove(sheath.virtual_fd);
            req.file = sheath.virtual_fd;
            (sheath.cb)(req);
        })
    }

    /// Finish a descriptor-keyed call whose virtual descriptor is not in
    /// the table. The callback (if any) still fires through the loop.
    fn unknown_descriptor(&self, req: &mut FsRequest, op: FsOp, cb: Option<FsCallback>) -> i64 {
        req.init(op);
        req.result = enoent();
        match cb {
            None => req.result,
            Some(cb) => {
                self.loop_.schedule(std::mem::take(req), cb);
                0
            }
        }
    }

    /// Finish a descriptor-keyed call on an archive-owned descriptor
    /// with a fixed result (`0` for the sync no-ops, `ECANCELED` for
    /// mutators).
    fn archive_fixed_result(
        &self,
        req: &mut FsRequest,
        op: FsOp,
        result: i64,
        virtual_fd: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        req.init(op);
        req.result = result;
        match cb {
            None => result,
            Some(cb) => {
                Sheath::attach(req, cb, virtual_fd, None);
                self.loop_
                    .schedule(std::mem::take(req), Box::new(Self::on_descriptor_complete));
                0
            }
        }
    }

    // ── Path-keyed operations ───────────────────────────────────────────

    pub fn stat(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "stat");
        match self.find_mount(path) {
            None => match cb {
                None => self.loop_.fs_stat(req, path, None),
                Some(cb) => {
                    Sheath::attach(req, cb, 0, None);
                    self.loop_
                        .fs_stat(req, path, Some(Box::new(Self::on_path_complete)))
                }
            },
            Some(mount) => {
                req.init(FsOp::Stat);
                req.path = Some(path.to_owned());
                match cb {
                    None => mount.fs_stat(&self.loop_, req, path, None),
                    Some(cb) => {
                        Sheath::attach(req, cb, 0, Some(Arc::clone(&mount)));
                        mount.fs_stat(
                            &self.loop_,
                            req,
                            path,
                            Some(Box::new(Self::on_path_complete)),
                        )
                    }
                }
            }
        }
    }

    /// Archive entries have no symlinks, so lstat on a mount is stat.
    pub fn lstat(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "lstat");
        match self.find_mount(path) {
            None => match cb {
                None => self.loop_.fs_lstat(req, path, None),
                Some(cb) => {
                    Sheath::attach(req, cb, 0, None);
                    self.loop_
                        .fs_lstat(req, path, Some(Box::new(Self::on_path_complete)))
                }
            },
            Some(mount) => {
                req.init(FsOp::Lstat);
                req.path = Some(path.to_owned());
                match cb {
                    None => mount.fs_stat(&self.loop_, req, path, None),
                    Some(cb) => {
                        Sheath::attach(req, cb, 0, Some(Arc::clone(&mount)));
                        mount.fs_stat(
                            &self.loop_,
                            req,
                            path,
                            Some(Box::new(Self::on_path_complete)),
                        )
                    }
                }
            }
        }
    }

    pub fn open(
        self: &Arc<Self>,
        req: &mut FsRequest,
        path: &str,
        flags: i32,
        mode: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, flags, "open");
        match self.find_mount(path) {
            None => match cb {
                None => {
                    let r = self.loop_.fs_open(req, path, flags, mode, None);
                    if r >= 0 {
                        let virtual_fd = self.inner.lock().table.insert(req.result, None);
                        req.result = virtual_fd;
                        return virtual_fd;
                    }
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, 0, None);
                    self.loop_
                        .fs_open(req, path, flags, mode, Some(self.open_completion()))
                }
            },
            Some(mount) => {
                req.init(FsOp::Open);
                req.path = Some(path.to_owned());
                match cb {
                    None => {
                        let r = mount.fs_open(&self.loop_, req, flags, path, None);
                        if r >= 0 {
                            let virtual_fd =
                                self.inner.lock().table.insert(r, Some(Arc::clone(&mount)));
                            req.result = virtual_fd;
                            return virtual_fd;
                        }
                        r
                    }
                    Some(cb) => {
                        Sheath::attach(req, cb, 0, Some(Arc::clone(&mount)));
                        mount.fs_open(&self.loop_, req, flags, path, Some(self.open_completion()))
                    }
                }
            }
        }
    }

    pub fn scandir(
        &self,
        req: &mut FsRequest,
        path: &str,
        flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, "scandir");
        match self.find_mount(path) {
            None => match cb {
                None => self.loop_.fs_scandir(req, path, flags, None),
                Some(cb) => {
                    Sheath::attach(req, cb, 0, None);
                    self.loop_
                        .fs_scandir(req, path, flags, Some(Box::new(Self::on_path_complete)))
                }
            },
            Some(mount) => {
                req.init(FsOp::Scandir);
                req.path = Some(path.to_owned());
                match cb {
                    None => mount.fs_scandir(&self.loop_, req, path, None),
                    Some(cb) => {
                        Sheath::attach(req, cb, 0, Some(Arc::clone(&mount)));
                        mount.fs_scandir(
                            &self.loop_,
                            req,
                            path,
                            Some(Box::new(Self::on_path_complete)),
                        )
                    }
                }
            }
        }
    }

    /// Step the scandir cursor of a finished request.
    pub fn scandir_next(&self, req: &mut FsRequest) -> Option<Dirent> {
        req.next_entry()
    }

    /// For archive paths the "real" path is the virtual one; the result
    /// echoes the input. Real paths canonicalize as usual.
    pub fn realpath(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "realpath");
        match self.find_mount(path) {
            None => match cb {
                None => self.loop_.fs_realpath(req, path, None),
                Some(cb) => {
                    Sheath::attach(req, cb, 0, None);
                    self.loop_
                        .fs_realpath(req, path, Some(Box::new(Self::on_path_complete)))
                }
            },
            Some(_) => {
                req.init(FsOp::Realpath);
                req.path = Some(path.to_owned());
                req.link = Some(path.to_owned());
                req.result = 0;
                match cb {
                    None => 0,
                    Some(cb) => {
                        Sheath::attach(req, cb, 0, None);
                        self.loop_
                            .schedule(std::mem::take(req), Box::new(Self::on_path_complete));
                        0
                    }
                }
            }
        }
    }

    // ── Descriptor-keyed operations ─────────────────────────────────────

    pub fn fstat(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", file, "fstat");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Fstat, cb);
        };

        match source.mount {
            Some(mount) => {
                req.init(FsOp::Fstat);
                match cb {
                    None => {
                        let r = mount.fs_fstat(&self.loop_, req, source.real_fd, None);
                        req.file = file;
                        r
                    }
                    Some(cb) => {
                        Sheath::attach(req, cb, file, Some(Arc::clone(&mount)));
                        mount.fs_fstat(
                            &self.loop_,
                            req,
                            source.real_fd,
                            Some(Box::new(Self::on_descriptor_complete)),
                        )
                    }
                }
            }
            None => match cb {
                None => {
                    let r = self.loop_.fs_fstat(req, source.real_fd, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_fstat(
                        req,
                        source.real_fd,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn read(
        &self,
        req: &mut FsRequest,
        file: i64,
        buf: Vec<u8>,
        offset: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", file, offset, len = buf.len(), "read");
        let Some(source) = self.inner.lock().table.get(file) else {
            req.data = buf;
            return self.unknown_descriptor(req, FsOp::Read, cb);
        };

        match source.mount {
            Some(mount) => {
                req.init(FsOp::Read);
                match cb {
                    None => {
                        let r = mount.fs_read(&self.loop_, req, source.real_fd, buf, offset, None);
                        req.file = file;
                        r
                    }
                    Some(cb) => {
                        Sheath::attach(req, cb, file, None);
                        mount.fs_read(
                            &self.loop_,
                            req,
                            source.real_fd,
                            buf,
                            offset,
                            Some(Box::new(Self::on_descriptor_complete)),
                        )
                    }
                }
            }
            None => match cb {
                None => {
                    let r = self.loop_.fs_read(req, source.real_fd, buf, offset, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_read(
                        req,
                        source.real_fd,
                        buf,
                        offset,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn close(self: &Arc<Self>, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", file, "close");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Close, cb);
        };

        match source.mount {
            Some(mount) => {
                req.init(FsOp::Close);
                match cb {
                    None => {
                        let r = mount.fs_close(&self.loop_, req, source.real_fd, None);
                        req.file = file;
                        self.inner.lock().table.remove(file);
                        r
                    }
                    Some(cb) => {
                        Sheath::attach(req, cb, file, Some(Arc::clone(&mount)));
                        mount.fs_close(
                            &self.loop_,
                            req,
                            source.real_fd,
                            Some(self.close_completion()),
                        )
                    }
                }
            }
            None => match cb {
                None => {
                    let r = self.loop_.fs_close(req, source.real_fd, None);
                    req.file = file;
                    self.inner.lock().table.remove(file);
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_
                        .fs_close(req, source.real_fd, Some(self.close_completion()))
                }
            },
        }
    }

    /// Archive-owned descriptors are read-only; writes fail rather than
    /// mutate the archive.
    pub fn write(
        &self,
        req: &mut FsRequest,
        file: i64,
        buf: Vec<u8>,
        offset: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", file, offset, len = buf.len(), "write");
        let Some(source) = self.inner.lock().table.get(file) else {
            req.data = buf;
            return self.unknown_descriptor(req, FsOp::Write, cb);
        };

        match source.mount {
            Some(_) => {
                req.data = buf;
                self.archive_fixed_result(req, FsOp::Write, ecanceled(), file, cb)
            }
            None => match cb {
                None => {
                    let r = self.loop_.fs_write(req, source.real_fd, buf, offset, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_write(
                        req,
                        source.real_fd,
                        buf,
                        offset,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    /// Nothing to flush for read-only archive data; reports success.
    pub fn fsync(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", file, "fsync");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Fsync, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Fsync, 0, file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_fsync(req, source.real_fd, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_fsync(
                        req,
                        source.real_fd,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn fdatasync(&self, req: &mut FsRequest, file: i64, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", file, "fdatasync");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Fdatasync, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Fdatasync, 0, file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_fdatasync(req, source.real_fd, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_fdatasync(
                        req,
                        source.real_fd,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn ftruncate(
        &self,
        req: &mut FsRequest,
        file: i64,
        len: i64,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", file, len, "ftruncate");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Ftruncate, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Ftruncate, ecanceled(), file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_ftruncate(req, source.real_fd, len, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_ftruncate(
                        req,
                        source.real_fd,
                        len,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    /// Copying *into* an archive descriptor is refused; copying out of
    /// one reads its cache file like any other read.
    pub fn sendfile(
        &self,
        req: &mut FsRequest,
        out_fd: i64,
        in_fd: i64,
        in_offset: i64,
        length: usize,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", out_fd, in_fd, in_offset, length, "sendfile");
        let (out_source, in_source) = {
            let inner = self.inner.lock();
            (inner.table.get(out_fd), inner.table.get(in_fd))
        };
        let (Some(out_source), Some(in_source)) = (out_source, in_source) else {
            return self.unknown_descriptor(req, FsOp::Sendfile, cb);
        };

        if out_source.mount.is_some() {
            return self.archive_fixed_result(req, FsOp::Sendfile, ecanceled(), out_fd, cb);
        }

        match cb {
            None => {
                let r = self.loop_.fs_sendfile(
                    req,
                    out_source.real_fd,
                    in_source.real_fd,
                    in_offset,
                    length,
                    None,
                );
                req.file = out_fd;
                r
            }
            Some(cb) => {
                Sheath::attach(req, cb, out_fd, None);
                self.loop_.fs_sendfile(
                    req,
                    out_source.real_fd,
                    in_source.real_fd,
                    in_offset,
                    length,
                    Some(Box::new(Self::on_descriptor_complete)),
                )
            }
        }
    }

    pub fn futime(
        &self,
        req: &mut FsRequest,
        file: i64,
        atime: f64,
        mtime: f64,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", file, "futime");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Futime, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Futime, ecanceled(), file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_futime(req, source.real_fd, atime, mtime, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_futime(
                        req,
                        source.real_fd,
                        atime,
                        mtime,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn fchmod(&self, req: &mut FsRequest, file: i64, mode: u32, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", file, mode, "fchmod");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Fchmod, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Fchmod, ecanceled(), file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_fchmod(req, source.real_fd, mode, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_fchmod(
                        req,
                        source.real_fd,
                        mode,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    pub fn fchown(
        &self,
        req: &mut FsRequest,
        file: i64,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", file, "fchown");
        let Some(source) = self.inner.lock().table.get(file) else {
            return self.unknown_descriptor(req, FsOp::Fchown, cb);
        };

        match source.mount {
            Some(_) => self.archive_fixed_result(req, FsOp::Fchown, ecanceled(), file, cb),
            None => match cb {
                None => {
                    let r = self.loop_.fs_fchown(req, source.real_fd, uid, gid, None);
                    req.file = file;
                    r
                }
                Some(cb) => {
                    Sheath::attach(req, cb, file, None);
                    self.loop_.fs_fchown(
                        req,
                        source.real_fd,
                        uid,
                        gid,
                        Some(Box::new(Self::on_descriptor_complete)),
                    )
                }
            },
        }
    }

    // ── Pass-through path operations ────────────────────────────────────
    //
    // Mutators on archive paths are not proxied; they hit the real
    // filesystem, where archive-owned virtual paths simply do not exist.

    pub fn mkdir(&self, req: &mut FsRequest, path: &str, mode: u32, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "mkdir passthrough");
        self.loop_.fs_mkdir(req, path, mode, cb)
    }

    pub fn mkdtemp(&self, req: &mut FsRequest, template: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", template, "mkdtemp passthrough");
        self.loop_.fs_mkdtemp(req, template, cb)
    }

    pub fn rmdir(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "rmdir passthrough");
        self.loop_.fs_rmdir(req, path, cb)
    }

    pub fn unlink(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "unlink passthrough");
        self.loop_.fs_unlink(req, path, cb)
    }

    pub fn rename(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, new_path, "rename passthrough");
        self.loop_.fs_rename(req, path, new_path, cb)
    }

    pub fn access(&self, req: &mut FsRequest, path: &str, mode: i32, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "access passthrough");
        self.loop_.fs_access(req, path, mode, cb)
    }

    pub fn chmod(&self, req: &mut FsRequest, path: &str, mode: u32, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "chmod passthrough");
        self.loop_.fs_chmod(req, path, mode, cb)
    }

    pub fn utime(
        &self,
        req: &mut FsRequest,
        path: &str,
        atime: f64,
        mtime: f64,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, "utime passthrough");
        self.loop_.fs_utime(req, path, atime, mtime, cb)
    }

    pub fn link(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, new_path, "link passthrough");
        self.loop_.fs_link(req, path, new_path, cb)
    }

    pub fn symlink(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, new_path, "symlink passthrough");
        self.loop_.fs_symlink(req, path, new_path, flags, cb)
    }

    pub fn readlink(&self, req: &mut FsRequest, path: &str, cb: Option<FsCallback>) -> i64 {
        trace!(target: "arcfs::vfs", path, "readlink passthrough");
        self.loop_.fs_readlink(req, path, cb)
    }

    pub fn chown(
        &self,
        req: &mut FsRequest,
        path: &str,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, "chown passthrough");
        self.loop_.fs_chown(req, path, uid, gid, cb)
    }

    pub fn lchown(
        &self,
        req: &mut FsRequest,
        path: &str,
        uid: u32,
        gid: u32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, "lchown passthrough");
        self.loop_.fs_lchown(req, path, uid, gid, cb)
    }

    pub fn copyfile(
        &self,
        req: &mut FsRequest,
        path: &str,
        new_path: &str,
        flags: i32,
        cb: Option<FsCallback>,
    ) -> i64 {
        trace!(target: "arcfs::vfs", path, new_path, "copyfile passthrough");
        self.loop_.fs_copyfile(req, path, new_path, flags, cb)
    }
}

impl Drop for VfsManager {
    fn drop(&mut self) {
        self.release();
    }
}
