//! The filesystem request object and its callback type.
//!
//! A request carries everything one operation produces: the result code,
//! an optional stat buffer, scandir entries, a string result, and the
//! read/write payload. Callers hand a request in; in async form the
//! request travels through the loop and comes back owned by the
//! callback.

use arcfs_types::{Dirent, StatBuf};
use std::any::Any;
use std::fmt;

/// Completion callback for an async filesystem operation.
pub type FsCallback = Box<dyn FnOnce(FsRequest) + Send + 'static>;

/// Operation discriminator, mirrored into the request on submit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsOp {
    #[default]
    None,
    Open,
    Close,
    Read,
    Write,
    Stat,
    Lstat,
    Fstat,
    Scandir,
    Realpath,
    Fsync,
    Fdatasync,
    Ftruncate,
    Sendfile,
    Futime,
    Fchmod,
    Fchown,
    Chown,
    Lchown,
    Mkdir,
    Mkdtemp,
    Rmdir,
    Unlink,
    Rename,
    Access,
    Chmod,
    Utime,
    Link,
    Symlink,
    Readlink,
    Copyfile,
}

/// One filesystem request.
///
/// `result` is non-negative on success and a negative errno on failure.
/// After an async submit the caller must not touch the request until the
/// callback delivers it back; the submit leaves the caller's copy empty.
#[derive(Default)]
pub struct FsRequest {
    pub op: FsOp,
    pub result: i64,
    /// Descriptor as exposed to the caller.
    pub file: i64,
    /// Captured path argument, when the operation had one.
    pub path: Option<String>,
    pub stat: Option<StatBuf>,
    /// Read/write payload. Owned so it can cross the completion boundary.
    pub data: Vec<u8>,
    /// String result (realpath, readlink, mkdtemp).
    pub link: Option<String>,
    entries: Vec<Dirent>,
    cursor: usize,
    /// Opaque per-request attachment. The dispatcher parks its context
    /// here for the duration of an async call.
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl FsRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm the request for an operation.
    ///
    /// Clears previous outputs. `data` (a caller-provided buffer) and
    /// `user_data` (the dispatcher's attachment) survive.
    pub fn init(&mut self, op: FsOp) {
        self.op = op;
        self.result = 0;
        self.path = None;
        self.stat = None;
        self.link = None;
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn set_entries(&mut self, entries: Vec<Dirent>) {
        self.entries = entries;
        self.cursor = 0;
    }

    #[must_use]
    pub fn entries(&self) -> &[Dirent] {
        &self.entries
    }

    /// Step the scandir cursor. `None` is end-of-stream.
    pub fn next_entry(&mut self) -> Option<Dirent> {
        let entry = self.entries.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(entry)
    }
}

impl fmt::Debug for FsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsRequest")
            .field("op", &self.op)
            .field("result", &self.result)
            .field("file", &self.file)
            .field("path", &self.path)
            .field("stat", &self.stat)
            .field("data_len", &self.data.len())
            .field("link", &self.link)
            .field("entries", &self.entries.len())
            .field("cursor", &self.cursor)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcfs_types::DirentKind;

    #[test]
    fn init_clears_outputs_keeps_attachments() {
        let mut req = FsRequest::new();
        req.data = vec![1, 2, 3];
        req.user_data = Some(Box::new(42_u32));
        req.result = -7;
        req.stat = Some(StatBuf::directory(0));
        req.set_entries(vec![Dirent::new("x", DirentKind::File)]);

        req.init(FsOp::Stat);

        assert_eq!(req.op, FsOp::Stat);
        assert_eq!(req.result, 0);
        assert!(req.stat.is_none());
        assert!(req.entries().is_empty());
        assert_eq!(req.data, vec![1, 2, 3]);
        assert!(req.user_data.is_some());
    }

    #[test]
    fn entry_cursor_drains() {
        let mut req = FsRequest::new();
        req.set_entries(vec![
            Dirent::new("a", DirentKind::Dir),
            Dirent::new("b", DirentKind::File),
        ]);
        assert_eq!(req.next_entry().unwrap().name, "a");
        assert_eq!(req.next_entry().unwrap().name, "b");
        assert!(req.next_entry().is_none());
        assert!(req.next_entry().is_none());
    }
}
