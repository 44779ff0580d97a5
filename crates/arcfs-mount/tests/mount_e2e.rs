//! End-to-end archive mount tests.
//!
//! Each test builds a real ZIP on disk, mounts it against a private
//! cache root, and drives the per-operation handlers the way the
//! dispatcher does.

use arcfs_cache::CacheLayout;
use arcfs_error::ArcError;
use arcfs_loop::{FsRequest, LoopHandle};
use arcfs_mount::{extract_to, ArchiveMount};
use arcfs_testkit::ZipBuilder;
use arcfs_types::DirentKind;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const MOUNT: &str = "/app";

fn builder() -> ZipBuilder {
    ZipBuilder::new()
        .dir("public") // entry 0
        .file("package.json", b"{\"name\":\"demo\"}") // entry 1
        .file("public/index.html", b"<html></html>") // entry 2
        .deflated_file("public/bundle.js", b"console.log('hello from the bundle');") // entry 3
        .file("readme.md", b"# demo\n") // entry 4
}

struct Fixture {
    _dir: tempfile::TempDir,
    mount: Arc<ArchiveMount>,
    cache_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let archive = dir.path().join("bundle.zip");
    builder().write_to(&archive).expect("write archive");

    let cache_root = dir.path().join("cache");
    let mount = Arc::new(ArchiveMount::new(
        MOUNT,
        &archive,
        CacheLayout::new(cache_root.clone()),
    ));
    mount.mount().expect("mount");

    let digest = arcfs_cache::path_digest(&archive).expect("digest");
    Fixture {
        _dir: dir,
        mount,
        cache_dir: cache_root.join(digest),
    }
}

fn loop_handle() -> (tokio::runtime::Runtime, LoopHandle) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let handle = LoopHandle::new(rt.handle().clone());
    (rt, handle)
}

fn read_all(handle: &LoopHandle, mount: &Arc<ArchiveMount>, fd: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut req = FsRequest::new();
        let n = mount.fs_read(handle, &mut req, fd, vec![0_u8; 11], out.len() as i64, None);
        assert!(n >= 0, "read failed: {n}");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&req.data[..n as usize]);
    }
    out
}

#[test]
fn cold_mount_extracts_every_member() {
    let fx = fixture();
    assert!(fx.mount.is_mounted());
    assert!(fx.mount.extracted_on_mount());
    assert!(fx.mount.all_extracted());
    assert!(!fx.mount.is_unsafe());

    // Entry ids follow central-directory order; the dir marker is 0.
    assert_eq!(
        fs::read(fx.cache_dir.join("1.cache")).expect("package.json"),
        b"{\"name\":\"demo\"}"
    );
    assert_eq!(
        fs::read(fx.cache_dir.join("3.cache")).expect("bundle.js"),
        b"console.log('hello from the bundle');"
    );
    assert!(!fx.cache_dir.join("0.cache").exists());
}

#[test]
fn stat_classifies_entries() {
    let fx = fixture();
    let (_rt, handle) = loop_handle();

    let mut req = FsRequest::new();
    assert_eq!(fx.mount.fs_stat(&handle, &mut req, "/app/package.json", None), 0);
    let stat = req.stat.expect("file stat");
    assert!(stat.is_file());
    assert_eq!(stat.size, 15);
    assert_eq!(stat.dev, 0);
    assert_eq!(stat.atime, stat.mtime);
    assert_eq!(stat.mtime, stat.btime);

    let mut req = FsRequest::new();
    assert_eq!(fx.mount.fs_stat(&handle, &mut req, "/app/public/", None), 0);
    assert!(req.stat.expect("dir stat").is_dir());

    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount.fs_stat(&handle, &mut req, "/app/wibble", None),
        -i64::from(libc::ENOENT)
    );
}

#[test]
fn scandir_orders_dirs_before_files() {
    let fx = fixture();
    let (_rt, handle) = loop_handle();

    let mut req = FsRequest::new();
    let count = fx.mount.fs_scandir(&handle, &mut req, "/app/", None);
    assert_eq!(count, 3);

    let mut seen = Vec::new();
    while let Some(entry) = req.next_entry() {
        seen.push((entry.name, entry.kind));
    }
    assert_eq!(
        seen,
        vec![
            ("public".to_owned(), DirentKind::Dir),
            ("package.json".to_owned(), DirentKind::File),
            ("readme.md".to_owned(), DirentKind::File),
        ]
    );

    let mut req = FsRequest::new();
    assert_eq!(fx.mount.fs_scandir(&handle, &mut req, "/app/public", None), 2);

    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount
            .fs_scandir(&handle, &mut req, "/app/package.json", None),
        -i64::from(libc::ENOTDIR)
    );

    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount.fs_scandir(&handle, &mut req, "/app/wibble", None),
        -i64::from(libc::ENOENT)
    );
}

#[test]
fn open_read_close_round_trip() {
    let fx = fixture();
    let (_rt, handle) = loop_handle();

    let mut req = FsRequest::new();
    let fd = fx
        .mount
        .fs_open(&handle, &mut req, libc::O_RDONLY, "/app/public/bundle.js", None);
    assert!(fd > 0);

    let mut req = FsRequest::new();
    assert_eq!(fx.mount.fs_fstat(&handle, &mut req, fd, None), 0);
    let stat = req.stat.expect("fstat");
    assert_eq!(stat.size, 37);

    let bytes = read_all(&handle, &fx.mount, fd);
    assert_eq!(bytes, b"console.log('hello from the bundle');");

    let mut req = FsRequest::new();
    assert_eq!(fx.mount.fs_close(&handle, &mut req, fd, None), 0);

    // Closed descriptors are gone from the open-file table.
    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount.fs_close(&handle, &mut req, fd, None),
        -i64::from(libc::EBADF)
    );
    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount.fs_fstat(&handle, &mut req, fd, None),
        -i64::from(libc::EBADF)
    );
}

#[test]
fn open_rejects_dirs_and_missing_entries() {
    let fx = fixture();
    let (_rt, handle) = loop_handle();

    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount
            .fs_open(&handle, &mut req, libc::O_RDONLY, "/app/public/", None),
        -i64::from(libc::ENOENT)
    );

    let mut req = FsRequest::new();
    assert_eq!(
        fx.mount
            .fs_open(&handle, &mut req, libc::O_RDONLY, "/app/project.json", None),
        -i64::from(libc::ENOENT)
    );
}

#[test]
fn warm_remount_reuses_cache() {
    let fx = fixture();
    let archive = fx.mount.archive_path().to_path_buf();
    let cache_root = fx.cache_dir.parent().unwrap().to_path_buf();
    let before = fs::read(fx.cache_dir.join("2.cache")).expect("cache bytes");
    fx.mount.unmount();
    assert!(!fx.mount.is_mounted());

    let second = ArchiveMount::new(MOUNT, &archive, CacheLayout::new(cache_root));
    second.mount().expect("remount");
    assert!(!second.extracted_on_mount());
    assert!(second.all_extracted());
    assert!(!second.is_unsafe());

    let after = fs::read(fx.cache_dir.join("2.cache")).expect("cache bytes");
    assert_eq!(before, after);
}

#[test]
fn missing_cache_file_latches_unsafe() {
    let fx = fixture();
    let archive = fx.mount.archive_path().to_path_buf();
    let cache_root = fx.cache_dir.parent().unwrap().to_path_buf();
    fx.mount.unmount();

    fs::remove_file(fx.cache_dir.join("1.cache")).expect("drop cache file");

    let second = Arc::new(ArchiveMount::new(
        MOUNT,
        &archive,
        CacheLayout::new(cache_root),
    ));
    second.mount().expect("mount still succeeds");
    assert!(second.is_unsafe());
    assert!(!second.all_extracted());

    let (_rt, handle) = loop_handle();
    let mut req = FsRequest::new();
    assert_eq!(
        second.fs_open(&handle, &mut req, libc::O_RDONLY, "/app/package.json", None),
        -i64::from(libc::EIO)
    );

    // Other entries still open fine.
    let mut req = FsRequest::new();
    let fd = second.fs_open(&handle, &mut req, libc::O_RDONLY, "/app/readme.md", None);
    assert!(fd > 0);
    let mut req = FsRequest::new();
    second.fs_close(&handle, &mut req, fd, None);
}

#[tokio::test]
async fn async_handlers_match_sync() {
    let fx = fixture();
    let handle = LoopHandle::current();

    let mut sync_req = FsRequest::new();
    let sync_r = fx
        .mount
        .fs_stat(&handle, &mut sync_req, "/app/package.json", None);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut req = FsRequest::new();
    let submit = fx.mount.fs_stat(
        &handle,
        &mut req,
        "/app/package.json",
        Some(Box::new(move |done| {
            let _ = tx.send(done);
        })),
    );
    assert_eq!(submit, 0);
    let done = rx.await.expect("completion");
    assert_eq!(done.result, sync_r);
    assert_eq!(done.stat, sync_req.stat);

    // Async open goes through a shadow request and registers the
    // descriptor before the completion fires.
    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut req = FsRequest::new();
    fx.mount.fs_open(
        &handle,
        &mut req,
        libc::O_RDONLY,
        "/app/readme.md",
        Some(Box::new(move |done| {
            let _ = tx.send(done);
        })),
    );
    let done = rx.await.expect("open completion");
    let fd = done.result;
    assert!(fd > 0);

    let bytes = read_all(&handle, &fx.mount, fd);
    assert_eq!(bytes, b"# demo\n");

    let mut req = FsRequest::new();
    fx.mount.fs_close(&handle, &mut req, fd, None);
}

#[test]
fn mount_error_taxonomy() {
    let dir = tempfile::tempdir().expect("temp dir");
    let cache = CacheLayout::new(dir.path().join("cache"));

    let missing = ArchiveMount::new(MOUNT, dir.path().join("nope.zip"), cache.clone());
    assert!(matches!(missing.mount(), Err(ArcError::ArchiveNotFound(_))));
    assert!(!missing.is_mounted());

    let garbage = dir.path().join("garbage.zip");
    fs::write(&garbage, b"not a zip at all").expect("garbage");
    let invalid = ArchiveMount::new(MOUNT, &garbage, cache.clone());
    assert!(matches!(invalid.mount(), Err(ArcError::ArchiveInvalid(_))));
    assert!(!invalid.is_mounted());

    let archive = dir.path().join("ok.zip");
    builder().write_to(&archive).expect("archive");
    let ok = ArchiveMount::new(MOUNT, &archive, cache);
    ok.mount().expect("mount");
    assert!(matches!(ok.mount(), Err(ArcError::AlreadyMounted(_))));
}

#[test]
fn extract_to_unpacks_tree() {
    let dir = tempfile::tempdir().expect("temp dir");
    let archive = dir.path().join("bundle.zip");
    builder().write_to(&archive).expect("archive");

    let dest = dir.path().join("out");
    extract_to(&archive, &dest).expect("extract");

    assert!(dest.join("public").is_dir());
    assert_eq!(
        fs::read(dest.join("package.json")).expect("file"),
        b"{\"name\":\"demo\"}"
    );
    assert_eq!(
        fs::read(dest.join("public/bundle.js")).expect("file"),
        b"console.log('hello from the bundle');"
    );

    assert!(matches!(
        extract_to(Path::new("/definitely/not/here.zip"), &dest),
        Err(ArcError::ArchiveNotFound(_))
    ));
}
