#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use arcfs_loop::{FsRequest, LoopHandle};
use arcfs_vfs::VfsManager;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "arcfs", about = "arcfs — archive overlay filesystem")]
struct Cli {
    /// Archive file to mount.
    #[arg(long = "archive.path", value_name = "FILE")]
    archive_path: Option<PathBuf>,

    /// Mount point under which the archive's root appears.
    #[arg(long = "archive.mount", value_name = "DIR")]
    archive_mount: Option<String>,

    /// Trace every proxied call to stdout.
    #[arg(long = "archive.trace")]
    trace: bool,

    /// Trace every proxied call to the named file.
    #[arg(long = "archive.traceto", value_name = "FILE")]
    trace_to: Option<PathBuf>,

    /// Override the extraction cache root (default: <tmp>/archive_cache).
    #[arg(long, value_name = "DIR")]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stat a path through the overlay.
    Stat {
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory through the overlay.
    Ls {
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Stream a file's bytes to stdout.
    Cat { path: String },
    /// Print the real path backing a virtual path.
    Truename { path: String },
    /// Unpack an archive into a directory without mounting it.
    Extract { archive: PathBuf, dest: PathBuf },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatOutput<'a> {
    path: &'a str,
    kind: &'static str,
    size: u64,
    mode: u32,
    mtime: i64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if let Command::Extract { archive, dest } = &cli.command {
        arcfs_mount::extract_to(archive, dest)
            .with_context(|| format!("failed to extract {}", archive.display()))?;
        println!("extracted {} to {}", archive.display(), dest.display());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    let handle = LoopHandle::new(rt.handle().clone());
    let manager = VfsManager::new(handle, cli.cache_root.clone()).context("initialize overlay")?;

    match (&cli.archive_path, &cli.archive_mount) {
        (Some(archive), Some(mount_point)) => {
            manager.mount(archive, mount_point).with_context(|| {
                format!("failed to mount {} at {mount_point}", archive.display())
            })?;
        }
        (Some(_), None) => bail!("you need to pass a mount point using --archive.mount"),
        (None, Some(_)) => bail!("you need to pass an archive using --archive.path"),
        (None, None) => {}
    }

    match &cli.command {
        Command::Stat { path, json } => stat_cmd(&manager, path, *json),
        Command::Ls { path, json } => ls_cmd(&manager, path, *json),
        Command::Cat { path } => cat_cmd(&manager, path),
        Command::Truename { path } => {
            println!("{}", manager.true_file_path(path));
            Ok(())
        }
        Command::Extract { .. } => Ok(()),
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    if let Some(path) = &cli.trace_to {
        let file = Arc::new(
            std::fs::File::create(path)
                .with_context(|| format!("failed to open trace file {}", path.display()))?,
        );
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("arcfs=trace"))
            .with_writer(move || Arc::clone(&file))
            .with_ansi(false)
            .init();
    } else if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("arcfs=trace"))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }
    Ok(())
}

// ── Subcommands ─────────────────────────────────────────────────────────────

fn stat_cmd(manager: &Arc<VfsManager>, path: &str, json: bool) -> Result<()> {
    let mut req = FsRequest::new();
    let r = manager.stat(&mut req, path, None);
    if r < 0 {
        bail!("stat {path} failed (errno {})", -r);
    }
    let stat = req.stat.context("stat reported success without a buffer")?;

    let output = StatOutput {
        path,
        kind: if stat.is_dir() { "directory" } else { "file" },
        size: stat.size,
        mode: stat.mode,
        mtime: stat.mtime,
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("{}: {} ({} bytes)", output.path, output.kind, output.size);
        println!("  mode:  {:o}", output.mode);
        println!("  mtime: {}", output.mtime);
    }
    Ok(())
}

fn ls_cmd(manager: &Arc<VfsManager>, path: &str, json: bool) -> Result<()> {
    let mut req = FsRequest::new();
    let r = manager.scandir(&mut req, path, 0, None);
    if r < 0 {
        bail!("scandir {path} failed (errno {})", -r);
    }

    let mut entries = Vec::new();
    while let Some(entry) = manager.scandir_next(&mut req) {
        entries.push(entry);
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        );
    } else {
        for entry in &entries {
            let marker = match entry.kind {
                arcfs_types::DirentKind::Dir => "d",
                arcfs_types::DirentKind::Link => "l",
                _ => "f",
            };
            println!("{marker} {}", entry.name);
        }
    }
    Ok(())
}

fn cat_cmd(manager: &Arc<VfsManager>, path: &str) -> Result<()> {
    let mut req = FsRequest::new();
    let fd = manager.open(&mut req, path, libc::O_RDONLY, 0, None);
    if fd < 0 {
        bail!("open {path} failed (errno {})", -fd);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0_i64;
    loop {
        let mut req = FsRequest::new();
        let n = manager.read(&mut req, fd, vec![0_u8; 64 * 1024], offset, None);
        if n < 0 {
            let mut close_req = FsRequest::new();
            manager.close(&mut close_req, fd, None);
            bail!("read {path} failed (errno {})", -n);
        }
        if n == 0 {
            break;
        }
        out.write_all(&req.data[..n as usize]).context("write stdout")?;
        offset += n;
    }

    let mut req = FsRequest::new();
    manager.close(&mut req, fd, None);
    Ok(())
}
