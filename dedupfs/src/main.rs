//! dedupfs - deduplicating, optionally-compressing FUSE filesystem
//!
//! Stores many logical files while physically persisting each distinct
//! fixed-size content block exactly once. Intended for append-heavy
//! archival/backup workloads where redundancy across files and versions
//! is high.
//!
//! Usage:
//!   dedupfs /mnt/archive
//!   dedupfs --datastore ~/.dedupfs-datastore.db --block-size 65536 /mnt/archive

mod fs;

use clap::Parser;
use dedupfs_core::compress::CompressionMethod;
use dedupfs_core::hash::HashAlgorithm;
use dedupfs_core::options::Options;
use dedupfs_core::stats::DiskUsage;
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "dedupfs")]
#[command(about = "Deduplicating, optionally-compressing FUSE filesystem")]
struct Cli {
    /// Directory to mount the filesystem at.
    mountpoint: Option<PathBuf>,

    /// Metadata store file (schema: tree, inodes, links, hashes, index, options).
    #[arg(long, default_value = "~/.dedupfs-metastore.sqlite3")]
    metastore: String,

    /// Block store directory.
    #[arg(long, default_value = "~/.dedupfs-datastore.db")]
    datastore: String,

    /// Block size in bytes. Create-time only: ignored with a warning on
    /// a re-mount of an existing store.
    #[arg(long, default_value_t = 131_072)]
    block_size: u32,

    /// Hash algorithm: sha1 or sha256. Create-time only.
    #[arg(long, default_value = "sha1")]
    hash: String,

    /// Compression method: none or zlib. Create-time only.
    #[arg(long, default_value = "none")]
    compress: String,

    /// Disable synchronous durability (relaxed durability for throughput).
    #[arg(long)]
    nosync: bool,

    /// Disable grouping mutations into transactions.
    #[arg(long = "no-transactions")]
    no_transactions: bool,

    /// Disable periodic garbage collection.
    #[arg(long)]
    nogc: bool,

    /// Round-trip each newly written block after writing it.
    #[arg(long)]
    verify_writes: bool,

    /// Print apparent vs. physical disk usage and exit without mounting.
    #[arg(long)]
    print_stats: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn requested_options(cli: &Cli) -> anyhow::Result<Options> {
    Ok(Options {
        block_size: cli.block_size,
        hash_function: HashAlgorithm::parse(&cli.hash).map_err(|e| anyhow::anyhow!("{e}"))?,
        compression_method: CompressionMethod::parse(&cli.compress)
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        synchronous: !cli.nosync,
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let metastore_path = expand_tilde(&cli.metastore);
    let datastore_path = expand_tilde(&cli.datastore);

    let requested = match requested_options(&cli) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("dedupfs: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.print_stats {
        return match print_stats(&metastore_path, &datastore_path, requested) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("dedupfs: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let Some(mountpoint) = cli.mountpoint.clone() else {
        eprintln!("dedupfs: a mountpoint is required unless --print-stats is given");
        return ExitCode::FAILURE;
    };

    let runtime = dedupfs_core::options::RuntimeConfig {
        use_transactions: !cli.no_transactions,
        gc_enabled: !cli.nogc,
        verify_writes: cli.verify_writes,
    };

    if !runtime.use_transactions {
        warn!("running with --no-transactions: mutations are no longer grouped atomically");
    }
    if !requested.synchronous {
        warn!("running with --nosync: durability is relaxed in exchange for throughput");
    }

    let filesystem = match fs::DedupFs::open(&metastore_path, &datastore_path, requested, runtime) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("dedupfs: failed to initialise store: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("mounting dedupfs at {}", mountpoint.display());
    let options = vec![
        fuser::MountOption::FSName("dedupfs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    // Single-threaded dispatch: the core assumes no callback overlaps
    // another, so the kernel's multi-request-in-flight mode is never
    // enabled.
    match fuser::mount2(filesystem, &mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dedupfs: mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_stats(
    metastore_path: &std::path::Path,
    datastore_path: &std::path::Path,
    requested: Options,
) -> anyhow::Result<()> {
    let (meta, _resolved, conflicts) = dedupfs_core::metastore::MetaStore::open(
        metastore_path,
        unsafe { libc::getuid() },
        unsafe { libc::getgid() },
        requested,
        true,
    )?;
    for c in &conflicts {
        warn!(
            "ignoring requested {} {:?}: store was created with {:?}",
            c.name, c.requested, c.persisted
        );
    }
    let blocks = dedupfs_core::blockstore::BlockStore::open(datastore_path)?;
    let metastore_bytes = std::fs::metadata(metastore_path).map(|m| m.len()).unwrap_or(0);
    let usage = DiskUsage::collect(&meta, &blocks, metastore_bytes)?;
    println!("{usage}");
    Ok(())
}
