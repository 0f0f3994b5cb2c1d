//! `kvbfsd` — mount a kvbfs filesystem at a mountpoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use kvbfs_core::Context;
use kvbfs_fuse::KvbfsFs;
use kvbfs_kv::{embedded::EmbeddedStore, KvStore};

const DEFAULT_DB_PATH: &str = "/tmp/kvbfs_data";

#[derive(Parser, Debug)]
#[command(name = "kvbfsd", version, about = "Mount a kvbfs filesystem")]
struct Args {
    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Enable debug-level FUSE tracing; implies running in the foreground.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Run the FUSE session on the calling thread instead of a background one.
    #[arg(short = 's', long)]
    single_threaded: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let foreground = args.foreground || args.debug;

    // fuser logs its own per-request tracing via the `log` facade; bridge
    // it into the same tracing subscriber so `-d` actually shows it.
    tracing_log::LogTracer::init()?;
    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if !foreground {
        tracing::warn!("daemonizing is not implemented; running in the foreground");
    }

    let db_path = std::env::var("KVBFS_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    tracing::info!(db_path, mountpoint = %args.mountpoint.display(), "starting kvbfs");

    let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::open(&db_path)?);
    let ctx = Context::open(kv)?;
    let fs = KvbfsFs::new(ctx);

    let options = vec![MountOption::FSName("kvbfs".to_string())];

    if args.single_threaded {
        tracing::info!("kvbfs mounted (single-threaded), waiting for unmount");
        tracing::warn!("single-threaded mode has no background session; notifier-driven cache invalidation is unavailable");
        return fuser::mount2(fs, &args.mountpoint, &options).map_err(anyhow::Error::from);
    }

    let session = fuser::spawn_mount2(fs.clone(), &args.mountpoint, &options)?;
    fs.set_notifier(session.notifier());

    tracing::info!("kvbfs mounted, waiting for unmount");
    match session.guard.join() {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => anyhow::bail!("fuse session thread panicked"),
    }
}
