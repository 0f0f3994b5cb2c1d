//! `kvbfsctl` — query the `.agentfs` control surface.
//!
//! `version` reads a persisted version counter directly out of the KV
//! store (works whether or not the filesystem is currently mounted).
//! `stats` needs the live event ring, which only exists inside a running
//! `kvbfsd`, so it goes through the mounted `.agentfs` file's `ioctl`.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kvbfs_core::{fsops, Context};
use kvbfs_kv::{embedded::EmbeddedStore, KvStore};

const DEFAULT_DB_PATH: &str = "/tmp/kvbfs_data";
const IOC_AGENTFS_STATS: libc::Ioctl = 2;

#[derive(Parser, Debug)]
#[command(name = "kvbfsctl", version, about = "Query the kvbfs control surface")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the version counter for an inode, read straight from the KV store.
    Version {
        /// Inode number to query.
        ino: u64,
    },
    /// Print the event ring's head/tail/seq, read from a mounted `.agentfs` file.
    Stats {
        /// Path to the mounted `.agentfs` control file.
        agentfs_path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Version { ino } => {
            let db_path =
                std::env::var("KVBFS_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
            let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::open(&db_path)?);
            let ctx = Context::open(kv)?;
            let version = fsops::version_of(&ctx, ino)?;
            println!("{version}");
        }
        Command::Stats { agentfs_path } => {
            let (head, tail, seq) = read_stats(&agentfs_path)?;
            println!("head={head} tail={tail} seq={seq}");
        }
    }
    Ok(())
}

fn read_stats(agentfs_path: &std::path::Path) -> anyhow::Result<(u64, u64, u64)> {
    let file = std::fs::File::open(agentfs_path)?;
    let mut buf = [0u8; 24];
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), IOC_AGENTFS_STATS, buf.as_mut_ptr()) };
    if ret < 0 {
        anyhow::bail!(std::io::Error::last_os_error());
    }
    let head = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let tail = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let seq = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    Ok((head, tail, seq))
}
