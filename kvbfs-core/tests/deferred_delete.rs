//! Deferred delete under real concurrency: a reader holding an open
//! handle must be able to finish reading the bytes it had, even if
//! another thread unlinks the only remaining name for the file in the
//! meantime. Reclamation (blocks, xattrs, version history, and the
//! inode record) only happens once every outstanding handle is gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use kvbfs_core::fsops::{self, OpenFlags};
use kvbfs_core::{Context, CoreError, ROOT_INO};
use kvbfs_kv::{embedded::EmbeddedStore, KvStore};
use proptest::prelude::*;

fn ctx() -> Arc<Context> {
    let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
    Context::open(kv).unwrap()
}

/// The literal scenario from the testable-properties list: open file F,
/// another thread unlinks it, the still-open handle's read still
/// returns the prior bytes, `lookup` is already not-found, and only
/// after `release` does the inode become fully unreachable.
#[test]
fn read_through_open_handle_survives_concurrent_unlink() {
    let ctx = ctx();
    let (mut h, _) = fsops::create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
    fsops::write(&ctx, &mut h, 0, b"payload bytes").unwrap();
    fsops::release(&ctx, h).unwrap();

    let reader_handle = fsops::open(&ctx, 2, OpenFlags::default()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let unlinker_ctx = ctx.clone();
    let unlinker_barrier = barrier.clone();
    let unlinker = thread::spawn(move || {
        unlinker_barrier.wait();
        fsops::unlink(&unlinker_ctx, ROOT_INO, "f.txt").unwrap();
    });

    barrier.wait();
    unlinker.join().unwrap();

    // the name is gone, but the still-open handle can read the bytes it
    // had from before the unlink completed.
    assert!(matches!(
        fsops::lookup(&ctx, ROOT_INO, "f.txt"),
        Err(CoreError::NotFound)
    ));
    let data = fsops::read(&ctx, &reader_handle, 0, 13).unwrap();
    assert_eq!(&data, b"payload bytes");

    // a *fresh* acquire by ino is already not-found (the KV inode record
    // is gone); only the handle opened before the unlink keeps working.
    assert!(matches!(fsops::getattr(&ctx, 2), Err(CoreError::NotFound)));

    fsops::release(&ctx, reader_handle).unwrap();
    assert!(matches!(fsops::getattr(&ctx, 2), Err(CoreError::NotFound)));
}

/// Many overlapping opener/unlinker pairs across distinct files: every
/// opener must see its own bytes intact regardless of unlink timing, and
/// nothing panics or deadlocks under the race.
#[test]
fn overlapping_open_and_unlink_never_corrupts_or_panics() {
    let ctx = ctx();
    let file_count = 16;
    let mut inos = Vec::new();
    for i in 0..file_count {
        let (mut h, _) = fsops::create(&ctx, ROOT_INO, &format!("race{i}.bin"), 0o644).unwrap();
        let ino = h.ino();
        fsops::write(&ctx, &mut h, 0, format!("content-{i}").as_bytes()).unwrap();
        fsops::release(&ctx, h).unwrap();
        inos.push(ino);
    }

    let survived = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..file_count)
        .map(|i| {
            let ctx = ctx.clone();
            let survived = survived.clone();
            thread::spawn(move || {
                let expected = format!("content-{i}");
                let reader = fsops::open(&ctx, 2 + i as u64, OpenFlags::default());
                let unlinker_ctx = ctx.clone();
                let unlink_thread = thread::spawn(move || {
                    let _ = fsops::unlink(&unlinker_ctx, ROOT_INO, &format!("race{i}.bin"));
                });
                if let Ok(h) = reader {
                    let data = fsops::read(&ctx, &h, 0, expected.len()).unwrap();
                    assert_eq!(data, expected.as_bytes());
                    fsops::release(&ctx, h).unwrap();
                    survived.fetch_add(1, Ordering::SeqCst);
                }
                unlink_thread.join().unwrap();
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(survived.load(Ordering::SeqCst), file_count);
    for ino in inos {
        assert!(matches!(fsops::getattr(&ctx, ino), Err(CoreError::NotFound)));
    }
}

proptest! {
    /// For a random interleaving of open/write/release/unlink calls against
    /// a single file driven from two threads, the only observable outcomes
    /// are: the read either succeeds with some previously-written content
    /// or fails because the handle was never opened — it must never panic,
    /// deadlock, or return corrupt/garbage bytes for a handle that is
    /// still open.
    #[test]
    fn random_open_unlink_interleaving_is_race_free(unlink_first in any::<bool>(), payload_len in 1usize..64) {
        let ctx = ctx();
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        let (mut h, _) = fsops::create(&ctx, ROOT_INO, "r.bin", 0o644).unwrap();
        fsops::write(&ctx, &mut h, 0, &payload).unwrap();
        fsops::release(&ctx, h).unwrap();

        let reader = fsops::open(&ctx, 2, OpenFlags::default()).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let unlinker_ctx = ctx.clone();
        let unlinker_barrier = barrier.clone();
        let unlinker = thread::spawn(move || {
            unlinker_barrier.wait();
            fsops::unlink(&unlinker_ctx, ROOT_INO, "r.bin").unwrap();
        });

        let reader_thread = {
            let ctx = ctx.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                if unlink_first {
                    thread::yield_now();
                }
                barrier.wait();
                fsops::read(&ctx, &reader, 0, payload_len).unwrap()
            })
        };

        unlinker.join().unwrap();
        let data = reader_thread.join().unwrap();
        prop_assert_eq!(data, payload);
    }
}
