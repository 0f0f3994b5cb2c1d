//! Directory-entry invariants that only show up once several modules
//! cooperate through `Context`: pagination stability across nested
//! directories, and nlink bookkeeping surviving rename/link/unlink churn.

use std::sync::Arc;

use kvbfs_core::fsops::{self, OpenFlags};
use kvbfs_core::{Context, CoreError, ROOT_INO};
use kvbfs_kv::{embedded::EmbeddedStore, KvStore};

fn ctx() -> Arc<Context> {
    let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
    Context::open(kv).unwrap()
}

/// Paginating `readdir` one entry at a time must see the same set of
/// names, in the same order, as one unpaginated call.
#[test]
fn paginated_readdir_matches_single_shot_listing() {
    let ctx = ctx();
    let (dir_ino, _) = fsops::mkdir(&ctx, ROOT_INO, "work", 0o755).unwrap();
    for i in 0..40 {
        fsops::create(&ctx, dir_ino, &format!("f{i:03}.txt"), 0o644).unwrap();
    }

    let whole = fsops::readdir(&ctx, dir_ino, ROOT_INO, 0).unwrap();

    let mut paged = Vec::new();
    let mut offset = 0;
    loop {
        let page = fsops::readdir(&ctx, dir_ino, ROOT_INO, offset).unwrap();
        if page.is_empty() {
            break;
        }
        offset = page.last().unwrap().next_offset;
        paged.extend(page);
    }

    let whole_names: Vec<&str> = whole.iter().map(|e| e.name.as_str()).collect();
    let paged_names: Vec<&str> = paged.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(whole_names, paged_names);
    assert_eq!(whole_names.len(), 42); // "." + ".." + 40 files
}

/// A directory moved into another directory keeps exactly one `..`
/// entry, and it points at the new parent once the caller passes the
/// new parent ino through (core delegates that choice to the caller per
/// the permitted `..`-as-self-ino simplification).
#[test]
fn nested_mkdir_rename_preserves_dot_dot_and_nlink() {
    let ctx = ctx();
    let (outer, _) = fsops::mkdir(&ctx, ROOT_INO, "outer", 0o755).unwrap();
    let (inner, _) = fsops::mkdir(&ctx, ROOT_INO, "inner", 0o755).unwrap();
    assert_eq!(fsops::getattr(&ctx, ROOT_INO).unwrap().nlink, 4); // ".", "..", outer, inner

    fsops::rename(&ctx, ROOT_INO, "inner", outer, "inner").unwrap();
    assert!(matches!(
        fsops::lookup(&ctx, ROOT_INO, "inner"),
        Err(CoreError::NotFound)
    ));
    let (found, attr) = fsops::lookup(&ctx, outer, "inner").unwrap();
    assert_eq!(found, inner);
    assert!(attr.is_dir());

    // root lost a child, outer gained one
    assert_eq!(fsops::getattr(&ctx, ROOT_INO).unwrap().nlink, 3);
    assert_eq!(fsops::getattr(&ctx, outer).unwrap().nlink, 3);

    let entries = fsops::readdir(&ctx, inner, outer, 0).unwrap();
    let dotdot = entries.iter().find(|e| e.name == "..").unwrap();
    assert_eq!(dotdot.ino, outer);
}

/// Hard-linking a file into two directories, then removing both names,
/// only frees the inode on the last unlink — exercised end to end
/// through directory ops, not just the cache layer directly.
#[test]
fn hardlink_across_directories_survives_one_removal() {
    let ctx = ctx();
    let (dir_a, _) = fsops::mkdir(&ctx, ROOT_INO, "a", 0o755).unwrap();
    let (dir_b, _) = fsops::mkdir(&ctx, ROOT_INO, "b", 0o755).unwrap();
    let (h, _) = fsops::create(&ctx, dir_a, "shared.txt", 0o644).unwrap();
    let ino = h.ino();
    fsops::release(&ctx, h).unwrap();

    fsops::link(&ctx, ino, dir_b, "shared.txt").unwrap();
    fsops::unlink(&ctx, dir_a, "shared.txt").unwrap();

    // still reachable from b
    let (found, _) = fsops::lookup(&ctx, dir_b, "shared.txt").unwrap();
    assert_eq!(found, ino);
    let h2 = fsops::open(&ctx, ino, OpenFlags::default()).unwrap();
    fsops::release(&ctx, h2).unwrap();

    fsops::unlink(&ctx, dir_b, "shared.txt").unwrap();
    assert!(matches!(
        fsops::getattr(&ctx, ino),
        Err(CoreError::NotFound)
    ));
}
