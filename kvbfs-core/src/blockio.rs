//! Block I/O: fixed 4096-byte blocks stored one-per-key, sparse holes
//! read back as zero, and read-modify-write on partial-block writes so
//! every stored block is always exactly `BLOCK_SIZE` bytes.

use std::sync::Arc;

use kvbfs_kv::KvStore;

use crate::codec;
use crate::error::CoreResult;
use crate::model::BLOCK_SIZE;

/// Read `size` bytes starting at `offset`, already clamped by the caller
/// to the inode's current length. Missing blocks, and the unwritten tail
/// of a short block, come back as zero.
pub fn read(kv: &Arc<dyn KvStore>, ino: u64, offset: u64, size: usize) -> CoreResult<Vec<u8>> {
    let mut out = vec![0u8; size];
    let mut done = 0usize;
    let mut block_idx = offset / BLOCK_SIZE;
    let mut block_off = (offset % BLOCK_SIZE) as usize;

    while done < size {
        let to_copy = (BLOCK_SIZE as usize - block_off).min(size - done);
        let key = codec::block_key(ino, block_idx)?;
        if let Some(block) = kv.get(&key)? {
            let avail = block.len().saturating_sub(block_off);
            let n = avail.min(to_copy);
            out[done..done + n].copy_from_slice(&block[block_off..block_off + n]);
            // any remainder (block shorter than BLOCK_SIZE, or past EOF
            // within this block) stays zeroed.
        }
        done += to_copy;
        block_idx += 1;
        block_off = 0;
    }
    Ok(out)
}

/// Write `data` at `offset`, read-modify-writing each touched block so it
/// is always persisted at the full block size. Returns the number of
/// bytes written (always `data.len()`).
pub fn write(kv: &Arc<dyn KvStore>, ino: u64, offset: u64, data: &[u8]) -> CoreResult<usize> {
    let mut done = 0usize;
    let mut block_idx = offset / BLOCK_SIZE;
    let mut block_off = (offset % BLOCK_SIZE) as usize;

    while done < data.len() {
        let key = codec::block_key(ino, block_idx)?;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        if let Some(existing) = kv.get(&key)? {
            let n = existing.len().min(BLOCK_SIZE as usize);
            block[..n].copy_from_slice(&existing[..n]);
        }

        let to_write = (BLOCK_SIZE as usize - block_off).min(data.len() - done);
        block[block_off..block_off + to_write].copy_from_slice(&data[done..done + to_write]);
        kv.put(&key, &block)?;

        done += to_write;
        block_idx += 1;
        block_off = 0;
    }
    Ok(done)
}

/// Drop every block at or beyond the block containing `new_size`, and
/// zero-tail the block straddling the new boundary. Used by `setattr`
/// when shrinking a file and by `unlink`/version GC when discarding one
/// entirely (`new_size == 0`).
pub fn truncate(kv: &Arc<dyn KvStore>, ino: u64, old_size: u64, new_size: u64) -> CoreResult<()> {
    if new_size < old_size {
        let boundary_block = new_size / BLOCK_SIZE;
        let boundary_off = (new_size % BLOCK_SIZE) as usize;
        if boundary_off != 0 {
            let key = codec::block_key(ino, boundary_block)?;
            if let Some(mut block) = kv.get(&key)? {
                block.truncate(boundary_off);
                block.resize(BLOCK_SIZE as usize, 0);
                kv.put(&key, &block)?;
            }
        }
        let first_dropped = if boundary_off == 0 {
            boundary_block
        } else {
            boundary_block + 1
        };
        let last_block = old_size.div_ceil(BLOCK_SIZE);
        for b in first_dropped..last_block {
            kv.delete(&codec::block_key(ino, b)?)?;
        }
    }
    Ok(())
}

/// Delete every block belonging to `ino`, for unlink of the final link.
pub fn delete_all(kv: &Arc<dyn KvStore>, ino: u64, size: u64) -> CoreResult<()> {
    let last_block = size.div_ceil(BLOCK_SIZE);
    for b in 0..last_block {
        kv.delete(&codec::block_key(ino, b)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbfs_kv::embedded::EmbeddedStore;

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(EmbeddedStore::in_memory())
    }

    #[test]
    fn write_then_read_back_exact_bytes() {
        let kv = kv();
        write(&kv, 1, 0, b"hello world").unwrap();
        let got = read(&kv, 1, 0, 11).unwrap();
        assert_eq!(&got, b"hello world");
    }

    #[test]
    fn read_past_written_data_is_zero() {
        let kv = kv();
        write(&kv, 1, 0, b"ab").unwrap();
        let got = read(&kv, 1, 0, 8).unwrap();
        assert_eq!(got, vec![b'a', b'b', 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sparse_hole_across_block_reads_as_zero() {
        let kv = kv();
        write(&kv, 1, 0, b"first").unwrap();
        write(&kv, 1, 2 * BLOCK_SIZE, b"third").unwrap();
        let got = read(&kv, 1, 0, (2 * BLOCK_SIZE) as usize + 5).unwrap();
        assert_eq!(&got[0..5], b"first");
        assert!(got[5..2 * BLOCK_SIZE as usize].iter().all(|&b| b == 0));
        assert_eq!(&got[2 * BLOCK_SIZE as usize..], b"third");
    }

    #[test]
    fn write_spanning_two_blocks_reads_back_whole() {
        let kv = kv();
        let data: Vec<u8> = (0..(BLOCK_SIZE as usize + 100)).map(|i| (i % 251) as u8).collect();
        write(&kv, 1, 0, &data).unwrap();
        let got = read(&kv, 1, 0, data.len()).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn truncate_shrinks_and_zero_tails_boundary_block() {
        let kv = kv();
        write(&kv, 1, 0, &vec![7u8; BLOCK_SIZE as usize]).unwrap();
        truncate(&kv, 1, BLOCK_SIZE, 10).unwrap();
        let got = read(&kv, 1, 0, BLOCK_SIZE as usize).unwrap();
        assert_eq!(&got[..10], &vec![7u8; 10][..]);
        assert!(got[10..].iter().all(|&b| b == 0));
    }
}
