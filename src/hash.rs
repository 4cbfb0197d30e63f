//! Hash sidecar codec.
//!
//! A sidecar holds one fixed-width digest per block: 8 bytes, big-endian,
//! XXH64 of the bytes actually read. Block `k` occupies sidecar bytes
//! `[k*8, k*8+8)`. A geometry signature written alongside lets a later run
//! tell whether the sidecar still applies — any change in cluster size,
//! block size or bitmap extent degrades the run to a full read.

use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::xxh64;

use crate::device::{read_full_at, ReadAt, WriteAt};
use crate::error::{Error, Result};

/// Width of one sidecar entry in bytes.
pub const HASH_SIZE: usize = 8;

/// Content digest of one block.
pub fn block_hash(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

/// Hex SHA-256 over the big-endian packed iterator geometry.
pub fn signature(
    cluster_size: u32,
    block_size: u32,
    hash_size: u32,
    max_bit: i64,
    max_block: i64,
) -> String {
    let mut packed = [0u8; 28];
    packed[0..4].copy_from_slice(&cluster_size.to_be_bytes());
    packed[4..8].copy_from_slice(&block_size.to_be_bytes());
    packed[8..12].copy_from_slice(&hash_size.to_be_bytes());
    packed[12..20].copy_from_slice(&max_bit.to_be_bytes());
    packed[20..28].copy_from_slice(&max_block.to_be_bytes());

    let digest = Sha256::digest(packed);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Sidecar offset of the block starting at device offset `fs_offset`.
pub fn hash_offset(fs_offset: u64, block_size: u64) -> Result<u64> {
    if fs_offset % block_size != 0 {
        return Err(Error::HashAlign {
            offset: fs_offset,
            block_size,
        });
    }
    Ok(fs_offset / block_size * HASH_SIZE as u64)
}

pub fn read_hash(sidecar: &dyn ReadAt, hash_offset: u64) -> Result<u64> {
    let mut buf = [0u8; HASH_SIZE];
    let n = read_full_at(sidecar, &mut buf, hash_offset)?;
    if n != HASH_SIZE {
        return Err(Error::HashShortRead {
            got: n,
            expected: HASH_SIZE,
        });
    }
    Ok(u64::from_be_bytes(buf))
}

pub fn write_hash(sidecar: &dyn WriteAt, hash_offset: u64, value: u64) -> Result<()> {
    let buf = value.to_be_bytes();
    let n = sidecar.write_at(&buf, hash_offset)?;
    if n != HASH_SIZE {
        return Err(Error::HashShortWrite {
            wrote: n,
            expected: HASH_SIZE,
        });
    }
    Ok(())
}
