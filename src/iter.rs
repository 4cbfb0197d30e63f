//! Block-sized striding cursor over a cluster bitmap.
//!
//! The iterator maps logical device offsets to bitmap bit ranges at a
//! block size that is a whole multiple of the cluster size. The cursor is
//! advanced by a single driver; `lookup` is pure and may be called from any
//! number of worker threads against spans the driver handed out.

use std::sync::Mutex;

use crate::bitmap::Bitmap;
use crate::bits::scan_first_nonzero;
use crate::config::BlockSize;
use crate::detect::FilesystemKind;
use crate::error::{Error, Result};
use crate::hash;

/// Cluster size adopted when the bitmap is ineffective and the caller asked
/// for cluster-sized blocks.
const DEFAULT_CLUSTER_SIZE: u32 = 2 << 10;

/// One iteration step: the block and the bitmap bit range it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block_index: u64,
    pub bit_start: u64,
    /// Exclusive; clipped to `max_bit` on the final block.
    pub bit_end: u64,
}

/// Allocation verdict for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveBlockAddr {
    pub block_byte_offset: u64,
    pub block_index: u64,
    pub bit_start: u64,
    pub bit_end: u64,
    /// Earliest set bit in `[bit_start, bit_end)`; `bit_start` when the
    /// bitmap is ineffective.
    pub first_nonzero_bit: u64,
    pub block_byte_size: u64,
    pub allocated: bool,
    pub is_last_block: bool,
}

#[derive(Debug)]
struct Cursor {
    block_index: i64,
    bit_start: i64,
    bit_end: i64,
}

#[derive(Debug)]
pub struct BitmapIterator {
    bitmap: Bitmap,
    requested: BlockSize,
    /// Resolved cluster size; equals the bitmap's when it is effective.
    cluster_size: u32,
    block_size: u64,
    bits_per_block: u64,
    max_bit: u64,
    max_block: u64,
    fs_signature: String,
    cursor: Mutex<Cursor>,
}

impl BitmapIterator {
    /// Negotiate the block size against the bitmap and build the iterator.
    ///
    /// NTFS volumes read on non-Windows hosts are forced to 2 MiB blocks
    /// regardless of the request: some allocated runs show up as zero in
    /// `$Bitmap` there, and a coarse block treats any set bit in the window
    /// as allocated, hiding the false negative.
    pub fn new(bitmap: Bitmap, block_size: BlockSize) -> Result<Self> {
        let mut requested = block_size;
        if bitmap.fs_kind == FilesystemKind::Ntfs && !cfg!(target_os = "windows") {
            requested = BlockSize::Bytes(2 << 20);
        }

        let mut cluster_size = bitmap.cluster_size_bytes;
        let resolved: u64 = match requested {
            BlockSize::Cluster => {
                if cluster_size == 0 {
                    cluster_size = DEFAULT_CLUSTER_SIZE;
                }
                cluster_size as u64
            }
            BlockSize::Bytes(b) => {
                if cluster_size == 0 {
                    if b == 0 || b > u32::MAX as u64 {
                        return Err(Error::IterBadMultiple {
                            block_size: b,
                            cluster_size: 0,
                        });
                    }
                    cluster_size = b as u32;
                }
                b
            }
        };

        if resolved > bitmap.device_size_bytes {
            return Err(Error::IterBlockTooLarge {
                block_size: resolved,
                device_size: bitmap.device_size_bytes,
            });
        }
        if resolved == 0 || resolved % cluster_size as u64 != 0 {
            return Err(Error::IterBadMultiple {
                block_size: resolved,
                cluster_size: cluster_size as u64,
            });
        }
        let bits_per_block = resolved / cluster_size as u64;

        let max_bit = if bitmap.effective() {
            bitmap.bits.len() as u64 * 8
        } else {
            let c = cluster_size as u64;
            (bitmap.device_size_bytes + c - 1) / c
        };
        let max_block = (max_bit + bits_per_block - 1) / bits_per_block;

        let fs_signature = hash::signature(
            cluster_size,
            resolved as u32,
            hash::HASH_SIZE as u32,
            max_bit as i64,
            max_block as i64,
        );

        let it = BitmapIterator {
            bitmap,
            requested: block_size,
            cluster_size,
            block_size: resolved,
            bits_per_block,
            max_bit,
            max_block,
            fs_signature,
            cursor: Mutex::new(Cursor {
                block_index: 0,
                bit_start: 0,
                bit_end: 0,
            }),
        };
        it.reset();
        Ok(it)
    }

    /// Advance the cursor one block and return its span, or `None` once all
    /// of `[0, max_block)` has been handed out. Single-caller by contract.
    pub fn next(&self) -> Option<BlockSpan> {
        let mut c = self.cursor.lock().unwrap();
        if c.block_index >= self.max_block as i64 - 1 {
            return None;
        }
        c.block_index += 1;
        c.bit_start += self.bits_per_block as i64;
        if (c.block_index + 1) as u64 == self.max_block {
            c.bit_end = self.max_bit as i64;
        } else {
            c.bit_end += self.bits_per_block as i64;
        }
        Some(BlockSpan {
            block_index: c.block_index as u64,
            bit_start: c.bit_start as u64,
            bit_end: c.bit_end as u64,
        })
    }

    /// Re-arm the cursor so the next `next()` yields block 0.
    pub fn reset(&self) {
        let mut c = self.cursor.lock().unwrap();
        c.block_index = -1;
        c.bit_start = -(self.bits_per_block as i64);
        c.bit_end = 0;
    }

    /// Allocation verdict for a span. Pure: no cursor state is touched, so
    /// workers may call this concurrently with spans the driver handed out.
    pub fn lookup(&self, block_index: u64, bit_start: u64, bit_end: u64) -> Result<EffectiveBlockAddr> {
        if block_index >= self.max_block {
            return Err(Error::IterOverflow(block_index));
        }
        let base = EffectiveBlockAddr {
            block_byte_offset: block_index * self.block_size,
            block_index,
            bit_start,
            bit_end,
            first_nonzero_bit: bit_start,
            block_byte_size: self.block_size,
            allocated: true,
            is_last_block: block_index + 1 == self.max_block,
        };
        if !self.bitmap.effective() {
            return Ok(base);
        }
        match scan_first_nonzero(&self.bitmap.bits, bit_start, bit_end) {
            Some(first) => Ok(EffectiveBlockAddr {
                first_nonzero_bit: first,
                ..base
            }),
            None => Ok(EffectiveBlockAddr {
                first_nonzero_bit: 0,
                allocated: false,
                ..base
            }),
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn fs_kind(&self) -> FilesystemKind {
        self.bitmap.fs_kind
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The caller's original request, before negotiation.
    pub fn requested_block_size(&self) -> BlockSize {
        self.requested
    }

    pub fn device_size(&self) -> u64 {
        self.bitmap.device_size_bytes
    }

    pub fn max_bit(&self) -> u64 {
        self.max_bit
    }

    pub fn max_block(&self) -> u64 {
        self.max_block
    }

    /// Geometry digest gating incremental runs; see the hash module.
    pub fn fs_signature(&self) -> &str {
        &self.fs_signature
    }
}
