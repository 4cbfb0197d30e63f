//! EXT2/3/4 allocation-bitmap extraction.
//!
//! EXT keeps one block-sized data bitmap per block group, addressed through
//! the group descriptor table. Concatenating the per-group bitmaps in group
//! order yields the volume-wide cluster bitmap directly; the only wrinkle is
//! that some groups report an empty bitmap for their own metadata blocks and
//! have to be reconciled from the descriptor's first-unused-block field.

use crate::bits::set_prefix_bits;
use crate::device::{read_full_at, ReadAt};
use crate::endian::LeReader;
use crate::error::{Error, Result};

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;

/// Extract `(cluster_size, bitmap)` from a device holding an EXT2/3/4
/// filesystem. The cluster size is the filesystem block size.
pub fn extract(dev: &dyn ReadAt) -> Result<(u32, Vec<u8>)> {
    let mut sb = vec![0u8; SUPERBLOCK_SIZE];
    let n = read_full_at(dev, &mut sb, SUPERBLOCK_OFFSET)?;
    if n != SUPERBLOCK_SIZE {
        return Err(Error::ExtParse(format!("short superblock read ({n} bytes)")));
    }
    let r = LeReader::new(&sb);

    let log_block_size = r.u32(0x18);
    if log_block_size > 6 {
        return Err(Error::ExtParse(format!(
            "implausible s_log_block_size {log_block_size}"
        )));
    }
    let block_size = 1u64 << (10 + log_block_size);
    let blocks_per_group = r.u32(0x20) as u64;
    let total_blocks = r.u32(0x04) as u64;
    if blocks_per_group == 0 || total_blocks == 0 {
        return Err(Error::ExtParse(format!(
            "zero geometry: blocks={total_blocks} blocks_per_group={blocks_per_group}"
        )));
    }

    // Ceiling: resize2fs can leave the last group smaller than a full group.
    let group_count = (total_blocks + blocks_per_group - 1) / blocks_per_group;
    if blocks_per_group > total_blocks {
        log::warn!("ext extract: total blocks {total_blocks} less than blocks-per-group {blocks_per_group}");
    }

    // 32 bytes on ext2/3 and 32-bit ext4; 64 and up means 64-bit ext4.
    let mut desc_size = r.u16(0xFE) as u64;
    if desc_size == 0 {
        desc_size = 32;
    }
    log::debug!(
        "ext extract: block_size={block_size} groups={group_count} desc_size={desc_size}"
    );

    // The GDT starts at the block following the superblock.
    let gdt_offset = (SUPERBLOCK_OFFSET / block_size + 1) * block_size;

    let mut out = Vec::with_capacity((group_count * block_size) as usize);
    for group in 0..group_count {
        let mut desc = vec![0u8; desc_size as usize];
        let n = read_full_at(dev, &mut desc, gdt_offset + group * desc_size)?;
        if n != desc.len() {
            return Err(Error::ExtParse(format!(
                "short group descriptor read for group {group}"
            )));
        }
        let d = LeReader::new(&desc);

        let mut bitmap_block = d.u32(0x00) as u64;
        if desc_size >= 64 {
            bitmap_block |= (d.u32(0x20) as u64) << 32;
        }

        let mut bitmap = vec![0u8; block_size as usize];
        let n = read_full_at(dev, &mut bitmap, bitmap_block * block_size)?;
        if n != bitmap.len() {
            return Err(Error::ExtParse(format!(
                "short bitmap read for group {group} at block {bitmap_block}"
            )));
        }

        let mut unused = d.u16(0x0C) as u64;
        if desc_size >= 64 {
            unused |= (d.u16(0x2C) as u64) << 16;
        }
        let first_unused_abs = ((group + 1) * blocks_per_group) as i64 - unused as i64;

        // Groups that carry a superblock copy and GDT must show those blocks
        // as allocated. When the leading bits are clear, force the span up to
        // the first unused block; a span that would be negative means the
        // descriptor is corrupt.
        if bitmap[0] & 0b1100_0000 != 0b1100_0000 {
            let need_fix = first_unused_abs - (group * blocks_per_group) as i64;
            if need_fix > 0 {
                set_prefix_bits(&mut bitmap, need_fix as u64);
                log::warn!("ext extract: group {group} fixed {need_fix} bits");
            } else if need_fix < 0 {
                return Err(Error::ExtBitmapFix(format!(
                    "group {group}: first unused block {first_unused_abs} precedes group start"
                )));
            }
            // need_fix == 0: the group holds only data blocks, nothing to fix.
        }

        out.extend_from_slice(&bitmap);
    }

    debug_assert!(out.len() as u64 * 8 >= total_blocks);
    Ok((block_size as u32, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::test_bit;

    // Minimal single-group image: 4096-byte blocks, bitmap in block 2.
    fn synthetic_image(total_blocks: u32, allocated: &[u64], unused: u16) -> Vec<u8> {
        let mut img = vec![0u8; 3 * 4096];
        // Superblock at 1024.
        img[1024 + 0x18] = 2; // s_log_block_size: 2^(10+2) = 4096
        img[1024 + 0x04..1024 + 0x08].copy_from_slice(&total_blocks.to_le_bytes());
        img[1024 + 0x20..1024 + 0x24].copy_from_slice(&8192u32.to_le_bytes());
        // Group descriptor 0 at start of block 1: bitmap block = 2.
        img[4096..4100].copy_from_slice(&2u32.to_le_bytes());
        img[4096 + 0x0C..4096 + 0x0E].copy_from_slice(&unused.to_le_bytes());
        // Data bitmap in block 2.
        for &bit in allocated {
            crate::bits::set_bit(&mut img[8192..], bit, true);
        }
        img
    }

    #[test]
    fn extracts_single_group_bitmap() {
        let img = synthetic_image(2560, &[0, 1, 2, 3, 4], 0);
        let (cluster, bitmap) = extract(&img).unwrap();
        assert_eq!(cluster, 4096);
        assert_eq!(bitmap.len(), 4096);
        for k in 0..5 {
            assert!(test_bit(&bitmap, k), "bit {k} should be set");
        }
        for k in 5..2560 {
            assert!(!test_bit(&bitmap, k), "bit {k} should be clear");
        }
    }

    #[test]
    fn fixes_truncated_group_bitmap() {
        // Leading bits clear, 8192 - 8187 = 5 metadata blocks to reconcile.
        let img = synthetic_image(2560, &[10], 8187);
        let (_, bitmap) = extract(&img).unwrap();
        for k in 0..5 {
            assert!(test_bit(&bitmap, k), "bit {k} should be fixed up");
        }
        assert!(test_bit(&bitmap, 10));
        assert!(!test_bit(&bitmap, 5));
    }

    #[test]
    fn empty_group_of_data_blocks_left_alone() {
        // unused == blocks_per_group: the group starts at its first unused
        // block, nothing to reconcile.
        let img = synthetic_image(2560, &[], 8192);
        let (_, bitmap) = extract(&img).unwrap();
        assert!(bitmap.iter().all(|&b| b == 0));
    }

    #[test]
    fn handles_64bit_descriptors() {
        let mut img = vec![0u8; 3 * 4096];
        img[1024 + 0x18] = 2;
        img[1024 + 0x04..1024 + 0x08].copy_from_slice(&2560u32.to_le_bytes());
        img[1024 + 0x20..1024 + 0x24].copy_from_slice(&8192u32.to_le_bytes());
        img[1024 + 0xFE..1024 + 0x100].copy_from_slice(&64u16.to_le_bytes());
        // 64-byte descriptor: bitmap block 2 in the low half, zero high half.
        img[4096..4100].copy_from_slice(&2u32.to_le_bytes());
        crate::bits::set_bit(&mut img[8192..], 0, true);
        crate::bits::set_bit(&mut img[8192..], 1, true);
        crate::bits::set_bit(&mut img[8192..], 7, true);

        let (cluster, bitmap) = extract(&img).unwrap();
        assert_eq!(cluster, 4096);
        assert!(test_bit(&bitmap, 7));
        assert!(!test_bit(&bitmap, 8));
    }

    #[test]
    fn corrupt_descriptor_fails() {
        // unused beyond the group's span would force a negative fix.
        let img = synthetic_image(2560, &[], 9000);
        assert!(matches!(extract(&img), Err(Error::ExtBitmapFix(_))));
    }

    #[test]
    fn short_device_fails_parse() {
        let img = vec![0u8; 512];
        assert!(matches!(extract(&img), Err(Error::ExtParse(_))));
    }
}
