//! XFS allocation-bitmap extraction.
//!
//! XFS tracks *free* space, not used space: each allocation group owns a
//! B+tree of free extents keyed by block number (the BNO tree, rooted from
//! the AGF). The bitmap is therefore built backwards — start with every
//! data block marked allocated, walk each AG's BNO tree, and clear the bits
//! of every free extent it yields.

use uuid::Uuid;

use crate::bits::{set_bit, set_prefix_bits};
use crate::device::{read_full_at, ReadAt};
use crate::endian::BeReader;
use crate::error::{Error, Result};

const SB_MAGIC: &[u8; 4] = b"XFSB";
const AGF_MAGIC: &[u8; 4] = b"XAGF";
const BTREE_MAGIC_V5: &[u8; 4] = b"AB3B";
const BTREE_MAGIC_V4: &[u8; 4] = b"ABTB";

// On-disk B+tree block header sizes, magic/level/numrecs prefix included.
// Short form addresses within one AG, long form across AGs.
const SHORT_HDR_LEN: usize = 56;
const LONG_HDR_LEN: usize = 72;

const ALLOC_REC_LEN: usize = 8;
const ALLOC_PTR_LEN: usize = 4;

/// The superblock fields extraction needs. All on-disk values big-endian.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub block_size: u32,
    pub dblocks: u64,
    pub agblocks: u32,
    pub agcount: u32,
    pub sector_size: u16,
    pub uuid: Uuid,
    pub meta_uuid: Uuid,
}

impl Superblock {
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < 264 {
            return Err(Error::XfsSuperblock(format!(
                "superblock is {} bytes, expected at least 264",
                b.len()
            )));
        }
        let r = BeReader::new(b);
        if r.bytes(0, 4) != SB_MAGIC {
            return Err(Error::XfsSuperblock(format!(
                "bad magic {:02x?}",
                r.bytes(0, 4)
            )));
        }
        let sb = Superblock {
            block_size: r.u32(4),
            dblocks: r.u64(8),
            agblocks: r.u32(84),
            agcount: r.u32(88),
            sector_size: r.u16(102),
            uuid: Uuid::from_slice(r.bytes(32, 16)).expect("16-byte slice"),
            meta_uuid: Uuid::from_slice(r.bytes(248, 16)).expect("16-byte slice"),
        };
        if sb.block_size < 512 || sb.block_size > 0x10000 || !sb.block_size.is_power_of_two() {
            return Err(Error::XfsSuperblock(format!(
                "implausible block size {}",
                sb.block_size
            )));
        }
        if sb.dblocks == 0 || sb.agblocks == 0 || sb.agcount == 0 {
            return Err(Error::XfsSuperblock(format!(
                "zero geometry: dblocks={} agblocks={} agcount={}",
                sb.dblocks, sb.agblocks, sb.agcount
            )));
        }
        Ok(sb)
    }
}

/// Parsed BNO B+tree block header, either on-disk form.
#[derive(Debug, Clone, Copy)]
struct BtreeHeader {
    level: u16,
    numrecs: u16,
    /// On-disk header length, deciding where records start.
    size: usize,
}

/// Decide short vs long form by matching the header UUID field against the
/// superblock's `sb_uuid`/`sb_meta_uuid` (a nil UUID never matches), then
/// validate the magic.
fn parse_btree_header(block: &[u8], sb: &Superblock) -> Result<BtreeHeader> {
    if block.len() < LONG_HDR_LEN {
        return Err(Error::XfsBtreeHeader(format!(
            "btree block is {} bytes, too small for any header form",
            block.len()
        )));
    }
    let r = BeReader::new(block);

    let uuid_short = Uuid::from_slice(r.bytes(32, 16)).expect("16-byte slice");
    let uuid_long = Uuid::from_slice(r.bytes(40, 16)).expect("16-byte slice");
    let size = if uuid_short == sb.uuid && !uuid_short.is_nil() {
        SHORT_HDR_LEN
    } else if uuid_long == sb.uuid && !uuid_long.is_nil() {
        LONG_HDR_LEN
    } else if uuid_short == sb.meta_uuid && !uuid_short.is_nil() {
        SHORT_HDR_LEN
    } else if uuid_long == sb.meta_uuid && !uuid_long.is_nil() {
        LONG_HDR_LEN
    } else {
        return Err(Error::XfsBtreeHeader(
            "btree block uuid matches neither sb_uuid nor sb_meta_uuid".into(),
        ));
    };

    let magic: [u8; 4] = r.bytes(0, 4).try_into().unwrap();
    if &magic != BTREE_MAGIC_V5 && &magic != BTREE_MAGIC_V4 {
        return Err(Error::XfsBtreeMagic(magic));
    }

    Ok(BtreeHeader {
        level: r.u16(4),
        numrecs: r.u16(6),
        size,
    })
}

/// Start of the pointer array in an internal node. Pointers sit after the
/// maximum possible number of keys, computed as if the block were full, so
/// their slot is stable regardless of the actual record count.
fn btree_ptr_offset(block_size: usize, header_size: usize) -> usize {
    let max_numrecs = (block_size - header_size) / (ALLOC_REC_LEN + ALLOC_PTR_LEN);
    header_size + max_numrecs * ALLOC_REC_LEN
}

/// Recursively collect `(start_block, block_count)` free extents from the
/// BNO tree rooted at AG-relative block `bno_block`.
fn collect_free_extents(
    dev: &dyn ReadAt,
    sb: &Superblock,
    ag_index: u64,
    bno_block: u32,
    out: &mut Vec<(u32, u32)>,
) -> Result<()> {
    let block_size = sb.block_size as usize;
    let offset =
        ag_index * sb.agblocks as u64 * sb.block_size as u64 + bno_block as u64 * sb.block_size as u64;
    let mut block = vec![0u8; block_size];
    let n = read_full_at(dev, &mut block, offset)?;
    if n != block_size {
        return Err(Error::XfsBtreeHeader(format!(
            "short btree block read at {offset} ({n} bytes)"
        )));
    }

    let hdr = parse_btree_header(&block, sb)?;
    let r = BeReader::new(&block);
    let numrecs = hdr.numrecs as usize;

    if hdr.level == 0 {
        if hdr.size + numrecs * ALLOC_REC_LEN > block_size {
            return Err(Error::XfsBtreeHeader(format!(
                "{numrecs} leaf records do not fit a {block_size}-byte block"
            )));
        }
        for i in 0..numrecs {
            let at = hdr.size + i * ALLOC_REC_LEN;
            out.push((r.u32(at), r.u32(at + 4)));
        }
        return Ok(());
    }

    let ptr_offset = btree_ptr_offset(block_size, hdr.size);
    if ptr_offset + numrecs * ALLOC_PTR_LEN > block_size {
        return Err(Error::XfsBtreeHeader(format!(
            "{numrecs} node pointers do not fit a {block_size}-byte block"
        )));
    }
    for i in 0..numrecs {
        let ptr = r.u32(ptr_offset + i * ALLOC_PTR_LEN);
        collect_free_extents(dev, sb, ag_index, ptr, out)?;
    }
    Ok(())
}

/// Extract `(cluster_size, bitmap)` from a device holding an XFS filesystem.
/// The cluster size is the filesystem block size.
pub fn extract(dev: &dyn ReadAt) -> Result<(u32, Vec<u8>)> {
    let mut sb_buf = vec![0u8; 512];
    let n = read_full_at(dev, &mut sb_buf, 0)?;
    if n != sb_buf.len() {
        return Err(Error::XfsSuperblock(format!("short superblock read ({n} bytes)")));
    }
    let sb = Superblock::parse(&sb_buf)?;
    log::debug!(
        "xfs extract: block_size={} dblocks={} agblocks={} agcount={}",
        sb.block_size,
        sb.dblocks,
        sb.agblocks,
        sb.agcount
    );

    let mut bitmap = vec![0u8; ((sb.dblocks + 7) / 8) as usize];
    set_prefix_bits(&mut bitmap, sb.dblocks);

    for ag_index in 0..sb.agcount as u64 {
        // AGF lives in the AG's second sector.
        let ag_offset = ag_index * sb.agblocks as u64 * sb.block_size as u64;
        let mut agf = vec![0u8; sb.sector_size.max(64) as usize];
        let n = read_full_at(dev, &mut agf, ag_offset + sb.sector_size as u64)?;
        if n != agf.len() {
            return Err(Error::XfsSuperblock(format!(
                "short agf read for ag {ag_index} ({n} bytes)"
            )));
        }
        let a = BeReader::new(&agf);
        if a.bytes(0, 4) != AGF_MAGIC {
            return Err(Error::XfsSuperblock(format!(
                "bad agf magic {:02x?} for ag {ag_index}",
                a.bytes(0, 4)
            )));
        }
        let bno_root = a.u32(16);
        let freeblks = a.u32(52) as u64;

        let mut free = Vec::new();
        collect_free_extents(dev, &sb, ag_index, bno_root, &mut free)?;

        let recorded: u64 = free.iter().map(|&(_, count)| count as u64).sum();
        log::debug!("xfs extract: ag {ag_index} free extents={} blocks={recorded}", free.len());
        if recorded != freeblks {
            return Err(Error::XfsFreeMismatch {
                agf: freeblks,
                records: recorded,
            });
        }

        let base = ag_index * sb.agblocks as u64;
        for &(start, count) in &free {
            let end = base + start as u64 + count as u64;
            if end > sb.dblocks {
                return Err(Error::XfsBtreeHeader(format!(
                    "free extent ({start}, {count}) in ag {ag_index} exceeds {} data blocks",
                    sb.dblocks
                )));
            }
            for j in 0..count as u64 {
                set_bit(&mut bitmap, base + start as u64 + j, false);
            }
        }
    }

    Ok((sb.block_size, bitmap))
}
