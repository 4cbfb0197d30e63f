//! End-to-end: extract a minimal EXT image and stream its allocated blocks.

use std::io::Write;

use tempfile::NamedTempFile;

use skimfs::{BlockSize, CancelToken, EffectiveDataReader, FilesystemKind, ReaderOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 10 MiB device holding a single-group EXT filesystem with 4096-byte
/// blocks. Blocks 0..5 are allocated: superblock, GDT, the bitmap block
/// itself and two patterned data blocks.
fn ext_image() -> Vec<u8> {
    let mut img = vec![0u8; 10 << 20];
    // Superblock at 1024: magic, 2^(10+2)-byte blocks, 2560 blocks total.
    img[1024 + 0x38..1024 + 0x3A].copy_from_slice(&[0x53, 0xEF]);
    img[1024 + 0x18] = 2;
    img[1024 + 0x04..1024 + 0x08].copy_from_slice(&2560u32.to_le_bytes());
    img[1024 + 0x20..1024 + 0x24].copy_from_slice(&8192u32.to_le_bytes());
    // Group descriptor 0: data bitmap lives in block 2.
    img[4096..4100].copy_from_slice(&2u32.to_le_bytes());
    // Data bitmap: first five blocks allocated.
    img[8192] = 0xF8;
    // Data blocks 3 and 4.
    img[3 * 4096..4 * 4096].fill(0x33);
    img[4 * 4096..5 * 4096].fill(0x44);
    img
}

fn write_image(img: &[u8]) -> NamedTempFile {
    let mut tf = NamedTempFile::new().unwrap();
    tf.write_all(img).unwrap();
    tf.flush().unwrap();
    tf
}

#[test]
fn ext_minimal_emits_exactly_the_allocated_blocks() {
    init_logging();
    let img = ext_image();
    let tf = write_image(&img);

    let opts = ReaderOptions {
        block_size: BlockSize::Cluster,
        read_concurrency: 4,
    };
    let mut reader =
        EffectiveDataReader::open(CancelToken::new(), tf.path(), None, None, &opts).unwrap();
    assert_eq!(reader.filesystem_kind(), FilesystemKind::Ext);

    let mut blocks: Vec<_> = reader.blocks().iter().collect();
    blocks.sort_by_key(|ed| ed.offset);

    let offsets: Vec<u64> = blocks.iter().map(|ed| ed.offset).collect();
    assert_eq!(offsets, vec![0, 4096, 8192, 12288, 16384]);
    for ed in &blocks {
        assert_eq!(ed.length, 4096);
        assert_eq!(
            &ed.bytes[..],
            &img[ed.offset as usize..ed.offset as usize + 4096]
        );
        // One cluster per block at this granularity.
        assert_eq!(ed.bit_end, ed.bit_start + 1);
        assert_eq!(ed.first_nonzero_bit, ed.bit_start);
    }
    assert!(blocks[3].bytes.iter().all(|&b| b == 0x33));
    assert!(blocks[4].bytes.iter().all(|&b| b == 0x44));

    assert_eq!(reader.effective_block_count(), 5);
    assert_eq!(reader.incremental_effective_block_count(), 5);
    assert!(reader.error().is_none());
    reader.release();
}

#[test]
fn block_indexes_are_emitted_at_most_once() {
    init_logging();
    let tf = write_image(&ext_image());

    let opts = ReaderOptions {
        block_size: BlockSize::Cluster,
        read_concurrency: 8,
    };
    let reader =
        EffectiveDataReader::open(CancelToken::new(), tf.path(), None, None, &opts).unwrap();

    let mut offsets: Vec<u64> = reader.blocks().iter().map(|ed| ed.offset).collect();
    let total = offsets.len();
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), total, "duplicate block emission");
}
