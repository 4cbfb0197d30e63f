//! The reference consumer: mirror effective blocks to a destination file,
//! then prove the second, sidecar-gated run has nothing left to copy.

use std::fs;
use std::io::Write;

use tempfile::{tempdir, NamedTempFile};

use skimfs::{copy_effective, BlockSize, CancelToken, ReaderOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ext_image() -> Vec<u8> {
    let mut img = vec![0u8; 10 << 20];
    img[1024 + 0x38..1024 + 0x3A].copy_from_slice(&[0x53, 0xEF]);
    img[1024 + 0x18] = 2;
    img[1024 + 0x04..1024 + 0x08].copy_from_slice(&2560u32.to_le_bytes());
    img[1024 + 0x20..1024 + 0x24].copy_from_slice(&8192u32.to_le_bytes());
    img[4096..4100].copy_from_slice(&2u32.to_le_bytes());
    img[8192] = 0xF8;
    img[3 * 4096..4 * 4096].fill(0x33);
    img[4 * 4096..5 * 4096].fill(0x44);
    img
}

#[test]
fn full_then_incremental_copy() {
    init_logging();
    let td = tempdir().unwrap();
    let mut source = NamedTempFile::new().unwrap();
    let img = ext_image();
    source.write_all(&img).unwrap();

    let dest = td.path().join("mirror.img");
    let h1 = td.path().join("run1.hash");
    let opts = ReaderOptions {
        block_size: BlockSize::Cluster,
        read_concurrency: 4,
    };

    let copied = copy_effective(
        CancelToken::new(),
        source.path(),
        &dest,
        None,
        Some(&h1),
        &opts,
        2,
    )
    .unwrap();
    assert_eq!(copied, 5 * 4096);

    let mirrored = fs::read(&dest).unwrap();
    assert_eq!(&mirrored[..5 * 4096], &img[..5 * 4096]);

    // Second run gated by the sidecar: the source is unchanged.
    let dest2 = td.path().join("mirror2.img");
    let copied = copy_effective(
        CancelToken::new(),
        source.path(),
        &dest2,
        Some(&h1),
        None,
        &opts,
        2,
    )
    .unwrap();
    assert_eq!(copied, 0);
}
