use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for bitmap extraction, iteration and effective reads.
///
/// Extractor errors are surfaced to `Bitmap::force_extract`, which degrades
/// them to an ineffective bitmap (whole-device read) instead of failing the
/// run. Everything else propagates to the caller or is latched by the reader.
#[derive(Debug, Error)]
pub enum Error {
    #[error("can not detect filesystem from signature")]
    FsDetect,

    #[error("ext parse: {0}")]
    ExtParse(String),
    #[error("ext bitmap reconciliation: {0}")]
    ExtBitmapFix(String),

    #[error("ntfs boot sector: {0}")]
    NtfsBoot(String),
    #[error("ntfs fixup: {0}")]
    NtfsFixup(String),
    #[error("ntfs attribute: {0}")]
    NtfsAttribute(String),
    #[error("ntfs datarun: {0}")]
    NtfsDataRun(String),

    #[error("xfs superblock: {0}")]
    XfsSuperblock(String),
    #[error("xfs btree header: {0}")]
    XfsBtreeHeader(String),
    #[error("xfs btree magic {0:?} is not legal, it must be AB3B or ABTB")]
    XfsBtreeMagic([u8; 4]),
    #[error("xfs free-space mismatch: agf freeblks {agf} but btree records sum to {records}")]
    XfsFreeMismatch { agf: u64, records: u64 },

    #[error("block-size {block_size} can not be larger than device size {device_size}")]
    IterBlockTooLarge { block_size: u64, device_size: u64 },
    #[error("invalid block-size {block_size} for cluster-size {cluster_size}")]
    IterBadMultiple { block_size: u64, cluster_size: u64 },
    #[error("block index {0} overflows the bitmap")]
    IterOverflow(u64),

    #[error("offset {offset} is not aligned to block-size {block_size}")]
    HashAlign { offset: u64, block_size: u64 },
    #[error("hash short read: got {got} bytes but expected {expected}")]
    HashShortRead { got: usize, expected: usize },
    #[error("hash short write: wrote {wrote} bytes but expected {expected}")]
    HashShortWrite { wrote: usize, expected: usize },

    #[error("unsupported block-size {0}, expected cluster-size or 2/4/6/8 MiB")]
    UnsupportedBlockSize(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}
