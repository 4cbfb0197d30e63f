//! Filesystem identification by magic-byte sniffing.

use serde::{Deserialize, Serialize};

use crate::device::{read_full_at, ReadAt};
use crate::error::{Error, Result};

/// Filesystems the extraction engine can produce a bitmap for.
///
/// `Unsupported` covers filesystems whose signature is recognized but whose
/// allocation metadata is not parsed; their bitmaps are ineffective and the
/// whole device is treated as allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemKind {
    Ext,
    Ntfs,
    Xfs,
    Unsupported,
}

impl std::fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilesystemKind::Ext => write!(f, "ext2/3/4"),
            FilesystemKind::Ntfs => write!(f, "ntfs"),
            FilesystemKind::Xfs => write!(f, "xfs"),
            FilesystemKind::Unsupported => write!(f, "raw"),
        }
    }
}

// EXT superblock lives at 1024; s_magic is at superblock offset 56.
const EXT_MAGIC_OFFSET: usize = 1024 + 56;
const EXT_MAGIC: &[u8] = &[0x53, 0xEF];
const NTFS_MAGIC: &[u8] = b"\xEB\x52\x90NTFS";
const XFS_MAGIC: &[u8] = b"XFSB";
const FAT32_MAGIC: &[u8] = b"\xEB\x3C\x90MKDOS";
const BTRFS_MAGIC: &[u8] = &[0x5F, 0xB7, 0xE1, 0x82];
const ZFS_MAGIC: &[u8] = &[0x89, 0xC3, 0xD9, 0xD1, 0xF8, 0xA0, 0xE2, 0xE6];
const JFS_MAGIC: &[u8] = &[0x01, 0xF5, 0xE1, 0xFF];
const APFS_MAGIC: &[u8] = &[0x45, 0xD2, 0xE1, 0xA9, 0xB7, 0xF6, 0xA8, 0xC6];
const ORACLE_ASM_MAGIC: &[u8] = b"ORCLDISK";

/// Identify the filesystem on `dev` from its first 2 KiB.
///
/// The tests run in a fixed order; the first match wins. Signatures without
/// an extractor yield `Unsupported`. No match at all is `FsDetect`.
pub fn detect(dev: &dyn ReadAt) -> Result<FilesystemKind> {
    let mut header = vec![0u8; 2 << 10];
    let n = read_full_at(dev, &mut header, 0)?;
    header.truncate(n);

    let matches_at = |offset: usize, magic: &[u8]| -> bool {
        header.len() >= offset + magic.len() && &header[offset..offset + magic.len()] == magic
    };

    if matches_at(EXT_MAGIC_OFFSET, EXT_MAGIC) {
        return Ok(FilesystemKind::Ext);
    }
    if matches_at(0x20, ORACLE_ASM_MAGIC) {
        return Ok(FilesystemKind::Unsupported);
    }
    if matches_at(80, FAT32_MAGIC) {
        return Ok(FilesystemKind::Unsupported);
    }
    if matches_at(0, XFS_MAGIC) {
        return Ok(FilesystemKind::Xfs);
    }
    if matches_at(0, NTFS_MAGIC) {
        return Ok(FilesystemKind::Ntfs);
    }
    if matches_at(0, BTRFS_MAGIC)
        || matches_at(0, JFS_MAGIC)
        || matches_at(0, APFS_MAGIC)
        || matches_at(0, ZFS_MAGIC)
    {
        return Ok(FilesystemKind::Unsupported);
    }
    Err(Error::FsDetect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image_with(offset: usize, magic: &[u8]) -> NamedTempFile {
        let mut buf = vec![0u8; 4096];
        buf[offset..offset + magic.len()].copy_from_slice(magic);
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(&buf).unwrap();
        tf
    }

    #[test]
    fn detects_ext() {
        let tf = image_with(EXT_MAGIC_OFFSET, EXT_MAGIC);
        let file = tf.reopen().unwrap();
        assert_eq!(detect(&file).unwrap(), FilesystemKind::Ext);
    }

    #[test]
    fn detects_ntfs() {
        let tf = image_with(0, NTFS_MAGIC);
        let file = tf.reopen().unwrap();
        assert_eq!(detect(&file).unwrap(), FilesystemKind::Ntfs);
    }

    #[test]
    fn detects_xfs() {
        let tf = image_with(0, XFS_MAGIC);
        let file = tf.reopen().unwrap();
        assert_eq!(detect(&file).unwrap(), FilesystemKind::Xfs);
    }

    #[test]
    fn recognized_but_unsupported() {
        let tf = image_with(0, BTRFS_MAGIC);
        let file = tf.reopen().unwrap();
        assert_eq!(detect(&file).unwrap(), FilesystemKind::Unsupported);
    }

    #[test]
    fn unknown_signature_fails() {
        let tf = image_with(0, &[0xDE, 0xAD]);
        let file = tf.reopen().unwrap();
        assert!(matches!(detect(&file), Err(Error::FsDetect)));
    }
}
