//! Cluster-allocation bitmap container and extraction dispatch.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::detect::{detect, FilesystemKind};
use crate::device::{query_size, ReadAt};
use crate::error::Result;
use crate::{ext, ntfs, xfs};

/// One bit per filesystem cluster, MSB-first within each byte, bit `k` for
/// cluster `k`. Immutable once constructed.
///
/// An *ineffective* bitmap (`cluster_size_bytes == 0`, empty `bits`) means
/// extraction was unsupported or failed; iteration then treats the whole
/// device as allocated.
#[derive(Debug, Clone)]
pub struct Bitmap {
    pub device_path: PathBuf,
    pub fs_kind: FilesystemKind,
    /// Length of the underlying device. May exceed the filesystem's declared
    /// size — a large block device can carry a small filesystem.
    pub device_size_bytes: u64,
    pub cluster_size_bytes: u32,
    pub bits: Vec<u8>,
}

impl Bitmap {
    /// Detect the filesystem on `path` and extract its allocation bitmap.
    ///
    /// Extractor failures degrade to an ineffective bitmap with a warning:
    /// a backup that reads everything beats a backup that reads nothing.
    /// Detection failures and I/O errors still propagate.
    pub fn force_extract(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let device_size = query_size(path)?;
        let fs_kind = detect(&file)?;
        log::debug!("force_extract: {} is {fs_kind}, {device_size} bytes", path.display());
        Ok(Self::force_extract_from(
            &file,
            path.to_path_buf(),
            fs_kind,
            device_size,
        ))
    }

    /// Extraction against a caller-supplied stream and pre-detected kind.
    pub fn force_extract_from(
        dev: &dyn ReadAt,
        device_path: PathBuf,
        fs_kind: FilesystemKind,
        device_size_bytes: u64,
    ) -> Self {
        let extracted = match fs_kind {
            FilesystemKind::Ext => ext::extract(dev),
            FilesystemKind::Ntfs => ntfs::extract(dev),
            FilesystemKind::Xfs => xfs::extract(dev),
            FilesystemKind::Unsupported => Ok((0, Vec::new())),
        };
        let (cluster_size_bytes, bits) = match extracted {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "force_extract: {} extraction failed, falling back to whole-device read: {e}",
                    device_path.display()
                );
                (0, Vec::new())
            }
        };
        log::debug!(
            "force_extract: {} bitmap is {} bytes",
            device_path.display(),
            bits.len()
        );
        Bitmap {
            device_path,
            fs_kind,
            device_size_bytes,
            cluster_size_bytes,
            bits,
        }
    }

    /// An ineffective bitmap: iteration treats every block as allocated.
    pub fn ineffective(device_path: PathBuf, fs_kind: FilesystemKind, device_size_bytes: u64) -> Self {
        Bitmap {
            device_path,
            fs_kind,
            device_size_bytes,
            cluster_size_bytes: 0,
            bits: Vec::new(),
        }
    }

    pub fn effective(&self) -> bool {
        debug_assert_eq!(self.cluster_size_bytes == 0, self.bits.is_empty());
        !self.bits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::test_bit;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Single-group EXT image, 4096-byte blocks, first five blocks allocated.
    fn ext_image() -> Vec<u8> {
        let mut img = vec![0u8; 10 << 20];
        img[1024 + 0x38..1024 + 0x3A].copy_from_slice(&[0x53, 0xEF]);
        img[1024 + 0x18] = 2;
        img[1024 + 0x04..1024 + 0x08].copy_from_slice(&2560u32.to_le_bytes());
        img[1024 + 0x20..1024 + 0x24].copy_from_slice(&8192u32.to_le_bytes());
        img[4096..4100].copy_from_slice(&2u32.to_le_bytes());
        img[8192] = 0xF8;
        img
    }

    #[test]
    fn extracts_ext_image_from_path() {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(&ext_image()).unwrap();

        let bitmap = Bitmap::force_extract(tf.path()).unwrap();
        assert_eq!(bitmap.fs_kind, FilesystemKind::Ext);
        assert_eq!(bitmap.device_size_bytes, 10 << 20);
        assert_eq!(bitmap.cluster_size_bytes, 4096);
        assert!(bitmap.effective());
        for k in 0..5 {
            assert!(test_bit(&bitmap.bits, k));
        }
        assert!(!test_bit(&bitmap.bits, 5));
    }

    #[test]
    fn corrupt_extraction_degrades_to_ineffective() {
        // EXT magic present but a zeroed superblock: the extractor fails and
        // the bitmap falls back to whole-device semantics.
        let mut img = vec![0u8; 64 << 10];
        img[1024 + 0x38..1024 + 0x3A].copy_from_slice(&[0x53, 0xEF]);
        let bitmap = Bitmap::force_extract_from(
            &img,
            PathBuf::from("synthetic"),
            FilesystemKind::Ext,
            64 << 10,
        );
        assert!(!bitmap.effective());
        assert_eq!(bitmap.cluster_size_bytes, 0);
    }

    #[test]
    fn unknown_filesystem_fails_detection() {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(&vec![0u8; 4096]).unwrap();
        assert!(Bitmap::force_extract(tf.path()).is_err());
    }
}
