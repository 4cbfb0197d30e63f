//! Reader configuration surface.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Hard ceiling on parallel read tasks.
pub const MAX_READ_CONCURRENCY: usize = 128;

/// 2 MiB.
pub const MIB2: u64 = 2 << 20;

/// Requested I/O granularity for iteration and reads.
///
/// `Cluster` resolves to the filesystem cluster size (or a 2 KiB default
/// when the bitmap is ineffective). The iterator accepts any `Bytes` value
/// that is a positive multiple of the cluster size; the reader additionally
/// restricts `Bytes` to 2, 4, 6 or 8 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSize {
    Cluster,
    Bytes(u64),
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::Cluster
    }
}

/// Options accepted by `EffectiveDataReader`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderOptions {
    #[serde(default)]
    pub block_size: BlockSize,
    /// Parallel read tasks. Zero and anything over the ceiling resolve to
    /// the ceiling.
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

fn default_read_concurrency() -> usize {
    MAX_READ_CONCURRENCY
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            block_size: BlockSize::default(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

impl ReaderOptions {
    pub fn resolved_concurrency(&self) -> usize {
        if self.read_concurrency == 0 || self.read_concurrency > MAX_READ_CONCURRENCY {
            MAX_READ_CONCURRENCY
        } else {
            self.read_concurrency
        }
    }

    /// The reader's block-size whitelist.
    pub fn validate_block_size(block_size: BlockSize) -> crate::error::Result<()> {
        match block_size {
            BlockSize::Cluster => Ok(()),
            BlockSize::Bytes(b) if b % MIB2 == 0 && (1..=4).contains(&(b / MIB2)) => Ok(()),
            BlockSize::Bytes(b) => Err(Error::UnsupportedBlockSize(b)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context("Failed to read reader options")?;
        serde_json::from_str(&contents).context("Failed to parse reader options")
    }

    /// Atomic persist: write to a temp file, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize reader options")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents).context("Failed to write reader options")?;
        fs::rename(&temp_path, path).context("Failed to commit reader options")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn concurrency_clamps() {
        let mut opts = ReaderOptions::default();
        assert_eq!(opts.resolved_concurrency(), 128);
        opts.read_concurrency = 0;
        assert_eq!(opts.resolved_concurrency(), 128);
        opts.read_concurrency = 4;
        assert_eq!(opts.resolved_concurrency(), 4);
        opts.read_concurrency = 1000;
        assert_eq!(opts.resolved_concurrency(), 128);
    }

    #[test]
    fn block_size_whitelist() {
        assert!(ReaderOptions::validate_block_size(BlockSize::Cluster).is_ok());
        for m in [2u64, 4, 6, 8] {
            assert!(ReaderOptions::validate_block_size(BlockSize::Bytes(m << 20)).is_ok());
        }
        assert!(ReaderOptions::validate_block_size(BlockSize::Bytes(1 << 20)).is_err());
        assert!(ReaderOptions::validate_block_size(BlockSize::Bytes(4096)).is_err());
        assert!(ReaderOptions::validate_block_size(BlockSize::Bytes(10 << 20)).is_err());
    }

    #[test]
    fn options_roundtrip_through_json() {
        let td = tempdir().unwrap();
        let path = td.path().join("options.json");
        let opts = ReaderOptions {
            block_size: BlockSize::Bytes(4 << 20),
            read_concurrency: 16,
        };
        opts.save(&path).unwrap();
        let re = ReaderOptions::load(&path).unwrap();
        assert_eq!(re.block_size, opts.block_size);
        assert_eq!(re.read_concurrency, 16);
    }
}
