//! Positional device I/O.
//!
//! Sources, destinations and hash sidecars are all plain positional-I/O
//! handles. `read_at`/`write_at` must be safe under concurrent calls from
//! the worker pool, which `File` satisfies through pread/pwrite; anything
//! with a shared seek cursor has to be wrapped before it comes in here.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

/// Random-access readable handle.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Random-access writable handle.
pub trait WriteAt: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl WriteAt for File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(self, buf, offset)
    }
}

/// In-memory source, for synthetic images and tests.
impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Read until `buf` is full or the source ends, returning the bytes read.
///
/// A return of 0 means the offset is at or past the end of the source; a
/// short count means the source ended inside the requested range. Neither
/// is an error here — the last bitmap byte routinely over-runs the device.
pub fn read_full_at(src: &dyn ReadAt, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match src.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `buf` at `offset`.
pub fn write_full_at(dst: &dyn WriteAt, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        match dst.write_at(&buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_at returned 0 bytes",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Byte length of a source path.
///
/// Block devices report 0 through `metadata()`, so they are sized with the
/// BLKGETSIZE64 ioctl; regular files (and loop images) use the metadata
/// length.
pub fn query_size(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if meta.file_type().is_block_device() {
        let file = File::open(path)?;
        return block_device_size(&file);
    }
    Ok(meta.len())
}

fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_full_at_stops_at_eof() -> io::Result<()> {
        let mut tf = NamedTempFile::new()?;
        tf.write_all(&[0xAAu8; 100])?;
        let file = tf.reopen()?;

        let mut buf = vec![0u8; 64];
        assert_eq!(read_full_at(&file, &mut buf, 0)?, 64);
        assert_eq!(read_full_at(&file, &mut buf, 60)?, 40);
        assert_eq!(read_full_at(&file, &mut buf, 100)?, 0);
        assert_eq!(read_full_at(&file, &mut buf, 5000)?, 0);
        Ok(())
    }

    #[test]
    fn write_then_read_roundtrip() -> io::Result<()> {
        let tf = NamedTempFile::new()?;
        let file = tf.as_file();
        write_full_at(file, b"skim", 10)?;

        let mut buf = vec![0u8; 4];
        assert_eq!(read_full_at(file, &mut buf, 10)?, 4);
        assert_eq!(&buf, b"skim");
        Ok(())
    }

    #[test]
    fn query_size_of_regular_file() -> io::Result<()> {
        let mut tf = NamedTempFile::new()?;
        tf.write_all(&[0u8; 4096])?;
        assert_eq!(query_size(tf.path())?, 4096);
        Ok(())
    }
}
