//! Reference consumer: mirror the effective blocks of a source device onto
//! a destination device or image file.
//!
//! This is the minimum useful downstream of the effective reader — real
//! consumers substitute upload, encryption or archive formats for the write
//! pool, but the drain/join/error-surfacing shape stays the same.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};

use crate::config::ReaderOptions;
use crate::device::{write_full_at, ReadAt, WriteAt};
use crate::reader::{CancelToken, EffectiveData, EffectiveDataReader};

/// Copy every effective block of `source` to `dest`, returning the bytes
/// copied. Optional hash sidecars enable incremental runs: with a
/// `refer_hash` from a previous run, unchanged blocks are neither emitted
/// nor written.
pub fn copy_effective(
    cancel: CancelToken,
    source: &Path,
    dest: &Path,
    refer_hash: Option<&Path>,
    current_hash: Option<&Path>,
    opts: &ReaderOptions,
    write_concurrency: usize,
) -> Result<u64> {
    let refer: Option<Box<dyn ReadAt>> = match refer_hash {
        Some(path) => Some(Box::new(
            File::open(path).context("Failed to open reference hash sidecar")?,
        )),
        None => None,
    };
    let current: Option<Box<dyn WriteAt>> = match current_hash {
        Some(path) => Some(Box::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .context("Failed to create current hash sidecar")?,
        )),
        None => None,
    };
    let dest_file = Arc::new(
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(dest)
            .context("Failed to open destination")?,
    );

    let mut reader = EffectiveDataReader::open(cancel, source, refer, current, opts)
        .context("Failed to start effective reader")?;

    let writers = write_concurrency.max(1);
    let (tx, rx) = sync_channel::<EffectiveData>(writers);
    let rx = Arc::new(Mutex::new(rx));
    let write_error: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));

    let mut pool = Vec::with_capacity(writers);
    for worker_id in 0..writers {
        let rx = rx.clone();
        let dest_file = dest_file.clone();
        let write_error = write_error.clone();
        let handle = thread::Builder::new()
            .name(format!("skim-write-{worker_id}"))
            .spawn(move || loop {
                let ed = { rx.lock().unwrap().recv() };
                let ed = match ed {
                    Ok(ed) => ed,
                    Err(_) => break,
                };
                if let Err(e) = write_full_at(dest_file.as_ref(), &ed.bytes, ed.offset) {
                    log::warn!("copy_effective: write at {} failed: {e}", ed.offset);
                    let mut slot = write_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            })
            .context("Failed to spawn write worker")?;
        pool.push(handle);
    }

    let mut copied = 0u64;
    for ed in reader.blocks().iter() {
        copied += ed.length as u64;
        if tx.send(ed).is_err() {
            break;
        }
    }
    drop(tx);
    for handle in pool {
        let _ = handle.join();
    }

    if let Some(e) = reader.error() {
        bail!("effective read failed: {e}");
    }
    if let Some(e) = write_error.lock().unwrap().take() {
        return Err(e).context("destination write failed");
    }
    log::debug!(
        "copy_effective: signature={} effective={} incremental={}",
        reader.fs_hash_signature(),
        reader.effective_block_count(),
        reader.incremental_effective_block_count()
    );
    reader.release();
    Ok(copied)
}
