//! Concurrent effective-data reader.
//!
//! A single driver thread walks the bitmap iterator and feeds block spans
//! into a bounded work queue; a pool of identical workers drains it, reads
//! the allocated blocks from the device, optionally diffs them against a
//! reference hash sidecar, and delivers them on a bounded data channel in
//! unspecified order. The first error any thread observes is latched and
//! stops further scheduling; blocks already produced may still drain.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::bitmap::Bitmap;
use crate::config::ReaderOptions;
use crate::detect::FilesystemKind;
use crate::device::{read_full_at, ReadAt, WriteAt};
use crate::error::{Error, Result};
use crate::hash;
use crate::iter::{BitmapIterator, BlockSpan};

/// Cooperative cancellation flag shared between the caller and the reader.
/// Cancellation is checked at scheduling points; an in-flight device read
/// is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One produced block of live data.
#[derive(Debug, Clone)]
pub struct EffectiveData {
    pub offset: u64,
    /// Bytes actually read; less than the block size at device end.
    pub length: usize,
    pub bytes: Vec<u8>,
    pub bit_start: u64,
    pub bit_end: u64,
    pub first_nonzero_bit: u64,
}

struct Shared {
    iter: Arc<BitmapIterator>,
    source: Box<dyn ReadAt>,
    refer_hash: Option<Box<dyn ReadAt>>,
    current_hash: Option<Box<dyn WriteAt>>,
    block_size: u64,
    effective_blocks: AtomicU64,
    incr_effective_blocks: AtomicU64,
    /// First non-EOF error observed anywhere; never overwritten.
    error: Mutex<Option<Arc<Error>>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("iter", &self.iter)
            .field("block_size", &self.block_size)
            .field("effective_blocks", &self.effective_blocks)
            .field("incr_effective_blocks", &self.incr_effective_blocks)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Shared {
    fn latch_error(&self, e: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_some() {
            log::warn!("effective reader: discarding later error: {e}");
            return;
        }
        *slot = Some(Arc::new(e));
    }

    fn errored(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    fn process(&self, span: BlockSpan, out: &SyncSender<EffectiveData>) {
        if self.cancel.is_cancelled() || self.errored() {
            return;
        }
        let addr = match self.iter.lookup(span.block_index, span.bit_start, span.bit_end) {
            Ok(addr) => addr,
            Err(e) => {
                self.latch_error(e);
                return;
            }
        };
        if !addr.allocated {
            return;
        }
        self.effective_blocks.fetch_add(1, Ordering::SeqCst);

        let mut buf = vec![0u8; addr.block_byte_size as usize];
        let n = match read_full_at(self.source.as_ref(), &mut buf, addr.block_byte_offset) {
            Ok(n) => n,
            Err(e) => {
                self.latch_error(Error::Io(e));
                return;
            }
        };
        if n == 0 {
            // The bitmap's trailing bits routinely over-run the real device;
            // an empty read there is not data and not an error.
            log::debug!(
                "effective reader: zero-length read at offset {} (block {})",
                addr.block_byte_offset,
                addr.block_index
            );
            return;
        }
        if self.errored() {
            return;
        }

        if self.refer_hash.is_some() || self.current_hash.is_some() {
            let hash_offset = match hash::hash_offset(addr.block_byte_offset, self.block_size) {
                Ok(off) => off,
                Err(e) => {
                    self.latch_error(e);
                    return;
                }
            };
            let cur = hash::block_hash(&buf[..n]);
            let changed = match &self.refer_hash {
                None => true,
                Some(refer) => match hash::read_hash(refer.as_ref(), hash_offset) {
                    Ok(prev) => prev != cur,
                    Err(e) => {
                        self.latch_error(e);
                        return;
                    }
                },
            };
            if let Some(current) = &self.current_hash {
                if let Err(e) = hash::write_hash(current.as_ref(), hash_offset, cur) {
                    self.latch_error(e);
                    return;
                }
            }
            if !changed {
                return;
            }
        }

        self.incr_effective_blocks.fetch_add(1, Ordering::SeqCst);
        buf.truncate(n);
        // Send failure means the receiver is gone (release in progress);
        // the block is dropped with it.
        let _ = out.send(EffectiveData {
            offset: addr.block_byte_offset,
            length: n,
            bytes: buf,
            bit_start: addr.bit_start,
            bit_end: addr.bit_end,
            first_nonzero_bit: addr.first_nonzero_bit,
        });
    }
}

/// Streams the allocated (and, with a reference sidecar, changed) blocks of
/// a filesystem to a consumer through `blocks()`.
#[derive(Debug)]
pub struct EffectiveDataReader {
    shared: Arc<Shared>,
    data_rx: Receiver<EffectiveData>,
    driver: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl EffectiveDataReader {
    /// Detect, extract and start reading the filesystem at `device_path`.
    pub fn open(
        cancel: CancelToken,
        device_path: &Path,
        refer_hash: Option<Box<dyn ReadAt>>,
        current_hash: Option<Box<dyn WriteAt>>,
        opts: &ReaderOptions,
    ) -> Result<Self> {
        ReaderOptions::validate_block_size(opts.block_size)?;
        let bitmap = Bitmap::force_extract(device_path)?;
        let iterator = BitmapIterator::new(bitmap, opts.block_size)?;
        let source: Box<dyn ReadAt> = Box::new(File::open(device_path)?);
        Self::start(cancel, source, iterator, refer_hash, current_hash, opts.resolved_concurrency())
    }

    /// Start reading from a caller-supplied stream and iterator. The bitmap
    /// behind the iterator may be synthetic; its block-size request must
    /// still be one the reader accepts.
    pub fn with_stream(
        cancel: CancelToken,
        source: Box<dyn ReadAt>,
        iterator: BitmapIterator,
        refer_hash: Option<Box<dyn ReadAt>>,
        current_hash: Option<Box<dyn WriteAt>>,
        opts: &ReaderOptions,
    ) -> Result<Self> {
        ReaderOptions::validate_block_size(iterator.requested_block_size())?;
        Self::start(cancel, source, iterator, refer_hash, current_hash, opts.resolved_concurrency())
    }

    fn start(
        cancel: CancelToken,
        source: Box<dyn ReadAt>,
        iterator: BitmapIterator,
        refer_hash: Option<Box<dyn ReadAt>>,
        current_hash: Option<Box<dyn WriteAt>>,
        concurrency: usize,
    ) -> Result<Self> {
        let iter = Arc::new(iterator);
        log::debug!(
            "effective reader: fs={} effective={} block_size={} max_bit={} max_block={} workers={concurrency}",
            iter.fs_kind(),
            iter.bitmap().effective(),
            iter.block_size(),
            iter.max_bit(),
            iter.max_block(),
        );

        let shared = Arc::new(Shared {
            block_size: iter.block_size(),
            iter: iter.clone(),
            source,
            refer_hash,
            current_hash,
            effective_blocks: AtomicU64::new(0),
            incr_effective_blocks: AtomicU64::new(0),
            error: Mutex::new(None),
            cancel,
        });

        let (work_tx, work_rx) = sync_channel::<BlockSpan>(concurrency);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (data_tx, data_rx) = sync_channel::<EffectiveData>(concurrency);

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let shared = shared.clone();
            let work_rx = work_rx.clone();
            let data_tx = data_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("skim-read-{worker_id}"))
                .spawn(move || {
                    loop {
                        let span = { work_rx.lock().unwrap().recv() };
                        match span {
                            Ok(span) => shared.process(span, &data_tx),
                            Err(_) => break,
                        }
                    }
                })
                .map_err(Error::Io)?;
            workers.push(handle);
        }
        // The data channel closes when the last worker drops its sender.
        drop(data_tx);

        let driver_shared = shared.clone();
        let driver = thread::Builder::new()
            .name("skim-drive".into())
            .spawn(move || {
                while let Some(span) = driver_shared.iter.next() {
                    if driver_shared.cancel.is_cancelled() {
                        driver_shared.latch_error(Error::Cancelled);
                        break;
                    }
                    if driver_shared.errored() {
                        break;
                    }
                    if work_tx.send(span).is_err() {
                        break;
                    }
                }
                // Dropping the sender closes the work queue; workers finish
                // what they hold and exit.
            })
            .map_err(Error::Io)?;

        Ok(EffectiveDataReader {
            shared,
            data_rx,
            driver: Some(driver),
            workers,
        })
    }

    /// The bounded channel of produced blocks, in unspecified order. Closed
    /// exactly once, when production has completed for any reason.
    pub fn blocks(&self) -> &Receiver<EffectiveData> {
        &self.data_rx
    }

    /// Blocks found allocated so far. Final only after the channel closes.
    pub fn effective_block_count(&self) -> u64 {
        self.shared.effective_blocks.load(Ordering::SeqCst)
    }

    /// Allocated blocks that also passed the incremental filter.
    pub fn incremental_effective_block_count(&self) -> u64 {
        self.shared.incr_effective_blocks.load(Ordering::SeqCst)
    }

    /// First non-EOF error observed by any thread. Stable once the channel
    /// has closed.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared.error.lock().unwrap().clone()
    }

    pub fn filesystem_kind(&self) -> FilesystemKind {
        self.shared.iter.fs_kind()
    }

    pub fn fs_hash_signature(&self) -> String {
        self.shared.iter.fs_signature().to_string()
    }

    pub fn iterator(&self) -> &BitmapIterator {
        &self.shared.iter
    }

    /// Drain any buffered blocks and wait for all threads to quiesce.
    /// Idempotent; also runs on drop, so every exit path shuts down the
    /// pool, closes the channel and releases the source handle.
    pub fn release(&mut self) {
        while self.data_rx.recv().is_ok() {}
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for EffectiveDataReader {
    fn drop(&mut self) {
        self.release();
    }
}
