// vim: tw=80
//! The block storage underneath a VDO

use crate::types::*;
use divbuf::DivBufShared;
use futures::future;
use metrohash::MetroBuildHasher;
#[cfg(test)] use mockall::automock;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Boxed future returned by [`BlockDevice`] operations
pub type BoxDeviceFut<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A device of `BLOCK_SIZE` blocks, addressed by PBN.
#[cfg_attr(test, automock)]
pub trait BlockDevice: Send + Sync {
    /// Number of blocks on the device
    fn size(&self) -> u64;

    /// Read one block
    fn read_block(&self, pbn: Pbn) -> BoxDeviceFut<DivBufShared>;

    /// Write one block.  `buf` must be exactly one block long.
    fn write_block(&self, pbn: Pbn, buf: IoVec) -> BoxDeviceFut<()>;

    /// Ensure that every completed write is durable.
    fn flush(&self) -> BoxDeviceFut<()>;
}

/// A RAM-backed [`BlockDevice`] with optional fault injection.
///
/// Blocks never written read back as zeros.
#[derive(Debug)]
pub struct MemoryDevice {
    blocks: Mutex<HashMap<Pbn, Box<[u8]>, MetroBuildHasher>>,
    size: u64,
    /// Blocks whose reads will fail with `Io`
    bad_blocks: Mutex<HashSet<Pbn>>,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryDevice {
    pub fn new(size: u64) -> Self {
        MemoryDevice {
            blocks: Mutex::new(HashMap::with_hasher(Default::default())),
            size,
            bad_blocks: Mutex::default(),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Make every future read of `pbn` fail.
    pub fn fail_reads_of(&self, pbn: Pbn) {
        if let Ok(mut bad) = self.bad_blocks.lock() {
            bad.insert(pbn);
        }
    }

    /// Make every future write fail, or stop doing so.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Synchronously peek at a block's contents
    pub fn peek(&self, pbn: Pbn) -> Option<Vec<u8>> {
        self.blocks.lock().ok()?.get(&pbn).map(|b| b.to_vec())
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn do_read(&self, pbn: Pbn) -> Result<DivBufShared> {
        if pbn >= self.size {
            return Err(Error::Io);
        }
        if self.bad_blocks.lock().map_err(|_| Error::Io)?.contains(&pbn) {
            return Err(Error::Io);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let blocks = self.blocks.lock().map_err(|_| Error::Io)?;
        let v = blocks.get(&pbn)
            .map(|b| b.to_vec())
            .unwrap_or_else(|| vec![0u8; BLOCK_SIZE]);
        Ok(DivBufShared::from(v))
    }

    fn do_write(&self, pbn: Pbn, buf: IoVec) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::InvalidArgument);
        }
        if pbn >= self.size || self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::Io);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut blocks = self.blocks.lock().map_err(|_| Error::Io)?;
        blocks.insert(pbn, Box::from(&buf[..]));
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_block(&self, pbn: Pbn) -> BoxDeviceFut<DivBufShared> {
        Box::pin(future::ready(self.do_read(pbn)))
    }

    fn write_block(&self, pbn: Pbn, buf: IoVec) -> BoxDeviceFut<()> {
        Box::pin(future::ready(self.do_write(pbn, buf)))
    }

    fn flush(&self) -> BoxDeviceFut<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Box::pin(future::ready(Ok(())))
    }
}

// LCOV_EXCL_STOP
