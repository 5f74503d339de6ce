// vim: tw=80
//! Functional tests drive a whole VDO, zones and all, through its public
//! interface.

use std::{sync::Arc, time::Duration};

use divbuf::{DivBuf, DivBufShared};
use rand::{Rng, RngCore};

use vdo_core::{
    BlockDevice,
    DedupeIndex,
    MemoryDevice,
    MemoryIndex,
    Vdo,
    VdoConfig,
    VdoStatistics,
    BLOCK_SIZE,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

mod compression;
mod concurrency;
mod dedupe;
mod discard;
mod flush;
mod read_only;
mod write;

/// Helper to create a fresh VDO on RAM
#[derive(Debug)]
struct VdoBuilder {
    config: VdoConfig,
}

impl VdoBuilder {
    fn new() -> Self {
        let config = VdoConfig {
            logical_blocks: 1 << 16,
            physical_blocks: 1 << 10,
            slab_blocks: 1 << 7,
            pool_size: 64,
            index_capacity: 1 << 10,
            .. Default::default()
        };
        VdoBuilder { config }
    }

    /// Start a VDO with its own RAM device and index
    fn build(&self) -> Harness {
        let device = Arc::new(MemoryDevice::new(self.config.physical_blocks));
        let index = Arc::new(MemoryIndex::with_capacity(
                self.config.index_capacity));
        self.build_with(device, index)
    }

    fn build_with(&self, device: Arc<MemoryDevice>,
                  index: Arc<dyn DedupeIndex>) -> Harness
    {
        let dev: Arc<dyn BlockDevice> = device.clone();
        let vdo = t!(Vdo::create(self.config.clone(), dev, index));
        Harness { vdo, device }
    }

    fn compression(&mut self, enable: bool) -> &mut Self {
        self.config.compression = enable;
        self
    }

    fn deduplication(&mut self, enable: bool) -> &mut Self {
        self.config.deduplication = enable;
        self
    }

    fn journal_entries_per_block(&mut self, entries: usize) -> &mut Self {
        self.config.journal_entries_per_block = entries;
        self
    }

    fn physical_blocks(&mut self, blocks: u64) -> &mut Self {
        self.config.physical_blocks = blocks;
        self
    }

    fn pool_size(&mut self, size: usize) -> &mut Self {
        self.config.pool_size = size;
        self.config.discard_limit = None;
        self
    }

    fn slab_blocks(&mut self, blocks: u64) -> &mut Self {
        self.config.slab_blocks = blocks;
        self
    }

    fn zones(&mut self, logical: usize, physical: usize, hash: usize)
        -> &mut Self
    {
        self.config.logical_zones = logical;
        self.config.physical_zones = physical;
        self.config.hash_zones = hash;
        self
    }
}

struct Harness {
    vdo: Vdo,
    device: Arc<MemoryDevice>,
}

impl Harness {
    /// Wait for everything in flight, and check that nothing leaked
    async fn quiesce(&self) -> VdoStatistics {
        self.vdo.drain().await;
        assert_eq!(t!(self.vdo.census().await), 0,
                   "locks or requests remain after draining");
        self.vdo.statistics()
    }

    async fn read(&self, lbn: u64) -> Vec<u8> {
        let dbs = t!(self.vdo.read(lbn).await);
        let db = dbs.try_const().unwrap();
        db[..].to_vec()
    }
}

/// A block filled with one byte
fn block(fill: u8) -> DivBuf {
    DivBufShared::from(vec![fill; BLOCK_SIZE]).try_const().unwrap()
}

fn buf(data: Vec<u8>) -> DivBuf {
    DivBufShared::from(data).try_const().unwrap()
}

/// A block which lz4 can't shrink, different for every seed
fn random_block<R: RngCore>(rng: &mut R) -> Vec<u8> {
    let mut v = vec![0u8; BLOCK_SIZE];
    rng.fill(&mut v[..]);
    v
}

/// A very compressible block which differs for every `n`
fn compressible_block(n: u32) -> Vec<u8> {
    let mut v = vec![0u8; BLOCK_SIZE];
    v[..4].copy_from_slice(&n.to_le_bytes());
    v[4] = 0xff;
    v
}

/// Poll the statistics until `f` holds.  The pipeline keeps working after
/// writes are acknowledged, so some effects can only be waited for.
async fn wait_for<F>(vdo: &Vdo, f: F)
    where F: Fn(&VdoStatistics) -> bool
{
    for _ in 0..1000 {
        if f(&vdo.statistics()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Timed out; statistics are {:?}", vdo.statistics());
}
