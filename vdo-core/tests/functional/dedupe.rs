// vim: tw=80
//! Deduplication, through the index and between concurrent writes
use futures::future;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use std::collections::BTreeSet;
use vdo_core::{
    BoxIndexFut,
    DataLocation,
    Error,
    JournalOperation,
    MappingState,
    RecordName,
};

use super::*;

/// Gives the same advice for every query
struct StaleIndex(DataLocation);

impl DedupeIndex for StaleIndex {
    fn query(&self, _name: &RecordName)
        -> BoxIndexFut<Option<DataLocation>>
    {
        Box::pin(future::ok(Some(self.0)))
    }

    fn update(&self, _name: &RecordName, _location: DataLocation)
        -> BoxIndexFut<()>
    {
        Box::pin(future::ok(()))
    }
}

/// Fails every operation
struct BrokenIndex;

impl DedupeIndex for BrokenIndex {
    fn query(&self, _name: &RecordName)
        -> BoxIndexFut<Option<DataLocation>>
    {
        Box::pin(future::err(Error::Io))
    }

    fn update(&self, _name: &RecordName, _location: DataLocation)
        -> BoxIndexFut<()>
    {
        Box::pin(future::err(Error::Io))
    }
}

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().build()
}

/// A second copy of some data shares the first copy's block
#[rstest]
#[tokio::test]
async fn sequential(harness: Harness) {
    t!(harness.vdo.write(10, block(0xaa)).await);
    harness.quiesce().await;
    t!(harness.vdo.write(20, block(0xaa)).await);
    let stats = harness.quiesce().await;

    let first = t!(harness.vdo.mapping(10).await);
    let second = t!(harness.vdo.mapping(20).await);
    assert_eq!(first, second);
    assert_eq!(harness.vdo.reference_count(first.pbn).await, Ok(Some(2)));
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.logical_blocks_used, 2);
    assert_eq!(stats.hash_lock.dedupe_advice_valid, 1);
    assert_eq!(stats.hash_lock.dedupe_advice_stale, 0);
    assert_eq!(harness.device.writes(), 1);
    assert_eq!(harness.read(20).await, vec![0xaa; BLOCK_SIZE]);
}

/// Two writes of the same data in flight at once.  The second waits for the
/// first to settle on a block, then shares it.
#[rstest]
#[tokio::test]
async fn concurrent(harness: Harness) {
    let (a, b) = futures::join!(harness.vdo.write(10, block(0xbb)),
                                harness.vdo.write(20, block(0xbb)));
    t!(a);
    t!(b);
    let stats = harness.quiesce().await;

    let location = t!(harness.vdo.mapping(10).await);
    assert_eq!(t!(harness.vdo.mapping(20).await), location);
    assert_eq!(harness.vdo.reference_count(location.pbn).await,
               Ok(Some(2)));
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.hash_lock.concurrent_data_matches +
               stats.hash_lock.dedupe_advice_valid, 1);

    // Each writer journaled exactly one increment of the shared block
    let entries = t!(harness.vdo.journal_entries().await);
    let lbns = entries.iter()
        .filter(|e| e.operation == JournalOperation::DataIncrement &&
                    e.pbn == location.pbn)
        .map(|e| e.lbn)
        .collect::<Vec<_>>();
    assert_eq!(lbns.iter().copied().collect::<BTreeSet<_>>(),
               BTreeSet::from([10, 20]));
    assert_eq!(lbns.len(), 2);
}

/// Many concurrent copies of one block all end up sharing it
#[rstest]
#[tokio::test]
async fn many_concurrent(harness: Harness) {
    let writes = (0..16u64)
        .map(|lbn| harness.vdo.write(lbn, block(0xcc)));
    for r in future::join_all(writes).await {
        t!(r);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 1);
    let location = t!(harness.vdo.mapping(0).await);
    assert_eq!(harness.vdo.reference_count(location.pbn).await,
               Ok(Some(16)));
}

/// With deduplication off the index isn't consulted
#[tokio::test]
async fn disabled() {
    let harness = VdoBuilder::new().deduplication(false).build();
    t!(harness.vdo.write(10, block(0xaa)).await);
    harness.quiesce().await;
    t!(harness.vdo.write(20, block(0xaa)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 2);
    assert_eq!(stats.hash_lock.dedupe_advice_valid, 0);
    assert_ne!(t!(harness.vdo.mapping(10).await),
               t!(harness.vdo.mapping(20).await));
}

/// When there's no room left, only data which already exists can be
/// written
#[tokio::test]
async fn no_space() {
    let harness = VdoBuilder::new()
        .physical_blocks(17)
        .slab_blocks(16)
        .build();
    for lbn in 0..16u64 {
        t!(harness.vdo.write(lbn, block(lbn as u8 + 1)).await);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 16);

    assert_eq!(harness.vdo.write(100, block(0xee)).await,
               Err(Error::NoSpace));
    t!(harness.vdo.write(101, block(1)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 16);
    assert_eq!(stats.errors.write, 1);
    assert!(!harness.vdo.is_read_only());
    assert_eq!(t!(harness.vdo.mapping(100).await).state,
               MappingState::Unmapped);
    assert_eq!(t!(harness.vdo.mapping(101).await),
               t!(harness.vdo.mapping(0).await));
    assert_eq!(harness.read(101).await, vec![1u8; BLOCK_SIZE]);
}

/// A block can only be shared so many times.  After that, the next copy
/// gets a block of its own.
#[tokio::test]
async fn reference_limit() {
    let harness = VdoBuilder::new().build();
    for lbn in 0..260u64 {
        t!(harness.vdo.write(lbn, block(0xdd)).await);
        harness.vdo.drain().await;
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 2);
    let first = t!(harness.vdo.mapping(0).await);
    let last = t!(harness.vdo.mapping(259).await);
    assert_eq!(harness.vdo.reference_count(first.pbn).await, Ok(Some(254)));
    assert_eq!(harness.vdo.reference_count(last.pbn).await, Ok(Some(6)));
}

/// Advice which doesn't hold the data is detected and ignored
#[rstest]
#[tokio::test]
async fn stale_advice(
    #[values(
        DataLocation::new(1023, MappingState::Uncompressed),
        DataLocation::new(1023, MappingState::Compressed(3)),
        DataLocation::default(),
    )]
    advice: DataLocation)
{
    let device = Arc::new(MemoryDevice::new(1 << 10));
    let harness = VdoBuilder::new()
        .build_with(device, Arc::new(StaleIndex(advice)));
    t!(harness.vdo.write(1, block(1)).await);
    t!(harness.vdo.write(2, block(2)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.hash_lock.dedupe_advice_stale, 2);
    assert_eq!(stats.hash_lock.dedupe_advice_valid, 0);
    assert_eq!(stats.data_blocks_used, 2);
    assert_eq!(harness.read(1).await, vec![1u8; BLOCK_SIZE]);
    assert_eq!(harness.read(2).await, vec![2u8; BLOCK_SIZE]);
    // Verification must not leave the advised block referenced
    assert_eq!(harness.vdo.reference_count(1023).await, Ok(Some(0)));
}

/// A broken index costs deduplication, not data
#[tokio::test]
async fn broken_index() {
    let device = Arc::new(MemoryDevice::new(1 << 10));
    let harness = VdoBuilder::new()
        .build_with(device, Arc::new(BrokenIndex));
    t!(harness.vdo.write(1, block(1)).await);
    harness.quiesce().await;
    t!(harness.vdo.write(2, block(1)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 2);
    assert_eq!(stats.errors, Default::default());
    assert!(!harness.vdo.is_read_only());
    assert_eq!(harness.read(2).await, vec![1u8; BLOCK_SIZE]);
}
