// vim: tw=80
//! Reads, whole-block writes and partial writes
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use vdo_core::{Bio, Error, MappingState, ZERO_BLOCK};

use super::*;

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().build()
}

/// A block never written reads as zeros, and costs nothing
#[rstest]
#[tokio::test]
async fn unmapped_read(harness: Harness) {
    assert_eq!(harness.read(42).await, vec![0u8; BLOCK_SIZE]);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.read, 1);
    assert_eq!(stats.bios_acknowledged.read, 1);
    assert_eq!(stats.blocks_allocated, 0);
    assert_eq!(harness.device.reads(), 0);
}

#[rstest]
#[tokio::test]
async fn write_and_read(harness: Harness) {
    t!(harness.vdo.write(7, block(0x5a)).await);
    assert_eq!(harness.read(7).await, vec![0x5a; BLOCK_SIZE]);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.logical_blocks_used, 1);
    assert_eq!(stats.blocks_allocated, 1);
    assert_eq!(stats.bios_acknowledged.write, 1);

    let mapping = t!(harness.vdo.mapping(7).await);
    assert_eq!(mapping.state, MappingState::Uncompressed);
    assert_eq!(harness.device.peek(mapping.pbn),
               Some(vec![0x5a; BLOCK_SIZE]));
    assert_eq!(harness.vdo.reference_count(mapping.pbn).await, Ok(Some(1)));
}

/// Overwriting a block frees the old one
#[rstest]
#[tokio::test]
async fn overwrite(harness: Harness) {
    t!(harness.vdo.write(7, block(1)).await);
    harness.quiesce().await;
    let old = t!(harness.vdo.mapping(7).await);

    t!(harness.vdo.write(7, block(2)).await);
    let stats = harness.quiesce().await;
    assert_eq!(harness.read(7).await, vec![2u8; BLOCK_SIZE]);
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.logical_blocks_used, 1);
    assert_eq!(stats.blocks_allocated, 2);
    assert_eq!(harness.vdo.reference_count(old.pbn).await, Ok(Some(0)));
}

/// Zero blocks are mapped to the zero block, and never allocate
#[rstest]
#[tokio::test]
async fn zero_block(harness: Harness) {
    t!(harness.vdo.write(9, block(0)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.blocks_allocated, 0);
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(harness.device.writes(), 0);
    let mapping = t!(harness.vdo.mapping(9).await);
    assert_eq!(mapping.pbn, ZERO_BLOCK);
    assert_eq!(harness.read(9).await, vec![0u8; BLOCK_SIZE]);
}

/// Writing zeros over data releases the data's block
#[rstest]
#[tokio::test]
async fn zero_over_data(harness: Harness) {
    t!(harness.vdo.write(9, block(3)).await);
    t!(harness.vdo.write(9, block(0)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(harness.read(9).await, vec![0u8; BLOCK_SIZE]);
}

#[rstest]
#[tokio::test]
async fn out_of_range(harness: Harness) {
    let lbn = harness.vdo.config().logical_blocks;
    assert_eq!(harness.vdo.write(lbn, block(1)).await,
               Err(Error::OutOfRange));
    assert!(matches!(harness.vdo.read(lbn).await, Err(Error::OutOfRange)));
    let stats = harness.quiesce().await;
    assert_eq!(stats.errors.write, 1);
    assert_eq!(stats.errors.read, 1);
    assert_eq!(stats.blocks_allocated, 0);
    assert!(!harness.vdo.is_read_only());
}

/// Malformed requests are refused before they use any resources
#[rstest]
#[tokio::test]
async fn invalid_argument(harness: Harness) {
    let r = harness.vdo.write_partial(3, BLOCK_SIZE - 100, buf(vec![1; 200]))
        .await;
    assert_eq!(r, Err(Error::InvalidArgument));
    assert_eq!(harness.vdo.discard(3, 0).await, Err(Error::InvalidArgument));
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.write, 0);
    assert_eq!(stats.bios_in.discard, 0);
}

/// A partial write of an unwritten block fills the rest with zeros
#[rstest]
#[tokio::test]
async fn partial_unmapped(harness: Harness) {
    t!(harness.vdo.write_partial(3, 1024, buf(vec![0x77; 512])).await);
    let mut expected = vec![0u8; BLOCK_SIZE];
    expected[1024..1536].fill(0x77);
    assert_eq!(harness.read(3).await, expected);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in_partial.write, 1);
    assert_eq!(stats.bios_acknowledged_partial.write, 1);
    assert_eq!(stats.data_blocks_used, 1);
}

/// A partial write merges into the block's existing contents
#[rstest]
#[tokio::test]
async fn partial_overwrite(harness: Harness) {
    t!(harness.vdo.write(4, block(1)).await);
    t!(harness.vdo.write_partial(4, 0, buf(vec![2; 512])).await);
    t!(harness.vdo.write_partial(4, 3584, buf(vec![3; 512])).await);
    let mut expected = vec![1u8; BLOCK_SIZE];
    expected[..512].fill(2);
    expected[3584..].fill(3);
    assert_eq!(harness.read(4).await, expected);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in_partial.write, 2);
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.errors, Default::default());
}

/// A partial write which turns a block into zeros doesn't need a block
#[rstest]
#[tokio::test]
async fn partial_to_zero(harness: Harness) {
    let mut data = vec![0u8; BLOCK_SIZE];
    data[100] = 5;
    t!(harness.vdo.write(4, buf(data)).await);
    t!(harness.vdo.write_partial(4, 100, buf(vec![0])).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(t!(harness.vdo.mapping(4).await).pbn, ZERO_BLOCK);
}

/// FUA writes are durable when acknowledged
#[rstest]
#[tokio::test]
async fn fua(harness: Harness) {
    let r = harness.vdo.submit(Bio::write(5, block(3)).fua()).await;
    assert!(matches!(r, Ok(None)));
    assert!(harness.device.flushes() >= 1);
    assert_eq!(harness.device.writes(), 1);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.fua, 1);
    assert_eq!(stats.bios_acknowledged.fua, 1);
    assert_eq!(harness.read(5).await, vec![3u8; BLOCK_SIZE]);
}

/// A read arriving while a write holds the block sees the write's data
#[rstest]
#[tokio::test]
async fn read_over_write(harness: Harness) {
    t!(harness.vdo.write(8, block(1)).await);
    harness.quiesce().await;
    let (w, r) = futures::join!(harness.vdo.write(8, block(9)),
                                harness.vdo.read(8));
    t!(w);
    let data = t!(r);
    assert_eq!(&data.try_const().unwrap()[..], &[9u8; BLOCK_SIZE][..]);
    harness.quiesce().await;
}

/// Writes spread over many block map pages
#[rstest]
#[tokio::test]
async fn many_blocks(harness: Harness) {
    for lbn in 0..32u64 {
        t!(harness.vdo.write(lbn * 1000, block(lbn as u8 + 1)).await);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.logical_blocks_used, 32);
    assert_eq!(stats.data_blocks_used, 32);
    for lbn in 0..32u64 {
        assert_eq!(harness.read(lbn * 1000).await,
                   vec![lbn as u8 + 1; BLOCK_SIZE]);
    }
}

/// Once every change in a journal block is done, the block is reaped and its
/// entries are forgotten
#[tokio::test]
async fn journal_reaped() {
    let harness = VdoBuilder::new().journal_entries_per_block(2).build();
    for lbn in 0..8u64 {
        t!(harness.vdo.write(lbn, block(lbn as u8 + 1)).await);
    }
    let stats = harness.quiesce().await;
    assert!(stats.journal.entries_written >= 8);
    assert!(stats.journal.blocks_reaped >= stats.journal.blocks_committed - 1);
    let entries = t!(harness.vdo.journal_entries().await);
    assert!(entries.len() < 2, "unreaped entries {entries:?}");
    for lbn in 0..8u64 {
        assert_eq!(harness.read(lbn).await, vec![lbn as u8 + 1; BLOCK_SIZE]);
    }
}
