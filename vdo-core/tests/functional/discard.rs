// vim: tw=80
//! Discards
use futures::future;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use vdo_core::{Error, MappingState, ZERO_BLOCK};

use super::*;

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().build()
}

/// Discarding blocks which were never written changes nothing
#[rstest]
#[tokio::test]
async fn unmapped(harness: Harness) {
    t!(harness.vdo.discard(100, 3).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.discard, 1);
    assert_eq!(stats.bios_acknowledged.discard, 1);
    assert_eq!(stats.blocks_allocated, 0);
    assert_eq!(stats.logical_blocks_used, 0);
    assert_eq!(harness.device.writes(), 0);
    for lbn in 100..103 {
        assert_eq!(t!(harness.vdo.mapping(lbn).await).state,
                   MappingState::Unmapped);
    }
}

/// A discarded block's space is freed, and it reads as zeros
#[rstest]
#[tokio::test]
async fn frees(harness: Harness) {
    t!(harness.vdo.write(7, block(0x11)).await);
    harness.quiesce().await;
    let old = t!(harness.vdo.mapping(7).await);

    t!(harness.vdo.discard(7, 1).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(stats.logical_blocks_used, 0);
    assert_eq!(harness.vdo.reference_count(old.pbn).await, Ok(Some(0)));
    let mapping = t!(harness.vdo.mapping(7).await);
    assert_eq!(mapping.pbn, ZERO_BLOCK);
    assert!(!mapping.state.is_mapped());
    assert_eq!(harness.read(7).await, vec![0u8; BLOCK_SIZE]);
}

/// One discard covering several written blocks, and some which weren't
#[rstest]
#[tokio::test]
async fn multiple_blocks(harness: Harness) {
    for lbn in [10u64, 11, 13, 15] {
        t!(harness.vdo.write(lbn, block(lbn as u8)).await);
    }
    harness.quiesce().await;

    t!(harness.vdo.discard(11, 4).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.discard, 1);
    assert_eq!(stats.data_blocks_used, 2);
    assert_eq!(stats.logical_blocks_used, 2);
    assert_eq!(harness.read(10).await, vec![10u8; BLOCK_SIZE]);
    assert_eq!(harness.read(11).await, vec![0u8; BLOCK_SIZE]);
    assert_eq!(harness.read(13).await, vec![0u8; BLOCK_SIZE]);
    assert_eq!(harness.read(15).await, vec![15u8; BLOCK_SIZE]);
}

/// Discarding one user of a shared block leaves the others' data alone
#[rstest]
#[tokio::test]
async fn shared(harness: Harness) {
    t!(harness.vdo.write(1, block(0x33)).await);
    harness.quiesce().await;
    t!(harness.vdo.write(2, block(0x33)).await);
    harness.quiesce().await;
    let location = t!(harness.vdo.mapping(1).await);

    t!(harness.vdo.discard(1, 1).await);
    let stats = harness.quiesce().await;
    assert_eq!(harness.vdo.reference_count(location.pbn).await,
               Ok(Some(1)));
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(harness.read(2).await, vec![0x33; BLOCK_SIZE]);
}

/// A discard may not run off the end of the device
#[rstest]
#[tokio::test]
async fn out_of_range(harness: Harness) {
    let end = harness.vdo.config().logical_blocks;
    t!(harness.vdo.write(end - 1, block(9)).await);
    harness.quiesce().await;
    assert_eq!(harness.vdo.discard(end - 1, 2).await, Err(Error::OutOfRange));
    harness.quiesce().await;
    // The part which was in range is untouched
    assert_eq!(harness.read(end - 1).await, vec![9u8; BLOCK_SIZE]);
}

/// A discard too long to describe in bytes is refused up front, and the VDO
/// keeps working
#[rstest]
#[tokio::test]
async fn huge(harness: Harness) {
    assert_eq!(harness.vdo.discard(0, 1u64 << 60).await,
               Err(Error::OutOfRange));
    assert_eq!(harness.vdo.discard(4, u64::MAX).await,
               Err(Error::OutOfRange));
    t!(harness.vdo.write(4, block(4)).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_acknowledged.discard, 0);
    assert_eq!(stats.logical_blocks_used, 1);
    assert_eq!(harness.read(4).await, vec![4u8; BLOCK_SIZE]);
}

/// Many large discards at once share the limited discard slots
#[tokio::test]
async fn many() {
    let harness = VdoBuilder::new().pool_size(8).build();
    for lbn in 0..64u64 {
        t!(harness.vdo.write(lbn, block(lbn as u8 + 1)).await);
    }
    harness.quiesce().await;
    let discards = (0..8u64).map(|i| harness.vdo.discard(i * 8, 8));
    for r in future::join_all(discards).await {
        t!(r);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_acknowledged.discard, 8);
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(stats.logical_blocks_used, 0);
    assert!(harness.vdo.max_active_requests() <= 8);
}
