// vim: tw=80
//! Packing compressed fragments into shared blocks
use futures::future;
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use rstest::{fixture, rstest};
use vdo_core::MappingState;

use super::*;

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().compression(true).build()
}

/// Write `blocks` distinct compressible blocks to lbns `0..blocks`, all at
/// once.
async fn write_compressible(harness: &Harness, blocks: u32) {
    let writes = (0..blocks).map(|n| {
        harness.vdo.write(u64::from(n), buf(compressible_block(n)))
    });
    for r in future::join_all(writes).await {
        t!(r);
    }
}

/// A full bin is written without being asked to
#[rstest]
#[tokio::test]
async fn full_bin(harness: Harness) {
    write_compressible(&harness, 14).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_blocks_written == 1).await;
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_fragments_written, 14);
    assert_eq!(stats.packer.compressed_fragments_in_packer, 0);
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.logical_blocks_used, 14);

    let first = t!(harness.vdo.mapping(0).await);
    assert_eq!(harness.vdo.reference_count(first.pbn).await, Ok(Some(14)));
    let mut slots = Vec::new();
    for n in 0..14u32 {
        let mapping = t!(harness.vdo.mapping(u64::from(n)).await);
        assert_eq!(mapping.pbn, first.pbn);
        let MappingState::Compressed(slot) = mapping.state else {
            panic!("lbn {n} isn't compressed: {mapping:?}");
        };
        slots.push(slot);
        assert_eq!(harness.read(u64::from(n)).await, compressible_block(n));
    }
    slots.sort_unstable();
    assert_eq!(slots, (0..14).collect::<Vec<u8>>());
}

/// A flush writes out a partly filled bin
#[rstest]
#[tokio::test]
async fn flush_partial_bin(harness: Harness) {
    write_compressible(&harness, 3).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 3)
        .await;
    t!(harness.vdo.flush().await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_blocks_written, 1);
    assert_eq!(stats.packer.compressed_fragments_written, 3);
    assert_eq!(stats.data_blocks_used, 1);
    for n in 0..3u32 {
        assert_eq!(harness.read(u64::from(n)).await, compressible_block(n));
    }
}

/// There's no point in compressing a fragment which would have a block to
/// itself
#[rstest]
#[tokio::test]
async fn lone_fragment(harness: Harness) {
    write_compressible(&harness, 1).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 1)
        .await;
    t!(harness.vdo.flush().await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_blocks_written, 0);
    assert_eq!(stats.data_blocks_used, 1);
    let mapping = t!(harness.vdo.mapping(0).await);
    assert_eq!(mapping.state, MappingState::Uncompressed);
    assert_eq!(harness.device.peek(mapping.pbn), Some(compressible_block(0)));
}

/// Data which doesn't compress is written as is
#[rstest]
#[tokio::test]
async fn incompressible(harness: Harness) {
    let mut rng = XorShiftRng::seed_from_u64(42);
    let data = random_block(&mut rng);
    t!(harness.vdo.write(5, buf(data.clone())).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_fragments_written, 0);
    let mapping = t!(harness.vdo.mapping(5).await);
    assert_eq!(mapping.state, MappingState::Uncompressed);
    assert_eq!(harness.read(5).await, data);
}

/// New data may be deduplicated against a fragment of a compressed block
#[rstest]
#[tokio::test]
async fn dedupe_against_compressed(harness: Harness) {
    write_compressible(&harness, 3).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 3)
        .await;
    t!(harness.vdo.flush().await);
    harness.quiesce().await;
    let original = t!(harness.vdo.mapping(1).await);
    assert!(matches!(original.state, MappingState::Compressed(_)));

    t!(harness.vdo.write(100, buf(compressible_block(1))).await);
    let stats = harness.quiesce().await;
    assert_eq!(t!(harness.vdo.mapping(100).await), original);
    assert_eq!(harness.vdo.reference_count(original.pbn).await,
               Ok(Some(4)));
    assert_eq!(stats.hash_lock.dedupe_advice_valid, 1);
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(harness.read(100).await, compressible_block(1));
}

/// Turning compression off sends whatever the packer holds on its way
#[rstest]
#[tokio::test]
async fn disable(harness: Harness) {
    write_compressible(&harness, 2).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 2)
        .await;
    assert!(harness.vdo.set_compression(false));
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 0)
        .await;

    t!(harness.vdo.write(2, buf(compressible_block(2))).await);
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_fragments_written, 2);
    assert_eq!(t!(harness.vdo.mapping(2).await).state,
               MappingState::Uncompressed);
    for n in 0..3u32 {
        assert_eq!(harness.read(u64::from(n)).await, compressible_block(n));
    }
    assert!(!harness.vdo.set_compression(true));
}

/// Requests waiting in the packer mustn't starve new requests of data_vios
#[tokio::test]
async fn pool_exhaustion() {
    let harness = VdoBuilder::new().compression(true).pool_size(2).build();
    for n in 0..6u32 {
        t!(harness.vdo.write(u64::from(n), buf(compressible_block(n))).await);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.packer.compressed_fragments_in_packer, 0);
    assert!(harness.vdo.max_active_requests() <= 2);
    for n in 0..6u32 {
        assert_eq!(harness.read(u64::from(n)).await, compressible_block(n));
    }
}

/// Overwriting or discarding fragments releases their share of the
/// compressed block
#[rstest]
#[tokio::test]
async fn release_fragments(harness: Harness) {
    write_compressible(&harness, 2).await;
    wait_for(&harness.vdo, |s| s.packer.compressed_fragments_in_packer == 2)
        .await;
    t!(harness.vdo.flush().await);
    harness.quiesce().await;
    let compressed = t!(harness.vdo.mapping(0).await);
    assert_eq!(harness.vdo.reference_count(compressed.pbn).await,
               Ok(Some(2)));

    t!(harness.vdo.write(0, block(0x42)).await);
    harness.quiesce().await;
    assert_eq!(harness.vdo.reference_count(compressed.pbn).await,
               Ok(Some(1)));

    t!(harness.vdo.discard(1, 1).await);
    let stats = harness.quiesce().await;
    assert_eq!(harness.vdo.reference_count(compressed.pbn).await,
               Ok(Some(0)));
    assert_eq!(stats.data_blocks_used, 1);
    assert_eq!(stats.logical_blocks_used, 1);
    assert_eq!(harness.read(0).await, vec![0x42; BLOCK_SIZE]);
    assert_eq!(harness.read(1).await, vec![0; BLOCK_SIZE]);
}
