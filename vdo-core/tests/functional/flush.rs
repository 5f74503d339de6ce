// vim: tw=80
//! Flushes
use futures::future;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use vdo_core::{Bio, MappingState};

use super::*;

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().build()
}

#[rstest]
#[tokio::test]
async fn empty(harness: Harness) {
    t!(harness.vdo.flush().await);
    assert_eq!(harness.device.flushes(), 1);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_in.flush, 1);
    assert_eq!(stats.bios_acknowledged.flush, 1);
}

/// Everything acknowledged before a flush is finished by the time the flush
/// is
#[rstest]
#[tokio::test]
async fn after_writes(harness: Harness) {
    let writes = (0..16u64)
        .map(|lbn| harness.vdo.write(lbn, block(lbn as u8)));
    for r in future::join_all(writes).await {
        t!(r);
    }
    t!(harness.vdo.flush().await);
    for lbn in 1..16u64 {
        let mapping = t!(harness.vdo.mapping(lbn).await);
        assert_eq!(mapping.state, MappingState::Uncompressed);
        assert_eq!(harness.device.peek(mapping.pbn),
                   Some(vec![lbn as u8; BLOCK_SIZE]));
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 15);
}

/// A flush doesn't wait on fragments which would otherwise sit in the packer
/// forever
#[tokio::test]
async fn packer() {
    let harness = VdoBuilder::new().compression(true).build();
    for n in 0..4u32 {
        t!(harness.vdo.write(u64::from(n), buf(compressible_block(n))).await);
    }
    t!(harness.vdo.flush().await);
    assert_eq!(harness.vdo.statistics().packer.compressed_fragments_in_packer,
               0);
    let stats = harness.quiesce().await;
    // Each fragment is in a compressed block or a block of its own
    assert_eq!(stats.packer.compressed_fragments_written +
               stats.data_blocks_used,
               4 + stats.packer.compressed_blocks_written);
    for n in 0..4u32 {
        assert_eq!(harness.read(u64::from(n)).await, compressible_block(n));
    }
}

/// A flush and writes racing each other
#[rstest]
#[tokio::test]
async fn concurrent(harness: Harness) {
    let (w, f, w2) = futures::join!(
        harness.vdo.write(1, block(1)),
        harness.vdo.flush(),
        harness.vdo.submit(Bio::write(2, block(2)).fua()),
    );
    t!(w);
    t!(f);
    t!(w2);
    let stats = harness.quiesce().await;
    assert_eq!(stats.bios_acknowledged.flush, 1);
    assert!(harness.device.flushes() >= 2);
    assert_eq!(harness.read(1).await, vec![1u8; BLOCK_SIZE]);
    assert_eq!(harness.read(2).await, vec![2u8; BLOCK_SIZE]);
}
