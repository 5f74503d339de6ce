// vim: tw=80
//! I/O errors, and the read-only mode which some of them cause
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use vdo_core::{Bio, Error, MappingState};

use super::*;

#[fixture]
fn harness() -> Harness {
    VdoBuilder::new().build()
}

/// A write which fails after being acknowledged leaves the host believing
/// something false, so the VDO stops accepting writes
#[rstest]
#[tokio::test]
async fn write_error_after_ack(harness: Harness) {
    t!(harness.vdo.write(0, block(1)).await);
    harness.quiesce().await;

    harness.device.fail_writes(true);
    t!(harness.vdo.write(1, block(2)).await);
    let stats = harness.quiesce().await;
    assert!(harness.vdo.is_read_only());
    assert_eq!(harness.vdo.read_only_error(), Some(Error::Io));
    assert_eq!(stats.read_only_entries, 1);
    assert_eq!(stats.errors.write, 1);
    assert_eq!(t!(harness.vdo.mapping(1).await).state,
               MappingState::Unmapped);

    // New writes, zero writes and discards are all refused
    assert_eq!(harness.vdo.write(2, block(3)).await, Err(Error::ReadOnly));
    assert_eq!(harness.vdo.write(2, block(0)).await, Err(Error::ReadOnly));
    assert_eq!(harness.vdo.discard(0, 1).await, Err(Error::ReadOnly));

    // But the data which made it is still readable
    assert_eq!(harness.read(0).await, vec![1u8; BLOCK_SIZE]);
    assert_eq!(harness.read(1).await, vec![0u8; BLOCK_SIZE]);
    harness.quiesce().await;
}

/// Once the administrator clears the condition, writes work again
#[test_log::test(tokio::test)]
async fn clear() {
    let harness = VdoBuilder::new().build();
    harness.device.fail_writes(true);
    t!(harness.vdo.write(1, block(2)).await);
    harness.quiesce().await;
    assert!(harness.vdo.is_read_only());

    harness.device.fail_writes(false);
    harness.vdo.clear_read_only();
    assert_eq!(harness.vdo.read_only_error(), None);
    t!(harness.vdo.write(1, block(4)).await);
    let stats = harness.quiesce().await;
    assert!(!harness.vdo.is_read_only());
    assert_eq!(stats.read_only_entries, 1);
    assert_eq!(harness.read(1).await, vec![4u8; BLOCK_SIZE]);
}

/// A FUA write isn't acknowledged until it's done, so its failure can simply
/// be reported
#[rstest]
#[tokio::test]
async fn fua_write_error(harness: Harness) {
    harness.device.fail_writes(true);
    let r = harness.vdo.submit(Bio::write(3, block(5)).fua()).await;
    assert!(matches!(r, Err(Error::Io)));
    let stats = harness.quiesce().await;
    assert!(!harness.vdo.is_read_only());
    assert_eq!(stats.errors.write_fua, 1);
    assert_eq!(stats.errors.write, 0);
    assert_eq!(stats.data_blocks_used, 0);
    assert_eq!(t!(harness.vdo.mapping(3).await).state,
               MappingState::Unmapped);

    harness.device.fail_writes(false);
    t!(harness.vdo.write(3, block(5)).await);
    harness.quiesce().await;
    assert_eq!(harness.read(3).await, vec![5u8; BLOCK_SIZE]);
}

/// A failed read is reported, and nothing more
#[rstest]
#[tokio::test]
async fn read_error(harness: Harness) {
    t!(harness.vdo.write(6, block(7)).await);
    harness.quiesce().await;
    let mapping = t!(harness.vdo.mapping(6).await);
    harness.device.fail_reads_of(mapping.pbn);

    assert!(matches!(harness.vdo.read(6).await, Err(Error::Io)));
    let stats = harness.quiesce().await;
    assert_eq!(stats.errors.read, 1);
    assert!(!harness.vdo.is_read_only());
}

/// A partial write must read the old data first.  If it can't, the write
/// fails without harm.
#[rstest]
#[tokio::test]
async fn read_modify_write_error(harness: Harness) {
    t!(harness.vdo.write(6, block(7)).await);
    harness.quiesce().await;
    let mapping = t!(harness.vdo.mapping(6).await);
    harness.device.fail_reads_of(mapping.pbn);

    let r = harness.vdo.write_partial(6, 0, buf(vec![1; 512])).await;
    assert_eq!(r, Err(Error::Io));
    let stats = harness.quiesce().await;
    assert_eq!(stats.errors.read_modify_write, 1);
    assert!(!harness.vdo.is_read_only());
    assert_eq!(t!(harness.vdo.mapping(6).await), mapping);
}

/// A verification read which fails costs a deduplication, not the write
#[rstest]
#[tokio::test]
async fn verify_read_error(harness: Harness) {
    t!(harness.vdo.write(6, block(7)).await);
    harness.quiesce().await;
    let original = t!(harness.vdo.mapping(6).await);
    harness.device.fail_reads_of(original.pbn);

    t!(harness.vdo.write(8, block(7)).await);
    let stats = harness.quiesce().await;
    assert!(!harness.vdo.is_read_only());
    assert_eq!(stats.errors, Default::default());
    assert_eq!(stats.hash_lock.dedupe_advice_stale, 1);
    assert_eq!(stats.data_blocks_used, 2);
    assert_ne!(t!(harness.vdo.mapping(8).await), original);
    assert_eq!(harness.read(8).await, vec![7u8; BLOCK_SIZE]);
}
