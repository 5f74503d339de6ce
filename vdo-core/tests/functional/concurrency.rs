// vim: tw=80
//! Mixed workloads across several zones of each kind
use std::collections::{BTreeMap, HashMap};

use futures::future;
use pretty_assertions::assert_eq;
use rand::{seq::SliceRandom, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest::rstest;
use vdo_core::{JournalOperation, ZERO_BLOCK};

use super::*;

const LBNS: u64 = 48;
const ROUNDS: usize = 8;
const PER_ROUND: usize = 32;

/// Some incompressible, some compressible, and the zero block
fn patterns(rng: &mut XorShiftRng) -> Vec<Vec<u8>> {
    let mut v = (0..4).map(|_| random_block(&mut *rng)).collect::<Vec<_>>();
    v.extend((0..4).map(compressible_block));
    v.push(vec![0; BLOCK_SIZE]);
    v
}

/// Each round writes a different random set of LBNs concurrently, with
/// plenty of duplicate data.  An LBN is written at most once per round, so
/// the last round to write it has the final say.
#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_writes(
    #[values(1, 2)] zones: usize,
    #[values(false, true)] compression: bool)
{
    // Big enough journal blocks that nothing is reaped before the replay
    let harness = VdoBuilder::new()
        .zones(zones, zones, zones)
        .compression(compression)
        .journal_entries_per_block(1 << 12)
        .build();
    let mut rng = XorShiftRng::seed_from_u64(0x1234 + zones as u64);
    let patterns = patterns(&mut rng);
    let mut lbns = (0..LBNS).collect::<Vec<_>>();
    let mut model = HashMap::new();

    for _ in 0..ROUNDS {
        lbns.shuffle(&mut rng);
        let round = lbns[..PER_ROUND].iter()
            .map(|lbn| (*lbn, rng.gen_range(0..patterns.len())))
            .collect::<Vec<_>>();
        let writes = round.iter().map(|(lbn, p)| {
            harness.vdo.write(*lbn, buf(patterns[*p].clone()))
        });
        for r in future::join_all(writes).await {
            t!(r);
        }
        model.extend(round);
    }
    let stats = harness.quiesce().await;
    assert!(harness.vdo.max_active_requests() <= 64);
    assert_eq!(stats.errors, Default::default());
    assert!(!harness.vdo.is_read_only());
    for (lbn, p) in model.iter() {
        assert_eq!(harness.read(*lbn).await, patterns[*p],
                   "lbn {lbn} has the wrong contents");
    }
    assert_eq!(stats.logical_blocks_used, model.len() as u64);

    // Replaying the journal must never take a reference count below zero,
    // and must end with the counts the slabs hold.
    let mut counts = BTreeMap::<u64, i64>::new();
    for entry in t!(harness.vdo.journal_entries().await) {
        if entry.pbn == ZERO_BLOCK {
            continue;
        }
        let count = counts.entry(entry.pbn).or_default();
        match entry.operation {
            JournalOperation::DataIncrement => *count += 1,
            JournalOperation::DataDecrement => *count -= 1,
        }
        assert!(*count >= 0, "{entry:?} took pbn {} below zero", entry.pbn);
    }
    for (pbn, count) in counts.iter() {
        assert_eq!(harness.vdo.reference_count(*pbn).await,
                   Ok(Some(*count as u8)),
                   "pbn {pbn}");
    }
    let in_use = counts.values().filter(|c| **c > 0).count() as u64;
    assert_eq!(stats.data_blocks_used, in_use);
    assert_eq!(stats.journal.blocks_reaped, 0);
}

/// Readers and writers of the same blocks at the same time.  Each read must
/// return one of the versions written.
#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_during_writes(#[values(1, 2)] zones: usize) {
    let harness = VdoBuilder::new()
        .zones(zones, zones, zones)
        .build();
    for lbn in 0..16u64 {
        t!(harness.vdo.write(lbn, block(1)).await);
    }
    let writes = future::join_all((0..16u64).map(|lbn| {
        harness.vdo.write(lbn, block(2))
    }));
    let reads = future::join_all((0..16u64).map(|lbn| harness.vdo.read(lbn)));
    let (writes, reads) = futures::join!(writes, reads);
    for r in writes {
        t!(r);
    }
    for r in reads {
        let dbs = t!(r);
        let db = dbs.try_const().unwrap();
        assert!(db[..] == [1u8; BLOCK_SIZE] || db[..] == [2u8; BLOCK_SIZE]);
    }
    let stats = harness.quiesce().await;
    assert_eq!(stats.data_blocks_used, 1);
    for lbn in 0..16u64 {
        assert_eq!(harness.read(lbn).await, vec![2u8; BLOCK_SIZE]);
    }
}

/// A small pool admits everything eventually
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_pool() {
    let harness = VdoBuilder::new()
        .zones(2, 2, 2)
        .pool_size(4)
        .build();
    let writes = (0..64u64).map(|lbn| {
        harness.vdo.write(lbn, block((lbn % 7) as u8 + 1))
    });
    for r in future::join_all(writes).await {
        t!(r);
    }
    let stats = harness.quiesce().await;
    assert!(harness.vdo.max_active_requests() <= 4);
    assert_eq!(stats.data_blocks_used, 7);
    assert_eq!(stats.logical_blocks_used, 64);
    for lbn in 0..64u64 {
        assert_eq!(harness.read(lbn).await,
                   vec![(lbn % 7) as u8 + 1; BLOCK_SIZE]);
    }
}
