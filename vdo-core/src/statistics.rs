// vim: tw=80
//! Statistics counters
//!
//! Every zone updates the live counters with relaxed atomics.  Consumers take
//! a [`VdoStatistics`] snapshot, which is only approximately consistent.

use crate::bio::Operation;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Counts of host requests, by kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BioStats {
    pub read: u64,
    pub write: u64,
    pub discard: u64,
    pub flush: u64,
    pub fua: u64,
}

/// Error counts, by request kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorStats {
    pub read: u64,
    pub write: u64,
    pub read_modify_write: u64,
    pub read_fua: u64,
    pub write_fua: u64,
    pub read_modify_write_fua: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HashLockStats {
    /// Dedupe advice which matched the new data
    pub dedupe_advice_valid: u64,
    /// Dedupe advice which did not
    pub dedupe_advice_stale: u64,
    /// Writes which found an in-flight write of the same data
    pub concurrent_data_matches: u64,
    /// Writes which found an in-flight write of different data with the
    /// same record name
    pub concurrent_hash_collisions: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PackerStats {
    pub compressed_fragments_written: u64,
    pub compressed_blocks_written: u64,
    pub compressed_fragments_in_packer: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JournalStats {
    pub entries_written: u64,
    pub blocks_committed: u64,
    pub blocks_reaped: u64,
}

/// A point-in-time view of a VDO's statistics
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VdoStatistics {
    pub bios_in: BioStats,
    pub bios_acknowledged: BioStats,
    pub bios_in_partial: BioStats,
    pub bios_acknowledged_partial: BioStats,
    /// Physical blocks holding data, including provisionally allocated ones
    pub data_blocks_used: u64,
    /// Logical blocks which are mapped
    pub logical_blocks_used: u64,
    pub blocks_allocated: u64,
    pub hash_lock: HashLockStats,
    pub packer: PackerStats,
    pub journal: JournalStats,
    pub read_only_entries: u64,
    pub errors: ErrorStats,
}

#[derive(Debug, Default)]
pub(crate) struct BioCounters {
    read: AtomicU64,
    write: AtomicU64,
    discard: AtomicU64,
    flush: AtomicU64,
    fua: AtomicU64,
}

impl BioCounters {
    pub fn count(&self, op: Operation, fua: bool) {
        let counter = match op {
            Operation::Read => &self.read,
            Operation::Write => &self.write,
            Operation::Discard => &self.discard,
        };
        counter.fetch_add(1, Relaxed);
        if fua {
            self.fua.fetch_add(1, Relaxed);
        }
    }

    pub fn count_flush(&self) {
        self.flush.fetch_add(1, Relaxed);
    }

    fn snapshot(&self) -> BioStats {
        BioStats {
            read: self.read.load(Relaxed),
            write: self.write.load(Relaxed),
            discard: self.discard.load(Relaxed),
            flush: self.flush.load(Relaxed),
            fua: self.fua.load(Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ErrorCounters {
    counters: [AtomicU64; 6],
}

impl ErrorCounters {
    /// Record an error for a request.  `read_modify_write` distinguishes
    /// partial writes from full ones.
    pub fn count(&self, op: Operation, read_modify_write: bool, fua: bool) {
        let kind = match op {
            Operation::Read => 0,
            _ if read_modify_write => 2,
            _ => 1,
        };
        let i = if fua { kind + 3 } else { kind };
        self.counters[i].fetch_add(1, Relaxed);
    }

    fn snapshot(&self) -> ErrorStats {
        ErrorStats {
            read: self.counters[0].load(Relaxed),
            write: self.counters[1].load(Relaxed),
            read_modify_write: self.counters[2].load(Relaxed),
            read_fua: self.counters[3].load(Relaxed),
            write_fua: self.counters[4].load(Relaxed),
            read_modify_write_fua: self.counters[5].load(Relaxed),
        }
    }
}

/// Live counters shared by every zone
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub bios_in: BioCounters,
    pub bios_acknowledged: BioCounters,
    pub bios_in_partial: BioCounters,
    pub bios_acknowledged_partial: BioCounters,
    pub data_blocks_used: AtomicU64,
    pub logical_blocks_used: AtomicU64,
    pub blocks_allocated: AtomicU64,
    pub dedupe_advice_valid: AtomicU64,
    pub dedupe_advice_stale: AtomicU64,
    pub concurrent_data_matches: AtomicU64,
    pub concurrent_hash_collisions: AtomicU64,
    pub compressed_fragments_written: AtomicU64,
    pub compressed_blocks_written: AtomicU64,
    pub compressed_fragments_in_packer: AtomicU64,
    pub journal_entries_written: AtomicU64,
    pub journal_blocks_committed: AtomicU64,
    pub journal_blocks_reaped: AtomicU64,
    pub errors: ErrorCounters,
}

impl Statistics {
    pub fn snapshot(&self, read_only_entries: u64) -> VdoStatistics {
        VdoStatistics {
            bios_in: self.bios_in.snapshot(),
            bios_acknowledged: self.bios_acknowledged.snapshot(),
            bios_in_partial: self.bios_in_partial.snapshot(),
            bios_acknowledged_partial:
                self.bios_acknowledged_partial.snapshot(),
            data_blocks_used: self.data_blocks_used.load(Relaxed),
            logical_blocks_used: self.logical_blocks_used.load(Relaxed),
            blocks_allocated: self.blocks_allocated.load(Relaxed),
            hash_lock: HashLockStats {
                dedupe_advice_valid: self.dedupe_advice_valid.load(Relaxed),
                dedupe_advice_stale: self.dedupe_advice_stale.load(Relaxed),
                concurrent_data_matches:
                    self.concurrent_data_matches.load(Relaxed),
                concurrent_hash_collisions:
                    self.concurrent_hash_collisions.load(Relaxed),
            },
            packer: PackerStats {
                compressed_fragments_written:
                    self.compressed_fragments_written.load(Relaxed),
                compressed_blocks_written:
                    self.compressed_blocks_written.load(Relaxed),
                compressed_fragments_in_packer:
                    self.compressed_fragments_in_packer.load(Relaxed),
            },
            journal: JournalStats {
                entries_written: self.journal_entries_written.load(Relaxed),
                blocks_committed: self.journal_blocks_committed.load(Relaxed),
                blocks_reaped: self.journal_blocks_reaped.load(Relaxed),
            },
            read_only_entries,
            errors: self.errors.snapshot(),
        }
    }
}

/// Bump a counter
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Relaxed);
}

/// Decrement a gauge
pub(crate) fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Relaxed);
}

pub(crate) fn sub(counter: &AtomicU64, n: u64) {
    counter.fetch_sub(n, Relaxed);
}

// LCOV_EXCL_STOP
