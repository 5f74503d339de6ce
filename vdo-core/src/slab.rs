// vim: tw=80
//! Slabs: the unit of physical space management
//!
//! The data region of the device is divided into equal slabs, each owned by
//! exactly one physical zone.  A slab tracks one reference counter per block
//! plus a journal of every reference change applied to it.

use crate::{
    config::VdoConfig,
    pbn_lock::{MAXIMUM_REFERENCE_COUNT, PbnLock},
    types::*,
};
use serde_derive::Serialize;
use std::{collections::VecDeque, ops::Range};
use tracing::error;

pub(crate) const EMPTY_REFERENCE_COUNT: u8 = 0;
pub(crate) const PROVISIONAL_REFERENCE_COUNT: u8 = 255;

/// The first PBN available for data.  PBN 0 is the zero block.
const FIRST_DATA_BLOCK: Pbn = 1;

/// How many of its most recent reference changes a slab remembers
pub(crate) const SLAB_JOURNAL_ENTRIES: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReferenceStatus {
    Free,
    Single,
    Shared,
    Provisional,
}

impl From<u8> for ReferenceStatus {
    fn from(counter: u8) -> Self {
        match counter {
            EMPTY_REFERENCE_COUNT => ReferenceStatus::Free,
            1 => ReferenceStatus::Single,
            PROVISIONAL_REFERENCE_COUNT => ReferenceStatus::Provisional,
            _ => ReferenceStatus::Shared,
        }
    }
}

/// Geometry of the slab depot: which slab and zone own a given PBN.
#[derive(Clone, Debug)]
pub struct SlabLayout {
    physical_blocks: u64,
    slab_blocks: u64,
    slab_count: u64,
    zones: usize,
}

impl SlabLayout {
    pub fn new(config: &VdoConfig) -> Self {
        SlabLayout {
            physical_blocks: config.physical_blocks,
            slab_blocks: config.slab_blocks,
            slab_count: config.slab_count(),
            zones: config.physical_zones,
        }
    }

    /// Is `pbn` a block which may hold data?
    pub fn is_data_block(&self, pbn: Pbn) -> bool {
        (FIRST_DATA_BLOCK..self.physical_blocks).contains(&pbn)
    }

    pub fn slab_count(&self) -> u64 {
        self.slab_count
    }

    /// The slab containing `pbn`, if it is a data block
    pub fn slab_of(&self, pbn: Pbn) -> Option<u64> {
        self.is_data_block(pbn)
            .then(|| (pbn - FIRST_DATA_BLOCK) / self.slab_blocks)
    }

    /// The PBNs belonging to slab `slab`
    pub fn slab_range(&self, slab: u64) -> Range<Pbn> {
        let start = FIRST_DATA_BLOCK + slab * self.slab_blocks;
        let end = (start + self.slab_blocks).min(self.physical_blocks);
        start..end
    }

    /// Slabs owned by one physical zone, in allocation order
    pub fn slabs_for_zone(&self, zone: ZoneId)
        -> impl Iterator<Item=u64> + '_
    {
        (0..self.slab_count).filter(move |s| self.zone_of_slab(*s) == zone)
    }

    /// The physical zone owning `pbn`.  The zero block nominally belongs to
    /// zone 0.
    pub fn zone_of(&self, pbn: Pbn) -> ZoneId {
        self.slab_of(pbn).map_or(0, |s| self.zone_of_slab(s))
    }

    fn zone_of_slab(&self, slab: u64) -> ZoneId {
        (slab % self.zones as u64) as ZoneId
    }

    /// Position of a slab within its zone's list of slabs
    pub fn zone_index_of_slab(&self, slab: u64) -> usize {
        (slab / self.zones as u64) as usize
    }
}

/// One reference change applied to a slab
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SlabJournalEntry {
    /// The recovery journal block which recorded the change
    pub sequence: SequenceNumber,
    pub pbn: Pbn,
    pub increment: bool,
}

#[derive(Debug)]
pub(crate) struct Slab {
    number: u64,
    start: Pbn,
    counters: Vec<u8>,
    free: u64,
    search_cursor: usize,
    journal: VecDeque<SlabJournalEntry>,
}

impl Slab {
    pub fn new(number: u64, blocks: Range<Pbn>) -> Self {
        let len = (blocks.end - blocks.start) as usize;
        Slab {
            number,
            start: blocks.start,
            counters: vec![EMPTY_REFERENCE_COUNT; len],
            free: len as u64,
            search_cursor: 0,
            journal: VecDeque::new(),
        }
    }

    /// Provisionally reference the next free block.
    pub fn allocate(&mut self) -> Option<Pbn> {
        if self.free == 0 {
            return None;
        }
        let len = self.counters.len();
        let offset = (0..len)
            .map(|i| (self.search_cursor + i) % len)
            .find(|i| self.counters[*i] == EMPTY_REFERENCE_COUNT)?;
        self.counters[offset] = PROVISIONAL_REFERENCE_COUNT;
        self.free -= 1;
        self.search_cursor = (offset + 1) % len;
        Some(self.start + offset as Pbn)
    }

    /// How many more references may be added to `pbn`?
    pub fn available_references(&self, pbn: Pbn) -> u32 {
        match self.counters.get(self.offset(pbn)) {
            None => 0,
            Some(&PROVISIONAL_REFERENCE_COUNT) => {
                u32::from(MAXIMUM_REFERENCE_COUNT) - 1
            }
            Some(&c) => u32::from(MAXIMUM_REFERENCE_COUNT - c),
        }
    }

    /// Remove one reference.  Returns `true` if the block became free.
    ///
    /// A block which is locked never becomes free here; its last reference
    /// becomes provisional and is owned by the lock.
    pub fn decrement(&mut self, pbn: Pbn, lock: Option<&mut PbnLock>,
                     sequence: SequenceNumber) -> Result<bool>
    {
        let offset = self.offset(pbn);
        let counter = self.counter(offset)?;
        let freed = match ReferenceStatus::from(counter) {
            ReferenceStatus::Free => {
                error!(slab = self.number, pbn, "Decrementing free block");
                return Err(Error::RefCountInvalid);
            }
            ReferenceStatus::Single | ReferenceStatus::Provisional => {
                if let Some(lock) = lock {
                    self.counters[offset] = PROVISIONAL_REFERENCE_COUNT;
                    lock.provisional = true;
                    false
                } else {
                    self.counters[offset] = EMPTY_REFERENCE_COUNT;
                    self.free += 1;
                    true
                }
            }
            ReferenceStatus::Shared => {
                self.counters[offset] -= 1;
                false
            }
        };
        self.journal_entry(SlabJournalEntry {sequence, pbn, increment: false});
        Ok(freed)
    }

    fn counter(&self, offset: usize) -> Result<u8> {
        self.counters.get(offset).copied().ok_or(Error::OutOfRange)
    }

    pub fn free_blocks(&self) -> u64 {
        self.free
    }

    /// Add one reference.  Returns `true` if the block was previously free.
    pub fn increment(&mut self, pbn: Pbn, lock: Option<&mut PbnLock>,
                     sequence: SequenceNumber) -> Result<bool>
    {
        let offset = self.offset(pbn);
        let counter = self.counter(offset)?;
        let was_free = match ReferenceStatus::from(counter) {
            ReferenceStatus::Free => {
                self.counters[offset] = 1;
                self.free -= 1;
                true
            }
            ReferenceStatus::Provisional => {
                self.counters[offset] = 1;
                false
            }
            ReferenceStatus::Single | ReferenceStatus::Shared => {
                if counter >= MAXIMUM_REFERENCE_COUNT {
                    error!(slab = self.number, pbn,
                        "Incrementing a block already having {} references",
                        MAXIMUM_REFERENCE_COUNT);
                    return Err(Error::RefCountInvalid);
                }
                self.counters[offset] += 1;
                false
            }
        };
        if let Some(lock) = lock {
            lock.provisional = false;
        }
        self.journal_entry(SlabJournalEntry {sequence, pbn, increment: true});
        Ok(was_free)
    }

    /// Recent reference changes, oldest first
    pub fn journal(&self) -> &VecDeque<SlabJournalEntry> {
        &self.journal
    }

    fn journal_entry(&mut self, entry: SlabJournalEntry) {
        if self.journal.len() >= SLAB_JOURNAL_ENTRIES {
            self.journal.pop_front();
        }
        self.journal.push_back(entry);
    }

    fn offset(&self, pbn: Pbn) -> usize {
        pbn.wrapping_sub(self.start) as usize
    }

    /// Give an unreferenced block a provisional reference, so it can't be
    /// allocated while somebody verifies its contents.  Returns `true` if
    /// the block was free.
    pub fn provisionally_reference(&mut self, pbn: Pbn) -> Result<bool> {
        let offset = self.offset(pbn);
        if self.counter(offset)? == EMPTY_REFERENCE_COUNT {
            self.counters[offset] = PROVISIONAL_REFERENCE_COUNT;
            self.free -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn reference_count(&self, pbn: Pbn) -> Option<u8> {
        self.counters.get(self.offset(pbn)).copied()
    }

    /// Drop a provisional reference.  Returns `true` if the block became free.
    pub fn release_provisional(&mut self, pbn: Pbn) -> bool {
        let offset = self.offset(pbn);
        if self.counters.get(offset) == Some(&PROVISIONAL_REFERENCE_COUNT) {
            self.counters[offset] = EMPTY_REFERENCE_COUNT;
            self.free += 1;
            true
        } else {
            false
        }
    }

    pub fn status(&self, pbn: Pbn) -> Option<ReferenceStatus> {
        self.reference_count(pbn).map(ReferenceStatus::from)
    }
}

// LCOV_EXCL_STOP
