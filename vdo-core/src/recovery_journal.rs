// vim: tw=80
//! The recovery journal
//!
//! Every block map change and every reference count change is described by
//! a journal entry before it is made.  Entries are grouped into blocks; a
//! data_vio holds a lock on each block containing one of its entries until
//! its changes are complete, and a block can't be reaped while it is locked.

use crate::{
    cleanup::{Cleanup, PendingCleanup, ReleaseJournalLocks},
    data_vio::{AsyncOperation, DataVio, Step},
    statistics,
    types::*,
    zone::{self, Context, Message, Query, Zone},
};
use serde_derive::Serialize;
use std::{
    collections::VecDeque,
    sync::Arc,
};
use tracing::{error, trace};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum JournalOperation {
    DataIncrement,
    DataDecrement,
}

/// One journaled mapping change
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct JournalEntry {
    /// The journal block holding the entry
    pub sequence: SequenceNumber,
    pub operation: JournalOperation,
    pub lbn: Lbn,
    pub pbn: Pbn,
    pub state: MappingState,
}

#[derive(Debug)]
struct JournalBlock {
    sequence: SequenceNumber,
    entries: usize,
    /// Number of entries whose changes are not yet complete
    locks: usize,
}

#[derive(Debug)]
pub(crate) struct RecoveryJournal {
    ctx: Arc<Context>,
    entries_per_block: usize,
    /// Unreaped blocks, oldest first
    blocks: VecDeque<JournalBlock>,
    next_sequence: SequenceNumber,
    /// Entries in unreaped blocks, oldest first
    entries: VecDeque<JournalEntry>,
}

impl RecoveryJournal {
    pub fn new(ctx: Arc<Context>) -> Self {
        let entries_per_block = ctx.config.journal_entries_per_block;
        RecoveryJournal {
            ctx,
            entries_per_block,
            blocks: VecDeque::new(),
            next_sequence: 1,
            entries: VecDeque::new(),
        }
    }

    /// Append an entry on behalf of `dv`, which takes a lock on its block.
    fn add_entry(&mut self, dv: &mut DataVio, operation: JournalOperation,
                 location: ZonedPbn)
    {
        let needs_block = self.blocks.back()
            .map_or(true, |b| b.entries >= self.entries_per_block);
        if needs_block {
            self.blocks.push_back(JournalBlock {
                sequence: self.next_sequence,
                entries: 0,
                locks: 0,
            });
            self.next_sequence += 1;
            statistics::inc(&self.ctx.stats.journal_blocks_committed);
        }
        let Some(block) = self.blocks.back_mut() else { return };
        block.entries += 1;
        block.locks += 1;
        let entry = JournalEntry {
            sequence: block.sequence,
            operation,
            lbn: dv.logical.lbn,
            pbn: location.pbn,
            state: location.state,
        };
        trace!(?entry, "Journaling");
        self.entries.push_back(entry);
        statistics::inc(&self.ctx.stats.journal_entries_written);
        dv.journal_locks.push(entry.sequence);
        dv.recovery_sequence = entry.sequence;
    }

    fn census(&self) -> usize {
        self.blocks.iter().map(|b| b.locks).sum()
    }

    fn continue_data_vio(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        if ctx.read_only.is_read_only() {
            return dv.fail(ctx, Error::ReadOnly);
        }
        let (next, operation) = match dv.step {
            Step::JournalMappingForWrite => {
                dv.last_async_operation =
                    AsyncOperation::JournalMappingForWrite;
                let new_mapped = dv.new_mapped;
                self.add_entry(&mut dv, JournalOperation::DataIncrement,
                               new_mapped);
                if new_mapped.pbn == ZERO_BLOCK {
                    (Step::ReadOldMappingForWrite,
                     AsyncOperation::GetMappedBlockForWrite)
                } else {
                    (Step::IncrementForWrite,
                     AsyncOperation::JournalIncrementForWrite)
                }
            }
            Step::JournalMappingForDedupe => {
                dv.last_async_operation =
                    AsyncOperation::JournalMappingForDedupe;
                let new_mapped = dv.new_mapped;
                self.add_entry(&mut dv, JournalOperation::DataIncrement,
                               new_mapped);
                (Step::IncrementForDedupe,
                 AsyncOperation::JournalIncrementForDedupe)
            }
            Step::JournalMappingForCompression => {
                dv.last_async_operation =
                    AsyncOperation::JournalMappingForCompression;
                let new_mapped = dv.new_mapped;
                self.add_entry(&mut dv, JournalOperation::DataIncrement,
                               new_mapped);
                (Step::IncrementForCompression,
                 AsyncOperation::JournalIncrementForCompression)
            }
            Step::JournalUnmappingForWrite => {
                dv.last_async_operation =
                    AsyncOperation::JournalUnmappingForWrite;
                let mapped = dv.mapped;
                self.add_entry(&mut dv, JournalOperation::DataDecrement,
                               mapped);
                if mapped.pbn == ZERO_BLOCK {
                    (Step::PutMappedBlockForWrite,
                     AsyncOperation::PutMappedBlockForWrite)
                } else {
                    (Step::DecrementForWrite,
                     AsyncOperation::JournalDecrementForWrite)
                }
            }
            Step::JournalUnmappingForDedupe => {
                dv.last_async_operation =
                    AsyncOperation::JournalUnmappingForDedupe;
                let mapped = dv.mapped;
                self.add_entry(&mut dv, JournalOperation::DataDecrement,
                               mapped);
                if mapped.pbn == ZERO_BLOCK {
                    (Step::PutMappedBlockForDedupe,
                     AsyncOperation::PutMappedBlockForDedupe)
                } else {
                    (Step::DecrementForDedupe,
                     AsyncOperation::JournalDecrementForDedupe)
                }
            }
            _ => return dv.misrouted(ctx, "journal"),
        };
        dv.last_async_operation = operation;
        dv.continue_in(ctx, next);
    }

    /// Drop a finished data_vio's locks, and reap whatever blocks that frees
    fn release(&mut self, mut cleanup: Cleanup<ReleaseJournalLocks>) {
        for sequence in cleanup.data_vio().journal_locks.drain(..) {
            let front = self.blocks.front().map_or(0, |b| b.sequence);
            let block = sequence.checked_sub(front)
                .and_then(|i| self.blocks.get_mut(i as usize));
            match block {
                Some(block) if block.locks > 0 => block.locks -= 1,
                _ => error!(sequence, "Releasing an unheld journal lock"),
            }
        }
        self.reap();
        cleanup.released(&self.ctx);
    }

    fn reap(&mut self) {
        while let Some(block) = self.blocks.front() {
            if block.locks > 0 || block.entries < self.entries_per_block {
                break;
            }
            let reaped = block.sequence;
            self.blocks.pop_front();
            while self.entries.front().is_some_and(|e| e.sequence <= reaped) {
                self.entries.pop_front();
            }
            statistics::inc(&self.ctx.stats.journal_blocks_reaped);
        }
    }
}

impl Zone for RecoveryJournal {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            Message::Cleanup(PendingCleanup::JournalLocks(c)) =>
                self.release(c),
            Message::Query(Query::Census(tx)) => {
                let _ = tx.send(self.census());
            }
            Message::Query(Query::JournalEntries(tx)) => {
                let _ = tx.send(self.entries.iter().copied().collect());
            }
            msg => zone::unexpected(&self.ctx, "journal", msg),
        }
    }
}

// LCOV_EXCL_STOP
