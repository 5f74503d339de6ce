// vim: tw=80
//! Physical zones
//!
//! A physical zone owns a set of slabs, and the PBN locks on their blocks.
//! It allocates blocks for new writes and applies every reference count
//! change to its blocks.

use crate::{
    cleanup::{Cleanup, PendingCleanup, ReleaseAllocated},
    data_vio::{AsyncOperation, DataVio, ErrorAction, Step},
    packer::CompressedWrite,
    pbn_lock::{MAXIMUM_REFERENCE_COUNT, PbnLock, PbnLockHandle},
    slab::Slab,
    statistics,
    types::*,
    zone::{self, Context, Message, Query, Zone},
};
use metrohash::MetroBuildHasher;
use std::{
    collections::HashMap,
    sync::Arc,
};
use tracing::{debug, error};

pub(crate) struct PhysicalZone {
    ctx: Arc<Context>,
    number: ZoneId,
    /// This zone's slabs, indexed by their position within the zone
    slabs: Vec<Slab>,
    locks: HashMap<Pbn, PbnLock, MetroBuildHasher>,
    /// The slab currently being allocated from
    allocation_cursor: usize,
}

impl PhysicalZone {
    pub fn new(ctx: Arc<Context>, number: ZoneId) -> Self {
        let layout = &ctx.layout;
        let slabs = layout.slabs_for_zone(number)
            .map(|s| Slab::new(s, layout.slab_range(s)))
            .collect();
        PhysicalZone {
            ctx,
            number,
            slabs,
            locks: HashMap::with_hasher(Default::default()),
            allocation_cursor: 0,
        }
    }

    /// Find a free block and write-lock it
    fn allocate(&mut self) -> Option<Pbn> {
        let n = self.slabs.len();
        for i in 0..n {
            let cursor = (self.allocation_cursor + i) % n;
            if let Some(pbn) = self.slabs[cursor].allocate() {
                self.allocation_cursor = cursor;
                self.locks.insert(pbn, PbnLock::new_write());
                statistics::inc(&self.ctx.stats.data_blocks_used);
                statistics::inc(&self.ctx.stats.blocks_allocated);
                return Some(pbn);
            }
        }
        None
    }

    fn allocate_block(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        if let Some(pbn) = self.allocate() {
            dv.allocation.pbn = pbn;
            dv.allocation.lock = Some(PbnLockHandle::new(pbn, self.number, 0));
            return dv.allocated(ctx);
        }
        let next = (self.number + 1) % ctx.config.physical_zones;
        if next == dv.allocation.first_zone {
            debug!(id = dv.id, lbn = dv.logical.lbn,
                   "No free blocks; trying to deduplicate");
            dv.prepare_for_dedupe(ctx);
        } else {
            debug!(zone = self.number, next, "Physical zone is full");
            dv.allocation.zone = next;
            dv.continue_in(ctx, Step::AllocateBlock);
        }
    }

    fn census(&self) -> usize {
        self.locks.len()
    }

    fn compressed_write_done(&mut self, write: CompressedWrite) {
        let ctx = &self.ctx.clone();
        let fragments = write.fragments;
        let n = fragments.len() as u32;
        let Some(pbn) = fragments.first().map(|dv| dv.allocation.pbn) else {
            return;
        };
        let Some(lock) = self.locks.get_mut(&pbn) else {
            error!(pbn, "Compressed block is not locked");
            for dv in fragments {
                dv.abort(ctx, Error::LockError, ErrorAction::ReadOnly);
            }
            return;
        };
        // Every fragment will add its own reference.  What remains is shared
        // out for deduplication against the fragments.
        lock.downgrade();
        lock.holders = n;
        lock.unpromised = 0;
        let available = u32::from(MAXIMUM_REFERENCE_COUNT) - n;
        let (each, extra) = (available / n, available % n);
        for (i, mut dv) in fragments.into_iter().enumerate() {
            let handle = if i == 0 {
                dv.allocation.lock.take().map(|mut h| {
                    h.increment_limit = each + extra;
                    h
                })
            } else {
                Some(PbnLockHandle::new(pbn, self.number, each))
            };
            dv.compressed_write_lock = handle;
            dv.continue_write_after_compression(ctx);
        }
    }

    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        match dv.step {
            Step::AllocateBlock => self.allocate_block(dv),
            Step::IncrementForWrite => self.increment_for_write(dv),
            Step::DecrementForWrite => self.decrement(dv,
                AsyncOperation::JournalDecrementForWrite,
                Step::PutMappedBlockForWrite),
            Step::DecrementForDedupe => self.decrement_for_dedupe(dv),
            Step::IncrementForDedupe => self.increment(dv,
                AsyncOperation::JournalIncrementForDedupe),
            Step::IncrementForCompression => self.increment(dv,
                AsyncOperation::JournalIncrementForCompression),
            Step::LockDuplicatePbn => self.lock_duplicate_pbn(dv),
            _ => dv.misrouted(&self.ctx, "physical"),
        }
    }

    /// Remove the old mapping's reference
    fn decrement(&mut self, mut dv: Box<DataVio>, operation: AsyncOperation,
                 next: Step)
    {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = operation;
        let pbn = dv.mapped.pbn;
        let sequence = dv.recovery_sequence;
        match self.modify_reference(pbn, false, sequence) {
            Ok(()) => dv.continue_in(ctx, next),
            Err(e) => dv.abort(ctx, e, ErrorAction::ReadOnly),
        }
    }

    fn decrement_for_dedupe(&mut self, mut dv: Box<DataVio>) {
        if dv.allocation.pbn == dv.mapped.pbn {
            // Release our write lock first, so the block can't be reallocated
            // while still write locked.
            if let Some(handle) = dv.allocation.lock.take() {
                self.release_lock(handle);
            }
        }
        self.decrement(dv, AsyncOperation::JournalDecrementForDedupe,
                       Step::PutMappedBlockForDedupe)
    }

    /// Add the new mapping's reference, for dedupe or compression
    fn increment(&mut self, mut dv: Box<DataVio>, operation: AsyncOperation) {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = operation;
        let pbn = dv.new_mapped.pbn;
        let sequence = dv.recovery_sequence;
        if let Err(e) = self.modify_reference(pbn, true, sequence) {
            return dv.abort(ctx, e, ErrorAction::ReadOnly);
        }
        dv.last_async_operation = AsyncOperation::GetMappedBlockForDedupe;
        dv.continue_in(ctx, Step::ReadOldMappingForDedupe);
    }

    /// The data has been written.  Let others dedupe against it and add its
    /// reference.
    fn increment_for_write(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = AsyncOperation::JournalIncrementForWrite;
        let pbn = dv.allocation.pbn;
        match self.locks.get_mut(&pbn) {
            Some(lock) if !lock.is_read() => lock.downgrade(),
            _ => {
                error!(id = dv.id, pbn, "Allocated block is not write locked");
                return dv.abort(ctx, Error::LockError, ErrorAction::ReadOnly);
            }
        }
        if let Some(handle) = dv.allocation.lock.as_mut() {
            // The write itself takes one reference
            handle.increment_limit = u32::from(MAXIMUM_REFERENCE_COUNT) - 1;
        }
        let sequence = dv.recovery_sequence;
        if let Err(e) = self.modify_reference(pbn, true, sequence) {
            return dv.abort(ctx, e, ErrorAction::ReadOnly);
        }
        dv.last_async_operation = AsyncOperation::GetMappedBlockForWrite;
        dv.continue_in(ctx, Step::ReadOldMappingForWrite);
    }

    /// Read-lock a dedupe candidate so it can't change while it's verified
    fn lock_duplicate_pbn(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = AsyncOperation::LockDuplicatePbn;
        let pbn = dv.duplicate.pbn;
        match self.read_lock(pbn) {
            Ok(handle) => {
                dv.duplicate_lock = handle;
                dv.continue_in(ctx, Step::FinishLockingDuplicate);
            }
            Err(e) => dv.abort(ctx, e, ErrorAction::ReadOnly),
        }
    }

    /// Apply one reference count change
    fn modify_reference(&mut self, pbn: Pbn, increment: bool,
                        sequence: SequenceNumber) -> Result<()>
    {
        let i = self.slab_index(pbn)?;
        let lock = self.locks.get_mut(&pbn);
        let slab = &mut self.slabs[i];
        if increment {
            if slab.increment(pbn, lock, sequence)? {
                statistics::inc(&self.ctx.stats.data_blocks_used);
            }
        } else if slab.decrement(pbn, lock, sequence)? {
            statistics::dec(&self.ctx.stats.data_blocks_used);
        }
        Ok(())
    }

    /// Take a read lock on `pbn`, sharing any existing read lock.  Returns
    /// `None` if the block is being written or can take no more references.
    fn read_lock(&mut self, pbn: Pbn) -> Result<Option<PbnLockHandle>> {
        let i = self.slab_index(pbn)?;
        let available = self.slabs[i].available_references(pbn);
        let limit = match self.locks.get_mut(&pbn) {
            Some(lock) if lock.is_read() => {
                let limit = lock.promise(available);
                if limit > 0 {
                    lock.holders += 1;
                }
                limit
            }
            Some(_) => 0,
            None if available == 0 => 0,
            None => {
                let mut lock = PbnLock::new_read(available);
                // An unreferenced block must not be allocated while it is
                // verified.
                if self.slabs[i].provisionally_reference(pbn)? {
                    lock.provisional = true;
                    statistics::inc(&self.ctx.stats.data_blocks_used);
                }
                let limit = lock.promise(available);
                self.locks.insert(pbn, lock);
                limit
            }
        };
        Ok((limit > 0).then(|| PbnLockHandle::new(pbn, self.number, limit)))
    }

    fn reference_count(&self, pbn: Pbn) -> Option<u8> {
        let i = self.slab_index(pbn).ok()?;
        self.slabs[i].reference_count(pbn)
    }

    /// Give up one holder's share of a lock.  The last holder frees a
    /// provisionally referenced block.
    fn release_lock(&mut self, handle: PbnLockHandle) {
        let unused = handle.increment_limit;
        let pbn = handle.retire();
        let Some(lock) = self.locks.get_mut(&pbn) else {
            error!(pbn, zone = self.number, "Releasing an unlocked PBN");
            return;
        };
        lock.unpromised += unused;
        lock.holders -= 1;
        if lock.holders > 0 {
            return;
        }
        let provisional = lock.provisional;
        self.locks.remove(&pbn);
        if provisional {
            if let Ok(i) = self.slab_index(pbn) {
                if self.slabs[i].release_provisional(pbn) {
                    statistics::dec(&self.ctx.stats.data_blocks_used);
                }
            }
        }
    }

    fn release_allocated(&mut self, mut cleanup: Cleanup<ReleaseAllocated>) {
        if let Some(handle) = cleanup.data_vio().allocation.lock.take() {
            self.release_lock(handle);
        }
        cleanup.released(&self.ctx);
    }

    /// Position within `self.slabs` of the slab holding `pbn`
    fn slab_index(&self, pbn: Pbn) -> Result<usize> {
        let layout = &self.ctx.layout;
        let Some(slab) = layout.slab_of(pbn) else {
            error!(pbn, "Not a data block");
            return Err(Error::BadMapping);
        };
        if layout.zone_of(pbn) != self.number {
            error!(pbn, zone = self.number, "PBN belongs to another zone");
            return Err(Error::LockError);
        }
        Ok(layout.zone_index_of_slab(slab))
    }
}

impl Zone for PhysicalZone {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            Message::Cleanup(PendingCleanup::Allocated(c)) =>
                self.release_allocated(c),
            Message::ReleasePbnLock(handle) => self.release_lock(handle),
            Message::CompressedWriteDone(write) =>
                self.compressed_write_done(write),
            Message::Query(Query::Census(tx)) => {
                let _ = tx.send(self.census());
            }
            Message::Query(Query::ReferenceCount(pbn, tx)) => {
                let _ = tx.send(self.reference_count(pbn));
            }
            msg => zone::unexpected(&self.ctx, "physical", msg),
        }
    }
}

// LCOV_EXCL_STOP
