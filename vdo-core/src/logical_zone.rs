// vim: tw=80
//! Logical zones
//!
//! A logical zone owns a slice of the LBN space: the LBN locks for it, the
//! block map pages covering it, and the flush generations of the writes
//! running in it.  The zone of an LBN is fixed by its block map page.

use crate::{
    block_map::{BlockMapZone, ENTRIES_PER_PAGE},
    cleanup::{Cleanup, PendingCleanup, ReleaseLogical},
    data_vio::{AsyncOperation, DataVio, DataVioShare, ErrorAction, Step},
    statistics,
    types::*,
    zone::{self, Context, Message, Query, Zone},
};
use futures::channel::oneshot;
use metrohash::MetroBuildHasher;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, error};

/// Number of consecutive allocations a logical zone requests from one
/// physical zone before moving on to the next.
pub const ALLOCATIONS_PER_ZONE: u32 = 128;

/// The logical zone which owns `lbn`
pub fn logical_zone_of(lbn: Lbn, zones: usize) -> ZoneId {
    ((lbn / ENTRIES_PER_PAGE) % zones as u64) as ZoneId
}

/// The lock on one LBN, together with everybody waiting for it
#[derive(Debug)]
struct LbnLock {
    holder: DataVioId,
    holder_writes: bool,
    share: Arc<DataVioShare>,
    waiters: VecDeque<Box<DataVio>>,
}

impl LbnLock {
    fn new(holder: &DataVio) -> Self {
        LbnLock {
            holder: holder.id,
            holder_writes: holder.write,
            share: holder.share.clone(),
            waiters: VecDeque::new(),
        }
    }
}

/// Tracks which writes were started before which flush.
///
/// Every write takes a reference on the current generation.  A flush closes
/// the current generation, and is finished once no write from that or any
/// earlier generation remains.
#[derive(Debug, Default)]
struct FlushGenerations {
    current: u64,
    /// Writes outstanding in each generation
    active: BTreeMap<u64, usize>,
    flushes: VecDeque<(u64, oneshot::Sender<()>)>,
}

impl FlushGenerations {
    fn acquire(&mut self) -> u64 {
        *self.active.entry(self.current).or_default() += 1;
        self.current
    }

    fn flush(&mut self, tx: oneshot::Sender<()>) {
        self.flushes.push_back((self.current, tx));
        self.current += 1;
        self.notify();
    }

    fn notify(&mut self) {
        let oldest = self.active.keys().next().copied();
        while let Some((generation, _)) = self.flushes.front() {
            if oldest.is_some_and(|o| o <= *generation) {
                break;
            }
            if let Some((_, tx)) = self.flushes.pop_front() {
                // The flusher may have given up
                let _ = tx.send(());
            }
        }
    }

    /// Number of writes and flushes outstanding
    fn outstanding(&self) -> usize {
        self.active.values().sum::<usize>() + self.flushes.len()
    }

    fn release(&mut self, generation: u64) {
        match self.active.get_mut(&generation) {
            Some(1) => {
                self.active.remove(&generation);
                self.notify();
            }
            Some(n) => *n -= 1,
            None => error!(generation, "Releasing an unknown flush generation"),
        }
    }
}

pub(crate) struct LogicalZone {
    ctx: Arc<Context>,
    number: ZoneId,
    locks: HashMap<Lbn, LbnLock, MetroBuildHasher>,
    block_map: BlockMapZone,
    flush_generations: FlushGenerations,
    /// Physical zone currently receiving this zone's allocations
    allocation_zone: ZoneId,
    /// Allocations already requested from `allocation_zone`
    allocation_count: u32,
}

impl LogicalZone {
    pub fn new(ctx: Arc<Context>, number: ZoneId) -> Self {
        let allocation_zone = number % ctx.config.physical_zones;
        LogicalZone {
            ctx,
            number,
            locks: HashMap::with_hasher(Default::default()),
            block_map: BlockMapZone::default(),
            flush_generations: FlushGenerations::default(),
            allocation_zone,
            allocation_count: 0,
        }
    }

    /// Take the LBN lock, or wait for it
    fn attempt_logical_block_lock(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        let lbn = dv.logical.lbn;
        if lbn >= ctx.config.logical_blocks {
            return dv.fail(ctx, Error::OutOfRange);
        }
        let Some(lock) = self.locks.get_mut(&lbn) else {
            self.locks.insert(lbn, LbnLock::new(&dv));
            dv.logical.locked = true;
            return self.launch_locked_request(dv);
        };
        if !dv.write && lock.holder_writes {
            if let Some(written) = lock.share.written.get() {
                // Serve the read from the holder's data
                let copied = dv.data.try_mut()
                    .map(|mut buf| buf[..].copy_from_slice(&written[..]));
                return match copied {
                    Ok(()) => {
                        dv.acknowledge(ctx);
                        dv.complete(ctx)
                    }
                    Err(_) => dv.fail(ctx, Error::LockError)
                };
            }
        }
        debug!(id = dv.id, lbn, holder = lock.holder, "Waiting for LBN lock");
        if lock.share.compression.cancel() {
            ctx.send(zone::Target::Packer,
                     Message::RemoveLockHolder(lock.holder));
        }
        lock.waiters.push_back(dv);
    }

    /// Count of locks and parked data_vios
    fn census(&self) -> usize {
        let lbn_locks: usize = self.locks.values()
            .map(|l| 1 + l.waiters.len())
            .sum();
        lbn_locks + self.flush_generations.outstanding()
    }

    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        match dv.step {
            Step::AttemptLogicalBlockLock =>
                self.attempt_logical_block_lock(dv),
            Step::ContinueWithBlockMapSlot =>
                self.continue_with_block_map_slot(dv),
            Step::ReadOldMappingForWrite => self.read_old_mapping(dv,
                AsyncOperation::GetMappedBlockForWrite,
                AsyncOperation::JournalUnmappingForWrite,
                Step::JournalUnmappingForWrite),
            Step::ReadOldMappingForDedupe => self.read_old_mapping(dv,
                AsyncOperation::GetMappedBlockForDedupe,
                AsyncOperation::JournalUnmappingForDedupe,
                Step::JournalUnmappingForDedupe),
            Step::PutMappedBlockForWrite =>
                self.put_mapped_block(dv,
                                      AsyncOperation::PutMappedBlockForWrite),
            Step::PutMappedBlockForDedupe =>
                self.put_mapped_block(dv,
                                      AsyncOperation::PutMappedBlockForDedupe),
            _ => dv.misrouted(&self.ctx, "logical"),
        }
    }

    /// The LBN lock is held and the block map slot located.  Either read
    /// the block, or start writing it.
    fn continue_with_block_map_slot(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        if dv.read {
            dv.last_async_operation = AsyncOperation::GetMappedBlockForRead;
            let location = match self.block_map.get(dv.logical.lbn,
                                                    &ctx.layout)
            {
                Ok(location) => location,
                Err(e) => return dv.abort(ctx, e, ErrorAction::ReadOnly)
            };
            dv.mapped = zoned(ctx, location);
            if location.state.is_mapped() && location.pbn != ZERO_BLOCK {
                dv.last_async_operation = AsyncOperation::ReadDataVio;
                dv.continue_in(ctx, Step::ReadData);
            } else {
                dv.scratch = None;
                dv.continue_in(ctx, Step::CompleteRead);
            }
            return;
        }

        dv.flush_generation = Some(self.flush_generations.acquire());
        if !dv.page_allocated {
            if dv.is_trim {
                // Nothing was ever written here, so there's nothing to trim.
                return dv.complete(ctx);
            }
            return dv.abort(ctx, Error::ReadOnly, ErrorAction::ReadOnly);
        }

        if !dv.is_zero && !dv.is_trim {
            let zone = self.next_allocation_zone();
            dv.allocation.zone = zone;
            dv.allocation.first_zone = zone;
            return dv.continue_in(ctx, Step::AllocateBlock);
        }

        let state = if dv.is_trim {
            MappingState::Unmapped
        } else {
            MappingState::Uncompressed
        };
        dv.new_mapped = ZonedPbn { pbn: ZERO_BLOCK, state, zone: 0 };
        if dv.remaining_discard > BLOCK_SIZE as u64 || dv.fua {
            // Can't acknowledge yet: either more of the discard remains, or
            // the host wants this to be durable first.
            dv.last_async_operation = AsyncOperation::JournalMappingForWrite;
            dv.continue_in(ctx, Step::JournalMappingForWrite);
        } else {
            dv.last_async_operation = AsyncOperation::AcknowledgeWrite;
            dv.continue_in(ctx, Step::AcknowledgeWrite);
        }
    }

    fn launch_locked_request(&mut self, mut dv: Box<DataVio>) {
        dv.last_async_operation = AsyncOperation::FindBlockMapSlot;
        let allocate = dv.write && !dv.is_trim;
        dv.page_allocated = self.block_map.find_slot(dv.logical.lbn,
                                                     allocate);
        self.continue_with_block_map_slot(dv);
    }

    /// Pick the physical zone for the next allocation, round robin
    fn next_allocation_zone(&mut self) -> ZoneId {
        if self.allocation_count == ALLOCATIONS_PER_ZONE {
            self.allocation_count = 0;
            self.allocation_zone = (self.allocation_zone + 1) %
                self.ctx.config.physical_zones;
        }
        self.allocation_count += 1;
        self.allocation_zone
    }

    /// Record the new mapping in the block map
    fn put_mapped_block(&mut self, mut dv: Box<DataVio>,
                        operation: AsyncOperation)
    {
        let ctx = &self.ctx;
        dv.last_async_operation = operation;
        let lbn = dv.logical.lbn;
        let old = match self.block_map.put(lbn, dv.new_mapped.location()) {
            Ok(old) => old,
            Err(e) => return dv.abort(ctx, e, ErrorAction::ReadOnly)
        };
        match (old.state.is_mapped(), dv.new_mapped.state.is_mapped()) {
            (false, true) => statistics::inc(&ctx.stats.logical_blocks_used),
            (true, false) => statistics::dec(&ctx.stats.logical_blocks_used),
            _ => ()
        }
        if dv.hash_lock.is_some() {
            dv.continue_in(ctx, Step::ContinueHashLock);
        } else {
            dv.complete(ctx);
        }
    }

    /// Look up the mapping being replaced
    fn read_old_mapping(&mut self, mut dv: Box<DataVio>,
                        operation: AsyncOperation, next_op: AsyncOperation,
                        next: Step)
    {
        let ctx = &self.ctx;
        dv.last_async_operation = operation;
        match self.block_map.get(dv.logical.lbn, &ctx.layout) {
            Ok(location) => dv.mapped = zoned(ctx, location),
            Err(e) => return dv.abort(ctx, e, ErrorAction::ReadOnly)
        }
        dv.last_async_operation = next_op;
        dv.continue_in(ctx, next);
    }

    /// Release the flush generation and LBN lock.  The lock passes to the
    /// first waiter, if any.
    fn release(&mut self, mut cleanup: Cleanup<ReleaseLogical>) {
        let dv = cleanup.data_vio();
        if let Some(generation) = dv.flush_generation.take() {
            self.flush_generations.release(generation);
        }
        if dv.logical.locked {
            dv.logical.locked = false;
            let (lbn, id) = (dv.logical.lbn, dv.id);
            self.release_lbn_lock(lbn, id);
        }
        cleanup.released(&self.ctx);
    }

    fn release_lbn_lock(&mut self, lbn: Lbn, holder: DataVioId) {
        let Some(lock) = self.locks.get_mut(&lbn) else {
            error!(lbn, holder, "Releasing an LBN lock which isn't held");
            return;
        };
        debug_assert_eq!(lock.holder, holder, "LBN lock held by another");
        let Some(mut next) = lock.waiters.pop_front() else {
            self.locks.remove(&lbn);
            return;
        };
        debug!(lbn, from = holder, to = next.id, "Transferring LBN lock");
        lock.holder = next.id;
        lock.holder_writes = next.write;
        lock.share = next.share.clone();
        if !lock.waiters.is_empty() {
            // The new holder must not sit in the packer while others wait.
            next.share.compression.cancel();
        }
        next.logical.locked = true;
        self.launch_locked_request(next);
    }
}

/// Attach the owning physical zone to a location
fn zoned(ctx: &Context, location: DataLocation) -> ZonedPbn {
    ZonedPbn {
        pbn: location.pbn,
        state: location.state,
        zone: ctx.layout.zone_of(location.pbn),
    }
}

impl Zone for LogicalZone {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            Message::Cleanup(PendingCleanup::Logical(c)) => self.release(c),
            Message::Flush(tx) => self.flush_generations.flush(tx),
            Message::Query(Query::Census(tx)) => {
                let _ = tx.send(self.census());
            }
            Message::Query(Query::Mapping(lbn, tx)) => {
                let _ = tx.send(self.block_map.get(lbn, &self.ctx.layout));
            }
            msg => zone::unexpected(&self.ctx, "logical", msg),
        }
    }
}

impl std::fmt::Debug for LogicalZone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LogicalZone")
            .field("number", &self.number)
            .field("locks", &self.locks.len())
            .field("pages", &self.block_map.pages())
            .finish()
    }
}

// LCOV_EXCL_STOP
