// vim: tw=80
//! Hash zones
//!
//! A hash zone owns the hash locks for a fixed share of the record name
//! space, and runs each lock's state machine.  Index queries and updates are
//! spawned as separate tasks; the agent returns to the zone when they
//! complete.

use crate::{
    cleanup::{Cleanup, PendingCleanup, ReleaseHashLock},
    data_vio::{AsyncOperation, DataVio, ErrorAction, Step},
    hash_lock::{HashLock, HashLockId, HashLockState},
    statistics,
    types::*,
    zone::{self, Context, Message, Query, Target, Zone},
};
use metrohash::MetroBuildHasher;
use std::{
    collections::HashMap,
    sync::Arc,
};
use tracing::{debug, error, warn};

pub(crate) struct HashZone {
    ctx: Arc<Context>,
    number: ZoneId,
    locks: HashMap<HashLockId, HashLock, MetroBuildHasher>,
    /// The lock which newcomers with each record name should join
    names: HashMap<RecordName, HashLockId, MetroBuildHasher>,
    next_id: u64,
}

impl HashZone {
    pub fn new(ctx: Arc<Context>, number: ZoneId) -> Self {
        HashZone {
            ctx,
            number,
            locks: HashMap::with_hasher(Default::default()),
            names: HashMap::with_hasher(Default::default()),
            next_id: 0,
        }
    }

    /// Join the lock for the data_vio's record name, or create one
    fn acquire_hash_lock(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = AsyncOperation::AcquireHashLock;
        let buf = match dv.buffer() {
            Ok(buf) => buf,
            Err(e) => return dv.abort(ctx, e, ErrorAction::ReadOnly)
        };
        let existing = self.names.get(&dv.record_name)
            .copied()
            .and_then(|id| self.locks.get_mut(&id))
            .filter(|lock| lock.is_joinable());
        match existing {
            Some(lock) if !lock.matches(&buf[..]) => {
                statistics::inc(&ctx.stats.concurrent_hash_collisions);
                warn!(name = %dv.record_name, lbn = dv.logical.lbn,
                      "Hash collision");
                dv.abort_optimization(ctx);
            }
            Some(lock) => {
                statistics::inc(&ctx.stats.concurrent_data_matches);
                lock.members += 1;
                dv.hash_lock = Some(lock.id);
                if lock.state == HashLockState::Deduping {
                    deduplicate(ctx, lock, dv);
                } else {
                    debug!(id = dv.id, lock = %lock.id, state = ?lock.state,
                           "Waiting for hash lock agent");
                    lock.waiters.push_back(dv);
                }
            }
            None => {
                let id = HashLockId(self.next_id);
                self.next_id += 1;
                let mut lock = HashLock::new(id, &dv, &buf[..]);
                dv.hash_lock = Some(id);
                // A lock which can't be joined stays alive for its members,
                // but newcomers get this one.
                self.names.insert(dv.record_name, id);
                start_querying(ctx, &mut lock, dv);
                self.locks.insert(id, lock);
            }
        }
    }

    fn census(&self) -> usize {
        self.locks.values().map(|l| 1 + l.waiters.len()).sum()
    }

    /// Run the current step of a data_vio holding one of this zone's locks
    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        if dv.step == Step::AcquireHashLock {
            return self.acquire_hash_lock(dv);
        }
        let lock = dv.hash_lock.and_then(|id| self.locks.get_mut(&id));
        match (dv.step, lock) {
            (Step::ContinueHashLockOnError, None) => {
                // Nothing to clean up in the lock
                let mut dv = dv;
                dv.hash_lock = None;
                dv.complete(ctx)
            }
            (_, None) => missing_lock(ctx, dv, self.number),
            (Step::FinishQuery, Some(lock)) => finish_query(ctx, lock, dv),
            (Step::FinishLockingDuplicate, Some(lock)) =>
                finish_locking(ctx, lock, dv),
            (Step::FinishVerifying, Some(lock)) =>
                finish_verifying(ctx, lock, dv),
            (Step::FinishUpdating, Some(lock)) =>
                finish_updating(ctx, lock, dv),
            (Step::ContinueHashLock, Some(lock)) =>
                continue_hash_lock(ctx, lock, dv),
            (Step::ContinueHashLockOnError, Some(lock)) =>
                continue_on_error(ctx, lock, dv),
            _ => dv.misrouted(ctx, "hash"),
        }
    }

    /// A member is finished with its lock.  The last one out releases the
    /// lock's claim on its duplicate block.
    fn leave(&mut self, id: HashLockId) {
        let Some(lock) = self.locks.get_mut(&id) else {
            error!(lock = %id, zone = self.number,
                   "Leaving a hash lock which doesn't exist");
            return;
        };
        lock.members -= 1;
        if lock.members > 0 {
            return;
        }
        let Some(mut lock) = self.locks.remove(&id) else { return };
        debug_assert!(lock.waiters.is_empty(),
                      "Releasing a hash lock with waiters");
        release_duplicate(&self.ctx, &mut lock);
        if self.names.get(&lock.name) == Some(&id) {
            self.names.remove(&lock.name);
        }
    }

    fn release(&mut self, mut cleanup: Cleanup<ReleaseHashLock>) {
        let ctx = &self.ctx.clone();
        let dv = cleanup.data_vio();
        let handles = [
            dv.compressed_write_lock.take(),
            dv.duplicate_lock.take()
        ];
        for handle in handles.into_iter().flatten() {
            ctx.send(Target::Physical(handle.zone()),
                     Message::ReleasePbnLock(handle));
        }
        if let Some(id) = dv.hash_lock.take() {
            self.leave(id);
        }
        cleanup.released(ctx);
    }
}

/// Take a claim on the lock's block for `dv`, or, if none are left, let it
/// write its own data.  Either way it stays a member until cleanup.
fn deduplicate(ctx: &Context, lock: &mut HashLock, mut dv: Box<DataVio>) {
    match lock.claim() {
        Some(duplicate) => {
            dv.duplicate = duplicate;
            dv.is_duplicate = true;
            dv.share.compression.set_done();
            dv.launch_deduplicate(ctx);
        }
        None => {
            debug!(id = dv.id, lock = %lock.id, "No references left to share");
            dv.launch_compress(ctx);
        }
    }
}

/// The agent is done with the index's advice, one way or another
fn finish_query(ctx: &Arc<Context>, lock: &mut HashLock, mut dv: Box<DataVio>)
{
    let advice = dv.advice.filter(|a| {
        a.state.is_mapped() && ctx.layout.is_data_block(a.pbn)
    });
    match advice {
        Some(advice) => {
            lock.state = HashLockState::Locking;
            dv.duplicate = ZonedPbn {
                pbn: advice.pbn,
                state: advice.state,
                zone: ctx.layout.zone_of(advice.pbn),
            };
            dv.last_async_operation = AsyncOperation::LockDuplicatePbn;
            dv.continue_in(ctx, Step::LockDuplicatePbn);
        }
        None => {
            if dv.advice.is_some() {
                statistics::inc(&ctx.stats.dedupe_advice_stale);
            }
            start_writing(ctx, lock, dv);
        }
    }
}

fn finish_locking(ctx: &Arc<Context>, lock: &mut HashLock,
                  mut dv: Box<DataVio>)
{
    let Some(handle) = dv.duplicate_lock.take() else {
        debug!(id = dv.id, pbn = dv.duplicate.pbn,
               "Advised block can't be shared");
        return start_writing(ctx, lock, dv);
    };
    lock.state = HashLockState::Verifying;
    lock.duplicate = dv.duplicate;
    lock.duplicate_lock = Some(handle);
    dv.last_async_operation = AsyncOperation::VerifyDuplication;
    dv.continue_in(ctx, Step::ReadDuplicate);
}

fn finish_verifying(ctx: &Arc<Context>, lock: &mut HashLock,
                    dv: Box<DataVio>)
{
    if dv.is_duplicate {
        statistics::inc(&ctx.stats.dedupe_advice_valid);
        lock.state = HashLockState::Deduping;
        deduplicate(ctx, lock, dv);
        while let Some(waiter) = lock.waiters.pop_front() {
            deduplicate(ctx, lock, waiter);
        }
    } else {
        statistics::inc(&ctx.stats.dedupe_advice_stale);
        release_duplicate(ctx, lock);
        start_writing(ctx, lock, dv);
    }
}

/// The agent's block is in the index.  Everyone waiting may share it now.
fn finish_updating(ctx: &Context, lock: &mut HashLock, dv: Box<DataVio>) {
    lock.state = HashLockState::Deduping;
    dv.complete(ctx);
    while let Some(waiter) = lock.waiters.pop_front() {
        deduplicate(ctx, lock, waiter);
    }
}

/// A member has finished updating the block map
fn continue_hash_lock(ctx: &Arc<Context>, lock: &mut HashLock,
                      mut dv: Box<DataVio>)
{
    if lock.state != HashLockState::Writing || lock.agent != dv.id {
        return dv.complete(ctx);
    }
    // The agent's data is durable and mapped.  Its lock on the new block
    // becomes the hash lock's.
    lock.duplicate = dv.new_mapped;
    lock.duplicate_lock = if dv.new_mapped.state.is_compressed() {
        dv.compressed_write_lock.take()
    } else if dv.allocation.pbn == dv.new_mapped.pbn {
        dv.allocation.lock.take()
    } else {
        None
    };
    if !ctx.config.deduplication {
        return finish_updating(ctx, lock, dv);
    }
    lock.state = HashLockState::Updating;
    dv.last_async_operation = AsyncOperation::UpdateDedupeIndex;
    let update = ctx.index.update(&lock.name, dv.new_mapped.location());
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = update.await {
            warn!(id = dv.id, %e, "Dedupe index update failed");
        }
        dv.continue_in(&ctx, Step::FinishUpdating);
    });
}

/// A member has failed.  If it was the agent, nobody else will dedupe
/// through this lock.
fn continue_on_error(ctx: &Context, lock: &mut HashLock, dv: Box<DataVio>) {
    let working = !matches!(lock.state,
        HashLockState::Deduping | HashLockState::Bypassing);
    if working && lock.agent == dv.id {
        debug!(lock = %lock.id, id = dv.id, "Hash lock agent failed");
        lock.state = HashLockState::Bypassing;
        release_duplicate(ctx, lock);
        while let Some(waiter) = lock.waiters.pop_front() {
            waiter.launch_compress(ctx);
        }
    }
    dv.complete(ctx)
}

fn missing_lock(ctx: &Context, mut dv: Box<DataVio>, zone: ZoneId) {
    error!(id = dv.id, zone, step = ?dv.step, "data_vio's hash lock is gone");
    dv.hash_lock = None;
    dv.abort(ctx, Error::LockError, ErrorAction::ReadOnly)
}

fn release_duplicate(ctx: &Context, lock: &mut HashLock) {
    if let Some(handle) = lock.duplicate_lock.take() {
        ctx.send(Target::Physical(handle.zone()),
                 Message::ReleasePbnLock(handle));
    }
    lock.duplicate = ZonedPbn::default();
}

/// Start the agent on the lock's work by asking the index for advice
fn start_querying(ctx: &Arc<Context>, lock: &mut HashLock,
                  mut dv: Box<DataVio>)
{
    if !ctx.config.deduplication {
        return start_writing(ctx, lock, dv);
    }
    lock.state = HashLockState::Querying;
    dv.last_async_operation = AsyncOperation::CheckForDuplication;
    let query = ctx.index.query(&dv.record_name);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        dv.advice = match query.await {
            Ok(advice) => advice,
            Err(e) => {
                warn!(id = dv.id, %e, "Dedupe index query failed");
                None
            }
        };
        dv.continue_in(&ctx, Step::FinishQuery);
    });
}

/// No usable duplicate exists, so the agent must write the data.  An agent
/// with nowhere to write hands the job to a waiter which has somewhere.
fn start_writing(ctx: &Context, lock: &mut HashLock, agent: Box<DataVio>) {
    let agent = if agent.has_allocation() {
        Ok(agent)
    } else {
        lock.replace_agent(agent)
    };
    match agent {
        Ok(agent) => {
            lock.state = HashLockState::Writing;
            agent.launch_compress(ctx);
        }
        Err(agent) => {
            debug!(lock = %lock.id, "No member of the hash lock has space");
            lock.state = HashLockState::Bypassing;
            agent.fail(ctx, Error::NoSpace);
            while let Some(waiter) = lock.waiters.pop_front() {
                waiter.fail(ctx, Error::NoSpace);
            }
        }
    }
}

impl Zone for HashZone {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            Message::Cleanup(PendingCleanup::HashLock(c)) => self.release(c),
            Message::Query(Query::Census(tx)) => {
                let _ = tx.send(self.census());
            }
            msg => zone::unexpected(&self.ctx, "hash", msg),
        }
    }
}

impl std::fmt::Debug for HashZone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HashZone")
            .field("number", &self.number)
            .field("locks", &self.locks.len())
            .finish()
    }
}

// LCOV_EXCL_STOP
