// vim: tw=80
//! Releasing a finished data_vio's locks
//!
//! Locks must be released in a fixed order: the allocation, then the
//! recovery journal locks, then the hash lock, then the logical lock.
//! Releasing the logical lock may hand this data_vio's buffer to a waiting
//! reader, so everything else must be gone by then.
//!
//! The order is encoded in the types.  A [`Cleanup`] in one stage can only
//! become a `Cleanup` in the following stage, and only the zone owning a
//! stage's lock ever receives a `Cleanup` in that stage.

use crate::{
    data_vio::DataVio,
    types::*,
    zone::{Context, Message, Target},
};
use std::marker::PhantomData;

#[derive(Debug)]
pub(crate) enum ReleaseAllocated {}
#[derive(Debug)]
pub(crate) enum ReleaseJournalLocks {}
#[derive(Debug)]
pub(crate) enum ReleaseHashLock {}
#[derive(Debug)]
pub(crate) enum ReleaseLogical {}
#[derive(Debug)]
pub(crate) enum Done {}

/// A data_vio part way through cleanup
#[derive(Debug)]
pub(crate) struct Cleanup<S> {
    data_vio: Box<DataVio>,
    _stage: PhantomData<S>,
}

/// A cleanup stage which must run in some particular zone
#[derive(Debug)]
pub(crate) enum PendingCleanup {
    Allocated(Cleanup<ReleaseAllocated>),
    JournalLocks(Cleanup<ReleaseJournalLocks>),
    HashLock(Cleanup<ReleaseHashLock>),
    Logical(Cleanup<ReleaseLogical>),
}

/// Start releasing a completed data_vio's locks
pub(crate) fn begin(ctx: &Context, data_vio: Box<DataVio>) {
    Cleanup::<ReleaseAllocated>::new(data_vio).perform(ctx)
}

impl<S> Cleanup<S> {
    fn advance<T>(self) -> Cleanup<T> {
        Cleanup { data_vio: self.data_vio, _stage: PhantomData }
    }

    pub fn data_vio(&mut self) -> &mut DataVio {
        &mut self.data_vio
    }
}

impl Cleanup<ReleaseAllocated> {
    fn new(data_vio: Box<DataVio>) -> Self {
        Cleanup { data_vio, _stage: PhantomData }
    }

    fn next(self) -> Cleanup<ReleaseJournalLocks> {
        self.advance()
    }

    fn perform(self, ctx: &Context) {
        if self.data_vio.allocation.lock.is_some() {
            let zone = self.data_vio.allocation.zone;
            let msg = Message::Cleanup(PendingCleanup::Allocated(self));
            ctx.send(Target::Physical(zone), msg);
        } else {
            self.next().perform(ctx)
        }
    }

    /// The allocation lock has been released
    pub fn released(self, ctx: &Context) {
        debug_assert!(self.data_vio.allocation.lock.is_none());
        self.next().perform(ctx)
    }
}

impl Cleanup<ReleaseJournalLocks> {
    fn next(self) -> Cleanup<ReleaseHashLock> {
        self.advance()
    }

    fn perform(self, ctx: &Context) {
        if self.data_vio.journal_locks.is_empty() {
            self.next().perform(ctx)
        } else {
            let msg = Message::Cleanup(PendingCleanup::JournalLocks(self));
            ctx.send(Target::Journal, msg);
        }
    }

    pub fn released(self, ctx: &Context) {
        debug_assert!(self.data_vio.journal_locks.is_empty());
        self.next().perform(ctx)
    }
}

impl Cleanup<ReleaseHashLock> {
    fn next(self) -> Cleanup<ReleaseLogical> {
        self.advance()
    }

    fn perform(self, ctx: &Context) {
        let dv = &self.data_vio;
        if dv.hash_lock.is_some() || dv.compressed_write_lock.is_some() ||
            dv.duplicate_lock.is_some()
        {
            let zone = dv.hash_zone;
            let msg = Message::Cleanup(PendingCleanup::HashLock(self));
            ctx.send(Target::Hash(zone), msg);
        } else {
            self.next().perform(ctx)
        }
    }

    pub fn released(self, ctx: &Context) {
        debug_assert!(self.data_vio.hash_lock.is_none() &&
                      self.data_vio.compressed_write_lock.is_none());
        self.next().perform(ctx)
    }
}

impl Cleanup<ReleaseLogical> {
    fn next(self) -> Cleanup<Done> {
        self.advance()
    }

    fn perform(self, ctx: &Context) {
        let dv = &self.data_vio;
        if dv.logical.locked || dv.flush_generation.is_some() {
            let zone = dv.logical.zone;
            let msg = Message::Cleanup(PendingCleanup::Logical(self));
            ctx.send(Target::Logical(zone), msg);
        } else {
            self.next().finish(ctx)
        }
    }

    pub fn released(self, ctx: &Context) {
        debug_assert!(!self.data_vio.logical.locked);
        self.next().finish(ctx)
    }
}

impl Cleanup<Done> {
    /// Every lock is gone.  Either move on to the next block of a discard,
    /// or tell the host and return the data_vio to the pool.
    fn finish(self, ctx: &Context) {
        let mut dv = self.data_vio;
        debug_assert!(dv.allocation.lock.is_none(),
            "data_vio finished with an allocation lock");
        debug_assert!(dv.hash_lock.is_none(),
            "data_vio finished with a hash lock");
        debug_assert!(!dv.logical.locked,
            "data_vio finished with a logical lock");
        debug_assert!(dv.duplicate_lock.is_none() &&
                      dv.compressed_write_lock.is_none(),
            "data_vio finished with a PBN lock");
        if dv.result.is_ok() && dv.remaining_discard > BLOCK_SIZE as u64 {
            return dv.relaunch_discard(ctx);
        }
        dv.acknowledge(ctx);
        // Dropping the data_vio returns its permit to the pool
    }
}

// LCOV_EXCL_STOP
