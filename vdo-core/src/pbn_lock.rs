// vim: tw=80
//! Physical block locks
//!
//! A PBN lock prevents the allocator from reusing a block while a data_vio is
//! writing it, and prevents a block from being freed while a hash lock is
//! deduplicating against it.  The locks themselves live in the physical zone
//! which owns the block; everyone else holds a [`PbnLockHandle`].

use crate::types::*;
use std::fmt;
use tracing::warn;

/// The largest number of references a block may carry
pub(crate) const MAXIMUM_REFERENCE_COUNT: u8 = 254;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PbnLockType {
    /// Held by the data_vio writing a newly allocated block
    Write,
    /// Shared by everyone deduplicating against a block
    Read,
}

#[derive(Debug)]
pub(crate) struct PbnLock {
    pub kind: PbnLockType,
    pub holders: u32,
    /// Does this lock own the block's provisional reference?  If so the block
    /// is freed when the lock is released.
    pub provisional: bool,
    /// References which may still be promised to new holders
    pub unpromised: u32,
}

impl PbnLock {
    /// A lock on a freshly allocated block
    pub fn new_write() -> Self {
        PbnLock {
            kind: PbnLockType::Write,
            holders: 1,
            provisional: true,
            unpromised: 0
        }
    }

    pub fn new_read(unpromised: u32) -> Self {
        PbnLock {
            kind: PbnLockType::Read,
            holders: 1,
            provisional: false,
            unpromised
        }
    }

    /// Promise up to `wanted` references to a new holder.  Returns how many
    /// were promised.
    pub fn promise(&mut self, wanted: u32) -> u32 {
        let promised = wanted.min(self.unpromised);
        self.unpromised -= promised;
        promised
    }

    /// Now that the block's data is durable, let others dedupe against it.
    pub fn downgrade(&mut self) {
        debug_assert_ne!(self.kind, PbnLockType::Read,
            "PBN lock is already a read lock");
        self.kind = PbnLockType::Read;
    }

    pub fn is_read(&self) -> bool {
        self.kind == PbnLockType::Read
    }
}

/// One holder's claim on a PBN lock.
///
/// Deliberately not `Clone`: each handle accounts for exactly one holder, and
/// must be returned to the owning physical zone with
/// `Message::ReleasePbnLock`.
pub(crate) struct PbnLockHandle {
    pbn: Pbn,
    zone: ZoneId,
    /// How many more references the holder may add to the block
    pub increment_limit: u32,
    released: bool,
}

impl PbnLockHandle {
    pub fn new(pbn: Pbn, zone: ZoneId, increment_limit: u32) -> Self {
        PbnLockHandle { pbn, zone, increment_limit, released: false }
    }

    pub fn pbn(&self) -> Pbn {
        self.pbn
    }

    /// Retire the handle.  Only the owning physical zone may do this.
    pub fn retire(mut self) -> Pbn {
        self.released = true;
        self.pbn
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }
}

impl fmt::Debug for PbnLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PbnLockHandle")
            .field("pbn", &self.pbn)
            .field("zone", &self.zone)
            .field("increment_limit", &self.increment_limit)
            .finish()
    }
}

impl Drop for PbnLockHandle {
    fn drop(&mut self) {
        if !self.released && !std::thread::panicking() {
            warn!(pbn = self.pbn, zone = self.zone, "PBN lock handle leaked");
        }
    }
}

// LCOV_EXCL_STOP
