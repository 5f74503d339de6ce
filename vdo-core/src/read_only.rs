// vim: tw=80
//! The device-wide read-only latch

use crate::types::*;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tracing::warn;

/// Once a failure makes the metadata untrustworthy, every subsequent write
/// must be refused.  The latch is shared by every zone and is only ever
/// cleared by an explicit administrative action.
#[derive(Debug, Default)]
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    /// The error which first latched the device
    first_error: Mutex<Option<Error>>,
    /// How many times has the device entered read-only mode?
    entries: AtomicU64,
}

impl ReadOnlyNotifier {
    /// Latch the device read-only.  Returns `true` if this call did so.
    pub fn enter(&self, error: Error) -> bool {
        if self.read_only.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.entries.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.first_error.lock() {
            *guard = Some(error);
        }
        warn!(%error, "Entering read-only mode");
        true
    }

    /// The error that caused the current read-only period, if any
    pub fn error(&self) -> Option<Error> {
        self.first_error.lock().ok().and_then(|guard| *guard)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Leave read-only mode.  Never called from the I/O path.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.first_error.lock() {
            *guard = None;
        }
        self.read_only.store(false, Ordering::Release);
    }

    /// Number of times the device has entered read-only mode
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

// LCOV_EXCL_STOP
