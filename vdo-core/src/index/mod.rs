// vim: tw=80
//! The dedupe index: a mapping from record names to the physical blocks that
//! probably hold matching data.
//!
//! Answers from the index are only advice.  The hash lock always verifies a
//! candidate's contents before sharing it.

use crate::types::*;
use futures::future;
#[cfg(test)] use mockall::automock;
use std::{
    future::Future,
    pin::Pin,
    sync::Mutex,
};

mod lru;

pub use self::lru::LruIndex;

/// Boxed future returned by [`DedupeIndex`] operations
pub type BoxIndexFut<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

#[cfg_attr(test, automock)]
pub trait DedupeIndex: Send + Sync {
    /// Ask where data with this record name was last written.
    fn query(&self, name: &RecordName) -> BoxIndexFut<Option<DataLocation>>;

    /// Record where data with this record name now lives.
    fn update(&self, name: &RecordName, location: DataLocation)
        -> BoxIndexFut<()>;
}

/// In-memory [`DedupeIndex`] with bounded capacity
#[derive(Debug)]
pub struct MemoryIndex {
    inner: Mutex<LruIndex>,
}

impl MemoryIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryIndex { inner: Mutex::new(LruIndex::with_capacity(capacity)) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupeIndex for MemoryIndex {
    fn query(&self, name: &RecordName) -> BoxIndexFut<Option<DataLocation>> {
        let r = self.inner.lock()
            .map(|mut g| g.get(name))
            .map_err(|_| Error::LockError);
        Box::pin(future::ready(r))
    }

    fn update(&self, name: &RecordName, location: DataLocation)
        -> BoxIndexFut<()>
    {
        let r = self.inner.lock()
            .map(|mut g| g.insert(*name, location))
            .map_err(|_| Error::LockError);
        Box::pin(future::ready(r))
    }
}

// LCOV_EXCL_STOP
