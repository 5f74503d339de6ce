// vim: tw=80
//! Hash locks
//!
//! Every concurrent write of the same data shares one hash lock, so that
//! only one of them (the agent) queries the index, verifies advice or writes
//! the data.  The rest wait, then deduplicate against whatever block the
//! agent settled on.

use crate::{
    data_vio::DataVio,
    pbn_lock::PbnLockHandle,
    types::*,
};
use std::{
    collections::VecDeque,
    fmt,
};

/// Identifies one hash lock.  A record name may be served by several locks
/// over time, so the name alone isn't enough.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct HashLockId(pub u64);

impl fmt::Display for HashLockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HashLockState {
    Initializing,
    /// The agent is asking the index for advice
    Querying,
    /// The agent is read-locking the advised block
    Locking,
    /// The agent is comparing the advised block with its data
    Verifying,
    /// The agent is writing its data to a new block
    Writing,
    /// The agent is recording its new block in the index
    Updating,
    /// Members share `duplicate`
    Deduping,
    /// Dedupe failed; nobody else may join
    Bypassing,
}

pub(crate) struct HashLock {
    pub id: HashLockId,
    pub name: RecordName,
    pub state: HashLockState,
    /// The data every member must match
    data: Box<[u8]>,
    /// The data_vio doing the lock's work.  The agent is never parked in
    /// `waiters`.
    pub agent: DataVioId,
    pub waiters: VecDeque<Box<DataVio>>,
    /// Number of data_vios holding this lock, including the agent
    pub members: usize,
    /// The block which members deduplicate against
    pub duplicate: ZonedPbn,
    /// A read lock on `duplicate`, carrying the lock's claims on it
    pub duplicate_lock: Option<PbnLockHandle>,
}

impl HashLock {
    pub fn new(id: HashLockId, agent: &DataVio, data: &[u8]) -> Self {
        HashLock {
            id,
            name: agent.record_name,
            state: HashLockState::Initializing,
            data: data.into(),
            agent: agent.id,
            waiters: VecDeque::new(),
            members: 1,
            duplicate: ZonedPbn::default(),
            duplicate_lock: None,
        }
    }

    /// Take one reference claim on the duplicate block, if any remain
    pub fn claim(&mut self) -> Option<ZonedPbn> {
        let handle = self.duplicate_lock.as_mut()?;
        if handle.increment_limit == 0 {
            return None;
        }
        handle.increment_limit -= 1;
        Some(self.duplicate)
    }

    /// Can any more members deduplicate against this lock's block?
    pub fn has_claims(&self) -> bool {
        self.duplicate_lock.as_ref()
            .is_some_and(|h| h.increment_limit > 0)
    }

    /// Does `data` match the lock's data?  A mismatch is a hash collision.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.data[..] == data[..]
    }

    /// May a newcomer with the same record name still join?
    pub fn is_joinable(&self) -> bool {
        match self.state {
            HashLockState::Bypassing => false,
            HashLockState::Deduping => self.has_claims(),
            _ => true
        }
    }

    /// Find a waiter which can write, and make it the agent.  `former` is
    /// parked at the head of the queue.  Returns the new agent, or gives
    /// `former` back if no waiter has an allocation.
    pub fn replace_agent(&mut self, former: Box<DataVio>)
        -> std::result::Result<Box<DataVio>, Box<DataVio>>
    {
        let Some(i) = self.waiters.iter().position(|dv| dv.has_allocation())
        else {
            return Err(former);
        };
        let Some(agent) = self.waiters.remove(i) else {
            return Err(former);
        };
        self.waiters.push_front(former);
        self.agent = agent.id;
        Ok(agent)
    }
}

impl fmt::Debug for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HashLock")
            .field("id", &self.id)
            .field("name", &format_args!("{}", self.name))
            .field("state", &self.state)
            .field("agent", &self.agent)
            .field("waiters", &self.waiters.len())
            .field("members", &self.members)
            .field("duplicate", &self.duplicate)
            .finish()
    }
}

// LCOV_EXCL_STOP
