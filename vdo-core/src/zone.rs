// vim: tw=80
//! Zones and the messages passed between them
//!
//! Every zone is a single tokio task draining one unbounded channel.  All of
//! a zone's state is owned by that task, so no zone state is ever locked.
//! Work moves between zones only by sending a [`Message`].

use crate::{
    cleanup::PendingCleanup,
    config::VdoConfig,
    data_vio::DataVio,
    data_vio_pool::DataVioPool,
    device::BlockDevice,
    index::DedupeIndex,
    packer::CompressedWrite,
    pbn_lock::PbnLockHandle,
    read_only::ReadOnlyNotifier,
    recovery_journal::JournalEntry,
    slab::SlabLayout,
    statistics::Statistics,
    types::*,
};
use futures::channel::oneshot;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Where a message should be delivered
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Target {
    Logical(ZoneId),
    Physical(ZoneId),
    Hash(ZoneId),
    Journal,
    Packer,
    Cpu,
    Ack,
    Bio,
}

/// Administrative questions a zone can answer about its own state
#[derive(Debug)]
pub(crate) enum Query {
    /// How many locks and parked requests does the zone hold?
    Census(oneshot::Sender<usize>),
    JournalEntries(oneshot::Sender<Vec<JournalEntry>>),
    ReferenceCount(Pbn, oneshot::Sender<Option<u8>>),
    Mapping(Lbn, oneshot::Sender<Result<DataLocation>>),
}

#[derive(Debug)]
pub(crate) enum Message {
    /// Run the data_vio's next step
    Continue(Box<DataVio>),
    /// Run one stage of a data_vio's cleanup
    Cleanup(PendingCleanup),
    /// Give up one holder's share of a PBN lock
    ReleasePbnLock(PbnLockHandle),
    /// A compressed block has been written
    CompressedWriteDone(CompressedWrite),
    /// Write a packed compressed block
    WriteCompressed(CompressedWrite),
    /// Evict a data_vio from the packer
    RemoveLockHolder(DataVioId),
    /// Write every partially filled packer bin
    FlushPacker,
    /// Report once every write of an earlier flush generation is finished
    Flush(oneshot::Sender<()>),
    Query(Query),
    Shutdown,
}

/// The senders for every zone's queue
#[derive(Debug)]
pub(crate) struct Router {
    logical: Vec<mpsc::UnboundedSender<Message>>,
    physical: Vec<mpsc::UnboundedSender<Message>>,
    hash: Vec<mpsc::UnboundedSender<Message>>,
    journal: mpsc::UnboundedSender<Message>,
    packer: mpsc::UnboundedSender<Message>,
    cpu: mpsc::UnboundedSender<Message>,
    ack: mpsc::UnboundedSender<Message>,
    bio: mpsc::UnboundedSender<Message>,
}

/// The receiving ends of the [`Router`]'s queues, one for each zone task
#[derive(Debug)]
pub(crate) struct Receivers {
    pub logical: Vec<mpsc::UnboundedReceiver<Message>>,
    pub physical: Vec<mpsc::UnboundedReceiver<Message>>,
    pub hash: Vec<mpsc::UnboundedReceiver<Message>>,
    pub journal: mpsc::UnboundedReceiver<Message>,
    pub packer: mpsc::UnboundedReceiver<Message>,
    pub cpu: mpsc::UnboundedReceiver<Message>,
    pub ack: mpsc::UnboundedReceiver<Message>,
    pub bio: mpsc::UnboundedReceiver<Message>,
}

impl Router {
    pub fn new(config: &VdoConfig) -> (Router, Receivers) {
        fn many(n: usize) -> (Vec<mpsc::UnboundedSender<Message>>,
                              Vec<mpsc::UnboundedReceiver<Message>>)
        {
            (0..n).map(|_| mpsc::unbounded_channel()).unzip()
        }
        let (logical, logical_rx) = many(config.logical_zones);
        let (physical, physical_rx) = many(config.physical_zones);
        let (hash, hash_rx) = many(config.hash_zones);
        let (journal, journal_rx) = mpsc::unbounded_channel();
        let (packer, packer_rx) = mpsc::unbounded_channel();
        let (cpu, cpu_rx) = mpsc::unbounded_channel();
        let (ack, ack_rx) = mpsc::unbounded_channel();
        let (bio, bio_rx) = mpsc::unbounded_channel();
        let router = Router {
            logical, physical, hash, journal, packer, cpu, ack, bio
        };
        let receivers = Receivers {
            logical: logical_rx,
            physical: physical_rx,
            hash: hash_rx,
            journal: journal_rx,
            packer: packer_rx,
            cpu: cpu_rx,
            ack: ack_rx,
            bio: bio_rx,
        };
        (router, receivers)
    }

    /// Every zone which owns locks or parked requests
    pub fn stateful_targets(&self) -> Vec<Target> {
        let logical = (0..self.logical.len()).map(Target::Logical);
        let physical = (0..self.physical.len()).map(Target::Physical);
        let hash = (0..self.hash.len()).map(Target::Hash);
        logical.chain(physical)
            .chain(hash)
            .chain([Target::Journal, Target::Packer])
            .collect()
    }

    pub fn logical_zones(&self) -> usize {
        self.logical.len()
    }

    fn sender(&self, target: Target) -> Option<&mpsc::UnboundedSender<Message>>
    {
        match target {
            Target::Logical(z) => self.logical.get(z),
            Target::Physical(z) => self.physical.get(z),
            Target::Hash(z) => self.hash.get(z),
            Target::Journal => Some(&self.journal),
            Target::Packer => Some(&self.packer),
            Target::Cpu => Some(&self.cpu),
            Target::Ack => Some(&self.ack),
            Target::Bio => Some(&self.bio),
        }
    }

    /// Deliver a message.  If the zone is gone, the message is dropped, and
    /// with it any reply channel it carried.
    pub fn send(&self, target: Target, msg: Message) {
        match self.sender(target) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!(?target, "Zone is already shut down");
                }
            }
            None => warn!(?target, "No such zone"),
        }
    }

    /// Tell every zone to stop
    pub fn shutdown(&self) {
        let all = self.logical.iter()
            .chain(self.physical.iter())
            .chain(self.hash.iter())
            .chain([&self.journal, &self.packer, &self.cpu, &self.ack,
                    &self.bio]);
        for tx in all {
            // A zone which is already gone needs no telling
            let _ = tx.send(Message::Shutdown);
        }
    }
}

/// State shared by every zone
pub(crate) struct Context {
    pub config: VdoConfig,
    pub layout: SlabLayout,
    pub router: Router,
    pub read_only: ReadOnlyNotifier,
    pub stats: Statistics,
    pub device: Arc<dyn BlockDevice>,
    pub index: Arc<dyn DedupeIndex>,
    pub pool: Arc<DataVioPool>,
    compressing: AtomicBool,
    next_id: AtomicU64,
    /// Number of flushes or drains in progress.  While nonzero, the packer
    /// doesn't hold fragments waiting for company.
    flushing: AtomicUsize,
}

impl Context {
    pub fn new(config: VdoConfig, router: Router,
               device: Arc<dyn BlockDevice>, index: Arc<dyn DedupeIndex>)
        -> Self
    {
        let layout = SlabLayout::new(&config);
        let pool = Arc::new(DataVioPool::new(config.pool_size,
                                             config.discard_limit()));
        let compressing = AtomicBool::new(config.compression);
        Context {
            config,
            layout,
            router,
            read_only: ReadOnlyNotifier::default(),
            stats: Statistics::default(),
            device,
            index,
            pool,
            compressing,
            next_id: AtomicU64::new(0),
            flushing: AtomicUsize::new(0),
        }
    }

    /// Allocate an identifier for a new launch of a data_vio
    pub fn next_id(&self) -> DataVioId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_compressing(&self) -> bool {
        self.compressing.load(Ordering::Relaxed)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire) > 0
    }

    pub fn send(&self, target: Target, msg: Message) {
        self.router.send(target, msg)
    }

    /// Returns the previous setting
    pub fn set_compressing(&self, enable: bool) -> bool {
        self.compressing.swap(enable, Ordering::Relaxed)
    }

    /// Mark a flush as in progress until the returned guard is dropped
    pub fn start_flushing(self: &Arc<Self>) -> FlushingGuard {
        self.flushing.fetch_add(1, Ordering::AcqRel);
        FlushingGuard(self.clone())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct FlushingGuard(Arc<Context>);

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        self.0.flushing.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A single-threaded execution context
pub(crate) trait Zone: Send + 'static {
    fn handle(&mut self, msg: Message);
}

/// Deal with a message sent to a zone which has no use for it
pub(crate) fn unexpected(ctx: &Context, zone: &'static str, msg: Message) {
    match msg {
        Message::Continue(dv) => dv.misrouted(ctx, zone),
        msg => error!(zone, ?msg, "Unexpected message"),
    }
}

/// Drive a zone until it's told to shut down
pub(crate) async fn run<Z: Zone>(mut zone: Z,
                                 mut rx: mpsc::UnboundedReceiver<Message>)
{
    while let Some(msg) = rx.recv().await {
        if let Message::Shutdown = msg {
            break;
        }
        zone.handle(msg);
    }
}

// LCOV_EXCL_STOP
