// vim: tw=80
//! The public face of the engine
//!
//! A [`Vdo`] owns every zone task.  Host requests enter through
//! [`Vdo::submit`] and its helpers; everything else here is administration.

use crate::{
    ack_zone::AckZone,
    bio::{Bio, Operation, Reply},
    config::VdoConfig,
    cpu_zone::CpuZone,
    data_vio::DataVio,
    device::{BlockDevice, MemoryDevice},
    hash_zone::HashZone,
    index::{DedupeIndex, MemoryIndex},
    logical_zone::{LogicalZone, logical_zone_of},
    packer::Packer,
    physical_zone::PhysicalZone,
    recovery_journal::{JournalEntry, RecoveryJournal},
    statistics::VdoStatistics,
    submitter::Submitter,
    types::*,
    zone::{self, Context, Message, Query, Router, Target},
};
use divbuf::DivBufShared;
use futures::{channel::oneshot, future};
use std::{mem, sync::Arc};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{error, info, instrument};

/// A running VDO: a deduplicating, compressing virtual block device
pub struct Vdo {
    ctx: Arc<Context>,
    tasks: Vec<JoinHandle<()>>,
}

impl Vdo {
    /// Start a VDO on `device`, using `index` for dedupe advice.
    ///
    /// Must be called from within a Tokio runtime, which will run the
    /// zones.
    pub fn create(config: VdoConfig, device: Arc<dyn BlockDevice>,
                  index: Arc<dyn DedupeIndex>) -> Result<Self>
    {
        config.validate()?;
        if device.size() < config.physical_blocks {
            error!(device_blocks = device.size(),
                   physical_blocks = config.physical_blocks,
                   "Device is too small for the configuration");
            return Err(Error::BadConfiguration);
        }
        let handle = Handle::try_current().map_err(|e| {
            error!("Cannot start a VDO outside of a Tokio runtime: {e}");
            Error::BadConfiguration
        })?;
        let (router, rx) = Router::new(&config);
        let ctx = Arc::new(Context::new(config, router, device, index));

        let mut tasks = Vec::new();
        for (number, rx) in rx.logical.into_iter().enumerate() {
            let zone = LogicalZone::new(ctx.clone(), number);
            tasks.push(handle.spawn(zone::run(zone, rx)));
        }
        for (number, rx) in rx.physical.into_iter().enumerate() {
            let zone = PhysicalZone::new(ctx.clone(), number);
            tasks.push(handle.spawn(zone::run(zone, rx)));
        }
        for (number, rx) in rx.hash.into_iter().enumerate() {
            let zone = HashZone::new(ctx.clone(), number);
            tasks.push(handle.spawn(zone::run(zone, rx)));
        }
        let journal = RecoveryJournal::new(ctx.clone());
        tasks.push(handle.spawn(zone::run(journal, rx.journal)));
        let packer = Packer::new(ctx.clone());
        tasks.push(handle.spawn(zone::run(packer, rx.packer)));
        let cpu = CpuZone::new(ctx.clone());
        tasks.push(handle.spawn(zone::run(cpu, rx.cpu)));
        let ack = AckZone::new(ctx.clone());
        tasks.push(handle.spawn(zone::run(ack, rx.ack)));
        let submitter = Submitter::new(ctx.clone());
        tasks.push(handle.spawn(zone::run(submitter, rx.bio)));

        info!(logical_blocks = ctx.config.logical_blocks,
              physical_blocks = ctx.config.physical_blocks,
              zones = tasks.len(),
              "Started VDO");
        Ok(Vdo { ctx, tasks })
    }

    /// Start a VDO on RAM, with a RAM dedupe index.  The device is returned
    /// too, for inspection.
    pub fn create_in_memory(config: VdoConfig)
        -> Result<(Self, Arc<MemoryDevice>)>
    {
        let device = Arc::new(MemoryDevice::new(config.physical_blocks));
        let index = Arc::new(MemoryIndex::with_capacity(config.index_capacity));
        let vdo = Vdo::create(config, device.clone(), index)?;
        Ok((vdo, device))
    }

    pub fn config(&self) -> &VdoConfig {
        &self.ctx.config
    }

    /// Run one host request to completion.  Reads return the block's
    /// contents.
    pub async fn submit(&self, bio: Bio) -> Reply {
        bio.validate(self.ctx.config.logical_blocks)?;
        let (op, fua) = (bio.op, bio.fua);
        self.ctx.stats.bios_in.count(op, fua);
        if bio.is_partial() {
            self.ctx.stats.bios_in_partial.count(op, fua);
        }
        let discard = op == Operation::Discard;
        let permit = match self.ctx.pool.try_acquire(discard) {
            Some(permit) => permit,
            None => {
                // Requests parked in the packer may be what we're waiting on
                self.ctx.send(Target::Packer, Message::FlushPacker);
                self.ctx.pool.acquire(discard).await?
            }
        };
        let (tx, rx) = oneshot::channel();
        DataVio::new(&self.ctx, bio, tx, permit).launch(&self.ctx);
        let reply = rx.await.map_err(|_| Error::ShuttingDown)??;
        if fua && op != Operation::Read {
            self.ctx.device.flush().await?;
        }
        Ok(reply)
    }

    pub async fn read(&self, lbn: Lbn) -> Result<DivBufShared> {
        self.submit(Bio::read(lbn)).await?
            .ok_or(Error::Unknown)
    }

    /// Write one whole block
    pub async fn write(&self, lbn: Lbn, data: IoVec) -> Result<()> {
        self.submit(Bio::write(lbn, data)).await.map(drop)
    }

    /// Write part of a block, preserving the rest of its contents
    pub async fn write_partial(&self, lbn: Lbn, offset: usize, data: IoVec)
        -> Result<()>
    {
        self.submit(Bio::write_partial(lbn, offset, data)).await.map(drop)
    }

    pub async fn discard(&self, lbn: Lbn, blocks: u64) -> Result<()> {
        self.submit(Bio::discard(lbn, blocks)).await.map(drop)
    }

    /// Wait for every write which was acknowledged before this call to be
    /// finished, then make the device durable.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        self.ctx.stats.bios_in.count_flush();
        let _flushing = self.ctx.start_flushing();
        self.ctx.send(Target::Packer, Message::FlushPacker);
        let generations = (0..self.ctx.router.logical_zones())
            .map(|zone| {
                let (tx, rx) = oneshot::channel();
                self.ctx.send(Target::Logical(zone), Message::Flush(tx));
                rx
            }).collect::<Vec<_>>();
        future::try_join_all(generations).await
            .map_err(|_| Error::ShuttingDown)?;
        self.ctx.device.flush().await?;
        self.ctx.stats.bios_acknowledged.count_flush();
        Ok(())
    }

    /// Wait until no request is in flight
    #[instrument(skip(self))]
    pub async fn drain(&self) {
        let _flushing = self.ctx.start_flushing();
        self.ctx.send(Target::Packer, Message::FlushPacker);
        self.ctx.pool.drain().await
    }

    pub fn statistics(&self) -> VdoStatistics {
        self.ctx.stats.snapshot(self.ctx.read_only.entries())
    }

    /// Turn compression on or off.  Returns the previous setting.
    pub fn set_compression(&self, enable: bool) -> bool {
        let was = self.ctx.set_compressing(enable);
        if was && !enable {
            self.ctx.send(Target::Packer, Message::FlushPacker);
        }
        was
    }

    pub fn is_read_only(&self) -> bool {
        self.ctx.read_only.is_read_only()
    }

    /// The error which made the VDO read-only, if any
    pub fn read_only_error(&self) -> Option<Error> {
        self.ctx.read_only.error()
    }

    /// Accept writes again after the cause of a read-only error has been
    /// dealt with out of band.
    pub fn clear_read_only(&self) {
        self.ctx.read_only.clear()
    }

    /// Most requests ever in flight at once
    pub fn max_active_requests(&self) -> usize {
        self.ctx.pool.max_active()
    }

    async fn query<T>(&self, target: Target,
                      q: impl FnOnce(oneshot::Sender<T>) -> Query)
        -> Result<T>
    {
        let (tx, rx) = oneshot::channel();
        self.ctx.send(target, Message::Query(q(tx)));
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Total locks and parked requests held by every zone.  Zero once the
    /// VDO is idle.
    pub async fn census(&self) -> Result<usize> {
        let counts = self.ctx.router.stateful_targets()
            .into_iter()
            .map(|target| self.query(target, Query::Census));
        Ok(future::try_join_all(counts).await?.into_iter().sum())
    }

    /// Where `lbn` is currently mapped
    pub async fn mapping(&self, lbn: Lbn) -> Result<DataLocation> {
        if lbn >= self.ctx.config.logical_blocks {
            return Err(Error::OutOfRange);
        }
        let zone = logical_zone_of(lbn, self.ctx.config.logical_zones);
        self.query(Target::Logical(zone), |tx| Query::Mapping(lbn, tx))
            .await?
    }

    /// The number of references to a data block, or `None` if `pbn` isn't
    /// a data block.
    pub async fn reference_count(&self, pbn: Pbn) -> Result<Option<u8>> {
        if !self.ctx.layout.is_data_block(pbn) {
            return Ok(None);
        }
        let zone = self.ctx.layout.zone_of(pbn);
        self.query(Target::Physical(zone), |tx| Query::ReferenceCount(pbn, tx))
            .await
    }

    /// The recovery journal entries which have not yet been reaped
    pub async fn journal_entries(&self) -> Result<Vec<JournalEntry>> {
        self.query(Target::Journal, Query::JournalEntries).await
    }

    /// Finish every request in flight, then stop the zones
    #[instrument(skip(self))]
    pub async fn shutdown(mut self) {
        self.drain().await;
        self.ctx.router.shutdown();
        for task in mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!("Zone task failed: {e}");
            }
        }
        info!("VDO shut down");
    }
}

impl Drop for Vdo {
    fn drop(&mut self) {
        // The zones hold the context, so they must be told to stop
        self.ctx.router.shutdown();
    }
}

impl std::fmt::Debug for Vdo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vdo")
            .field("ctx", &self.ctx)
            .field("zones", &self.tasks.len())
            .finish()
    }
}

// LCOV_EXCL_STOP
