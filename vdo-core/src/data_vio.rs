// vim: tw=80
//! The data_vio: one host request in flight through the pipeline
//!
//! A data_vio is passed by value from zone to zone.  Each hop sets the next
//! [`Step`] and sends the data_vio to the zone which owns the state that step
//! needs, so at any moment exactly one zone may touch it.  The steps which
//! don't need any zone-owned state live here; the rest live with the zone
//! that owns their state.

use crate::{
    bio::{Bio, Operation, Reply},
    cleanup,
    compressed_block::{self, INCOMPRESSIBLE, PACKER_BIN_SIZE},
    compression::CompressionStatus,
    data_vio_pool::Permit,
    hash_lock::HashLockId,
    logical_zone::logical_zone_of,
    pbn_lock::PbnLockHandle,
    types::*,
    util::{is_zero_block, record_name, zeroed_block},
    zone::{Context, Message, Target},
};
use divbuf::DivBufShared;
use futures::channel::oneshot;
use std::{
    fmt,
    sync::{Arc, OnceLock},
};
use tracing::{debug, error};

/// The next thing a data_vio will do.  Each step runs in exactly one zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    AttemptLogicalBlockLock,
    ContinueWithBlockMapSlot,
    AllocateBlock,
    AcknowledgeWrite,
    HashData,
    AcquireHashLock,
    FinishQuery,
    LockDuplicatePbn,
    FinishLockingDuplicate,
    ReadDuplicate,
    VerifyDuplication,
    FinishVerifying,
    CompressData,
    AttemptPacking,
    WriteData,
    JournalMappingForWrite,
    IncrementForWrite,
    ReadOldMappingForWrite,
    JournalUnmappingForWrite,
    DecrementForWrite,
    PutMappedBlockForWrite,
    JournalMappingForDedupe,
    IncrementForDedupe,
    JournalMappingForCompression,
    IncrementForCompression,
    ReadOldMappingForDedupe,
    JournalUnmappingForDedupe,
    DecrementForDedupe,
    PutMappedBlockForDedupe,
    FinishUpdating,
    ContinueHashLock,
    ContinueHashLockOnError,
    ReadData,
    CompleteRead,
}

/// The last asynchronous operation a data_vio started, for error reports
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AsyncOperation {
    Launch,
    AcknowledgeWrite,
    AcquireHashLock,
    AttemptLogicalBlockLock,
    LockDuplicatePbn,
    CheckForDuplication,
    Cleanup,
    CompressDataVio,
    FindBlockMapSlot,
    GetMappedBlockForRead,
    GetMappedBlockForDedupe,
    GetMappedBlockForWrite,
    HashDataVio,
    JournalDecrementForDedupe,
    JournalDecrementForWrite,
    JournalIncrementForCompression,
    JournalIncrementForDedupe,
    JournalIncrementForWrite,
    JournalMappingForCompression,
    JournalMappingForDedupe,
    JournalMappingForWrite,
    JournalUnmappingForDedupe,
    JournalUnmappingForWrite,
    AttemptPacking,
    PutMappedBlockForWrite,
    PutMappedBlockForDedupe,
    ReadDataVio,
    UpdateDedupeIndex,
    VerifyDuplication,
    WriteDataVio,
}

impl AsyncOperation {
    pub fn name(self) -> &'static str {
        match self {
            AsyncOperation::Launch => "launch",
            AsyncOperation::AcknowledgeWrite => "acknowledge_write",
            AsyncOperation::AcquireHashLock => "acquire_hash_lock",
            AsyncOperation::AttemptLogicalBlockLock =>
                "attempt_logical_block_lock",
            AsyncOperation::LockDuplicatePbn => "lock_duplicate_pbn",
            AsyncOperation::CheckForDuplication => "check_for_duplication",
            AsyncOperation::Cleanup => "cleanup",
            AsyncOperation::CompressDataVio => "compress_data_vio",
            AsyncOperation::FindBlockMapSlot => "find_block_map_slot",
            AsyncOperation::GetMappedBlockForRead =>
                "get_mapped_block_for_read",
            AsyncOperation::GetMappedBlockForDedupe =>
                "get_mapped_block_for_dedupe",
            AsyncOperation::GetMappedBlockForWrite =>
                "get_mapped_block_for_write",
            AsyncOperation::HashDataVio => "hash_data_vio",
            AsyncOperation::JournalDecrementForDedupe =>
                "journal_decrement_for_dedupe",
            AsyncOperation::JournalDecrementForWrite =>
                "journal_decrement_for_write",
            AsyncOperation::JournalIncrementForCompression =>
                "journal_increment_for_compression",
            AsyncOperation::JournalIncrementForDedupe =>
                "journal_increment_for_dedupe",
            AsyncOperation::JournalIncrementForWrite =>
                "journal_increment_for_write",
            AsyncOperation::JournalMappingForCompression =>
                "journal_mapping_for_compression",
            AsyncOperation::JournalMappingForDedupe =>
                "journal_mapping_for_dedupe",
            AsyncOperation::JournalMappingForWrite =>
                "journal_mapping_for_write",
            AsyncOperation::JournalUnmappingForDedupe =>
                "journal_unmapping_for_dedupe",
            AsyncOperation::JournalUnmappingForWrite =>
                "journal_unmapping_for_write",
            AsyncOperation::AttemptPacking => "attempt_packing",
            AsyncOperation::PutMappedBlockForWrite =>
                "put_mapped_block_for_write",
            AsyncOperation::PutMappedBlockForDedupe =>
                "put_mapped_block_for_dedupe",
            AsyncOperation::ReadDataVio => "read_data_vio",
            AsyncOperation::UpdateDedupeIndex => "update_dedupe_index",
            AsyncOperation::VerifyDuplication => "verify_duplication",
            AsyncOperation::WriteDataVio => "write_data_vio",
        }
    }
}

/// How an error should affect the rest of the device
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ErrorAction {
    /// Fail only this data_vio
    Fail,
    /// Fail this data_vio and latch the device read-only
    ReadOnly,
}

#[derive(Debug)]
pub(crate) struct LogicalState {
    pub lbn: Lbn,
    pub zone: ZoneId,
    /// Does this data_vio hold its LBN's lock?
    pub locked: bool,
}

#[derive(Debug)]
pub(crate) struct Allocation {
    /// `ZERO_BLOCK` when nothing has been allocated
    pub pbn: Pbn,
    /// The physical zone currently being asked for a block
    pub zone: ZoneId,
    /// Where the round-robin search started
    pub first_zone: ZoneId,
    pub lock: Option<PbnLockHandle>,
}

/// The part of a data_vio which other data_vios may look at while it runs
#[derive(Debug, Default)]
pub(crate) struct DataVioShare {
    pub compression: CompressionStatus,
    /// The block this write will store, once it is safe for readers of the
    /// same LBN to use.
    pub written: OnceLock<IoVec>,
}

#[derive(Debug)]
pub(crate) struct PartialWrite {
    pub offset: usize,
    pub data: IoVec,
}

#[derive(Debug, Default)]
pub(crate) struct Compression {
    /// Compressed size, or `INCOMPRESSIBLE`
    pub size: usize,
    pub data: Vec<u8>,
}

pub(crate) struct DataVio {
    pub id: DataVioId,
    pub op: Operation,
    pub fua: bool,
    /// Will this data_vio change the block map?
    pub write: bool,
    /// Is this data_vio reading, either for the host or for a
    /// read-modify-write?
    pub read: bool,
    pub partial: Option<PartialWrite>,
    pub is_trim: bool,
    pub is_zero: bool,
    /// Bytes of the discard not yet finished, including this block
    pub remaining_discard: u64,

    pub logical: LogicalState,
    /// Does the block map page for this LBN exist?
    pub page_allocated: bool,
    pub flush_generation: Option<u64>,
    pub allocation: Allocation,
    pub allocation_succeeded: bool,

    // `share` may hold views of `data`, so it must be dropped first.
    pub share: Arc<DataVioShare>,
    pub data: DivBufShared,
    pub compression: Compression,
    /// A block read from disk: the old contents for a read, or a dedupe
    /// candidate for verification.
    pub scratch: Option<DivBufShared>,

    pub record_name: RecordName,
    pub hash_zone: ZoneId,
    pub hash_lock: Option<HashLockId>,
    pub is_duplicate: bool,
    pub duplicate: ZonedPbn,
    /// A read lock on `duplicate`, on its way to the hash lock
    pub duplicate_lock: Option<PbnLockHandle>,
    /// This data_vio's share of a compressed block's lock
    pub compressed_write_lock: Option<PbnLockHandle>,
    /// The dedupe index's answer
    pub advice: Option<DataLocation>,

    /// The current mapping of the LBN
    pub mapped: ZonedPbn,
    /// The mapping being written
    pub new_mapped: ZonedPbn,

    /// Recovery journal blocks this data_vio holds locks on
    pub journal_locks: Vec<SequenceNumber>,
    /// The journal block holding this data_vio's latest entry
    pub recovery_sequence: SequenceNumber,

    pub step: Step,
    pub last_async_operation: AsyncOperation,
    pub result: Result<()>,
    reply: Option<oneshot::Sender<Reply>>,
    _permit: Permit,
}

impl DataVio {
    /// Prepare a data_vio for a validated host request
    pub fn new(ctx: &Context, bio: Bio, reply: oneshot::Sender<Reply>,
               permit: Permit) -> Box<Self>
    {
        let op = bio.op;
        let mut partial = None;
        let data = match (op, bio.data) {
            (Operation::Write, Some(data)) if data.len() == BLOCK_SIZE => {
                DivBufShared::from(data[..].to_vec())
            }
            (Operation::Write, Some(data)) => {
                partial = Some(PartialWrite { offset: bio.offset, data });
                zeroed_block()
            }
            _ => zeroed_block(),
        };
        let is_zero = op == Operation::Write && partial.is_none() &&
            data.try_const().map_or(false, |b| is_zero_block(&b[..]));
        let remaining_discard = if op == Operation::Discard {
            bio.blocks * BLOCK_SIZE as u64
        } else {
            BLOCK_SIZE as u64
        };
        let mut dv = Box::new(DataVio {
            id: 0,
            op,
            fua: bio.fua,
            write: op != Operation::Read,
            read: op == Operation::Read || partial.is_some(),
            partial,
            is_trim: op == Operation::Discard,
            is_zero,
            remaining_discard,
            logical: LogicalState { lbn: bio.lbn, zone: 0, locked: false },
            page_allocated: false,
            flush_generation: None,
            allocation: Allocation {
                pbn: ZERO_BLOCK, zone: 0, first_zone: 0, lock: None
            },
            allocation_succeeded: false,
            share: Arc::default(),
            data,
            compression: Compression::default(),
            scratch: None,
            record_name: RecordName::default(),
            hash_zone: 0,
            hash_lock: None,
            is_duplicate: false,
            duplicate: ZonedPbn::default(),
            duplicate_lock: None,
            compressed_write_lock: None,
            advice: None,
            mapped: ZonedPbn::default(),
            new_mapped: ZonedPbn::default(),
            journal_locks: Vec::new(),
            recovery_sequence: 0,
            step: Step::AttemptLogicalBlockLock,
            last_async_operation: AsyncOperation::Launch,
            result: Ok(()),
            reply: Some(reply),
            _permit: permit,
        });
        dv.reset(ctx, bio.lbn);
        dv
    }

    /// Reset everything which describes a single block's progress
    fn reset(&mut self, ctx: &Context, lbn: Lbn) {
        self.id = ctx.next_id();
        self.logical = LogicalState {
            lbn,
            zone: logical_zone_of(lbn, ctx.config.logical_zones),
            locked: false,
        };
        self.page_allocated = false;
        self.flush_generation = None;
        self.allocation = Allocation {
            pbn: ZERO_BLOCK, zone: 0, first_zone: 0, lock: None
        };
        self.allocation_succeeded = false;
        self.share = Arc::default();
        self.compression = Compression::default();
        self.scratch = None;
        self.record_name = RecordName::default();
        self.hash_zone = 0;
        self.hash_lock = None;
        self.is_duplicate = false;
        self.duplicate = ZonedPbn::default();
        self.advice = None;
        self.mapped = ZonedPbn::default();
        self.new_mapped = ZonedPbn::default();
        self.recovery_sequence = 0;
        self.result = Ok(());
    }

    /// Start (or restart) processing at the data_vio's LBN
    pub fn launch(mut self: Box<Self>, ctx: &Context) {
        self.last_async_operation = AsyncOperation::Launch;
        if self.write && ctx.read_only.is_read_only() {
            return self.fail(ctx, Error::ReadOnly);
        }
        self.last_async_operation = AsyncOperation::AttemptLogicalBlockLock;
        self.continue_in(ctx, Step::AttemptLogicalBlockLock);
    }

    /// Move on to the next block of a multi-block discard
    pub fn relaunch_discard(mut self: Box<Self>, ctx: &Context) {
        self.remaining_discard -= BLOCK_SIZE as u64;
        let lbn = self.logical.lbn + 1;
        self.reset(ctx, lbn);
        debug!(id = self.id, lbn, "Continuing discard");
        self.launch(ctx);
    }

    /// Which zone runs the current step?
    fn target(&self) -> Target {
        match self.step {
            Step::AttemptLogicalBlockLock |
            Step::ContinueWithBlockMapSlot |
            Step::ReadOldMappingForWrite |
            Step::PutMappedBlockForWrite |
            Step::ReadOldMappingForDedupe |
            Step::PutMappedBlockForDedupe => Target::Logical(self.logical.zone),
            Step::AllocateBlock |
            Step::IncrementForWrite => Target::Physical(self.allocation.zone),
            Step::DecrementForWrite |
            Step::DecrementForDedupe => Target::Physical(self.mapped.zone),
            Step::IncrementForDedupe |
            Step::IncrementForCompression =>
                Target::Physical(self.new_mapped.zone),
            Step::LockDuplicatePbn => Target::Physical(self.duplicate.zone),
            Step::AcquireHashLock |
            Step::FinishQuery |
            Step::FinishLockingDuplicate |
            Step::FinishVerifying |
            Step::FinishUpdating |
            Step::ContinueHashLock |
            Step::ContinueHashLockOnError => Target::Hash(self.hash_zone),
            Step::JournalMappingForWrite |
            Step::JournalUnmappingForWrite |
            Step::JournalMappingForDedupe |
            Step::JournalMappingForCompression |
            Step::JournalUnmappingForDedupe => Target::Journal,
            Step::AttemptPacking => Target::Packer,
            Step::HashData |
            Step::CompressData |
            Step::CompleteRead |
            Step::VerifyDuplication => Target::Cpu,
            Step::AcknowledgeWrite => Target::Ack,
            Step::ReadData |
            Step::WriteData |
            Step::ReadDuplicate => Target::Bio,
        }
    }

    /// Send the data_vio to the zone which runs `step`
    pub fn continue_in(mut self: Box<Self>, ctx: &Context, step: Step) {
        self.step = step;
        let target = self.target();
        ctx.send(target, Message::Continue(self));
    }

    /// Fail the data_vio without affecting the rest of the device, unless
    /// the error itself demands otherwise.
    pub fn fail(self: Box<Self>, ctx: &Context, error: Error) {
        self.abort(ctx, error, ErrorAction::Fail)
    }

    /// The single path by which every step reports an error
    pub fn abort(mut self: Box<Self>, ctx: &Context, error: Error,
                 action: ErrorAction)
    {
        let operation = self.last_async_operation.name();
        let acknowledged = self.reply.is_none();
        if action == ErrorAction::ReadOnly ||
            error == Error::ReadOnly ||
            error.is_metadata_error() ||
            acknowledged
        {
            // The host has been told the write succeeded, so the only safe
            // course is to stop accepting writes.
            ctx.read_only.enter(error);
        }
        match error {
            Error::NoSpace | Error::OutOfRange | Error::ReadOnly => {
                debug!(id = self.id, lbn = self.logical.lbn, operation,
                       %error, "data_vio failed");
            }
            _ => {
                error!(id = self.id, lbn = self.logical.lbn, operation,
                       %error, "Completing data_vio with error");
            }
        }
        self.result = Err(error);
        if self.hash_lock.is_some() {
            self.continue_in(ctx, Step::ContinueHashLockOnError);
        } else {
            self.complete(ctx);
        }
    }

    /// The data_vio arrived at a zone which can't run its current step
    pub fn misrouted(self: Box<Self>, ctx: &Context, zone: &'static str) {
        error!(id = self.id, step = ?self.step, zone,
               "data_vio sent to the wrong zone");
        self.abort(ctx, Error::LockError, ErrorAction::ReadOnly)
    }

    /// Finish with the data_vio, successful or not, and start releasing its
    /// locks.
    pub fn complete(mut self: Box<Self>, ctx: &Context) {
        if self.result.is_err() {
            ctx.stats.errors.count(self.op, self.partial.is_some(), self.fua);
        }
        self.last_async_operation = AsyncOperation::Cleanup;
        cleanup::begin(ctx, self);
    }

    /// Tell the host how the request went.  Does nothing if the host has
    /// already been told.
    pub fn acknowledge(&mut self, ctx: &Context) {
        let Some(reply) = self.reply.take() else { return };
        let value = match self.result {
            Err(e) => Err(e),
            Ok(()) if self.op == Operation::Read => self.read_reply(),
            Ok(()) => Ok(None),
        };
        ctx.stats.bios_acknowledged.count(self.op, self.fua);
        if self.partial.is_some() {
            ctx.stats.bios_acknowledged_partial.count(self.op, self.fua);
        }
        // The host may have stopped waiting
        let _ = reply.send(value);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.reply.is_none()
    }

    fn read_reply(&self) -> Reply {
        let buf = self.buffer()?;
        Ok(Some(DivBufShared::from(buf[..].to_vec())))
    }

    /// A read-only view of the data buffer
    pub fn buffer(&self) -> Result<IoVec> {
        self.data.try_const().map_err(|_| Error::LockError)
    }

    pub fn has_allocation(&self) -> bool {
        self.allocation.lock.is_some()
    }

    /// Record a successful allocation
    pub fn allocated(mut self: Box<Self>, ctx: &Context) {
        self.allocation_succeeded = true;
        self.new_mapped = ZonedPbn {
            pbn: self.allocation.pbn,
            state: MappingState::Uncompressed,
            zone: self.allocation.zone,
        };
        // From now on, a reader of this LBN may be served from our buffer.
        if let Ok(buf) = self.buffer() {
            let _ = self.share.written.set(buf);
        }
        if self.fua {
            self.prepare_for_dedupe(ctx);
        } else {
            self.last_async_operation = AsyncOperation::AcknowledgeWrite;
            self.continue_in(ctx, Step::AcknowledgeWrite);
        }
    }

    /// Acknowledge a write before its metadata is updated
    pub fn acknowledge_write(mut self: Box<Self>, ctx: &Context) {
        self.acknowledge(ctx);
        if self.new_mapped.pbn == ZERO_BLOCK {
            // A zero write or discard
            self.continue_in(ctx, Step::JournalMappingForWrite);
        } else {
            self.prepare_for_dedupe(ctx);
        }
    }

    pub fn prepare_for_dedupe(mut self: Box<Self>, ctx: &Context) {
        debug_assert!(!self.is_zero, "must not prepare to dedupe zero blocks");
        self.last_async_operation = AsyncOperation::HashDataVio;
        self.continue_in(ctx, Step::HashData);
    }

    /// Compute the record name and pick a hash zone
    pub fn hash_data(mut self: Box<Self>, ctx: &Context) {
        let buf = match self.buffer() {
            Ok(buf) => buf,
            Err(e) => return self.abort(ctx, e, ErrorAction::ReadOnly)
        };
        self.record_name = record_name(&buf[..]);
        drop(buf);
        let zones = ctx.config.hash_zones;
        self.hash_zone = (usize::from(self.record_name.0[0]) * zones) >> 8;
        self.last_async_operation = AsyncOperation::AcquireHashLock;
        self.continue_in(ctx, Step::AcquireHashLock);
    }

    /// Share the duplicate block found by the hash lock
    pub fn launch_deduplicate(mut self: Box<Self>, ctx: &Context) {
        debug_assert!(self.is_duplicate,
            "data_vio must have a duplicate location");
        self.new_mapped = self.duplicate;
        self.last_async_operation = AsyncOperation::JournalMappingForDedupe;
        self.continue_in(ctx, Step::JournalMappingForDedupe);
    }

    fn may_compress(&self, ctx: &Context) -> bool {
        if !self.has_allocation() || self.fua || !ctx.is_compressing() ||
            self.is_trim || self.hash_lock.is_none()
        {
            self.share.compression.set_done();
            return false;
        }
        self.share.compression.advance_to_compressing()
    }

    /// Try to compress the data instead of writing it whole
    pub fn launch_compress(mut self: Box<Self>, ctx: &Context) {
        debug_assert!(!self.is_duplicate, "compressing a duplicate block");
        if !self.may_compress(ctx) {
            return self.abort_optimization(ctx);
        }
        self.last_async_operation = AsyncOperation::CompressDataVio;
        self.continue_in(ctx, Step::CompressData);
    }

    pub fn compress_data(mut self: Box<Self>, ctx: &Context) {
        let compressed = self.buffer()
            .ok()
            .and_then(|buf| compressed_block::compress(&buf[..]));
        self.compression = match compressed {
            Some(data) => Compression { size: data.len(), data },
            None => Compression { size: INCOMPRESSIBLE, data: Vec::new() }
        };
        self.last_async_operation = AsyncOperation::AttemptPacking;
        self.continue_in(ctx, Step::AttemptPacking);
    }

    /// May this data_vio enter a packer bin?
    pub fn may_pack(&self, ctx: &Context) -> bool {
        if self.compression.size > PACKER_BIN_SIZE || !ctx.is_compressing() {
            self.share.compression.set_done();
            return false;
        }
        self.share.compression.may_pack()
    }

    /// The packer is finished with this data_vio
    pub fn continue_write_after_compression(mut self: Box<Self>,
                                            ctx: &Context)
    {
        if !self.new_mapped.state.is_compressed() {
            return self.abort_optimization(ctx);
        }
        self.last_async_operation =
            AsyncOperation::JournalMappingForCompression;
        self.continue_in(ctx, Step::JournalMappingForCompression);
    }

    /// Neither dedupe nor compression worked out, so write the data to the
    /// allocated block.
    pub fn abort_optimization(mut self: Box<Self>, ctx: &Context) {
        if !self.has_allocation() {
            return self.fail(ctx, Error::NoSpace);
        }
        self.new_mapped = ZonedPbn {
            pbn: self.allocation.pbn,
            state: MappingState::Uncompressed,
            zone: self.allocation.zone,
        };
        self.last_async_operation = AsyncOperation::WriteDataVio;
        self.continue_in(ctx, Step::WriteData);
    }

    /// Finish reading the old contents of the block.  For a read, that
    /// finishes the request; for a partial write, it's time to write.
    pub fn complete_read(mut self: Box<Self>, ctx: &Context) {
        if let Err(e) = self.fill_from_scratch() {
            return self.fail(ctx, e);
        }
        if self.partial.is_some() {
            if let Err(e) = self.modify_for_partial_write() {
                return self.fail(ctx, e);
            }
            self.read = false;
            self.continue_in(ctx, Step::ContinueWithBlockMapSlot);
        } else {
            self.acknowledge(ctx);
            self.complete(ctx);
        }
    }

    /// Copy (or decompress) the block read from disk into the data buffer.
    /// An unmapped block reads as zeros.
    fn fill_from_scratch(&mut self) -> Result<()> {
        let Some(scratch) = self.scratch.take() else {
            let mut buf = self.data.try_mut().map_err(|_| Error::LockError)?;
            buf[..].fill(0);
            return Ok(());
        };
        let block = scratch.try_const().map_err(|_| Error::LockError)?;
        let mut buf = self.data.try_mut().map_err(|_| Error::LockError)?;
        if let MappingState::Compressed(slot) = self.mapped.state {
            let data = compressed_block::uncompress_fragment(&block[..], slot)?;
            buf[..].copy_from_slice(&data[..]);
        } else {
            buf[..].copy_from_slice(&block[..]);
        }
        Ok(())
    }

    fn modify_for_partial_write(&mut self) -> Result<()> {
        let Some(partial) = self.partial.as_ref() else { return Ok(()) };
        let mut buf = self.data.try_mut().map_err(|_| Error::LockError)?;
        let end = partial.offset + partial.data.len();
        buf[partial.offset..end].copy_from_slice(&partial.data[..]);
        self.is_zero = is_zero_block(&buf[..]);
        Ok(())
    }

    /// Compare the data with the dedupe candidate read from disk
    pub fn verify_duplication(mut self: Box<Self>, ctx: &Context) {
        self.is_duplicate = match self.compare_to_candidate() {
            Ok(matches) => matches,
            Err(e) => {
                debug!(id = self.id, pbn = self.duplicate.pbn, %e,
                       "Cannot verify dedupe candidate");
                false
            }
        };
        self.scratch = None;
        self.continue_in(ctx, Step::FinishVerifying);
    }

    fn compare_to_candidate(&self) -> Result<bool> {
        let Some(scratch) = self.scratch.as_ref() else { return Ok(false) };
        let candidate = scratch.try_const().map_err(|_| Error::LockError)?;
        let buf = self.buffer()?;
        if let MappingState::Compressed(slot) = self.duplicate.state {
            let data = compressed_block::uncompress_fragment(&candidate[..],
                                                             slot)?;
            Ok(data[..] == buf[..])
        } else {
            Ok(candidate[..] == buf[..])
        }
    }
}

impl fmt::Debug for DataVio {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DataVio")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("lbn", &self.logical.lbn)
            .field("step", &self.step)
            .field("last_async_operation", &self.last_async_operation)
            .field("result", &self.result)
            .finish()
    }
}

// LCOV_EXCL_STOP
