// vim: tw=80
//! The bio submitter issues every data block I/O to the [`BlockDevice`].
//!
//! Each I/O runs as its own task, so a slow device never stalls the zone.
//! The data_vio travels with its I/O and is sent on to its next step when
//! the I/O completes.
//!
//! [`BlockDevice`]: crate::device::BlockDevice

use crate::{
    data_vio::{AsyncOperation, DataVio, Step},
    packer::CompressedWrite,
    statistics,
    types::*,
    zone::{self, Context, Message, Target, Zone},
};
use divbuf::DivBufShared;
use std::{mem, sync::Arc};
use tracing::{debug, warn};

pub(crate) struct Submitter {
    ctx: Arc<Context>,
}

impl Submitter {
    pub fn new(ctx: Arc<Context>) -> Self {
        Submitter { ctx }
    }

    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        match dv.step {
            Step::ReadData => self.read_data(dv),
            Step::ReadDuplicate => self.read_duplicate(dv),
            Step::WriteData => self.write_data(dv),
            _ => dv.misrouted(&self.ctx, "bio"),
        }
    }

    /// Read the block an LBN maps to, for a read or a read-modify-write
    fn read_data(&mut self, mut dv: Box<DataVio>) {
        let ctx = self.ctx.clone();
        dv.last_async_operation = AsyncOperation::ReadDataVio;
        let fut = ctx.device.read_block(dv.mapped.pbn);
        tokio::spawn(async move {
            match fut.await {
                Ok(dbs) => {
                    dv.scratch = Some(dbs);
                    dv.continue_in(&ctx, Step::CompleteRead);
                }
                Err(e) => dv.fail(&ctx, e),
            }
        });
    }

    /// Read a dedupe candidate.  A candidate which can't be read just
    /// fails verification.
    fn read_duplicate(&mut self, mut dv: Box<DataVio>) {
        let ctx = self.ctx.clone();
        dv.last_async_operation = AsyncOperation::VerifyDuplication;
        let fut = ctx.device.read_block(dv.duplicate.pbn);
        tokio::spawn(async move {
            dv.scratch = match fut.await {
                Ok(dbs) => Some(dbs),
                Err(e) => {
                    warn!(id = dv.id, pbn = dv.duplicate.pbn, %e,
                          "Cannot read dedupe candidate");
                    None
                }
            };
            dv.continue_in(&ctx, Step::VerifyDuplication);
        });
    }

    /// Write the data, uncompressed, to the data_vio's own block
    fn write_data(&mut self, mut dv: Box<DataVio>) {
        let ctx = self.ctx.clone();
        dv.last_async_operation = AsyncOperation::WriteDataVio;
        let buf = match dv.buffer() {
            Ok(buf) => buf,
            Err(e) => return dv.fail(&ctx, e),
        };
        debug_assert_eq!(dv.new_mapped.pbn, dv.allocation.pbn);
        let fut = ctx.device.write_block(dv.new_mapped.pbn, buf);
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => {
                    dv.last_async_operation =
                        AsyncOperation::JournalMappingForWrite;
                    dv.continue_in(&ctx, Step::JournalMappingForWrite);
                }
                Err(e) => dv.fail(&ctx, e),
            }
        });
    }

    /// Write a packed block.  If that fails, every fragment falls back to
    /// writing its own data uncompressed.
    fn write_compressed(&mut self, mut write: CompressedWrite) {
        let ctx = self.ctx.clone();
        let Some((pbn, zone)) = write.location() else { return };
        let dbs = DivBufShared::from(mem::take(&mut write.block));
        let fut = match dbs.try_const() {
            Ok(buf) => ctx.device.write_block(pbn, buf),
            Err(_) => {
                for dv in write.fragments {
                    dv.abort_optimization(&ctx);
                }
                return;
            }
        };
        tokio::spawn(async move {
            let r = fut.await;
            drop(dbs);
            match r {
                Ok(()) => {
                    let n = write.fragments.len() as u64;
                    statistics::inc(&ctx.stats.compressed_blocks_written);
                    statistics::add(&ctx.stats.compressed_fragments_written,
                                    n);
                    ctx.send(Target::Physical(zone),
                             Message::CompressedWriteDone(write));
                }
                Err(e) => {
                    debug!(pbn, %e, "Compressed write failed");
                    for dv in write.fragments {
                        dv.abort_optimization(&ctx);
                    }
                }
            }
        });
    }
}

impl Zone for Submitter {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            Message::WriteCompressed(write) => self.write_compressed(write),
            msg => zone::unexpected(&self.ctx, "bio", msg),
        }
    }
}

// LCOV_EXCL_STOP
