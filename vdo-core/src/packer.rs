// vim: tw=80
//! The packer
//!
//! Compressed fragments wait in bins until enough of them have gathered to
//! fill a block.  The first fragment's allocation becomes the compressed
//! block; the other fragments' allocations are simply released.

use crate::{
    compressed_block::{self, MAX_COMPRESSION_SLOTS, PACKER_BIN_SIZE},
    data_vio::{AsyncOperation, DataVio},
    statistics,
    types::*,
    zone::{self, Context, Message, Query, Target, Zone},
};
use itertools::Itertools;
use std::{fmt, mem, sync::Arc};
use tracing::{debug, error, trace};

/// A packed block on its way to disk, with every data_vio it holds a
/// fragment of.  The first fragment's data_vio supplies the block.
pub(crate) struct CompressedWrite {
    pub fragments: Vec<Box<DataVio>>,
    pub block: Vec<u8>,
}

impl CompressedWrite {
    pub fn new(fragments: Vec<Box<DataVio>>) -> Self {
        CompressedWrite { fragments, block: Vec::new() }
    }

    /// The block being written, and its zone
    pub fn location(&self) -> Option<(Pbn, ZoneId)> {
        self.fragments.first()
            .map(|dv| (dv.allocation.pbn, dv.allocation.zone))
    }
}

impl fmt::Debug for CompressedWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids = self.fragments.iter().map(|dv| dv.id).collect::<Vec<_>>();
        f.debug_struct("CompressedWrite")
            .field("location", &self.location())
            .field("fragments", &ids)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Bin {
    fragments: Vec<Box<DataVio>>,
    used: usize,
}

impl Bin {
    fn fits(&self, size: usize) -> bool {
        self.free_space() >= size
    }

    fn free_space(&self) -> usize {
        PACKER_BIN_SIZE - self.used
    }

    fn is_full(&self) -> bool {
        self.fragments.len() >= MAX_COMPRESSION_SLOTS
    }

    fn remove(&mut self, id: DataVioId) -> Option<Box<DataVio>> {
        let i = self.fragments.iter().position(|dv| dv.id == id)?;
        let dv = self.fragments.remove(i);
        self.used -= dv.compression.size;
        Some(dv)
    }

    fn take(&mut self) -> Vec<Box<DataVio>> {
        self.used = 0;
        mem::take(&mut self.fragments)
    }
}

pub(crate) struct Packer {
    ctx: Arc<Context>,
    bins: Vec<Bin>,
}

impl Packer {
    pub fn new(ctx: Arc<Context>) -> Self {
        let bins = (0..ctx.config.packer_bins).map(|_| Bin::default())
            .collect();
        Packer { ctx, bins }
    }

    /// Put a compressed data_vio in the bin it fits best
    fn attempt_packing(&mut self, mut dv: Box<DataVio>) {
        let ctx = &self.ctx.clone();
        dv.last_async_operation = AsyncOperation::AttemptPacking;
        if !dv.may_pack(ctx) {
            return dv.abort_optimization(ctx);
        }
        let size = dv.compression.size;
        let best = self.bins.iter()
            .positions(|bin| bin.fits(size))
            .min_by_key(|&i| self.bins[i].free_space());
        let i = match best {
            Some(i) => i,
            None => {
                // Make room by writing out the fullest bin
                let Some(fullest) = (0..self.bins.len())
                    .min_by_key(|&i| self.bins[i].free_space())
                else {
                    return dv.abort_optimization(ctx);
                };
                self.write_bin(fullest);
                fullest
            }
        };
        trace!(id = dv.id, size, bin = i, "Packing fragment");
        statistics::inc(&ctx.stats.compressed_fragments_in_packer);
        let bin = &mut self.bins[i];
        bin.used += size;
        bin.fragments.push(dv);
        if bin.is_full() || ctx.is_flushing() {
            self.write_bin(i);
        }
    }

    fn census(&self) -> usize {
        self.bins.iter().map(|b| b.fragments.len()).sum()
    }

    /// Write every bin which holds anything
    fn flush(&mut self) {
        for i in 0..self.bins.len() {
            if !self.bins[i].fragments.is_empty() {
                self.write_bin(i);
            }
        }
    }

    /// Evict a data_vio whose LBN is wanted by someone else.  It writes its
    /// data uncompressed.
    fn remove_lock_holder(&mut self, id: DataVioId) {
        let ctx = &self.ctx;
        match self.bins.iter_mut().find_map(|bin| bin.remove(id)) {
            Some(dv) => {
                debug!(id, "Evicting data_vio from packer");
                statistics::dec(&ctx.stats.compressed_fragments_in_packer);
                dv.share.compression.set_done();
                dv.abort_optimization(ctx);
            }
            // Already written, or never got here
            None => trace!(id, "data_vio to evict is not in the packer"),
        }
    }

    /// Pack a bin's fragments into a compressed block and send it to be
    /// written
    fn write_bin(&mut self, i: usize) {
        let ctx = &self.ctx;
        let fragments = self.bins[i].take();
        let n = fragments.len() as u64;
        statistics::sub(&ctx.stats.compressed_fragments_in_packer, n);
        let (mut fragments, cancelled): (Vec<_>, Vec<_>) = fragments
            .into_iter()
            .partition(|dv| dv.share.compression.may_write_compressed());
        for dv in cancelled {
            dv.abort_optimization(ctx);
        }
        if fragments.len() < 2 {
            // Not worth a compressed block
            for dv in fragments {
                dv.abort_optimization(ctx);
            }
            return;
        }
        let (pbn, zone) = (fragments[0].allocation.pbn,
                           fragments[0].allocation.zone);
        let packed = compressed_block::pack(
            fragments.iter().map(|dv| &dv.compression.data[..]));
        let block = match packed {
            Ok(block) => block,
            Err(e) => {
                error!(pbn, %e, "Cannot pack compressed block");
                for dv in fragments {
                    dv.abort_optimization(ctx);
                }
                return;
            }
        };
        for (slot, dv) in fragments.iter_mut().enumerate() {
            dv.new_mapped = ZonedPbn {
                pbn,
                state: MappingState::Compressed(slot as u8),
                zone,
            };
        }
        debug!(pbn, fragments = n, "Writing compressed block");
        let write = CompressedWrite { fragments, block };
        ctx.send(Target::Bio, Message::WriteCompressed(write));
    }
}

impl Zone for Packer {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.attempt_packing(dv),
            Message::RemoveLockHolder(id) => self.remove_lock_holder(id),
            Message::FlushPacker => self.flush(),
            Message::Query(Query::Census(tx)) => {
                let _ = tx.send(self.census());
            }
            msg => zone::unexpected(&self.ctx, "packer", msg),
        }
    }
}

impl fmt::Debug for Packer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packer")
            .field("bins", &self.bins.len())
            .field("fragments", &self.census())
            .finish()
    }
}

// LCOV_EXCL_STOP
