// vim: tw=80
//! The CPU zone runs the steps which need no zone state but do need a lot of
//! arithmetic: hashing, compression, and comparing blocks.

use crate::{
    data_vio::{DataVio, Step},
    zone::{self, Context, Message, Zone},
};
use std::sync::Arc;

pub(crate) struct CpuZone {
    ctx: Arc<Context>,
}

impl CpuZone {
    pub fn new(ctx: Arc<Context>) -> Self {
        CpuZone { ctx }
    }

    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        let ctx = &self.ctx;
        match dv.step {
            Step::HashData => dv.hash_data(ctx),
            Step::CompressData => dv.compress_data(ctx),
            Step::CompleteRead => dv.complete_read(ctx),
            Step::VerifyDuplication => dv.verify_duplication(ctx),
            _ => dv.misrouted(ctx, "cpu"),
        }
    }
}

impl Zone for CpuZone {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            msg => zone::unexpected(&self.ctx, "cpu", msg),
        }
    }
}

// LCOV_EXCL_STOP
