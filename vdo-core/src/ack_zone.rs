// vim: tw=80
//! Replies to writes which may be acknowledged before their metadata is
//! updated.  Keeping the replies in their own zone keeps the host's
//! completion handlers off the zones which own state.

use crate::{
    data_vio::{DataVio, Step},
    zone::{self, Context, Message, Zone},
};
use std::sync::Arc;

pub(crate) struct AckZone {
    ctx: Arc<Context>,
}

impl AckZone {
    pub fn new(ctx: Arc<Context>) -> Self {
        AckZone { ctx }
    }

    fn continue_data_vio(&mut self, dv: Box<DataVio>) {
        match dv.step {
            Step::AcknowledgeWrite => dv.acknowledge_write(&self.ctx),
            _ => dv.misrouted(&self.ctx, "ack"),
        }
    }
}

impl Zone for AckZone {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Continue(dv) => self.continue_data_vio(dv),
            msg => zone::unexpected(&self.ctx, "ack", msg),
        }
    }
}

// LCOV_EXCL_STOP
