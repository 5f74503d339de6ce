// vim: tw=80
//! Host requests

use crate::types::*;
use divbuf::DivBufShared;

/// What a host request does
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Read,
    Write,
    Discard,
}

/// The completion value of a host request.  Reads return one block of data;
/// everything else returns nothing.
pub type Reply = Result<Option<DivBufShared>>;

/// One host request, addressed by logical block.
#[derive(Debug)]
pub struct Bio {
    pub lbn: Lbn,
    pub op: Operation,
    /// Must the request be durable before it is acknowledged?
    pub fua: bool,
    /// Byte offset of `data` within the block, for partial writes
    pub offset: usize,
    /// The data to write.  Ignored for reads and discards.
    pub data: Option<IoVec>,
    /// Number of blocks to discard
    pub blocks: u64,
}

impl Bio {
    pub fn read(lbn: Lbn) -> Self {
        Bio {lbn, op: Operation::Read, fua: false, offset: 0, data: None,
             blocks: 1}
    }

    /// Write a full block
    pub fn write(lbn: Lbn, data: IoVec) -> Self {
        Bio {lbn, op: Operation::Write, fua: false, offset: 0,
             data: Some(data), blocks: 1}
    }

    /// Write part of a block.  The rest of the block keeps its contents.
    pub fn write_partial(lbn: Lbn, offset: usize, data: IoVec) -> Self {
        Bio {lbn, op: Operation::Write, fua: false, offset, data: Some(data),
             blocks: 1}
    }

    /// Discard `blocks` consecutive blocks starting at `lbn`.
    pub fn discard(lbn: Lbn, blocks: u64) -> Self {
        Bio {lbn, op: Operation::Discard, fua: false, offset: 0, data: None,
             blocks}
    }

    /// Require the request to be durable before it completes.
    pub fn fua(mut self) -> Self {
        self.fua = true;
        self
    }

    /// Does this write cover less than a whole block?
    pub fn is_partial(&self) -> bool {
        self.op == Operation::Write &&
            self.data.as_ref().map_or(true, |d| d.len() < BLOCK_SIZE)
    }

    /// Check the request's shape against a device of `logical_blocks`.
    /// Single block requests past the end are refused later, by their
    /// logical zone.
    pub(crate) fn validate(&self, logical_blocks: u64) -> Result<()> {
        match self.op {
            Operation::Read => Ok(()),
            Operation::Write => {
                let len = self.data.as_ref().map_or(0, |d| d.len());
                if len == 0 || self.offset + len > BLOCK_SIZE {
                    Err(Error::InvalidArgument)
                } else {
                    Ok(())
                }
            }
            Operation::Discard if self.blocks == 0 => {
                Err(Error::InvalidArgument)
            }
            Operation::Discard => {
                if self.blocks > logical_blocks.saturating_sub(self.lbn) {
                    Err(Error::OutOfRange)
                } else if self.blocks.checked_mul(BLOCK_SIZE as u64).is_none()
                {
                    Err(Error::InvalidArgument)
                } else {
                    Ok(())
                }
            }
        }
    }
}

// LCOV_EXCL_STOP
