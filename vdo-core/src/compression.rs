// vim: tw=80
//! Per-request compression status
//!
//! A data_vio's compression state is shared with whichever zone is looking
//! at it: the packer may be holding it while a later write to the same LBN
//! asks for it to be evicted.  The state is packed into one atomic word and
//! only ever changed by compare-and-swap.

use std::sync::atomic::{AtomicU32, Ordering};

const STATUS_MASK: u32 = 0xff;
const MAY_NOT_COMPRESS_MASK: u32 = 0x8000_0000;

/// How far a data_vio has progressed through compression.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub(crate) enum CompressionStage {
    PreCompressor = 0,
    Compressing = 1,
    Packing = 2,
    PostPacker = 3,
}

impl CompressionStage {
    fn from_bits(bits: u32) -> Self {
        match bits & STATUS_MASK {
            0 => CompressionStage::PreCompressor,
            1 => CompressionStage::Compressing,
            2 => CompressionStage::Packing,
            _ => CompressionStage::PostPacker,
        }
    }

    fn next(self) -> Self {
        match self {
            CompressionStage::PreCompressor => CompressionStage::Compressing,
            CompressionStage::Compressing => CompressionStage::Packing,
            _ => CompressionStage::PostPacker,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Status {
    pub stage: CompressionStage,
    pub may_not_compress: bool,
}

impl Status {
    fn pack(self) -> u32 {
        let flag = if self.may_not_compress {
            MAY_NOT_COMPRESS_MASK
        } else {
            0
        };
        self.stage as u32 | flag
    }

    fn unpack(bits: u32) -> Self {
        Status {
            stage: CompressionStage::from_bits(bits),
            may_not_compress: bits & MAY_NOT_COMPRESS_MASK != 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CompressionStatus(AtomicU32);

impl CompressionStatus {
    pub fn get(&self) -> Status {
        Status::unpack(self.0.load(Ordering::Acquire))
    }

    fn set(&self, expected: Status, replacement: Status) -> bool {
        self.0.compare_exchange(expected.pack(), replacement.pack(),
            Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to the next stage.  A data_vio which may not compress skips
    /// straight to `PostPacker`.  Returns the stage it ended up in.
    pub fn advance(&self) -> CompressionStage {
        loop {
            let status = self.get();
            if status.stage == CompressionStage::PostPacker {
                return status.stage;
            }
            let stage = if status.may_not_compress {
                CompressionStage::PostPacker
            } else {
                status.stage.next()
            };
            if self.set(status, Status { stage, .. status }) {
                return stage;
            }
        }
    }

    /// Should the data_vio proceed to compression?
    pub fn advance_to_compressing(&self) -> bool {
        self.advance() == CompressionStage::Compressing
    }

    /// Should the compressed data_vio be offered to the packer?
    pub fn may_pack(&self) -> bool {
        // Should be in Compressing unless eviction has already happened.
        self.advance() == CompressionStage::Packing
    }

    /// May the data_vio's fragment be written as part of a compressed block?
    /// Moves the data_vio past the packer either way.
    pub fn may_write_compressed(&self) -> bool {
        loop {
            let status = self.get();
            if status.may_not_compress ||
                status.stage < CompressionStage::Packing
            {
                self.set_done();
                return false;
            }
            let done = Status {
                stage: CompressionStage::PostPacker,
                may_not_compress: false,
            };
            if status.stage == CompressionStage::PostPacker ||
                self.set(status, done)
            {
                return true;
            }
        }
    }

    /// Declare that compression is finished, successful or not.
    pub fn set_done(&self) {
        loop {
            let status = self.get();
            let done = Status {
                stage: CompressionStage::PostPacker,
                may_not_compress: true,
            };
            if status == done || self.set(status, done) {
                return;
            }
        }
    }

    /// Prevent the data_vio from being compressed.  Returns `true` if the
    /// data_vio is sitting in the packer and must be evicted from it.
    pub fn cancel(&self) -> bool {
        loop {
            let status = self.get();
            if status.may_not_compress {
                return false;
            }
            let cancelled = Status { may_not_compress: true, .. status };
            if self.set(status, cancelled) {
                return status.stage == CompressionStage::Packing;
            }
        }
    }
}

// LCOV_EXCL_STOP
