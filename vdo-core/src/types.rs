// vim: tw=80
//! Common type definitions used throughout the VDO engine

use divbuf::DivBuf;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// the holder of a logical block lock can lend its data to a concurrent
/// reader.
pub type IoVec = DivBuf;

/// Logical block number: the address space visible to the host.
pub type Lbn = u64;

/// Physical block number: the address space of the underlying storage.
pub type Pbn = u64;

/// Indexes one zone of a given kind.
pub type ZoneId = usize;

/// Recovery journal block sequence numbers.  Zero means "none".
pub type SequenceNumber = u64;

/// Identifies one launch of a data_vio.  Never reused.
pub type DataVioId = u64;

/// Size of every logical and physical block, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// The physical block which is never allocated.  Mapping an LBN to it means
/// "all zeros" (or "unmapped", depending on the mapping state).
pub const ZERO_BLOCK: Pbn = 0;

/// The engine's error type.
///
/// The errno-derived codes describe failures of the underlying device; the
/// codes from 1024 up are the engine's own status codes.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive,
         Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Input/output error")]
    Io               = libc::EIO as isize,
    #[error("Cannot allocate memory")]
    NoMemory         = libc::ENOMEM as isize,
    #[error("Invalid argument")]
    InvalidArgument  = libc::EINVAL as isize,

    //// VDO status codes below
    #[error("Unknown error")]
    Unknown          = 1024,
    #[error("Logical block number out of range")]
    OutOfRange       = 1025,
    #[error("Reference count would become invalid")]
    RefCountInvalid  = 1026,
    #[error("Out of space")]
    NoSpace          = 1027,
    #[error("Bad configuration option")]
    BadConfiguration = 1029,
    #[error("Bad block map page")]
    BadPage          = 1033,
    #[error("A lock is held incorrectly")]
    LockError        = 1044,
    #[error("The device is in read-only mode")]
    ReadOnly         = 1045,
    #[error("The device is shutting down")]
    ShuttingDown     = 1046,
    #[error("Recovery journal entries corrupted")]
    CorruptJournal   = 1047,
    #[error("Compressed block fragment is invalid")]
    InvalidFragment  = 1049,
    #[error("Invalid block mapping")]
    BadMapping       = 1052,
}

impl Error {
    /// Does this error mean that the engine's own metadata can no longer be
    /// trusted?  Such errors always latch the device read-only.
    pub fn is_metadata_error(self) -> bool {
        matches!(self,
            Error::RefCountInvalid |
            Error::BadPage |
            Error::LockError |
            Error::CorruptJournal |
            Error::BadMapping)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::Unknown)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// How a logical block is mapped onto its physical block.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum MappingState {
    /// Never written, or discarded.
    #[default]
    Unmapped,
    /// The physical block holds the logical block's data verbatim.
    Uncompressed,
    /// The physical block is a compressed block; the data lives in this
    /// fragment slot.
    Compressed(u8),
}

impl MappingState {
    pub fn is_compressed(self) -> bool {
        matches!(self, MappingState::Compressed(_))
    }

    pub fn is_mapped(self) -> bool {
        self != MappingState::Unmapped
    }
}

/// A physical location as stored in the block map or the dedupe index.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct DataLocation {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl DataLocation {
    pub fn new(pbn: Pbn, state: MappingState) -> Self {
        DataLocation { pbn, state }
    }
}

/// A physical location together with the physical zone that owns it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ZonedPbn {
    pub pbn: Pbn,
    pub state: MappingState,
    /// Meaningless for the zero block.
    pub zone: ZoneId,
}

impl ZonedPbn {
    pub fn location(&self) -> DataLocation {
        DataLocation::new(self.pbn, self.state)
    }
}

/// 128-bit content fingerprint of one data block.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct RecordName(pub [u8; 16]);

impl Display for RecordName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
