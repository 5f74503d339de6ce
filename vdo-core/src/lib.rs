// vim: tw=80
//! A deduplicating, compressing virtual block device
//!
//! Every host request becomes a data_vio, which travels between zones by
//! message until its data is written (or shared, or packed into a compressed
//! block) and its new mapping is recorded.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Zone handlers take a data_vio by value, and boxing it keeps the messages
// small.
#![allow(clippy::boxed_local)]

mod ack_zone;
mod block_map;
mod cleanup;
mod compression;
mod cpu_zone;
mod data_vio;
mod data_vio_pool;
mod hash_lock;
mod hash_zone;
mod logical_zone;
mod packer;
mod pbn_lock;
mod physical_zone;
mod read_only;
mod recovery_journal;
mod slab;
mod submitter;
mod vdo;
mod zone;

pub mod bio;
pub mod compressed_block;
pub mod config;
pub mod device;
pub mod index;
pub mod statistics;
pub mod types;
pub mod util;

pub use crate::bio::{Bio, Operation, Reply};
pub use crate::config::VdoConfig;
pub use crate::device::{BlockDevice, BoxDeviceFut, MemoryDevice};
pub use crate::index::{BoxIndexFut, DedupeIndex, LruIndex, MemoryIndex};
pub use crate::recovery_journal::{JournalEntry, JournalOperation};
pub use crate::statistics::VdoStatistics;
pub use crate::types::*;
pub use crate::util::*;
pub use crate::vdo::Vdo;
