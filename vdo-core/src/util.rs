// vim: tw=80
//! Common utility functions used throughout the VDO engine

use crate::types::*;
use divbuf::DivBufShared;
use metrohash::MetroHash128;
use std::{
    hash::Hasher,
    ops::{Add, Div, Sub},
};

/// Seed for record names.  Changing it invalidates every dedupe index.
const RECORD_NAME_SEED: u64 = 0x62ea_60be;

/// Compute the record name of a block of data.
///
/// The hash is not cryptographic.  Collisions are tolerated: every dedupe
/// candidate is verified byte-for-byte before it is used.
pub fn record_name<T: AsRef<[u8]> + ?Sized>(data: &T) -> RecordName {
    let mut hasher = MetroHash128::with_seed(RECORD_NAME_SEED);
    hasher.write(data.as_ref());
    let (lo, hi) = hasher.finish128();
    let mut name = [0u8; 16];
    name[..8].copy_from_slice(&lo.to_le_bytes());
    name[8..].copy_from_slice(&hi.to_le_bytes());
    RecordName(name)
}

/// Does this buffer contain nothing but zeros?
pub fn is_zero_block(data: &[u8]) -> bool {
    let (prefix, words, suffix) = unsafe { data.align_to::<u64>() };
    prefix.iter().all(|b| *b == 0) &&
        words.iter().all(|w| *w == 0) &&
        suffix.iter().all(|b| *b == 0)
}

/// Allocate a fresh zero-filled block buffer
pub fn zeroed_block() -> DivBufShared {
    DivBufShared::from(vec![0u8; BLOCK_SIZE])
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Return a Tokio runtime that doesn't spawn any threads.
#[cfg(test)]
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
