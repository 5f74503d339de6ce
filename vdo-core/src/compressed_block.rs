// vim: tw=80
//! On-disk format of compressed blocks
//!
//! A compressed block packs up to [`MAX_COMPRESSION_SLOTS`] lz4-compressed
//! fragments behind a small header: a version word followed by the size of
//! each slot's fragment, all little-endian.  Fragment bytes follow the
//! header in slot order.

use crate::types::*;
use tracing::debug;

pub const MAX_COMPRESSION_SLOTS: usize = 14;
const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 2 + 2 * MAX_COMPRESSION_SLOTS;
/// Space available for fragments in one compressed block
pub const PACKER_BIN_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;
/// The compressed size recorded for data which would not fit in a bin
pub const INCOMPRESSIBLE: usize = BLOCK_SIZE + 1;

/// Compress one block.  Returns `None` if the result could never share a
/// compressed block with anything else.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let compressed = lz4_flex::block::compress(data);
    if compressed.len() < PACKER_BIN_SIZE {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress one fragment back into a full block.
pub fn decompress(fragment: &[u8]) -> Result<Vec<u8>> {
    let data = lz4_flex::block::decompress(fragment, BLOCK_SIZE)
        .map_err(|e| {
            debug!("Corrupt compressed fragment: {e}");
            Error::InvalidFragment
        })?;
    if data.len() == BLOCK_SIZE {
        Ok(data)
    } else {
        Err(Error::InvalidFragment)
    }
}

/// Assemble fragments into one compressed block.  The fragment at index `i`
/// lands in slot `i`.
pub fn pack<'a, I>(fragments: I) -> Result<Vec<u8>>
    where I: IntoIterator<Item=&'a [u8]>
{
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..2].copy_from_slice(&VERSION.to_le_bytes());
    let mut offset = HEADER_SIZE;
    for (slot, fragment) in fragments.into_iter().enumerate() {
        if slot >= MAX_COMPRESSION_SLOTS ||
            offset + fragment.len() > BLOCK_SIZE
        {
            return Err(Error::InvalidFragment);
        }
        let size = u16::try_from(fragment.len())
            .map_err(|_| Error::InvalidFragment)?;
        block[2 + 2 * slot..4 + 2 * slot].copy_from_slice(&size.to_le_bytes());
        block[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
    }
    Ok(block)
}

/// Locate one slot's fragment within a compressed block.
pub fn fragment(block: &[u8], slot: u8) -> Result<&[u8]> {
    let slot = usize::from(slot);
    if block.len() != BLOCK_SIZE || slot >= MAX_COMPRESSION_SLOTS {
        return Err(Error::InvalidFragment);
    }
    if u16::from_le_bytes([block[0], block[1]]) != VERSION {
        return Err(Error::InvalidFragment);
    }
    let size_of = |i: usize| {
        usize::from(u16::from_le_bytes([block[2 + 2 * i], block[3 + 2 * i]]))
    };
    let offset = HEADER_SIZE + (0..slot).map(size_of).sum::<usize>();
    let size = size_of(slot);
    if size == 0 || offset + size > BLOCK_SIZE {
        return Err(Error::InvalidFragment);
    }
    Ok(&block[offset..offset + size])
}

/// Read one slot of a compressed block back into a full block of data.
pub fn uncompress_fragment(block: &[u8], slot: u8) -> Result<Vec<u8>> {
    decompress(fragment(block, slot)?)
}

// LCOV_EXCL_STOP
