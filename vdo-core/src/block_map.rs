// vim: tw=80
//! The block map: each LBN's current physical location
//!
//! The map is divided into pages of [`ENTRIES_PER_PAGE`] entries.  Each page
//! belongs to exactly one logical zone, which is the only code that ever
//! touches it.  Pages are created by the first write that needs them.

use crate::{
    slab::SlabLayout,
    types::*,
};
use metrohash::MetroBuildHasher;
use std::collections::HashMap;
use tracing::error;

/// Number of mappings in one block map page
pub const ENTRIES_PER_PAGE: u64 = 812;

/// The page holding `lbn`'s mapping
pub fn page_of(lbn: Lbn) -> u64 {
    lbn / ENTRIES_PER_PAGE
}

/// One logical zone's share of the block map
#[derive(Debug, Default)]
pub(crate) struct BlockMapZone {
    pages: HashMap<u64, Box<[DataLocation]>, MetroBuildHasher>,
}

impl BlockMapZone {
    /// Locate `lbn`'s slot, creating its page if `allocate`.  Returns whether
    /// the page exists.
    pub fn find_slot(&mut self, lbn: Lbn, allocate: bool) -> bool {
        let page = page_of(lbn);
        if allocate {
            self.pages.entry(page).or_insert_with(|| {
                vec![DataLocation::default(); ENTRIES_PER_PAGE as usize]
                    .into_boxed_slice()
            });
            true
        } else {
            self.pages.contains_key(&page)
        }
    }

    /// Look up `lbn`'s mapping.  A missing page means the LBN is unmapped.
    pub fn get(&self, lbn: Lbn, layout: &SlabLayout) -> Result<DataLocation> {
        let Some(page) = self.pages.get(&page_of(lbn)) else {
            return Ok(DataLocation::default());
        };
        let location = page[slot_of(lbn)];
        let valid = match location.state {
            MappingState::Unmapped => location.pbn == ZERO_BLOCK,
            MappingState::Uncompressed => location.pbn == ZERO_BLOCK ||
                layout.is_data_block(location.pbn),
            MappingState::Compressed(_) => layout.is_data_block(location.pbn),
        };
        if valid {
            Ok(location)
        } else {
            error!(lbn, pbn = location.pbn, state = ?location.state,
                   "Invalid block map entry");
            Err(Error::BadMapping)
        }
    }

    /// Number of pages which have been created
    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    /// Install a new mapping for `lbn`, returning the old one.  The page
    /// must already exist.
    pub fn put(&mut self, lbn: Lbn, location: DataLocation)
        -> Result<DataLocation>
    {
        let page = self.pages.get_mut(&page_of(lbn))
            .ok_or_else(|| {
                error!(lbn, "Updating a block map page which doesn't exist");
                Error::BadPage
            })?;
        let slot = &mut page[slot_of(lbn)];
        Ok(std::mem::replace(slot, location))
    }

    /// Replace an entry without any checks, to simulate corruption.
    #[cfg(test)]
    pub fn corrupt(&mut self, lbn: Lbn, location: DataLocation) {
        self.find_slot(lbn, true);
        if let Some(page) = self.pages.get_mut(&page_of(lbn)) {
            page[slot_of(lbn)] = location;
        }
    }
}

fn slot_of(lbn: Lbn) -> usize {
    (lbn % ENTRIES_PER_PAGE) as usize
}

// LCOV_EXCL_STOP
