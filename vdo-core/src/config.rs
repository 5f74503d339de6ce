// vim: tw=80
//! Runtime configuration of a VDO instance

use crate::{
    types::*,
    util::div_roundup,
};
use serde_derive::{Deserialize, Serialize};
use tracing::error;

/// Most logical zones a VDO may be configured with
pub const MAX_LOGICAL_ZONES: usize = 60;
/// Most physical zones a VDO may be configured with
pub const MAX_PHYSICAL_ZONES: usize = 16;
/// Most hash zones a VDO may be configured with
pub const MAX_HASH_ZONES: usize = 100;

/// Parameters of a VDO instance.  Every field has a default, so a YAML file
/// need only mention what it changes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VdoConfig {
    /// Size of the host-visible address space, in blocks
    pub logical_blocks: u64,
    /// Size of the underlying storage, in blocks, including the zero block
    pub physical_blocks: u64,
    /// Blocks per slab
    pub slab_blocks: u64,
    pub logical_zones: usize,
    pub physical_zones: usize,
    pub hash_zones: usize,
    /// Maximum number of simultaneously active requests
    pub pool_size: usize,
    /// Maximum number of simultaneously active discards.  Defaults to 75% of
    /// `pool_size`.
    pub discard_limit: Option<usize>,
    /// Number of packer bins
    pub packer_bins: usize,
    /// Should data be compressed?  May be changed at runtime.
    pub compression: bool,
    /// Should the dedupe index be consulted?
    pub deduplication: bool,
    /// Capacity of the in-memory dedupe index, in records
    pub index_capacity: usize,
    pub journal_entries_per_block: usize,
}

impl Default for VdoConfig {
    fn default() -> Self {
        VdoConfig {
            logical_blocks: 1 << 20,
            physical_blocks: 1 << 18,
            slab_blocks: 1 << 13,
            logical_zones: 1,
            physical_zones: 1,
            hash_zones: 1,
            pool_size: 2048,
            discard_limit: None,
            packer_bins: 16,
            compression: false,
            deduplication: true,
            index_capacity: 1 << 16,
            journal_entries_per_block: 311,
        }
    }
}

impl VdoConfig {
    /// Number of blocks available for user data
    pub fn data_blocks(&self) -> u64 {
        self.physical_blocks.saturating_sub(1)
    }

    /// Effective limit on concurrent discards
    pub fn discard_limit(&self) -> usize {
        self.discard_limit.unwrap_or(self.pool_size * 3 / 4).max(1)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: VdoConfig = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                error!("Cannot parse configuration: {e}");
                Error::BadConfiguration
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn slab_count(&self) -> u64 {
        div_roundup(self.data_blocks(), self.slab_blocks)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|e| {
            error!("Cannot serialize configuration: {e}");
            Error::BadConfiguration
        })
    }

    /// Check that the configuration describes a usable VDO.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            error!("Invalid configuration: {reason}");
            Err(Error::BadConfiguration)
        };
        if self.logical_blocks == 0 {
            return invalid("logical_blocks must be nonzero");
        }
        if self.physical_blocks < 2 {
            return invalid("physical_blocks must be at least 2");
        }
        if self.slab_blocks == 0 {
            return invalid("slab_blocks must be nonzero");
        }
        if !(1..=MAX_LOGICAL_ZONES).contains(&self.logical_zones) {
            return invalid("logical_zones out of range");
        }
        if !(1..=MAX_PHYSICAL_ZONES).contains(&self.physical_zones) {
            return invalid("physical_zones out of range");
        }
        if !(1..=MAX_HASH_ZONES).contains(&self.hash_zones) {
            return invalid("hash_zones out of range");
        }
        if self.slab_count() < self.physical_zones as u64 {
            return invalid("every physical zone needs at least one slab");
        }
        if self.pool_size == 0 {
            return invalid("pool_size must be nonzero");
        }
        if self.discard_limit() > self.pool_size {
            return invalid("discard_limit may not exceed pool_size");
        }
        if self.packer_bins == 0 {
            return invalid("packer_bins must be nonzero");
        }
        if self.index_capacity == 0 {
            return invalid("index_capacity must be nonzero");
        }
        if self.journal_entries_per_block == 0 {
            return invalid("journal_entries_per_block must be nonzero");
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
