// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed capacities of a target device.
//!
//! Nothing in here is computed by Spinel: the values describe the target and are
//! supplied once, when the [`Context`](crate::Context) is created.

use crate::{Error, Result};

/// Sizing of every ring, pool and table on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetConfig {
    pub composition: CompositionConfig,
    pub styling: StylingConfig,
    pub descriptors: DescriptorConfig,
    pub tile: TileConfig,
    pub ttck: TtckConfig,
    pub handles: HandleConfig,
    pub block_pool: BlockPoolConfig,
    pub scheduler: SchedulerConfig,
    pub submit: SubmitConfig,
}

/// Place-command ring of a composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompositionConfig {
    /// Number of place commands the ring holds.
    pub ring_size: u32,
    /// Number of place commands gathered before a place dispatch is launched eagerly.
    ///
    /// Must not exceed `ring_size`.
    pub eager_size: u32,
    /// Capacity of the sorted key buffer, in keys.
    pub ttcks_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StylingConfig {
    /// Largest styling a client may create, in dwords.
    pub max_dwords: u32,
}

/// Number of descriptor sets allocated for each layout.
///
/// The size of a pool bounds how many dispatches using that layout may be in
/// flight at once. The block pool layout always has exactly one set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorConfig {
    pub ttcks: u32,
    pub styling: u32,
    pub surface: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileConfig {
    pub width_log2: u32,
    pub height_log2: u32,
}

impl TileConfig {
    pub fn width(&self) -> u32 {
        1 << self.width_log2
    }

    pub fn height(&self) -> u32 {
        1 << self.height_log2
    }
}

/// Bit widths of the tile coordinates packed into a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtckConfig {
    pub tile_x_bits: u32,
    pub tile_y_bits: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleConfig {
    /// Number of path and raster handles.
    pub count: u32,
    /// Number of released handles batched into one reclaim dispatch.
    pub reclaim_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPoolConfig {
    pub block_dwords: u32,
    pub block_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Submissions that may be executing on the GPU at once.
    pub max_in_flight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitConfig {
    /// Semaphores a single render submission may wait on.
    pub max_wait_semaphores: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            composition: CompositionConfig {
                ring_size: 8192,
                eager_size: 1024,
                ttcks_size: 1 << 20,
            },
            styling: StylingConfig { max_dwords: 1 << 16 },
            descriptors: DescriptorConfig {
                ttcks: 4,
                styling: 4,
                surface: 2,
            },
            tile: TileConfig {
                width_log2: 4,
                height_log2: 4,
            },
            ttck: TtckConfig {
                tile_x_bits: 12,
                tile_y_bits: 12,
            },
            handles: HandleConfig {
                count: 1 << 14,
                reclaim_size: 64,
            },
            block_pool: BlockPoolConfig {
                block_dwords: 256,
                block_count: 1 << 16,
            },
            scheduler: SchedulerConfig { max_in_flight: 16 },
            submit: SubmitConfig {
                max_wait_semaphores: 8,
            },
        }
    }
}

impl TargetConfig {
    /// Checks that the capacities are usable together.
    pub fn validate(&self) -> Result<()> {
        let composition = &self.composition;
        if composition.ring_size == 0 || composition.eager_size == 0 {
            return Err(Error::InvalidArgs("place ring must not be empty"));
        }
        if composition.eager_size > composition.ring_size {
            return Err(Error::InvalidArgs("eager size exceeds place ring size"));
        }
        let descriptors = &self.descriptors;
        if descriptors.ttcks == 0 || descriptors.styling == 0 || descriptors.surface == 0 {
            return Err(Error::InvalidArgs("descriptor pools must not be empty"));
        }
        if self.handles.count == 0 || self.handles.reclaim_size == 0 {
            return Err(Error::InvalidArgs("handle pool must not be empty"));
        }
        if self.scheduler.max_in_flight == 0 {
            return Err(Error::InvalidArgs("at least one submission must be in flight"));
        }
        if self.ttck.tile_x_bits > 16 || self.ttck.tile_y_bits > 16 {
            return Err(Error::InvalidArgs("tile index widths exceed 16 bits"));
        }
        if self.tile.width_log2 > 8 || self.tile.height_log2 > 8 {
            return Err(Error::InvalidArgs("tiles larger than 256 pixels"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TargetConfig::default().validate().unwrap();
    }

    #[test]
    fn eager_window_bounded_by_ring() {
        let mut config = TargetConfig::default();
        config.composition.eager_size = config.composition.ring_size + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidArgs(_))));
    }
}
