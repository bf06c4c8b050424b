// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The device-wide pool of GPU memory blocks.
//!
//! Paths and rasters live in blocks allocated on the GPU. The host never sees the
//! allocation: it only owns the buffers, the permanent descriptor set binding them,
//! and the dispatch initializing them, which every later dispatch happens-after.

use bytemuck::{Pod, Zeroable};

use crate::backend::Status;
use crate::config::{BlockPoolConfig, HandleConfig};
use crate::grid::GridId;
use crate::pool::{BlockPoolSet, DescriptorPools, LayoutKind, Slot};
use crate::recording::{BufferProxy, Dispatch, Kernel, Recording};
use crate::{Error, Result};

const INIT_WORKGROUP_SIZE: u32 = 256;

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct BlockPoolInitPush {
    block_count: u32,
    block_dwords: u32,
}

pub(crate) struct BlockPool {
    ids: BufferProxy,
    host_map: BufferProxy,
    pub(crate) slot: Slot<BlockPoolSet>,
    config: BlockPoolConfig,
    /// The initialization dispatch, until it completes.
    pub(crate) init: Option<GridId>,
    pub(crate) failed: bool,
}

impl BlockPool {
    pub(crate) fn new(
        config: &BlockPoolConfig,
        handles: &HandleConfig,
        pools: &mut DescriptorPools,
    ) -> Result<Self> {
        let blocks = BufferProxy::new(
            u64::from(config.block_count) * u64::from(config.block_dwords) * 4,
            "block pool blocks",
        );
        // The id ring is preceded by its read and write atomics.
        let ids = BufferProxy::new(8 + u64::from(config.block_count) * 4, "block pool ids");
        let host_map = BufferProxy::new(u64::from(handles.count) * 4, "block pool host map");
        let slot = pools
            .block_pool
            .try_acquire()
            .ok_or(Error::InvalidArgs("block pool descriptor set is taken"))?;
        let template = pools.block_pool.get_mut(&slot);
        template.blocks = Some(blocks);
        template.ids = Some(ids);
        template.host_map = Some(host_map);
        Ok(Self {
            ids,
            host_map,
            slot,
            config: *config,
            init: None,
            failed: false,
        })
    }

    pub(crate) fn record_init(&self) -> Recording {
        let mut recording = Recording::new("block pool init");
        recording.clear_all(self.ids);
        recording.clear_all(self.host_map);
        recording.dispatch(
            Dispatch::new(Kernel::BlockPoolInit)
                .set(LayoutKind::BlockPool, self.slot.index())
                .push_constants(&BlockPoolInitPush {
                    block_count: self.config.block_count,
                    block_dwords: self.config.block_dwords,
                }),
            (self.config.block_count.div_ceil(INIT_WORKGROUP_SIZE), 1, 1),
        );
        recording
    }

    pub(crate) fn init_complete(&mut self, status: Status) {
        self.init = None;
        if status.is_failure() {
            log::error!("block pool initialization failed, every dispatch will fail");
            self.failed = true;
        } else {
            log::debug!(
                "block pool: {} blocks of {} dwords",
                self.config.block_count,
                self.config.block_dwords
            );
        }
    }
}
