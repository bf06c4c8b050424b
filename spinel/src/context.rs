// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::backend::Backend;
use crate::builder::{Fill, Segment};
use crate::composition::{Composition, CompositionInfo};
use crate::config::TargetConfig;
use crate::device::Device;
use crate::handle::{Handle, HandleKind, Path, Raster};
use crate::pool::LayoutKind;
use crate::render::RenderSubmit;
use crate::styling::{Styling, StylingInfo};
use crate::Result;

/// Progress counters of a [`Context`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextStatus {
    /// Submissions the GPU has not completed yet.
    pub in_flight: u32,
    /// Dispatch nodes, open or started.
    pub nodes: usize,
    pub free_descriptor_sets: [(LayoutKind, usize); 4],
    pub live_handles: usize,
    pub pending_reclaim: usize,
}

/// The entry point of Spinel: one device, driven from one thread.
///
/// Calls that need to wait for the GPU keep the device running while they do;
/// see [`Backend`] for how completions get back to it. Dropping a context waits
/// for every submission in flight.
pub struct Context {
    device: Device,
}

impl Context {
    pub fn new(config: TargetConfig, backend: impl Backend + 'static) -> Result<Self> {
        let device = Device::new(config, Box::new(backend))?;
        Ok(Self { device })
    }

    pub fn config(&self) -> &TargetConfig {
        &self.device.config
    }

    /// Creates a path from its segments.
    pub fn path_create(&mut self, segments: &[Segment]) -> Result<Path> {
        self.device.path_create(segments)
    }

    pub fn path_retain(&mut self, paths: &[Path]) -> Result<()> {
        let handles: Vec<Handle> = paths.iter().map(|path| path.0).collect();
        self.device
            .handles
            .validate_retain(HandleKind::Path, &handles)
    }

    pub fn path_release(&mut self, paths: &[Path]) -> Result<()> {
        let handles: Vec<Handle> = paths.iter().map(|path| path.0).collect();
        self.device.release_handles(HandleKind::Path, &handles)
    }

    /// Creates a raster from fills of existing paths.
    pub fn raster_create(&mut self, fills: &[Fill]) -> Result<Raster> {
        self.device.raster_create(fills)
    }

    pub fn raster_retain(&mut self, rasters: &[Raster]) -> Result<()> {
        let handles: Vec<Handle> = rasters.iter().map(|raster| raster.0).collect();
        self.device
            .handles
            .validate_retain(HandleKind::Raster, &handles)
    }

    pub fn raster_release(&mut self, rasters: &[Raster]) -> Result<()> {
        let handles: Vec<Handle> = rasters.iter().map(|raster| raster.0).collect();
        self.device.release_handles(HandleKind::Raster, &handles)
    }

    /// Creates an empty, sealed composition.
    pub fn composition_create(&mut self) -> Result<Composition> {
        self.device.composition_create()
    }

    pub fn composition_retain(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_retain(composition)
    }

    /// Drops a reference. The composition is destroyed once neither the client
    /// nor any dispatch or render refers to it.
    pub fn composition_release(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_release(composition)
    }

    /// Places rasters at the given layers, optionally translated.
    ///
    /// A sealed composition is unsealed first, without reset.
    pub fn composition_place(
        &mut self,
        composition: Composition,
        rasters: &[Raster],
        layer_ids: &[u32],
        txtys: Option<&[[i32; 2]]>,
    ) -> Result<()> {
        self.device
            .composition_place(composition, rasters, layer_ids, txtys)
    }

    pub fn composition_seal(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_seal(composition)
    }

    /// Reopens a composition for placing, discarding its places if `reset` is set.
    ///
    /// A blocking unseal waiting on a lock held by the caller fails with
    /// [`Error::Stalled`](crate::Error::Stalled). The composition stays `Unsealing`
    /// and finishes unsealing when the lock is dropped.
    pub fn composition_unseal(
        &mut self,
        composition: Composition,
        block: bool,
        reset: bool,
    ) -> Result<()> {
        self.device.composition_unseal(composition, block, reset)
    }

    /// Unseals the composition and drops everything placed into it.
    pub fn composition_reset(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_unseal(composition, true, true)
    }

    pub fn composition_set_clip(&mut self, composition: Composition, clip: [u32; 4]) -> Result<()> {
        self.device.composition_set_clip(composition, clip)
    }

    pub fn composition_clone(&mut self, composition: Composition) -> Result<Composition> {
        self.device.composition_clone(composition)
    }

    pub fn composition_get_bounds(&self, composition: Composition) -> Result<[i32; 4]> {
        self.device.composition_get_bounds(composition)
    }

    pub fn composition_info(&self, composition: Composition) -> Result<CompositionInfo> {
        self.device.composition_info(composition)
    }

    /// Keeps the composition from being unsealed until the matching
    /// [`composition_unlock_and_release`](Self::composition_unlock_and_release).
    pub fn composition_retain_and_lock(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_retain_and_lock(composition)
    }

    pub fn composition_unlock_and_release(&mut self, composition: Composition) -> Result<()> {
        self.device.composition_unlock_and_release(composition)
    }

    /// Creates an unsealed styling holding up to `dwords` dwords.
    pub fn styling_create(&mut self, dwords: u32) -> Result<Styling> {
        self.device.styling_create(dwords)
    }

    pub fn styling_retain(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_retain(styling)
    }

    pub fn styling_release(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_release(styling)
    }

    pub fn styling_alloc(&mut self, styling: Styling, dwords: u32) -> Result<u32> {
        self.device.styling_alloc(styling, dwords)
    }

    pub fn styling_write(&mut self, styling: Styling, offset: u32, data: &[u32]) -> Result<()> {
        self.device.styling_write(styling, offset, data)
    }

    pub fn styling_seal(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_seal(styling)
    }

    pub fn styling_unseal(&mut self, styling: Styling, block: bool) -> Result<()> {
        self.device.styling_unseal(styling, block)
    }

    pub fn styling_reset(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_reset(styling)
    }

    pub fn styling_info(&self, styling: Styling) -> Result<StylingInfo> {
        self.device.styling_info(styling)
    }

    pub fn styling_retain_and_lock(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_retain_and_lock(styling)
    }

    pub fn styling_unlock_and_release(&mut self, styling: Styling) -> Result<()> {
        self.device.styling_unlock_and_release(styling)
    }

    /// Seals the composition and styling of `submit` and renders them.
    pub fn render(&mut self, submit: &RenderSubmit) -> Result<()> {
        self.device.render(submit)
    }

    /// Submits ready work and retires completions without blocking.
    ///
    /// Returns whether anything happened.
    pub fn poll(&mut self) -> bool {
        self.device.poll()
    }

    /// Waits until every started dispatch has completed.
    pub fn drain(&mut self) -> Result<()> {
        self.device.drain()
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            in_flight: self.device.in_flight(),
            nodes: self.device.grid.len(),
            free_descriptor_sets: self.device.pools.free_counts(),
            live_handles: self.device.handles.live(),
            pending_reclaim: self.device.handles.pending_reclaim(),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.device.drain() {
            log::warn!("dropping context: {err}");
        }
    }
}
