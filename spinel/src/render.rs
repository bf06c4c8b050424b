// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Render submission.
//!
//! A render reads a sealed composition and a sealed styling and writes an image
//! or a buffer. Both objects stay locked until the render completes on the GPU.

use bytemuck::{Pod, Zeroable};

use crate::arena::Key;
use crate::backend::Status;
use crate::block_pool::BlockPool;
use crate::composition::{Composition, INDIRECT_OFFSET};
use crate::config::{TileConfig, TtckConfig};
use crate::device::Device;
use crate::pool::{LayoutKind, Slot, StylingSet, SurfaceSet, TtcksSet};
use crate::recording::{
    Access, BufferProxy, Command, Dispatch, ImageBarrier, ImageLayout, ImageProxy, Kernel,
    Recording, ResourceProxy, Semaphore,
};
use crate::styling::Styling;
use crate::task::Task;
use crate::{Error, Result};

/// Describes one aspect of a render submission.
///
/// A submission carries exactly one target extension, [`ImageRender`] or
/// [`BufferRender`]. The image extensions only apply to an image target, and
/// are recorded in a fixed order regardless of their order in the list:
/// pre-barrier, pre-clear, render, post-copy, post-barrier.
///
/// [`ImageRender`]: RenderExtension::ImageRender
/// [`BufferRender`]: RenderExtension::BufferRender
#[derive(Clone, Debug, PartialEq)]
pub enum RenderExtension {
    /// Semaphores the submission waits on and signals.
    SubmitInfo {
        wait: Vec<Semaphore>,
        signal: Vec<Semaphore>,
    },
    /// Transitions the image from `old_layout`, acquiring it from another queue family.
    ImagePreBarrier {
        old_layout: ImageLayout,
        src_queue_family: Option<u32>,
    },
    /// Clears the image before rendering.
    ImagePreClear { color: [f32; 4] },
    ImageRender { image: ImageProxy },
    BufferRender { buffer: BufferProxy },
    /// Copies the rendered image into a buffer.
    ImagePostCopyToBuffer { buffer: BufferProxy },
    /// Transitions the image to `new_layout`, releasing it to another queue family.
    ImagePostBarrier {
        new_layout: ImageLayout,
        dst_queue_family: Option<u32>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSubmit {
    pub composition: Composition,
    pub styling: Styling,
    /// Pixel rectangle `[x0, y0, x1, y1]` to render.
    pub clip: [u32; 4],
    pub extensions: Vec<RenderExtension>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Image(ImageProxy),
    Buffer(BufferProxy),
}

/// A validated extension list.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RenderPlan {
    target: Option<Target>,
    wait: Vec<Semaphore>,
    signal: Vec<Semaphore>,
    pre_barrier: Option<(ImageLayout, Option<u32>)>,
    pre_clear: Option<[f32; 4]>,
    post_copy: Option<BufferProxy>,
    post_barrier: Option<(ImageLayout, Option<u32>)>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, what: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::RenderExtensionInvalid(what));
    }
    *slot = Some(value);
    Ok(())
}

impl RenderPlan {
    pub(crate) fn new(extensions: &[RenderExtension], max_wait_semaphores: usize) -> Result<Self> {
        if extensions.is_empty() {
            return Err(Error::RenderExtensionInvalid("no extensions"));
        }
        let mut plan = Self::default();
        let mut submit_info = None;
        for extension in extensions {
            match extension {
                RenderExtension::SubmitInfo { wait, signal } => {
                    set_once(&mut submit_info, (), "duplicate submit info")?;
                    if wait.len() > max_wait_semaphores {
                        return Err(Error::RenderExtensionWaitCountExceeded {
                            count: wait.len(),
                            max: max_wait_semaphores,
                        });
                    }
                    plan.wait.clone_from(wait);
                    plan.signal.clone_from(signal);
                }
                RenderExtension::ImagePreBarrier {
                    old_layout,
                    src_queue_family,
                } => set_once(
                    &mut plan.pre_barrier,
                    (*old_layout, *src_queue_family),
                    "duplicate pre-barrier",
                )?,
                RenderExtension::ImagePreClear { color } => {
                    set_once(&mut plan.pre_clear, *color, "duplicate pre-clear")?;
                }
                RenderExtension::ImageRender { image } => {
                    set_once(&mut plan.target, Target::Image(*image), "more than one target")?;
                }
                RenderExtension::BufferRender { buffer } => {
                    set_once(&mut plan.target, Target::Buffer(*buffer), "more than one target")?;
                }
                RenderExtension::ImagePostCopyToBuffer { buffer } => {
                    set_once(&mut plan.post_copy, *buffer, "duplicate post-copy")?;
                }
                RenderExtension::ImagePostBarrier {
                    new_layout,
                    dst_queue_family,
                } => set_once(
                    &mut plan.post_barrier,
                    (*new_layout, *dst_queue_family),
                    "duplicate post-barrier",
                )?,
            }
        }
        match plan.target {
            None => return Err(Error::RenderExtensionInvalid("no render target")),
            Some(Target::Buffer(_))
                if plan.pre_barrier.is_some()
                    || plan.pre_clear.is_some()
                    || plan.post_copy.is_some()
                    || plan.post_barrier.is_some() =>
            {
                return Err(Error::RenderExtensionInvalid(
                    "image extension on a buffer target",
                ));
            }
            Some(_) => {}
        }
        Ok(plan)
    }

    fn target(&self) -> Option<Target> {
        self.target
    }
}

/// Push constants of the render kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct RenderPush {
    /// Tile rectangle `[x0, y0, x1, y1]`, exclusive of `x1` and `y1`.
    pub(crate) tile_clip: [u32; 4],
}

/// Rounds a pixel clip outwards to whole tiles, clamped to the addressable tiles.
///
/// Returns `None` if no tile is covered.
pub(crate) fn tile_clip(
    clip: [u32; 4],
    tile: &TileConfig,
    ttck: &TtckConfig,
) -> Option<RenderPush> {
    let max_x = 1 << ttck.tile_x_bits;
    let max_y = 1 << ttck.tile_y_bits;
    let x0 = (clip[0] >> tile.width_log2).min(max_x);
    let y0 = (clip[1] >> tile.height_log2).min(max_y);
    let x1 = clip[2].div_ceil(tile.width()).min(max_x);
    let y1 = clip[3].div_ceil(tile.height()).min(max_y);
    (x0 < x1 && y0 < y1).then_some(RenderPush {
        tile_clip: [x0, y0, x1, y1],
    })
}

pub(crate) struct RenderTask {
    composition: Key,
    styling: Key,
    ttcks: Slot<TtcksSet>,
    styling_set: Slot<StylingSet>,
    surface: Slot<SurfaceSet>,
    plan: RenderPlan,
    push: RenderPush,
    /// The composition's atomics header, holding the indirect dispatch arguments.
    indirect: BufferProxy,
}

/// Records a render, threading the image's layout and last access between stages.
pub(crate) fn record_render(block_pool: &BlockPool, task: &RenderTask) -> Recording {
    let mut recording = Recording::new("render");
    recording.wait.clone_from(&task.plan.wait);
    recording.signal.clone_from(&task.plan.signal);
    let dispatch = Dispatch::new(Kernel::Render)
        .set(LayoutKind::BlockPool, block_pool.slot.index())
        .set(LayoutKind::Ttcks, task.ttcks.index())
        .set(LayoutKind::Styling, task.styling_set.index())
        .set(LayoutKind::Surface, task.surface.index())
        .push_constants(&task.push);
    let Some(Target::Image(image)) = task.plan.target() else {
        recording.dispatch_indirect(dispatch, task.indirect, INDIRECT_OFFSET);
        return recording;
    };
    let plan = &task.plan;
    if let Some((old_layout, src_queue_family)) = plan.pre_barrier {
        let dst_access = if plan.pre_clear.is_some() {
            Access::TransferWrite
        } else {
            Access::ShaderWrite
        };
        recording.barrier(ImageBarrier {
            image,
            old_layout,
            new_layout: ImageLayout::General,
            src_access: Access::None,
            dst_access,
            src_queue_family,
            dst_queue_family: None,
        });
    }
    if let Some(color) = plan.pre_clear {
        recording.push(Command::ClearImage(image, color));
        recording.barrier(ImageBarrier {
            image,
            old_layout: ImageLayout::General,
            new_layout: ImageLayout::General,
            src_access: Access::TransferWrite,
            dst_access: Access::ShaderWrite,
            src_queue_family: None,
            dst_queue_family: None,
        });
    }
    recording.dispatch_indirect(dispatch, task.indirect, INDIRECT_OFFSET);
    let mut layout = ImageLayout::General;
    let mut access = Access::ShaderWrite;
    if let Some(buffer) = plan.post_copy {
        recording.barrier(ImageBarrier {
            image,
            old_layout: layout,
            new_layout: ImageLayout::TransferSrc,
            src_access: access,
            dst_access: Access::TransferRead,
            src_queue_family: None,
            dst_queue_family: None,
        });
        recording.push(Command::CopyImageToBuffer(image, buffer));
        layout = ImageLayout::TransferSrc;
        access = Access::TransferRead;
    }
    if let Some((new_layout, dst_queue_family)) = plan.post_barrier {
        recording.barrier(ImageBarrier {
            image,
            old_layout: layout,
            new_layout,
            src_access: access,
            dst_access: Access::MemoryRead,
            src_queue_family: None,
            dst_queue_family,
        });
    }
    recording
}

impl Device {
    /// Seals both objects and submits a render reading them.
    ///
    /// The extension list is validated first, so a rejected render submits nothing.
    pub(crate) fn render(&mut self, submit: &RenderSubmit) -> Result<()> {
        self.composition_info(submit.composition)?;
        self.styling_info(submit.styling)?;
        let plan = RenderPlan::new(&submit.extensions, self.config.submit.max_wait_semaphores)?;

        self.composition_seal(submit.composition)?;
        self.styling_seal(submit.styling)?;

        let Some(push) = tile_clip(submit.clip, &self.config.tile, &self.config.ttck) else {
            log::debug!("render: clip {:?} covers no tiles", submit.clip);
            return Ok(());
        };

        let composition = submit.composition.0;
        let styling = submit.styling.0;
        let (buffers, sort) = match self.compositions.get(composition) {
            Some(target) => (target.buffers, target.sort),
            None => return Err(Error::InvalidArgs("composition is not live")),
        };
        let (styling_buffer, seal_node) = match self.stylings.get(styling) {
            Some(target) => (target.buffer, target.seal_node),
            None => return Err(Error::InvalidArgs("styling is not live")),
        };

        let ttcks = self.acquire_descriptor_set::<TtcksSet>()?;
        let styling_set = match self.acquire_descriptor_set::<StylingSet>() {
            Ok(slot) => slot,
            Err(err) => {
                self.release_descriptor_set(ttcks);
                return Err(err);
            }
        };
        let surface = match self.acquire_descriptor_set::<SurfaceSet>() {
            Ok(slot) => slot,
            Err(err) => {
                self.release_descriptor_set(ttcks);
                self.release_descriptor_set(styling_set);
                return Err(err);
            }
        };

        let template = self.pools.ttcks.get_mut(&ttcks);
        template.header = Some(buffers.header);
        template.ttcks = Some(buffers.ttcks);
        template.offsets = Some(buffers.offsets);
        self.pools.styling.get_mut(&styling_set).styling = Some(styling_buffer);
        self.pools.surface.get_mut(&surface).target = plan.target().map(|target| match target {
            Target::Image(image) => ResourceProxy::Image(image),
            Target::Buffer(buffer) => ResourceProxy::Buffer(buffer),
        });
        self.update_descriptor_set(&ttcks);
        self.update_descriptor_set(&styling_set);
        self.update_descriptor_set(&surface);

        self.composition_lock(composition);
        self.styling_lock(styling);
        let deps: Vec<_> = sort.into_iter().chain(seal_node).collect();
        let node = self.attach(
            Task::Render(Box::new(RenderTask {
                composition,
                styling,
                ttcks,
                styling_set,
                surface,
                plan,
                push,
                indirect: buffers.header,
            })),
            &deps,
        );
        self.grid.force(node);
        log::debug!("render: submitted {node:?}, tiles {:?}", push.tile_clip);
        Ok(())
    }

    pub(crate) fn render_complete(&mut self, task: RenderTask, status: Status) {
        let RenderTask {
            composition,
            styling,
            ttcks,
            styling_set,
            surface,
            ..
        } = task;
        self.release_descriptor_set(ttcks);
        self.release_descriptor_set(styling_set);
        self.release_descriptor_set(surface);
        if status.is_failure() {
            self.composition_failed(composition, "render");
            self.styling_failed(styling, "render");
        }
        self.composition_unlock(composition);
        self.styling_unlock(styling);
    }
}
