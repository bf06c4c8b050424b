// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The payloads of dependency grid nodes.

use crate::arena::Key;
use crate::backend::Status;
use crate::builder::{self, FillCmd, Segment};
use crate::composition::{self, PlaceCmd};
use crate::device::Device;
use crate::handle::Handle;
use crate::pool::LayoutKind;
use crate::recording::{BufferProxy, Dispatch, Kernel, Recording};
use crate::render::{self, RenderTask};
use crate::ring::Snap;
use crate::styling;

/// One unit of GPU work, with everything it keeps alive until it completes.
pub(crate) enum Task {
    BlockPoolInit,
    PathsCopy {
        path: Handle,
        segments: Vec<Segment>,
    },
    Rasterize {
        raster: Handle,
        fills: Vec<FillCmd>,
        /// Retained paths, released on completion.
        paths: Vec<Handle>,
    },
    /// Places a snapshot of a composition's ring.
    ///
    /// The snapshot is taken when the node is started; until then the node is the
    /// composition's open batch.
    Place {
        composition: Key,
        snap: Option<Snap<PlaceCmd>>,
        clip: [u32; 4],
        clear_atomics: bool,
    },
    /// Sorts the keys of a composition and finds their segment boundaries.
    Sort {
        composition: Key,
        clear_atomics: bool,
    },
    StylingSeal {
        styling: Key,
        data: Vec<u32>,
    },
    Reclaim {
        handles: Vec<Handle>,
    },
    Render(Box<RenderTask>),
}

impl Task {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::BlockPoolInit => "block pool init",
            Self::PathsCopy { .. } => "paths",
            Self::Rasterize { .. } => "rasterize",
            Self::Place { .. } => "place",
            Self::Sort { .. } => "sort",
            Self::StylingSeal { .. } => "styling",
            Self::Reclaim { .. } => "reclaim",
            Self::Render(_) => "render",
        }
    }
}

impl Device {
    /// Records the commands of a task about to be submitted.
    pub(crate) fn record(&self, task: &Task) -> Recording {
        match task {
            Task::BlockPoolInit => self.block_pool.record_init(),
            Task::PathsCopy { path, segments } => {
                builder::record_paths_copy(&self.block_pool, *path, segments)
            }
            Task::Rasterize { raster, fills, .. } => {
                builder::record_rasterize(&self.block_pool, *raster, fills)
            }
            Task::Place {
                composition,
                snap,
                clip,
                clear_atomics,
            } => match (self.compositions.get(*composition), snap) {
                (Some(target), Some(snap)) => composition::record_place(
                    &self.block_pool,
                    &target.buffers,
                    snap,
                    *clip,
                    *clear_atomics,
                ),
                _ => Recording::new("place"),
            },
            Task::Sort {
                composition,
                clear_atomics,
            } => match self.compositions.get(*composition) {
                Some(target) => {
                    composition::record_sort(&self.block_pool, &target.buffers, *clear_atomics)
                }
                None => Recording::new("sort"),
            },
            Task::StylingSeal { styling, data } => match self.stylings.get(*styling) {
                Some(target) => styling::record_seal(target.buffer, data),
                None => Recording::new("styling"),
            },
            Task::Reclaim { handles } => self.record_reclaim(handles),
            Task::Render(task) => render::record_render(&self.block_pool, task),
        }
    }

    /// Releases everything a completed task held.
    pub(crate) fn dispose(&mut self, task: Task, status: Status) {
        if status.is_failure() {
            log::warn!("dispatch '{}' failed", task.label());
        }
        match task {
            Task::BlockPoolInit => self.block_pool.init_complete(status),
            Task::PathsCopy { .. } => {}
            Task::Rasterize { paths, .. } => self.rasterize_complete(&paths),
            Task::Place {
                composition, snap, ..
            } => self.place_complete(composition, snap, status),
            Task::Sort { composition, .. } => self.sort_complete(composition, status),
            Task::StylingSeal { styling, .. } => self.styling_seal_complete(styling, status),
            Task::Reclaim { handles } => {
                self.handles.recycle(&handles);
                self.reclaims_in_flight -= 1;
            }
            Task::Render(task) => self.render_complete(*task, status),
        }
    }

    fn record_reclaim(&self, handles: &[Handle]) -> Recording {
        let ids: Vec<u32> = handles.iter().map(|handle| handle.raw()).collect();
        let mut recording = Recording::new("reclaim");
        let staging = BufferProxy::new(ids.len() as u64 * 4, "reclaim handles");
        recording.upload(staging, bytemuck::cast_slice::<_, u8>(&ids));
        recording.dispatch(
            Dispatch::new(Kernel::Reclaim)
                .set(LayoutKind::BlockPool, self.block_pool.slot.index())
                .buffer(staging)
                .push_constants(&(ids.len() as u32)),
            (1, 1, 1),
        );
        recording.free_buffer(staging);
        recording
    }
}
