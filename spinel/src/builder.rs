// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Path and raster creation.
//!
//! Geometry is opaque to the host: segments and fills are copied to the GPU as-is
//! and turned into blocks by the path copy and rasterize kernels.

use bytemuck::{Pod, Zeroable};

use crate::block_pool::BlockPool;
use crate::device::Device;
use crate::handle::{Handle, HandleKind, Path, Raster};
use crate::pool::LayoutKind;
use crate::recording::{BufferProxy, Dispatch, Kernel, Recording};
use crate::task::Task;
use crate::{Error, Result};

const WORKGROUP_SIZE: u32 = 64;

const SEGMENT_LINE: u32 = 0;
const SEGMENT_QUAD: u32 = 1;
const SEGMENT_CUBIC: u32 = 2;

/// One segment of a path outline.
#[derive(Copy, Clone, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Segment {
    pub kind: u32,
    pub _reserved: u32,
    /// Control points. Unused trailing points are zero.
    pub points: [[f32; 2]; 4],
}

impl Segment {
    pub fn line(p0: [f32; 2], p1: [f32; 2]) -> Self {
        Self {
            kind: SEGMENT_LINE,
            _reserved: 0,
            points: [p0, p1, [0.0; 2], [0.0; 2]],
        }
    }

    pub fn quad(p0: [f32; 2], p1: [f32; 2], p2: [f32; 2]) -> Self {
        Self {
            kind: SEGMENT_QUAD,
            _reserved: 0,
            points: [p0, p1, p2, [0.0; 2]],
        }
    }

    pub fn cubic(p0: [f32; 2], p1: [f32; 2], p2: [f32; 2], p3: [f32; 2]) -> Self {
        Self {
            kind: SEGMENT_CUBIC,
            _reserved: 0,
            points: [p0, p1, p2, p3],
        }
    }
}

/// A path filled into a raster, with its transform and clip.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Fill {
    pub path: Path,
    /// Affine transform `[a, b, c, d, e, f]`, applied as `(a*x + c*y + e, b*x + d*y + f)`.
    pub transform: [f32; 6],
    /// Clip rectangle `[x0, y0, x1, y1]`.
    pub clip: [f32; 4],
}

impl Fill {
    pub fn new(path: Path) -> Self {
        Self {
            path,
            transform: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            clip: [f32::MIN, f32::MIN, f32::MAX, f32::MAX],
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: [f32; 6]) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn with_clip(mut self, clip: [f32; 4]) -> Self {
        self.clip = clip;
        self
    }
}

/// The GPU form of a [`Fill`].
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct FillCmd {
    path: u32,
    _reserved: u32,
    transform: [f32; 6],
    clip: [f32; 4],
}

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct BuilderPush {
    handle: u32,
    count: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Segment>(), 40);
static_assertions::const_assert_eq!(std::mem::size_of::<FillCmd>(), 48);

pub(crate) fn record_paths_copy(
    block_pool: &BlockPool,
    path: Handle,
    segments: &[Segment],
) -> Recording {
    let mut recording = Recording::new("paths");
    let staging = BufferProxy::new(std::mem::size_of_val(segments) as u64, "path segments");
    recording.upload(staging, bytemuck::cast_slice::<_, u8>(segments));
    let count = segments.len() as u32;
    recording.dispatch(
        Dispatch::new(Kernel::PathsCopy)
            .set(LayoutKind::BlockPool, block_pool.slot.index())
            .buffer(staging)
            .push_constants(&BuilderPush {
                handle: path.raw(),
                count,
            }),
        (count.div_ceil(WORKGROUP_SIZE), 1, 1),
    );
    recording.free_buffer(staging);
    recording
}

pub(crate) fn record_rasterize(
    block_pool: &BlockPool,
    raster: Handle,
    fills: &[FillCmd],
) -> Recording {
    let mut recording = Recording::new("rasterize");
    let staging = BufferProxy::new(std::mem::size_of_val(fills) as u64, "raster fills");
    recording.upload(staging, bytemuck::cast_slice::<_, u8>(fills));
    let count = fills.len() as u32;
    recording.dispatch(
        Dispatch::new(Kernel::Rasterize)
            .set(LayoutKind::BlockPool, block_pool.slot.index())
            .buffer(staging)
            .push_constants(&BuilderPush {
                handle: raster.raw(),
                count,
            }),
        (count.div_ceil(WORKGROUP_SIZE), 1, 1),
    );
    recording.free_buffer(staging);
    recording
}

impl Device {
    pub(crate) fn path_create(&mut self, segments: &[Segment]) -> Result<Path> {
        if segments.is_empty() {
            return Err(Error::InvalidArgs("path has no segments"));
        }
        let path = self.acquire_handle(HandleKind::Path)?;
        let id = self.attach(
            Task::PathsCopy {
                path,
                segments: segments.to_vec(),
            },
            &[],
        );
        self.grid.start(id);
        self.handles.set_producer(path, id);
        Ok(Path(path))
    }

    /// Rasterizes fills of existing paths.
    ///
    /// The paths are retained until the rasterize dispatch has completed.
    pub(crate) fn raster_create(&mut self, fills: &[Fill]) -> Result<Raster> {
        if fills.is_empty() {
            return Err(Error::InvalidArgs("raster has no fills"));
        }
        let paths: Vec<Handle> = fills.iter().map(|fill| fill.path.0).collect();
        self.handles.validate_retain(HandleKind::Path, &paths)?;
        let raster = match self.acquire_handle(HandleKind::Raster) {
            Ok(raster) => raster,
            Err(err) => {
                self.handles.release_all(&paths);
                return Err(err);
            }
        };
        let deps: Vec<_> = paths
            .iter()
            .filter_map(|&path| self.handles.producer(path))
            .collect();
        let cmds = fills
            .iter()
            .map(|fill| FillCmd {
                path: fill.path.0.raw(),
                _reserved: 0,
                transform: fill.transform,
                clip: fill.clip,
            })
            .collect();
        let id = self.attach(
            Task::Rasterize {
                raster,
                fills: cmds,
                paths,
            },
            &deps,
        );
        self.grid.start(id);
        self.handles.set_producer(raster, id);
        Ok(Raster(raster))
    }

    pub(crate) fn rasterize_complete(&mut self, paths: &[Handle]) {
        self.handles.release_all(paths);
        self.reclaim(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_points_are_zero() {
        let quad = Segment::quad([1.0, 2.0], [3.0, 4.0], [5.0, 6.0]);
        assert_eq!(quad.kind, SEGMENT_QUAD);
        assert_eq!(quad.points[3], [0.0, 0.0]);
        let line = Segment::line([0.0; 2], [1.0; 2]);
        assert_eq!(bytemuck::bytes_of(&line).len(), 40);
    }

    #[test]
    fn fill_defaults_to_identity() {
        let fill = Fill::new(Path::from_raw(7)).with_clip([0.0, 0.0, 16.0, 16.0]);
        assert_eq!(fill.transform, [1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(fill.clip, [0.0, 0.0, 16.0, 16.0]);
    }
}
