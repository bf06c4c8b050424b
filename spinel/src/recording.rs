// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The commands of one GPU submission, independent of the API executing them.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::pool::LayoutKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Proxy used as a handle to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferProxy {
    pub size: u64,
    pub id: ResourceId,
    pub name: &'static str,
}

impl BufferProxy {
    pub fn new(size: u64, name: &'static str) -> Self {
        let id = ResourceId::next();
        debug_assert!(size > 0);
        Self { id, size, name }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba8,
    Bgra8,
}

/// Proxy used as a handle to an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageProxy {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub id: ResourceId,
}

impl ImageProxy {
    pub fn new(width: u32, height: u32, format: ImageFormat) -> Self {
        let id = ResourceId::next();
        Self {
            width,
            height,
            format,
            id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceProxy {
    Buffer(BufferProxy),
    Image(ImageProxy),
}

impl From<BufferProxy> for ResourceProxy {
    fn from(value: BufferProxy) -> Self {
        Self::Buffer(value)
    }
}

impl From<ImageProxy> for ResourceProxy {
    fn from(value: ImageProxy) -> Self {
        Self::Image(value)
    }
}

/// An external semaphore, passed through to the backend untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Semaphore(pub u64);

/// The compute kernels Spinel dispatches. Their contents are opaque to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    BlockPoolInit,
    PathsCopy,
    Rasterize,
    Place,
    TtcksSort,
    TtcksSegment,
    Reclaim,
    Render,
}

/// A descriptor set bound to a dispatch, by pool and slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetRef {
    pub layout: LayoutKind,
    pub slot: u32,
}

/// Image layouts a render target moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// Memory access performed on either side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    None,
    TransferWrite,
    TransferRead,
    ShaderWrite,
    MemoryRead,
}

/// Layout transition and, optionally, queue family ownership transfer of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageProxy,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: Access,
    pub dst_access: Access,
    pub src_queue_family: Option<u32>,
    pub dst_queue_family: Option<u32>,
}

/// A compute kernel with its bindings.
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub kernel: Kernel,
    /// Descriptor sets, in set-index order.
    pub sets: SmallVec<[SetRef; 4]>,
    /// Buffers bound directly, after the descriptor sets.
    pub buffers: SmallVec<[BufferProxy; 4]>,
    /// Push constants.
    pub push: Vec<u8>,
}

impl Dispatch {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            sets: SmallVec::new(),
            buffers: SmallVec::new(),
            push: Vec::new(),
        }
    }

    pub fn set(mut self, layout: LayoutKind, slot: u32) -> Self {
        self.sets.push(SetRef { layout, slot });
        self
    }

    pub fn buffer(mut self, buffer: BufferProxy) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn push_constants<T: bytemuck::Pod>(mut self, value: &T) -> Self {
        self.push = bytemuck::bytes_of(value).to_vec();
        self
    }
}

/// Single command inside a [`Recording`] to get executed by a backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Commands the data to be uploaded to the given buffer.
    Upload(BufferProxy, Vec<u8>),
    /// Commands to clear the buffer from an offset on for a length of the given size.
    /// If the size is [None], it clears until the end.
    Clear(BufferProxy, u64, Option<u64>),
    /// Clears a whole image to a color.
    ClearImage(ImageProxy, [f32; 4]),
    Barrier(ImageBarrier),
    Dispatch(Dispatch, (u32, u32, u32)),
    /// Dispatch a kernel whose workgroup count is read from a buffer at an offset.
    DispatchIndirect(Dispatch, BufferProxy, u64),
    CopyImageToBuffer(ImageProxy, BufferProxy),
    /// The buffer is not used by any later recording.
    FreeBuffer(BufferProxy),
}

/// List of [`Command`]s for a backend to execute in order, as one submission.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recording {
    pub label: &'static str,
    pub commands: Vec<Command>,
    /// Semaphores the submission waits on before starting.
    pub wait: Vec<Semaphore>,
    /// Semaphores signalled when the submission completes.
    pub signal: Vec<Semaphore>,
}

impl Recording {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ..Default::default()
        }
    }

    /// Appends a [`Command`] to the back of the [`Recording`].
    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    /// Commands the given data to be uploaded to `buf`.
    pub fn upload(&mut self, buf: BufferProxy, data: impl Into<Vec<u8>>) {
        self.push(Command::Upload(buf, data.into()));
    }

    /// Commands to clear the whole buffer.
    pub fn clear_all(&mut self, buf: BufferProxy) {
        self.push(Command::Clear(buf, 0, None));
    }

    pub fn dispatch(&mut self, dispatch: Dispatch, wg_size: (u32, u32, u32)) {
        self.push(Command::Dispatch(dispatch, wg_size));
    }

    /// Do an indirect dispatch.
    ///
    /// The `buf` argument contains the dispatch size, 3 `u32` values beginning
    /// at the given byte `offset`.
    pub fn dispatch_indirect(&mut self, dispatch: Dispatch, buf: BufferProxy, offset: u64) {
        self.push(Command::DispatchIndirect(dispatch, buf, offset));
    }

    pub fn barrier(&mut self, barrier: ImageBarrier) {
        self.push(Command::Barrier(barrier));
    }

    /// Commands to free the given buffer.
    pub fn free_buffer(&mut self, buf: BufferProxy) {
        self.push(Command::FreeBuffer(buf));
    }

    /// The kernels dispatched by this recording, in order.
    pub fn kernels(&self) -> impl Iterator<Item = Kernel> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Dispatch(dispatch, _) | Command::DispatchIndirect(dispatch, _, _) => {
                Some(dispatch.kernel)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_in_order() {
        let indirect = BufferProxy::new(16, "indirect");
        let mut recording = Recording::new("sort");
        recording.clear_all(indirect);
        recording.dispatch_indirect(Dispatch::new(Kernel::TtcksSort), indirect, 0);
        recording.dispatch_indirect(Dispatch::new(Kernel::TtcksSegment), indirect, 0);
        assert_eq!(
            recording.kernels().collect::<Vec<_>>(),
            [Kernel::TtcksSort, Kernel::TtcksSegment]
        );
    }
}
