// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A [`Backend`] executing recordings with [`wgpu`].
//!
//! The kernels themselves are not part of this crate. The client registers a
//! compute pipeline for every [`Kernel`] it uses, along with the bind group
//! layouts of the descriptor-set pools, before the backend is handed to a
//! [`Context`](crate::Context).
//!
//! Descriptor sets map to bind groups: a dispatch binds its sets at group indices
//! `0..n` and, if it binds buffers directly, one more group at index `n` built
//! from the kernel's buffer layout. Push constants require
//! [`wgpu::Features::PUSH_CONSTANTS`].
//!
//! Barriers are implied by wgpu's resource tracking and semaphores have no wgpu
//! counterpart: both are ignored.

use std::collections::HashMap;

use thiserror::Error;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindingResource, Buffer,
    BufferUsages, CommandEncoder, CommandEncoderDescriptor, ComputePassDescriptor,
    ComputePipeline, Device, Extent3d, ImageCopyBuffer, ImageCopyTexture, ImageDataLayout,
    Maintain, Origin3d, Queue, Texture, TextureAspect, TextureViewDescriptor,
};

use crate::backend::{Backend, Status};
use crate::pool::LayoutKind;
use crate::recording::{
    BufferProxy, Command, Dispatch, ImageProxy, Kernel, Recording, ResourceId, ResourceProxy,
};
use crate::scheduler::CompletionSignal;

/// Errors encoding a recording.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WgpuBackendError {
    #[error("No pipeline registered for kernel {0:?}")]
    MissingKernel(Kernel),
    #[error("Kernel {0:?} binds buffers directly but has no buffer layout")]
    MissingBufferLayout(Kernel),
    #[error("No bind group layout registered for {0:?} sets")]
    MissingSetLayout(LayoutKind),
    #[error("{0:?} set {1} was bound before it was updated")]
    MissingSet(LayoutKind, u32),
    #[error("Image {0:?} was used without being registered")]
    MissingImage(ResourceId),
    #[error("Buffer '{0}' was used without being created")]
    MissingBuffer(&'static str),
}

type Result<T, E = WgpuBackendError> = std::result::Result<T, E>;

struct KernelPipeline {
    pipeline: ComputePipeline,
    buffers_layout: Option<BindGroupLayout>,
}

/// Recycled buffers, by size class.
#[derive(Default)]
struct ResourcePool {
    bufs: HashMap<u64, Vec<Buffer>>,
}

const SIZE_CLASS_BITS: u32 = 1;

const BUFFER_USAGE: BufferUsages = BufferUsages::STORAGE
    .union(BufferUsages::COPY_SRC)
    .union(BufferUsages::COPY_DST)
    .union(BufferUsages::INDIRECT);

impl ResourcePool {
    /// Get a buffer from the pool or create one.
    fn get_buf(&mut self, size: u64, name: &'static str, device: &Device) -> Buffer {
        let rounded_size = Self::size_class(size, SIZE_CLASS_BITS);
        if let Some(buf) = self.bufs.get_mut(&rounded_size).and_then(Vec::pop) {
            return buf;
        }
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: rounded_size,
            usage: BUFFER_USAGE,
            mapped_at_creation: false,
        })
    }

    fn put_buf(&mut self, buf: Buffer) {
        self.bufs.entry(buf.size()).or_default().push(buf);
    }

    /// Quantize a size up to the nearest size class.
    fn size_class(x: u64, bits: u32) -> u64 {
        if x > 1 << bits {
            let a = (x - 1).leading_zeros();
            let b = (x - 1) | (((u64::MAX / 2) >> bits) >> a);
            b + 1
        } else {
            1 << bits
        }
    }
}

/// Executes recordings on a wgpu device and queue.
pub struct WgpuBackend {
    device: Device,
    queue: Queue,
    kernels: HashMap<Kernel, KernelPipeline>,
    set_layouts: HashMap<LayoutKind, BindGroupLayout>,
    sets: HashMap<(LayoutKind, u32), BindGroup>,
    buffers: HashMap<ResourceId, Buffer>,
    images: HashMap<ResourceId, Texture>,
    pool: ResourcePool,
}

impl WgpuBackend {
    pub fn new(device: Device, queue: Queue) -> Self {
        Self {
            device,
            queue,
            kernels: HashMap::new(),
            set_layouts: HashMap::new(),
            sets: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            pool: ResourcePool::default(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Registers the pipeline dispatched for `kernel`.
    ///
    /// `buffers_layout` describes the buffers the kernel binds directly, if any.
    pub fn register_kernel(
        &mut self,
        kernel: Kernel,
        pipeline: ComputePipeline,
        buffers_layout: Option<BindGroupLayout>,
    ) {
        self.kernels.insert(
            kernel,
            KernelPipeline {
                pipeline,
                buffers_layout,
            },
        );
    }

    /// Registers the bind group layout shared by every set of a pool.
    pub fn register_set_layout(&mut self, layout: LayoutKind, bind_group_layout: BindGroupLayout) {
        self.set_layouts.insert(layout, bind_group_layout);
    }

    /// Binds a client texture to an image proxy used as a render target.
    pub fn register_image(&mut self, proxy: &ImageProxy, texture: Texture) {
        self.images.insert(proxy.id, texture);
    }

    /// Binds a client buffer to a buffer proxy, for render targets and readback.
    pub fn register_buffer(&mut self, proxy: &BufferProxy, buffer: Buffer) {
        self.buffers.insert(proxy.id, buffer);
    }

    fn materialize(&mut self, proxy: &BufferProxy) {
        if !self.buffers.contains_key(&proxy.id) {
            let buf = self.pool.get_buf(proxy.size, proxy.name, &self.device);
            self.buffers.insert(proxy.id, buf);
        }
    }

    fn materialize_all(&mut self, recording: &Recording) {
        for command in &recording.commands {
            match command {
                Command::Upload(proxy, _)
                | Command::Clear(proxy, _, _)
                | Command::CopyImageToBuffer(_, proxy) => self.materialize(proxy),
                Command::Dispatch(dispatch, _) => {
                    for proxy in &dispatch.buffers {
                        self.materialize(proxy);
                    }
                }
                Command::DispatchIndirect(dispatch, indirect, _) => {
                    self.materialize(indirect);
                    for proxy in &dispatch.buffers {
                        self.materialize(proxy);
                    }
                }
                Command::ClearImage(..) | Command::Barrier(_) | Command::FreeBuffer(_) => {}
            }
        }
    }

    fn buffer(&self, proxy: &BufferProxy) -> Result<&Buffer> {
        self.buffers
            .get(&proxy.id)
            .ok_or(WgpuBackendError::MissingBuffer(proxy.name))
    }

    fn texture(&self, proxy: &ImageProxy) -> Result<&Texture> {
        self.images
            .get(&proxy.id)
            .ok_or(WgpuBackendError::MissingImage(proxy.id))
    }

    fn encode(&mut self, recording: &Recording) -> Result<(CommandEncoder, Vec<ResourceId>)> {
        self.materialize_all(recording);
        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some(recording.label),
        });
        let mut freed = Vec::new();
        for command in &recording.commands {
            match command {
                Command::Upload(proxy, bytes) => {
                    self.queue.write_buffer(self.buffer(proxy)?, 0, bytes);
                }
                Command::Clear(proxy, offset, size) => {
                    encoder.clear_buffer(self.buffer(proxy)?, *offset, *size);
                }
                Command::ClearImage(proxy, [r, g, b, a]) => {
                    let view = self
                        .texture(proxy)?
                        .create_view(&TextureViewDescriptor::default());
                    let color = wgpu::Color {
                        r: f64::from(*r),
                        g: f64::from(*g),
                        b: f64::from(*b),
                        a: f64::from(*a),
                    };
                    // A render pass without draws only performs its load op.
                    let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("clear image"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(color),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                Command::Barrier(barrier) => {
                    log::trace!(
                        "wgpu: barrier {:?} -> {:?} on image {:?}",
                        barrier.old_layout,
                        barrier.new_layout,
                        barrier.image.id
                    );
                }
                Command::Dispatch(dispatch, (x, y, z)) => {
                    let kernel = self.kernel(dispatch.kernel)?;
                    let groups = self.bind_groups(dispatch, kernel)?;
                    let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: Some(recording.label),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&kernel.pipeline);
                    bind(&mut cpass, dispatch, groups.as_ref(), &self.sets);
                    cpass.dispatch_workgroups(*x, *y, *z);
                }
                Command::DispatchIndirect(dispatch, indirect, offset) => {
                    let kernel = self.kernel(dispatch.kernel)?;
                    let groups = self.bind_groups(dispatch, kernel)?;
                    let indirect = self.buffer(indirect)?;
                    let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: Some(recording.label),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&kernel.pipeline);
                    bind(&mut cpass, dispatch, groups.as_ref(), &self.sets);
                    cpass.dispatch_workgroups_indirect(indirect, *offset);
                }
                Command::CopyImageToBuffer(image, buffer) => {
                    let texture = self.texture(image)?;
                    let bytes_per_row = (image.width * 4)
                        .next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
                    encoder.copy_texture_to_buffer(
                        ImageCopyTexture {
                            texture,
                            mip_level: 0,
                            origin: Origin3d::ZERO,
                            aspect: TextureAspect::All,
                        },
                        ImageCopyBuffer {
                            buffer: self.buffer(buffer)?,
                            layout: ImageDataLayout {
                                offset: 0,
                                bytes_per_row: Some(bytes_per_row),
                                rows_per_image: None,
                            },
                        },
                        Extent3d {
                            width: image.width,
                            height: image.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::FreeBuffer(proxy) => freed.push(proxy.id),
            }
        }
        Ok((encoder, freed))
    }

    fn kernel(&self, kernel: Kernel) -> Result<&KernelPipeline> {
        self.kernels
            .get(&kernel)
            .ok_or(WgpuBackendError::MissingKernel(kernel))
    }

    /// Checks the dispatch's sets and builds the group of its direct buffers.
    fn bind_groups(
        &self,
        dispatch: &Dispatch,
        kernel: &KernelPipeline,
    ) -> Result<Option<BindGroup>> {
        for set in &dispatch.sets {
            if !self.sets.contains_key(&(set.layout, set.slot)) {
                return Err(WgpuBackendError::MissingSet(set.layout, set.slot));
            }
        }
        if dispatch.buffers.is_empty() {
            return Ok(None);
        }
        let layout = kernel
            .buffers_layout
            .as_ref()
            .ok_or(WgpuBackendError::MissingBufferLayout(dispatch.kernel))?;
        let entries = dispatch
            .buffers
            .iter()
            .enumerate()
            .map(|(binding, proxy)| {
                Ok(BindGroupEntry {
                    binding: binding as u32,
                    resource: self.buffer(proxy)?.as_entire_binding(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(self.device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout,
            entries: &entries,
        })))
    }
}

fn bind<'a>(
    cpass: &mut wgpu::ComputePass<'a>,
    dispatch: &Dispatch,
    buffers: Option<&'a BindGroup>,
    sets: &'a HashMap<(LayoutKind, u32), BindGroup>,
) {
    let mut index = 0;
    for set in &dispatch.sets {
        // Checked by `bind_groups`.
        if let Some(group) = sets.get(&(set.layout, set.slot)) {
            cpass.set_bind_group(index, group, &[]);
        }
        index += 1;
    }
    if let Some(group) = buffers {
        cpass.set_bind_group(index, group, &[]);
    }
    if !dispatch.push.is_empty() {
        cpass.set_push_constants(0, &dispatch.push);
    }
}

impl Backend for WgpuBackend {
    fn update_descriptor_set(&mut self, layout: LayoutKind, slot: u32, bindings: &[ResourceProxy]) {
        for binding in bindings {
            if let ResourceProxy::Buffer(proxy) = binding {
                self.materialize(proxy);
            }
        }
        let Some(bind_group_layout) = self.set_layouts.get(&layout) else {
            log::error!("wgpu: {}", WgpuBackendError::MissingSetLayout(layout));
            return;
        };
        let mut views = Vec::new();
        for binding in bindings {
            if let ResourceProxy::Image(proxy) = binding {
                match self.texture(proxy) {
                    Ok(texture) => {
                        views.push(texture.create_view(&TextureViewDescriptor::default()));
                    }
                    Err(err) => {
                        log::error!("wgpu: updating {layout:?} set {slot}: {err}");
                        return;
                    }
                }
            }
        }
        let mut views = views.iter();
        let mut entries = Vec::with_capacity(bindings.len());
        for (binding, proxy) in bindings.iter().enumerate() {
            let resource = match proxy {
                ResourceProxy::Buffer(proxy) => match self.buffer(proxy) {
                    Ok(buffer) => buffer.as_entire_binding(),
                    Err(err) => {
                        log::error!("wgpu: updating {layout:?} set {slot}: {err}");
                        return;
                    }
                },
                ResourceProxy::Image(_) => match views.next() {
                    Some(view) => BindingResource::TextureView(view),
                    None => return,
                },
            };
            entries.push(BindGroupEntry {
                binding: binding as u32,
                resource,
            });
        }
        let group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("spinel descriptor set"),
            layout: bind_group_layout,
            entries: &entries,
        });
        self.sets.insert((layout, slot), group);
    }

    fn submit(&mut self, recording: Recording, signal: CompletionSignal) {
        if !recording.wait.is_empty() || !recording.signal.is_empty() {
            log::warn!(
                "wgpu: '{}' ignores {} wait and {} signal semaphores",
                recording.label,
                recording.wait.len(),
                recording.signal.len()
            );
        }
        match self.encode(&recording) {
            Ok((encoder, freed)) => {
                self.queue.submit(Some(encoder.finish()));
                self.queue
                    .on_submitted_work_done(move || signal.signal(Status::Success));
                // Later writes to recycled buffers are ordered after this submission.
                for id in freed {
                    if let Some(buf) = self.buffers.remove(&id) {
                        self.pool.put_buf(buf);
                    }
                }
            }
            Err(err) => {
                log::error!("wgpu: encoding '{}': {err}", recording.label);
                signal.signal(Status::Failed);
            }
        }
    }

    fn wait(&mut self, block: bool) {
        let maintain = if block { Maintain::Wait } else { Maintain::Poll };
        self.device.poll(maintain);
    }
}

#[cfg(test)]
mod tests {
    use super::ResourcePool;

    #[test]
    fn size_classes() {
        assert_eq!(ResourcePool::size_class(1, 1), 2);
        assert_eq!(ResourcePool::size_class(16, 1), 16);
        assert_eq!(ResourcePool::size_class(17, 1), 24);
        assert_eq!(ResourcePool::size_class(40, 1), 48);
    }
}
