// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pools of pre-allocated descriptor sets, one per layout.
//!
//! A slot is either free or held by exactly one dispatch, so the size of a pool
//! bounds how many dispatches using its layout can be in flight.

use std::fmt;
use std::marker::PhantomData;

use crate::config::DescriptorConfig;
use crate::recording::{BufferProxy, ResourceProxy};

/// The descriptor-set layouts known to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    BlockPool,
    Ttcks,
    Styling,
    Surface,
}

/// A descriptor-set layout, with the host-side template its bindings are staged in.
pub trait DescriptorLayout: Sized + 'static {
    const KIND: LayoutKind;

    type Template: Clone + Default + fmt::Debug;

    /// The resources bound by a filled template, in binding order.
    fn bindings(template: &Self::Template) -> Vec<ResourceProxy>;

    fn pool(pools: &DescriptorPools) -> &SlotPool<Self>;

    fn pool_mut(pools: &mut DescriptorPools) -> &mut SlotPool<Self>;
}

/// Device-wide memory blocks and the tables mapping handles onto them.
#[derive(Debug)]
pub enum BlockPoolSet {}

#[derive(Clone, Debug, Default)]
pub struct BlockPoolTemplate {
    pub blocks: Option<BufferProxy>,
    pub ids: Option<BufferProxy>,
    pub host_map: Option<BufferProxy>,
}

/// The sorted keys of a composition.
#[derive(Debug)]
pub enum TtcksSet {}

#[derive(Clone, Debug, Default)]
pub struct TtcksTemplate {
    /// Atomics header, including the indirect dispatch arguments.
    pub header: Option<BufferProxy>,
    pub ttcks: Option<BufferProxy>,
    pub offsets: Option<BufferProxy>,
}

#[derive(Debug)]
pub enum StylingSet {}

#[derive(Clone, Debug, Default)]
pub struct StylingTemplate {
    pub styling: Option<BufferProxy>,
}

/// The image or buffer a render writes to.
#[derive(Debug)]
pub enum SurfaceSet {}

#[derive(Clone, Debug, Default)]
pub struct SurfaceTemplate {
    pub target: Option<ResourceProxy>,
}

impl DescriptorLayout for BlockPoolSet {
    const KIND: LayoutKind = LayoutKind::BlockPool;

    type Template = BlockPoolTemplate;

    fn bindings(template: &Self::Template) -> Vec<ResourceProxy> {
        [template.blocks, template.ids, template.host_map]
            .into_iter()
            .flatten()
            .map(ResourceProxy::from)
            .collect()
    }

    fn pool(pools: &DescriptorPools) -> &SlotPool<Self> {
        &pools.block_pool
    }

    fn pool_mut(pools: &mut DescriptorPools) -> &mut SlotPool<Self> {
        &mut pools.block_pool
    }
}

impl DescriptorLayout for TtcksSet {
    const KIND: LayoutKind = LayoutKind::Ttcks;

    type Template = TtcksTemplate;

    fn bindings(template: &Self::Template) -> Vec<ResourceProxy> {
        [template.header, template.ttcks, template.offsets]
            .into_iter()
            .flatten()
            .map(ResourceProxy::from)
            .collect()
    }

    fn pool(pools: &DescriptorPools) -> &SlotPool<Self> {
        &pools.ttcks
    }

    fn pool_mut(pools: &mut DescriptorPools) -> &mut SlotPool<Self> {
        &mut pools.ttcks
    }
}

impl DescriptorLayout for StylingSet {
    const KIND: LayoutKind = LayoutKind::Styling;

    type Template = StylingTemplate;

    fn bindings(template: &Self::Template) -> Vec<ResourceProxy> {
        template.styling.map(ResourceProxy::from).into_iter().collect()
    }

    fn pool(pools: &DescriptorPools) -> &SlotPool<Self> {
        &pools.styling
    }

    fn pool_mut(pools: &mut DescriptorPools) -> &mut SlotPool<Self> {
        &mut pools.styling
    }
}

impl DescriptorLayout for SurfaceSet {
    const KIND: LayoutKind = LayoutKind::Surface;

    type Template = SurfaceTemplate;

    fn bindings(template: &Self::Template) -> Vec<ResourceProxy> {
        template.target.into_iter().collect()
    }

    fn pool(pools: &DescriptorPools) -> &SlotPool<Self> {
        &pools.surface
    }

    fn pool_mut(pools: &mut DescriptorPools) -> &mut SlotPool<Self> {
        &mut pools.surface
    }
}

/// An acquired descriptor set.
///
/// Not `Copy`: a slot goes back to its pool exactly once, by value.
pub struct Slot<L> {
    index: u32,
    _layout: PhantomData<fn() -> L>,
}

impl<L> Slot<L> {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<L: DescriptorLayout> fmt::Debug for Slot<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:?}, {})", L::KIND, self.index)
    }
}

/// A LIFO free list over the descriptor sets of one layout.
///
/// The most recently released slot is the first one handed out again, which keeps
/// the working set of descriptor sets small.
pub struct SlotPool<L: DescriptorLayout> {
    templates: Vec<L::Template>,
    free: Vec<u32>,
}

impl<L: DescriptorLayout> SlotPool<L> {
    pub fn new(count: u32) -> Self {
        Self {
            templates: vec![L::Template::default(); count as usize],
            // Reversed so that slot 0 is handed out first.
            free: (0..count).rev().collect(),
        }
    }

    pub fn try_acquire(&mut self) -> Option<Slot<L>> {
        let index = self.free.pop()?;
        log::trace!("pool: acquire {:?} {index}", L::KIND);
        Some(Slot {
            index,
            _layout: PhantomData,
        })
    }

    pub fn release(&mut self, slot: Slot<L>) {
        log::trace!("pool: release {:?} {}", L::KIND, slot.index);
        debug_assert!(!self.free.contains(&slot.index), "slot released twice");
        self.free.push(slot.index);
    }

    /// The binding template of an acquired slot.
    pub fn get(&self, slot: &Slot<L>) -> &L::Template {
        &self.templates[slot.index as usize]
    }

    pub fn get_mut(&mut self, slot: &Slot<L>) -> &mut L::Template {
        &mut self.templates[slot.index as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.templates.len()
    }
}

impl<L: DescriptorLayout> fmt::Debug for SlotPool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("layout", &L::KIND)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

/// One pool per layout.
#[derive(Debug)]
pub struct DescriptorPools {
    pub block_pool: SlotPool<BlockPoolSet>,
    pub ttcks: SlotPool<TtcksSet>,
    pub styling: SlotPool<StylingSet>,
    pub surface: SlotPool<SurfaceSet>,
}

impl DescriptorPools {
    pub fn new(config: &DescriptorConfig) -> Self {
        Self {
            block_pool: SlotPool::new(1),
            ttcks: SlotPool::new(config.ttcks),
            styling: SlotPool::new(config.styling),
            surface: SlotPool::new(config.surface),
        }
    }

    /// Free slots of every layout, in [`LayoutKind`] order.
    pub fn free_counts(&self) -> [(LayoutKind, usize); 4] {
        [
            (LayoutKind::BlockPool, self.block_pool.free_count()),
            (LayoutKind::Ttcks, self.ttcks.free_count()),
            (LayoutKind::Styling, self.styling.free_count()),
            (LayoutKind::Surface, self.surface.free_count()),
        ]
    }
}
