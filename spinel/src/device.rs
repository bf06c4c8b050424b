// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-device run loop.
//!
//! Everything here runs on the thread owning the [`Context`](crate::Context). GPU
//! completions arrive on the scheduler's channel and are only acted upon inside
//! [`Device::pump`], so no node, pool or object table is ever touched from another
//! thread.

use crate::arena::Arena;
use crate::backend::{Backend, Status};
use crate::block_pool::BlockPool;
use crate::composition::CompositionImpl;
use crate::config::TargetConfig;
use crate::grid::{Grid, GridId};
use crate::handle::{Handle, HandleKind, HandlePool};
use crate::pool::{BlockPoolSet, DescriptorLayout, DescriptorPools, Slot};
use crate::recording::Recording;
use crate::scheduler::{Completion, Scheduler};
use crate::styling::StylingImpl;
use crate::task::Task;
use crate::{Error, Result};

pub(crate) struct Device {
    pub(crate) config: TargetConfig,
    backend: Box<dyn Backend>,
    pub(crate) grid: Grid<Task>,
    scheduler: Scheduler,
    pub(crate) pools: DescriptorPools,
    pub(crate) handles: HandlePool,
    pub(crate) block_pool: BlockPool,
    pub(crate) compositions: Arena<CompositionImpl>,
    pub(crate) stylings: Arena<StylingImpl>,
    pub(crate) reclaims_in_flight: u32,
}

impl Device {
    pub(crate) fn new(config: TargetConfig, mut backend: Box<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let mut pools = DescriptorPools::new(&config.descriptors);
        let block_pool = BlockPool::new(&config.block_pool, &config.handles, &mut pools)?;
        let bindings = BlockPoolSet::bindings(pools.block_pool.get(&block_pool.slot));
        backend.update_descriptor_set(BlockPoolSet::KIND, block_pool.slot.index(), &bindings);
        let mut device = Self {
            scheduler: Scheduler::new(config.scheduler.max_in_flight),
            handles: HandlePool::new(config.handles.count, config.handles.reclaim_size),
            config,
            backend,
            grid: Grid::default(),
            pools,
            block_pool,
            compositions: Arena::default(),
            stylings: Arena::default(),
            reclaims_in_flight: 0,
        };
        let init = device.grid.attach(Task::BlockPoolInit, &[]);
        device.grid.start(init);
        device.block_pool.init = Some(init);
        Ok(device)
    }

    /// Creates a node which also happens-after the block pool initialization.
    pub(crate) fn attach(&mut self, task: Task, deps: &[GridId]) -> GridId {
        let id = self.grid.attach(task, deps);
        if let Some(init) = self.block_pool.init {
            self.grid.happens_after(id, init);
        }
        log::trace!("grid: attach {id:?} ({})", self.grid.task(id).map_or("?", Task::label));
        id
    }

    /// Submits ready nodes and retires completions until neither is possible.
    ///
    /// Returns whether anything happened.
    pub(crate) fn pump(&mut self) -> bool {
        let mut progress = false;
        loop {
            let mut step = false;
            while let Some(completion) = self.scheduler.try_recv() {
                self.complete(completion);
                step = true;
            }
            while self.scheduler.has_capacity() {
                let Some(id) = self.grid.pop_ready() else {
                    break;
                };
                self.execute(id);
                step = true;
            }
            if !step {
                return progress;
            }
            progress = true;
        }
    }

    /// Lets the backend make progress without blocking, then pumps.
    pub(crate) fn poll(&mut self) -> bool {
        let progress = self.pump();
        self.backend.wait(false);
        self.pump() || progress
    }

    /// Keeps the device running until `pred` no longer holds.
    ///
    /// This is the only place Spinel blocks, and it only does so when no ready
    /// node can be submitted and no completion is pending. A wait with nothing in
    /// flight could never end and fails with [`Error::Stalled`] instead.
    pub(crate) fn wait_while(
        &mut self,
        what: &'static str,
        mut pred: impl FnMut(&Self) -> bool,
    ) -> Result<()> {
        while pred(self) {
            if self.pump() {
                continue;
            }
            if self.scheduler.in_flight() == 0 {
                return Err(Error::Stalled(what));
            }
            log::trace!("device: blocking on {what}");
            self.backend.wait(true);
            if let Some(completion) = self.scheduler.recv() {
                self.complete(completion);
            }
        }
        Ok(())
    }

    /// Waits for every started node to complete.
    pub(crate) fn drain(&mut self) -> Result<()> {
        self.reclaim(true);
        self.wait_while("device idle", |device| device.grid.started() > 0)
    }

    fn execute(&mut self, id: GridId) {
        let signal = self.scheduler.submit(id);
        if self.grid.is_poisoned(id) || self.block_pool.failed {
            log::warn!("grid: not submitting {id:?}, a predecessor failed");
            signal.signal(Status::Failed);
            return;
        }
        let recording = match self.grid.task(id) {
            Some(task) => self.record(task),
            None => Recording::default(),
        };
        log::trace!(
            "grid: execute {id:?} '{}' ({} commands)",
            recording.label,
            recording.commands.len()
        );
        self.backend.submit(recording, signal);
    }

    fn complete(&mut self, completion: Completion) {
        log::trace!("grid: complete {completion:?}");
        if let Some(task) = self.grid.complete(completion.node, completion.status) {
            self.dispose(task, completion.status);
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.scheduler.in_flight()
    }

    /// Takes a free descriptor set, waiting for in-flight dispatches to return one.
    pub(crate) fn acquire_descriptor_set<L: DescriptorLayout>(&mut self) -> Result<Slot<L>> {
        loop {
            if let Some(slot) = L::pool_mut(&mut self.pools).try_acquire() {
                return Ok(slot);
            }
            self.wait_while("descriptor set", |device| L::pool(&device.pools).is_empty())?;
        }
    }

    pub(crate) fn release_descriptor_set<L: DescriptorLayout>(&mut self, slot: Slot<L>) {
        L::pool_mut(&mut self.pools).release(slot);
    }

    /// Copies the template of `slot` into the live descriptor set.
    pub(crate) fn update_descriptor_set<L: DescriptorLayout>(&mut self, slot: &Slot<L>) {
        let bindings = L::bindings(L::pool(&self.pools).get(slot));
        self.backend
            .update_descriptor_set(L::KIND, slot.index(), &bindings);
    }

    /// Takes a handle, reclaiming released ones if the table is full.
    pub(crate) fn acquire_handle(&mut self, kind: HandleKind) -> Result<Handle> {
        loop {
            if let Some(handle) = self.handles.acquire(kind) {
                return Ok(handle);
            }
            self.reclaim(true);
            if self.reclaims_in_flight == 0 {
                return Err(Error::HandlePoolExhausted);
            }
            self.wait_while("handle reclaim", |device| !device.handles.has_free())?;
        }
    }

    /// Launches reclaim dispatches for released handles.
    ///
    /// Unless `force` is set, only full batches are launched.
    pub(crate) fn reclaim(&mut self, force: bool) {
        while let Some(handles) = self.handles.take_reclaim_batch(force) {
            let deps: Vec<GridId> = handles
                .iter()
                .filter_map(|&handle| self.handles.producer(handle))
                .collect();
            log::trace!("handles: reclaiming {}", handles.len());
            let id = self.attach(Task::Reclaim { handles }, &deps);
            self.grid.start(id);
            self.reclaims_in_flight += 1;
        }
    }

    /// Releases handles, after checking that every one of them holds enough references.
    pub(crate) fn release_handles(&mut self, kind: HandleKind, handles: &[Handle]) -> Result<()> {
        self.handles.validate_release(kind, handles)?;
        self.handles.release_all(handles);
        self.reclaim(false);
        Ok(())
    }
}
