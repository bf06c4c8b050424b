// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compositions: placed rasters, sorted into tile keys on the GPU.
//!
//! Place commands accumulate in the composition's ring and are flushed to the GPU
//! in batches, each batch one place dispatch. Sealing launches the sort dispatch,
//! which happens-after every place dispatch of the current epoch. A composition
//! is only rendered once sealed, and only unsealed again once no render holds a
//! lock on it.
//!
//! ```text
//!            seal                   sort completes
//! UNSEALED --------> SEALING ------------------------> SEALED
//!    ^                  |                                 |
//!    |                  | unseal                          | unseal
//!    |                  v                                 |
//!    `------------- UNSEALING <---------------------------'
//!      sort completed and no locks
//! ```

use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::arena::Key;
use crate::backend::Status;
use crate::block_pool::BlockPool;
use crate::device::Device;
use crate::grid::GridId;
use crate::handle::{Handle, HandleKind, Raster};
use crate::pool::LayoutKind;
use crate::recording::{BufferProxy, Dispatch, Kernel, Recording};
use crate::ring::{ExtentRing, Snap};
use crate::seal::SealState;
use crate::task::Task;
use crate::{Error, Result};

const PLACE_WORKGROUP_SIZE: u32 = 32;

/// Byte offset of the indirect dispatch arguments in the atomics header.
pub(crate) const INDIRECT_OFFSET: u64 = 8;

/// A composition created by [`Context::composition_create`](crate::Context::composition_create).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Composition(pub(crate) Key);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct PlaceCmd {
    pub(crate) raster: u32,
    pub(crate) layer_id: u32,
    pub(crate) txty: [i32; 2],
}

/// Counters written by the place and sort passes, followed by the indirect
/// dispatch arguments the sort pass computes from them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct Atomics {
    pub(crate) keys: u32,
    pub(crate) offsets: u32,
    pub(crate) indirect: [u32; 3],
    pub(crate) _padding: [u32; 3],
}

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct PlacePush {
    base: u32,
    count: u32,
    _padding: [u32; 2],
    clip: [u32; 4],
}

static_assertions::const_assert_eq!(mem::size_of::<PlaceCmd>(), 16);
static_assertions::const_assert_eq!(mem::size_of::<Atomics>(), 32);
static_assertions::const_assert_eq!(mem::offset_of!(Atomics, indirect), INDIRECT_OFFSET as usize);

#[derive(Clone, Copy, Debug)]
pub(crate) struct CompositionBuffers {
    pub(crate) header: BufferProxy,
    pub(crate) ttcks: BufferProxy,
    pub(crate) offsets: BufferProxy,
}

/// A snapshot of a composition's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompositionInfo {
    pub state: SealState,
    /// Client references.
    pub refs: u32,
    /// Renders reading the composition.
    pub locks: u32,
    /// Raster references held for placed commands.
    pub saved: usize,
    /// Free entries of the place ring.
    pub ring_rem: u32,
    /// Keys produced by completed place dispatches since the last reset.
    pub keys: u32,
    /// Segment offsets produced by the last completed sort.
    pub offsets: u32,
    pub places_in_flight: u32,
}

pub(crate) struct CompositionImpl {
    pub(crate) state: SealState,
    user_refs: u32,
    /// Client references, render locks and dispatches in flight.
    refs: u32,
    locks: u32,
    ring: ExtentRing<PlaceCmd>,
    saved: Vec<Handle>,
    /// The open place batch, not yet started.
    wip: Option<GridId>,
    places_in_flight: u32,
    /// The sort of the current epoch.
    pub(crate) sort: Option<GridId>,
    sorting: bool,
    /// Host mirror of the GPU counters.
    atomics: Atomics,
    clear_atomics: bool,
    pub(crate) buffers: CompositionBuffers,
    clip: [u32; 4],
    pending_reset: bool,
    failed: Option<&'static str>,
}

pub(crate) fn record_place(
    block_pool: &BlockPool,
    buffers: &CompositionBuffers,
    snap: &Snap<PlaceCmd>,
    clip: [u32; 4],
    clear_atomics: bool,
) -> Recording {
    let mut recording = Recording::new("place");
    if clear_atomics {
        recording.clear_all(buffers.header);
    }
    let count = snap.len();
    let staging = BufferProxy::new(u64::from(count) * 16, "place commands");
    recording.upload(staging, bytemuck::cast_slice::<_, u8>(&snap.items));
    recording.dispatch(
        Dispatch::new(Kernel::Place)
            .set(LayoutKind::BlockPool, block_pool.slot.index())
            .buffer(staging)
            .buffer(buffers.header)
            .buffer(buffers.ttcks)
            .push_constants(&PlacePush {
                base: snap.base,
                count,
                _padding: [0; 2],
                clip,
            }),
        (count.div_ceil(PLACE_WORKGROUP_SIZE), 1, 1),
    );
    recording.free_buffer(staging);
    recording
}

pub(crate) fn record_sort(
    block_pool: &BlockPool,
    buffers: &CompositionBuffers,
    clear_atomics: bool,
) -> Recording {
    let mut recording = Recording::new("sort");
    if clear_atomics {
        recording.clear_all(buffers.header);
    }
    recording.dispatch_indirect(
        Dispatch::new(Kernel::TtcksSort)
            .set(LayoutKind::BlockPool, block_pool.slot.index())
            .buffer(buffers.header)
            .buffer(buffers.ttcks),
        buffers.header,
        INDIRECT_OFFSET,
    );
    recording.dispatch_indirect(
        Dispatch::new(Kernel::TtcksSegment)
            .buffer(buffers.header)
            .buffer(buffers.ttcks)
            .buffer(buffers.offsets),
        buffers.header,
        INDIRECT_OFFSET,
    );
    recording
}

impl Device {
    pub(crate) fn composition_create(&mut self) -> Result<Composition> {
        let config = self.config.composition;
        let buffers = CompositionBuffers {
            header: BufferProxy::new(mem::size_of::<Atomics>() as u64, "composition atomics"),
            ttcks: BufferProxy::new(u64::from(config.ttcks_size) * 8, "ttcks"),
            offsets: BufferProxy::new(u64::from(config.ttcks_size) * 4, "ttck offsets"),
        };
        let key = self.compositions.insert(CompositionImpl {
            state: SealState::Sealed,
            user_refs: 1,
            refs: 1,
            locks: 0,
            ring: ExtentRing::new(config.ring_size, config.eager_size),
            saved: Vec::new(),
            wip: None,
            places_in_flight: 0,
            sort: None,
            sorting: false,
            atomics: Atomics::zeroed(),
            clear_atomics: true,
            buffers,
            clip: [0, 0, u32::MAX, u32::MAX],
            pending_reset: false,
            failed: None,
        });
        log::debug!("composition {key:?}: created");
        Ok(Composition(key))
    }

    fn live_composition(&self, composition: Composition) -> Result<Key> {
        match self.compositions.get(composition.0) {
            Some(target) if target.user_refs > 0 => Ok(composition.0),
            _ => Err(Error::InvalidArgs("composition is not live")),
        }
    }

    fn composition_state(&self, key: Key) -> Option<SealState> {
        self.compositions.get(key).map(|target| target.state)
    }

    pub(crate) fn composition_retain(&mut self, composition: Composition) -> Result<()> {
        let key = self.live_composition(composition)?;
        if let Some(target) = self.compositions.get_mut(key) {
            target.user_refs += 1;
            target.refs += 1;
        }
        Ok(())
    }

    pub(crate) fn composition_release(&mut self, composition: Composition) -> Result<()> {
        let key = self.live_composition(composition)?;
        if let Some(target) = self.compositions.get_mut(key) {
            target.user_refs -= 1;
        }
        self.release_composition_ref(key);
        Ok(())
    }

    fn release_composition_ref(&mut self, key: Key) {
        let Some(target) = self.compositions.get_mut(key) else {
            return;
        };
        target.refs -= 1;
        if target.refs > 0 {
            return;
        }
        let Some(target) = self.compositions.remove(key) else {
            return;
        };
        debug_assert!(!target.sorting && target.places_in_flight == 0);
        for node in [target.wip, target.sort].into_iter().flatten() {
            self.grid.detach(node);
        }
        self.handles.release_all(&target.saved);
        self.reclaim(false);
        log::debug!("composition {key:?}: destroyed");
    }

    /// Places rasters into a composition, unsealing it first if needed.
    ///
    /// Every raster is validated before anything is retained or appended. The
    /// call waits for ring space when the GPU has not yet consumed earlier batches.
    pub(crate) fn composition_place(
        &mut self,
        composition: Composition,
        rasters: &[Raster],
        layer_ids: &[u32],
        txtys: Option<&[[i32; 2]]>,
    ) -> Result<()> {
        let key = self.live_composition(composition)?;
        if rasters.len() != layer_ids.len() || txtys.is_some_and(|t| t.len() != rasters.len()) {
            return Err(Error::InvalidArgs("place argument lengths differ"));
        }
        if rasters.is_empty() {
            return Ok(());
        }
        let handles: Vec<Handle> = rasters.iter().map(|raster| raster.0).collect();
        for &handle in &handles {
            self.handles.validate(HandleKind::Raster, handle)?;
        }
        if self.composition_state(key) != Some(SealState::Unsealed) {
            self.composition_unseal(composition, true, false)?;
        }
        self.handles.validate_retain(HandleKind::Raster, &handles)?;
        if let Some(target) = self.compositions.get_mut(key) {
            target.saved.extend_from_slice(&handles);
        }

        let cmds: Vec<PlaceCmd> = handles
            .iter()
            .zip(layer_ids)
            .enumerate()
            .map(|(i, (handle, &layer_id))| PlaceCmd {
                raster: handle.raw(),
                layer_id,
                txty: txtys.map_or([0, 0], |txtys| txtys[i]),
            })
            .collect();
        let mut placed = 0;
        while placed < cmds.len() {
            let Some(target) = self.compositions.get(key) else {
                break;
            };
            if target.ring.wip_rem() == 0 {
                if target.ring.wip_count() > 0 {
                    self.flush_places(key);
                } else {
                    self.wait_while("place ring space", |device| {
                        device
                            .compositions
                            .get(key)
                            .is_some_and(|target| target.ring.wip_rem() == 0)
                    })?;
                }
                continue;
            }
            let wip = self.open_place_batch(key);
            let Some(target) = self.compositions.get_mut(key) else {
                break;
            };
            let n = target.ring.append(&cmds[placed..]) as usize;
            target.ring.checkpoint();
            let full = target.ring.wip_rem() == 0;
            for cmd in &cmds[placed..placed + n] {
                if let Some(producer) = self.handles.producer(Handle::from_raw(cmd.raster)) {
                    self.grid.happens_after(wip, producer);
                }
            }
            placed += n;
            if full {
                self.flush_places(key);
            }
        }
        Ok(())
    }

    /// The open place batch, created on demand. The epoch's sort happens-after it.
    fn open_place_batch(&mut self, key: Key) -> GridId {
        if let Some(wip) = self.compositions.get(key).and_then(|target| target.wip) {
            return wip;
        }
        let wip = self.attach(
            Task::Place {
                composition: key,
                snap: None,
                clip: [0; 4],
                clear_atomics: false,
            },
            &[],
        );
        if let Some(target) = self.compositions.get_mut(key) {
            target.wip = Some(wip);
            if let Some(sort) = target.sort {
                self.grid.happens_after(sort, wip);
            }
        }
        wip
    }

    /// Snapshots the ring into the open place batch and starts it.
    fn flush_places(&mut self, key: Key) {
        let Some(target) = self.compositions.get_mut(key) else {
            return;
        };
        let Some(wip) = target.wip else {
            return;
        };
        let Some(snapshot) = target.ring.snapshot_alloc() else {
            return;
        };
        target.wip = None;
        target.refs += 1;
        target.places_in_flight += 1;
        let count = snapshot.len();
        if let Some(Task::Place {
            snap,
            clip,
            clear_atomics,
            ..
        }) = self.grid.task_mut(wip)
        {
            *snap = Some(snapshot);
            *clip = target.clip;
            *clear_atomics = mem::take(&mut target.clear_atomics);
        }
        self.grid.start(wip);
        log::trace!("composition {key:?}: flushed {count} place commands");
    }

    pub(crate) fn composition_seal(&mut self, composition: Composition) -> Result<()> {
        let key = self.live_composition(composition)?;
        match self.composition_state(key) {
            Some(SealState::Sealing | SealState::Sealed) | None => return Ok(()),
            Some(SealState::Unsealing) => {
                self.wait_while("composition unseal", |device| {
                    device.composition_state(key) == Some(SealState::Unsealing)
                })?;
            }
            Some(SealState::Unsealed) => {}
        }
        self.flush_places(key);
        let Some(target) = self.compositions.get_mut(key) else {
            return Ok(());
        };
        target.state = SealState::Sealing;
        let Some(sort) = target.sort else {
            target.state = SealState::Sealed;
            return Ok(());
        };
        target.sorting = true;
        target.refs += 1;
        if let Some(Task::Sort { clear_atomics, .. }) = self.grid.task_mut(sort) {
            *clear_atomics = mem::take(&mut target.clear_atomics);
        }
        self.grid.force(sort);
        log::debug!("composition {key:?}: sealing");
        Ok(())
    }

    /// Reopens a composition for placing.
    ///
    /// When `block` is false the call may return with the composition still
    /// `Unsealing`: the transition then finishes once the sort has completed and
    /// every render lock has been dropped. A GPU failure since the last unseal is
    /// reported here, after the transition.
    ///
    /// A `reset` of a composition that is already `Unsealed` always waits for its
    /// place dispatches in flight, whatever `block` says.
    ///
    /// A blocking unseal that cannot make progress, such as one waiting on a lock
    /// held by the caller, fails with [`Error::Stalled`] and leaves the composition
    /// `Unsealing`. The transition then finishes when the lock is dropped.
    pub(crate) fn composition_unseal(
        &mut self,
        composition: Composition,
        block: bool,
        reset: bool,
    ) -> Result<()> {
        let key = self.live_composition(composition)?;
        match self.composition_state(key) {
            Some(SealState::Unsealed) | None => {
                if reset {
                    self.wait_while("place dispatches", |device| {
                        device
                            .compositions
                            .get(key)
                            .is_some_and(|target| target.places_in_flight > 0)
                    })?;
                    self.reset_composition(key);
                }
            }
            Some(SealState::Unsealing | SealState::Sealing | SealState::Sealed) => {
                if let Some(target) = self.compositions.get_mut(key) {
                    target.state = SealState::Unsealing;
                    target.pending_reset |= reset;
                }
                self.maybe_finish_unseal(key);
                if block {
                    self.wait_while("composition unseal", |device| {
                        device.composition_state(key) == Some(SealState::Unsealing)
                    })?;
                }
            }
        }
        match self.compositions.get_mut(key).and_then(|target| target.failed.take()) {
            Some(what) => Err(Error::DispatchFailed(what)),
            None => Ok(()),
        }
    }

    fn maybe_finish_unseal(&mut self, key: Key) {
        let Some(target) = self.compositions.get(key) else {
            return;
        };
        if target.state != SealState::Unsealing || target.sorting || target.locks > 0 {
            return;
        }
        if target.pending_reset {
            self.reset_composition(key);
        }
        let sort = self.attach(
            Task::Sort {
                composition: key,
                clear_atomics: false,
            },
            &[],
        );
        if let Some(target) = self.compositions.get_mut(key) {
            target.sort = Some(sort);
            target.state = SealState::Unsealed;
            target.pending_reset = false;
        }
        log::debug!("composition {key:?}: unsealed");
    }

    /// Drops every placed raster and zeroes the counters.
    ///
    /// No place dispatch may be in flight.
    fn reset_composition(&mut self, key: Key) {
        let Some(target) = self.compositions.get_mut(key) else {
            return;
        };
        let wip = target.wip.take();
        let saved = mem::take(&mut target.saved);
        target.ring.reset();
        target.atomics = Atomics::zeroed();
        target.clear_atomics = true;
        if let Some(wip) = wip {
            self.grid.detach(wip);
        }
        self.handles.release_all(&saved);
        self.reclaim(false);
        log::debug!("composition {key:?}: reset, released {} rasters", saved.len());
    }

    pub(crate) fn composition_set_clip(
        &mut self,
        composition: Composition,
        clip: [u32; 4],
    ) -> Result<()> {
        let key = self.live_composition(composition)?;
        if self.composition_state(key) != Some(SealState::Unsealed) {
            return Err(Error::CompositionSealed);
        }
        // Commands placed so far keep the clip they were placed with.
        self.flush_places(key);
        if let Some(target) = self.compositions.get_mut(key) {
            target.clip = clip;
        }
        Ok(())
    }

    pub(crate) fn composition_clone(&mut self, composition: Composition) -> Result<Composition> {
        self.live_composition(composition)?;
        Err(Error::NotImplemented("composition clone"))
    }

    pub(crate) fn composition_get_bounds(&self, composition: Composition) -> Result<[i32; 4]> {
        self.live_composition(composition)?;
        Err(Error::NotImplemented("composition bounds"))
    }

    pub(crate) fn composition_info(&self, composition: Composition) -> Result<CompositionInfo> {
        let key = self.live_composition(composition)?;
        let target = self
            .compositions
            .get(key)
            .ok_or(Error::InvalidArgs("composition is not live"))?;
        Ok(CompositionInfo {
            state: target.state,
            refs: target.user_refs,
            locks: target.locks,
            saved: target.saved.len(),
            ring_rem: target.ring.ring().rem,
            keys: target.atomics.keys,
            offsets: target.atomics.offsets,
            places_in_flight: target.places_in_flight,
        })
    }

    /// Keeps a composition alive and sealed while a render reads it.
    pub(crate) fn composition_lock(&mut self, key: Key) {
        if let Some(target) = self.compositions.get_mut(key) {
            target.refs += 1;
            target.locks += 1;
        }
    }

    pub(crate) fn composition_unlock(&mut self, key: Key) {
        if let Some(target) = self.compositions.get_mut(key) {
            target.locks -= 1;
        }
        self.maybe_finish_unseal(key);
        self.release_composition_ref(key);
    }

    pub(crate) fn composition_retain_and_lock(&mut self, composition: Composition) -> Result<()> {
        let key = self.live_composition(composition)?;
        self.composition_lock(key);
        Ok(())
    }

    pub(crate) fn composition_unlock_and_release(
        &mut self,
        composition: Composition,
    ) -> Result<()> {
        match self.compositions.get(composition.0) {
            Some(target) if target.locks > 0 => {
                self.composition_unlock(composition.0);
                Ok(())
            }
            _ => Err(Error::InvalidArgs("composition is not locked")),
        }
    }

    pub(crate) fn composition_failed(&mut self, key: Key, what: &'static str) {
        if let Some(target) = self.compositions.get_mut(key) {
            target.failed.get_or_insert(what);
        }
    }

    pub(crate) fn place_complete(
        &mut self,
        key: Key,
        snap: Option<Snap<PlaceCmd>>,
        status: Status,
    ) {
        let Some(target) = self.compositions.get_mut(key) else {
            return;
        };
        if let Some(snap) = snap {
            target.ring.snapshot_free(snap.id);
            target.atomics.keys += snap.len();
        }
        target.places_in_flight -= 1;
        if status.is_failure() {
            target.failed.get_or_insert("place");
        }
        self.release_composition_ref(key);
    }

    pub(crate) fn sort_complete(&mut self, key: Key, status: Status) {
        let Some(target) = self.compositions.get_mut(key) else {
            return;
        };
        target.sorting = false;
        target.sort = None;
        if status.is_failure() {
            target.failed.get_or_insert("sort");
        } else {
            target.atomics.offsets = target.atomics.keys;
        }
        let state = target.state;
        match state {
            SealState::Sealing => {
                target.state = SealState::Sealed;
                log::debug!("composition {key:?}: sealed");
            }
            SealState::Unsealing => self.maybe_finish_unseal(key),
            SealState::Unsealed | SealState::Sealed => {}
        }
        self.release_composition_ref(key);
    }
}
