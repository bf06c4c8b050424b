// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference-counted path and raster handles.
//!
//! The handle table lives on the host. The GPU only learns about a handle through
//! the dispatches that produce it, and a handle is only recycled once a reclaim
//! dispatch has returned its blocks to the block pool.

use crate::grid::GridId;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Path,
    Raster,
}

/// An untyped handle: an index into the device's handle table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A path built by [`Context::path_create`](crate::Context::path_create).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Path(pub(crate) Handle);

/// A raster built by [`Context::raster_create`](crate::Context::raster_create).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Raster(pub(crate) Handle);

impl Path {
    pub fn from_raw(raw: u32) -> Self {
        Self(Handle(raw))
    }

    pub fn handle(self) -> Handle {
        self.0
    }
}

impl Raster {
    pub fn from_raw(raw: u32) -> Self {
        Self(Handle(raw))
    }

    pub fn handle(self) -> Handle {
        self.0
    }
}

#[derive(Debug)]
struct Entry {
    kind: HandleKind,
    /// Host references. Zero means the handle is waiting to be reclaimed.
    refs: u32,
    /// The dispatch writing the handle's contents, if it may still be running.
    producer: Option<GridId>,
}

#[derive(Debug)]
pub(crate) struct HandlePool {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    reclaim: Vec<Handle>,
    reclaim_size: usize,
}

impl HandlePool {
    pub(crate) fn new(count: u32, reclaim_size: u32) -> Self {
        Self {
            entries: (0..count).map(|_| None).collect(),
            free: (0..count).rev().collect(),
            reclaim: Vec::new(),
            reclaim_size: reclaim_size as usize,
        }
    }

    /// Takes a free handle with a single reference.
    pub(crate) fn acquire(&mut self, kind: HandleKind) -> Option<Handle> {
        let index = self.free.pop()?;
        self.entries[index as usize] = Some(Entry {
            kind,
            refs: 1,
            producer: None,
        });
        Some(Handle(index))
    }

    pub(crate) fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    fn live_entry(&self, kind: HandleKind, handle: Handle) -> Option<&Entry> {
        self.entries
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .filter(|entry| entry.kind == kind && entry.refs > 0)
    }

    pub(crate) fn validate(&self, kind: HandleKind, handle: Handle) -> Result<()> {
        match self.live_entry(kind, handle) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle {
                handle: handle.0,
                kind,
            }),
        }
    }

    /// Retains every handle, or none of them if any is invalid.
    pub(crate) fn validate_retain(&mut self, kind: HandleKind, handles: &[Handle]) -> Result<()> {
        for &handle in handles {
            self.validate(kind, handle)?;
        }
        for &handle in handles {
            self.retain(handle);
        }
        Ok(())
    }

    pub(crate) fn retain(&mut self, handle: Handle) {
        if let Some(entry) = self.entries[handle.0 as usize].as_mut() {
            debug_assert!(entry.refs > 0, "retain of a dead handle");
            entry.refs += 1;
        }
    }

    /// Drops a reference. The last one queues the handle for reclamation.
    pub(crate) fn release(&mut self, handle: Handle) {
        let Some(entry) = self
            .entries
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
        else {
            return;
        };
        if entry.refs == 0 {
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            self.reclaim.push(handle);
        }
    }

    /// Checks that every handle holds at least as many references as it occurs.
    pub(crate) fn validate_release(&self, kind: HandleKind, handles: &[Handle]) -> Result<()> {
        let mut sorted = handles.to_vec();
        sorted.sort_unstable();
        for run in sorted.chunk_by(|a, b| a == b) {
            let handle = run[0];
            match self.live_entry(kind, handle) {
                Some(entry) if entry.refs as usize >= run.len() => {}
                _ => {
                    return Err(Error::InvalidHandle {
                        handle: handle.0,
                        kind,
                    })
                }
            }
        }
        Ok(())
    }

    pub(crate) fn release_all(&mut self, handles: &[Handle]) {
        for &handle in handles {
            self.release(handle);
        }
    }

    /// Takes a batch of handles to reclaim.
    ///
    /// A batch is only taken when full, unless `force` is set.
    pub(crate) fn take_reclaim_batch(&mut self, force: bool) -> Option<Vec<Handle>> {
        if self.reclaim.is_empty() || (!force && self.reclaim.len() < self.reclaim_size) {
            return None;
        }
        let n = self.reclaim.len().min(self.reclaim_size);
        Some(self.reclaim.drain(..n).collect())
    }

    pub(crate) fn pending_reclaim(&self) -> usize {
        self.reclaim.len()
    }

    /// Returns reclaimed handles to the free list.
    pub(crate) fn recycle(&mut self, handles: &[Handle]) {
        for &handle in handles {
            self.entries[handle.0 as usize] = None;
            self.free.push(handle.0);
        }
    }

    pub(crate) fn set_producer(&mut self, handle: Handle, node: GridId) {
        if let Some(entry) = self.entries[handle.0 as usize].as_mut() {
            entry.producer = Some(node);
        }
    }

    pub(crate) fn producer(&self, handle: Handle) -> Option<GridId> {
        self.entries
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .and_then(|entry| entry.producer)
    }

    /// Handles with at least one reference.
    pub(crate) fn live(&self) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.refs > 0)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, handle: Handle) -> u32 {
        self.entries
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refs)
    }
}
