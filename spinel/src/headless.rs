// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A backend without a GPU.
//!
//! Every submission is recorded and, by default, completes as soon as it is
//! submitted. Through a [`HeadlessControl`] completions can be held back and
//! released later, from any thread, or made to fail.
//!
//! Completions held back must be released from another thread when the owning
//! [`Context`](crate::Context) is about to wait for them: the context blocks
//! until a completion arrives.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{Backend, Status};
use crate::pool::LayoutKind;
use crate::recording::{Recording, ResourceProxy};
use crate::scheduler::CompletionSignal;

/// A descriptor set update seen by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorUpdate {
    pub layout: LayoutKind,
    pub slot: u32,
    pub bindings: Vec<ResourceProxy>,
}

#[derive(Default)]
struct Shared {
    submissions: Vec<Recording>,
    updates: Vec<DescriptorUpdate>,
    hold_all: bool,
    hold: HashSet<&'static str>,
    fail: HashSet<&'static str>,
    held: Vec<(&'static str, CompletionSignal, Status)>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct HeadlessBackend {
    shared: Arc<Mutex<Shared>>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for inspecting and steering the backend once it is owned by a context.
    pub fn control(&self) -> HeadlessControl {
        HeadlessControl {
            shared: self.shared.clone(),
        }
    }
}

impl Backend for HeadlessBackend {
    fn update_descriptor_set(&mut self, layout: LayoutKind, slot: u32, bindings: &[ResourceProxy]) {
        log::trace!("headless: update {layout:?} set {slot} ({} bindings)", bindings.len());
        lock(&self.shared).updates.push(DescriptorUpdate {
            layout,
            slot,
            bindings: bindings.to_vec(),
        });
    }

    fn submit(&mut self, recording: Recording, signal: CompletionSignal) {
        let label = recording.label;
        let mut shared = lock(&self.shared);
        let status = if shared.fail.contains(label) {
            Status::Failed
        } else {
            Status::Success
        };
        log::debug!(
            "headless: submit '{label}' ({} commands) -> {status:?}",
            recording.commands.len()
        );
        shared.submissions.push(recording);
        if shared.hold_all || shared.hold.contains(label) {
            shared.held.push((label, signal, status));
            return;
        }
        drop(shared);
        signal.signal(status);
    }

    fn wait(&mut self, block: bool) {
        log::trace!("headless: wait (block: {block})");
    }
}

/// Inspects and steers a [`HeadlessBackend`]. Cheap to clone, and `Send`.
#[derive(Clone)]
pub struct HeadlessControl {
    shared: Arc<Mutex<Shared>>,
}

impl HeadlessControl {
    /// Holds back completions of recordings with this label.
    pub fn hold(&self, label: &'static str) {
        lock(&self.shared).hold.insert(label);
    }

    /// Holds back every completion.
    pub fn hold_all(&self) {
        lock(&self.shared).hold_all = true;
    }

    /// Stops holding `label` and fires its held completions, returning how many.
    pub fn release(&self, label: &'static str) -> usize {
        let signals: Vec<_> = {
            let mut shared = lock(&self.shared);
            shared.hold.remove(label);
            let (matching, rest) = std::mem::take(&mut shared.held)
                .into_iter()
                .partition(|(held, _, _)| *held == label);
            shared.held = rest;
            matching
        };
        fire(signals)
    }

    /// Stops holding anything and fires every held completion, returning how many.
    pub fn release_all(&self) -> usize {
        let signals = {
            let mut shared = lock(&self.shared);
            shared.hold_all = false;
            shared.hold.clear();
            std::mem::take(&mut shared.held)
        };
        fire(signals)
    }

    /// Makes recordings with this label complete with [`Status::Failed`].
    pub fn fail(&self, label: &'static str) {
        lock(&self.shared).fail.insert(label);
    }

    /// Completions currently held back.
    pub fn held(&self) -> usize {
        lock(&self.shared).held.len()
    }

    /// Every recording submitted so far, in submission order.
    pub fn submissions(&self) -> Vec<Recording> {
        lock(&self.shared).submissions.clone()
    }

    /// Labels of every recording submitted so far, in submission order.
    pub fn labels(&self) -> Vec<&'static str> {
        lock(&self.shared)
            .submissions
            .iter()
            .map(|recording| recording.label)
            .collect()
    }

    /// Number of recordings submitted with this label.
    pub fn count(&self, label: &str) -> usize {
        lock(&self.shared)
            .submissions
            .iter()
            .filter(|recording| recording.label == label)
            .count()
    }

    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        lock(&self.shared).updates.clone()
    }
}

fn fire(signals: Vec<(&'static str, CompletionSignal, Status)>) -> usize {
    let count = signals.len();
    for (_, signal, status) in signals {
        signal.signal(status);
    }
    count
}

static_assertions::assert_impl_all!(HeadlessControl: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::scheduler::Scheduler;

    #[test]
    fn held_completions_fire_on_release() {
        let mut backend = HeadlessBackend::new();
        let control = backend.control();
        let mut grid = Grid::default();
        let mut scheduler = Scheduler::new(4);
        control.hold("sort");
        let sort = grid.attach((), &[]);
        let place = grid.attach((), &[]);
        backend.submit(Recording::new("sort"), scheduler.submit(sort));
        backend.submit(Recording::new("place"), scheduler.submit(place));
        assert_eq!(scheduler.try_recv().map(|c| c.node), Some(place));
        assert!(scheduler.try_recv().is_none());
        assert_eq!(control.held(), 1);
        assert_eq!(control.release("sort"), 1);
        assert_eq!(scheduler.try_recv().map(|c| c.node), Some(sort));
        assert_eq!(control.labels(), ["sort", "place"]);
    }

    #[test]
    fn failures_are_reported() {
        let mut backend = HeadlessBackend::new();
        let control = backend.control();
        let mut grid = Grid::default();
        let mut scheduler = Scheduler::new(4);
        control.fail("render");
        backend.submit(Recording::new("render"), scheduler.submit(grid.attach((), &[])));
        assert_eq!(
            scheduler.try_recv().map(|c| c.status),
            Some(Status::Failed)
        );
    }
}
