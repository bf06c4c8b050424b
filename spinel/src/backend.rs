// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The boundary between the scheduler and the GPU API executing its work.

use crate::pool::LayoutKind;
use crate::recording::{Recording, ResourceProxy};
use crate::scheduler::CompletionSignal;

/// Outcome of a submission, as reported by the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Failed,
}

impl Status {
    pub fn is_failure(self) -> bool {
        self == Self::Failed
    }
}

/// A GPU API able to execute [`Recording`]s.
///
/// Implementations never call back into Spinel directly: completion is reported
/// by firing the [`CompletionSignal`] handed to [`Backend::submit`], from whatever
/// thread the GPU API reports it on.
pub trait Backend: Send {
    /// Copies the bindings of a filled descriptor-set template into the live set.
    fn update_descriptor_set(&mut self, layout: LayoutKind, slot: u32, bindings: &[ResourceProxy]);

    /// Submits a recording. `signal` must eventually be fired exactly once.
    fn submit(&mut self, recording: Recording, signal: CompletionSignal);

    /// Gives the backend a chance to make progress on outstanding submissions.
    ///
    /// When `block` is true the backend may block until at least one submission
    /// has completed.
    fn wait(&mut self, block: bool);
}
