// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// The lifecycle shared by compositions and stylings.
///
/// An object is mutable while `Unsealed`. Sealing starts GPU work whose completion
/// moves it to `Sealed`, the only state in which it may be rendered. Unsealing a
/// `Sealed` object waits for every render reading it to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SealState {
    /// Moving to `Unsealed` once the seal has finished and no render holds a lock.
    Unsealing,
    Unsealed,
    /// Waiting on the GPU work started by the seal.
    Sealing,
    Sealed,
}

impl SealState {
    /// Sealing or sealed: the object accepts no mutation.
    pub fn is_sealed(self) -> bool {
        matches!(self, Self::Sealing | Self::Sealed)
    }
}
