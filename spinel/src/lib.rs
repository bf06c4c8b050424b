// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Spinel is the scheduling core of a GPU compute vector rasterizer.
//!
//! A client builds paths and rasters, places rasters into a [`Composition`],
//! describes how layers are painted with a [`Styling`], and renders the pair into
//! an image or buffer. None of the heavy lifting happens on the host: every step
//! is an opaque compute dispatch (rasterize, place, sort, render) and this crate
//! decides *when* each dispatch may be submitted.
//!
//! ## Model
//!
//! - Every unit of GPU work is a node in a dependency grid. A node is only submitted
//!   once all of the nodes it happens-after have completed on the GPU.
//! - GPU completion is reported by a [`Backend`] through a [`CompletionSignal`],
//!   which may be fired from any thread. Completions are marshalled back onto the
//!   thread owning the [`Context`] and processed there.
//! - Calls that need to wait (ring space, descriptor sets, a seal in progress, a
//!   render still reading a composition) wait cooperatively: they keep submitting
//!   ready work and retiring completions until their condition holds.
//!
//! ## Getting started
//!
//! ```ignore
//! let backend = spinel::headless::HeadlessBackend::new();
//! let mut context = spinel::Context::new(TargetConfig::default(), backend)?;
//!
//! let path = context.path_create(&[Segment::line([0.0, 0.0], [8.0, 8.0])])?;
//! let raster = context.raster_create(&[Fill::new(path)])?;
//!
//! let composition = context.composition_create()?;
//! context.composition_place(composition, &[raster], &[0], None)?;
//!
//! let styling = context.styling_create(64)?;
//! context.render(&RenderSubmit {
//!     composition,
//!     styling,
//!     clip: [0, 0, 1024, 1024],
//!     extensions: vec![RenderExtension::BufferRender { buffer }],
//! })?;
//! context.drain()?;
//! ```

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]

mod arena;
mod block_pool;
mod builder;
mod composition;
mod context;
mod device;
mod grid;
mod handle;
mod render;
mod ring;
mod scheduler;
mod seal;
mod styling;
mod task;

pub mod backend;
pub mod config;
pub mod headless;
pub mod pool;
pub mod recording;
#[cfg(feature = "wgpu")]
pub mod wgpu_backend;

pub use backend::{Backend, Status};
pub use builder::{Fill, Segment};
pub use composition::{Composition, CompositionInfo};
pub use config::TargetConfig;
pub use context::{Context, ContextStatus};
pub use handle::{Handle, HandleKind, Path, Raster};
pub use headless::{HeadlessBackend, HeadlessControl};
pub use recording::ImageLayout;
pub use render::{RenderExtension, RenderSubmit};
pub use ring::{ExtentRing, Ring, Snap};
pub use scheduler::CompletionSignal;
pub use seal::SealState;
pub use styling::{Styling, StylingInfo};

use thiserror::Error;

/// Errors that can occur in Spinel.
///
/// Resource exhaustion (a full place ring, an empty descriptor-set pool) is not an
/// error: those calls wait for in-flight work to retire instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An argument list was malformed, for example mismatched slice lengths.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(&'static str),
    /// A handle was not live, or was not of the expected kind.
    #[error("Handle {handle} is not a live {kind:?}")]
    InvalidHandle { handle: u32, kind: HandleKind },
    /// The render extension chain was empty, described no target, or was contradictory.
    #[error("Invalid render extension chain: {0}")]
    RenderExtensionInvalid(&'static str),
    /// The render extension chain requested more wait semaphores than a submission allows.
    #[error("Render submission waits on {count} semaphores, at most {max} are supported")]
    RenderExtensionWaitCountExceeded { count: usize, max: usize },
    /// The operation is part of the API but has no implementation.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    /// The composition must be unsealed for this operation.
    #[error("Composition is sealed")]
    CompositionSealed,
    /// The styling must be unsealed for this operation.
    #[error("Styling is sealed")]
    StylingSealed,
    /// The styling has no room for the requested allocation.
    #[error("Styling overflow: requested {requested} dwords, {available} available")]
    StylingOverflow { requested: u32, available: u32 },
    /// Every handle is live and nothing is waiting to be reclaimed.
    #[error("Handle pool exhausted")]
    HandlePoolExhausted,
    /// A GPU dispatch this call depended on reported failure.
    #[error("Dispatch '{0}' failed on the GPU")]
    DispatchFailed(&'static str),
    /// A wait can never finish because no work is in flight.
    #[error("Waiting for {0} with no work in flight")]
    Stalled(&'static str),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
