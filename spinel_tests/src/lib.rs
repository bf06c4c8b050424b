// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Helpers for the Spinel integration tests.
//!
//! Every test drives a [`Context`] over a [`HeadlessBackend`] and inspects what
//! reached the backend through its [`HeadlessControl`].

use anyhow::Result;
use spinel::recording::{BufferProxy, Command, Recording};
use spinel::{
    Composition, Context, Fill, HeadlessBackend, HeadlessControl, Raster, RenderExtension,
    RenderSubmit, Segment, Styling, TargetConfig,
};

/// A context and the control of its backend.
pub struct TestContext {
    pub context: Context,
    pub control: HeadlessControl,
}

impl TestContext {
    pub fn new(config: TargetConfig) -> Result<Self> {
        let backend = HeadlessBackend::new();
        let control = backend.control();
        let context = Context::new(config, backend)?;
        Ok(Self { context, control })
    }

    /// A context with the default target configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(TargetConfig::default())
    }

    /// Rasterizes a unit square.
    pub fn square(&mut self) -> Result<Raster> {
        let path = self.context.path_create(&[
            Segment::line([0.0, 0.0], [1.0, 0.0]),
            Segment::line([1.0, 0.0], [1.0, 1.0]),
            Segment::line([1.0, 1.0], [0.0, 1.0]),
            Segment::line([0.0, 1.0], [0.0, 0.0]),
        ])?;
        let raster = self.context.raster_create(&[Fill::new(path)])?;
        // The raster keeps the path alive until it has been rasterized.
        self.context.path_release(&[path])?;
        Ok(raster)
    }

    /// A composition holding `count` places of `raster`, on consecutive layers.
    pub fn composition_with(&mut self, raster: Raster, count: u32) -> Result<Composition> {
        let composition = self.context.composition_create()?;
        let rasters = vec![raster; count as usize];
        let layers: Vec<u32> = (0..count).collect();
        self.context
            .composition_place(composition, &rasters, &layers, None)?;
        Ok(composition)
    }

    /// A styling with `dwords` zeroed dwords allocated.
    pub fn styling_with(&mut self, dwords: u32) -> Result<Styling> {
        let styling = self.context.styling_create(dwords.max(1))?;
        if dwords > 0 {
            self.context.styling_alloc(styling, dwords)?;
        }
        Ok(styling)
    }

    /// Recordings submitted with `label`, in submission order.
    pub fn submitted(&self, label: &str) -> Vec<Recording> {
        self.control
            .submissions()
            .into_iter()
            .filter(|recording| recording.label == label)
            .collect()
    }

    /// Position of the `nth` submission labelled `label`.
    pub fn position(&self, label: &str, nth: usize) -> Option<usize> {
        self.control
            .labels()
            .iter()
            .enumerate()
            .filter(|(_, submitted)| **submitted == label)
            .nth(nth)
            .map(|(index, _)| index)
    }
}

/// Renders into a fresh buffer covering `clip`.
pub fn buffer_render(composition: Composition, styling: Styling, clip: [u32; 4]) -> RenderSubmit {
    let size = u64::from(clip[2].max(1)) * u64::from(clip[3].max(1)) * 4;
    RenderSubmit {
        composition,
        styling,
        clip,
        extensions: vec![RenderExtension::BufferRender {
            buffer: BufferProxy::new(size, "render target"),
        }],
    }
}

/// Sizes of the uploads of a recording, in bytes.
pub fn upload_sizes(recording: &Recording) -> Vec<usize> {
    recording
        .commands
        .iter()
        .filter_map(|command| match command {
            Command::Upload(_, bytes) => Some(bytes.len()),
            _ => None,
        })
        .collect()
}

/// Runs `f` on another thread after a short delay.
///
/// Used to release held completions while the test thread blocks on them.
pub fn after_delay(f: impl FnOnce() + Send + 'static) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        log::debug!("releasing held completions");
        f();
    })
}
