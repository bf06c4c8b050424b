// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Render submission: extension validation, descriptor sets and ordering.

use anyhow::Result;
use spinel::pool::LayoutKind;
use spinel::recording::{BufferProxy, ImageFormat, ImageProxy, Kernel, Semaphore};
use spinel::{Error, ImageLayout, RenderExtension, RenderSubmit, SealState};
use spinel_tests::{buffer_render, TestContext};

#[test]
fn empty_extension_list_submits_nothing() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    let submit = RenderSubmit {
        extensions: Vec::new(),
        ..buffer_render(composition, styling, [0, 0, 64, 64])
    };
    assert_eq!(
        test.context.render(&submit),
        Err(Error::RenderExtensionInvalid("no extensions"))
    );
    test.context.drain()?;
    assert_eq!(test.control.count("render"), 0);
    // Nothing was sealed either.
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealed
    );
    assert_eq!(test.control.count("sort"), 0);
    Ok(())
}

#[test]
fn too_many_wait_semaphores() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let max = test.context.config().submit.max_wait_semaphores;
    let composition = test.context.composition_create()?;
    let styling = test.styling_with(1)?;
    let mut submit = buffer_render(composition, styling, [0, 0, 64, 64]);
    submit.extensions.push(RenderExtension::SubmitInfo {
        wait: (0..=max as u64).map(Semaphore).collect(),
        signal: Vec::new(),
    });
    assert_eq!(
        test.context.render(&submit),
        Err(Error::RenderExtensionWaitCountExceeded {
            count: max + 1,
            max
        })
    );
    Ok(())
}

#[test]
fn render_follows_sort_and_styling() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 2)?;
    let styling = test.styling_with(4)?;
    let mut submit = buffer_render(composition, styling, [0, 0, 64, 64]);
    submit.extensions.push(RenderExtension::SubmitInfo {
        wait: vec![Semaphore(1)],
        signal: vec![Semaphore(2)],
    });
    test.context.render(&submit)?;
    test.context.drain()?;

    assert!(test.position("sort", 0) < test.position("render", 0));
    assert!(test.position("styling", 0) < test.position("render", 0));
    let renders = test.submitted("render");
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].wait, [Semaphore(1)]);
    assert_eq!(renders[0].signal, [Semaphore(2)]);
    assert_eq!(renders[0].kernels().collect::<Vec<_>>(), [Kernel::Render]);

    let info = test.context.composition_info(composition)?;
    assert_eq!((info.state, info.locks), (SealState::Sealed, 0));
    let info = test.context.styling_info(styling)?;
    assert_eq!((info.state, info.locks), (SealState::Sealed, 0));
    Ok(())
}

#[test]
fn empty_clip_seals_without_rendering() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    test.context
        .render(&buffer_render(composition, styling, [32, 32, 32, 64]))?;
    test.context.drain()?;
    assert_eq!(test.control.count("render"), 0);
    assert_eq!(test.control.count("sort"), 1);
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Sealed
    );
    Ok(())
}

#[test]
fn descriptor_sets_are_reused_last_in_first_out() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    let submit = buffer_render(composition, styling, [0, 0, 64, 64]);

    test.control.hold("render");
    test.context.render(&submit)?;
    test.context.render(&submit)?;
    test.context.poll();
    let free = test.context.status().free_descriptor_sets;
    assert!(free.contains(&(LayoutKind::Ttcks, 2)));
    assert!(free.contains(&(LayoutKind::Surface, 0)));

    // The second render returns its sets last, so the third one gets them.
    assert_eq!(test.control.release("render"), 2);
    test.context.poll();
    test.context.render(&submit)?;
    test.context.drain()?;

    let ttcks_slots: Vec<u32> = test
        .control
        .descriptor_updates()
        .into_iter()
        .filter(|update| update.layout == LayoutKind::Ttcks)
        .map(|update| update.slot)
        .collect();
    assert_eq!(ttcks_slots, [0, 1, 1]);
    assert_eq!(test.control.count("render"), 3);
    Ok(())
}

#[test]
fn render_waits_for_a_free_surface_set() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    let submit = buffer_render(composition, styling, [0, 0, 64, 64]);
    let surfaces = test.context.config().descriptors.surface;
    for _ in 0..surfaces {
        test.context.render(&submit)?;
    }
    // Completions are retired while waiting for a set.
    test.context.render(&submit)?;
    test.context.drain()?;
    assert_eq!(test.control.count("render"), surfaces as usize + 1);
    Ok(())
}

#[test]
fn image_render_records_every_stage() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    let image = ImageProxy::new(64, 64, ImageFormat::Rgba8);
    let readback = BufferProxy::new(64 * 64 * 4, "readback");
    let submit = RenderSubmit {
        composition,
        styling,
        clip: [0, 0, 64, 64],
        extensions: vec![
            RenderExtension::ImagePostBarrier {
                new_layout: ImageLayout::PresentSrc,
                dst_queue_family: None,
            },
            RenderExtension::ImageRender { image },
            RenderExtension::ImagePostCopyToBuffer { buffer: readback },
            RenderExtension::ImagePreBarrier {
                old_layout: ImageLayout::Undefined,
                src_queue_family: None,
            },
        ],
    };
    test.context.render(&submit)?;
    test.context.drain()?;
    let renders = test.submitted("render");
    assert_eq!(renders.len(), 1);
    // Pre-barrier, render, copy barrier, copy, post-barrier.
    assert_eq!(renders[0].commands.len(), 5);
    Ok(())
}

#[test]
fn image_extension_on_a_buffer_target_is_rejected() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let composition = test.context.composition_create()?;
    let styling = test.styling_with(1)?;
    let mut submit = buffer_render(composition, styling, [0, 0, 64, 64]);
    submit
        .extensions
        .push(RenderExtension::ImagePreClear { color: [0.0; 4] });
    assert!(matches!(
        test.context.render(&submit),
        Err(Error::RenderExtensionInvalid(_))
    ));
    Ok(())
}
