// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Handle reclamation, stylings and context teardown.

use anyhow::Result;
use spinel::{Error, Segment, SealState, TargetConfig};
use spinel_tests::{after_delay, buffer_render, upload_sizes, TestContext};

fn triangle() -> [Segment; 3] {
    [
        Segment::line([0.0, 0.0], [4.0, 0.0]),
        Segment::quad([4.0, 0.0], [4.0, 4.0], [0.0, 4.0]),
        Segment::line([0.0, 4.0], [0.0, 0.0]),
    ]
}

#[test]
fn released_handles_are_reclaimed_on_exhaustion() -> Result<()> {
    let mut config = TargetConfig::default();
    config.handles.count = 2;
    let mut test = TestContext::new(config)?;
    let first = test.context.path_create(&triangle())?;
    let _second = test.context.path_create(&triangle())?;
    assert_eq!(
        test.context.path_create(&triangle()),
        Err(Error::HandlePoolExhausted)
    );

    // A single release does not fill a reclaim batch.
    test.context.path_release(&[first])?;
    assert_eq!(test.context.status().pending_reclaim, 1);
    assert_eq!(test.control.count("reclaim"), 0);

    let third = test.context.path_create(&triangle())?;
    assert_eq!(test.control.count("reclaim"), 1);
    assert!(test.position("paths", 0) < test.position("reclaim", 0));
    assert_eq!(third.handle(), first.handle());
    assert_eq!(test.context.status().live_handles, 2);
    Ok(())
}

#[test]
fn raster_holds_its_paths_until_rasterized() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    test.control.hold("rasterize");
    let raster = test.square()?;
    test.context.poll();
    // The released path is still referenced by the rasterize dispatch.
    assert_eq!(test.context.status().live_handles, 2);

    assert_eq!(test.control.release("rasterize"), 1);
    test.context.drain()?;
    let status = test.context.status();
    assert_eq!(status.live_handles, 1);
    assert_eq!(status.pending_reclaim, 0);
    assert_eq!(test.control.count("reclaim"), 1);

    test.context.raster_release(&[raster])?;
    assert!(matches!(
        test.context.raster_retain(&[raster]),
        Err(Error::InvalidHandle { .. })
    ));
    Ok(())
}

#[test]
fn repeated_release_without_enough_references_changes_nothing() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    test.context.drain()?;
    assert!(matches!(
        test.context.raster_release(&[raster, raster]),
        Err(Error::InvalidHandle { .. })
    ));
    // The single reference survived the rejected call.
    test.context.raster_retain(&[raster])?;
    test.context.raster_release(&[raster, raster])?;
    assert!(test.context.raster_release(&[raster]).is_err());

    test.context.drain()?;
    let first = test.context.path_create(&triangle())?;
    let second = test.context.path_create(&triangle())?;
    assert_ne!(first.handle(), second.handle());
    Ok(())
}

#[test]
fn path_and_raster_handles_are_not_interchangeable() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let path = test.context.path_create(&triangle())?;
    let as_raster = spinel::Raster::from_raw(path.handle().raw());
    assert!(test.context.raster_release(&[as_raster]).is_err());
    assert!(test.context.path_create(&[]).is_err());
    assert!(test.context.raster_create(&[]).is_err());
    Ok(())
}

#[test]
fn styling_seal_uploads_written_dwords() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let styling = test.context.styling_create(16)?;
    let offset = test.context.styling_alloc(styling, 3)?;
    test.context.styling_write(styling, offset, &[1, 2, 3])?;
    test.context.styling_seal(styling)?;
    assert_eq!(
        test.context.styling_write(styling, offset, &[4]),
        Err(Error::StylingSealed)
    );
    test.context.drain()?;

    let seals = test.submitted("styling");
    assert_eq!(seals.len(), 1);
    assert_eq!(upload_sizes(&seals[0]), [3 * 4]);
    assert_eq!(
        test.context.styling_info(styling)?.state,
        SealState::Sealed
    );

    test.context.styling_unseal(styling, true)?;
    assert_eq!(test.context.styling_alloc(styling, 13)?, 3);
    assert_eq!(
        test.context.styling_alloc(styling, 1),
        Err(Error::StylingOverflow {
            requested: 1,
            available: 0
        })
    );
    Ok(())
}

#[test]
fn styling_unseal_waits_for_render() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    test.control.hold("render");
    test.context
        .render(&buffer_render(composition, styling, [0, 0, 32, 32]))?;
    test.context.poll();
    assert_eq!(test.context.styling_info(styling)?.locks, 1);

    let control = test.control.clone();
    let releaser = after_delay(move || {
        control.release_all();
    });
    test.context.styling_reset(styling)?;
    releaser.join().expect("releasing thread panicked");
    let info = test.context.styling_info(styling)?;
    assert_eq!((info.state, info.locks, info.dwords), (SealState::Unsealed, 0, 0));
    Ok(())
}

#[test]
fn failed_styling_seal_still_resets() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    test.control.fail("styling");
    let styling = test.styling_with(4)?;
    test.context.styling_seal(styling)?;
    test.context.drain()?;
    assert_eq!(
        test.context.styling_reset(styling),
        Err(Error::DispatchFailed("styling"))
    );
    let info = test.context.styling_info(styling)?;
    assert_eq!((info.state, info.dwords), (SealState::Unsealed, 0));
    Ok(())
}

#[test]
fn client_locks_keep_objects_sealed() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    test.context.composition_seal(composition)?;
    test.context.composition_retain_and_lock(composition)?;
    test.context.drain()?;

    test.context.composition_unseal(composition, false, false)?;
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealing
    );
    test.context.composition_unlock_and_release(composition)?;
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealed
    );
    assert!(test.context.composition_unlock_and_release(composition).is_err());
    Ok(())
}

#[test]
fn failed_dispatch_poisons_its_successors() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    test.control.fail("rasterize");
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    // Neither the place nor the sort reached the GPU.
    assert_eq!(test.control.count("place"), 0);
    assert_eq!(test.control.count("sort"), 0);
    assert_eq!(
        test.context.composition_unseal(composition, true, false),
        Err(Error::DispatchFailed("place"))
    );
    Ok(())
}

#[test]
fn dropping_a_context_waits_for_the_gpu() -> Result<()> {
    let test = {
        let mut test = TestContext::with_defaults()?;
        test.control.hold_all();
        test.context.path_create(&triangle())?;
        test.context.poll();
        test
    };
    let control = test.control.clone();
    assert_eq!(control.held(), 1);
    let releaser = after_delay({
        let control = control.clone();
        move || {
            control.release_all();
        }
    });
    drop(test);
    releaser.join().expect("releasing thread panicked");
    assert_eq!(control.held(), 0);
    assert_eq!(control.labels(), ["block pool init", "paths"]);
    Ok(())
}
