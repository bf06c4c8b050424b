// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Place batching, sealing and unsealing of compositions.

use anyhow::Result;
use spinel::{Error, Raster, SealState, TargetConfig};
use spinel_tests::{after_delay, buffer_render, upload_sizes, TestContext};

fn small_ring() -> TargetConfig {
    let mut config = TargetConfig::default();
    config.composition.ring_size = 4;
    config.composition.eager_size = 4;
    config
}

#[test]
fn places_flush_in_ring_sized_batches() -> Result<()> {
    let mut test = TestContext::new(small_ring())?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 6)?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;

    let places = test.submitted("place");
    assert_eq!(places.len(), 2);
    assert_eq!(upload_sizes(&places[0]), [4 * 16]);
    assert_eq!(upload_sizes(&places[1]), [2 * 16]);
    assert_eq!(test.control.count("sort"), 1);
    assert!(test.position("place", 1) < test.position("sort", 0));

    let info = test.context.composition_info(composition)?;
    assert_eq!(info.state, SealState::Sealed);
    assert_eq!((info.saved, info.keys, info.offsets), (6, 6, 6));
    assert_eq!(info.ring_rem, 4);
    Ok(())
}

#[test]
fn place_batches_wait_only_for_their_own_rasters() -> Result<()> {
    let mut test = TestContext::new(small_ring())?;
    let early = test.square()?;
    test.context.drain()?;
    test.control.hold("rasterize");
    let late = test.square()?;
    let composition = test.context.composition_create()?;
    test.context
        .composition_place(composition, &[early; 4], &[0, 1, 2, 3], None)?;
    test.context
        .composition_place(composition, &[early, late], &[4, 5], None)?;
    test.context.composition_seal(composition)?;
    test.context.poll();
    // The first batch only holds the rasterized raster.
    assert_eq!(test.control.count("place"), 1);
    assert_eq!(test.control.count("sort"), 0);

    assert_eq!(test.control.release("rasterize"), 1);
    test.context.drain()?;
    assert_eq!(test.control.count("place"), 2);
    assert!(test.position("rasterize", 1) < test.position("place", 1));
    assert!(test.position("place", 1) < test.position("sort", 0));
    Ok(())
}

#[test]
fn seal_then_reset_without_waiting() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 3)?;
    test.context.composition_seal(composition)?;
    test.context.composition_unseal(composition, true, true)?;
    let info = test.context.composition_info(composition)?;
    assert_eq!(info.state, SealState::Unsealed);
    assert_eq!((info.saved, info.keys, info.offsets), (0, 0, 0));
    // Only the client reference to the raster is left.
    test.context.raster_release(&[raster])?;
    assert!(test.context.raster_release(&[raster]).is_err());
    Ok(())
}

#[test]
fn reset_of_an_unsealed_composition_waits_for_places() -> Result<()> {
    let mut test = TestContext::new(small_ring())?;
    let raster = test.square()?;
    test.context.drain()?;
    test.control.hold("place");
    let composition = test.composition_with(raster, 4)?;
    test.context.poll();
    assert_eq!(test.control.held(), 1);

    let control = test.control.clone();
    let releaser = after_delay(move || {
        control.release_all();
    });
    test.context.composition_unseal(composition, false, true)?;
    releaser.join().expect("releasing thread panicked");
    assert_eq!(test.control.held(), 0);
    let info = test.context.composition_info(composition)?;
    assert_eq!((info.state, info.saved, info.keys), (SealState::Unsealed, 0, 0));
    Ok(())
}

#[test]
fn stalled_unseal_finishes_on_unlock() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    test.context.composition_seal(composition)?;
    test.context.composition_retain_and_lock(composition)?;
    test.context.drain()?;

    assert!(matches!(
        test.context.composition_unseal(composition, true, false),
        Err(Error::Stalled(_))
    ));
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealing
    );
    test.context.composition_unlock_and_release(composition)?;
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealed
    );
    Ok(())
}

#[test]
fn sealing_twice_sorts_once() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 3)?;
    test.context.composition_seal(composition)?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    assert_eq!(test.control.count("place"), 1);
    assert_eq!(test.control.count("sort"), 1);
    Ok(())
}

#[test]
fn reset_drops_placed_rasters() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 3)?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    assert_eq!(test.context.composition_info(composition)?.keys, 3);

    test.context.composition_reset(composition)?;
    let info = test.context.composition_info(composition)?;
    assert_eq!(info.state, SealState::Unsealed);
    assert_eq!((info.saved, info.keys, info.offsets), (0, 0, 0));

    // The raster is still held by the client.
    test.context.raster_release(&[raster])?;
    assert!(test.context.raster_release(&[raster]).is_err());
    Ok(())
}

#[test]
fn unsealing_keeps_placed_rasters() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 2)?;
    test.context.composition_seal(composition)?;
    test.context.composition_unseal(composition, true, false)?;
    test.context
        .composition_place(composition, &[raster], &[7], Some(&[[16, 16]]))?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    let info = test.context.composition_info(composition)?;
    assert_eq!((info.saved, info.keys), (3, 3));
    assert_eq!(test.control.count("sort"), 2);
    Ok(())
}

#[test]
fn place_waits_for_rasterize() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    test.control.hold("rasterize");
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    test.context.composition_seal(composition)?;
    test.context.poll();
    assert_eq!(test.control.count("rasterize"), 1);
    assert_eq!(test.control.count("place"), 0);
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Sealing
    );

    assert_eq!(test.control.release("rasterize"), 1);
    test.context.drain()?;
    assert!(test.position("rasterize", 0) < test.position("place", 0));
    assert!(test.position("place", 0) < test.position("sort", 0));
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Sealed
    );
    Ok(())
}

#[test]
fn invalid_raster_retains_nothing() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.context.composition_create()?;
    let result = test.context.composition_place(
        composition,
        &[raster, Raster::from_raw(999)],
        &[0, 1],
        None,
    );
    assert!(matches!(result, Err(Error::InvalidHandle { handle: 999, .. })));
    let info = test.context.composition_info(composition)?;
    assert_eq!((info.state, info.saved), (SealState::Sealed, 0));

    test.context.raster_release(&[raster])?;
    assert!(test.context.raster_release(&[raster]).is_err());
    Ok(())
}

#[test]
fn unseal_waits_for_render() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 2)?;
    let styling = test.styling_with(4)?;
    test.control.hold("render");
    test.context
        .render(&buffer_render(composition, styling, [0, 0, 64, 64]))?;
    test.context.poll();
    assert_eq!(test.control.held(), 1);
    assert_eq!(test.context.composition_info(composition)?.locks, 1);

    let control = test.control.clone();
    let releaser = after_delay(move || {
        control.release_all();
    });
    test.context.composition_unseal(composition, true, false)?;
    releaser.join().expect("releasing thread panicked");

    let info = test.context.composition_info(composition)?;
    assert_eq!((info.state, info.locks), (SealState::Unsealed, 0));
    assert_eq!(test.control.count("render"), 1);
    Ok(())
}

#[test]
fn non_blocking_unseal_finishes_later() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    test.control.hold("render");
    test.context
        .render(&buffer_render(composition, styling, [0, 0, 64, 64]))?;
    test.context.poll();

    test.context.composition_unseal(composition, false, false)?;
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealing
    );
    assert_eq!(test.control.release("render"), 1);
    test.context.poll();
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealed
    );
    Ok(())
}

#[test]
fn failed_sort_is_reported_on_unseal() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    test.control.fail("sort");
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    test.context.composition_seal(composition)?;
    test.context.drain()?;
    assert_eq!(
        test.context.composition_unseal(composition, true, false),
        Err(Error::DispatchFailed("sort"))
    );
    // Reported once.
    test.context.composition_unseal(composition, true, false)?;
    assert_eq!(
        test.context.composition_info(composition)?.state,
        SealState::Unsealed
    );
    Ok(())
}

#[test]
fn composition_outlives_release_while_rendering() -> Result<()> {
    let mut test = TestContext::with_defaults()?;
    let raster = test.square()?;
    let composition = test.composition_with(raster, 1)?;
    let styling = test.styling_with(4)?;
    test.control.hold("render");
    test.context
        .render(&buffer_render(composition, styling, [0, 0, 16, 16]))?;
    test.context.composition_release(composition)?;
    test.context.styling_release(styling)?;
    assert!(test.context.composition_info(composition).is_err());

    test.context.poll();
    assert_eq!(test.control.release("render"), 1);
    test.context.drain()?;
    // The placed raster was released with the composition, the client still holds it.
    assert_eq!(test.context.status().live_handles, 1);
    Ok(())
}
