//! Scheduling properties: frame pacing, late-start policy, frame drops.
//!
//! Run with: cargo test -p panel-emulator --test vsync_timing

mod common;

use common::{bench_double, bench_triple, random_frame, solid_frame};
use ili9488_vsync::Rotation;

/// With `vsync_spacing = k` and no tearing, consecutive frame starts are
/// `k * period` apart, within a third of a period.
#[test]
fn frame_starts_are_spaced_by_vsync_spacing() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(2);
    let period = b.panel.period_micros() as i64;

    let mut frame = random_frame(3);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    let mut starts = Vec::new();
    for i in 0..6u16 {
        // keep the diff non-empty: toggle one mid-frame pixel
        frame.set_pixel(Rotation::Portrait, 10, 200, 0x1000 + i);
        b.tft.update(&frame, false);
        b.tft.wait_update_complete();
        starts.push(b.tft.frame_timing().timeframestart as i64);
    }

    for pair in starts.windows(2) {
        let interval = pair[1] - pair[0];
        assert!(
            (interval - 2 * period).abs() <= period / 3,
            "interval {interval} vs 2x{period}"
        );
    }
    let stats = b.tft.stats();
    assert_eq!(stats.nb_teared, 0);
    assert_eq!(stats.vsync_spacing.avg(), 2);
}

/// With `late_start_ratio = 0` every vsync'd upload waits for its start
/// scanline; full redraws therefore always begin right at line 0.
#[test]
fn zero_late_start_ratio_always_waits_for_line_zero() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(1);
    b.tft.set_late_start_ratio(0.0);
    let frame = random_frame(5);

    for _ in 0..4 {
        b.tft.update(&frame, true);
        b.tft.wait_update_complete();
        let slinitpos = b.tft.frame_timing().slinitpos;
        assert!(slinitpos <= 2, "upload began at line {slinitpos}");
    }
}

/// With `vsync_spacing = -1` an update arriving during an active upload
/// is dropped wholesale: no buffer changes, no extra frame.
#[test]
fn spacing_minus_one_drops_frames_while_busy_double() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(-1);
    let f1 = solid_frame(0xF800);
    let f2 = solid_frame(0x07E0);

    b.tft.update(&f1, false);
    assert!(b.tft.async_update_active());
    b.tft.update(&f2, false); // dropped
    b.tft.wait_update_complete();

    assert_eq!(b.tft.stats().nb_frames, 1);
    b.panel.assert_matches(f1.as_slice(), Rotation::Portrait);

    // once idle the next frame goes through
    b.tft.update(&f2, false);
    b.tft.wait_update_complete();
    assert_eq!(b.tft.stats().nb_frames, 2);
    b.panel.assert_matches(f2.as_slice(), Rotation::Portrait);
}

/// Same drop policy under triple buffering: nothing is staged either.
#[test]
fn spacing_minus_one_drops_frames_while_busy_triple() {
    let mut b = bench_triple();
    b.tft.set_vsync_spacing(-1);
    let f1 = solid_frame(0x001F);
    let f2 = solid_frame(0xFFE0);

    b.tft.update(&f1, false);
    assert!(b.tft.async_update_active());
    b.tft.update(&f2, false); // dropped, not staged
    b.tft.wait_update_complete();

    assert_eq!(b.tft.stats().nb_frames, 1);
    b.panel.assert_matches(f1.as_slice(), Rotation::Portrait);
}

/// An empty diff still advances the vsync ledger instead of freezing it.
#[test]
fn empty_diffs_keep_the_frame_ledger_moving() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(2);
    let frame = random_frame(11);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();
    let t1 = b.tft.frame_timing().timeframestart;

    // identical frame: nothing to upload, but time moves on
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();
    let t2 = b.tft.frame_timing().timeframestart;
    assert!(t2 >= t1);
    assert_eq!(b.tft.stats().nb_frames, 2);
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// Slower refresh modes stretch the measured period accordingly.
#[test]
fn refresh_modes_scale_the_measured_period() {
    let mut b = bench_double();
    let rate0 = b.tft.refresh_rate();
    assert!(rate0 > 55.0 && rate0 < 65.0, "mode 0 rate {rate0}");

    b.tft.set_refresh_mode(15);
    let rate15 = b.tft.refresh_rate();
    assert!(
        (rate15 - rate0 * 16.0 / 31.0).abs() < 2.0,
        "mode 15 rate {rate15}"
    );

    b.tft.set_refresh_mode(16);
    let rate16 = b.tft.refresh_rate();
    assert!((rate16 - rate0 / 2.0).abs() < 2.0, "mode 16 rate {rate16}");

    // the derived mode search inverts the mapping
    assert_eq!(b.tft.mode_for_refresh_rate(rate0), 0);
    assert_eq!(b.tft.mode_for_refresh_rate(rate16), 16);
}
