//! End-to-end scenarios against the virtual panel.
//!
//! Run with: cargo test -p panel-emulator --test scenarios

mod common;

use common::{bench_double, bench_triple, leak_fb, random_frame, solid_frame};
use ili9488_vsync::{commands, Rotation, NB_PIXELS, TFT_WIDTH};

/// Full redraw of a black frame with vsync pacing: the panel converges,
/// the self-diagnostic stays healthy, and nothing tears.
#[test]
fn s1_full_redraw_black_frame_with_vsync() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(2);
    let frame = solid_frame(0x0000);

    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    assert_eq!(b.tft.self_diag_status(), Some(0xC0));
    let stats = b.tft.stats();
    assert_eq!(stats.nb_frames, 1);
    assert_eq!(stats.nb_teared, 0);
    assert!(stats.margin.min() >= 0, "margin {}", stats.margin.min());
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// A one-pixel change travels as exactly one short run to the right
/// address window.
#[test]
fn s2_single_pixel_change_uploads_one_run() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(0);
    let base = random_frame(1);
    b.tft.update(&base, false);
    b.tft.wait_update_complete();
    b.panel.reset_counters();

    let mut frame = random_frame(1);
    frame.set_pixel(Rotation::Portrait, 100, 200, 0xF800);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    let runs = b.panel.runs();
    assert_eq!(runs.len(), 1, "expected one run, got {runs:?}");
    assert!(runs[0] >= 1 && runs[0] <= 1 + b.tft.diff_gap());
    assert!(b.panel.pixels_written() <= u64::from(1 + b.tft.diff_gap()));
    // the address window starts exactly on the pixel
    let windows = b.panel.windows();
    assert!(windows.contains(&(commands::CASET, 100, (TFT_WIDTH - 1) as u16)));
    assert!(windows.iter().any(|&(c, start, _)| c == commands::PASET && start == 200));
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// Half-frame fill with gap 4: one full-width run per changed scanline.
#[test]
fn s3_half_frame_fill_is_one_run_per_scanline() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(0);
    b.tft.set_diff_gap(4);
    let base = solid_frame(0x0000);
    b.tft.update(&base, false);
    b.tft.wait_update_complete();
    b.panel.reset_counters();

    let mut frame = solid_frame(0x0000);
    for i in 0..(NB_PIXELS / 2) {
        frame.as_mut_slice()[i] = 0xFFFF;
    }
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    let runs = b.panel.runs();
    assert_eq!(runs.len(), 240);
    assert!(runs.iter().all(|&len| len == TFT_WIDTH));
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// Triple buffering absorbs back-to-back updates: every submitted frame
/// uploads, the staging buffer is recycled, and the last frame wins.
#[test]
fn s4_triple_buffered_back_to_back_updates() {
    let mut b = bench_triple();
    b.tft.set_vsync_spacing(2);
    let f1 = solid_frame(0xF800);
    let f2 = solid_frame(0x07E0);
    let f3 = solid_frame(0x001F);

    b.tft.update(&f1, false);
    assert!(b.tft.async_update_active(), "first update should be async");
    b.tft.update(&f2, false); // staged behind the first upload
    b.tft.update(&f3, false); // restages: replaces the staged frame
    b.tft.wait_update_complete();

    assert_eq!(b.tft.stats().nb_frames, 3);
    b.panel.assert_matches(f3.as_slice(), Rotation::Portrait);
}

/// The single-pixel scenario under rotation: same logical pixel, rotated
/// scan order and address window.
#[test]
fn s5_single_pixel_change_in_landscape() {
    let mut b = bench_double();
    b.tft.set_rotation(Rotation::Landscape);
    b.tft.set_vsync_spacing(0);
    let base = random_frame(7);
    b.tft.update(&base, false);
    b.tft.wait_update_complete();
    b.panel.assert_matches(base.as_slice(), Rotation::Landscape);
    b.panel.reset_counters();

    let mut frame = random_frame(7);
    frame.set_pixel(Rotation::Landscape, 100, 200, 0xF800);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    // logical (100, 200) in landscape sits at panel (119, 100)
    let windows = b.panel.windows();
    assert!(windows.iter().any(|&(c, start, _)| c == commands::CASET && start == 119));
    assert!(windows.iter().any(|&(c, start, _)| c == commands::PASET && start == 100));
    assert_eq!(b.panel.pixel(119, 100), [0xFF, 0x00, 0x00]);
    b.panel.assert_matches(frame.as_slice(), Rotation::Landscape);
}

/// Masked-out bits never upload: changing only the blue channel under a
/// blue compare mask produces an empty diff and no pixel traffic.
#[test]
fn s6_compare_mask_suppresses_the_upload() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(0);
    b.tft.set_compare_mask(0x001F);
    let base = random_frame(9);
    b.tft.update(&base, false);
    b.tft.wait_update_complete();
    b.panel.reset_counters();

    let mut frame = random_frame(9);
    for px in frame.as_mut_slice() {
        *px ^= 0x0007; // bottom bits of blue only
    }
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();

    assert_eq!(b.panel.pixels_written(), 0, "no upload expected");
    assert!(b.panel.runs().is_empty());
    // the panel still shows the previous content
    b.panel.assert_matches(base.as_slice(), Rotation::Portrait);
}

/// Diff updates converge under every rotation.
#[test]
fn updates_converge_under_all_rotations() {
    for rotation in [
        Rotation::Portrait,
        Rotation::Landscape,
        Rotation::PortraitFlipped,
        Rotation::LandscapeFlipped,
    ] {
        let mut b = bench_double();
        b.tft.set_rotation(rotation);
        b.tft.set_vsync_spacing(0);
        let base = random_frame(20);
        b.tft.update(&base, false);
        b.tft.wait_update_complete();

        let mut frame = random_frame(20);
        for (i, px) in frame.as_mut_slice().iter_mut().enumerate().step_by(977) {
            *px ^= (i as u16) | 1;
        }
        b.tft.update(&frame, false);
        b.tft.wait_update_complete();
        b.panel.assert_matches(frame.as_slice(), rotation);
    }
}

/// `clear` establishes the mirror synchronously: the next update only
/// carries the difference.
#[test]
fn clear_establishes_the_mirror() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(0);
    b.tft.clear(0x07E0);
    b.panel.assert_matches(solid_frame(0x07E0).as_slice(), Rotation::Portrait);
    b.panel.reset_counters();

    let mut frame = solid_frame(0x07E0);
    frame.set_pixel(Rotation::Portrait, 3, 4, 0xFFFF);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();
    assert!(b.panel.pixels_written() <= u64::from(1 + b.tft.diff_gap()));
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// A forced full redraw uploads everything even with a clean mirror.
#[test]
fn force_full_redraw_uploads_every_pixel() {
    let mut b = bench_double();
    b.tft.set_vsync_spacing(0);
    let frame = random_frame(31);
    b.tft.update(&frame, false);
    b.tft.wait_update_complete();
    b.panel.reset_counters();

    b.tft.update(&frame, true);
    b.tft.wait_update_complete();
    assert_eq!(b.panel.pixels_written(), NB_PIXELS as u64);
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);
}

/// Unbuffered mode pushes frames synchronously through the dummy diff.
#[test]
fn unbuffered_update_is_synchronous_and_complete() {
    let mut b = common::bench();
    b.tft.set_vsync_spacing(0);
    let frame = random_frame(41);
    b.tft.update(&frame, false);
    assert!(!b.tft.async_update_active());
    assert_eq!(b.panel.pixels_written(), NB_PIXELS as u64);
    b.panel.assert_matches(frame.as_slice(), Rotation::Portrait);

    // leaking a bound framebuffer afterwards keeps working
    b.tft.bind_framebuffers(Some(leak_fb()), None);
    assert!(b.tft.diff_update_active() == false);
}
