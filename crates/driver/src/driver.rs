//! The panel session and buffering policy.
//!
//! [`Ili9488`] owns the blocking link and the caller-side configuration,
//! and steers the shared [`UpdateEngine`]. Every `update` call walks the
//! buffering decision table: which buffer receives the new frame, which
//! diff it is encoded into, and whether the upload launches now, is
//! staged behind the in-flight one, or is dropped.
//!
//! Bring-up can fail (and then refuses updates); everything after a
//! successful [`begin`](Ili9488::begin) is best-effort - frames may be
//! dropped, tear, or upload conservatively, but calls never fail.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use platform::{IntervalTimer, LinkSpeed, PanelLink, PixelPipe, TimeSource};

use crate::commands as cmd;
use crate::diff::{DiffBuffer, DiffRead, DummyDiff};
use crate::framebuffer::Framebuffer;
use crate::rotation::{copy_region, rotation_box, Rect, Rotation, ScanCursor};
use crate::stats::{FrameStats, FrameTiming};
use crate::upload::{DiffHandle, Mirror, Swap, UpdateEngine, MIN_WAIT_MICROS};
use crate::{line_of_row, MAX_VSYNC_SPACING, NB_PIXELS, NB_SCANLINES, TFT_HEIGHT, TFT_WIDTH};

/// Bring-up attempts before giving up; each retry halves the read clock.
const INIT_RETRIES: usize = 3;

/// Guard against a wedged scanline source while measuring the refresh
/// period.
const MAX_SYNC_POLLS: u32 = 200_000;

/// How the driver is buffered, decided by which framebuffers are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferingMode {
    /// No internal framebuffer: synchronous full uploads only.
    NoBuffer,
    /// One internal framebuffer: asynchronous diff updates.
    Double,
    /// Two internal framebuffers: updates may be staged while another
    /// upload is in flight.
    Triple,
}

/// Why bring-up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeginError {
    /// Status registers all read zero: the read path is dead (wiring, or
    /// the read clock is still too fast).
    DeadRead,
    /// The panel answered, but not with the expected configuration.
    BadStatus {
        /// Display power mode (expected 0x9C).
        power: u8,
        /// Pixel format (expected 0x05).
        pixel_format: u8,
        /// Image format (expected 0x00).
        image_format: u8,
        /// Self-diagnostic (expected 0xC0).
        self_diag: u8,
    },
}

impl core::fmt::Display for BeginError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeadRead => write!(f, "panel status registers unreadable"),
            Self::BadStatus {
                power,
                pixel_format,
                image_format,
                self_diag,
            } => write!(
                f,
                "unexpected panel status: power={power:#04x} pixfmt={pixel_format:#04x} \
                 imgfmt={image_format:#04x} diag={self_diag:#04x}"
            ),
        }
    }
}

/// Driver session for one ILI9488 panel.
pub struct Ili9488<L, P, T, C>
where
    L: PanelLink,
    P: PixelPipe + 'static,
    T: IntervalTimer + 'static,
    C: TimeSource + 'static,
{
    link: L,
    clock: C,
    engine: &'static UpdateEngine<P, T, C>,
    rotation: Rotation,
    refresh_mode: u8,
    diff_gap: u32,
    compare_mask: u16,
    initialized: bool,
}

impl<L, P, T, C> Ili9488<L, P, T, C>
where
    L: PanelLink,
    P: PixelPipe,
    T: IntervalTimer,
    C: TimeSource,
{
    /// Wrap the hardware resources. Call [`begin`](Self::begin) before
    /// anything else.
    pub fn new(link: L, clock: C, engine: &'static UpdateEngine<P, T, C>) -> Self {
        Self {
            link,
            clock,
            engine,
            rotation: Rotation::Portrait,
            refresh_mode: 0,
            diff_gap: 6,
            compare_mask: 0,
            initialized: false,
        }
    }

    // ── bring-up ────────────────────────────────────────────────────────

    /// Reset and initialize the panel, verify its status registers, and
    /// measure the refresh period. Retries with a halved read clock when
    /// the registers read back garbage; refuses updates on failure.
    pub fn begin(&mut self) -> Result<(), BeginError> {
        info!("panel bring-up");
        self.initialized = false;
        self.engine.with(|i, _| {
            i.mirror = Mirror::None;
            i.ongoing_diff = false;
            i.late_start_override = true;
            i.stats.reset();
        });

        let mut last = BeginError::DeadRead;
        for attempt in 0..INIT_RETRIES {
            if attempt > 0 {
                self.link.halve_read_clock();
                debug!("bring-up retry {} with halved read clock", attempt);
            }
            self.reset_panel();
            self.run_init_table();

            let power = self.read8(cmd::RDMODE);
            let pixel_format = self.read8(cmd::RDPIXFMT);
            let image_format = self.read8(cmd::RDIMGFMT);
            let self_diag = self.read8(cmd::RDSELFDIAG);

            if power == 0 && pixel_format == 0 && image_format == 0 && self_diag == 0 {
                last = BeginError::DeadRead;
                continue;
            }
            if power == cmd::STATUS_POWER_MODE
                && pixel_format == cmd::STATUS_PIXEL_FORMAT
                && image_format == cmd::STATUS_IMAGE_FORMAT
                && self_diag == cmd::STATUS_SELFDIAG_OK
            {
                self.initialized = true;
                self.set_refresh_mode(0);
                self.engine.with(|i, _| {
                    let period = i.scan.period();
                    i.scan.set_period_mode0(period);
                });
                info!("panel initialization successful");
                return Ok(());
            }
            last = BeginError::BadStatus {
                power,
                pixel_format,
                image_format,
                self_diag,
            };
        }
        warning!("cannot connect to the panel, giving up");
        Err(last)
    }

    fn reset_panel(&mut self) {
        self.link.begin(LinkSpeed::Setup);
        for _ in 0..5 {
            self.link.command(cmd::NOP);
        }
        self.link.command(cmd::SWRESET);
        self.link.end();
        self.clock.delay_micros(150_000);
    }

    fn run_init_table(&mut self) {
        self.link.begin(LinkSpeed::Setup);
        let mut at = 0;
        while at < cmd::INIT_SEQUENCE.len() {
            let count = cmd::INIT_SEQUENCE[at] as usize;
            at += 1;
            if count == 0 {
                break;
            }
            self.link.command(cmd::INIT_SEQUENCE[at]);
            at += 1;
            for _ in 0..count - 1 {
                self.link.data8(cmd::INIT_SEQUENCE[at]);
                at += 1;
            }
        }
        self.link.command(cmd::SLPOUT);
        self.link.end();
        self.clock.delay_micros(150_000);

        self.link.begin(LinkSpeed::Setup);
        self.link.command(cmd::DISPON);
        self.link.end();
    }

    fn read8(&mut self, command: u8) -> u8 {
        self.link.begin(LinkSpeed::Read);
        let value = self.link.read8(command).unwrap_or(0);
        self.link.end();
        value
    }

    /// Read the scan position from the panel and refresh the prediction
    /// anchor. An unreadable or clearly invalid response keeps the prior
    /// anchor and returns the prediction instead.
    fn read_scanline_hw(&mut self) -> u32 {
        let now = self.clock.now_micros();
        self.link.begin(LinkSpeed::Read);
        let read = self.link.read_scanline();
        self.link.end();
        match read {
            Some(raw) if u32::from(raw) < NB_SCANLINES => {
                let line = u32::from(raw);
                self.engine.with(|i, _| i.scan.anchor(line, now));
                line
            }
            _ => self.engine.with(|i, _| i.scan.line_now(now)),
        }
    }

    /// Time consecutive line-0 crossings over ten refreshes and store the
    /// averaged period.
    fn sample_refresh_period(&mut self) {
        const SAMPLE_FRAMES: u32 = 10;
        let mut polls: u32 = 0;
        // false = the scanline source wedged; keep the previous period
        let mut wait_line = |s: &mut Self, zero: bool| -> bool {
            loop {
                polls += 1;
                if polls > MAX_SYNC_POLLS {
                    return false;
                }
                if (s.read_scanline_hw() == 0) == zero {
                    return true;
                }
            }
        };

        if !wait_line(self, true) || !wait_line(self, false) {
            warning!("scanline source wedged; keeping previous period");
            return;
        }
        let t0 = self.clock.now_micros();
        for _ in 0..SAMPLE_FRAMES {
            self.clock.delay_micros(5_000); // stay below 200 fps
            if !wait_line(self, true) || !wait_line(self, false) {
                warning!("scanline source wedged; keeping previous period");
                return;
            }
        }
        let period = ((self.clock.now_micros() - t0) / u64::from(SAMPLE_FRAMES)) as u32;
        self.engine.with(|i, _| i.scan.set_period(period));
        debug!("measured refresh period: {} us", period);
    }

    // ── configuration ───────────────────────────────────────────────────

    /// Rebind the internal framebuffers. Provided buffers are zeroed; the
    /// mirror is invalidated, forcing the next update to redraw fully.
    pub fn bind_framebuffers(
        &mut self,
        fb1: Option<&'static mut Framebuffer>,
        fb2: Option<&'static mut Framebuffer>,
    ) {
        self.wait_update_complete();
        let (fb1, fb2) = if fb1.is_none() { (fb2, None) } else { (fb1, fb2) };
        let p1 = fb1.map(|f| {
            f.fill(0);
            NonNull::from(f)
        });
        let p2 = fb2.map(|f| {
            f.fill(0);
            NonNull::from(f)
        });
        self.engine.with(|i, _| {
            i.fb1 = p1;
            i.fb2 = p2;
            i.mirror = Mirror::None;
            i.ongoing_diff = false;
            i.fb2_full = false;
            i.swap_on_complete = Swap::None;
        });
        self.resync();
    }

    /// Rebind the diff buffers; takes effect on the next update.
    pub fn bind_diff_buffers(
        &mut self,
        diff1: Option<&'static mut DiffBuffer<'static>>,
        diff2: Option<&'static mut DiffBuffer<'static>>,
    ) {
        self.wait_update_complete();
        let (diff1, diff2) = if diff1.is_none() {
            (diff2, None)
        } else {
            (diff1, diff2)
        };
        self.engine.with(|i, _| {
            i.diff1 = diff1.map(NonNull::from);
            i.diff2 = diff2.map(NonNull::from);
        });
    }

    /// Change the orientation. Invalidates the mirror and the statistics.
    pub fn set_rotation(&mut self, rotation: Rotation) {
        if rotation == self.rotation {
            return;
        }
        self.wait_update_complete();
        self.rotation = rotation;
        self.engine.with(|i, _| {
            i.mirror = Mirror::None;
            i.ongoing_diff = false;
            i.stats.reset();
        });
        self.resync();
    }

    /// Current orientation.
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Select one of the panel's 32 frame rates and re-measure the
    /// refresh period. Out-of-range modes are ignored.
    pub fn set_refresh_mode(&mut self, mode: u8) {
        if mode > 31 || !self.initialized {
            return;
        }
        self.refresh_mode = mode;
        self.wait_update_complete();
        let (diva, rtna) = if mode >= 16 { (1, mode - 16) } else { (0, mode) };
        self.link.begin(LinkSpeed::Setup);
        self.link.command(cmd::FRMCTR1);
        self.link.data8(diva);
        self.link.data8(0x10 + rtna);
        self.link.end();
        self.clock.delay_micros(50);
        self.sample_refresh_period();
        self.engine.with(|i, _| i.stats.reset());
        self.resync();
    }

    /// Current refresh mode.
    pub fn refresh_mode(&self) -> u8 {
        self.refresh_mode
    }

    /// Measured refresh rate of the current mode, Hz.
    pub fn refresh_rate(&self) -> f32 {
        let mode = self.refresh_mode;
        self.engine.with(|i, _| i.scan.refresh_rate_for_mode(mode))
    }

    /// Refresh rate a given mode would produce, Hz.
    pub fn refresh_rate_for_mode(&self, mode: u8) -> f32 {
        self.engine.with(|i, _| i.scan.refresh_rate_for_mode(mode))
    }

    /// The mode whose rate is closest to `hz`.
    pub fn mode_for_refresh_rate(&self, hz: f32) -> u8 {
        self.engine.with(|i, _| i.scan.mode_for_refresh_rate(hz))
    }

    /// Target refreshes per uploaded frame: `-1` drops frames when busy,
    /// `0` uploads as fast as possible, `k >= 1` paces and beam-syncs.
    pub fn set_vsync_spacing(&mut self, spacing: i8) {
        let spacing = spacing.clamp(-1, MAX_VSYNC_SPACING);
        self.engine.with(|i, _| i.vsync_spacing = spacing);
    }

    /// Current vsync spacing.
    pub fn vsync_spacing(&self) -> i8 {
        self.engine.with(|i, _| i.vsync_spacing)
    }

    /// Unchanged-pixel gap merged into adjacent runs (trades bandwidth
    /// for fewer address windows).
    pub fn set_diff_gap(&mut self, gap: u32) {
        self.diff_gap = gap.max(1);
    }

    /// Current diff gap.
    pub fn diff_gap(&self) -> u32 {
        self.diff_gap
    }

    /// Bits ignored when comparing pixels; 0 compares strictly.
    pub fn set_compare_mask(&mut self, mask: u16) {
        self.compare_mask = mask;
    }

    /// Current compare mask.
    pub fn compare_mask(&self) -> u16 {
        self.compare_mask
    }

    /// Fraction of the frame the upload may start late before it gives
    /// up waiting and risks tearing.
    pub fn set_late_start_ratio(&mut self, ratio: f32) {
        let ratio = ratio.clamp(0.0, 1.0);
        self.engine.with(|i, _| i.late_start_ratio = ratio);
    }

    /// Current late-start ratio.
    pub fn late_start_ratio(&self) -> f32 {
        self.engine.with(|i, _| i.late_start_ratio)
    }

    /// Arm the one-shot strict wait-for-line-0: the next vsync'd frame
    /// ignores the late-start window. Called internally after anything
    /// that disturbs the timing (rotation, sleep, refresh mode, rebind).
    pub fn resync(&mut self) {
        self.engine.with(|i, _| i.late_start_override = true);
    }

    // ── status ──────────────────────────────────────────────────────────

    /// Whether an asynchronous upload is in flight.
    pub fn async_update_active(&self) -> bool {
        self.engine.active()
    }

    /// Whether updates run differentially (enough diff buffers for the
    /// current buffering mode).
    pub fn diff_update_active(&self) -> bool {
        self.engine
            .with(|i, _| i.diff1.is_some() && (i.fb2.is_none() || i.diff2.is_some()))
    }

    /// Buffering mode implied by the bound framebuffers.
    pub fn buffering_mode(&self) -> BufferingMode {
        self.engine.with(|i, _| match (i.fb1.is_some(), i.fb2.is_some()) {
            (false, _) => BufferingMode::NoBuffer,
            (true, false) => BufferingMode::Double,
            (true, true) => BufferingMode::Triple,
        })
    }

    /// Block until no asynchronous upload is in flight.
    pub fn wait_update_complete(&self) {
        while self.engine.active() {
            self.clock.delay_micros(10);
        }
    }

    /// Upload statistics since the last reset.
    pub fn stats(&self) -> FrameStats {
        self.engine.with(|i, _| i.stats.clone())
    }

    /// Forget all statistics.
    pub fn stats_reset(&mut self) {
        self.engine.with(|i, _| i.stats.reset());
    }

    /// Timing record of the most recent frame.
    pub fn frame_timing(&self) -> FrameTiming {
        self.engine.with(|i, _| i.timing)
    }

    /// Read the panel's self-diagnostic register.
    pub fn self_diag_status(&mut self) -> Option<u8> {
        self.wait_update_complete();
        self.resync();
        self.link.begin(LinkSpeed::Read);
        let diag = self.link.read8(cmd::RDSELFDIAG);
        self.link.end();
        diag
    }

    // ── misc panel commands ─────────────────────────────────────────────

    /// Enter or leave sleep. Forces a full redraw on the next update.
    pub fn sleep(&mut self, enable: bool) {
        self.wait_update_complete();
        self.engine.with(|i, _| {
            i.mirror = Mirror::None;
            i.ongoing_diff = false;
        });
        self.link.begin(LinkSpeed::Setup);
        if enable {
            self.link.command(cmd::DISPOFF);
            self.link.command(cmd::SLPIN);
        } else {
            self.link.command(cmd::DISPON);
            self.link.command(cmd::SLPOUT);
        }
        self.link.end();
        self.clock
            .delay_micros(if enable { 200_000 } else { 20_000 });
        self.resync();
    }

    /// Invert the panel colors.
    pub fn invert_display(&mut self, invert: bool) {
        self.wait_update_complete();
        self.link.begin(LinkSpeed::Setup);
        self.link
            .command(if invert { cmd::INVON } else { cmd::INVOFF });
        self.link.end();
        self.resync();
    }

    /// Set the vertical scroll start address, wrapped into the panel
    /// height.
    pub fn set_scroll(&mut self, offset: i32) {
        let height = TFT_HEIGHT as i32;
        let offset = ((offset % height) + height) % height;
        self.wait_update_complete();
        self.link.begin(LinkSpeed::Write);
        self.link.command(cmd::VSCRSADD);
        self.link.data16(offset as u16);
        // two consecutive scroll commands may stall without a RAMWR
        self.link.command(cmd::RAMWR);
        self.link.command(cmd::NOP);
        self.link.end();
    }

    // ── updates ─────────────────────────────────────────────────────────

    /// Push a frame to the panel. Asynchronous whenever buffering
    /// permits; `force_full` bypasses the differential path.
    pub fn update(&mut self, fb: &Framebuffer, force_full: bool) {
        if !self.initialized {
            return;
        }
        // A pending deferred region diff is dropped here: the mirror is
        // already marked unknown, so this update redraws fully. Accepted
        // edge case when interleaving update() and update_region().
        self.engine.with(|i, _| i.ongoing_diff = false);

        match self.buffering_mode() {
            BufferingMode::NoBuffer => {
                self.wait_update_complete();
                let dummy = self.engine.with(|i, _| {
                    i.mirror = Mirror::None;
                    i.dummy1.compute();
                    i.dummy1
                });
                self.upload_now(fb.as_slice(), dummy);
            }
            BufferingMode::Double => self.update_double(fb, force_full),
            BufferingMode::Triple => self.update_triple(fb, force_full),
        }
    }

    /// Push one logical rectangle of a frame. `sub` holds the rectangle
    /// row-major with `stride` (defaults to the rectangle width). With
    /// `redraw_now` false the upload is deferred: the diff is kept
    /// pending and integrated into the next update.
    pub fn update_region(&mut self, redraw_now: bool, sub: &[u16], rect: Rect, stride: Option<u32>) {
        if !self.initialized {
            return;
        }
        let stride = stride.unwrap_or(rect.width());
        debug_assert!(rect.xmax < self.rotation.width() && rect.ymax < self.rotation.height());
        debug_assert!(sub.len() as u32 >= (rect.height() - 1) * stride + rect.width());
        let rotation = self.rotation;
        let gap = self.diff_gap;
        let mask = self.compare_mask;

        match self.buffering_mode() {
            BufferingMode::NoBuffer => {
                // nothing mirrors the panel afterwards: push the rectangle
                self.engine.with(|i, _| {
                    i.mirror = Mirror::None;
                    i.ongoing_diff = false;
                });
                self.upload_rect_now(sub, rect, stride);
                return;
            }
            BufferingMode::Triple => {
                // the staging framebuffer is pointless for region updates;
                // wait until it (and diff2) are free
                loop {
                    if !self.engine.with(|i, _| i.fb2_full) {
                        break;
                    }
                    self.clock.delay_micros(5);
                }
            }
            BufferingMode::Double => {}
        }

        let has_diff2 = self.engine.with(|i, _| i.diff2.is_some());
        if !has_diff2 {
            // no differential region updates: copy into fb1, then either
            // redraw or leave the mirror unknown
            self.engine.with(|i, _| i.ongoing_diff = false);
            self.wait_update_complete();
            let Some(fb1) = self.engine.with(|i, _| i.fb1) else {
                return;
            };
            let mut dummy = self.engine.with(|i, _| i.dummy1);
            // SAFETY: engine idle; fb1 is caller-owned until the launch.
            let mirror = unsafe { &mut *fb1.as_ptr() };
            dummy.compute_region_and_copy(mirror.as_mut_slice(), sub, rect, stride, rotation);
            self.engine.with(|i, _| i.dummy1 = dummy);
            if redraw_now {
                let mirror_known = self.engine.with(|i, _| i.mirror != Mirror::None);
                if mirror_known {
                    self.upload_rect_now(sub, rect, stride);
                    self.engine.with(|i, _| i.mirror = Mirror::Fb1);
                } else {
                    self.engine.with(|i, active| {
                        i.mirror = Mirror::Fb1;
                        let d = i.dummy1;
                        i.launch(active, fb1, rotation, DiffHandle::Dummy(d));
                    });
                }
            } else {
                self.engine.with(|i, _| i.mirror = Mirror::None);
            }
            return;
        }

        let (mirror_known, ongoing) =
            self.engine.with(|i, _| (i.mirror != Mirror::None, i.ongoing_diff));
        if mirror_known || ongoing {
            let (fb1, d1, d2) = match self.engine.with(|i, _| {
                i.fb1.and_then(|f| i.diff1.map(|d1| (f, d1, i.diff2.unwrap_or(d1))))
            }) {
                Some(t) => t,
                None => return,
            };
            // SAFETY: the pipeline reads fb1/diff1; diff2 is free, and
            // fb1 is only read here while an upload is active.
            let d2_ref = unsafe { &mut *d2.as_ptr() };
            let fb1_read = unsafe { &*fb1.as_ptr() };
            let prev_ref = if ongoing {
                // carry the pending deferred diff into the recompute
                Some(unsafe { &*d1.as_ptr() })
            } else {
                None
            };
            if self.engine.active() {
                d2_ref.compute_region(
                    fb1_read.as_slice(),
                    prev_ref,
                    sub,
                    rect,
                    stride,
                    rotation,
                    gap,
                    mask,
                );
                self.wait_update_complete();
                // SAFETY: engine idle now; fb1 is caller-owned again.
                let fb1_mut = unsafe { &mut *fb1.as_ptr() };
                copy_region(fb1_mut.as_mut_slice(), sub, rect, stride, rotation);
            } else {
                // SAFETY: engine idle; fb1 is caller-owned.
                let fb1_mut = unsafe { &mut *fb1.as_ptr() };
                d2_ref.compute_region_and_copy(
                    fb1_mut.as_mut_slice(),
                    prev_ref,
                    sub,
                    rect,
                    stride,
                    rotation,
                    gap,
                    mask,
                );
            }
            self.engine.with(|i, active| {
                i.swap_diffs();
                if redraw_now {
                    i.mirror = Mirror::Fb1;
                    i.ongoing_diff = false;
                    if let Some(d1) = i.diff1 {
                        i.launch(active, fb1, rotation, DiffHandle::Buffer(d1));
                    }
                } else {
                    i.mirror = Mirror::None;
                    i.ongoing_diff = true;
                }
            });
            return;
        }

        // mirror unknown and nothing pending: integrate the region and
        // optionally redraw everything
        self.wait_update_complete();
        let Some(fb1) = self.engine.with(|i, _| i.fb1) else {
            return;
        };
        // SAFETY: engine idle; fb1 is caller-owned until the launch.
        let fb1_mut = unsafe { &mut *fb1.as_ptr() };
        copy_region(fb1_mut.as_mut_slice(), sub, rect, stride, rotation);
        if redraw_now {
            self.engine.with(|i, active| {
                i.dummy1.compute();
                i.mirror = Mirror::Fb1;
                let d = i.dummy1;
                i.launch(active, fb1, rotation, DiffHandle::Dummy(d));
            });
        }
    }

    /// Fill the panel with a solid color, synchronously. Also fills the
    /// internal framebuffer (which then mirrors the panel).
    pub fn clear(&mut self, color: u16) {
        if !self.initialized {
            return;
        }
        self.wait_update_complete();
        self.link.begin(LinkSpeed::Write);
        self.link.command(cmd::PASET);
        self.link.data16(0);
        self.link.data16((TFT_HEIGHT - 1) as u16);
        self.link.command(cmd::CASET);
        self.link.data16(0);
        self.link.data16((TFT_WIDTH - 1) as u16);
        self.link.command(cmd::RAMWR);
        for _ in 0..NB_PIXELS {
            self.link.pixel(color);
        }
        self.link.command(cmd::NOP);
        self.link.end();
        self.engine.with(|i, _| {
            if let Some(fb1) = i.fb1 {
                // SAFETY: engine idle; fb1 is caller-owned.
                unsafe { &mut *fb1.as_ptr() }.fill(color);
                i.mirror = Mirror::Fb1;
                i.ongoing_diff = false;
            }
        });
        self.resync();
    }

    // ── buffered update paths ───────────────────────────────────────────

    fn update_double(&mut self, fb: &Framebuffer, force_full: bool) {
        let vsync = self.engine.with(|i, _| i.vsync_spacing);
        if vsync == -1 && self.engine.active() {
            return; // drop the frame
        }

        let (has_d1, has_d2, mirror_known) = self
            .engine
            .with(|i, _| (i.diff1.is_some(), i.diff2.is_some(), i.mirror != Mirror::None));

        if !has_d1 || !mirror_known || force_full {
            self.wait_update_complete();
            self.launch_from_fb1(fb, true);
            return;
        }
        if !has_d2 {
            // a single diff buffer: compute only while idle
            self.wait_update_complete();
            self.launch_from_fb1(fb, false);
            return;
        }
        if self.engine.active() {
            // diff2 is free: encode against the in-flight mirror while
            // the upload drains, then commit and relaunch
            let (fb1, d2) = match self.engine.with(|i, _| i.fb1.zip(i.diff2)) {
                Some(t) => t,
                None => return,
            };
            let rotation = self.rotation;
            // SAFETY: the pipeline only reads fb1; diff2 is free.
            let d2_ref = unsafe { &mut *d2.as_ptr() };
            let fb1_read = unsafe { &*fb1.as_ptr() };
            d2_ref.compute(
                fb1_read.as_slice(),
                fb.as_slice(),
                rotation,
                self.diff_gap,
                self.compare_mask,
            );
            self.wait_update_complete();
            // SAFETY: engine idle; fb1 is caller-owned again.
            let fb1_mut = unsafe { &mut *fb1.as_ptr() };
            fb1_mut.as_mut_slice().copy_from_slice(fb.as_slice());
            self.engine.with(|i, active| {
                i.swap_diffs();
                i.mirror = Mirror::Fb1;
                if let Some(d1) = i.diff1 {
                    i.launch(active, fb1, rotation, DiffHandle::Buffer(d1));
                }
            });
        } else {
            self.launch_from_fb1(fb, false);
        }
    }

    fn update_triple(&mut self, fb: &Framebuffer, force_full: bool) {
        if !self.engine.active() {
            self.launch_from_fb1(fb, force_full);
            return;
        }
        let vsync = self.engine.with(|i, _| i.vsync_spacing);
        if vsync == -1 {
            return; // drop the frame while an upload is in flight
        }

        // wait for the staging framebuffer to drain
        loop {
            if !self.engine.with(|i, _| i.fb2_full) {
                break;
            }
            self.clock.delay_micros(5);
        }

        // claim the staging slot: drop any pending completion swap so the
        // interrupt cannot consume fb2 while we refill it
        let still_active = self.engine.with(|i, active| {
            if active.load(Ordering::Acquire) {
                i.swap_on_complete = Swap::None;
                true
            } else {
                false
            }
        });
        if !still_active {
            self.launch_from_fb1(fb, force_full);
            return;
        }

        let rotation = self.rotation;
        let use_diff = !force_full
            && self
                .engine
                .with(|i, _| i.mirror != Mirror::None && i.diff2.is_some());
        if use_diff {
            let (fb1, fb2, d2) = match self
                .engine
                .with(|i, _| i.fb1.zip(i.fb2).zip(i.diff2).map(|((a, b), c)| (a, b, c)))
            {
                Some(t) => t,
                None => return,
            };
            // SAFETY: the pipeline reads fb1/diff1; fb2 and diff2 are
            // caller-owned while fb2_full is clear.
            let d2_ref = unsafe { &mut *d2.as_ptr() };
            let fb1_read = unsafe { &*fb1.as_ptr() };
            let fb2_mut = unsafe { &mut *fb2.as_ptr() };
            d2_ref.compute(
                fb1_read.as_slice(),
                fb.as_slice(),
                rotation,
                self.diff_gap,
                self.compare_mask,
            );
            fb2_mut.as_mut_slice().copy_from_slice(fb.as_slice());
            self.engine.with(|i, active| {
                if active.load(Ordering::Acquire) {
                    // still uploading: hand fb2 to the completion interrupt
                    i.swap_on_complete = Swap::Diffed;
                    i.fb2_full = true;
                    i.mirror = Mirror::Fb2;
                } else {
                    i.swap_diffs();
                    i.swap_framebuffers();
                    i.mirror = Mirror::Fb1;
                    if let (Some(fb1), Some(d1)) = (i.fb1, i.diff1) {
                        i.launch(active, fb1, rotation, DiffHandle::Buffer(d1));
                    }
                }
            });
        } else {
            let fb2 = match self.engine.with(|i, _| i.fb2) {
                Some(t) => t,
                None => return,
            };
            // SAFETY: fb2 is caller-owned while fb2_full is clear.
            let fb2_mut = unsafe { &mut *fb2.as_ptr() };
            fb2_mut.as_mut_slice().copy_from_slice(fb.as_slice());
            self.engine.with(|i, active| {
                i.dummy2.compute();
                if active.load(Ordering::Acquire) {
                    i.swap_on_complete = Swap::Dummy;
                    i.fb2_full = true;
                    i.mirror = Mirror::None; // a full redraw is staged
                } else {
                    i.swap_dummies();
                    i.swap_framebuffers();
                    i.mirror = Mirror::Fb1;
                    if let Some(fb1) = i.fb1 {
                        let d = i.dummy1;
                        i.launch(active, fb1, rotation, DiffHandle::Dummy(d));
                    }
                }
            });
        }
    }

    /// Encode `fb` against the committed mirror in `fb1` and launch. The
    /// engine must be idle. `full` forces the dummy full-frame path.
    fn launch_from_fb1(&mut self, fb: &Framebuffer, full: bool) {
        let rotation = self.rotation;
        let (fb1, d1, has_d2, mirror_known, triple) = match self.engine.with(|i, _| {
            i.fb1.map(|f| {
                (
                    f,
                    i.diff1,
                    i.diff2.is_some(),
                    i.mirror != Mirror::None,
                    i.fb2.is_some(),
                )
            })
        }) {
            Some(t) => t,
            None => return,
        };
        let full = full || !mirror_known || d1.is_none() || (triple && !has_d2);
        // SAFETY: engine idle; fb1 is caller-owned until the launch.
        let fb1_mut = unsafe { &mut *fb1.as_ptr() };
        if full {
            let mut dummy = self.engine.with(|i, _| i.dummy1);
            dummy.compute_and_copy(fb1_mut.as_mut_slice(), fb.as_slice());
            self.engine.with(|i, active| {
                i.dummy1 = dummy;
                i.mirror = Mirror::Fb1;
                i.launch(active, fb1, rotation, DiffHandle::Dummy(dummy));
            });
        } else {
            let Some(d1) = d1 else { return };
            // SAFETY: engine idle; diff1 is caller-owned until the launch.
            let d1_ref = unsafe { &mut *d1.as_ptr() };
            d1_ref.compute_and_copy(
                fb1_mut.as_mut_slice(),
                fb.as_slice(),
                rotation,
                self.diff_gap,
                self.compare_mask,
            );
            self.engine.with(|i, active| {
                i.mirror = Mirror::Fb1;
                i.launch(active, fb1, rotation, DiffHandle::Buffer(d1));
            });
        }
    }

    // ── synchronous upload paths ────────────────────────────────────────

    /// Blocking full-frame upload through the link, sequenced by the same
    /// instruction stream and vsync rules as the async path.
    fn upload_now(&mut self, fb: &[u16], dummy: DummyDiff) {
        let rotation = self.rotation;
        let start = self.clock.now_micros();
        let vsync = self.engine.with(|i, _| i.vsync_spacing);
        let mut cursor = dummy.start_read();

        let run0 = match dummy.read(&mut cursor, 0) {
            DiffRead::End => {
                let now = self.clock.now_micros();
                self.engine.with(|i, _| {
                    i.note_empty_frame(now);
                    let vs = (i.vsync_spacing > 0)
                        .then(|| (NB_SCANLINES as i32, i.timing.last_delta));
                    i.stats.end_frame(0, 0, (now - start) as u32, vs);
                });
                return;
            }
            DiffRead::Ready(run) => {
                cursor.push_back(run);
                run
            }
            DiffRead::Deferred { run, .. } => run,
        };

        let mut margin = NB_SCANLINES as i32;
        let mut slinitpos = 0u32;
        let mut em_anchor = start;
        let period = self.engine.with(|i, _| i.scan.period());

        if vsync > 0 && period > 0 {
            // pace: the previous frame stays up (spacing - 1) refreshes
            let target = self.engine.with(|i, _| {
                i.timing.timeframestart + (i.vsync_spacing as u64 - 1) * u64::from(period)
            });
            let dd = target.saturating_sub(self.clock.now_micros());
            if dd > 0 {
                self.clock.delay_micros(dd.min(u64::from(u32::MAX)) as u32);
            }
            // hardware resync, then hold for the start scanline window
            let sc1 = line_of_row(u32::from(run0.y));
            self.read_scanline_hw();
            let now = self.clock.now_micros();
            let (mut hold, with_resync, overridden) = self.engine.with(|i, _| {
                let late = ((NB_SCANLINES - 1 - sc1) as f32 * i.late_start_ratio) as u32;
                let t2 = i.scan.micros_to_reach(sc1 + late, now);
                let t = i.scan.micros_to_reach(sc1, now);
                let ov = i.late_start_override;
                i.late_start_override = false;
                (t, t2, ov)
            });
            if !overridden && with_resync < hold {
                hold = 0; // past the late window: start now, may tear
            }
            if hold > 0 {
                self.clock.delay_micros(hold);
            }
            loop {
                let now = self.clock.now_micros();
                let wait = self
                    .engine
                    .with(|i, _| i.scan.micros_to_exit_range(0, sc1, now));
                if wait == 0 {
                    break;
                }
                self.clock.delay_micros(wait);
            }
            let now = self.clock.now_micros();
            self.engine.with(|i, _| {
                slinitpos = i.scan.line_now(now);
                em_anchor = now;
                i.timing.slinitpos = slinitpos;
                let tfs = now + u64::from(i.scan.micros_to_reach(0, now));
                i.timing.last_delta = libm::round(
                    (tfs - i.timing.timeframestart) as f64 / f64::from(period),
                ) as u32;
                i.timing.timeframestart = tfs;
            });
        }

        self.link.begin(LinkSpeed::Write);
        self.link.command(cmd::CASET);
        self.link.data16(u16::from(run0.x));
        self.link.data16(TFT_WIDTH as u16);
        self.link.command(cmd::PASET);
        self.link.data16(run0.y);
        self.link.data16(TFT_HEIGHT as u16);
        let mut prev_x = run0.x;
        let mut prev_y = run0.y;
        let mut pixels: u32 = 0;
        let mut transactions: u32 = 0;
        loop {
            let now = self.clock.now_micros();
            let asl = if vsync > 0 && period > 0 {
                self.engine
                    .with(|i, _| slinitpos + i.scan.scanlines_during(now - em_anchor))
            } else {
                u32::MAX
            };
            match dummy.read(&mut cursor, asl) {
                DiffRead::End => break,
                DiffRead::Deferred { line, .. } => {
                    let wait = self
                        .engine
                        .with(|i, _| i.scan.time_for_scanlines(line - asl + 1))
                        .max(MIN_WAIT_MICROS);
                    self.clock.delay_micros(wait);
                }
                DiffRead::Ready(run) => {
                    if run.x != prev_x {
                        self.link.command(cmd::CASET);
                        self.link.data16(run.x);
                        prev_x = run.x;
                    }
                    if run.y != prev_y {
                        self.link.command(cmd::PASET);
                        self.link.data16(run.y);
                        prev_y = run.y;
                    }
                    self.link.command(cmd::RAMWR);
                    transactions += 1;
                    let mut src = ScanCursor::new(rotation, u32::from(run.x), u32::from(run.y));
                    for _ in 0..run.len {
                        self.link.pixel(fb[src.take()]);
                    }
                    pixels += run.len;
                    if vsync > 0 && period > 0 {
                        let now = self.clock.now_micros();
                        let last_row = (u32::from(run.y) * TFT_WIDTH
                            + u32::from(run.x)
                            + run.len)
                            / TFT_WIDTH;
                        let beam = self.engine.with(|i, _| {
                            i64::from(slinitpos)
                                + i64::from(i.scan.scanlines_during(now - em_anchor))
                        });
                        let m = (i64::from(line_of_row(last_row) + NB_SCANLINES) - beam) as i32;
                        if m < margin {
                            margin = m;
                        }
                    }
                }
            }
        }
        self.link.command(cmd::NOP);
        self.link.end();
        let now = self.clock.now_micros();
        self.engine.with(|i, _| {
            i.timing.margin = margin;
            let vs = (vsync > 0).then_some((margin, i.timing.last_delta));
            i.stats.end_frame(pixels, transactions, (now - start) as u32, vs);
        });
    }

    /// Blocking upload of one rectangle, pixels taken straight from the
    /// caller's sub-framebuffer.
    fn upload_rect_now(&mut self, sub: &[u16], rect: Rect, stride: u32) {
        let b = rotation_box(self.rotation, rect);
        if b.xmax < b.xmin || b.ymax < b.ymin {
            return;
        }
        self.wait_update_complete();
        let start = self.clock.now_micros();

        self.link.begin(LinkSpeed::Write);
        self.link.command(cmd::CASET);
        self.link.data16(b.xmin as u16);
        self.link.data16(b.xmax as u16);
        self.link.command(cmd::PASET);
        self.link.data16(b.ymin as u16);
        self.link.data16(b.ymax as u16);
        self.link.command(cmd::RAMWR);

        let stride = stride as i32;
        let (x1, x2, y1, y2) = (b.xmin as i32, b.xmax as i32, b.ymin as i32, b.ymax as i32);
        let delta: i32 = match self.rotation {
            Rotation::Portrait => 1,
            Rotation::Landscape => -stride,
            Rotation::PortraitFlipped => -1,
            Rotation::LandscapeFlipped => stride,
        };
        for yc in y1..=y2 {
            let mut m: i32 = match self.rotation {
                Rotation::Portrait => stride * (yc - y1),
                Rotation::Landscape => (yc - y1) + stride * (x2 - x1),
                Rotation::PortraitFlipped => stride * (y2 - yc) + (x2 - x1),
                Rotation::LandscapeFlipped => y2 - yc,
            };
            for _ in x1..=x2 {
                self.link.pixel(sub[m as usize]);
                m += delta;
            }
        }
        self.link.command(cmd::NOP);
        self.link.end();

        let now = self.clock.now_micros();
        let pixels = b.width() * b.height();
        self.engine.with(|i, _| {
            i.stats.end_frame(pixels, 1, (now - start) as u32, None);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::mocks::{CollectingPipe, LinkOp, ManualClock, RecordingLink, RecordingTimer};

    type Engine = UpdateEngine<CollectingPipe, RecordingTimer, ManualClock>;
    type Driver = Ili9488<RecordingLink, CollectingPipe, RecordingTimer, ManualClock>;

    fn driver_with_link(link: RecordingLink) -> (Driver, ManualClock) {
        let clock = ManualClock::new();
        let engine: &'static Engine = Box::leak(Box::new(UpdateEngine::new(
            CollectingPipe::default(),
            RecordingTimer::default(),
            clock.clone(),
        )));
        (Ili9488::new(link, clock.clone(), engine), clock)
    }

    fn good_status_link() -> RecordingLink {
        let mut link = RecordingLink::new();
        link.read8_script.extend([
            Some(cmd::STATUS_POWER_MODE),
            Some(cmd::STATUS_PIXEL_FORMAT),
            Some(cmd::STATUS_IMAGE_FORMAT),
            Some(cmd::STATUS_SELFDIAG_OK),
        ]);
        // scanline crossings for the refresh-period measurement
        for _ in 0..40 {
            link.scanline_script.push_back(Some(0));
            link.scanline_script.push_back(Some(100));
        }
        link.scanline = 100;
        link
    }

    #[test]
    fn begin_verifies_status_and_measures_the_period() {
        let (mut tft, _clock) = driver_with_link(good_status_link());
        assert!(tft.begin().is_ok());
        assert!(tft.refresh_rate() > 0.0);
        // init table was executed: gamma command went out
        let sent_gamma = tft.link.command_count(0xE0) == 1;
        assert!(sent_gamma);
        assert_eq!(tft.link.command_count(cmd::SLPOUT), 1);
        assert_eq!(tft.link.command_count(cmd::DISPON), 1);
    }

    #[test]
    fn begin_retries_with_halved_read_clock_on_dead_reads() {
        let mut link = RecordingLink::new();
        link.read8_script.extend(std::iter::repeat(Some(0)).take(12));
        let (mut tft, _clock) = driver_with_link(link);
        assert_eq!(tft.begin(), Err(BeginError::DeadRead));
        assert_eq!(
            tft.link
                .ops
                .iter()
                .filter(|op| matches!(op, LinkOp::HalveReadClock))
                .count(),
            INIT_RETRIES - 1
        );
    }

    #[test]
    fn begin_reports_bad_status_and_refuses_updates() {
        let mut link = RecordingLink::new();
        for _ in 0..INIT_RETRIES {
            link.read8_script.extend([
                Some(cmd::STATUS_POWER_MODE),
                Some(0x06),
                Some(cmd::STATUS_IMAGE_FORMAT),
                Some(cmd::STATUS_SELFDIAG_OK),
            ]);
        }
        let (mut tft, _clock) = driver_with_link(link);
        match tft.begin() {
            Err(BeginError::BadStatus { pixel_format, .. }) => assert_eq!(pixel_format, 0x06),
            other => panic!("expected BadStatus, got {other:?}"),
        }
        // updates are refused: nothing further reaches the link
        let before = tft.link.ops.len();
        let fb = Box::leak(Box::new(Framebuffer::new()));
        tft.update(fb, false);
        assert_eq!(tft.link.ops.len(), before);
    }

    #[test]
    fn scroll_offset_wraps_into_panel_height() {
        let (mut tft, _clock) = driver_with_link(RecordingLink::new());
        tft.set_scroll(-10);
        tft.set_scroll(485);
        let args: Vec<u16> = tft
            .link
            .ops
            .iter()
            .filter_map(|op| match op {
                LinkOp::Data16(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(args, vec![470, 5]);
    }

    #[test]
    fn buffering_mode_follows_bound_framebuffers() {
        let (mut tft, _clock) = driver_with_link(RecordingLink::new());
        assert_eq!(tft.buffering_mode(), BufferingMode::NoBuffer);
        let fb1 = Box::leak(Box::new(Framebuffer::new()));
        tft.bind_framebuffers(Some(fb1), None);
        assert_eq!(tft.buffering_mode(), BufferingMode::Double);
        let fb1b = Box::leak(Box::new(Framebuffer::new()));
        let fb2 = Box::leak(Box::new(Framebuffer::new()));
        tft.bind_framebuffers(Some(fb1b), Some(fb2));
        assert_eq!(tft.buffering_mode(), BufferingMode::Triple);
        // binding only the second slot promotes it
        let fb_only = Box::leak(Box::new(Framebuffer::new()));
        tft.bind_framebuffers(None, Some(fb_only));
        assert_eq!(tft.buffering_mode(), BufferingMode::Double);
    }

    #[test]
    fn parameters_are_clamped() {
        let (mut tft, _clock) = driver_with_link(RecordingLink::new());
        tft.set_vsync_spacing(120);
        assert_eq!(tft.vsync_spacing(), MAX_VSYNC_SPACING);
        tft.set_vsync_spacing(-5);
        assert_eq!(tft.vsync_spacing(), -1);
        tft.set_late_start_ratio(7.0);
        assert!((tft.late_start_ratio() - 1.0).abs() < f32::EPSILON);
        tft.set_diff_gap(0);
        assert_eq!(tft.diff_gap(), 1);
    }
}
