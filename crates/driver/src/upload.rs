//! The upload pipeline.
//!
//! One [`UpdateEngine`] per serial peripheral holds everything both
//! execution contexts touch: the DMA pipe, the diff replay position, the
//! buffer table of the buffering policy, and the vsync ledger. The caller
//! borrows it through short interrupt-masked critical sections; the DMA
//! completion and timer interrupts resume the sequencer through
//! [`on_pipe_interrupt`](UpdateEngine::on_pipe_interrupt) /
//! [`on_timer_interrupt`](UpdateEngine::on_timer_interrupt), usually
//! routed via the [`isr`](crate::isr) slot table.
//!
//! The sequencer is a plain enum-tagged state machine:
//!
//! ```text
//! Idle -> WaitFrameStart -> WaitStartLine -> Streaming <-> WaitScanline
//!                                               |
//!                                             Idle (finalize, callback)
//! ```
//!
//! `WaitFrameStart` paces frames to `vsync_spacing` refreshes,
//! `WaitStartLine` holds until the beam passes the first run's scanline
//! (late-start window permitting), `Streaming` feeds staged pixel chunks
//! to the pipe, and `WaitScanline` parks whenever the next run is still
//! ahead of the beam.

use core::cell::RefCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use platform::{rgb565_to_rgb666, IntervalTimer, PixelPipe, TimeSource};

use crate::clock::ScanlineClock;
use crate::commands;
use crate::diff::{DiffBuffer, DiffCursor, DiffRead, DummyDiff};
use crate::framebuffer::Framebuffer;
use crate::rotation::{Rotation, ScanCursor};
use crate::stats::{FrameStats, FrameTiming};
use crate::{line_of_row, MAX_VSYNC_SPACING, NB_SCANLINES, TFT_HEIGHT, TFT_WIDTH};

/// Pixels staged per DMA transfer. Runs longer than this (the dummy
/// full-frame write, merged runs) stream as successive chunks, each
/// completing through the same interrupt.
pub const CHUNK_PIXELS: usize = 512;

/// Shortest scanline wait worth arming the timer for.
pub(crate) const MIN_WAIT_MICROS: u32 = 15;

/// Which framebuffer byte-for-byte matches the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mirror {
    /// Unknown; the next update redraws everything.
    None,
    Fb1,
    Fb2,
}

/// Completion action installed by the triple-buffering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Swap {
    /// Nothing pending.
    None,
    /// A real diff is staged in `diff2`/`fb2`: swap and relaunch.
    Diffed,
    /// A full redraw is staged in `fb2`: swap dummies and relaunch.
    Dummy,
}

/// Diff stream handed to the pipeline.
///
/// Raw pointers rather than borrows: the stream is read from interrupt
/// context while the caller-side policy keeps ownership. The policy
/// guarantees the pointee is never written while an upload is in flight.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DiffHandle {
    Buffer(NonNull<DiffBuffer<'static>>),
    /// Dummy diffs are tiny; the handle carries a copy by value.
    Dummy(DummyDiff),
}

impl DiffHandle {
    /// # Safety
    ///
    /// A `Buffer` pointee must be alive and not concurrently mutated.
    unsafe fn read(&self, cursor: &mut DiffCursor, allowed_line: u32) -> DiffRead {
        match self {
            Self::Buffer(p) => unsafe { p.as_ref() }.read(cursor, allowed_line),
            Self::Dummy(d) => d.read(cursor, allowed_line),
        }
    }
}

/// Sequencer state, advanced from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeqState {
    Idle,
    WaitFrameStart,
    WaitStartLine,
    Streaming,
    WaitScanline,
}

/// Everything shared between caller context and the interrupts.
pub(crate) struct Inner<P: PixelPipe, T: IntervalTimer, C: TimeSource> {
    pub(crate) pipe: P,
    pub(crate) timer: T,
    pub(crate) clock: C,
    pub(crate) scan: ScanlineClock,

    // buffer table (embedder-provided 'static allocations)
    pub(crate) fb1: Option<NonNull<Framebuffer>>,
    pub(crate) fb2: Option<NonNull<Framebuffer>>,
    pub(crate) diff1: Option<NonNull<DiffBuffer<'static>>>,
    pub(crate) diff2: Option<NonNull<DiffBuffer<'static>>>,
    pub(crate) dummy1: DummyDiff,
    pub(crate) dummy2: DummyDiff,
    pub(crate) mirror: Mirror,
    pub(crate) fb2_full: bool,
    pub(crate) ongoing_diff: bool,
    pub(crate) swap_on_complete: Swap,

    // scheduling parameters
    pub(crate) vsync_spacing: i8,
    pub(crate) late_start_ratio: f32,
    pub(crate) late_start_override: bool,

    // in-flight stream
    state: SeqState,
    src_fb: *const u16,
    src_diff: Option<DiffHandle>,
    rotation: Rotation,
    cursor: DiffCursor,
    gather: ScanCursor,
    run_remaining: u32,
    prev_x: u16,
    prev_y: u16,
    last_row: u32,
    stage: [u8; CHUNK_PIXELS * 3],

    // frame ledger
    pub(crate) timing: FrameTiming,
    pub(crate) em_anchor: u64,
    frame_pixels: u32,
    frame_transactions: u32,
    upload_start: u64,
    pub(crate) stats: FrameStats,
}

// SAFETY: the raw pointers refer to embedder-provided 'static allocations
// and are only dereferenced under the engine's critical section on a
// single core; the buffering policy keeps pipeline-owned buffers
// untouched until completion.
unsafe impl<P, T, C> Send for Inner<P, T, C>
where
    P: PixelPipe + Send,
    T: IntervalTimer + Send,
    C: TimeSource + Send,
{
}

impl<P: PixelPipe, T: IntervalTimer, C: TimeSource> Inner<P, T, C> {
    fn new(pipe: P, timer: T, clock: C) -> Self {
        Self {
            pipe,
            timer,
            clock,
            scan: ScanlineClock::new(),
            fb1: None,
            fb2: None,
            diff1: None,
            diff2: None,
            dummy1: DummyDiff::new(),
            dummy2: DummyDiff::new(),
            mirror: Mirror::None,
            fb2_full: false,
            ongoing_diff: false,
            swap_on_complete: Swap::None,
            vsync_spacing: 2,
            late_start_ratio: 0.3,
            late_start_override: true,
            state: SeqState::Idle,
            src_fb: core::ptr::null(),
            src_diff: None,
            rotation: Rotation::Portrait,
            cursor: DiffCursor::default(),
            gather: ScanCursor::new(Rotation::Portrait, 0, 0),
            run_remaining: 0,
            prev_x: 0,
            prev_y: 0,
            last_row: 0,
            stage: [0; CHUNK_PIXELS * 3],
            timing: FrameTiming::default(),
            em_anchor: 0,
            frame_pixels: 0,
            frame_transactions: 0,
            upload_start: 0,
            stats: FrameStats::new(),
        }
    }

    pub(crate) fn swap_diffs(&mut self) {
        core::mem::swap(&mut self.diff1, &mut self.diff2);
    }

    pub(crate) fn swap_framebuffers(&mut self) {
        core::mem::swap(&mut self.fb1, &mut self.fb2);
    }

    pub(crate) fn swap_dummies(&mut self) {
        core::mem::swap(&mut self.dummy1, &mut self.dummy2);
    }

    /// Line the write cursor is allowed to emit up to right now.
    fn allowed_line(&self, now: u64) -> u32 {
        if self.vsync_spacing > 0 {
            self.timing.slinitpos + self.scan.scanlines_during(now - self.em_anchor)
        } else {
            u32::MAX
        }
    }

    fn update_margin(&mut self, now: u64) {
        let beam = i64::from(self.timing.slinitpos)
            + i64::from(self.scan.scanlines_during(now - self.em_anchor));
        let writer = i64::from(line_of_row(self.last_row)) + i64::from(NB_SCANLINES);
        let m = (writer - beam) as i32;
        if m < self.timing.margin {
            self.timing.margin = m;
        }
    }

    /// Advance the vsync ledger for a frame that uploaded nothing: the
    /// next frame is paced either off the upcoming line-0 crossing or off
    /// the previous frame, whichever the spacing rules pick.
    pub(crate) fn note_empty_frame(&mut self, now: u64) {
        if self.vsync_spacing <= 0 || self.scan.period() == 0 {
            return;
        }
        let period = u64::from(self.scan.period());
        let t1 = now + u64::from(self.scan.micros_to_reach(0, now));
        let mut t2 = self.timing.timeframestart + self.vsync_spacing as u64 * period;
        if t1.abs_diff(t2) < period / 3 {
            t2 = t1; // same frame
        }
        let mut tfs = if self.late_start_override
            || t1 > t2
            || t2.saturating_sub(t1) > (MAX_VSYNC_SPACING as u64 + 1) * period
        {
            t1
        } else {
            t2
        };
        if tfs < self.timing.timeframestart {
            tfs = t2;
        }
        self.late_start_override = false;
        self.timing.last_delta =
            libm::round((tfs - self.timing.timeframestart) as f64 / period as f64) as u32;
        self.timing.timeframestart = tfs;
    }

    /// Start an asynchronous upload. The engine must be idle; the caller
    /// holds the critical section.
    ///
    /// `fb` and `diff` become pipeline-owned until the completion
    /// interrupt finishes the frame.
    pub(crate) fn launch(
        &mut self,
        active: &AtomicBool,
        fb: NonNull<Framebuffer>,
        rotation: Rotation,
        diff: DiffHandle,
    ) {
        let now = self.clock.now_micros();
        active.store(true, Ordering::Release);
        self.upload_start = now;
        self.frame_pixels = 0;
        self.frame_transactions = 0;
        self.timing.margin = NB_SCANLINES as i32;
        self.src_fb = fb.as_ptr().cast::<u16>().cast_const();
        self.src_diff = Some(diff);
        self.rotation = rotation;
        self.cursor = DiffCursor::default();

        // SAFETY: diff is an embedder-provided 'static allocation the
        // policy keeps stable for the whole upload.
        let first = unsafe { diff.read(&mut self.cursor, 0) };
        let run = match first {
            DiffRead::End => {
                self.note_empty_frame(now);
                self.end_frame(now, active);
                return;
            }
            DiffRead::Ready(run) => {
                // keep the stream positioned at the first run; it is
                // re-read once streaming begins
                self.cursor.push_back(run);
                run
            }
            DiffRead::Deferred { run, .. } => run,
        };

        self.timing.slinitpos = line_of_row(u32::from(run.y));
        self.prev_x = run.x;
        self.prev_y = run.y;

        // Full address window now; later runs only move the start.
        self.pipe.begin();
        self.pipe.command(commands::CASET);
        self.pipe.data16(run.x);
        self.pipe.data16(TFT_WIDTH as u16);
        self.pipe.command(commands::PASET);
        self.pipe.data16(run.y);
        self.pipe.data16(TFT_HEIGHT as u16);

        self.state = SeqState::WaitFrameStart;
        let delay = if self.vsync_spacing > 0 && self.scan.period() > 0 {
            // previous frame must stay up (spacing - 1) more refreshes
            let target = self.timing.timeframestart
                + (self.vsync_spacing as u64 - 1) * u64::from(self.scan.period());
            target.saturating_sub(now).min(u64::from(u32::MAX)) as u32
        } else {
            0
        };
        self.timer.arm_micros(delay.max(1));
    }

    pub(crate) fn timer_event(&mut self, active: &AtomicBool) {
        match self.state {
            SeqState::WaitFrameStart => self.frame_start_event(),
            SeqState::WaitStartLine => self.start_line_event(active),
            SeqState::WaitScanline => self.advance_stream(active),
            SeqState::Idle | SeqState::Streaming => {}
        }
    }

    pub(crate) fn pipe_event(&mut self, active: &AtomicBool) {
        if self.state != SeqState::Streaming {
            return;
        }
        let now = self.clock.now_micros();
        if self.vsync_spacing > 0 {
            self.update_margin(now);
        }
        if self.run_remaining > 0 {
            self.submit_chunk();
            return;
        }
        self.advance_stream(active);
    }

    /// We are at (or past) the pacing deadline, nominally around line 0.
    /// Decide how long to hold for the first run's scanline.
    fn frame_start_event(&mut self) {
        self.state = SeqState::WaitStartLine;
        if self.vsync_spacing <= 0 {
            self.timer.arm_micros(1);
            return;
        }
        let now = self.clock.now_micros();
        let sc1 = self.timing.slinitpos;
        let late_span = ((NB_SCANLINES - 1 - sc1) as f32 * self.late_start_ratio) as u32;
        let sc2 = sc1 + late_span;
        let t2 = self.scan.micros_to_reach(sc2, now);
        let mut t = self.scan.micros_to_reach(sc1, now);
        if self.late_start_override {
            self.late_start_override = false;
        } else if t2 < t {
            t = 0; // past the late window: start immediately, may tear
        }
        self.timer.arm_micros(t.max(1));
    }

    /// The beam should be just past the first run's scanline. Re-anchor
    /// the frame ledger and start streaming.
    fn start_line_event(&mut self, active: &AtomicBool) {
        let now = self.clock.now_micros();
        if self.vsync_spacing > 0 {
            let wait = self
                .scan
                .micros_to_exit_range(0, self.timing.slinitpos, now);
            if wait > 0 {
                // timer undershot; hold for the remainder
                self.timer.arm_micros(wait);
                return;
            }
            self.timing.slinitpos = self.scan.line_now(now);
            self.em_anchor = now;
            let tfs = now + u64::from(self.scan.micros_to_reach(0, now));
            let period = u64::from(self.scan.period());
            if period > 0 {
                self.timing.last_delta =
                    libm::round((tfs - self.timing.timeframestart) as f64 / period as f64) as u32;
            }
            self.timing.timeframestart = tfs;
        } else {
            self.em_anchor = now;
        }
        self.advance_stream(active);
    }

    fn advance_stream(&mut self, active: &AtomicBool) {
        let Some(diff) = self.src_diff else {
            self.state = SeqState::Idle;
            active.store(false, Ordering::Release);
            return;
        };
        let now = self.clock.now_micros();
        let asl = self.allowed_line(now);
        // SAFETY: pipeline-owned diff, see launch().
        match unsafe { diff.read(&mut self.cursor, asl) } {
            DiffRead::End => {
                self.pipe.finish();
                self.end_frame(now, active);
            }
            DiffRead::Deferred { line, .. } => {
                let t = self
                    .scan
                    .time_for_scanlines(line - asl + 1)
                    .max(MIN_WAIT_MICROS);
                self.state = SeqState::WaitScanline;
                self.timer.arm_micros(t);
            }
            DiffRead::Ready(run) => {
                if run.x != self.prev_x {
                    self.pipe.command(commands::CASET);
                    self.pipe.data16(run.x);
                    self.prev_x = run.x;
                }
                if run.y != self.prev_y {
                    self.pipe.command(commands::PASET);
                    self.pipe.data16(run.y);
                    self.prev_y = run.y;
                }
                self.pipe.command(commands::RAMWR);
                self.frame_transactions += 1;
                self.last_row =
                    (u32::from(run.y) * TFT_WIDTH + u32::from(run.x) + run.len) / TFT_WIDTH;
                self.gather = ScanCursor::new(self.rotation, u32::from(run.x), u32::from(run.y));
                self.run_remaining = run.len;
                self.state = SeqState::Streaming;
                self.submit_chunk();
            }
        }
    }

    fn submit_chunk(&mut self) {
        let n = (self.run_remaining as usize).min(CHUNK_PIXELS);
        for i in 0..n {
            let idx = self.gather.take();
            // SAFETY: the policy keeps the source framebuffer alive and
            // unwritten while the pipeline owns it.
            let color = unsafe { *self.src_fb.add(idx) };
            let [r, g, b] = rgb565_to_rgb666(color);
            self.stage[3 * i] = r;
            self.stage[3 * i + 1] = g;
            self.stage[3 * i + 2] = b;
        }
        self.run_remaining -= n as u32;
        self.frame_pixels += n as u32;
        let bytes = self.stage.as_ptr();
        // SAFETY: the staging buffer sits inside the engine allocation
        // and is only refilled after this run's completion interrupt.
        unsafe { self.pipe.start_run(bytes, 3 * n) };
    }

    fn end_frame(&mut self, now: u64, active: &AtomicBool) {
        let vsync = if self.vsync_spacing > 0 {
            Some((self.timing.margin, self.timing.last_delta))
        } else {
            None
        };
        self.stats.end_frame(
            self.frame_pixels,
            self.frame_transactions,
            now.saturating_sub(self.upload_start) as u32,
            vsync,
        );
        if self.timing.margin < 0 {
            warning!("frame teared: margin {}", self.timing.margin);
        }
        self.state = SeqState::Idle;
        self.src_diff = None;
        active.store(false, Ordering::Release);

        match core::mem::replace(&mut self.swap_on_complete, Swap::None) {
            Swap::None => {}
            Swap::Diffed => {
                self.swap_diffs();
                self.swap_framebuffers();
                self.mirror = Mirror::Fb1;
                self.fb2_full = false;
                self.ongoing_diff = false;
                if let (Some(fb), Some(diff)) = (self.fb1, self.diff1) {
                    let rotation = self.rotation;
                    self.launch(active, fb, rotation, DiffHandle::Buffer(diff));
                }
            }
            Swap::Dummy => {
                self.swap_dummies();
                self.swap_framebuffers();
                self.mirror = Mirror::Fb1;
                self.fb2_full = false;
                self.ongoing_diff = false;
                if let Some(fb) = self.fb1 {
                    let rotation = self.rotation;
                    let dummy = self.dummy1;
                    self.launch(active, fb, rotation, DiffHandle::Dummy(dummy));
                }
            }
        }
    }
}

/// Shared upload engine: one per serial peripheral, placed in a static by
/// the embedder (`static_cell::StaticCell` on hardware, a leaked box in
/// tests).
pub struct UpdateEngine<P: PixelPipe, T: IntervalTimer, C: TimeSource> {
    inner: Mutex<RefCell<Inner<P, T, C>>>,
    active: AtomicBool,
}

impl<P: PixelPipe, T: IntervalTimer, C: TimeSource> UpdateEngine<P, T, C> {
    /// Build an engine around the hardware resources of one peripheral.
    pub fn new(pipe: P, timer: T, clock: C) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner::new(pipe, timer, clock))),
            active: AtomicBool::new(false),
        }
    }

    /// Whether an asynchronous upload is in flight.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run `f` inside the engine's critical section.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Inner<P, T, C>, &AtomicBool) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs), &self.active))
    }

    /// DMA completion interrupt entry point.
    pub fn on_pipe_interrupt(&self) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).pipe_event(&self.active);
        });
    }

    /// One-shot timer interrupt entry point.
    pub fn on_timer_interrupt(&self) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).timer_event(&self.active);
        });
    }
}
