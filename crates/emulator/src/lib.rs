//! A virtual ILI9488 panel.
//!
//! Implements the `platform` traits against a simulated panel: the
//! command stream is interpreted into a 320x480 RGB666 GRAM with the
//! controller's cursor-wrap semantics, a virtual clock advances with
//! every bus transaction, and the refresh beam runs off the frame-rate
//! register exactly as the scheduler expects. DMA completions and timer
//! deadlines become events delivered through a registered interrupt
//! hook whenever the driver busy-waits, which is how the interrupt-driven
//! upload engine runs to completion on a desktop.
//!
//! ```rust,ignore
//! let parts = Emulator::new(EmulatorConfig::default());
//! let engine = Box::leak(Box::new(UpdateEngine::new(parts.pipe, parts.timer, parts.clock.clone())));
//! parts.panel.install_engine_hook(engine);
//! let mut tft = Ili9488::new(parts.link, parts.clock, engine);
//! tft.begin().unwrap();
//! ```

#![warn(clippy::all)]

use std::cell::RefCell;
use std::rc::Rc;

use ili9488_vsync::{Rotation, UpdateEngine, NB_SCANLINES, TFT_HEIGHT, TFT_WIDTH};
use platform::{rgb565_to_rgb666, IntervalTimer, LinkSpeed, PanelLink, PixelPipe, TimeSource};

const NB_PIXELS: usize = (TFT_WIDTH as usize) * (TFT_HEIGHT as usize);

/// Which interrupt an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    /// DMA run completion.
    Dma,
    /// One-shot timer expiry.
    Timer,
}

/// Simulation timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct EmulatorConfig {
    /// Nanoseconds per byte on the full-speed write clock.
    pub write_byte_nanos: u64,
    /// Nanoseconds per byte on the bring-up (quarter speed) clock.
    pub setup_byte_nanos: u64,
    /// Nanoseconds per byte on the read clock (doubled by each halving).
    pub read_byte_nanos: u64,
    /// Refresh period of frame-rate mode 0, microseconds.
    pub mode0_period_micros: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            // fast enough that a full frame fits inside one refresh
            write_byte_nanos: 30,
            setup_byte_nanos: 250,
            read_byte_nanos: 1_000,
            mode0_period_micros: 16_600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Args(u8, [u8; 4], usize),
    Pixels,
}

struct Core {
    cfg: EmulatorConfig,
    now_ns: u64,
    read_byte_nanos: u64,
    speed: LinkSpeed,

    // panel state
    gram: Vec<[u8; 3]>,
    col_window: (u16, u16),
    row_window: (u16, u16),
    cursor: (u16, u16),
    pending: Pending,
    sleeping: bool,
    display_on: bool,
    inverted: bool,
    scroll: u16,
    reset_done: bool,
    period_ns: u64,
    epoch_ns: u64,

    // accounting
    ramwr_count: u32,
    pixels_written: u64,
    windows: Vec<(u8, u16, u16)>,
    runs: Vec<u32>,

    // interrupts
    pipe_claimed: bool,
    pipe_done_at: Option<u64>,
    timer_at: Option<u64>,
    hook: Option<Rc<dyn Fn(IrqKind)>>,

    // fault injection
    dead_miso: bool,
    self_diag: u8,
    reads_need_halvings: u32,
    halvings: u32,
}

impl Core {
    fn new(cfg: EmulatorConfig) -> Self {
        Self {
            cfg,
            now_ns: 0,
            read_byte_nanos: cfg.read_byte_nanos,
            speed: LinkSpeed::Setup,
            gram: vec![[0, 0, 0]; NB_PIXELS],
            col_window: (0, (TFT_WIDTH - 1) as u16),
            row_window: (0, (TFT_HEIGHT - 1) as u16),
            cursor: (0, 0),
            pending: Pending::None,
            sleeping: true,
            display_on: false,
            inverted: false,
            scroll: 0,
            reset_done: false,
            period_ns: cfg.mode0_period_micros * 1_000,
            epoch_ns: 0,
            ramwr_count: 0,
            pixels_written: 0,
            windows: Vec::new(),
            runs: Vec::new(),
            pipe_claimed: false,
            pipe_done_at: None,
            timer_at: None,
            hook: None,
            dead_miso: false,
            self_diag: 0xC0,
            reads_need_halvings: 0,
            halvings: 0,
        }
    }

    fn byte_cost(&self) -> u64 {
        match self.speed {
            LinkSpeed::Write => self.cfg.write_byte_nanos,
            LinkSpeed::Setup => self.cfg.setup_byte_nanos,
            LinkSpeed::Read => self.read_byte_nanos,
        }
    }

    fn line_now(&self) -> u32 {
        if self.period_ns == 0 {
            return 0;
        }
        let phase = (self.now_ns.wrapping_sub(self.epoch_ns)) % self.period_ns;
        ((phase * u64::from(NB_SCANLINES)) / self.period_ns) as u32
    }

    fn flush_pending(&mut self) {
        match self.pending {
            Pending::None | Pending::Pixels => {}
            Pending::Args(cmd, args, n) => self.apply(cmd, &args[..n]),
        }
        self.pending = Pending::None;
    }

    fn apply(&mut self, cmd: u8, args: &[u8]) {
        let arg16 = |at: usize| -> u16 {
            (u16::from(args[at]) << 8) | u16::from(args[at + 1])
        };
        match cmd {
            // CASET / PASET latch the start with two parameter bytes; the
            // end only with all four. The driver leans on this to move
            // just the start between runs.
            0x2A => {
                if args.len() >= 2 {
                    self.col_window.0 = arg16(0).min((TFT_WIDTH - 1) as u16);
                }
                if args.len() >= 4 {
                    self.col_window.1 = arg16(2).min((TFT_WIDTH - 1) as u16);
                }
                self.windows.push((cmd, self.col_window.0, self.col_window.1));
            }
            0x2B => {
                if args.len() >= 2 {
                    self.row_window.0 = arg16(0).min((TFT_HEIGHT - 1) as u16);
                }
                if args.len() >= 4 {
                    self.row_window.1 = arg16(2).min((TFT_HEIGHT - 1) as u16);
                }
                self.windows.push((cmd, self.row_window.0, self.row_window.1));
            }
            0xB1 => {
                if args.len() >= 2 {
                    let diva = u64::from(args[0] & 0x03);
                    let rtna = u64::from(args[1].saturating_sub(0x10)).min(15);
                    self.period_ns = self.cfg.mode0_period_micros * 1_000 * (16 + rtna) / 16
                        * (1 << diva);
                    self.epoch_ns = self.now_ns;
                }
            }
            0x37 => {
                if args.len() >= 2 {
                    self.scroll = arg16(0) % (TFT_HEIGHT as u16);
                }
            }
            _ => {}
        }
    }

    fn command(&mut self, cmd: u8) {
        self.flush_pending();
        match cmd {
            0x01 => {
                // software reset: defaults, sleep in
                self.reset_done = true;
                self.sleeping = true;
                self.display_on = false;
                self.inverted = false;
                self.scroll = 0;
                self.col_window = (0, (TFT_WIDTH - 1) as u16);
                self.row_window = (0, (TFT_HEIGHT - 1) as u16);
                self.period_ns = self.cfg.mode0_period_micros * 1_000;
                self.epoch_ns = self.now_ns;
            }
            0x10 => self.sleeping = true,
            0x11 => self.sleeping = false,
            0x20 => self.inverted = false,
            0x21 => self.inverted = true,
            0x28 => self.display_on = false,
            0x29 => self.display_on = true,
            0x2C => {
                self.cursor = (self.col_window.0, self.row_window.0);
                self.ramwr_count += 1;
                self.runs.push(0);
                self.pending = Pending::Pixels;
            }
            0x2A | 0x2B | 0xB1 | 0x37 => {
                self.pending = Pending::Args(cmd, [0; 4], 0);
            }
            _ => {}
        }
    }

    fn data(&mut self, byte: u8) {
        let Pending::Args(cmd, mut args, mut n) = self.pending else {
            return;
        };
        if n < 4 {
            args[n] = byte;
            n += 1;
        }
        self.pending = Pending::Args(cmd, args, n);
        match cmd {
            // CASET/PASET latch the start as soon as it is complete and
            // stay open for the (optional) end coordinate
            0x2A | 0x2B => {
                if n == 2 || n == 4 {
                    self.apply(cmd, &args[..n]);
                }
                if n == 4 {
                    self.pending = Pending::None;
                }
            }
            _ => {
                if n == 2 {
                    self.apply(cmd, &args[..n]);
                    self.pending = Pending::None;
                }
            }
        }
    }

    fn pixel(&mut self, rgb: [u8; 3]) {
        if self.pending != Pending::Pixels {
            return; // pixels outside RAMWR are dropped
        }
        let (x, y) = self.cursor;
        self.gram[usize::from(y) * TFT_WIDTH as usize + usize::from(x)] = rgb;
        self.pixels_written += 1;
        if let Some(last) = self.runs.last_mut() {
            *last += 1;
        }
        // advance inside the window, wrapping column-first
        if x >= self.col_window.1 {
            self.cursor.0 = self.col_window.0;
            self.cursor.1 = if y >= self.row_window.1 {
                self.row_window.0
            } else {
                y + 1
            };
        } else {
            self.cursor.0 = x + 1;
        }
    }

    fn status(&self, cmd: u8) -> u8 {
        if self.dead_miso || self.halvings < self.reads_need_halvings {
            return 0;
        }
        if !self.reset_done || self.sleeping || !self.display_on {
            return 0;
        }
        match cmd {
            0x0A => 0x9C,
            0x0B => 0x48,
            0x0C => 0x05,
            0x0D => 0x00,
            0x0F => self.self_diag,
            _ => 0,
        }
    }

    fn next_event(&self) -> Option<(u64, IrqKind)> {
        match (self.pipe_done_at, self.timer_at) {
            (Some(p), Some(t)) if p <= t => Some((p, IrqKind::Dma)),
            (Some(_), Some(t)) => Some((t, IrqKind::Timer)),
            (Some(p), None) => Some((p, IrqKind::Dma)),
            (None, Some(t)) => Some((t, IrqKind::Timer)),
            (None, None) => None,
        }
    }
}

type Shared = Rc<RefCell<Core>>;

/// Advance virtual time to `target_ns`, delivering due interrupt events
/// through the hook on the way.
fn advance_to(core: &Shared, target_ns: u64) {
    loop {
        let (due, hook) = {
            let mut c = core.borrow_mut();
            match c.next_event() {
                Some((at, kind)) if at <= target_ns => {
                    c.now_ns = at;
                    match kind {
                        IrqKind::Dma => c.pipe_done_at = None,
                        IrqKind::Timer => c.timer_at = None,
                    }
                    (Some(kind), c.hook.clone())
                }
                _ => {
                    c.now_ns = c.now_ns.max(target_ns);
                    (None, None)
                }
            }
        };
        match (due, hook) {
            (Some(kind), Some(hook)) => hook(kind),
            (Some(_), None) => {}
            (None, _) => return,
        }
    }
}

// ── platform trait implementations ──────────────────────────────────────────

/// Blocking link into the virtual panel.
pub struct EmuLink {
    core: Shared,
}

impl EmuLink {
    fn advance(&self, bytes: u64) {
        let mut c = self.core.borrow_mut();
        let cost = c.byte_cost() * bytes;
        c.now_ns += cost;
    }
}

impl PanelLink for EmuLink {
    fn begin(&mut self, speed: LinkSpeed) {
        self.core.borrow_mut().speed = speed;
    }

    fn end(&mut self) {
        self.core.borrow_mut().flush_pending();
    }

    fn command(&mut self, cmd: u8) {
        self.advance(1);
        self.core.borrow_mut().command(cmd);
    }

    fn data8(&mut self, value: u8) {
        self.advance(1);
        self.core.borrow_mut().data(value);
    }

    fn data16(&mut self, value: u16) {
        self.advance(2);
        let mut c = self.core.borrow_mut();
        let [hi, lo] = value.to_be_bytes();
        c.data(hi);
        c.data(lo);
    }

    fn pixel(&mut self, rgb565: u16) {
        self.advance(3);
        self.core.borrow_mut().pixel(rgb565_to_rgb666(rgb565));
    }

    fn read8(&mut self, cmd: u8) -> Option<u8> {
        self.advance(3);
        let c = self.core.borrow();
        Some(c.status(cmd))
    }

    fn read_scanline(&mut self) -> Option<u16> {
        self.advance(4);
        let c = self.core.borrow();
        Some(c.line_now() as u16)
    }

    fn halve_read_clock(&mut self) {
        let mut c = self.core.borrow_mut();
        c.read_byte_nanos *= 2;
        c.halvings += 1;
    }
}

/// DMA path into the virtual panel: payload bytes are interpreted on
/// submission; the completion event fires after the transfer time.
pub struct EmuPipe {
    core: Shared,
}

impl PixelPipe for EmuPipe {
    fn begin(&mut self) {
        let mut c = self.core.borrow_mut();
        assert!(!c.pipe_claimed, "pipe claimed twice");
        c.pipe_claimed = true;
        c.speed = LinkSpeed::Write;
    }

    fn command(&mut self, cmd: u8) {
        let mut c = self.core.borrow_mut();
        assert!(c.pipe_claimed, "pipe command outside begin/finish");
        c.command(cmd);
    }

    fn data16(&mut self, value: u16) {
        let mut c = self.core.borrow_mut();
        let [hi, lo] = value.to_be_bytes();
        c.data(hi);
        c.data(lo);
    }

    unsafe fn start_run(&mut self, bytes: *const u8, len: usize) {
        // SAFETY: the engine keeps the staging buffer valid until the
        // completion interrupt; we consume it synchronously here.
        let payload = unsafe { std::slice::from_raw_parts(bytes, len) };
        let mut c = self.core.borrow_mut();
        assert!(c.pipe_claimed, "pixel run outside begin/finish");
        assert!(c.pipe_done_at.is_none(), "pixel run while one is in flight");
        assert_eq!(len % 3, 0, "payload must be whole 18-bit pixels");
        for px in payload.chunks_exact(3) {
            c.pixel([px[0], px[1], px[2]]);
        }
        let cost = c.cfg.write_byte_nanos * len as u64;
        c.pipe_done_at = Some(c.now_ns + cost.max(1));
    }

    fn finish(&mut self) {
        let mut c = self.core.borrow_mut();
        c.pipe_claimed = false;
        c.flush_pending();
    }
}

/// One-shot timer delivering through the event queue.
pub struct EmuTimer {
    core: Shared,
}

impl IntervalTimer for EmuTimer {
    fn arm_micros(&mut self, micros: u32) {
        let mut c = self.core.borrow_mut();
        c.timer_at = Some(c.now_ns + u64::from(micros.max(1)) * 1_000);
    }

    fn cancel(&mut self) {
        self.core.borrow_mut().timer_at = None;
    }
}

/// Virtual microsecond clock; delays pump the event queue.
#[derive(Clone)]
pub struct EmuClock {
    core: Shared,
}

impl TimeSource for EmuClock {
    fn now_micros(&self) -> u64 {
        self.core.borrow().now_ns / 1_000
    }

    fn delay_micros(&self, micros: u32) {
        let target = self.core.borrow().now_ns + u64::from(micros) * 1_000;
        advance_to(&self.core, target);
    }
}

// ── inspection handle ───────────────────────────────────────────────────────

/// Test-side view of the virtual panel.
#[derive(Clone)]
pub struct PanelHandle {
    core: Shared,
}

impl PanelHandle {
    /// Register the interrupt hook that routes events into an engine.
    pub fn install_engine_hook<P, T, C>(&self, engine: &'static UpdateEngine<P, T, C>)
    where
        P: PixelPipe + 'static,
        T: IntervalTimer + 'static,
        C: TimeSource + 'static,
    {
        self.set_irq_hook(move |kind| match kind {
            IrqKind::Dma => engine.on_pipe_interrupt(),
            IrqKind::Timer => engine.on_timer_interrupt(),
        });
    }

    /// Register an arbitrary interrupt hook.
    pub fn set_irq_hook(&self, hook: impl Fn(IrqKind) + 'static) {
        self.core.borrow_mut().hook = Some(Rc::new(hook));
    }

    /// Panel memory, panel-ordered, 18-bit pixels.
    pub fn gram(&self) -> Vec<[u8; 3]> {
        self.core.borrow().gram.clone()
    }

    /// One panel pixel.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.core.borrow().gram[(y * TFT_WIDTH + x) as usize]
    }

    /// First panel position whose content differs from `fb` viewed under
    /// `rotation`, if any.
    pub fn mismatch(&self, fb: &[u16], rotation: Rotation) -> Option<(u32, u32)> {
        let c = self.core.borrow();
        for py in 0..TFT_HEIGHT {
            for px in 0..TFT_WIDTH {
                let expect = rgb565_to_rgb666(fb[rotation.logical_index(px, py)]);
                if c.gram[(py * TFT_WIDTH + px) as usize] != expect {
                    return Some((px, py));
                }
            }
        }
        None
    }

    /// Panic unless the panel equals `fb` viewed under `rotation`.
    pub fn assert_matches(&self, fb: &[u16], rotation: Rotation) {
        if let Some((px, py)) = self.mismatch(fb, rotation) {
            panic!(
                "panel mismatch at ({px},{py}): got {:?}, expected {:?}",
                self.pixel(px, py),
                rgb565_to_rgb666(fb[rotation.logical_index(px, py)])
            );
        }
    }

    /// RAMWR transactions since the last counter reset.
    pub fn ramwr_count(&self) -> u32 {
        self.core.borrow().ramwr_count
    }

    /// Pixels written since the last counter reset.
    pub fn pixels_written(&self) -> u64 {
        self.core.borrow().pixels_written
    }

    /// Pixel-run lengths, one per RAMWR, since the last counter reset.
    pub fn runs(&self) -> Vec<u32> {
        self.core.borrow().runs.clone()
    }

    /// Address windows seen (command byte, start, end), since the last
    /// counter reset.
    pub fn windows(&self) -> Vec<(u8, u16, u16)> {
        self.core.borrow().windows.clone()
    }

    /// Zero the transaction counters and logs.
    pub fn reset_counters(&self) {
        let mut c = self.core.borrow_mut();
        c.ramwr_count = 0;
        c.pixels_written = 0;
        c.windows.clear();
        c.runs.clear();
    }

    /// Current beam line in `[0, 320)`.
    pub fn line_now(&self) -> u32 {
        self.core.borrow().line_now()
    }

    /// Current refresh period, microseconds.
    pub fn period_micros(&self) -> u64 {
        self.core.borrow().period_ns / 1_000
    }

    /// Virtual time, microseconds.
    pub fn now_micros(&self) -> u64 {
        self.core.borrow().now_ns / 1_000
    }

    /// Whether the panel left sleep and the display is on.
    pub fn awake(&self) -> bool {
        let c = self.core.borrow();
        c.reset_done && !c.sleeping && c.display_on
    }

    /// Color inversion state.
    pub fn inverted(&self) -> bool {
        self.core.borrow().inverted
    }

    /// Vertical scroll start.
    pub fn scroll(&self) -> u16 {
        self.core.borrow().scroll
    }

    /// Kill the read path: all status reads return zero.
    pub fn set_dead_miso(&self, dead: bool) {
        self.core.borrow_mut().dead_miso = dead;
    }

    /// Override the self-diagnostic register.
    pub fn set_self_diag(&self, value: u8) {
        self.core.borrow_mut().self_diag = value;
    }

    /// Status reads return zero until the read clock was halved this many
    /// times (exercises the bring-up retry path).
    pub fn require_read_halvings(&self, n: u32) {
        self.core.borrow_mut().reads_need_halvings = n;
    }
}

/// The emulator's trait implementations, ready to wire into a driver.
pub struct Emulator {
    /// Blocking link.
    pub link: EmuLink,
    /// DMA pixel pipe.
    pub pipe: EmuPipe,
    /// One-shot timer.
    pub timer: EmuTimer,
    /// Virtual clock.
    pub clock: EmuClock,
    /// Inspection handle.
    pub panel: PanelHandle,
}

impl Emulator {
    /// Build a fresh panel.
    pub fn new(cfg: EmulatorConfig) -> Self {
        let core: Shared = Rc::new(RefCell::new(Core::new(cfg)));
        Self {
            link: EmuLink { core: core.clone() },
            pipe: EmuPipe { core: core.clone() },
            timer: EmuTimer { core: core.clone() },
            clock: EmuClock { core: core.clone() },
            panel: PanelHandle { core },
        }
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awake_panel() -> Emulator {
        let mut emu = Emulator::default();
        emu.link.command(0x01);
        emu.link.command(0x11);
        emu.link.command(0x29);
        emu
    }

    #[test]
    fn ramwr_writes_wrap_inside_the_window() {
        let mut emu = awake_panel();
        emu.link.begin(LinkSpeed::Write);
        emu.link.command(0x2A);
        emu.link.data16(10);
        emu.link.data16(11);
        emu.link.command(0x2B);
        emu.link.data16(5);
        emu.link.data16(6);
        emu.link.command(0x2C);
        for _ in 0..4 {
            emu.link.pixel(0xFFFF);
        }
        emu.link.end();

        assert_eq!(emu.panel.pixel(10, 5), [0xFF, 0xFF, 0xFF]);
        assert_eq!(emu.panel.pixel(11, 5), [0xFF, 0xFF, 0xFF]);
        assert_eq!(emu.panel.pixel(10, 6), [0xFF, 0xFF, 0xFF]);
        assert_eq!(emu.panel.pixel(11, 6), [0xFF, 0xFF, 0xFF]);
        assert_eq!(emu.panel.pixel(12, 5), [0, 0, 0]);
        assert_eq!(emu.panel.ramwr_count(), 1);
        assert_eq!(emu.panel.pixels_written(), 4);
    }

    #[test]
    fn partial_caset_moves_only_the_start() {
        let mut emu = awake_panel();
        emu.link.begin(LinkSpeed::Write);
        emu.link.command(0x2A);
        emu.link.data16(0);
        emu.link.data16(319);
        // move only the start; the end stays 319
        emu.link.command(0x2A);
        emu.link.data16(50);
        emu.link.command(0x2C);
        emu.link.pixel(0xF800);
        emu.link.end();
        assert_eq!(emu.panel.pixel(50, 0), [0xFF, 0, 0]);
    }

    #[test]
    fn beam_advances_with_virtual_time() {
        let emu = awake_panel();
        let l0 = emu.panel.line_now();
        emu.clock.delay_micros(1_000);
        let l1 = emu.panel.line_now();
        assert_ne!(l0, l1);
        // a whole period wraps around
        let p = emu.panel.period_micros() as u32;
        let before = emu.panel.line_now();
        emu.clock.delay_micros(p);
        assert_eq!(emu.panel.line_now(), before);
    }

    #[test]
    fn frmctr1_slows_the_refresh() {
        let mut emu = awake_panel();
        let p0 = emu.panel.period_micros();
        emu.link.begin(LinkSpeed::Setup);
        emu.link.command(0xB1);
        emu.link.data8(0);
        emu.link.data8(0x10 + 15);
        emu.link.end();
        let p15 = emu.panel.period_micros();
        assert_eq!(p15, p0 * 31 / 16);

        emu.link.begin(LinkSpeed::Setup);
        emu.link.command(0xB1);
        emu.link.data8(1);
        emu.link.data8(0x10);
        emu.link.end();
        assert_eq!(emu.panel.period_micros(), p0 * 2);
    }

    #[test]
    fn status_reads_require_an_awake_panel() {
        let mut emu = Emulator::default();
        assert_eq!(emu.link.read8(0x0A), Some(0));
        emu.link.command(0x01);
        emu.link.command(0x11);
        emu.link.command(0x29);
        assert_eq!(emu.link.read8(0x0A), Some(0x9C));
        assert_eq!(emu.link.read8(0x0C), Some(0x05));
        assert_eq!(emu.link.read8(0x0F), Some(0xC0));
    }

    #[test]
    fn timer_events_fire_through_the_hook() {
        let mut emu = Emulator::default();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let log = fired.clone();
        emu.panel.set_irq_hook(move |k| log.borrow_mut().push(k));
        emu.timer.arm_micros(100);
        emu.clock.delay_micros(50);
        assert!(fired.borrow().is_empty());
        emu.clock.delay_micros(100);
        assert_eq!(*fired.borrow(), vec![IrqKind::Timer]);
    }
}
