//! Shared bench setup for the emulator integration suites.

#![allow(dead_code)]

use ili9488_vsync::{DiffBuffer, Framebuffer, Ili9488, UpdateEngine};
use panel_emulator::{EmuClock, EmuLink, EmuPipe, EmuTimer, Emulator, EmulatorConfig, PanelHandle};

pub type Engine = UpdateEngine<EmuPipe, EmuTimer, EmuClock>;
pub type Tft = Ili9488<EmuLink, EmuPipe, EmuTimer, EmuClock>;

pub struct Bench {
    pub tft: Tft,
    pub panel: PanelHandle,
    pub clock: EmuClock,
}

/// A driver freshly brought up against a virtual panel, no framebuffers
/// bound yet.
pub fn bench() -> Bench {
    bench_with(EmulatorConfig::default())
}

pub fn bench_with(cfg: EmulatorConfig) -> Bench {
    let emu = Emulator::new(cfg);
    let engine: &'static Engine = Box::leak(Box::new(UpdateEngine::new(
        emu.pipe,
        emu.timer,
        emu.clock.clone(),
    )));
    emu.panel.install_engine_hook(engine);
    let mut tft = Ili9488::new(emu.link, emu.clock.clone(), engine);
    tft.begin().expect("panel bring-up failed");
    Bench {
        tft,
        panel: emu.panel,
        clock: emu.clock,
    }
}

/// Double buffering: one internal framebuffer, two diff buffers.
pub fn bench_double() -> Bench {
    let mut b = bench();
    b.tft.bind_framebuffers(Some(leak_fb()), None);
    b.tft
        .bind_diff_buffers(Some(leak_diff(256 * 1024)), Some(leak_diff(256 * 1024)));
    b
}

/// Triple buffering: two internal framebuffers, two diff buffers.
pub fn bench_triple() -> Bench {
    let mut b = bench();
    b.tft.bind_framebuffers(Some(leak_fb()), Some(leak_fb()));
    b.tft
        .bind_diff_buffers(Some(leak_diff(256 * 1024)), Some(leak_diff(256 * 1024)));
    b
}

pub fn leak_fb() -> &'static mut Framebuffer {
    Box::leak(Box::new(Framebuffer::new()))
}

pub fn leak_diff(capacity: usize) -> &'static mut DiffBuffer<'static> {
    let storage = Box::leak(vec![0u8; capacity].into_boxed_slice());
    Box::leak(Box::new(DiffBuffer::new(storage)))
}

/// A frame filled with one color.
pub fn solid_frame(color: u16) -> Box<Framebuffer> {
    let mut fb = Box::new(Framebuffer::new());
    fb.fill(color);
    fb
}

/// Deterministic pseudo-random frame.
pub fn random_frame(seed: u32) -> Box<Framebuffer> {
    let mut fb = Box::new(Framebuffer::new());
    let mut state = seed.wrapping_mul(2_891_336_453).wrapping_add(1);
    for px in fb.as_mut_slice() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *px = state as u16;
    }
    fb
}
