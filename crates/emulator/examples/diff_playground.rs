//! Drive the virtual panel the way firmware would: static engine and
//! buffers, embedded-graphics drawing, differential updates.
//!
//! Run with: cargo run -p panel-emulator --example diff_playground

use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, PrimitiveStyle, Rectangle};
use ili9488_vsync::{DiffBuffer, Framebuffer, Ili9488, Rotation, UpdateEngine};
use panel_emulator::{EmuClock, EmuPipe, EmuTimer, Emulator, EmulatorConfig};
use static_cell::StaticCell;

static FB1: StaticCell<Framebuffer> = StaticCell::new();
static DIFF_MEM: [StaticCell<[u8; 64 * 1024]>; 2] = [StaticCell::new(), StaticCell::new()];
static DIFFS: [StaticCell<DiffBuffer<'static>>; 2] = [StaticCell::new(), StaticCell::new()];

fn main() {
    let emu = Emulator::new(EmulatorConfig::default());
    // the emulator's handles are single-threaded (Rc), so the engine is
    // leaked rather than placed in a true static as firmware would
    let engine: &'static UpdateEngine<EmuPipe, EmuTimer, EmuClock> = Box::leak(Box::new(
        UpdateEngine::new(emu.pipe, emu.timer, emu.clock.clone()),
    ));
    emu.panel.install_engine_hook(engine);

    let mut tft = Ili9488::new(emu.link, emu.clock, engine);
    tft.begin().expect("bring-up");
    tft.bind_framebuffers(Some(FB1.init(Framebuffer::new())), None);
    let [m1, m2] = &DIFF_MEM;
    let [d1, d2] = &DIFFS;
    tft.bind_diff_buffers(
        Some(d1.init(DiffBuffer::new(m1.init([0; 64 * 1024])))),
        Some(d2.init(DiffBuffer::new(m2.init([0; 64 * 1024])))),
    );
    tft.set_vsync_spacing(2);

    let mut frame = Box::new(Framebuffer::new());
    for step in 0..30i32 {
        {
            let mut canvas = frame.canvas(Rotation::Portrait);
            canvas.clear(Rgb565::new(4, 8, 4)).unwrap();
            Rectangle::new(Point::new(20, 40), Size::new(280, 60))
                .into_styled(PrimitiveStyle::with_fill(Rgb565::CSS_STEEL_BLUE))
                .draw(&mut canvas)
                .unwrap();
            Circle::new(Point::new(40 + step * 8, 220), 48)
                .into_styled(PrimitiveStyle::with_fill(Rgb565::YELLOW))
                .draw(&mut canvas)
                .unwrap();
        }
        tft.update(&frame, false);
        tft.wait_update_complete();
    }

    let stats = tft.stats();
    println!("frames uploaded : {}", stats.nb_frames);
    println!("teared frames   : {}", stats.nb_teared);
    println!(
        "pixels per frame: min {} avg {} max {} (full frame = {})",
        stats.uploaded_pixels.min(),
        stats.uploaded_pixels.avg(),
        stats.uploaded_pixels.max(),
        ili9488_vsync::NB_PIXELS
    );
    println!(
        "margin          : min {} avg {} scanlines",
        stats.margin.min(),
        stats.margin.avg()
    );
    assert!(emu.panel.mismatch(frame.as_slice(), Rotation::Portrait).is_none());
}
