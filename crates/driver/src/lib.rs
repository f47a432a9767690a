//! Vsync-synchronized differential framebuffer driver for ILI9488 panels.
//!
//! The driver mirrors the panel in one or two in-memory RGB565
//! framebuffers and uploads only the pixels that changed, as a compact
//! run-length diff, timed against the panel's internal scan position so
//! partial uploads never visibly tear.
//!
//! Four subsystems make up the core:
//!
//! - [`DiffBuffer`] - encodes per-scanline change runs between two
//!   framebuffers under a rotation, merge gap and compare mask, and
//!   replays them as a stream of positioned pixel runs.
//! - [`ScanlineClock`] - models the panel's scan position between
//!   hardware reads and answers "how long until line L?".
//! - [`UpdateEngine`] - the interrupt-driven upload pipeline: an
//!   enum-tagged state machine resumed from the DMA-completion and timer
//!   interrupts, feeding address windows and pixel runs into the serial
//!   peripheral.
//! - [`Ili9488`] - the public session: bring-up, buffering policy
//!   (none/double/triple), rotation, refresh modes, region updates.
//!
//! Hardware access goes through the `platform` crate's traits, so the
//! whole driver runs unmodified against the `panel-emulator` crate on a
//! desktop.
//!
//! # Typical setup
//!
//! ```rust,ignore
//! static ENGINE: StaticCell<UpdateEngine<Pipe, Timer, Clock>> = StaticCell::new();
//! static FB1: StaticCell<Framebuffer> = StaticCell::new();
//! static DIFF1: StaticCell<DiffBuffer> = StaticCell::new();
//!
//! let engine = ENGINE.init(UpdateEngine::new(pipe, timer, clock.clone()));
//! let mut tft = Ili9488::new(link, clock, engine);
//! tft.begin()?;
//! tft.bind_framebuffers(Some(FB1.init(Framebuffer::new())), None);
//! tft.bind_diff_buffers(Some(DIFF1.init(DiffBuffer::new(storage))), None);
//! tft.update(&frame, false);
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

#[macro_use]
mod fmt;

pub mod clock;
pub mod commands;
pub mod diff;
pub mod driver;
pub mod framebuffer;
pub mod isr;
pub mod rotation;
pub mod stats;
pub mod upload;

pub use clock::ScanlineClock;
pub use diff::{DiffBuffer, DiffCursor, DiffRead, DummyDiff, Run};
pub use driver::{BeginError, BufferingMode, Ili9488};
pub use framebuffer::Framebuffer;
pub use rotation::{Rect, Rotation};
pub use stats::{FrameStats, FrameTiming};
pub use upload::UpdateEngine;

/// Panel width in its native portrait orientation.
pub const TFT_WIDTH: u32 = 320;

/// Panel height in its native portrait orientation.
pub const TFT_HEIGHT: u32 = 480;

/// Total pixel count of the panel.
pub const NB_PIXELS: usize = (TFT_WIDTH as usize) * (TFT_HEIGHT as usize);

/// Lines counted by the panel's internal timing generator per refresh.
///
/// This is independent of the 480 display rows: the generator sweeps 320
/// lines per refresh, and all vsync arithmetic works in this space.
/// Display rows convert via [`line_of_row`].
pub const NB_SCANLINES: u32 = 320;

/// Largest accepted `vsync_spacing`.
pub const MAX_VSYNC_SPACING: i8 = 10;

/// Timing-generator line on which the beam crosses display row `row`.
#[inline]
pub const fn line_of_row(row: u32) -> u32 {
    row * NB_SCANLINES / TFT_HEIGHT
}
