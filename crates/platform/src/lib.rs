//! Hardware seams for the vsync'd differential panel driver.
//!
//! This crate defines the trait boundary between the driver core and the
//! hardware it runs on, so the core can be exercised on a desktop against
//! the panel emulator and mocks, and deployed on a microcontroller behind
//! thin register-level implementations.
//!
//! # Architecture layers
//!
//! ```text
//! Application (framebuffers, drawing)
//!         ↓
//! Driver core (ili9488-vsync: diff, scheduling, upload engine)
//!         ↓
//! Platform seams (this crate - trait abstractions)
//!         ↓
//! Hardware (SPI + DMA + timer registers) or panel emulator
//! ```
//!
//! # Traits
//!
//! - [`PanelLink`] - blocking command/data/pixel path plus status reads
//! - [`PixelPipe`] - interrupt-driven DMA path for pixel runs
//! - [`IntervalTimer`] - one-shot deadline used to wait for scanlines
//! - [`TimeSource`] - monotonic microsecond clock
//!
//! # Features
//!
//! - `std`: standard library support (tests, emulator, mocks)
//! - `defmt`: defmt formatting on public types
//! - `embassy`: [`TimeSource`] implementation backed by `embassy-time`

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

#[cfg(feature = "std")]
extern crate std;

pub mod color;
pub mod link;
pub mod pipe;
pub mod time;

#[cfg(any(test, feature = "std"))]
pub mod mocks;

pub use color::rgb565_to_rgb666;
pub use link::{LinkSpeed, PanelLink, SpiPanelLink};
pub use pipe::{IntervalTimer, PixelPipe};
pub use time::TimeSource;

#[cfg(feature = "embassy")]
pub use time::EmbassyTime;
