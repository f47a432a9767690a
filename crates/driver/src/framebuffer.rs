//! Caller-visible framebuffer storage.

use crate::rotation::Rotation;
use crate::NB_PIXELS;

/// A full-panel RGB565 framebuffer.
///
/// Storage is a flat array interpreted in the current logical orientation
/// (320 pixels wide in portrait, 480 in landscape); the driver never
/// re-lays it out on rotation. On hardware, place instances in
/// DMA-reachable memory and hand them to the driver as `&'static mut`
/// (for example through `static_cell::StaticCell`).
#[repr(transparent)]
pub struct Framebuffer {
    pixels: [u16; NB_PIXELS],
}

impl Framebuffer {
    /// A zeroed (black) framebuffer.
    pub const fn new() -> Self {
        Self {
            pixels: [0; NB_PIXELS],
        }
    }

    /// Flat pixel storage.
    #[inline]
    pub fn as_slice(&self) -> &[u16] {
        &self.pixels
    }

    /// Mutable flat pixel storage.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Fill with a solid color.
    pub fn fill(&mut self, color: u16) {
        self.pixels.fill(color);
    }

    /// Read one pixel in logical coordinates under `rotation`.
    #[inline]
    pub fn pixel(&self, rotation: Rotation, x: u32, y: u32) -> u16 {
        self.pixels[(y * rotation.width() + x) as usize]
    }

    /// Write one pixel in logical coordinates under `rotation`.
    #[inline]
    pub fn set_pixel(&mut self, rotation: Rotation, x: u32, y: u32, color: u16) {
        self.pixels[(y * rotation.width() + x) as usize] = color;
    }

    /// A draw surface for `embedded-graphics`, interpreting the storage
    /// under the given orientation.
    #[cfg(feature = "graphics")]
    pub fn canvas(&mut self, rotation: Rotation) -> Canvas<'_> {
        Canvas {
            framebuffer: self,
            rotation,
        }
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// `embedded-graphics` adapter over a [`Framebuffer`].
///
/// The driver itself draws nothing; primitives land in caller-owned RAM
/// and reach the panel through the usual diff upload.
#[cfg(feature = "graphics")]
pub struct Canvas<'a> {
    framebuffer: &'a mut Framebuffer,
    rotation: Rotation,
}

#[cfg(feature = "graphics")]
mod graphics {
    use super::Canvas;
    use embedded_graphics::pixelcolor::{raw::RawU16, Rgb565};
    use embedded_graphics::prelude::*;

    impl OriginDimensions for Canvas<'_> {
        fn size(&self) -> Size {
            Size::new(self.rotation.width(), self.rotation.height())
        }
    }

    impl DrawTarget for Canvas<'_> {
        type Color = Rgb565;
        type Error = core::convert::Infallible;

        fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
        where
            I: IntoIterator<Item = Pixel<Self::Color>>,
        {
            let width = self.rotation.width() as i32;
            let height = self.rotation.height() as i32;
            for Pixel(point, color) in pixels {
                if point.x < 0 || point.y < 0 || point.x >= width || point.y >= height {
                    continue;
                }
                let raw: RawU16 = color.into();
                self.framebuffer.set_pixel(
                    self.rotation,
                    point.x as u32,
                    point.y as u32,
                    raw.into_inner(),
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_addressing_follows_rotation_width() {
        let mut fb = Box::new(Framebuffer::new());
        fb.set_pixel(Rotation::Portrait, 5, 2, 0xABCD);
        assert_eq!(fb.as_slice()[2 * 320 + 5], 0xABCD);

        fb.set_pixel(Rotation::Landscape, 5, 2, 0x1234);
        assert_eq!(fb.as_slice()[2 * 480 + 5], 0x1234);
    }

    #[cfg(feature = "graphics")]
    #[test]
    fn canvas_draws_into_storage() {
        use embedded_graphics::pixelcolor::Rgb565;
        use embedded_graphics::prelude::*;
        use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};

        let mut fb = Box::new(Framebuffer::new());
        Rectangle::new(Point::new(0, 0), Size::new(2, 1))
            .into_styled(PrimitiveStyle::with_fill(Rgb565::RED))
            .draw(&mut fb.canvas(Rotation::Portrait))
            .unwrap();
        assert_eq!(fb.as_slice()[0], 0xF800);
        assert_eq!(fb.as_slice()[1], 0xF800);
        assert_eq!(fb.as_slice()[2], 0x0000);
    }
}
