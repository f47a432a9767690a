//! Pixel format conversion for the panel's 18-bit interface.
//!
//! The driver keeps framebuffers in RGB565 (two bytes per pixel) and the
//! panel is driven in 18-bit color mode, three bytes per pixel. The same
//! expansion is used by the blocking link, the DMA staging path and the
//! emulator, so a single definition lives here.

/// Expand an RGB565 pixel to the three bytes the panel receives in 18-bit
/// mode, most significant byte (red) first.
///
/// Each channel is scaled to the full 8-bit range; the panel latches the
/// upper six bits of every byte.
#[inline]
pub fn rgb565_to_rgb666(color: u16) -> [u8; 3] {
    let r = u32::from((color >> 11) & 0x1F);
    let g = u32::from((color >> 5) & 0x3F);
    let b = u32::from(color & 0x1F);
    [
        (r * 255 / 31) as u8,
        (g * 255 / 63) as u8,
        (b * 255 / 31) as u8,
    ]
}
