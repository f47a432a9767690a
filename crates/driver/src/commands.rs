//! ILI9488 command set (the subset the driver uses).

#![allow(missing_docs)]

pub const NOP: u8 = 0x00;
pub const SWRESET: u8 = 0x01;

pub const SLPIN: u8 = 0x10;
pub const SLPOUT: u8 = 0x11;

pub const INVOFF: u8 = 0x20;
pub const INVON: u8 = 0x21;
pub const DISPOFF: u8 = 0x28;
pub const DISPON: u8 = 0x29;

pub const CASET: u8 = 0x2A;
pub const PASET: u8 = 0x2B;
pub const RAMWR: u8 = 0x2C;

pub const VSCRSADD: u8 = 0x37;

pub const RDMODE: u8 = 0x0A;
pub const RDMADCTL: u8 = 0x0B;
pub const RDPIXFMT: u8 = 0x0C;
pub const RDIMGFMT: u8 = 0x0D;
pub const RDSELFDIAG: u8 = 0x0F;

pub const FRMCTR1: u8 = 0xB1;

/// Expected status-register values after a successful bring-up.
pub const STATUS_POWER_MODE: u8 = 0x9C;
pub const STATUS_PIXEL_FORMAT: u8 = 0x05;
pub const STATUS_IMAGE_FORMAT: u8 = 0x00;
pub const STATUS_SELFDIAG_OK: u8 = 0xC0;

/// Panel initialization sequence, executed once at bring-up.
///
/// Length-prefixed records: `len, command, params...`, terminated by a
/// zero length. Gamma tables, power control, 18-bit pixel format, 60 Hz
/// frame rate.
pub const INIT_SEQUENCE: &[u8] = &[
    16, 0xE0, 0x00, 0x03, 0x09, 0x08, 0x16, 0x0A, 0x3F, 0x78, 0x4C, 0x09, 0x0A, 0x08, 0x16,
    0x1A, 0x0F, //
    16, 0xE1, 0x00, 0x16, 0x19, 0x03, 0x0F, 0x05, 0x32, 0x45, 0x46, 0x04, 0x0E, 0x0D, 0x35,
    0x37, 0x0F, //
    3, 0xC0, 0x17, 0x15, // power control 1
    2, 0xC1, 0x41, // power control 2
    4, 0xC5, 0x00, 0x12, 0x80, // VCOM control
    2, 0x36, 0x48, // memory access control
    2, 0x3A, 0x66, // interface pixel format, 18 bit
    2, 0xB0, 0x80, // interface mode control
    2, 0xB1, 0xA0, // frame rate, 60 Hz
    2, 0xB4, 0x02, // display inversion control
    1, 0xB6, // display function control
    2, 0x02, 0x02, //
    2, 0xE9, 0x00, // disable 24-bit data
    5, 0xF7, 0xA9, 0x51, 0x2C, 0x82, // adjust control
    0,
];
