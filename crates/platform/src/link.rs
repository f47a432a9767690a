//! Blocking panel link.
//!
//! [`PanelLink`] is the synchronous command/data path the driver uses for
//! bring-up, configuration, status reads and non-DMA uploads. Writes are
//! infallible by contract: on real hardware they are FIFO pushes that
//! cannot fail, and once initialized the driver never propagates upload
//! errors (frames may be dropped or uploaded conservatively instead).
//! Only reads can time out.

use crate::color::rgb565_to_rgb666;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Operation, SpiDevice};

/// Clock class for a link transaction.
///
/// The concrete rates belong to the link implementation; the driver only
/// distinguishes the fast pixel path, the quarter-speed setup path used
/// during bring-up, and the (slower still) read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkSpeed {
    /// Full-speed pixel upload clock.
    Write,
    /// Reduced clock for initialization command sequences.
    Setup,
    /// Read clock (panels require a much slower clock to drive SDO).
    Read,
}

/// Blocking serial link to the panel.
///
/// A transaction is bracketed by [`begin`](Self::begin) / [`end`](Self::end);
/// commands and data may only be issued inside one.
pub trait PanelLink {
    /// Start a transaction at the given clock class.
    fn begin(&mut self, speed: LinkSpeed);

    /// Finish the transaction and release the bus.
    fn end(&mut self);

    /// Send a command byte (DC low on classic 4-wire interfaces).
    fn command(&mut self, cmd: u8);

    /// Send one parameter byte.
    fn data8(&mut self, value: u8);

    /// Send a 16-bit parameter, big endian, as the panel expects for
    /// address-window coordinates.
    fn data16(&mut self, value: u16);

    /// Convert one RGB565 pixel to the panel's 18-bit format and send it.
    fn pixel(&mut self, rgb565: u16);

    /// Issue a status read command and return the response byte.
    ///
    /// `None` signals a timeout or an unusable read path; the caller
    /// decides whether to retry.
    fn read8(&mut self, cmd: u8) -> Option<u8>;

    /// Read the panel's current scanline, mapped into `[0, lines)` of the
    /// internal timing generator.
    fn read_scanline(&mut self) -> Option<u16>;

    /// Halve the read clock. Called between bring-up retries when status
    /// registers read back garbage; implementations without clock control
    /// may ignore it.
    fn halve_read_clock(&mut self) {}
}

/// [`PanelLink`] over a blocking `embedded-hal` SPI device plus a DC pin.
///
/// Chip select is owned by the [`SpiDevice`]. This implementation covers
/// boards without a dedicated display peripheral; register-level links
/// (hardware-managed DC, DMA-capable FIFOs) implement [`PanelLink`]
/// directly.
pub struct SpiPanelLink<SPI, DC> {
    spi: SPI,
    dc: DC,
}

impl<SPI, DC> SpiPanelLink<SPI, DC>
where
    SPI: SpiDevice,
    DC: OutputPin,
{
    /// Wrap an SPI device and DC pin.
    pub fn new(spi: SPI, dc: DC) -> Self {
        Self { spi, dc }
    }

    /// Release the bus and pin.
    pub fn release(self) -> (SPI, DC) {
        (self.spi, self.dc)
    }
}

/// Read-scanline command (GTS) of the ILI9488 command set.
const CMD_READ_SCANLINE: u8 = 0x45;

impl<SPI, DC> PanelLink for SpiPanelLink<SPI, DC>
where
    SPI: SpiDevice,
    DC: OutputPin,
{
    fn begin(&mut self, _speed: LinkSpeed) {
        // Clock selection is fixed by the bus configuration here.
    }

    fn end(&mut self) {}

    fn command(&mut self, cmd: u8) {
        let _ = self.dc.set_low();
        let _ = self.spi.write(&[cmd]);
        let _ = self.dc.set_high();
    }

    fn data8(&mut self, value: u8) {
        let _ = self.spi.write(&[value]);
    }

    fn data16(&mut self, value: u16) {
        let _ = self.spi.write(&value.to_be_bytes());
    }

    fn pixel(&mut self, rgb565: u16) {
        let _ = self.spi.write(&rgb565_to_rgb666(rgb565));
    }

    fn read8(&mut self, cmd: u8) -> Option<u8> {
        let _ = self.dc.set_low();
        let mut buf = [0u8; 1];
        let res = self.spi.transaction(&mut [
            Operation::Write(&[cmd]),
            Operation::Read(&mut buf),
        ]);
        let _ = self.dc.set_high();
        res.ok().map(|()| buf[0])
    }

    fn read_scanline(&mut self) -> Option<u16> {
        let _ = self.dc.set_low();
        // GTS returns a dummy byte followed by GTS[9:8] and GTS[7:0].
        let mut buf = [0u8; 3];
        let res = self.spi.transaction(&mut [
            Operation::Write(&[CMD_READ_SCANLINE]),
            Operation::Read(&mut buf),
        ]);
        let _ = self.dc.set_high();
        res.ok().map(|()| {
            let raw = (u16::from(buf[1] & 0x03) << 8) | u16::from(buf[2]);
            // The counter reports half-lines with a 3-line setup offset;
            // blanking slack is attributed to line 0.
            (2 * raw).saturating_sub(3).min(319)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };
    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    fn command_pins() -> [PinTransaction; 2] {
        [
            PinTransaction::set(PinState::Low),
            PinTransaction::set(PinState::High),
        ]
    }

    #[test]
    fn command_byte_goes_out_with_dc_low() {
        let spi_expect = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x2A]),
            SpiTransaction::transaction_end(),
        ];
        let mut spi = SpiMock::new(&spi_expect);
        let mut dc = PinMock::new(&command_pins());

        let mut panel_link = SpiPanelLink::new(spi.clone(), dc.clone());
        panel_link.command(0x2A);

        spi.done();
        dc.done();
    }

    #[test]
    fn data16_is_big_endian() {
        let spi_expect = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x01, 0x3F]),
            SpiTransaction::transaction_end(),
        ];
        let mut spi = SpiMock::new(&spi_expect);
        let mut dc = PinMock::new(&[]);

        let mut panel_link = SpiPanelLink::new(spi.clone(), dc.clone());
        panel_link.data16(0x013F);

        spi.done();
        dc.done();
    }

    #[test]
    fn pixel_sends_three_expanded_bytes() {
        let spi_expect = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0xFF, 0x00, 0x00]),
            SpiTransaction::transaction_end(),
        ];
        let mut spi = SpiMock::new(&spi_expect);
        let mut dc = PinMock::new(&[]);

        let mut panel_link = SpiPanelLink::new(spi.clone(), dc.clone());
        panel_link.pixel(0xF800);

        spi.done();
        dc.done();
    }

    #[test]
    fn scanline_read_maps_half_lines() {
        let spi_expect = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x45]),
            SpiTransaction::read_vec(vec![0x00, 0x00, 80]),
            SpiTransaction::transaction_end(),
        ];
        let mut spi = SpiMock::new(&spi_expect);
        let mut dc = PinMock::new(&command_pins());

        let mut panel_link = SpiPanelLink::new(spi.clone(), dc.clone());
        assert_eq!(panel_link.read_scanline(), Some(157));

        spi.done();
        dc.done();
    }

    #[test]
    fn scanline_read_clamps_blanking_to_line_zero() {
        let spi_expect = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x45]),
            SpiTransaction::read_vec(vec![0x00, 0x00, 0x00]),
            SpiTransaction::transaction_end(),
        ];
        let mut spi = SpiMock::new(&spi_expect);
        let mut dc = PinMock::new(&command_pins());

        let mut panel_link = SpiPanelLink::new(spi.clone(), dc.clone());
        assert_eq!(panel_link.read_scanline(), Some(0));

        spi.done();
        dc.done();
    }
}
