//! Interrupt-driven upload path.
//!
//! [`PixelPipe`] is the asynchronous counterpart of
//! [`PanelLink`](crate::link::PanelLink): the driver's upload engine
//! queues address-window commands through the FIFO and hands pixel
//! payloads to a DMA channel. Each payload completion raises the
//! interrupt that resumes the engine's state machine; the embedder routes
//! that interrupt (and the [`IntervalTimer`] expiry) back into the
//! engine, typically through the driver's slot table.
//!
//! Hardware note: pixel payload bytes are transmitted in 24-bit frames
//! even though the panel runs in 18-bit mode; the peripheral discards the
//! top byte of each frame. Implementations must preserve this framing -
//! the emulator test suite asserts the panel still receives correct RGB.

/// DMA-capable pixel path with per-run completion interrupts.
pub trait PixelPipe {
    /// Claim the bus for an upload burst. Balanced by
    /// [`finish`](Self::finish).
    fn begin(&mut self);

    /// Queue one command byte through the FIFO (command framing).
    fn command(&mut self, cmd: u8);

    /// Queue a 16-bit parameter, big endian (data framing).
    fn data16(&mut self, value: u16);

    /// Start transmitting `len` payload bytes from `bytes` (data framing,
    /// three bytes per pixel, MSB first). The completion interrupt fires
    /// when the transfer ends.
    ///
    /// # Safety
    ///
    /// The memory range must stay valid and unmodified until the
    /// completion interrupt for this run has been delivered. The caller
    /// is responsible for any data-cache maintenance the transfer needs.
    unsafe fn start_run(&mut self, bytes: *const u8, len: usize);

    /// Drain the FIFO and release the bus after the last run.
    fn finish(&mut self);
}

/// One-shot deadline timer.
///
/// Arming schedules a single expiry interrupt; re-arming replaces any
/// pending deadline. The embedder routes the expiry into the upload
/// engine the same way it routes the DMA completion.
pub trait IntervalTimer {
    /// Fire the expiry interrupt `micros` from now (minimum one).
    fn arm_micros(&mut self, micros: u32);

    /// Drop any pending deadline.
    fn cancel(&mut self);
}
