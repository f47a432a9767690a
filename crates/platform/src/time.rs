//! Time access for the scheduler.
//!
//! The driver's vsync arithmetic needs a monotonic microsecond clock and
//! a way to busy-wait. Both caller context and interrupt context read the
//! clock, so implementations must be cheap, cloneable handles.

/// Monotonic microsecond clock.
pub trait TimeSource: Clone {
    /// Microseconds since an arbitrary epoch. Must be monotonic and must
    /// be readable from interrupt context.
    fn now_micros(&self) -> u64;

    /// Busy-wait for `micros`. Only called from caller context.
    fn delay_micros(&self, micros: u32);
}

/// [`TimeSource`] backed by `embassy-time`.
#[cfg(feature = "embassy")]
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbassyTime;

#[cfg(feature = "embassy")]
impl TimeSource for EmbassyTime {
    fn now_micros(&self) -> u64 {
        embassy_time::Instant::now().as_micros()
    }

    fn delay_micros(&self, micros: u32) {
        embassy_time::block_for(embassy_time::Duration::from_micros(u64::from(micros)));
    }
}
