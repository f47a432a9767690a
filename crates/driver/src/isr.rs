//! Interrupt routing.
//!
//! The DMA and timer interrupt handlers are free functions that need to
//! find "the engine bound to this peripheral". Each engine registers
//! itself in a fixed-size slot table keyed by peripheral index; slots
//! hold a type-erased pointer plus a monomorphized trampoline, so there
//! is no heap and no trait object. Slots are claimed at bring-up and
//! never relinquished.
//!
//! ```rust,ignore
//! // at bring-up
//! isr::register(0, engine);
//!
//! // in the vector table handlers
//! fn dma_irq() { isr::dispatch_pipe(0); }
//! fn timer_irq() { isr::dispatch_timer(0); }
//! ```

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use platform::{IntervalTimer, PixelPipe, TimeSource};

use crate::upload::UpdateEngine;

/// Peripherals the table can serve (SPI0..SPI3 style numbering).
pub const MAX_PERIPHERALS: usize = 4;

struct Slot {
    engine: AtomicPtr<()>,
    pipe_hook: AtomicUsize,
    timer_hook: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    engine: AtomicPtr::new(core::ptr::null_mut()),
    pipe_hook: AtomicUsize::new(0),
    timer_hook: AtomicUsize::new(0),
};

static SLOTS: [Slot; MAX_PERIPHERALS] = [EMPTY_SLOT; MAX_PERIPHERALS];

fn pipe_trampoline<P, T, C>(engine: *const ())
where
    P: PixelPipe + 'static,
    T: IntervalTimer + 'static,
    C: TimeSource + 'static,
{
    // SAFETY: the pointer was produced from an &'static engine of exactly
    // this type in register().
    let engine = unsafe { &*engine.cast::<UpdateEngine<P, T, C>>() };
    engine.on_pipe_interrupt();
}

fn timer_trampoline<P, T, C>(engine: *const ())
where
    P: PixelPipe + 'static,
    T: IntervalTimer + 'static,
    C: TimeSource + 'static,
{
    // SAFETY: see pipe_trampoline.
    let engine = unsafe { &*engine.cast::<UpdateEngine<P, T, C>>() };
    engine.on_timer_interrupt();
}

/// Bind an engine to a peripheral index. Returns `false` when the index
/// is out of range or the slot is already taken by another engine.
pub fn register<P, T, C>(index: usize, engine: &'static UpdateEngine<P, T, C>) -> bool
where
    P: PixelPipe + 'static,
    T: IntervalTimer + 'static,
    C: TimeSource + 'static,
{
    let Some(slot) = SLOTS.get(index) else {
        return false;
    };
    let ptr = (engine as *const UpdateEngine<P, T, C>).cast::<()>().cast_mut();
    let previous = slot
        .engine
        .compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .unwrap_or_else(|p| p);
    if !previous.is_null() && previous != ptr {
        return false;
    }
    slot.pipe_hook
        .store(pipe_trampoline::<P, T, C> as usize, Ordering::Release);
    slot.timer_hook
        .store(timer_trampoline::<P, T, C> as usize, Ordering::Release);
    true
}

fn dispatch(index: usize, hook_of: impl Fn(&Slot) -> &AtomicUsize) {
    let Some(slot) = SLOTS.get(index) else {
        return;
    };
    let engine = slot.engine.load(Ordering::Acquire);
    let hook = hook_of(slot).load(Ordering::Acquire);
    if engine.is_null() || hook == 0 {
        return;
    }
    // SAFETY: hook was stored as a fn(*const ()) trampoline matching the
    // engine pointer in the same slot.
    let f = unsafe { core::mem::transmute::<usize, fn(*const ())>(hook) };
    f(engine.cast_const());
}

/// Route a DMA completion interrupt to the engine on `index`.
pub fn dispatch_pipe(index: usize) {
    dispatch(index, |s| &s.pipe_hook);
}

/// Route a timer expiry interrupt to the engine on `index`.
pub fn dispatch_timer(index: usize) {
    dispatch(index, |s| &s.timer_hook);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_on_empty_or_invalid_slots_is_a_no_op() {
        dispatch_pipe(MAX_PERIPHERALS + 5);
        dispatch_timer(3);
    }

    #[test]
    fn registering_out_of_range_fails() {
        // Registration itself is exercised end-to-end in the emulator
        // suite; here we only pin the bounds check.
        let clock = platform::mocks::ManualClock::new();
        let engine = Box::leak(Box::new(UpdateEngine::new(
            platform::mocks::CollectingPipe::default(),
            platform::mocks::RecordingTimer::default(),
            clock,
        )));
        assert!(!register(MAX_PERIPHERALS, &*engine));
    }
}
