//! Mock implementations of the platform traits for unit tests.

#![cfg(any(test, feature = "std"))]
#![allow(missing_docs)]

use crate::link::{LinkSpeed, PanelLink};
use crate::pipe::{IntervalTimer, PixelPipe};
use crate::time::TimeSource;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

/// One operation observed on a [`RecordingLink`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOp {
    Begin(LinkSpeed),
    End,
    Command(u8),
    Data8(u8),
    Data16(u16),
    Pixel(u16),
    Read8(u8),
    ReadScanline,
    HalveReadClock,
}

/// Link that records every operation and replays scripted read results.
#[derive(Default)]
pub struct RecordingLink {
    pub ops: Vec<LinkOp>,
    pub read8_script: VecDeque<Option<u8>>,
    pub scanline: u16,
    pub scanline_script: VecDeque<Option<u16>>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded commands with the given byte.
    pub fn command_count(&self, cmd: u8) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, LinkOp::Command(c) if *c == cmd))
            .count()
    }
}

impl PanelLink for RecordingLink {
    fn begin(&mut self, speed: LinkSpeed) {
        self.ops.push(LinkOp::Begin(speed));
    }

    fn end(&mut self) {
        self.ops.push(LinkOp::End);
    }

    fn command(&mut self, cmd: u8) {
        self.ops.push(LinkOp::Command(cmd));
    }

    fn data8(&mut self, value: u8) {
        self.ops.push(LinkOp::Data8(value));
    }

    fn data16(&mut self, value: u16) {
        self.ops.push(LinkOp::Data16(value));
    }

    fn pixel(&mut self, rgb565: u16) {
        self.ops.push(LinkOp::Pixel(rgb565));
    }

    fn read8(&mut self, cmd: u8) -> Option<u8> {
        self.ops.push(LinkOp::Read8(cmd));
        self.read8_script.pop_front().unwrap_or(Some(0))
    }

    fn read_scanline(&mut self) -> Option<u16> {
        self.ops.push(LinkOp::ReadScanline);
        if let Some(s) = self.scanline_script.pop_front() {
            return s;
        }
        Some(self.scanline)
    }

    fn halve_read_clock(&mut self) {
        self.ops.push(LinkOp::HalveReadClock);
    }
}

/// Manually advanced clock shared between the test and the code under
/// test.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<RefCell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, micros: u64) {
        *self.now.borrow_mut() += micros;
    }

    pub fn set(&self, micros: u64) {
        *self.now.borrow_mut() = micros;
    }
}

impl TimeSource for ManualClock {
    fn now_micros(&self) -> u64 {
        *self.now.borrow()
    }

    fn delay_micros(&self, micros: u32) {
        self.advance(u64::from(micros));
    }
}

/// Timer that records armed deadlines without ever firing.
#[derive(Default)]
pub struct RecordingTimer {
    pub armed: Vec<u32>,
    pub cancelled: usize,
}

impl IntervalTimer for RecordingTimer {
    fn arm_micros(&mut self, micros: u32) {
        self.armed.push(micros);
    }

    fn cancel(&mut self) {
        self.cancelled += 1;
    }
}

/// Pipe that copies every run payload into an owned log.
#[derive(Default)]
pub struct CollectingPipe {
    pub commands: Vec<(u8, Vec<u16>)>,
    pub runs: Vec<Vec<u8>>,
    pub begun: usize,
    pub finished: usize,
}

impl PixelPipe for CollectingPipe {
    fn begin(&mut self) {
        self.begun += 1;
    }

    fn command(&mut self, cmd: u8) {
        self.commands.push((cmd, Vec::new()));
    }

    fn data16(&mut self, value: u16) {
        if let Some(last) = self.commands.last_mut() {
            last.1.push(value);
        }
    }

    unsafe fn start_run(&mut self, bytes: *const u8, len: usize) {
        // SAFETY: the caller guarantees the range is valid for reads.
        let payload = unsafe { core::slice::from_raw_parts(bytes, len) };
        self.runs.push(payload.to_vec());
    }

    fn finish(&mut self) {
        self.finished += 1;
    }
}
