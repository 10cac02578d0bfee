//! Scripted serial port for exercising the protocol without hardware

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::{Options, Programmer, SerialPort};

#[derive(Clone, PartialEq, Debug)]
pub struct MockError;

/// Serial port replaying queued responses and recording transmitted bytes
#[derive(Default, Debug)]
pub struct MockPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub rts: Vec<bool>,
    pub dtr: Vec<bool>,
    pub fail_read: bool,
    pub fail_write: bool,
}

impl MockPort {
    pub fn new(rx: &[u8]) -> Self {
        Self{ rx: rx.iter().copied().collect(), ..Default::default() }
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        if self.fail_read {
            return Err(nb::Error::Other(MockError));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        if self.fail_write {
            return Err(nb::Error::Other(MockError));
        }
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_rts(&mut self, level: bool) -> Result<(), MockError> {
        self.rts.push(level);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        self.dtr.push(level);
        Ok(())
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Delay recording the total time requested
#[derive(Default, Debug)]
pub struct CountingDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for CountingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms as u64;
    }
}

pub type MockProgrammer = Programmer<MockPort, NoDelay, MockError>;

/// Programmer over a mock port with the provided responses queued
pub fn programmer(rx: &[u8]) -> MockProgrammer {
    Programmer::new(MockPort::new(rx), NoDelay, Options::default())
}
