//! STM32 Serial Bootloader.
//!
//! Base on AN3155
//!
//! The [`Programmer`] implements the framing layer of the USART bootloader
//! protocol (checksummed frames, ACK / NACK handling, the individual wire
//! commands), and the [`Session`] builds capability-checked, chunked memory
//! operations on top of it.
//!
//! ```no_run
//! # #[cfg(feature = "linux")]
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use stm32_uart_loader::{Options, linux::LinuxSession};
//!
//! let mut s = LinuxSession::linux("/dev/ttyUSB0", 57600, Options::default())?;
//! let info = s.info()?;
//! let firmware = s.read(0x0800_0000, 1024, None)?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod protocol;
pub use protocol::{Capabilities, Command, DeviceInfo, Protection, ProtectionStatus};

mod programmer;
pub use programmer::{Programmer, State};

mod session;
pub use session::{Operation, Outcome, Session};

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use protocol::{UART_ACK, UART_DISC, UART_NACK};

/// Serial port abstraction, a byte stream with control over the RTS and DTR lines
pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Progress callback, called with (bytes done, bytes total)
pub type Progress<'a> = Option<&'a mut dyn FnMut(usize, usize)>;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("bootloader responded with NACK")]
    Nack,

    #[error("timeout waiting for bootloader response")]
    ResponseTimeout,

    #[error("unexpected response from bootloader: 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("chip id of {0} bytes does not fit in 16 bits")]
    InvalidChipId(usize),

    #[error("bootloader reported unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    /// The command was not listed by the bootloader in response to `Get`
    #[error("command {0:?} is not supported by the connected device")]
    Unsupported(Command),

    /// The command is known but has no wire implementation here
    #[error("command {0:?} is not implemented")]
    NotImplemented(Command),

    #[error("invalid data length {0} (must be 1..={})", protocol::MAX_CHUNK)]
    InvalidLength(usize),

    #[error("invalid erase page count {0} (must be 1..={})", protocol::MAX_ERASE_PAGES)]
    InvalidPageCount(usize),

    #[error("attempted to send an empty frame")]
    EmptyFrame,

    #[error("range of {size} bytes at 0x{address:08x} exceeds the address space")]
    AddressOverflow { address: u32, size: usize },

    #[error("verify failed at 0x{address:08x} (expected 0x{expected:02x}, read 0x{actual:02x})")]
    VerifyMismatch { address: u32, expected: u8, actual: u8 },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Skip the bootloader synchronisation (device already initialised)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub skip_init: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="500"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for erase completion
    #[cfg_attr(feature = "structopt", structopt(long, default_value="30000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            skip_init: false,
            response_timeout_ms: 500,
            erase_timeout_ms: 30_000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
        }
    }
}
