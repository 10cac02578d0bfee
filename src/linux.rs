use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Error, Options, Programmer, SerialPort, Session};

/// Session over a linux serial port
pub type LinuxSession = Session<Serial, Delay, IoErrorKind>;

fn io_kind(e: SerialError) -> IoErrorKind {
    std::io::Error::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    ///
    /// The port is configured for 8 data bits, even parity and one stop bit
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, Error<IoErrorKind>> {
        debug!("Opening serial port: {} @ {} baud", port.as_ref().display(), baud);

        // Open port
        let mut port = Serial::open(port.as_ref())
            .map_err(|e| Error::Io(io_kind(e)))?;

        // Apply settings
        let mut settings = port.0.read_settings()
            .map_err(|e| Error::Io(io_kind(e)))?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))
            .map_err(|e| Error::Io(io_kind(e)))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)
            .map_err(|e| Error::Io(io_kind(e)))?;

        // Reads return WouldBlock immediately, polling is paced by `Delay`
        port.0.set_timeout(Duration::from_millis(0))
            .map_err(|e| Error::Io(io_kind(e)))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

impl LinuxSession {
    /// Open a linux serial port and connect to the bootloader
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, Error<IoErrorKind>> {
        let p = Programmer::linux(port, baud, options)?;
        Session::new(p)
    }
}
