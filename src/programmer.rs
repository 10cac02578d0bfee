//! Framing and transport for the USART bootloader protocol

use core::convert::TryFrom;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::*;
use crate::{Error, Options, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Connected, bootloader not yet synchronised
    Init,
    /// Bootloader synchronised and accepting commands
    Ready,
}

/// Low-level bootloader programmer.
///
/// Each method maps to a single bootloader command, every transmitted frame
/// must be acknowledged before the next is sent.
pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self{state: State::Init, options, port, delay, _err: PhantomData}
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the underlying port
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Reset the device (using DTR and RTS) then synchronise with the bootloader
    pub fn init(&mut self) -> Result<(), Error<E>> {
        // First, reset device
        if !self.options.no_reset {
            self.reset()?;
        }

        debug!("Sending discovery character");

        // Then, send discovery character
        block!(self.port.write(UART_DISC))?;
        block!(self.port.flush())?;

        // Wait for a response
        debug!("Awaiting bootloader response");
        self.await_ack()?;

        self.state = State::Ready;

        Ok(())
    }

    /// Mark the bootloader as synchronised without sending the discovery character
    pub fn skip_init(&mut self) {
        self.state = State::Ready;
    }

    /// Pulse DTR and RTS to reset the device
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Send a frame built from the provided body segments, and await an ACK
    pub fn send_frame(&mut self, parts: &[&[u8]]) -> Result<(), Error<E>> {
        self.send_frame_timeout(parts, self.options.response_timeout_ms)
    }

    fn send_frame_timeout(&mut self, parts: &[&[u8]], timeout_ms: u32) -> Result<(), Error<E>> {
        let frame = Frame::new(parts).ok_or(Error::<E>::EmptyFrame)?;
        self.write_frame(&frame)?;
        self.await_ack_timeout(timeout_ms)
    }

    /// Send a single command byte (with complement checksum), and await an ACK
    pub fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command: {:?}", command);
        self.send_frame(&[&[command.opcode()]])
    }

    fn send_address(&mut self, address: u32) -> Result<(), Error<E>> {
        debug!("Sending address: 0x{:08x}", address);
        self.write_frame(&Frame::address(address))?;
        self.await_ack()
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        let data = frame.as_bytes();

        if data.len() > 10 {
            trace!("Write frame (length {})", data.len());
        } else {
            trace!("Write frame: {}", hex::encode(data));
        }

        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Await an ACK using the default response timeout
    pub fn await_ack(&mut self) -> Result<(), Error<E>> {
        self.await_ack_timeout(self.options.response_timeout_ms)
    }

    fn await_ack_timeout(&mut self, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.read_byte(timeout_ms)? {
            UART_ACK => {
                debug!("Received bootloader ack");
                Ok(())
            },
            UART_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            },
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
        }
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        let mut t: u32 = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t = t.saturating_add(self.options.poll_delay_ms.max(1));

            if t >= timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout)
            }
        }
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        let timeout = self.options.response_timeout_ms;
        for d in data.iter_mut() {
            *d = self.read_byte(timeout)?;
        }
        Ok(())
    }

    /// Fetch the bootloader version and supported commands
    pub fn get(&mut self) -> Result<Capabilities, Error<E>> {
        self.send_command(Command::Get)?;

        let mut header = [0u8; 2];
        self.read_exact(&mut header)?;
        let (count, version) = (header[0], header[1]);
        debug!("Bootloader version: 0x{:02x}", version);

        let mut opcodes = vec![0u8; count as usize];
        self.read_exact(&mut opcodes)?;
        debug!("Supported commands: {:02x?}", opcodes);

        let commands = opcodes.iter()
            .map(|o| Command::try_from(*o).map_err(Error::UnknownCommand))
            .collect::<Result<Vec<_>, Error<E>>>()?;

        self.await_ack()?;

        Ok(Capabilities::new(version, &commands))
    }

    /// Fetch the bootloader version and read protection status
    pub fn get_version_read_status(&mut self) -> Result<ProtectionStatus, Error<E>> {
        self.send_command(Command::GetVersionReadStatus)?;

        let mut resp = [0u8; 3];
        self.read_exact(&mut resp)?;
        debug!("Version: 0x{:02x} status: 0x{:02x} counter: 0x{:02x}", resp[0], resp[1], resp[2]);

        self.await_ack()?;

        Ok(ProtectionStatus{ version: resp[0], status: resp[1], counter: resp[2] })
    }

    /// Fetch the chip product ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        self.send_command(Command::GetId)?;

        let mut n = [0u8; 1];
        self.read_exact(&mut n)?;

        let mut id = vec![0u8; n[0] as usize + 1];
        self.read_exact(&mut id)?;
        debug!("Chip ID: {}", hex::encode(&id));

        self.await_ack()?;

        if id.len() > 2 {
            return Err(Error::InvalidChipId(id.len()));
        }

        Ok(id.iter().fold(0u16, |acc, b| acc << 8 | *b as u16))
    }

    /// Read up to 256 bytes of memory into the provided buffer
    pub fn read_mem(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(data.len()));
        }

        self.send_command(Command::ReadMemory)?;
        self.send_address(address)?;

        debug!("Reading {} bytes", data.len());
        self.send_frame(&[&[(data.len() - 1) as u8]])?;

        // The data itself is the response, no trailing ACK
        self.read_exact(data)
    }

    /// Write up to 256 bytes of memory
    pub fn write_mem(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(data.len()));
        }

        self.send_command(Command::WriteMemory)?;
        self.send_address(address)?;

        debug!("Writing {} bytes", data.len());
        self.send_frame(&[&[(data.len() - 1) as u8], data])
    }

    /// Jump to the application at the provided address.
    ///
    /// The bootloader does not respond once the address is acknowledged.
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.send_command(Command::Go)?;
        self.send_address(address)
    }

    /// Erase the provided flash pages, or all pages if `None`
    pub fn erase(&mut self, pages: Option<&[u8]>) -> Result<(), Error<E>> {
        if let Some(p) = pages {
            if p.is_empty() || p.len() > MAX_ERASE_PAGES {
                return Err(Error::InvalidPageCount(p.len()));
            }
        }

        self.send_command(Command::Erase)?;

        let timeout = self.options.erase_timeout_ms;

        match pages {
            None => {
                debug!("Erasing all pages");
                self.send_frame_timeout(&[&[ERASE_ALL]], timeout)
            },
            Some(p) => {
                if p.len() > 10 {
                    debug!("Erasing {} pages", p.len());
                } else {
                    debug!("Erasing pages: {:?}", p);
                }
                self.send_frame_timeout(&[&[(p.len() - 1) as u8], p], timeout)
            }
        }
    }

    /// Enable readout protection, the device resets on completion
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.send_command(Command::ReadoutProtect)?;
        self.await_ack()
    }

    /// Disable readout protection, this mass erases the flash and resets the device
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        self.send_command(Command::ReadoutUnprotect)?;
        self.await_ack_timeout(self.options.erase_timeout_ms)
    }

    /// Disable write protection for all sectors, the device resets on completion
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        self.send_command(Command::WriteUnprotect)?;
        self.await_ack()
    }

    pub fn write_protect(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented(Command::WriteProtect))
    }

    pub fn extended_erase(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented(Command::ExtendedErase))
    }

    pub fn special(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented(Command::Special))
    }

    pub fn extended_special(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented(Command::ExtendedSpecial))
    }

    pub fn get_checksum(&mut self) -> Result<u32, Error<E>> {
        Err(Error::NotImplemented(Command::GetChecksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{programmer, CountingDelay, MockError, MockPort};

    #[test]
    fn init_sends_discovery() {
        let mut p = programmer(&[UART_ACK]);
        assert_eq!(p.state(), State::Init);

        p.init().unwrap();

        assert_eq!(p.state(), State::Ready);
        assert_eq!(p.port().tx, vec![UART_DISC]);
        assert_eq!(p.port().dtr, vec![true, false]);
        assert_eq!(p.port().rts, vec![true, false]);
    }

    #[test]
    fn init_nack() {
        let mut p = programmer(&[UART_NACK]);
        assert_eq!(p.init(), Err(Error::Nack));
        assert_eq!(p.state(), State::Init);
    }

    #[test]
    fn init_timeout() {
        let mut p = programmer(&[]);
        assert_eq!(p.init(), Err(Error::ResponseTimeout));
    }

    #[test]
    fn ack_handling() {
        let mut p = programmer(&[UART_ACK, UART_NACK, 0x42]);

        assert_eq!(p.await_ack(), Ok(()));
        assert_eq!(p.await_ack(), Err(Error::Nack));
        assert_eq!(p.await_ack(), Err(Error::InvalidResponse(0x42)));
        assert_eq!(p.await_ack(), Err(Error::ResponseTimeout));
    }

    #[test]
    fn timeout_counts_poll_periods() {
        let opts = Options{ response_timeout_ms: 10, poll_delay_ms: 1, ..Default::default() };
        let mut p = Programmer::new(MockPort::new(&[]), CountingDelay::default(), opts);

        assert_eq!(p.await_ack(), Err(Error::ResponseTimeout));

        let (_, delay) = p.into_inner();
        assert_eq!(delay.total_ms, 10);
    }

    #[test]
    fn timeout_saturates() {
        let opts = Options{
            response_timeout_ms: u32::MAX,
            poll_delay_ms: u32::MAX,
            ..Default::default()
        };
        let mut p = Programmer::new(MockPort::new(&[]), CountingDelay::default(), opts);

        assert_eq!(p.await_ack(), Err(Error::ResponseTimeout));

        let opts = Options{ response_timeout_ms: u32::MAX - 1, poll_delay_ms: 3, ..Default::default() };
        let mut p = Programmer::new(MockPort::new(&[]), CountingDelay::default(), opts);
        p.port_mut().rx.extend(&[UART_ACK]);
        assert_eq!(p.await_ack(), Ok(()));
    }

    #[test]
    fn serial_errors_propagate() {
        let mut p = programmer(&[UART_ACK]);
        p.port_mut().fail_write = true;

        assert_eq!(p.send_command(Command::Get), Err(Error::Serial(MockError)));

        let mut p = programmer(&[]);
        p.port_mut().fail_read = true;
        assert_eq!(p.await_ack(), Err(Error::Serial(MockError)));
    }

    #[test]
    fn empty_frame() {
        let mut p = programmer(&[]);
        assert_eq!(p.send_frame(&[]), Err(Error::EmptyFrame));
        assert!(p.port().tx.is_empty());
    }

    #[test]
    fn get_commands() {
        let mut p = programmer(&[UART_ACK, 3, 0x31, 0x00, 0x11, 0x44, UART_ACK]);

        let c = p.get().unwrap();

        assert_eq!(p.port().tx, vec![0x00, 0xFF]);
        assert_eq!(c.version, 0x31);
        assert_eq!(c.commands(), &[Command::Get, Command::ReadMemory, Command::ExtendedErase]);
    }

    #[test]
    fn get_commands_unknown_opcode() {
        let mut p = programmer(&[UART_ACK, 2, 0x31, 0x00, 0x99, UART_ACK]);
        assert_eq!(p.get(), Err(Error::UnknownCommand(0x99)));
    }

    #[test]
    fn get_version_read_status() {
        let mut p = programmer(&[UART_ACK, 0x22, 0x00, 0x00, UART_ACK]);

        let s = p.get_version_read_status().unwrap();

        assert_eq!(p.port().tx, vec![0x01, 0xFE]);
        assert_eq!(s, ProtectionStatus{ version: 0x22, status: 0, counter: 0 });
    }

    #[test]
    fn chip_id() {
        let mut p = programmer(&[UART_ACK, 1, 0x04, 0x10, UART_ACK]);

        assert_eq!(p.chip_id(), Ok(0x0410));
        assert_eq!(p.port().tx, vec![0x02, 0xFD]);
    }

    #[test]
    fn chip_id_too_long() {
        let mut p = programmer(&[UART_ACK, 2, 0x04, 0x10, 0x00, UART_ACK]);

        assert_eq!(p.chip_id(), Err(Error::InvalidChipId(3)));
        // The trailing ACK is consumed, leaving the link in sync
        assert!(p.port().rx.is_empty());
    }

    #[test]
    fn read_mem() {
        let mut p = programmer(&[UART_ACK, UART_ACK, UART_ACK, 0xde, 0xad, 0xbe, 0xef]);

        let mut buff = [0u8; 4];
        p.read_mem(0x0800_0000, &mut buff).unwrap();

        assert_eq!(buff, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(p.port().tx, vec![
            0x11, 0xEE,
            0x08, 0x00, 0x00, 0x00, 0x08,
            0x03, 0xFC,
        ]);
    }

    #[test]
    fn read_mem_bounds() {
        let mut p = programmer(&[]);

        let mut buff = [0u8; MAX_CHUNK + 1];
        assert_eq!(p.read_mem(0, &mut buff), Err(Error::InvalidLength(MAX_CHUNK + 1)));
        assert_eq!(p.read_mem(0, &mut []), Err(Error::InvalidLength(0)));
        assert!(p.port().tx.is_empty());
    }

    #[test]
    fn read_mem_nack_address() {
        let mut p = programmer(&[UART_ACK, UART_NACK]);

        let mut buff = [0u8; 4];
        assert_eq!(p.read_mem(0x0800_0000, &mut buff), Err(Error::Nack));
        // No length frame is sent after the rejected address
        assert_eq!(p.port().tx.len(), 2 + 5);
    }

    #[test]
    fn write_mem() {
        let mut p = programmer(&[UART_ACK, UART_ACK, UART_ACK]);

        p.write_mem(0x2000_0000, &[0x01, 0x02, 0x04]).unwrap();

        assert_eq!(p.port().tx, vec![
            0x31, 0xCE,
            0x20, 0x00, 0x00, 0x00, 0x20,
            0x02, 0x01, 0x02, 0x04, 0x05,
        ]);
    }

    #[test]
    fn write_mem_bounds() {
        let mut p = programmer(&[]);
        assert_eq!(p.write_mem(0, &[]), Err(Error::InvalidLength(0)));
        assert_eq!(p.write_mem(0, &[0u8; 257]), Err(Error::InvalidLength(257)));
        assert!(p.port().tx.is_empty());
    }

    #[test]
    fn go() {
        let mut p = programmer(&[UART_ACK, UART_ACK]);

        p.go(0x0800_0000).unwrap();

        assert_eq!(p.port().tx, vec![0x21, 0xDE, 0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn erase_all() {
        let mut p = programmer(&[UART_ACK, UART_ACK]);

        p.erase(None).unwrap();

        assert_eq!(p.port().tx, vec![0x43, 0xBC, 0xFF, 0x00]);
    }

    #[test]
    fn erase_pages() {
        let mut p = programmer(&[UART_ACK, UART_ACK]);

        p.erase(Some(&[0, 1, 2])).unwrap();

        assert_eq!(p.port().tx, vec![0x43, 0xBC, 0x02, 0x00, 0x01, 0x02, 0x01]);
    }

    #[test]
    fn erase_page_bounds() {
        let mut p = programmer(&[]);

        assert_eq!(p.erase(Some(&[])), Err(Error::InvalidPageCount(0)));
        assert_eq!(p.erase(Some(&[0u8; 256])), Err(Error::InvalidPageCount(256)));
        assert!(p.port().tx.is_empty());
    }

    #[test]
    fn protection_commands() {
        let mut p = programmer(&[UART_ACK, UART_ACK, UART_ACK, UART_ACK, UART_ACK, UART_ACK]);

        p.readout_protect().unwrap();
        p.readout_unprotect().unwrap();
        p.write_unprotect().unwrap();

        assert_eq!(p.port().tx, vec![0x82, 0x7D, 0x92, 0x6D, 0x73, 0x8C]);
    }

    #[test]
    fn unimplemented_commands() {
        let mut p = programmer(&[]);

        assert_eq!(p.write_protect(), Err(Error::NotImplemented(Command::WriteProtect)));
        assert_eq!(p.extended_erase(), Err(Error::NotImplemented(Command::ExtendedErase)));
        assert_eq!(p.special(), Err(Error::NotImplemented(Command::Special)));
        assert_eq!(p.extended_special(), Err(Error::NotImplemented(Command::ExtendedSpecial)));
        assert_eq!(p.get_checksum(), Err(Error::NotImplemented(Command::GetChecksum)));
        assert!(p.port().tx.is_empty());
    }

    #[test]
    fn into_inner_releases_port() {
        let p = programmer(&[0x12]);
        let (port, _delay): (MockPort, _) = p.into_inner();
        assert_eq!(port.rx.len(), 1);
    }
}
