//! Device session, capability-checked and chunked bootloader operations

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::*;
use crate::{Error, Programmer, Progress, SerialPort};

/// Operations available via [`Session::run`]
#[derive(Clone, PartialEq, Debug)]
pub enum Operation<'a> {
    /// Read the device information
    Info,
    /// Read the bootloader version and read protection status
    ProtectionStatus,
    Read { address: u32, size: usize },
    Write { address: u32, data: &'a [u8] },
    /// Read back and compare memory contents
    Verify { address: u32, data: &'a [u8] },
    /// Erase the listed pages, or all pages if `None`
    Erase(Option<&'a [u8]>),
    Execute(u32),
    Protection(Protection),
    ExtendedErase,
    Special,
    ExtendedSpecial,
    CheckCrc,
}

impl<'a> Operation<'a> {
    /// Bootloader command required by the operation
    pub fn command(&self) -> Command {
        match self {
            Operation::Info => Command::GetId,
            Operation::ProtectionStatus => Command::GetVersionReadStatus,
            Operation::Read{..} | Operation::Verify{..} => Command::ReadMemory,
            Operation::Write{..} => Command::WriteMemory,
            Operation::Erase(_) => Command::Erase,
            Operation::Execute(_) => Command::Go,
            Operation::Protection(p) => p.command(),
            Operation::ExtendedErase => Command::ExtendedErase,
            Operation::Special => Command::Special,
            Operation::ExtendedSpecial => Command::ExtendedSpecial,
            Operation::CheckCrc => Command::GetChecksum,
        }
    }
}

/// Result of a [`Session::run`] call
#[derive(Clone, PartialEq, Debug)]
pub enum Outcome {
    Done,
    Info(DeviceInfo),
    Status(ProtectionStatus),
    Data(Vec<u8>),
}

/// Connected bootloader session.
///
/// The supported command set is fetched once on connection, and every
/// operation is checked against it before anything is sent to the device.
/// Dropping the session releases the underlying port.
pub struct Session<P, D, E> {
    programmer: Programmer<P, D, E>,
    capabilities: Capabilities,
}

impl <P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Synchronise with the bootloader (unless `skip_init` is set) and fetch
    /// the supported commands.
    ///
    /// On failure the programmer (and port) is dropped.
    pub fn new(mut programmer: Programmer<P, D, E>) -> Result<Self, Error<E>> {
        if programmer.options().skip_init {
            debug!("Skipping bootloader init");
            programmer.skip_init();
        } else {
            programmer.init()?;
        }

        let capabilities = programmer.get()?;

        info!("Bootloader v{}.{} connected", capabilities.version >> 4, capabilities.version & 0x0F);

        Ok(Self{ programmer, capabilities })
    }

    /// Commands supported by the connected bootloader
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Close the session, returning the underlying port
    pub fn close(self) -> (P, D) {
        self.programmer.into_inner()
    }

    fn require(&self, command: Command) -> Result<(), Error<E>> {
        self.capabilities.require::<E>(command)
    }

    /// Execute an operation
    pub fn run(&mut self, op: Operation, progress: Progress) -> Result<Outcome, Error<E>> {
        match op {
            Operation::Info => self.info().map(Outcome::Info),
            Operation::ProtectionStatus => self.protection_status().map(Outcome::Status),
            Operation::Read{ address, size } => self.read(address, size, progress).map(Outcome::Data),
            Operation::Write{ address, data } => self.write(address, data, progress).map(|_| Outcome::Done),
            Operation::Verify{ address, data } => self.verify(address, data, progress).map(|_| Outcome::Done),
            Operation::Erase(pages) => self.erase(pages).map(|_| Outcome::Done),
            Operation::Execute(address) => self.execute(address).map(|_| Outcome::Done),
            Operation::Protection(p) => self.set_protection(p).map(|_| Outcome::Done),
            Operation::ExtendedErase => {
                self.require(Command::ExtendedErase)?;
                self.programmer.extended_erase().map(|_| Outcome::Done)
            },
            Operation::Special => {
                self.require(Command::Special)?;
                self.programmer.special().map(|_| Outcome::Done)
            },
            Operation::ExtendedSpecial => {
                self.require(Command::ExtendedSpecial)?;
                self.programmer.extended_special().map(|_| Outcome::Done)
            },
            Operation::CheckCrc => {
                self.require(Command::GetChecksum)?;
                self.programmer.get_checksum().map(|_| Outcome::Done)
            },
        }
    }

    /// Fetch chip ID, unique ID and flash size
    pub fn info(&mut self) -> Result<DeviceInfo, Error<E>> {
        self.require(Command::GetId)?;
        self.require(Command::ReadMemory)?;

        let chip_id = self.programmer.chip_id()?;

        let mut unique_id = [0u8; UNIQUE_ID_LEN];
        self.programmer.read_mem(UNIQUE_ID_ADDR, &mut unique_id)?;

        let mut flash_size = [0u8; 2];
        self.programmer.read_mem(FLASH_SIZE_ADDR, &mut flash_size)?;

        Ok(DeviceInfo{
            version: self.capabilities.version,
            chip_id,
            unique_id,
            flash_size: u16::from_le_bytes(flash_size) as u32 * 1024,
        })
    }

    pub fn protection_status(&mut self) -> Result<ProtectionStatus, Error<E>> {
        self.require(Command::GetVersionReadStatus)?;
        self.programmer.get_version_read_status()
    }

    /// Read `size` bytes from `address`, in chunks of up to 256 bytes
    pub fn read(&mut self, address: u32, size: usize, mut progress: Progress) -> Result<Vec<u8>, Error<E>> {
        self.require(Command::ReadMemory)?;
        check_range::<E>(address, size)?;

        debug!("Reading {} bytes from 0x{:08x}", size, address);

        let mut data = vec![0u8; size];
        report(&mut progress, 0, size);

        let mut done = 0;
        for chunk in data.chunks_mut(MAX_CHUNK) {
            self.programmer.read_mem(address + done as u32, chunk)?;

            done += chunk.len();
            report(&mut progress, done, size);
        }

        Ok(data)
    }

    /// Write `data` to `address`, in chunks of up to 256 bytes
    pub fn write(&mut self, address: u32, data: &[u8], mut progress: Progress) -> Result<(), Error<E>> {
        self.require(Command::WriteMemory)?;
        check_range::<E>(address, data.len())?;

        debug!("Writing {} bytes to 0x{:08x}", data.len(), address);

        report(&mut progress, 0, data.len());

        let mut done = 0;
        for chunk in data.chunks(MAX_CHUNK) {
            self.programmer.write_mem(address + done as u32, chunk)?;

            done += chunk.len();
            report(&mut progress, done, data.len());
        }

        Ok(())
    }

    /// Compare device memory at `address` against `data`
    pub fn verify(&mut self, address: u32, data: &[u8], mut progress: Progress) -> Result<(), Error<E>> {
        self.require(Command::ReadMemory)?;
        check_range::<E>(address, data.len())?;

        debug!("Verifying {} bytes at 0x{:08x}", data.len(), address);

        report(&mut progress, 0, data.len());

        let mut buff = [0u8; MAX_CHUNK];
        let mut done = 0;
        for expected in data.chunks(MAX_CHUNK) {
            let actual = &mut buff[..expected.len()];
            self.programmer.read_mem(address + done as u32, actual)?;

            if let Some(i) = expected.iter().zip(actual.iter()).position(|(e, a)| e != a) {
                return Err(Error::VerifyMismatch{
                    address: address + (done + i) as u32,
                    expected: expected[i],
                    actual: actual[i],
                });
            }

            done += expected.len();
            report(&mut progress, done, data.len());
        }

        Ok(())
    }

    /// Erase the provided pages, or the whole flash if `None`.
    ///
    /// Pages are sent in the order provided.
    pub fn erase(&mut self, pages: Option<&[u8]>) -> Result<(), Error<E>> {
        self.require(Command::Erase)?;
        self.programmer.erase(pages)
    }

    /// Start execution at the provided address
    pub fn execute(&mut self, address: u32) -> Result<(), Error<E>> {
        self.require(Command::Go)?;
        self.programmer.go(address)
    }

    pub fn set_protection(&mut self, protection: Protection) -> Result<(), Error<E>> {
        self.require(protection.command())?;

        match protection {
            Protection::ProtectRead => self.programmer.readout_protect(),
            Protection::UnprotectRead => self.programmer.readout_unprotect(),
            Protection::ProtectWrite => self.programmer.write_protect(),
            Protection::UnprotectWrite => self.programmer.write_unprotect(),
        }
    }
}

fn report(progress: &mut Progress, done: usize, total: usize) {
    if let Some(p) = progress {
        p(done, total);
    }
}

/// Check a range fits in the 32-bit address space
fn check_range<E>(address: u32, size: usize) -> Result<(), Error<E>> {
    let end = address as u64 + size as u64;
    if size > 0 && end - 1 > u32::MAX as u64 {
        return Err(Error::AddressOverflow{ address, size });
    }
    Ok(())
}
