//! Wire level definitions for the USART bootloader protocol (AN3155)

use core::convert::TryFrom;

use crate::Error;

/// Discovery (wake) character, sent once to synchronise the bootloader
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write command
pub const MAX_CHUNK: usize = 256;

/// Maximum number of pages in a single erase command
pub const MAX_ERASE_PAGES: usize = 255;

/// Erase page count sentinel for a global (mass) erase
pub const ERASE_ALL: u8 = 0xFF;

/// Location of the 96-bit device unique identifier
pub const UNIQUE_ID_ADDR: u32 = 0x1FFF_F7E8;
pub const UNIQUE_ID_LEN: usize = 12;

/// Location of the flash size register (u16 LE, in KiB)
pub const FLASH_SIZE_ADDR: u32 = 0x1FFF_F7E0;

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Generic command for device specific features
    Special = 0x50,

    /// Generic command for device specific features with extended payloads
    ExtendedSpecial = 0x51,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,

    /// Computes a CRC over a memory area
    GetChecksum = 0xA1,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Get,
        Command::GetVersionReadStatus,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::ExtendedErase,
        Command::Special,
        Command::ExtendedSpecial,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
        Command::GetChecksum,
    ];

    /// Wire opcode for the command
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Command::ALL.iter().copied().find(|c| c.opcode() == v).ok_or(v)
    }
}

/// Compute the checksum for a frame body.
///
/// This is the XOR of all body bytes, except for single byte bodies where
/// the complement of the byte is used. Returns `None` for an empty body.
pub fn checksum(body: &[u8]) -> Option<u8> {
    match body {
        [] => None,
        [b] => Some(!b),
        _ => Some(body.iter().fold(0, |acc, b| acc ^ b)),
    }
}

/// A checksummed unit of transmission
#[derive(Clone, PartialEq, Debug)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Build a frame from one or more body segments, appending the checksum
    pub fn new(parts: &[&[u8]]) -> Option<Self> {
        let len = parts.iter().map(|p| p.len()).sum::<usize>();

        let mut buff = Vec::with_capacity(len + 1);
        for p in parts {
            buff.extend_from_slice(p);
        }

        let crc = checksum(&buff)?;
        buff.push(crc);

        Some(Self(buff))
    }

    /// Frame carrying a 4-byte big-endian address
    pub fn address(addr: u32) -> Self {
        let a = addr.to_be_bytes();
        Self(vec![a[0], a[1], a[2], a[3], a.iter().fold(0, |acc, b| acc ^ b)])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Read / write protection changes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Protection {
    ProtectRead,
    UnprotectRead,
    ProtectWrite,
    UnprotectWrite,
}

impl Protection {
    /// Bootloader command implementing the protection change
    pub fn command(self) -> Command {
        match self {
            Protection::ProtectRead => Command::ReadoutProtect,
            Protection::UnprotectRead => Command::ReadoutUnprotect,
            Protection::ProtectWrite => Command::WriteProtect,
            Protection::UnprotectWrite => Command::WriteUnprotect,
        }
    }
}

/// Commands advertised by the bootloader, fetched once on connection
#[derive(Clone, PartialEq, Debug)]
pub struct Capabilities {
    /// Bootloader protocol version
    pub version: u8,
    commands: Vec<Command>,
}

impl Capabilities {
    pub fn new(version: u8, commands: &[Command]) -> Self {
        let mut commands = commands.to_vec();
        commands.sort();
        commands.dedup();

        Self { version, commands }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn supports(&self, command: Command) -> bool {
        self.commands.binary_search(&command).is_ok()
    }

    /// Fail with [`Error::Unsupported`] unless the command was advertised
    pub fn require<E>(&self, command: Command) -> Result<(), Error<E>> {
        if self.supports(command) {
            Ok(())
        } else {
            Err(Error::Unsupported(command))
        }
    }
}

/// Response to [`Command::GetVersionReadStatus`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ProtectionStatus {
    pub version: u8,
    pub status: u8,
    pub counter: u8,
}

/// Device information, collected from the chip id and system memory
#[derive(Clone, PartialEq, Debug)]
pub struct DeviceInfo {
    /// Bootloader protocol version
    pub version: u8,
    pub chip_id: u16,
    /// 96-bit unique device identifier
    pub unique_id: [u8; UNIQUE_ID_LEN],
    /// Flash size in bytes
    pub flash_size: u32,
}
