//! Contains data structures for information the bootloader reports back to the connecting PC.

use crate::error::{Error, Result};
use crate::protocol::Protocol;
use std::fmt;
use std::time::Duration;

/// Flash geometry and timing read back from the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Bootloader firmware version, taken from the device descriptor.
    pub version: Version,

    /// Size of the flash available for the application (in bytes).
    pub flash_size: usize,

    /// Flash page size (in bytes).
    pub page_size: usize,

    /// Number of pages covering the application flash, the last one possibly partial.
    pub page_count: usize,

    /// Address of the first byte after the last application page. The bootloader lives here.
    pub bootloader_start: usize,

    /// Time the device needs to commit a single page.
    pub write_sleep: Duration,

    /// Time the device needs to erase the whole application flash.
    pub erase_sleep: Duration,

    /// Low bytes of the MCU signature. Always 0 for version 1 bootloaders, which do not report it.
    pub signature: u16,
}

impl BootloaderInfo {
    /// Decodes the answer to the info request.
    ///
    /// `response` has to be exactly as long as [`Protocol::probe_length`] demands.
    pub fn from_response(
        version: Version,
        protocol: Protocol,
        response: &[u8],
        fast_mode: bool,
    ) -> Result<Self> {
        if response.len() < protocol.probe_length() {
            return Err(Error::MalformedResponse("info response too short"));
        }

        let flash_size = usize::from(u16::from_be_bytes([response[0], response[1]]));
        let page_size = usize::from(response[2]);
        if page_size < 4 {
            return Err(Error::MalformedResponse("page size below one flash word pair"));
        }

        let page_count = (flash_size + page_size - 1) / page_size;
        let timing = response[3];
        let write_sleep = protocol.write_sleep(timing, fast_mode);
        let erase_sleep = protocol.erase_sleep(write_sleep, page_count, timing);

        Ok(BootloaderInfo {
            version,
            flash_size,
            page_size,
            page_count,
            bootloader_start: page_count * page_size,
            write_sleep: Duration::from_millis(write_sleep),
            erase_sleep: Duration::from_millis(erase_sleep),
            signature: protocol.signature(response),
        })
    }

    /// Whether the page at `address` belongs to the trailing region which is always written, as
    /// the bootloader places its own vectors there.
    pub fn is_tail_page(&self, address: usize) -> bool {
        address + self.page_size >= self.bootloader_start
    }

    /// Address of the jump into the application, in the last four bytes before the bootloader.
    pub fn user_reset_address(&self) -> usize {
        self.bootloader_start - 4
    }
}

impl fmt::Display for BootloaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device firmware: version {}", self.version)?;
        writeln!(f, "Device signature: 0x1E{:04X}", self.signature)?;
        writeln!(f, "Available space: {} bytes", self.flash_size)?;
        writeln!(f, "Write sleep time: {} ms", self.write_sleep.as_millis())?;
        writeln!(f, "Erase sleep time: {} ms", self.erase_sleep.as_millis())?;
        writeln!(f, "Page count: {}", self.page_count)?;
        write!(f, "Page size: {} bytes", self.page_size)
    }
}

/// Represents a version number as used for the bootloader firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// The major version, selecting the protocol dialect.
    pub major: u8,

    /// The minor version.
    pub minor: u8,
}

impl From<rusb::Version> for Version {
    fn from(version: rusb::Version) -> Self {
        // rusb splits the BCD nibbles into decimal digits, undo that
        let major = ((version.major() / 10) << 4) | (version.major() % 10);
        let minor = (version.minor() << 4) | version.sub_minor();
        Version { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
