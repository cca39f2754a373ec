//! The two incompatible dialects of the bootloader's control-transfer protocol.

use crate::bootloader_info::Version;
use crate::error::{Error, Result};
use crate::flash::Page;
use crate::transport::Transport;
use log::trace;

/// Requests understood by the bootloader. All of them are vendor requests to the device.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command {
    Info = 0,
    WritePage = 1,
    Erase = 2,
    WriteWord = 3,
    Run = 4,
}

/// Protocol dialect, chosen from the major firmware version once at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Pages are sent as a single data stage. The bootloader patches the reset vector itself.
    V1 { minor: u8 },

    /// Pages are sent one word pair per setup packet. The host patches the reset vector.
    V2,
}

impl Protocol {
    /// Returns the dialect spoken by a bootloader version, if it is a known one.
    pub fn from_version(version: Version) -> Option<Self> {
        match version.major {
            1 => Some(Protocol::V1 {
                minor: version.minor,
            }),
            2 => Some(Protocol::V2),
            _ => None,
        }
    }

    /// Length of the answer to the info request.
    pub fn probe_length(self) -> usize {
        match self {
            Protocol::V1 { .. } => 4,
            Protocol::V2 => 6,
        }
    }

    /// Page write time in milliseconds from the timing byte of the info response.
    pub fn write_sleep(self, timing: u8, fast_mode: bool) -> u64 {
        let reported = u64::from(timing & 0x7f);
        match self {
            Protocol::V1 { .. } => reported,
            // v2 firmware reports its timing without any margin
            Protocol::V2 if fast_mode => reported,
            Protocol::V2 => reported + 2,
        }
    }

    /// Erase time in milliseconds for the whole application flash.
    pub fn erase_sleep(self, write_sleep: u64, page_count: usize, timing: u8) -> u64 {
        let sleep = write_sleep * page_count as u64;
        match self {
            // Bit 7 flags chips erasing four pages at once
            Protocol::V2 if timing & 0x80 != 0 => sleep / 4,
            _ => sleep,
        }
    }

    /// MCU signature bytes, as far as the dialect reports them.
    pub fn signature(self, response: &[u8]) -> u16 {
        match self {
            Protocol::V1 { .. } => 0,
            Protocol::V2 => u16::from_be_bytes([response[4], response[5]]),
        }
    }

    /// Length of the page starting at `address`.
    ///
    /// Bootloaders up to version 1.2 expect the last page to be cut at the end of the flash. All
    /// others take full pages and drop whatever lies past the flash.
    pub fn page_length(self, address: usize, flash_size: usize, page_size: usize) -> usize {
        let remainder = flash_size % page_size;
        match self {
            Protocol::V1 { minor }
                if minor <= 2 && remainder != 0 && address + page_size > flash_size =>
            {
                remainder
            }
            _ => page_size,
        }
    }

    /// Whether the host has to redirect the reset vector into the bootloader.
    pub fn relocates_reset_vector(self) -> bool {
        self == Protocol::V2
    }

    /// Transmits a page to the bootloader.
    pub(crate) fn send_page<T: Transport>(self, transport: &mut T, page: &Page) -> Result<()> {
        let length = page.data.len() as u16;
        match self {
            Protocol::V1 { .. } => {
                let written = transport.write_control(
                    Command::WritePage as u8,
                    length,
                    page.address as u16,
                    &page.data,
                )?;
                if written != page.data.len() {
                    return Err(Error::ShortTransfer {
                        expected: page.data.len(),
                        actual: written,
                    });
                }
            }
            Protocol::V2 => {
                transport.write_control(
                    Command::WritePage as u8,
                    length,
                    page.address as u16,
                    &[],
                )?;
                for (word0, word1) in page.word_pairs() {
                    trace!("Word pair {:04x} {:04x}", word0, word1);
                    transport.write_control(Command::WriteWord as u8, word0, word1, &[])?;
                }
            }
        }
        Ok(())
    }
}
