//! Loading of firmware images from Intel HEX or raw binary input.

use crate::error::{Error, Result};
use crate::flash::ERASED;
use log::{debug, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

const RECORD_DATA: u8 = 0x00;
const RECORD_END_OF_FILE: u8 = 0x01;

/// Input formats understood by [`FirmwareImage::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Format {
    /// Intel HEX records
    IntelHex,
    /// Raw bytes, programmed from address 0
    Raw,
}

/// An Intel HEX record whose checksum did not match. Loading carries on regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// Line of the record in the input, starting at 1.
    pub line: usize,

    /// Load address of the record.
    pub address: u16,
}

/// A program image, addressed from 0.
///
/// Only `min_address..max_address` was supplied by the input. Gaps read as erased flash.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    min_address: usize,
    max_address: usize,
    checksum_warnings: Vec<ChecksumMismatch>,
}

impl FirmwareImage {
    /// Reads an image from a stream. Fails if the input is malformed or contains no data.
    pub fn load<R: Read>(input: R, format: Format) -> Result<Self> {
        let image = match format {
            Format::IntelHex => Self::load_hex(BufReader::new(input))?,
            Format::Raw => Self::load_raw(input)?,
        };

        if image.min_address == image.max_address {
            return Err(Error::EmptyImage);
        }

        debug!(
            "Loaded image covering {:#06x}..{:#06x}",
            image.min_address, image.max_address
        );
        Ok(image)
    }

    /// Reads an image from a file.
    pub fn from_path<P: AsRef<Path>>(path: P, format: Format) -> Result<Self> {
        Self::load(File::open(path)?, format)
    }

    /// Creates an image from bytes meant to be programmed starting at address 0.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::load(data, Format::Raw)
    }

    fn load_raw<R: Read>(mut input: R) -> Result<Self> {
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        Ok(FirmwareImage {
            min_address: 0,
            max_address: data.len(),
            data,
            checksum_warnings: Vec::new(),
        })
    }

    fn load_hex<R: BufRead>(input: R) -> Result<Self> {
        let mut image = FirmwareImage {
            data: Vec::new(),
            min_address: 0,
            max_address: 0,
            checksum_warnings: Vec::new(),
        };
        let mut extent: Option<(usize, usize)> = None;
        let mut end_of_file = false;

        for (index, line) in input.lines().enumerate() {
            let line_number = index + 1;
            let line = line?;

            // Anything in front of the start code is ignored
            let record = match line.find(':') {
                Some(start) => line[start + 1..].trim_end(),
                None => continue,
            };
            let bytes = decode_hex(record).ok_or(Error::Parse {
                line: line_number,
                reason: "invalid hex digits",
            })?;

            if bytes.len() < 5 || bytes.len() != 5 + usize::from(bytes[0]) {
                return Err(Error::Parse {
                    line: line_number,
                    reason: "record length does not match byte count",
                });
            }

            let count = usize::from(bytes[0]);
            let address = u16::from_be_bytes([bytes[1], bytes[2]]);
            let record_type = bytes[3];

            if record_type != RECORD_DATA && record_type != RECORD_END_OF_FILE {
                return Err(Error::UnsupportedRecord {
                    line: line_number,
                    record_type,
                });
            }

            // The checksum makes the sum of all bytes of the record zero
            let sum = bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
            if sum != 0 {
                warn!(
                    "Checksum error in record at {:#06x} (line {})",
                    address, line_number
                );
                image.checksum_warnings.push(ChecksumMismatch {
                    line: line_number,
                    address,
                });
            }

            if record_type == RECORD_DATA && count > 0 {
                let start = usize::from(address);
                let end = start + count;
                image.write(start, &bytes[4..4 + count]);
                extent = Some(match extent {
                    Some((min, max)) => (min.min(start), max.max(end)),
                    None => (start, end),
                });
            }

            if record_type == RECORD_END_OF_FILE {
                end_of_file = true;
                break;
            }
        }

        if !end_of_file {
            warn!("Intel HEX input ended without an end-of-file record");
        }

        if let Some((min, max)) = extent {
            image.min_address = min;
            image.max_address = max;
        }
        Ok(image)
    }

    fn write(&mut self, address: usize, bytes: &[u8]) {
        let end = address + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, ERASED);
        }
        self.data[address..end].copy_from_slice(bytes);
    }

    /// First address supplied by the input.
    pub fn min_address(&self) -> usize {
        self.min_address
    }

    /// One past the last address supplied by the input.
    pub fn max_address(&self) -> usize {
        self.max_address
    }

    /// Image contents from address 0 up to [`max_address`](#method.max_address).
    pub fn data(&self) -> &[u8] {
        &self.data[..self.max_address]
    }

    /// Records whose checksums did not add up.
    pub fn checksum_warnings(&self) -> &[ChecksumMismatch] {
        &self.checksum_warnings
    }

    /// Ensures the image fits into an application flash of `flash_size` bytes.
    pub fn check_size(&self, flash_size: usize) -> Result<()> {
        if self.max_address > flash_size {
            Err(Error::ImageTooLarge {
                size: self.max_address,
                flash_size,
            })
        } else {
            Ok(())
        }
    }
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
