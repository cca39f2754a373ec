use std::iter::StepBy;
use std::ops::Range;

use crate::bootloader_info::BootloaderInfo;
use crate::image::FirmwareImage;
use crate::protocol::Protocol;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xff;

/// A page of the application flash, ready for transmission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page {
    /// Address of the first byte, always a multiple of the page size.
    pub address: usize,

    /// Page contents. Bytes not supplied by the image are erased.
    pub data: Vec<u8>,

    /// Whether the page has to be sent at all.
    pub contains_data: bool,
}

impl Page {
    /// Cuts the page starting at `address` out of `image`.
    ///
    /// Pages past the image are empty and can be skipped, except for the last one: the bootloader
    /// writes its own vector table there and needs to see it written.
    pub fn from_image(
        info: &BootloaderInfo,
        protocol: Protocol,
        image: &FirmwareImage,
        address: usize,
    ) -> Self {
        let length = protocol.page_length(address, info.flash_size, info.page_size);
        let mut data = vec![ERASED; length];

        let image = image.data();
        if address < image.len() {
            let supplied = length.min(image.len() - address);
            data[..supplied].copy_from_slice(&image[address..address + supplied]);
        }

        Page {
            address,
            data,
            contains_data: address < image.len() || info.is_tail_page(address),
        }
    }

    /// Number of bytes in the page.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the page has no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the page contents as pairs of little-endian words. A trailing partial pair is
    /// padded with erased bytes.
    pub fn word_pairs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.data.chunks(4).map(|chunk| {
            let mut quad = [ERASED; 4];
            quad[..chunk.len()].copy_from_slice(chunk);
            (
                u16::from_le_bytes([quad[0], quad[1]]),
                u16::from_le_bytes([quad[2], quad[3]]),
            )
        })
    }
}

/// Start addresses of all pages of the application flash.
pub fn page_addresses(info: &BootloaderInfo) -> StepBy<Range<usize>> {
    (0..info.flash_size).step_by(info.page_size)
}
