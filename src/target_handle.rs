use crate::bootloader_info::{BootloaderInfo, Version};
use crate::context::Bus;
use crate::error::{Error, Result};
use crate::flash::Page;
use crate::image::FirmwareImage;
use crate::operation::{Erase, Program};
use crate::protocol::{Command, Protocol};
use crate::transport::Transport;
use log::debug;

/// An open session with a bootloader. Dropping it closes the device.
pub struct TargetHandle<T: Transport> {
    /// Transport for the raw communication, exclusively owned by this session.
    transport: T,

    /// Dialect spoken by the bootloader.
    protocol: Protocol,

    /// Flash geometry and timing reported by the bootloader.
    info: BootloaderInfo,
}

impl<T: Transport> TargetHandle<T> {
    /// Connects to the first bootloader on the bus which speaks a supported protocol.
    ///
    /// Fails with [`Error::TargetNotFound`] if there is none, with [`Error::Busy`] if it did not
    /// answer yet and with [`Error::UnsupportedVersion`] if only unknown bootloaders are attached.
    /// Devices which cannot be opened are skipped; if no other one works, the last open error is
    /// returned.
    pub fn connect<B: Bus<Transport = T>>(bus: &B, fast_mode: bool) -> Result<Self> {
        let mut unsupported = None;
        let mut open_failure = None;

        for target in bus.find_targets()? {
            if Protocol::from_version(target.version).is_none() {
                debug!(
                    "Skipping bootloader with unknown version {} at {:03}:{:03}",
                    target.version, target.usb_bus_number, target.usb_bus_address
                );
                unsupported = Some(target.version);
                continue;
            }

            match bus.open(&target) {
                Ok(transport) => return Self::open(transport, target.version, fast_mode),
                Err(error) => {
                    debug!(
                        "Cannot open bootloader at {:03}:{:03}: {}",
                        target.usb_bus_number, target.usb_bus_address, error
                    );
                    open_failure = Some(error);
                }
            }
        }

        if let Some(error) = open_failure {
            return Err(error);
        }
        Err(match unsupported {
            Some(version) => Error::UnsupportedVersion(version),
            None => Error::TargetNotFound,
        })
    }

    /// Probes the bootloader behind an opened transport.
    pub fn open(mut transport: T, version: Version, fast_mode: bool) -> Result<Self> {
        let protocol =
            Protocol::from_version(version).ok_or(Error::UnsupportedVersion(version))?;

        let mut response = [0u8; 6];
        let response = &mut response[..protocol.probe_length()];
        let read = transport
            .read_control(Command::Info as u8, 0, 0, response)
            .map_err(Error::Busy)?;

        let info = BootloaderInfo::from_response(version, protocol, &response[..read], fast_mode)?;
        debug!(
            "Connected to bootloader {}: {} bytes in {} pages",
            version, info.flash_size, info.page_count
        );

        Ok(TargetHandle {
            transport,
            protocol,
            info,
        })
    }

    /// Information the bootloader reported when connecting.
    pub fn info(&self) -> &BootloaderInfo {
        &self.info
    }

    /// Protocol dialect used with this bootloader.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Erases the whole application flash. See [`Erase`] for the outcome.
    pub fn erase(&mut self) -> Erase<'_, T> {
        Erase::new(self)
    }

    /// Programs an image into the erased application flash.
    ///
    /// Fails before anything is sent if the image does not fit.
    pub fn program<'i>(&mut self, image: &'i FirmwareImage) -> Result<Program<'i, '_, T>> {
        image.check_size(self.info.flash_size)?;
        Ok(Program::new(self, image))
    }

    /// Lets the bootloader start the application.
    pub fn run(&mut self) -> Result<()> {
        self.transport
            .write_control(Command::Run as u8, 0, 0, &[])
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Sends the erase request. The raw transport result is needed to tell a disconnect apart.
    pub(crate) fn request_erase(&mut self) -> rusb::Result<usize> {
        self.transport.write_control(Command::Erase as u8, 0, 0, &[])
    }

    /// Sends a single page.
    pub(crate) fn write_page(&mut self, page: &Page) -> Result<()> {
        debug!("Writing {} bytes at {:#06x}", page.len(), page.address);
        self.protocol.send_page(&mut self.transport, page)
    }
}
