use crate::bootloader_info::Version;
use crate::error::{is_disconnect, Error, Result};
use crate::transport::Transport;
use crate::{PRODUCT_ID, VENDOR_ID};
use rusb::DeviceHandle;

pub use rusb::UsbContext;

/// Contains necessary information to connect to a target via USB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// USB bus ID the target is connected to.
    pub usb_bus_number: u8,

    /// USB device address of the target.
    pub usb_bus_address: u8,

    /// Bootloader firmware version, from the device descriptor.
    pub version: Version,
}

/// Something bootloaders can be found on and opened from.
pub trait Bus {
    type Transport: Transport;

    /// Lists all attached devices with the bootloader's vendor and product ID.
    fn find_targets(&self) -> Result<Vec<TargetInfo>>;

    /// Opens a device found by [`find_targets`](#tymethod.find_targets).
    fn open(&self, target: &TargetInfo) -> Result<Self::Transport>;
}

/// The host's USB buses.
pub struct Context<T: UsbContext = rusb::Context> {
    pub usb_context: T,
}

impl Context<rusb::Context> {
    pub fn new() -> Result<Self> {
        let usb_context = rusb::Context::new()?;
        Ok(Context { usb_context })
    }
}

impl<T: UsbContext> Bus for Context<T> {
    type Transport = DeviceHandle<T>;

    fn find_targets(&self) -> Result<Vec<TargetInfo>> {
        let mut targets = Vec::new();

        for device in self.usb_context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() == VENDOR_ID && descriptor.product_id() == PRODUCT_ID {
                targets.push(TargetInfo {
                    usb_bus_number: device.bus_number(),
                    usb_bus_address: device.address(),
                    version: descriptor.device_version().into(),
                });
            }
        }

        Ok(targets)
    }

    fn open(&self, target: &TargetInfo) -> Result<Self::Transport> {
        for device in self.usb_context.devices()?.iter() {
            if device.bus_number() == target.usb_bus_number
                && device.address() == target.usb_bus_address
            {
                // The device may have been replaced by something else since it was found
                let descriptor = device.device_descriptor()?;
                if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                    return Err(Error::TargetNotFound);
                }

                return device.open().map_err(|error| {
                    if is_disconnect(error) {
                        Error::Busy(error)
                    } else {
                        Error::Usb(error)
                    }
                });
            }
        }
        Err(Error::TargetNotFound)
    }
}
