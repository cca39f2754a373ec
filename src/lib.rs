//! This crate uploads programs to microcontrollers running the micronucleus USB bootloader. The
//! bootloader is driven entirely through vendor control transfers: the host erases the application
//! flash, writes it page by page and finally lets the bootloader start the application.
//!
//! # Example: Basic upload
//! ```rust, no_run
//! use micronucleus::{Context, Format, FirmwareImage, Operation, TargetHandle};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Parse the program
//! let image = FirmwareImage::from_path("blink.hex", Format::IntelHex)?;
//!
//! // Open the first bootloader on the bus
//! let context = Context::new()?;
//! let mut target_handle = TargetHandle::connect(&context, false)?;
//! println!("{}", target_handle.info());
//!
//! // Erase the application flash
//! target_handle.erase().execute()?;
//!
//! // Program the image into flash and start it
//! target_handle.program(&image)?.execute()?;
//! target_handle.run()?;
//!
//! println!("Done!");
//! # Ok(())
//! # }
//! ```
//!
//! Erasing may make the device drop off the bus for a moment, in which case it has to be connected
//! to again before writing. [`Uploader`] takes care of that and of waiting for the device in the
//! first place.
//!
//! Both erasing and writing can report their progress. See the [`Operation`] trait for details.
//!
//! [`Operation`]: trait.Operation.html
//! [`Uploader`]: struct.Uploader.html

mod bootloader_info;
mod context;
mod error;
mod flash;
mod image;
mod operation;
mod protocol;
mod target_handle;
mod transport;
mod upload;
pub mod vector;

pub use bootloader_info::{BootloaderInfo, Version};
pub use context::{Bus, Context, TargetInfo, UsbContext};
pub use error::{Error, Result};
pub use flash::{page_addresses, Page, ERASED};
pub use image::{ChecksumMismatch, FirmwareImage, Format};
pub use operation::{Erase, Operation, Program, ProgressReporter};
pub use protocol::Protocol;
pub use target_handle::TargetHandle;
pub use transport::Transport;
pub use upload::{wait_for_target, UploadOptions, Uploader};

/// USB vendor ID of the bootloader.
pub const VENDOR_ID: u16 = 0x16d0;

/// USB product ID of the bootloader.
pub const PRODUCT_ID: u16 = 0x0753;

/// Timeout for all usb transactions.
const TIMEOUT: std::time::Duration = std::time::Duration::from_millis(0xffff);
