use crate::bootloader_info::Version;
use std::result::Result as StdResult;
use thiserror::Error;

/// Errors which can occur while talking to the bootloader or preparing an image for it.
#[derive(Debug, Error)]
pub enum Error {
    /// No device with the bootloader's vendor and product ID is attached.
    #[error("No bootloader found")]
    TargetNotFound,

    /// The device is enumerated but did not answer the probe. This happens while it resets; the
    /// connection should simply be retried.
    #[error("Bootloader is not ready: {0}")]
    Busy(rusb::Error),

    /// The bootloader reports a firmware version this crate does not know how to talk to.
    #[error("Unsupported bootloader version {0}")]
    UnsupportedVersion(Version),

    /// The device dropped off the bus while erasing. Expected on some hosts, the session has to be
    /// reopened.
    #[error("Connection lost during erase: {0}")]
    Disconnected(rusb::Error),

    /// No device answered within the configured connect timeout.
    #[error("Timed out waiting for a bootloader")]
    ConnectTimeout,

    /// A control transfer transferred fewer bytes than requested.
    #[error("Short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    /// The bootloader's probe answer does not make sense.
    #[error("Malformed bootloader response: {0}")]
    MalformedResponse(&'static str),

    /// An Intel HEX record could not be decoded.
    #[error("Malformed Intel HEX record on line {line}: {reason}")]
    Parse { line: usize, reason: &'static str },

    /// An Intel HEX record type other than data or end-of-file.
    #[error("Unsupported Intel HEX record type {record_type:#04x} on line {line}")]
    UnsupportedRecord { line: usize, record_type: u8 },

    /// The input did not contain any bytes to program.
    #[error("Input is empty")]
    EmptyImage,

    /// The input does not fit into the application flash.
    #[error("Input is too large ({size} > {flash_size} bytes)")]
    ImageTooLarge { size: usize, flash_size: usize },

    /// The program's reset vector is not a jump, so the bootloader can not be chained in front of
    /// it.
    #[error("Reset vector {0:#06x} is not a branch instruction, the bootloader can not be inserted")]
    UnpatchableProgram(u16),

    /// Any other error of the USB transport. Fatal.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Reading the input failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether polling for the device again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TargetNotFound | Error::Busy(_))
    }
}

/// Transport errors which mean the device has left the bus rather than rejected a request.
pub(crate) fn is_disconnect(error: rusb::Error) -> bool {
    matches!(
        error,
        rusb::Error::Pipe | rusb::Error::NoDevice | rusb::Error::Timeout | rusb::Error::Io
    )
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
