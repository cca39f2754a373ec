//! The complete upload sequence: wait for the bootloader, erase, write and start the application.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bootloader_info::BootloaderInfo;
use crate::context::Bus;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::operation::{Operation, ProgressReporter};
use crate::target_handle::TargetHandle;

/// Settings for an upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Start the application once the upload is done.
    pub run: bool,

    /// Use the bootloader's timing without safety margins and skip settle delays.
    pub fast_mode: bool,

    /// Only erase, do not write anything.
    pub erase_only: bool,

    /// Give up waiting for a bootloader after this long. Waits forever if `None`.
    pub timeout: Option<Duration>,

    /// Pause between two attempts to find the bootloader.
    pub poll_interval: Duration,

    /// Pause after the bootloader was found, and before looking for it again after it dropped off
    /// the bus.
    pub settle_delay: Duration,

    /// How long reconnecting after an erase may take before the user is asked to replug the
    /// device.
    pub reconnect_grace: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            run: false,
            fast_mode: false,
            erase_only: false,
            timeout: None,
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(250),
            reconnect_grace: Duration::from_secs(5),
        }
    }
}

/// Polls the bus until a supported bootloader answers, or the timeout in `options` passes.
pub fn wait_for_target<B: Bus>(
    bus: &B,
    options: &UploadOptions,
) -> Result<TargetHandle<B::Transport>> {
    let start = Instant::now();
    let mut unsupported_reported = false;
    let mut failure_reported = false;

    loop {
        match TargetHandle::connect(bus, options.fast_mode) {
            Ok(handle) => return Ok(handle),
            Err(Error::UnsupportedVersion(version)) => {
                if !unsupported_reported {
                    warn!(
                        "Found a bootloader with unknown version {}. Updates of this tool may be \
                         available.",
                        version
                    );
                    unsupported_reported = true;
                }
            }
            Err(error) if error.is_retryable() => {}
            Err(error) if !failure_reported => {
                warn!("Cannot connect to the bootloader: {}", error);
                failure_reported = true;
            }
            Err(error) => debug!("Connecting failed: {}", error),
        }

        if let Some(timeout) = options.timeout {
            if start.elapsed() >= timeout {
                return Err(Error::ConnectTimeout);
            }
        }
        thread::sleep(options.poll_interval);
    }
}

/// Drives an upload through a connected bootloader.
///
/// # Example
/// ```rust, no_run
/// use micronucleus::{Context, Format, FirmwareImage, UploadOptions, Uploader};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let image = FirmwareImage::from_path("blink.hex", Format::IntelHex)?;
/// let context = Context::new()?;
/// let options = UploadOptions {
///     run: true,
///     ..UploadOptions::default()
/// };
///
/// let mut uploader = Uploader::connect(&context, options)?;
/// println!("{}", uploader.info());
/// uploader.upload(Some(&image))?;
/// # Ok(())
/// # }
/// ```
pub struct Uploader<'b, B: Bus> {
    bus: &'b B,
    options: UploadOptions,
    info: BootloaderInfo,

    /// `None` after the device dropped off the bus and was not looked for again.
    handle: Option<TargetHandle<B::Transport>>,

    progress: Option<Box<dyn ProgressReporter + 'b>>,
}

impl<'b, B: Bus> Uploader<'b, B> {
    /// Waits for a bootloader to show up on `bus` and connects to it.
    pub fn connect(bus: &'b B, options: UploadOptions) -> Result<Self> {
        let handle = wait_for_target(bus, &options)?;
        if !options.fast_mode {
            thread::sleep(options.settle_delay);
        }

        Ok(Uploader {
            bus,
            info: handle.info().clone(),
            handle: Some(handle),
            options,
            progress: None,
        })
    }

    /// Information reported by the bootloader.
    pub fn info(&self) -> &BootloaderInfo {
        &self.info
    }

    /// Sets the receiver of the progress of subsequent erase and write operations.
    pub fn set_progress<P: ProgressReporter + 'b>(&mut self, reporter: P) {
        self.progress = Some(Box::new(reporter));
    }

    /// Runs the whole sequence: erase, write `image` unless erasing only, and start the
    /// application if requested.
    ///
    /// The image is checked against the flash size before the device is touched.
    pub fn upload(&mut self, image: Option<&FirmwareImage>) -> Result<()> {
        let image = if self.options.erase_only { None } else { image };
        if let Some(image) = image {
            image.check_size(self.info.flash_size)?;
        }

        self.erase()?;
        if let Some(image) = image {
            self.write(image)?;
        }
        if self.options.run {
            self.run()?;
        }
        Ok(())
    }

    /// Erases the application flash.
    ///
    /// If the device disconnects meanwhile it is waited for again, for as long as it takes. This
    /// is skipped if nothing is left to do afterwards.
    pub fn erase(&mut self) -> Result<()> {
        info!("Erasing {} pages", self.info.page_count);

        let handle = self.handle.as_mut().ok_or(Error::TargetNotFound)?;
        let mut erase = handle.erase();
        let result = match self.progress.as_deref_mut() {
            Some(reporter) => erase.execute_with_progress(reporter),
            None => erase.execute(),
        };

        match result {
            Err(Error::Disconnected(_)) => {
                // Close the stale handle first
                self.handle = None;
                if !self.options.erase_only || self.options.run {
                    self.reconnect();
                }
                Ok(())
            }
            result => result,
        }
    }

    /// Writes an image into the erased flash.
    pub fn write(&mut self, image: &FirmwareImage) -> Result<()> {
        info!("Writing {} bytes", image.max_address());

        let handle = self.handle.as_mut().ok_or(Error::TargetNotFound)?;
        let mut program = handle.program(image)?;
        match self.progress.as_deref_mut() {
            Some(reporter) => program.execute_with_progress(reporter),
            None => program.execute(),
        }
    }

    /// Starts the application.
    pub fn run(&mut self) -> Result<()> {
        info!("Starting the application");
        self.handle.as_mut().ok_or(Error::TargetNotFound)?.run()
    }

    fn reconnect(&mut self) {
        info!("Connection to device lost during erase, reconnecting");
        thread::sleep(self.options.settle_delay);

        let start = Instant::now();
        let mut grace_expired = false;
        loop {
            match TargetHandle::connect(self.bus, self.options.fast_mode) {
                Ok(handle) => {
                    debug!("Reconnected after {:?}", start.elapsed());
                    self.info = handle.info().clone();
                    self.handle = Some(handle);
                    return;
                }
                Err(error) => debug!("Reconnecting failed: {}", error),
            }

            if !grace_expired && start.elapsed() >= self.options.reconnect_grace {
                warn!(
                    "Automatic reconnect timed out. Please unplug the device and reconnect it \
                     manually."
                );
                grace_expired = true;
            }
            thread::sleep(self.options.poll_interval);
        }
    }
}
