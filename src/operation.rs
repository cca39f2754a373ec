use std::iter::StepBy;
use std::ops::Range;
use std::thread;

use log::{debug, warn};

use super::error::{is_disconnect, Error, Result};
use super::flash::{page_addresses, Page};
use super::image::FirmwareImage;
use super::target_handle::TargetHandle;
use super::transport::Transport;
use super::vector;

/// Receives the progress of an operation as a fraction between 0 and 1.
pub trait ProgressReporter {
    fn report(&mut self, progress: f32);
}

impl<F: FnMut(f32)> ProgressReporter for F {
    fn report(&mut self, progress: f32) {
        self(progress)
    }
}

/// A long-running operation on the target. Each step yields the amount of work done so far, out of
/// [`total`](#tymethod.total).
pub trait Operation: Iterator<Item = Result<usize>> {
    fn total(&self) -> usize;

    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }

    /// Runs the operation to its end, reporting the fraction done after every step and a final 1.0
    /// on success.
    fn execute_with_progress<P: ProgressReporter + ?Sized>(
        &mut self,
        reporter: &mut P,
    ) -> Result<()> {
        let total = self.total();
        while let Some(step) = self.next() {
            let done = step?;
            if total > 0 {
                reporter.report(done as f32 / total as f32);
            }
        }
        reporter.report(1.0);
        Ok(())
    }
}

/// Erases the application flash.
///
/// The bootloader is busy for the reported erase time after the request and is unreachable
/// meanwhile. Some hosts see it drop off the bus during that time; this ends the operation with
/// [`Error::Disconnected`] and the target has to be connected to again.
pub struct Erase<'a, T: Transport> {
    handle: &'a mut TargetHandle<T>,
    status: Option<rusb::Result<usize>>,
    steps: usize,
    step: usize,
    done: bool,
}

impl<T: Transport> Operation for Erase<'_, T> {
    fn total(&self) -> usize {
        self.steps
    }

    /// Waits out the erase time in one go.
    fn execute(&mut self) -> Result<()> {
        if self.status.is_none() {
            self.request();
            thread::sleep(self.handle.info().erase_sleep);
            self.step = self.steps;
        }
        for step in self {
            step?;
        }
        Ok(())
    }
}

impl<T: Transport> Iterator for Erase<'_, T> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.request();
        if self.step < self.steps {
            thread::sleep(self.handle.info().erase_sleep / self.steps as u32);
            self.step += 1;
            return Some(Ok(self.step));
        }

        self.done = true;
        self.outcome().err().map(Err)
    }
}

impl<'a, T: Transport> Erase<'a, T> {
    pub(crate) fn new(handle: &'a mut TargetHandle<T>) -> Self {
        let steps = (handle.info().page_count / 4).max(1);
        Self {
            handle,
            status: None,
            steps,
            step: 0,
            done: false,
        }
    }

    fn request(&mut self) {
        if self.status.is_none() {
            debug!("Requesting erase");
            self.status = Some(self.handle.request_erase());
        }
    }

    fn outcome(&self) -> Result<()> {
        match self.status {
            Some(Err(error)) if is_disconnect(error) => {
                warn!("Device disconnected during erase ({})", error);
                Err(Error::Disconnected(error))
            }
            Some(Err(error)) => Err(Error::Usb(error)),
            _ => Ok(()),
        }
    }
}

/// Writes an image page by page, yielding the address of each page processed.
///
/// Bootloaders speaking [`Protocol::V2`](crate::Protocol::V2) expect the host to redirect the
/// reset vector: the first page gets a jump into the bootloader, the last one a jump back to the
/// application's reset target.
pub struct Program<'i, 'a, T: Transport> {
    handle: &'a mut TargetHandle<T>,
    image: &'i FirmwareImage,
    addresses: StepBy<Range<usize>>,
    user_reset: Option<u16>,
    done: bool,
}

impl<T: Transport> Operation for Program<'_, '_, T> {
    fn total(&self) -> usize {
        self.handle.info().flash_size
    }
}

impl<T: Transport> Iterator for Program<'_, '_, T> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let address = match self.addresses.next() {
            Some(address) => address,
            None => {
                self.done = true;
                return None;
            }
        };

        Some(match self.program_page(address) {
            Ok(()) => Ok(address),
            Err(error) => {
                // Ensure that the iterator is fused after an error occurs
                self.done = true;
                Err(error)
            }
        })
    }
}

impl<'i, 'a, T: Transport> Program<'i, 'a, T> {
    pub(crate) fn new(handle: &'a mut TargetHandle<T>, image: &'i FirmwareImage) -> Self {
        let addresses = page_addresses(handle.info());
        Self {
            handle,
            image,
            addresses,
            user_reset: None,
            done: false,
        }
    }

    fn program_page(&mut self, address: usize) -> Result<()> {
        let protocol = self.handle.protocol();
        let mut page = Page::from_image(self.handle.info(), protocol, self.image, address);

        if protocol.relocates_reset_vector() {
            self.relocate(&mut page)?;
        }

        if page.contains_data {
            self.handle.write_page(&page)?;
            thread::sleep(self.handle.info().write_sleep);
        }
        Ok(())
    }

    fn relocate(&mut self, page: &mut Page) -> Result<()> {
        let info = self.handle.info();

        if page.address == 0 {
            let user_reset = vector::relocate_reset(&mut page.data, info.bootloader_start)?;
            debug!("Application reset target is word {:#06x}", user_reset);
            self.user_reset = Some(user_reset);
        }

        if info.is_tail_page(page.address) {
            if let Some(user_reset) = self.user_reset {
                let address = info.user_reset_address();
                let offset = address - page.address;
                vector::insert_user_reset(&mut page.data[offset..], address, user_reset);
            }
        }
        Ok(())
    }
}
