//! The part of a USB host stack the bootloader protocol needs: vendor control transfers to the
//! device.

use crate::TIMEOUT;
use rusb::{DeviceHandle, UsbContext};

/// Vendor-type, device-recipient control transfers to an opened device.
///
/// Errors are reported as raw [`rusb::Error`] codes so callers can tell a vanished device apart
/// from a refused request.
pub trait Transport {
    /// Performs an IN control transfer and returns the number of bytes read into `buffer`.
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
    ) -> rusb::Result<usize>;

    /// Performs an OUT control transfer and returns the number of bytes written from `data`.
    fn write_control(&mut self, request: u8, value: u16, index: u16, data: &[u8])
        -> rusb::Result<usize>;
}

impl<T: UsbContext> Transport for DeviceHandle<T> {
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(
            self,
            rusb::request_type(
                rusb::Direction::In,
                rusb::RequestType::Vendor,
                rusb::Recipient::Device,
            ),
            request,
            value,
            index,
            buffer,
            TIMEOUT,
        )
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(
            self,
            rusb::request_type(
                rusb::Direction::Out,
                rusb::RequestType::Vendor,
                rusb::Recipient::Device,
            ),
            request,
            value,
            index,
            data,
            TIMEOUT,
        )
    }
}
