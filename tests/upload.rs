//! Runs uploads against a scripted bootloader which records every control transfer.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use micronucleus::vector::decode_jump;
use micronucleus::{
    Bus, Error, FirmwareImage, Operation, TargetHandle, TargetInfo, Transport, UploadOptions,
    Uploader, Version,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transfer {
    In {
        request: u8,
        length: usize,
    },
    Out {
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
}

struct State {
    version: Version,
    response: Vec<u8>,
    /// Number of bus scans which will not see the device.
    absent_scans: usize,
    /// Number of probes which will fail.
    busy_probes: usize,
    /// Result of the next erase request, if it fails.
    erase_error: Option<rusb::Error>,
    /// Scans without the device after a failed erase.
    reenumeration_scans: usize,
    /// Devices listed ahead of the bootloader which cannot be opened.
    locked_targets: u8,
    transfers: Vec<Transfer>,
    opened: usize,
    open_handles: usize,
    max_open_handles: usize,
}

const BOOTLOADER_ADDRESS: u8 = 100;

#[derive(Clone)]
struct FakeBus(Rc<RefCell<State>>);

struct FakeTransport(Rc<RefCell<State>>);

impl FakeBus {
    fn new(version: Version, response: &[u8]) -> Self {
        FakeBus(Rc::new(RefCell::new(State {
            version,
            response: response.to_vec(),
            absent_scans: 0,
            busy_probes: 0,
            erase_error: None,
            reenumeration_scans: 0,
            locked_targets: 0,
            transfers: Vec::new(),
            opened: 0,
            open_handles: 0,
            max_open_handles: 0,
        })))
    }

    /// A version 2.6 bootloader with 6012 bytes of flash in 64 byte pages and no write delay.
    fn v2() -> Self {
        Self::new(
            Version { major: 2, minor: 6 },
            &[0x17, 0x7c, 64, 0, 0x93, 0x0b],
        )
    }

    fn state(&self) -> std::cell::RefMut<'_, State> {
        self.0.borrow_mut()
    }

    fn transfers(&self) -> Vec<Transfer> {
        self.0.borrow().transfers.clone()
    }

    /// Pages announced to the bootloader, as (address, length).
    fn pages(&self) -> Vec<(u16, u16)> {
        self.transfers()
            .into_iter()
            .filter_map(|transfer| match transfer {
                Transfer::Out {
                    request: 1,
                    value,
                    index,
                    ..
                } => Some((index, value)),
                _ => None,
            })
            .collect()
    }

    /// Reassembles the bytes of the v2 page at `address` from its word transfers.
    fn page_bytes(&self, address: u16) -> Vec<u8> {
        let transfers = self.transfers();
        let start = transfers
            .iter()
            .position(|transfer| {
                matches!(transfer, Transfer::Out { request: 1, index, .. } if *index == address)
            })
            .expect("page was not written");

        transfers[start + 1..]
            .iter()
            .take_while(|transfer| matches!(transfer, Transfer::Out { request: 3, .. }))
            .flat_map(|transfer| match transfer {
                Transfer::Out { value, index, .. } => {
                    let mut bytes = value.to_le_bytes().to_vec();
                    bytes.extend_from_slice(&index.to_le_bytes());
                    bytes
                }
                _ => unreachable!(),
            })
            .collect()
    }

    fn count(&self, request: u8) -> usize {
        self.transfers()
            .iter()
            .filter(|transfer| matches!(transfer, Transfer::Out { request: r, .. } if *r == request))
            .count()
    }
}

impl Bus for FakeBus {
    type Transport = FakeTransport;

    fn find_targets(&self) -> micronucleus::Result<Vec<TargetInfo>> {
        let mut state = self.state();
        let mut targets: Vec<TargetInfo> = (1..=state.locked_targets)
            .map(|usb_bus_address| TargetInfo {
                usb_bus_number: 1,
                usb_bus_address,
                version: state.version,
            })
            .collect();
        if state.absent_scans > 0 {
            state.absent_scans -= 1;
            return Ok(targets);
        }
        targets.push(TargetInfo {
            usb_bus_number: 1,
            usb_bus_address: BOOTLOADER_ADDRESS,
            version: state.version,
        });
        Ok(targets)
    }

    fn open(&self, target: &TargetInfo) -> micronucleus::Result<FakeTransport> {
        if target.usb_bus_address != BOOTLOADER_ADDRESS {
            return Err(Error::Usb(rusb::Error::Access));
        }
        let mut state = self.state();
        state.opened += 1;
        state.open_handles += 1;
        state.max_open_handles = state.max_open_handles.max(state.open_handles);
        Ok(FakeTransport(self.0.clone()))
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.0.borrow_mut().open_handles -= 1;
    }
}

impl Transport for FakeTransport {
    fn read_control(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        buffer: &mut [u8],
    ) -> rusb::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.transfers.push(Transfer::In {
            request,
            length: buffer.len(),
        });
        if state.busy_probes > 0 {
            state.busy_probes -= 1;
            return Err(rusb::Error::Pipe);
        }
        let length = buffer.len().min(state.response.len());
        buffer[..length].copy_from_slice(&state.response[..length]);
        Ok(length)
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> rusb::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.transfers.push(Transfer::Out {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        if request == 2 {
            if let Some(error) = state.erase_error.take() {
                state.absent_scans = state.reenumeration_scans;
                return Err(error);
            }
        }
        Ok(data.len())
    }
}

fn options() -> UploadOptions {
    UploadOptions {
        fast_mode: true,
        poll_interval: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        reconnect_grace: Duration::from_millis(5),
        ..UploadOptions::default()
    }
}

/// A program starting with `rjmp .-2`, which targets the last word of an 8 KiB flash.
fn program(length: usize) -> FirmwareImage {
    let mut data: Vec<u8> = (0..length).map(|i| i as u8).collect();
    data[0] = 0xfe;
    data[1] = 0xcf;
    FirmwareImage::from_bytes(&data).unwrap()
}

#[test]
fn test_full_upload_v2() {
    let bus = FakeBus::v2();
    let image = program(2000);

    let mut uploader = Uploader::connect(
        &bus,
        UploadOptions {
            run: true,
            ..options()
        },
    )
    .unwrap();
    assert_eq!(uploader.info().bootloader_start, 6016);
    uploader.upload(Some(&image)).unwrap();

    let transfers = bus.transfers();
    assert_eq!(
        transfers[0],
        Transfer::In {
            request: 0,
            length: 6
        }
    );
    assert_eq!(
        transfers[1],
        Transfer::Out {
            request: 2,
            value: 0,
            index: 0,
            data: vec![]
        }
    );
    assert_eq!(
        transfers.last(),
        Some(&Transfer::Out {
            request: 4,
            value: 0,
            index: 0,
            data: vec![]
        })
    );

    // 32 pages of program, then the bootloader's page
    let pages = bus.pages();
    assert_eq!(pages.len(), 33);
    assert!(pages[..32]
        .iter()
        .enumerate()
        .all(|(i, &page)| page == ((i * 64) as u16, 64)));
    assert_eq!(pages[32], (5952, 64));
    assert_eq!(bus.count(3), 33 * 16);

    // Reset vector jumps into the bootloader
    let first = bus.page_bytes(0);
    assert_eq!(&first[..2], &[0xbf, 0xcb]);
    assert_eq!(decode_jump(&first, 0), Some(6016 / 2));
    assert_eq!(&first[2..], &image.data()[2..64]);

    // Last word before the bootloader jumps to the original reset target
    let last = bus.page_bytes(5952);
    assert_eq!(&last[60..62], &[0x40, 0xc4]);
    assert_eq!(decode_jump(&last[60..], 6012 / 2), Some(0x0fff));
    assert!(last[..60].iter().all(|&b| b == 0xff));

    // Bytes past the image are erased
    let partial = bus.page_bytes(1984);
    assert_eq!(&partial[..16], &image.data()[1984..]);
    assert!(partial[16..].iter().all(|&b| b == 0xff));
}

#[test]
fn test_exact_8k_flash() {
    let bus = FakeBus::new(Version { major: 2, minor: 6 }, &[0x20, 0x00, 64, 0, 0x93, 0x0b]);
    let image = program(2000);

    let mut handle = TargetHandle::connect(&bus, true).unwrap();
    assert_eq!(handle.info().page_count, 128);
    assert_eq!(handle.info().bootloader_start, 8192);
    handle.erase().execute().unwrap();
    handle.program(&image).unwrap().execute().unwrap();
    handle.run().unwrap();

    assert_eq!(bus.pages().last(), Some(&(8128, 64)));
    assert_eq!(&bus.page_bytes(0)[..2], &[0xff, 0xcf]);
    assert_eq!(decode_jump(&bus.page_bytes(0), 0), Some(0x1000));
    let last = bus.page_bytes(8128);
    assert_eq!(&last[60..62], &[0x00, 0xc0]);
    assert_eq!(decode_jump(&last[60..], 8188 / 2), Some(0x0fff));
}

#[test]
fn test_legacy_v1_upload() {
    let bus = FakeBus::new(Version { major: 1, minor: 2 }, &[0x17, 0x7c, 64, 0]);
    let image = program(100);

    let mut handle = TargetHandle::connect(&bus, false).unwrap();
    handle.erase().execute().unwrap();
    handle.program(&image).unwrap().execute().unwrap();

    let transfers = bus.transfers();
    assert_eq!(
        transfers[0],
        Transfer::In {
            request: 0,
            length: 4
        }
    );

    let pages: Vec<(u16, u16, Vec<u8>)> = transfers
        .into_iter()
        .filter_map(|transfer| match transfer {
            Transfer::Out {
                request: 1,
                value,
                index,
                data,
            } => Some((index, value, data)),
            _ => None,
        })
        .collect();

    assert_eq!(pages.len(), 3);
    // The bootloader patches the reset vector itself
    assert_eq!(&pages[0].2[..], &image.data()[..64]);
    assert_eq!(pages[1].0, 64);
    assert_eq!(&pages[1].2[..36], &image.data()[64..]);
    // Truncated to the end of the flash
    assert_eq!((pages[2].0, pages[2].1, pages[2].2.len()), (5952, 60, 60));
    assert_eq!(bus.count(3), 0);
}

#[test]
fn test_reconnect_after_erase_disconnect() {
    let bus = FakeBus::v2();
    {
        let mut state = bus.state();
        state.erase_error = Some(rusb::Error::NoDevice);
        state.reenumeration_scans = 20;
    }
    let image = program(64);

    let mut uploader = Uploader::connect(&bus, options()).unwrap();
    uploader.upload(Some(&image)).unwrap();

    let state = bus.0.borrow();
    assert_eq!(state.opened, 2);
    assert_eq!(state.max_open_handles, 1);
    drop(state);

    // Writing went on over the new connection
    assert_eq!(bus.pages(), vec![(0, 64), (5952, 64)]);
}

#[test]
fn test_disconnect_is_recoverable() {
    for &error in &[
        rusb::Error::Pipe,
        rusb::Error::NoDevice,
        rusb::Error::Timeout,
        rusb::Error::Io,
    ] {
        let bus = FakeBus::v2();
        bus.state().erase_error = Some(error);

        let mut handle = TargetHandle::connect(&bus, true).unwrap();
        let result = handle.erase().execute();
        assert!(
            matches!(result, Err(Error::Disconnected(e)) if e == error),
            "{:?}",
            result
        );
    }
}

#[test]
fn test_erase_only_does_not_reconnect() {
    let bus = FakeBus::v2();
    bus.state().erase_error = Some(rusb::Error::Pipe);

    let mut uploader = Uploader::connect(
        &bus,
        UploadOptions {
            erase_only: true,
            ..options()
        },
    )
    .unwrap();
    uploader.upload(Some(&program(64))).unwrap();

    assert_eq!(bus.0.borrow().opened, 1);
    assert_eq!(bus.0.borrow().open_handles, 0);
    assert!(bus.pages().is_empty());
}

#[test]
fn test_erase_failure_is_fatal() {
    let bus = FakeBus::v2();
    bus.state().erase_error = Some(rusb::Error::Access);

    let mut uploader = Uploader::connect(&bus, options()).unwrap();
    let result = uploader.upload(Some(&program(64)));

    assert!(matches!(result, Err(Error::Usb(rusb::Error::Access))));
    assert!(bus.pages().is_empty());
}

#[test]
fn test_oversized_image_is_rejected_before_erase() {
    let bus = FakeBus::v2();
    let image = program(6013);

    let mut uploader = Uploader::connect(&bus, options()).unwrap();
    let result = uploader.upload(Some(&image));

    assert!(matches!(
        result,
        Err(Error::ImageTooLarge {
            size: 6013,
            flash_size: 6012
        })
    ));
    assert_eq!(bus.count(2), 0);
    assert!(bus.pages().is_empty());
}

#[test]
fn test_unpatchable_program() {
    let bus = FakeBus::v2();
    let image = FirmwareImage::from_bytes(&[0x11, 0x24, 0x1f, 0xbe]).unwrap();

    let mut handle = TargetHandle::connect(&bus, true).unwrap();
    let result = handle.program(&image).unwrap().execute();

    assert!(matches!(result, Err(Error::UnpatchableProgram(0x2411))));
    assert!(bus.pages().is_empty());
}

#[test]
fn test_busy_device_is_polled_again() {
    let bus = FakeBus::v2();
    {
        let mut state = bus.state();
        state.absent_scans = 2;
        state.busy_probes = 2;
    }

    assert!(matches!(
        TargetHandle::connect(&bus, true),
        Err(Error::TargetNotFound)
    ));

    let uploader = Uploader::connect(&bus, options()).unwrap();
    assert_eq!(uploader.info().flash_size, 6012);
    assert_eq!(bus.0.borrow().opened, 3);
    assert_eq!(bus.0.borrow().open_handles, 1);
}

#[test]
fn test_connect_timeout() {
    let bus = FakeBus::v2();
    bus.state().absent_scans = usize::MAX;

    let result = Uploader::connect(
        &bus,
        UploadOptions {
            timeout: Some(Duration::from_millis(20)),
            ..options()
        },
    );
    assert!(matches!(result, Err(Error::ConnectTimeout)));
}

#[test]
fn test_device_which_cannot_be_opened_is_skipped() {
    let bus = FakeBus::v2();
    bus.state().locked_targets = 2;

    let handle = TargetHandle::connect(&bus, true).unwrap();
    assert_eq!(handle.info().flash_size, 6012);
    assert_eq!(bus.0.borrow().opened, 1);
}

#[test]
fn test_open_failure_is_reported_while_waiting() {
    let bus = FakeBus::v2();
    {
        let mut state = bus.state();
        state.locked_targets = 1;
        state.absent_scans = usize::MAX;
    }

    assert!(matches!(
        TargetHandle::connect(&bus, true),
        Err(Error::Usb(rusb::Error::Access))
    ));

    let result = Uploader::connect(
        &bus,
        UploadOptions {
            timeout: Some(Duration::from_millis(20)),
            ..options()
        },
    );
    assert!(matches!(result, Err(Error::ConnectTimeout)));
    assert_eq!(bus.0.borrow().opened, 0);
}

#[test]
fn test_unsupported_version_is_not_opened() {
    let bus = FakeBus::new(Version { major: 3, minor: 0 }, &[0x17, 0x7c, 64, 0, 0, 0]);

    let result = TargetHandle::connect(&bus, true);

    assert!(matches!(
        result,
        Err(Error::UnsupportedVersion(Version { major: 3, minor: 0 }))
    ));
    assert_eq!(bus.0.borrow().opened, 0);
}

#[test]
fn test_progress_reports() {
    let bus = FakeBus::v2();
    let image = program(2000);
    let mut handle = TargetHandle::connect(&bus, true).unwrap();

    let mut erase_progress = Vec::new();
    handle
        .erase()
        .execute_with_progress(&mut |progress: f32| erase_progress.push(progress))
        .unwrap();
    // 94 pages are erased in 23 steps
    assert_eq!(erase_progress.len(), 24);
    assert_eq!(erase_progress.last(), Some(&1.0));
    assert!(erase_progress.windows(2).all(|pair| pair[0] <= pair[1]));

    let mut write_progress = Vec::new();
    handle
        .program(&image)
        .unwrap()
        .execute_with_progress(&mut |progress: f32| write_progress.push(progress))
        .unwrap();
    assert_eq!(write_progress.len(), 95);
    assert_eq!(write_progress[0], 0.0);
    assert_eq!(write_progress[1], 64.0 / 6012.0);
    assert_eq!(write_progress.last(), Some(&1.0));
}
