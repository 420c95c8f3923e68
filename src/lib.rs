//! User-space USB host access over the Linux usbfs interface.
//!
//! This crate enumerates USB devices from the kernel's sysfs tree,
//! opens their usbfs nodes, and performs the four standard transfer
//! types (control, bulk, interrupt, and isochronous) directly
//! against the kernel's ioctl surface, with no portable USB library
//! in between.
//!
//! USB presents a device as a tree: one device descriptor, one or
//! more configurations, each with interfaces, each interface with
//! alternate settings selecting endpoints. Endpoints are the
//! addressable data pipes; a transfer names one by its address.
//! Synchronous control/bulk/interrupt I/O goes through dedicated
//! ioctls; everything asynchronous (and all isochronous traffic) is
//! a USB Request Block handed to the kernel and collected again by a
//! per-handle reaper thread (see [`Transfer`] and [`IsoTransfer`]).
//!
//! This documentation refers to the relevant standards as:
//!
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let device = usbhost::open_vid_pid(0x046D, 0x08E5)?;
//! device.detach_and_claim_interface(0)?;
//! let mut buf = [0u8; 64];
//! let n = device.bulk_transfer(0x81, &mut buf, Duration::from_millis(500))?;
//! println!("read {} bytes", n);
//! # Ok::<(), usbhost::Error>(())
//! ```

pub use crate::desc::{AltSetting, Configuration, Endpoint, Interface};
pub use crate::device::{Device, DeviceHandle};
pub use crate::error::{Error, Result};
pub use crate::isochronous::{IsoFrame, IsoPacket, IsoStream, IsoTransfer};
pub use crate::sysfs::is_valid_device_path;
pub use crate::transfer::{Transfer, TransferStatus};
pub use crate::usbfs::{Capabilities, Speed, UrbFlags};

pub mod desc;
pub mod usb;
pub mod usbfs;

mod device;
mod error;
mod isochronous;
mod reaper;
mod sysfs;
mod transfer;

use std::path::Path;

/// Enumerates every USB device the kernel currently exposes.
pub fn devices() -> Result<Vec<Device>> {
    sysfs::enumerate(Path::new(sysfs::SYSFS_USB_DEVICES))
}

/// Opens the first device matching `vendor`/`product`.
pub fn open_vid_pid(vendor: u16, product: u16) -> Result<DeviceHandle> {
    devices()?
        .iter()
        .find(|dev| dev.vendor_id() == vendor && dev.product_id() == product)
        .ok_or(Error::NoDevice)?
        .open()
}

/// Opens the device behind a `/dev/bus/usb/BBB/DDD` node path.
pub fn open_path(path: &str) -> Result<DeviceHandle> {
    if !is_valid_device_path(path) {
        return Err(Error::InvalidParameter("not a usbfs device path"));
    }
    devices()?
        .iter()
        .find(|dev| dev.path() == Path::new(path))
        .ok_or(Error::NoDevice)?
        .open()
}
