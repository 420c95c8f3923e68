//! Devices and open device handles.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use libc::c_void;
use log::{debug, trace, warn};
use nix::errno::Errno;

use crate::desc::Configuration;
use crate::error::{Error, Result};
use crate::reaper::{self, CompletionFn, SubmitSlot, WakeUrb};
use crate::usb::{self, DescriptorKind, DeviceDescriptor, DeviceQualifier, Setup, SetupReq};
use crate::usbfs::{self, Capabilities, Speed, Urb};

/// Timeout for the control transfers this crate issues on its own
/// behalf (descriptor and status fetches).
const INTERNAL_TIMEOUT: Duration = Duration::from_millis(1000);

fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

/// One enumerated USB device. Immutable: enumeration snapshots the
/// bus position and descriptor, and [`Device::open`] yields a
/// [`DeviceHandle`] for everything stateful.
#[derive(Clone, Debug)]
pub struct Device {
    path: PathBuf,
    busnum: u8,
    devnum: u8,
    descriptor: DeviceDescriptor,
    manufacturer: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    speed: Option<Speed>,
    /// Set while a handle is open; clones of this record share it so
    /// a second open fails with `Busy` instead of fighting over
    /// interface claims.
    open_flag: Arc<AtomicBool>,
}

impl Device {
    pub(crate) fn new(
        busnum: u8,
        devnum: u8,
        descriptor: DeviceDescriptor,
        manufacturer: Option<String>,
        product: Option<String>,
        serial: Option<String>,
        speed: Option<Speed>,
    ) -> Device {
        Device {
            path: PathBuf::from(format!("/dev/bus/usb/{:03}/{:03}", busnum, devnum)),
            busnum,
            devnum,
            descriptor,
            manufacturer,
            product,
            serial,
            speed,
            open_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Path of the usbfs node, `/dev/bus/usb/BBB/DDD`.
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn bus_number(&self) -> u8 {
        self.busnum
    }
    pub fn address(&self) -> u8 {
        self.devnum
    }
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor
    }
    pub fn product_id(&self) -> u16 {
        self.descriptor.product
    }
    /// Manufacturer string as cached by sysfs, sparing a control
    /// transfer. `None` when the device declares none or enumeration
    /// fell back to the raw descriptor.
    pub fn manufacturer_string(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }
    pub fn product_string(&self) -> Option<&str> {
        self.product.as_deref()
    }
    pub fn serial_string(&self) -> Option<&str> {
        self.serial.as_deref()
    }
    /// Bus speed as reported by sysfs at enumeration time.
    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    /// Opens the device node read-write and hands back a live handle.
    pub fn open(&self) -> Result<DeviceHandle> {
        if self
            .open_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }

        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                self.open_flag.store(false, Ordering::SeqCst);
                return Err(match err.raw_os_error() {
                    Some(code) if code == Errno::EACCES as i32 => Error::PermissionDenied,
                    Some(code) if code == Errno::ENOENT as i32 => Error::NoDevice,
                    Some(code) if code == Errno::EBUSY as i32 => Error::Busy,
                    _ => Error::Io(err),
                });
            }
        };
        debug!(
            "opened {} (fd {}, {:04x}:{:04x})",
            self.path.display(),
            file.as_raw_fd(),
            self.vendor_id(),
            self.product_id()
        );

        Ok(DeviceHandle {
            shared: Arc::new(HandleShared {
                file,
                device: self.clone(),
                state: RwLock::new(HandleState {
                    closed: false,
                    claimed: BTreeSet::new(),
                }),
                pending: reaper::PendingUrbs::new(),
            }),
        })
    }

    /// Reads the 18-byte device descriptor straight from the node.
    /// Enumeration uses this when the sysfs attributes are
    /// unreadable.
    pub(crate) fn descriptor_from_node(path: &Path) -> Result<DeviceDescriptor> {
        let mut file = File::open(path)?;
        let mut raw = [0u8; 18];
        file.read_exact(&mut raw)?;
        let desc: &DeviceDescriptor = plain::from_bytes(&raw)
            .map_err(|_| Error::InvalidParameter("short device descriptor"))?;
        if desc.length < 18 || desc.kind != DescriptorKind::Device as u8 {
            return Err(Error::InvalidParameter("malformed device descriptor"));
        }
        Ok(*desc)
    }
}

pub(crate) struct HandleState {
    pub closed: bool,
    pub claimed: BTreeSet<u8>,
}

/// State shared between a [`DeviceHandle`], its transfers, and its
/// reaper thread. The fd lives here and is only dropped once the last
/// owner goes away, so a transfer can never observe a recycled fd.
pub(crate) struct HandleShared {
    file: File,
    device: Device,
    /// Claims and the closed flag. Never held across a blocking
    /// transfer ioctl.
    pub(crate) state: RwLock<HandleState>,
    pub(crate) pending: reaper::PendingUrbs,
}

impl HandleShared {
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state.read().unwrap().closed {
            Err(Error::NoDevice)
        } else {
            Ok(())
        }
    }

    /// Registers the completion under the map mutex, starts the
    /// worker if none is running, then issues the submit ioctl. A
    /// failed submit removes the registration so no callback ever
    /// fires for it.
    pub(crate) fn submit_urb(self: &Arc<Self>, urb: *mut Urb, complete: CompletionFn) -> Result<()> {
        let (id, start_worker) = match self.pending.begin_submit(urb, complete) {
            SubmitSlot::Registered { id, start_worker } => (id, start_worker),
            SubmitSlot::Closed => return Err(Error::NoDevice),
        };

        if start_worker {
            let shared = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("usbhost-reap".into())
                .spawn(move || reaper::run(shared));
            if let Err(err) = spawned {
                self.pending.remove(id);
                self.pending.cancel_worker();
                return Err(Error::Io(err));
            }
        }

        match unsafe { usbfs::submit_urb(self.raw_fd(), urb) } {
            Ok(()) => Ok(()),
            Err(errno) => {
                self.pending.remove(id);
                Err(Error::from_errno(errno))
            }
        }
    }

    pub(crate) fn control_blocking(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_open()?;
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidParameter("control buffer exceeds 64 KiB"));
        }
        let mut req = usbfs::CtrlTransfer {
            request_type,
            request,
            value,
            index,
            length: data.len() as u16,
            timeout: timeout_ms(timeout),
            data: if data.is_empty() {
                std::ptr::null_mut()
            } else {
                data.as_mut_ptr() as *mut c_void
            },
        };
        // The state lock is NOT held here: this ioctl can block for
        // the full timeout and must not serialize against close.
        unsafe { usbfs::control(self.raw_fd(), &mut req) }.map_err(Error::from_errno)
    }
}

/// An open device. Owns the usbfs file descriptor, tracks claimed
/// interfaces, and serializes lifecycle changes behind an rwlock.
///
/// Dropping the handle closes it; [`DeviceHandle::close`] does the
/// same eagerly and is idempotent.
pub struct DeviceHandle {
    shared: Arc<HandleShared>,
}

impl DeviceHandle {
    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.device.descriptor
    }

    /// Closes the handle: releases every claimed interface, gives
    /// every outstanding URB exactly one completion (real or a
    /// synthetic device-gone), waits for the reaper to exit, and
    /// releases the device for reopening. Further calls return `Ok`
    /// without effect; further operations fail with `NoDevice`.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            // Claims are released before the descriptor goes away.
            let fd = self.shared.raw_fd();
            for iface in &state.claimed {
                if let Err(errno) = usbfs::release_interface(fd, *iface) {
                    debug!("release of interface {} at close: {}", iface, errno);
                }
            }
            state.claimed.clear();
        }

        let (in_flight, reaping) = self.shared.pending.close();
        let fd = self.shared.raw_fd();
        for urb in &in_flight {
            // Discarded URBs complete with an error through the
            // reaper; EINVAL means the kernel already dequeued one.
            match unsafe { usbfs::discard_urb(fd, *urb as *mut Urb) } {
                Ok(()) | Err(Errno::EINVAL) => {}
                Err(errno) => debug!("discard at close: {}", errno),
            }
        }
        if reaping {
            // A worker blocked in REAPURB with nothing left to reap
            // only wakes for a new completion; give it one.
            if !WakeUrb::submit(&self.shared) {
                trace!("no wake URB; reaper will exit via reap error or drain");
            }
            self.shared.pending.wait_exited();
        }

        self.shared.device.open_flag.store(false, Ordering::SeqCst);
        debug!("closed {}", self.shared.device.path.display());
        Ok(())
    }

    pub fn set_configuration(&self, value: u8) -> Result<()> {
        self.shared.ensure_open()?;
        usbfs::set_configuration(self.shared.raw_fd(), value).map_err(Error::from_errno)
    }

    /// Asks the device for its current configuration value.
    pub fn configuration(&self) -> Result<u8> {
        let setup = Setup::get_configuration();
        let mut value = [0u8; 1];
        let n = self.shared.control_blocking(
            setup.kind,
            setup.request,
            { setup.value },
            { setup.index },
            &mut value,
            INTERNAL_TIMEOUT,
        )?;
        if n != 1 {
            return Err(Error::InvalidParameter("short GET_CONFIGURATION reply"));
        }
        Ok(value[0])
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.shared.state.write().unwrap();
        if state.closed {
            return Err(Error::NoDevice);
        }
        if state.claimed.contains(&interface) {
            return Ok(());
        }
        usbfs::claim_interface(self.shared.raw_fd(), interface).map_err(Error::from_errno)?;
        state.claimed.insert(interface);
        trace!("claimed interface {}", interface);
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.shared.state.write().unwrap();
        if state.closed {
            return Err(Error::NoDevice);
        }
        if !state.claimed.remove(&interface) {
            return Ok(());
        }
        usbfs::release_interface(self.shared.raw_fd(), interface).map_err(Error::from_errno)
    }

    /// Selects an alternate setting on a claimed interface.
    pub fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<()> {
        {
            let state = self.shared.state.read().unwrap();
            if state.closed {
                return Err(Error::NoDevice);
            }
            if !state.claimed.contains(&interface) {
                return Err(Error::InvalidParameter("interface not claimed"));
            }
        }
        usbfs::set_interface(self.shared.raw_fd(), interface, alt_setting)
            .map_err(Error::from_errno)
    }

    /// Clears a halt (stall) condition on an endpoint.
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.shared.ensure_open()?;
        usbfs::clear_halt(self.shared.raw_fd(), endpoint).map_err(Error::from_errno)
    }

    pub fn reset_endpoint(&self, endpoint: u8) -> Result<()> {
        self.shared.ensure_open()?;
        usbfs::reset_endpoint(self.shared.raw_fd(), endpoint).map_err(Error::from_errno)
    }

    /// Resets (re-enumerates) the device. All interface claims are
    /// dropped: usbfs re-acquires them across the reset, so they are
    /// released explicitly afterwards.
    pub fn reset(&self) -> Result<()> {
        self.shared.ensure_open()?;
        usbfs::reset(self.shared.raw_fd()).map_err(Error::from_errno)?;
        let mut state = self.shared.state.write().unwrap();
        let fd = self.shared.raw_fd();
        for iface in &state.claimed {
            if let Err(errno) = usbfs::release_interface(fd, *iface) {
                debug!("release of interface {} after reset: {}", iface, errno);
            }
        }
        state.claimed.clear();
        Ok(())
    }

    /// Name of the kernel driver bound to `interface`, if any.
    /// Non-destructive; "usbfs" means this (or another) usbfs client
    /// holds the claim.
    pub fn kernel_driver(&self, interface: u8) -> Result<Option<String>> {
        self.shared.ensure_open()?;
        match usbfs::get_driver(self.shared.raw_fd(), interface) {
            Ok(name) => Ok(Some(name)),
            Err(Errno::ENODATA) => Ok(None),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    /// Whether a (non-usbfs) kernel driver is bound to `interface`.
    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        Ok(matches!(self.kernel_driver(interface)?, Some(name) if name != "usbfs"))
    }

    /// Unbinds the kernel driver from `interface`. "No driver bound"
    /// (`ENODATA`/`ENOENT`) is success; `ENOTTY` means the kernel
    /// lacks the ioctl and maps to `NotSupported`; the two are
    /// distinct conditions.
    pub fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.shared.ensure_open()?;
        match usbfs::disconnect_driver(self.shared.raw_fd(), interface) {
            Ok(()) | Err(Errno::ENODATA) | Err(Errno::ENOENT) => Ok(()),
            Err(Errno::ENOTTY) => Err(Error::NotSupported),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    /// Rebinds a kernel driver to `interface`. "Already attached"
    /// (`EBUSY`) and "no previous binding" (`ENODATA`) are successes.
    pub fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.shared.ensure_open()?;
        match usbfs::connect_driver(self.shared.raw_fd(), interface) {
            Ok(()) | Err(Errno::ENODATA) | Err(Errno::EBUSY) => Ok(()),
            Err(Errno::ENOTTY) => Err(Error::NotSupported),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    /// Atomically detaches whatever driver holds `interface` and
    /// claims it, falling back to detach-then-claim on kernels
    /// without `DISCONNECT_CLAIM`.
    pub fn detach_and_claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.shared.state.write().unwrap();
        if state.closed {
            return Err(Error::NoDevice);
        }
        if state.claimed.contains(&interface) {
            return Ok(());
        }
        let fd = self.shared.raw_fd();
        match usbfs::disconnect_claim(
            fd,
            interface,
            usbfs::DISCONNECT_CLAIM_EXCEPT_DRIVER,
            "usbfs",
        ) {
            Ok(()) => {}
            Err(Errno::ENOTTY) => {
                drop(state);
                self.detach_kernel_driver(interface)?;
                return self.claim_interface(interface);
            }
            Err(errno) => return Err(Error::from_errno(errno)),
        }
        state.claimed.insert(interface);
        Ok(())
    }

    /// Synchronous control transfer. `data` is read for host-to-device
    /// requests and written for device-to-host requests (bit 7 of
    /// `request_type`). Returns the bytes transferred in the data
    /// stage.
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.shared
            .control_blocking(request_type, request, value, index, data, timeout)
    }

    /// Synchronous bulk transfer; direction comes from bit 7 of
    /// `endpoint`. Returns the bytes transferred.
    pub fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        self.shared.ensure_open()?;
        if data.is_empty() {
            return Err(Error::InvalidParameter("zero-length bulk buffer"));
        }
        let mut req = usbfs::BulkTransfer {
            ep: endpoint.into(),
            len: data.len() as libc::c_uint,
            timeout: timeout_ms(timeout),
            data: data.as_mut_ptr() as *mut c_void,
        };
        unsafe { usbfs::bulk(self.shared.raw_fd(), &mut req) }.map_err(Error::from_errno)
    }

    /// Synchronous interrupt transfer. The kernel services interrupt
    /// endpoints through the same ioctl as bulk ones.
    pub fn interrupt_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.bulk_transfer(endpoint, data, timeout)
    }

    /// Fetches any descriptor via GET_DESCRIPTOR. Returns the bytes
    /// the device produced.
    pub fn raw_descriptor(
        &self,
        kind: u8,
        index: u8,
        language: u16,
        data: &mut [u8],
    ) -> Result<usize> {
        self.shared.control_blocking(
            0x80,
            SetupReq::GetDescriptor as u8,
            (u16::from(kind) << 8) | u16::from(index),
            language,
            data,
            INTERNAL_TIMEOUT,
        )
    }

    /// Fetches and decodes a string descriptor in US English. Index 0
    /// yields the empty string without a transfer.
    pub fn string_descriptor(&self, index: u8) -> Result<String> {
        self.string_descriptor_lang(index, usb::LANG_ID_EN_US)
    }

    pub fn string_descriptor_lang(&self, index: u8, language: u16) -> Result<String> {
        if index == 0 {
            return Ok(String::new());
        }
        let mut buf = [0u8; 256];
        let n = self.raw_descriptor(DescriptorKind::String as u8, index, language, &mut buf)?;
        decode_string_descriptor(&buf[..n])
    }

    /// Language ids the device offers strings in, from the string
    /// descriptor at index 0.
    pub fn string_languages(&self) -> Result<Vec<u16>> {
        let mut buf = [0u8; 256];
        let n = self.raw_descriptor(DescriptorKind::String as u8, 0, 0, &mut buf)?;
        decode_language_table(&buf[..n])
    }

    /// Current alternate setting of `interface`, asked of the device
    /// via GET_INTERFACE.
    pub fn alt_setting(&self, interface: u8) -> Result<u8> {
        let setup = Setup::get_interface(interface);
        let mut value = [0u8; 1];
        let n = self.shared.control_blocking(
            setup.kind,
            setup.request,
            { setup.value },
            { setup.index },
            &mut value,
            INTERNAL_TIMEOUT,
        )?;
        if n != 1 {
            return Err(Error::InvalidParameter("short GET_INTERFACE reply"));
        }
        Ok(value[0])
    }

    /// Fetches and parses the configuration descriptor at `index`
    /// (zero-based, not the configuration value).
    pub fn config_descriptor(&self, index: u8) -> Result<Configuration> {
        let mut header = [0u8; 9];
        let n = self.raw_descriptor(DescriptorKind::Configuration as u8, index, 0, &mut header)?;
        if n < 9 {
            return Err(Error::InvalidParameter("short configuration descriptor"));
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut full = vec![0u8; total.max(9)];
        let n = self.raw_descriptor(DescriptorKind::Configuration as u8, index, 0, &mut full)?;
        full.truncate(n);
        Configuration::parse(&full)
    }

    /// Parses the configuration the device currently runs.
    pub fn active_config_descriptor(&self) -> Result<Configuration> {
        let value = self.configuration()?;
        for index in 0..self.descriptor().num_configurations {
            let config = self.config_descriptor(index)?;
            if config.configuration_value == value {
                return Ok(config);
            }
        }
        Err(Error::InvalidParameter("active configuration not found"))
    }

    /// Fetches and parses the Binary Object Store (USB 3.0+).
    pub fn bos(&self) -> Result<usb::Bos> {
        let mut header = [0u8; 5];
        let n = self.raw_descriptor(
            DescriptorKind::BinaryObjectStore as u8,
            0,
            0,
            &mut header,
        )?;
        if n < 5 {
            return Err(Error::InvalidParameter("invalid BOS"));
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        if total < 5 {
            return Err(Error::InvalidParameter("invalid BOS"));
        }
        let mut full = vec![0u8; total];
        let n = self.raw_descriptor(DescriptorKind::BinaryObjectStore as u8, 0, 0, &mut full)?;
        full.truncate(n);
        usb::parse_bos(&full)
    }

    /// Fetches and parses the other-speed configuration at `index`
    /// (USB2 devices; same layout as a configuration descriptor).
    pub fn other_speed_config_descriptor(&self, index: u8) -> Result<Configuration> {
        let mut header = [0u8; 9];
        let n = self.raw_descriptor(
            DescriptorKind::OtherSpeedConfiguration as u8,
            index,
            0,
            &mut header,
        )?;
        if n < 9 {
            return Err(Error::InvalidParameter("short other-speed descriptor"));
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut full = vec![0u8; total.max(9)];
        let n = self.raw_descriptor(
            DescriptorKind::OtherSpeedConfiguration as u8,
            index,
            0,
            &mut full,
        )?;
        full.truncate(n);
        Configuration::parse(&full)
    }

    /// SET_DESCRIPTOR, for the rare device that supports writing one
    /// back.
    pub fn set_descriptor(
        &self,
        kind: u8,
        index: u8,
        language: u16,
        data: &mut [u8],
    ) -> Result<()> {
        self.shared
            .control_blocking(
                0x00,
                SetupReq::SetDescriptor as u8,
                (u16::from(kind) << 8) | u16::from(index),
                language,
                data,
                INTERNAL_TIMEOUT,
            )
            .map(drop)
    }

    /// Fetches the USB2 device qualifier descriptor.
    pub fn device_qualifier(&self) -> Result<DeviceQualifier> {
        let mut buf = [0u8; 10];
        let n = self.raw_descriptor(DescriptorKind::DeviceQualifier as u8, 0, 0, &mut buf)?;
        if n < 10 {
            return Err(Error::InvalidParameter("short device qualifier"));
        }
        Ok(*plain::from_bytes(&buf).unwrap())
    }

    /// GET_STATUS for a device (`recipient` 0), interface (1), or
    /// endpoint (2); `index` selects the interface or endpoint.
    pub fn status(&self, recipient: u8, index: u16) -> Result<u16> {
        let setup = Setup::get_status(recipient, index);
        let mut buf = [0u8; 2];
        let n = self.shared.control_blocking(
            setup.kind,
            setup.request,
            { setup.value },
            { setup.index },
            &mut buf,
            INTERNAL_TIMEOUT,
        )?;
        if n != 2 {
            return Err(Error::InvalidParameter("short GET_STATUS reply"));
        }
        Ok(u16::from_le_bytes(buf))
    }

    pub fn clear_feature(&self, recipient: u8, feature: u16, index: u16) -> Result<()> {
        let setup = Setup::clear_feature(recipient, feature, index);
        self.shared
            .control_blocking(
                setup.kind,
                setup.request,
                { setup.value },
                { setup.index },
                &mut [],
                INTERNAL_TIMEOUT,
            )
            .map(drop)
    }

    pub fn set_feature(&self, recipient: u8, feature: u16, index: u16) -> Result<()> {
        let setup = Setup::set_feature(recipient, feature, index);
        self.shared
            .control_blocking(
                setup.kind,
                setup.request,
                { setup.value },
                { setup.index },
                &mut [],
                INTERNAL_TIMEOUT,
            )
            .map(drop)
    }

    /// SYNCH_FRAME on an isochronous endpoint.
    pub fn synch_frame(&self, endpoint: u8) -> Result<u16> {
        let setup = Setup::synch_frame(endpoint);
        let mut buf = [0u8; 2];
        let n = self.shared.control_blocking(
            setup.kind,
            setup.request,
            { setup.value },
            { setup.index },
            &mut buf,
            INTERNAL_TIMEOUT,
        )?;
        if n != 2 {
            return Err(Error::InvalidParameter("short SYNCH_FRAME reply"));
        }
        Ok(u16::from_le_bytes(buf))
    }

    /// usbfs capability bits of the running kernel.
    pub fn capabilities(&self) -> Result<Capabilities> {
        self.shared.ensure_open()?;
        usbfs::get_capabilities(self.shared.raw_fd()).map_err(Error::from_errno)
    }

    /// Negotiated bus speed, straight from the kernel.
    pub fn speed(&self) -> Result<Speed> {
        self.shared.ensure_open()?;
        let raw = usbfs::get_speed(self.shared.raw_fd()).map_err(Error::from_errno)?;
        Speed::from_raw(raw).ok_or_else(|| Error::Other(format!("unknown device speed {}", raw)))
    }

    /// Allocates bulk streams on SuperSpeed endpoints. Returns the
    /// stream count the controller granted.
    pub fn alloc_streams(&self, num_streams: u32, endpoints: &[u8]) -> Result<u32> {
        self.shared.ensure_open()?;
        match usbfs::alloc_streams(self.shared.raw_fd(), num_streams, endpoints) {
            Ok(granted) => Ok(granted),
            Err(Errno::ENOTTY) => Err(Error::NotSupported),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    pub fn free_streams(&self, endpoints: &[u8]) -> Result<()> {
        self.shared.ensure_open()?;
        match usbfs::free_streams(self.shared.raw_fd(), endpoints) {
            Ok(()) => Ok(()),
            Err(Errno::ENOTTY) => Err(Error::NotSupported),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("close on drop failed: {}", err);
        }
    }
}

/// Decodes the language-id table (string descriptor index 0): a
/// header pair followed by one little-endian id per language.
pub(crate) fn decode_language_table(data: &[u8]) -> Result<Vec<u16>> {
    if data.len() < 2 || data[0] < 2 || data[1] != DescriptorKind::String as u8 {
        return Err(Error::InvalidParameter("invalid language table"));
    }
    let end = usize::from(data[0]).min(data.len());
    Ok(data[2..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decodes a STRING descriptor reply: one length byte, the type byte,
/// then UTF-16-LE code units up to the first NUL or the declared
/// length, whichever comes first.
pub(crate) fn decode_string_descriptor(data: &[u8]) -> Result<String> {
    if data.len() < 2 || data[0] < 2 {
        return Err(Error::InvalidParameter("invalid string descriptor"));
    }
    let end = usize::from(data[0]).min(data.len());
    let mut units = Vec::with_capacity((end - 2) / 2);
    let mut pos = 2;
    while pos + 1 < end {
        let unit = u16::from_le_bytes([data[pos], data[pos + 1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
        pos += 2;
    }
    Ok(String::from_utf16_lossy(&units))
}

/// Handle over `/dev/null` for exercising transfer state machines
/// without a USB device; every ioctl on it fails with `ENOTTY`.
#[cfg(test)]
pub(crate) fn open_test_handle() -> DeviceHandle {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .unwrap();
    DeviceHandle {
        shared: Arc::new(HandleShared {
            file,
            device: Device::new(0, 0, DeviceDescriptor::default(), None, None, None, None),
            state: RwLock::new(HandleState {
                closed: false,
                claimed: BTreeSet::new(),
            }),
            pending: reaper::PendingUrbs::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_language_ids() {
        // The table half of the documented reply: US English only.
        let table: &[u8] = &[0x04, 0x03, 0x09, 0x04];
        assert_eq!(decode_language_table(table).unwrap(), vec![0x0409]);

        let many: &[u8] = &[0x06, 0x03, 0x09, 0x04, 0x07, 0x04];
        assert_eq!(
            decode_language_table(many).unwrap(),
            vec![0x0409, 0x0407]
        );

        assert!(decode_language_table(&[0x04]).is_err());
        assert!(decode_language_table(&[0x04, 0x02, 0x09, 0x04]).is_err());
    }

    #[test]
    fn decode_documented_string_reply() {
        // String descriptor for "Good": declared length 18, NUL
        // terminated early.
        let reply: &[u8] = &[
            0x12, 0x03, 0x47, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0x64, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(decode_string_descriptor(reply).unwrap(), "Good");
    }

    #[test]
    fn decode_stops_at_declared_length() {
        // Declared length 10 cuts the string to "Good" even with more
        // bytes in the reply.
        let reply: &[u8] = &[
            0x0A, 0x03, 0x47, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0x64, 0x00, 0x21, 0x00,
        ];
        assert_eq!(decode_string_descriptor(reply).unwrap(), "Good");
    }

    #[test]
    fn decode_rejects_short_replies() {
        assert!(decode_string_descriptor(&[]).is_err());
        assert!(decode_string_descriptor(&[0x01]).is_err());
        assert!(decode_string_descriptor(&[0x01, 0x03]).is_err());
    }

    #[test]
    fn decode_handles_truncated_reply() {
        // Kernel returned fewer bytes than the descriptor declares.
        let reply: &[u8] = &[0x12, 0x03, 0x41, 0x00, 0x42, 0x00];
        assert_eq!(decode_string_descriptor(reply).unwrap(), "AB");
    }

    #[test]
    fn device_records_are_immutable_snapshots() {
        let device = Device::new(
            1,
            4,
            DeviceDescriptor {
                length: 18,
                kind: 1,
                vendor: 0x1D6B,
                product: 0x0002,
                ..Default::default()
            },
            Some("Linux Foundation".into()),
            Some("2.0 root hub".into()),
            None,
            Some(Speed::High),
        );
        assert_eq!(device.path(), Path::new("/dev/bus/usb/001/004"));
        assert_eq!(device.bus_number(), 1);
        assert_eq!(device.address(), 4);
        assert_eq!(device.vendor_id(), 0x1D6B);
        assert_eq!(device.manufacturer_string(), Some("Linux Foundation"));
        assert_eq!(device.serial_string(), None);
        assert_eq!(device.speed(), Some(Speed::High));
    }
}
