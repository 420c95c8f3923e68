//! Typed surface over the Linux usbfs character-device interface.
//!
//! usbfs exposes one node per bus/address under `/dev/bus/usb` with a
//! documented ioctl set; everything this crate does to a device goes
//! through the wrappers in this module. Request codes are generated
//! with the `nix` ioctl macros and pinned to the kernel's numeric
//! values by the tests at the bottom.

use std::alloc::{self, Layout};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use bitflags::bitflags;
use libc::{c_char, c_int, c_uchar, c_uint, c_void};

pub const USBFS_URB_TYPE_ISO: u8 = 0;
pub const USBFS_URB_TYPE_INTERRUPT: u8 = 1;
pub const USBFS_URB_TYPE_CONTROL: u8 = 2;
pub const USBFS_URB_TYPE_BULK: u8 = 3;

bitflags! {
    /// Flags accepted in [`Urb::flags`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct UrbFlags: u32 {
        const SHORT_NOT_OK = 0x01;
        const ISO_ASAP = 0x02;
        const BULK_CONTINUATION = 0x04;
        const NO_FSBR = 0x20;
        const ZERO_PACKET = 0x40;
        const NO_INTERRUPT = 0x80;
    }
}

bitflags! {
    /// Capability bits reported by `USBDEVFS_GET_CAPABILITIES`.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        const ZERO_PACKET = 0x01;
        const BULK_CONTINUATION = 0x02;
        const NO_PACKET_SIZE_LIM = 0x04;
        const BULK_SCATTER_GATHER = 0x08;
        const REAP_AFTER_DISCONNECT = 0x10;
        const MMAP = 0x20;
        const DROP_PRIVILEGES = 0x40;
    }
}

/// Bus speed as reported by `USBDEVFS_GET_SPEED` (values 1..=6).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Speed {
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
    SuperPlus = 6,
}

impl Speed {
    pub fn from_raw(raw: i32) -> Option<Speed> {
        Some(match raw {
            1 => Speed::Low,
            2 => Speed::Full,
            3 => Speed::High,
            4 => Speed::Wireless,
            5 => Speed::Super,
            6 => Speed::SuperPlus,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct CtrlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub timeout: u32,
    pub data: *mut c_void,
}

#[repr(C)]
#[derive(Debug)]
pub struct BulkTransfer {
    pub ep: c_uint,
    pub len: c_uint,
    pub timeout: c_uint,
    pub data: *mut c_void,
}

#[repr(C)]
#[derive(Debug)]
pub struct SetInterface {
    pub interface: c_uint,
    pub altsetting: c_uint,
}

#[repr(C)]
pub struct GetDriver {
    pub interface: c_uint,
    pub driver: [c_char; 256],
}

#[repr(C)]
#[derive(Debug)]
pub struct UsbfsIoctl {
    pub ifno: c_int,
    pub ioctl_code: c_int,
    pub data: *mut c_void,
}

#[repr(C)]
pub struct DisconnectClaim {
    pub interface: c_uint,
    pub flags: c_uint,
    pub driver: [c_char; 256],
}

pub const DISCONNECT_CLAIM_IF_DRIVER: c_uint = 0x01;
pub const DISCONNECT_CLAIM_EXCEPT_DRIVER: c_uint = 0x02;

pub const MAX_STREAM_ENDPOINTS: usize = 30;

/// `struct usbdevfs_streams`. The kernel declares a flexible endpoint
/// array; the request code is sized to the 8-byte fixed part only.
#[repr(C)]
pub struct Streams {
    pub num_streams: c_uint,
    pub num_eps: c_uint,
    pub eps: [u8; MAX_STREAM_ENDPOINTS],
}

/// `struct usbdevfs_urb`, ABI-exact. For isochronous URBs the
/// per-packet descriptors follow this header in the same allocation;
/// see [`UrbBlock`].
#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub urb_type: c_uchar,
    pub endpoint: c_uchar,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    /// Number of packets for isochronous URBs, stream id for bulk
    /// URBs on an allocated stream.
    pub packets_or_stream_id: c_uint,
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IsoPacketDesc {
    pub length: c_uint,
    pub actual_length: c_uint,
    pub status: c_uint,
}

mod ioctls {
    use nix::{
        ioctl_none, ioctl_read, ioctl_read_bad, ioctl_readwrite, ioctl_write_ptr,
        ioctl_write_ptr_bad, request_code_none, request_code_read,
    };

    use super::*;

    ioctl_readwrite!(usbdevfs_control, b'U', 0, CtrlTransfer);
    ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
    ioctl_read!(usbdevfs_resetep, b'U', 3, c_uint);
    ioctl_read!(usbdevfs_setinterface, b'U', 4, SetInterface);
    ioctl_read!(usbdevfs_setconfiguration, b'U', 5, c_uint);
    ioctl_write_ptr!(usbdevfs_getdriver, b'U', 8, GetDriver);
    ioctl_read!(usbdevfs_submiturb, b'U', 10, Urb);
    ioctl_write_ptr_bad!(
        usbdevfs_discardurb,
        request_code_none!(b'U', 11),
        Urb
    );
    ioctl_write_ptr!(usbdevfs_reapurb, b'U', 12, *mut Urb);
    ioctl_write_ptr!(usbdevfs_reapurbndelay, b'U', 13, *mut Urb);
    ioctl_read!(usbdevfs_claiminterface, b'U', 15, c_uint);
    ioctl_read!(usbdevfs_releaseinterface, b'U', 16, c_uint);
    ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, UsbfsIoctl);
    ioctl_none!(usbdevfs_reset, b'U', 20);
    ioctl_read!(usbdevfs_clear_halt, b'U', 21, c_uint);
    ioctl_read!(usbdevfs_get_capabilities, b'U', 26, u32);
    ioctl_read!(usbdevfs_disconnect_claim, b'U', 27, DisconnectClaim);
    ioctl_read_bad!(
        usbdevfs_alloc_streams,
        request_code_read!(b'U', 28, 8),
        Streams
    );
    ioctl_read_bad!(
        usbdevfs_free_streams,
        request_code_read!(b'U', 29, 8),
        Streams
    );
    ioctl_none!(usbdevfs_get_speed, b'U', 31);

    /// Codes of the driver-management sub-ioctls issued through
    /// `USBDEVFS_IOCTL`.
    pub const USBDEVFS_DISCONNECT: c_int = request_code_none!(b'U', 22) as c_int;
    pub const USBDEVFS_CONNECT: c_int = request_code_none!(b'U', 23) as c_int;
}

/// Synchronous control transfer. Returns the number of bytes
/// transferred in the data stage.
///
/// # Safety
/// `req.data` must point to at least `req.length` writable bytes for
/// the duration of the call.
pub unsafe fn control(fd: RawFd, req: &mut CtrlTransfer) -> nix::Result<usize> {
    ioctls::usbdevfs_control(fd, req).map(|n| n as usize)
}

/// Synchronous bulk (or interrupt; the kernel multiplexes both through
/// this ioctl) transfer. Returns the number of bytes transferred.
///
/// # Safety
/// `req.data` must point to at least `req.len` writable bytes for the
/// duration of the call.
pub unsafe fn bulk(fd: RawFd, req: &mut BulkTransfer) -> nix::Result<usize> {
    ioctls::usbdevfs_bulk(fd, req).map(|n| n as usize)
}

pub fn claim_interface(fd: RawFd, interface: u8) -> nix::Result<()> {
    let mut ifno = c_uint::from(interface);
    unsafe { ioctls::usbdevfs_claiminterface(fd, &mut ifno) }.map(drop)
}

pub fn release_interface(fd: RawFd, interface: u8) -> nix::Result<()> {
    let mut ifno = c_uint::from(interface);
    unsafe { ioctls::usbdevfs_releaseinterface(fd, &mut ifno) }.map(drop)
}

pub fn set_interface(fd: RawFd, interface: u8, alt_setting: u8) -> nix::Result<()> {
    let mut req = SetInterface {
        interface: c_uint::from(interface),
        altsetting: c_uint::from(alt_setting),
    };
    unsafe { ioctls::usbdevfs_setinterface(fd, &mut req) }.map(drop)
}

pub fn set_configuration(fd: RawFd, configuration: u8) -> nix::Result<()> {
    let mut value = c_uint::from(configuration);
    unsafe { ioctls::usbdevfs_setconfiguration(fd, &mut value) }.map(drop)
}

pub fn clear_halt(fd: RawFd, endpoint: u8) -> nix::Result<()> {
    let mut ep = c_uint::from(endpoint);
    unsafe { ioctls::usbdevfs_clear_halt(fd, &mut ep) }.map(drop)
}

pub fn reset_endpoint(fd: RawFd, endpoint: u8) -> nix::Result<()> {
    let mut ep = c_uint::from(endpoint);
    unsafe { ioctls::usbdevfs_resetep(fd, &mut ep) }.map(drop)
}

/// Re-enumerates the device. Usbfs re-claims the caller's interfaces
/// across the reset, but bound state on other interfaces may change.
pub fn reset(fd: RawFd) -> nix::Result<()> {
    unsafe { ioctls::usbdevfs_reset(fd) }.map(drop)
}

/// Name of the kernel driver bound to `interface`, `ENODATA` if none.
pub fn get_driver(fd: RawFd, interface: u8) -> nix::Result<String> {
    let mut req = GetDriver {
        interface: c_uint::from(interface),
        driver: [0; 256],
    };
    // _IOW code, but the kernel writes the driver name back.
    unsafe { ioctls::usbdevfs_getdriver(fd, &mut req as *mut GetDriver as *const GetDriver) }?;
    let bytes: Vec<u8> = req
        .driver
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn driver_ioctl(fd: RawFd, interface: u8, code: c_int) -> nix::Result<()> {
    let mut req = UsbfsIoctl {
        ifno: c_int::from(interface),
        ioctl_code: code,
        data: ptr::null_mut(),
    };
    unsafe { ioctls::usbdevfs_ioctl(fd, &mut req) }.map(drop)
}

/// Unbinds the kernel driver from `interface` (the `DISCONNECT`
/// sub-ioctl). `ENODATA` means no driver was bound.
pub fn disconnect_driver(fd: RawFd, interface: u8) -> nix::Result<()> {
    driver_ioctl(fd, interface, ioctls::USBDEVFS_DISCONNECT)
}

/// Asks the kernel to probe and rebind a driver for `interface` (the
/// `CONNECT` sub-ioctl).
pub fn connect_driver(fd: RawFd, interface: u8) -> nix::Result<()> {
    driver_ioctl(fd, interface, ioctls::USBDEVFS_CONNECT)
}

/// Atomically disconnects whatever driver holds `interface` and claims
/// it for this fd, honoring the `DISCONNECT_CLAIM_*` flags.
pub fn disconnect_claim(
    fd: RawFd,
    interface: u8,
    flags: c_uint,
    driver: &str,
) -> nix::Result<()> {
    let mut req = DisconnectClaim {
        interface: c_uint::from(interface),
        flags,
        driver: [0; 256],
    };
    for (dst, src) in req.driver.iter_mut().zip(driver.bytes().take(255)) {
        *dst = src as c_char;
    }
    unsafe { ioctls::usbdevfs_disconnect_claim(fd, &mut req) }.map(drop)
}

pub fn get_capabilities(fd: RawFd) -> nix::Result<Capabilities> {
    let mut caps: u32 = 0;
    unsafe { ioctls::usbdevfs_get_capabilities(fd, &mut caps) }?;
    Ok(Capabilities::from_bits_truncate(caps))
}

pub fn get_speed(fd: RawFd) -> nix::Result<i32> {
    unsafe { ioctls::usbdevfs_get_speed(fd) }
}

fn streams_request(num_streams: u32, endpoints: &[u8]) -> nix::Result<Streams> {
    if endpoints.is_empty() || endpoints.len() > MAX_STREAM_ENDPOINTS {
        return Err(nix::errno::Errno::EINVAL);
    }
    let mut req = Streams {
        num_streams,
        num_eps: endpoints.len() as c_uint,
        eps: [0; MAX_STREAM_ENDPOINTS],
    };
    req.eps[..endpoints.len()].copy_from_slice(endpoints);
    Ok(req)
}

/// Allocates bulk streams on the given endpoints (USB 3.x). Returns
/// the number of streams the controller granted.
pub fn alloc_streams(fd: RawFd, num_streams: u32, endpoints: &[u8]) -> nix::Result<u32> {
    let mut req = streams_request(num_streams, endpoints)?;
    let granted = unsafe { ioctls::usbdevfs_alloc_streams(fd, &mut req) }?;
    Ok(granted as u32)
}

pub fn free_streams(fd: RawFd, endpoints: &[u8]) -> nix::Result<()> {
    let mut req = streams_request(0, endpoints)?;
    unsafe { ioctls::usbdevfs_free_streams(fd, &mut req) }.map(drop)
}

/// Submits an URB.
///
/// # Safety
/// `urb` and the buffer it points to must stay allocated and unmoved
/// until the kernel delivers the URB back through a reap call (or the
/// fd is closed).
pub unsafe fn submit_urb(fd: RawFd, urb: *mut Urb) -> nix::Result<()> {
    ioctls::usbdevfs_submiturb(fd, urb).map(drop)
}

/// Cancels a submitted URB. Best effort: `EINVAL` means the URB had
/// already been dequeued. A discarded URB still produces a reap
/// completion with non-zero status.
///
/// # Safety
/// `urb` must be a block previously passed to [`submit_urb`] on `fd`.
pub unsafe fn discard_urb(fd: RawFd, urb: *mut Urb) -> nix::Result<()> {
    ioctls::usbdevfs_discardurb(fd, urb).map(drop)
}

/// Blocks until any submitted URB completes, returning the kernel's
/// pointer to it. `EINTR` and `EAGAIN` are the caller's to retry.
pub fn reap_urb(fd: RawFd) -> nix::Result<*mut Urb> {
    let mut completed: *mut Urb = ptr::null_mut();
    unsafe { ioctls::usbdevfs_reapurb(fd, &mut completed as *mut *mut Urb as *const *mut Urb) }?;
    Ok(completed)
}

/// Non-blocking reap; `EAGAIN` when nothing has completed.
pub fn reap_urb_ndelay(fd: RawFd) -> nix::Result<*mut Urb> {
    let mut completed: *mut Urb = ptr::null_mut();
    unsafe {
        ioctls::usbdevfs_reapurbndelay(fd, &mut completed as *mut *mut Urb as *const *mut Urb)
    }?;
    Ok(completed)
}

/// One heap allocation holding an URB header immediately followed by
/// `packets` isochronous packet descriptors, at a stable address for
/// the lifetime of the block. The kernel reads and writes both parts.
pub struct UrbBlock {
    ptr: NonNull<Urb>,
    packets: usize,
}

// The block is a plain allocation; the submit/reap protocol decides
// who may touch it.
unsafe impl Send for UrbBlock {}

impl UrbBlock {
    pub fn new(packets: usize) -> UrbBlock {
        let layout = Self::layout(packets);
        // Zeroed: a fresh URB must present zero status/lengths.
        let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut Urb;
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        UrbBlock { ptr, packets }
    }

    fn layout(packets: usize) -> Layout {
        Layout::new::<Urb>()
            .extend(Layout::array::<IsoPacketDesc>(packets).unwrap())
            .unwrap()
            .0
            .pad_to_align()
    }

    pub fn urb(&self) -> &Urb {
        unsafe { self.ptr.as_ref() }
    }

    pub fn urb_mut(&mut self) -> &mut Urb {
        unsafe { self.ptr.as_mut() }
    }

    /// Raw pointer for submit/discard ioctls.
    pub fn as_raw(&self) -> *mut Urb {
        self.ptr.as_ptr()
    }

    fn descs_ptr(&self) -> *mut IsoPacketDesc {
        unsafe { self.ptr.as_ptr().add(1) as *mut IsoPacketDesc }
    }

    pub fn packet_descs(&self) -> &[IsoPacketDesc] {
        unsafe { std::slice::from_raw_parts(self.descs_ptr(), self.packets) }
    }

    pub fn packet_descs_mut(&mut self) -> &mut [IsoPacketDesc] {
        unsafe { std::slice::from_raw_parts_mut(self.descs_ptr(), self.packets) }
    }
}

impl Drop for UrbBlock {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.packets)) }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use nix::{request_code_none, request_code_read, request_code_readwrite, request_code_write};
    use static_assertions::const_assert_eq;

    use super::*;

    #[cfg(target_pointer_width = "64")]
    const_assert_eq!(mem::size_of::<Urb>(), 56);
    const_assert_eq!(mem::size_of::<IsoPacketDesc>(), 12);
    #[cfg(target_pointer_width = "64")]
    const_assert_eq!(mem::size_of::<CtrlTransfer>(), 24);
    #[cfg(target_pointer_width = "64")]
    const_assert_eq!(mem::size_of::<BulkTransfer>(), 24);
    const_assert_eq!(mem::size_of::<GetDriver>(), 260);
    const_assert_eq!(mem::size_of::<DisconnectClaim>(), 264);

    // The kernel's numeric request codes, as defined by
    // usbdevice_fs.h on 64-bit platforms.
    #[test]
    #[cfg(target_pointer_width = "64")]
    fn request_codes_match_the_kernel() {
        assert_eq!(
            request_code_readwrite!(b'U', 0, mem::size_of::<CtrlTransfer>()) as u32,
            0xC018_5500
        );
        assert_eq!(
            request_code_readwrite!(b'U', 2, mem::size_of::<BulkTransfer>()) as u32,
            0xC018_5502
        );
        assert_eq!(request_code_read!(b'U', 3, 4) as u32, 0x8004_5503);
        assert_eq!(
            request_code_read!(b'U', 4, mem::size_of::<SetInterface>()) as u32,
            0x8008_5504
        );
        assert_eq!(request_code_read!(b'U', 5, 4) as u32, 0x8004_5505);
        assert_eq!(
            request_code_write!(b'U', 8, mem::size_of::<GetDriver>()) as u32,
            0x4104_5508
        );
        assert_eq!(
            request_code_read!(b'U', 10, mem::size_of::<Urb>()) as u32,
            0x8038_550A
        );
        assert_eq!(request_code_none!(b'U', 11) as u32, 0x0000_550B);
        assert_eq!(
            request_code_write!(b'U', 12, mem::size_of::<*mut Urb>()) as u32,
            0x4008_550C
        );
        assert_eq!(
            request_code_write!(b'U', 13, mem::size_of::<*mut Urb>()) as u32,
            0x4008_550D
        );
        assert_eq!(request_code_read!(b'U', 15, 4) as u32, 0x8004_550F);
        assert_eq!(request_code_read!(b'U', 16, 4) as u32, 0x8004_5510);
        assert_eq!(
            request_code_readwrite!(b'U', 18, mem::size_of::<UsbfsIoctl>()) as u32,
            0xC010_5512
        );
        assert_eq!(request_code_none!(b'U', 20) as u32, 0x0000_5514);
        assert_eq!(request_code_read!(b'U', 21, 4) as u32, 0x8004_5515);
        assert_eq!(ioctls::USBDEVFS_DISCONNECT as u32, 0x0000_5516);
        assert_eq!(ioctls::USBDEVFS_CONNECT as u32, 0x0000_5517);
        assert_eq!(request_code_read!(b'U', 26, 4) as u32, 0x8004_551A);
        assert_eq!(
            request_code_read!(b'U', 27, mem::size_of::<DisconnectClaim>()) as u32,
            0x8108_551B
        );
        assert_eq!(request_code_read!(b'U', 28, 8) as u32, 0x8008_551C);
        assert_eq!(request_code_read!(b'U', 29, 8) as u32, 0x8008_551D);
        assert_eq!(request_code_none!(b'U', 31) as u32, 0x0000_551F);
    }

    #[test]
    fn urb_flag_values() {
        assert_eq!(UrbFlags::SHORT_NOT_OK.bits(), 0x01);
        assert_eq!(UrbFlags::ISO_ASAP.bits(), 0x02);
        assert_eq!(UrbFlags::BULK_CONTINUATION.bits(), 0x04);
        assert_eq!(UrbFlags::ZERO_PACKET.bits(), 0x40);
        assert_eq!(UrbFlags::NO_INTERRUPT.bits(), 0x80);
    }

    #[test]
    fn urb_block_layout() {
        let mut block = UrbBlock::new(4);
        assert_eq!(block.packet_descs().len(), 4);
        // Descriptors sit immediately after the header, as the kernel
        // expects.
        let base = block.as_raw() as usize;
        let descs = block.packet_descs().as_ptr() as usize;
        assert_eq!(descs - base, mem::size_of::<Urb>());

        for desc in block.packet_descs_mut() {
            desc.length = 1024;
        }
        assert!(block.packet_descs().iter().all(|d| d.length == 1024));
        assert_eq!(block.urb().status, 0);
    }

    #[test]
    fn speed_mapping() {
        assert_eq!(Speed::from_raw(1), Some(Speed::Low));
        assert_eq!(Speed::from_raw(3), Some(Speed::High));
        assert_eq!(Speed::from_raw(6), Some(Speed::SuperPlus));
        assert_eq!(Speed::from_raw(0), None);
        assert_eq!(Speed::from_raw(7), None);
    }
}
