//! Isochronous transfers and the streaming helper.
//!
//! An isochronous URB is the header immediately followed by one
//! descriptor per packet; the kernel writes each packet's actual
//! length and status back into those slots. Packet payloads sit in
//! one contiguous buffer at a fixed stride of the *requested* packet
//! length, never the actual length, which would corrupt every
//! packet after a short one.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use libc::c_void;
use log::{debug, trace, warn};
use nix::errno::Errno;

use crate::device::{DeviceHandle, HandleShared};
use crate::error::{Error, Result};
use crate::transfer::TransferStatus;
use crate::usbfs::{self, Urb, UrbFlags};

/// Result of one isochronous packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IsoPacket {
    /// Requested length; also the buffer stride.
    pub length: u32,
    pub actual_length: u32,
    /// Zero on success, a negated errno otherwise. Lost packets are
    /// normal for this transfer type.
    pub status: i32,
}

impl IsoPacket {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

struct IsoState {
    submitted: bool,
    reaped: bool,
    status: Option<TransferStatus>,
    error: Option<Error>,
    /// Sum of the successful packets' actual lengths.
    total_length: usize,
    packets: Vec<IsoPacket>,
}

struct IsoCore {
    block: UnsafeCell<usbfs::UrbBlock>,
    buffer: UnsafeCell<Vec<u8>>,
    /// Stable address of the URB header, safe to read without touching
    /// the (possibly kernel-owned) block.
    urb_raw: *mut Urb,
    state: Mutex<IsoState>,
    done: Condvar,
    endpoint: u8,
    num_packets: usize,
    packet_size: usize,
}

unsafe impl Send for IsoCore {}
unsafe impl Sync for IsoCore {}

impl IsoCore {
    fn new(endpoint: u8, num_packets: usize, packet_size: usize) -> Arc<IsoCore> {
        let block = usbfs::UrbBlock::new(num_packets);
        let urb_raw = block.as_raw();
        Arc::new(IsoCore {
            block: UnsafeCell::new(block),
            buffer: UnsafeCell::new(vec![0; num_packets * packet_size]),
            urb_raw,
            state: Mutex::new(IsoState {
                submitted: false,
                reaped: true,
                status: None,
                error: None,
                total_length: 0,
                packets: Vec::new(),
            }),
            done: Condvar::new(),
            endpoint,
            num_packets,
            packet_size,
        })
    }

    /// Readies the block for (re)submission. Every per-packet slot is
    /// restored (request length back to the packet size, actual
    /// length and status cleared) so a reused transfer carries as
    /// much data on the Nth submit as on the first.
    ///
    /// Caller must own the block (submitted flag false).
    fn prepare_submit(&self) {
        let block = unsafe { &mut *self.block.get() };
        let buffer = unsafe { &mut *self.buffer.get() };
        {
            let urb = block.urb_mut();
            urb.urb_type = usbfs::USBFS_URB_TYPE_ISO;
            urb.endpoint = self.endpoint;
            urb.status = 0;
            // The kernel picks the start frame.
            urb.flags = UrbFlags::ISO_ASAP.bits();
            urb.buffer = buffer.as_mut_ptr() as *mut c_void;
            urb.buffer_length = buffer.len() as i32;
            urb.actual_length = 0;
            urb.start_frame = 0;
            urb.packets_or_stream_id = self.num_packets as u32;
            urb.error_count = 0;
            urb.signr = 0;
        }
        for desc in block.packet_descs_mut() {
            desc.length = self.packet_size as u32;
            desc.actual_length = 0;
            desc.status = 0;
        }
    }

    fn mark_submitted(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.submitted {
            return Err(Error::Busy);
        }
        state.submitted = true;
        state.reaped = false;
        state.status = None;
        state.error = None;
        Ok(())
    }

    fn submit_failed(&self) {
        let mut state = self.state.lock().unwrap();
        state.submitted = false;
        state.reaped = true;
    }

    /// Completion: copy the kernel-written per-packet results out of
    /// the block, total up the good packets, wake waiters.
    fn complete(&self, result: Result<()>) {
        let block = unsafe { &*self.block.get() };
        let packets: Vec<IsoPacket> = block
            .packet_descs()
            .iter()
            .map(|desc| IsoPacket {
                length: desc.length,
                actual_length: desc.actual_length,
                status: desc.status as i32,
            })
            .collect();
        let total = packets
            .iter()
            .filter(|p| p.is_ok())
            .map(|p| p.actual_length as usize)
            .sum();

        let mut state = self.state.lock().unwrap();
        state.packets = packets;
        state.total_length = total;
        state.status = Some(TransferStatus::classify(&result));
        state.error = result.err();
        state.submitted = false;
        state.reaped = true;
        self.done.notify_all();
    }
}

/// A reusable isochronous transfer of `num_packets` packets of
/// `packet_size` bytes each.
pub struct IsoTransfer {
    handle: Arc<HandleShared>,
    core: Arc<IsoCore>,
}

impl IsoTransfer {
    pub fn new(
        handle: &DeviceHandle,
        endpoint: u8,
        num_packets: usize,
        packet_size: usize,
    ) -> Result<IsoTransfer> {
        if num_packets == 0 || packet_size == 0 {
            return Err(Error::InvalidParameter("empty isochronous transfer"));
        }
        Ok(IsoTransfer {
            handle: Arc::clone(handle.shared()),
            core: IsoCore::new(endpoint, num_packets, packet_size),
        })
    }

    pub fn num_packets(&self) -> usize {
        self.core.num_packets
    }
    pub fn packet_size(&self) -> usize {
        self.core.packet_size
    }
    pub fn endpoint(&self) -> u8 {
        self.core.endpoint
    }

    /// Copies outbound payload into the transfer buffer (OUT
    /// endpoints).
    pub fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.core.state.lock().unwrap();
        if state.submitted {
            return Err(Error::Busy);
        }
        // Hold the lock: the flag can't flip while we copy.
        let buffer = unsafe { &mut *self.core.buffer.get() };
        if data.len() > buffer.len() {
            return Err(Error::InvalidParameter("payload exceeds transfer buffer"));
        }
        buffer[..data.len()].copy_from_slice(data);
        drop(state);
        Ok(())
    }

    pub fn submit(&mut self) -> Result<()> {
        self.core.mark_submitted()?;
        self.core.prepare_submit();
        let core = Arc::clone(&self.core);
        match self.handle.submit_urb(
            self.core.urb_raw,
            Box::new(move |result| core.complete(result)),
        ) {
            Ok(()) => {
                trace!(
                    "submitted iso URB: {} x {} bytes to ep {:#04x}",
                    self.core.num_packets,
                    self.core.packet_size,
                    self.core.endpoint
                );
                Ok(())
            }
            Err(err) => {
                self.core.submit_failed();
                Err(err)
            }
        }
    }

    /// Blocks until completion; returns the summed actual length of
    /// the successful packets.
    pub fn wait(&self) -> Result<usize> {
        let mut state = self.core.state.lock().unwrap();
        while !state.reaped {
            state = self.core.done.wait(state).unwrap();
        }
        match state.status {
            None => Err(Error::InvalidParameter("transfer was never submitted")),
            Some(TransferStatus::Completed) => Ok(state.total_length),
            Some(status) => {
                let err = state.error.take().or_else(|| status.generic_error());
                Err(err.unwrap_or_else(|| Error::Other("transfer failed".into())))
            }
        }
    }

    /// Like [`IsoTransfer::wait`] with cancellation on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock().unwrap();
        while !state.reaped {
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                self.cancel()?;
                return Err(Error::Timeout);
            }
            let (guard, _) = self.core.done.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        drop(state);
        self.wait()
    }

    pub fn cancel(&self) -> Result<()> {
        let state = self.core.state.lock().unwrap();
        if !state.submitted {
            return Ok(());
        }
        drop(state);
        match unsafe { usbfs::discard_urb(self.handle.raw_fd(), self.core.urb_raw) } {
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    pub fn status(&self) -> Option<TransferStatus> {
        self.core.state.lock().unwrap().status
    }

    /// Per-packet results of the last completion.
    pub fn packets(&self) -> Vec<IsoPacket> {
        self.core.state.lock().unwrap().packets.clone()
    }

    /// Summed actual length of the successful packets.
    pub fn actual_length(&self) -> usize {
        self.core.state.lock().unwrap().total_length
    }

    /// Payload of packet `index` from the last completion. Offsets
    /// advance by the *requested* per-packet length (the kernel lays
    /// packets at that fixed stride); the slice spans the packet's
    /// actual length. Packets that errored yield `None`.
    pub fn packet_data(&self, index: usize) -> Option<&[u8]> {
        let state = self.core.state.lock().unwrap();
        if state.submitted || index >= state.packets.len() {
            return None;
        }
        let packet = state.packets[index];
        if !packet.is_ok() {
            return None;
        }
        let actual = packet.actual_length as usize;
        drop(state);
        let buffer = unsafe { &*self.core.buffer.get() };
        let offset = index * self.core.packet_size;
        buffer.get(offset..offset + actual)
    }
}

/// A frame handed to the [`IsoStream`] callback: one completed
/// transfer's packets and payload.
pub struct IsoFrame<'a> {
    packets: &'a [IsoPacket],
    buffer: &'a [u8],
    packet_size: usize,
}

impl IsoFrame<'_> {
    pub fn packets(&self) -> &[IsoPacket] {
        self.packets
    }

    /// Payload of packet `index`; requested-length stride, `None` for
    /// errored packets.
    pub fn packet_data(&self, index: usize) -> Option<&[u8]> {
        let packet = self.packets.get(index)?;
        if !packet.is_ok() {
            return None;
        }
        let offset = index * self.packet_size;
        self.buffer.get(offset..offset + packet.actual_length as usize)
    }

    /// Summed actual length of the successful packets.
    pub fn total_length(&self) -> usize {
        self.packets
            .iter()
            .filter(|p| p.is_ok())
            .map(|p| p.actual_length as usize)
            .sum()
    }
}

type FrameCallback = dyn Fn(IsoFrame<'_>) + Send + Sync;

struct StreamSlot {
    core: Arc<IsoCore>,
    urb: *mut Urb,
}

unsafe impl Send for StreamSlot {}
unsafe impl Sync for StreamSlot {}

struct StreamShared {
    handle: Arc<HandleShared>,
    slots: Vec<StreamSlot>,
    callback: Box<FrameCallback>,
    stopping: AtomicBool,
    active: Mutex<usize>,
    idle: Condvar,
}

impl StreamShared {
    fn retire_slot(&self) {
        let mut active = self.active.lock().unwrap();
        *active -= 1;
        if *active == 0 {
            self.idle.notify_all();
        }
    }
}

/// Continuous isochronous input: several transfers in flight at once
/// (three is the classic choice for webcam-grade streams), each handed
/// to the callback and resubmitted as it completes, so the bus never
/// starves while userspace looks at a frame.
///
/// The callback runs on the handle's reaper thread. It must stay
/// short, must not wait on another transfer of the same handle, and
/// must not call [`IsoStream::stop`] (stop from another thread);
/// resubmission itself is a non-blocking ioctl and is done for you.
pub struct IsoStream {
    shared: Arc<StreamShared>,
}

impl IsoStream {
    /// Allocates `num_transfers` transfers of `num_packets` ×
    /// `packet_size` bytes and submits them all.
    pub fn start(
        handle: &DeviceHandle,
        endpoint: u8,
        num_transfers: usize,
        num_packets: usize,
        packet_size: usize,
        callback: impl Fn(IsoFrame<'_>) + Send + Sync + 'static,
    ) -> Result<IsoStream> {
        if num_transfers == 0 || num_packets == 0 || packet_size == 0 {
            return Err(Error::InvalidParameter("empty isochronous stream"));
        }

        let slots = (0..num_transfers)
            .map(|_| {
                let core = IsoCore::new(endpoint, num_packets, packet_size);
                let urb = core.urb_raw;
                StreamSlot { core, urb }
            })
            .collect();
        let shared = Arc::new(StreamShared {
            handle: Arc::clone(handle.shared()),
            slots,
            callback: Box::new(callback),
            stopping: AtomicBool::new(false),
            active: Mutex::new(0),
            idle: Condvar::new(),
        });

        for index in 0..num_transfers {
            // Counted active before the submit: the completion (and
            // its retire) can land before submit_slot returns.
            *shared.active.lock().unwrap() += 1;
            if let Err(err) = submit_slot(&shared, index) {
                warn!("iso stream start: transfer {} failed: {}", index, err);
                *shared.active.lock().unwrap() -= 1;
                let stream = IsoStream { shared };
                stream.stop();
                return Err(err);
            }
        }

        Ok(IsoStream { shared })
    }

    /// Cancels every in-flight transfer and blocks until all of them
    /// have retired. Idempotent; also runs on drop.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let fd = self.shared.handle.raw_fd();
        loop {
            for slot in &self.shared.slots {
                if slot.core.state.lock().unwrap().submitted {
                    match unsafe { usbfs::discard_urb(fd, slot.urb) } {
                        Ok(()) | Err(Errno::EINVAL) => {}
                        Err(errno) => debug!("iso stream discard: {}", errno),
                    }
                }
            }
            // Re-discard until everything retires: a slot that was
            // between completion and resubmit is missed by one pass.
            let active = self.shared.active.lock().unwrap();
            if *active == 0 {
                break;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(active, Duration::from_millis(100))
                .unwrap();
            if *guard == 0 {
                break;
            }
            drop(guard);
        }
    }
}

impl Drop for IsoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn submit_slot(shared: &Arc<StreamShared>, index: usize) -> Result<()> {
    let slot = &shared.slots[index];
    slot.core.mark_submitted()?;
    slot.core.prepare_submit();
    let stream = Arc::clone(shared);
    match shared.handle.submit_urb(
        slot.urb,
        Box::new(move |result| slot_completed(&stream, index, result)),
    ) {
        Ok(()) => Ok(()),
        Err(err) => {
            slot.core.submit_failed();
            Err(err)
        }
    }
}

/// Runs on the reaper thread: record the completion, hand the frame
/// to the user, and put the transfer straight back on the bus.
fn slot_completed(shared: &Arc<StreamShared>, index: usize, result: Result<()>) {
    let slot = &shared.slots[index];
    let fatal = matches!(result, Err(Error::NoDevice));
    slot.core.complete(result);

    if fatal || shared.stopping.load(Ordering::SeqCst) {
        shared.retire_slot();
        return;
    }

    {
        // The transfer is idle between complete() and resubmission,
        // so borrowing its buffer here is exclusive. The packet copy
        // keeps the state mutex out of the callback's reach.
        let packets = slot.core.state.lock().unwrap().packets.clone();
        let buffer = unsafe { &*slot.core.buffer.get() };
        (shared.callback)(IsoFrame {
            packets: &packets,
            buffer,
            packet_size: slot.core.packet_size,
        });
    }

    // The callback may have asked for a stop.
    if shared.stopping.load(Ordering::SeqCst) {
        shared.retire_slot();
        return;
    }
    if let Err(err) = submit_slot(shared, index) {
        warn!("iso stream resubmit failed: {}", err);
        shared.retire_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::open_test_handle;

    #[test]
    fn rejects_empty_geometry() {
        let handle = open_test_handle();
        assert!(IsoTransfer::new(&handle, 0x81, 0, 1024).is_err());
        assert!(IsoTransfer::new(&handle, 0x81, 4, 0).is_err());
    }

    #[test]
    fn prepare_restores_packet_lengths() {
        let handle = open_test_handle();
        let transfer = IsoTransfer::new(&handle, 0x81, 4, 1024).unwrap();

        // Simulate a completed round that consumed the request
        // lengths, as the kernel does.
        {
            let block = unsafe { &mut *transfer.core.block.get() };
            for desc in block.packet_descs_mut() {
                desc.length = 0;
                desc.actual_length = 512;
                desc.status = 5;
            }
        }

        // Resubmission must restore every slot, or the next round
        // transfers nothing.
        transfer.core.prepare_submit();
        let block = unsafe { &*transfer.core.block.get() };
        for desc in block.packet_descs() {
            assert_eq!(desc.length, 1024);
            assert_eq!(desc.actual_length, 0);
            assert_eq!(desc.status, 0);
        }
        let urb = block.urb();
        assert_eq!(urb.urb_type, usbfs::USBFS_URB_TYPE_ISO);
        assert_eq!(urb.packets_or_stream_id, 4);
        assert_eq!(urb.flags, UrbFlags::ISO_ASAP.bits());
        assert_eq!(urb.buffer_length, 4 * 1024);
    }

    #[test]
    fn completion_totals_successful_packets_only() {
        let handle = open_test_handle();
        let transfer = IsoTransfer::new(&handle, 0x81, 3, 64).unwrap();
        transfer.core.prepare_submit();
        {
            let mut state = transfer.core.state.lock().unwrap();
            state.submitted = true;
            state.reaped = false;
        }
        {
            let block = unsafe { &mut *transfer.core.block.get() };
            let descs = block.packet_descs_mut();
            descs[0].actual_length = 64;
            descs[1].actual_length = 13;
            descs[1].status = (-71i32) as u32;
            descs[2].actual_length = 32;
        }
        transfer.core.complete(Ok(()));

        assert_eq!(transfer.wait().unwrap(), 96);
        let packets = transfer.packets();
        assert_eq!(packets.len(), 3);
        assert!(packets[0].is_ok());
        assert!(!packets[1].is_ok());
        assert_eq!(packets[1].status, -71);
        assert_eq!(transfer.actual_length(), 96);
    }

    #[test]
    fn packet_data_uses_requested_stride() {
        let handle = open_test_handle();
        let transfer = IsoTransfer::new(&handle, 0x81, 3, 8).unwrap();
        transfer.core.prepare_submit();
        {
            let buffer = unsafe { &mut *transfer.core.buffer.get() };
            buffer[0..4].copy_from_slice(b"aaaa");
            buffer[8..10].copy_from_slice(b"bb");
            buffer[16..19].copy_from_slice(b"ccc");
        }
        {
            let mut state = transfer.core.state.lock().unwrap();
            state.submitted = true;
            state.reaped = false;
        }
        {
            let block = unsafe { &mut *transfer.core.block.get() };
            let descs = block.packet_descs_mut();
            descs[0].actual_length = 4;
            descs[1].actual_length = 2;
            descs[2].actual_length = 3;
            descs[2].status = (-18i32) as u32;
        }
        transfer.core.complete(Ok(()));

        // Packet 1 starts at the 8-byte stride even though packet 0
        // only carried 4 bytes.
        assert_eq!(transfer.packet_data(0).unwrap(), b"aaaa");
        assert_eq!(transfer.packet_data(1).unwrap(), b"bb");
        assert_eq!(transfer.packet_data(2), None);
        assert_eq!(transfer.packet_data(3), None);
    }

    #[test]
    fn frame_view_stride_and_total() {
        let packets = [
            IsoPacket {
                length: 8,
                actual_length: 4,
                status: 0,
            },
            IsoPacket {
                length: 8,
                actual_length: 8,
                status: -5,
            },
            IsoPacket {
                length: 8,
                actual_length: 2,
                status: 0,
            },
        ];
        let buffer = *b"aaaa....bbbbbbbbcc......";
        let frame = IsoFrame {
            packets: &packets,
            buffer: &buffer,
            packet_size: 8,
        };
        assert_eq!(frame.packet_data(0).unwrap(), b"aaaa");
        assert_eq!(frame.packet_data(1), None);
        assert_eq!(frame.packet_data(2).unwrap(), b"cc");
        assert_eq!(frame.total_length(), 6);
    }
}
