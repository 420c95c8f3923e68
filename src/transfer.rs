//! Asynchronous bulk, interrupt, and control transfers.
//!
//! A [`Transfer`] owns a heap-pinned URB block and a reusable payload
//! buffer. Submitting registers a completion with the handle's reaper
//! and hands the block to the kernel; waiting parks on a condition
//! variable the completion broadcasts. Between submit and completion
//! the block and buffer belong to the kernel and the reaper, which is
//! why both live behind `UnsafeCell` inside an `Arc` the completion
//! callback keeps alive.

use std::cell::UnsafeCell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use libc::c_void;
use log::trace;
use nix::errno::Errno;

use crate::device::{DeviceHandle, HandleShared};
use crate::error::{Error, Result};
use crate::usb::Setup;
use crate::usbfs::{self, UrbFlags};

/// Outcome of a completed transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    Completed,
    /// Generic failure; `wait` carries the specific error.
    Failed,
    TimedOut,
    Cancelled,
    /// Endpoint stall.
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub(crate) fn classify(result: &Result<()>) -> TransferStatus {
        match result {
            Ok(()) => TransferStatus::Completed,
            Err(Error::Pipe) => TransferStatus::Stall,
            Err(Error::NoDevice) => TransferStatus::NoDevice,
            Err(Error::Timeout) => TransferStatus::TimedOut,
            Err(Error::Overflow) => TransferStatus::Overflow,
            // A discarded URB completes with -ENOENT or -ECONNRESET,
            // both of which classify as interruptions.
            Err(Error::Interrupted) => TransferStatus::Cancelled,
            Err(_) => TransferStatus::Failed,
        }
    }

    pub(crate) fn generic_error(self) -> Option<Error> {
        match self {
            TransferStatus::Completed => None,
            TransferStatus::Stall => Some(Error::Pipe),
            TransferStatus::NoDevice => Some(Error::NoDevice),
            TransferStatus::TimedOut => Some(Error::Timeout),
            TransferStatus::Cancelled => Some(Error::Interrupted),
            TransferStatus::Overflow => Some(Error::Overflow),
            TransferStatus::Failed => Some(Error::Other("transfer failed".into())),
        }
    }
}

pub(crate) struct TransferState {
    pub submitted: bool,
    pub reaped: bool,
    pub status: Option<TransferStatus>,
    /// The completion's error, taken by the first waiter.
    pub error: Option<Error>,
    pub actual_length: usize,
}

/// Shared between the owning [`Transfer`] and the reaper's completion
/// callback. The URB block and buffer are owned by the submitter
/// while `submitted` is false and by the kernel/reaper in between.
pub(crate) struct TransferCore {
    pub block: UnsafeCell<usbfs::UrbBlock>,
    pub buffer: UnsafeCell<Vec<u8>>,
    pub state: Mutex<TransferState>,
    pub done: Condvar,
}

unsafe impl Send for TransferCore {}
unsafe impl Sync for TransferCore {}

impl TransferCore {
    pub fn new(packets: usize, buffer: Vec<u8>) -> Arc<TransferCore> {
        Arc::new(TransferCore {
            block: UnsafeCell::new(usbfs::UrbBlock::new(packets)),
            buffer: UnsafeCell::new(buffer),
            state: Mutex::new(TransferState {
                submitted: false,
                // A fresh transfer is idle: wait() must not block.
                reaped: true,
                status: None,
                error: None,
                actual_length: 0,
            }),
            done: Condvar::new(),
        })
    }

    /// Completion delivery: copy what the kernel wrote out of the URB,
    /// flip the flags, wake every waiter. Runs on the reaper thread
    /// (or inline when close drains), so it must stay short and never
    /// block.
    pub fn complete(&self, result: Result<()>) {
        let actual = unsafe { (*self.block.get()).urb().actual_length }.max(0) as usize;
        let mut state = self.state.lock().unwrap();
        state.actual_length = actual;
        state.status = Some(TransferStatus::classify(&result));
        state.error = result.err();
        state.submitted = false;
        state.reaped = true;
        self.done.notify_all();
    }

    pub fn take_result(mut state: MutexGuard<'_, TransferState>) -> Result<usize> {
        match state.status {
            None => Err(Error::InvalidParameter("transfer was never submitted")),
            Some(TransferStatus::Completed) => Ok(state.actual_length),
            Some(status) => {
                let err = state.error.take().or_else(|| status.generic_error());
                Err(err.unwrap_or_else(|| Error::Other("transfer failed".into())))
            }
        }
    }
}

const CONTROL_SETUP_LEN: usize = 8;

fn setup_bytes(setup: &Setup) -> [u8; CONTROL_SETUP_LEN] {
    let value = { setup.value }.to_le_bytes();
    let index = { setup.index }.to_le_bytes();
    let length = { setup.length }.to_le_bytes();
    [
        setup.kind, setup.request, value[0], value[1], index[0], index[1], length[0], length[1],
    ]
}

/// One asynchronous bulk, interrupt, or control transfer, reusable
/// across submits.
pub struct Transfer {
    handle: Arc<HandleShared>,
    core: Arc<TransferCore>,
    endpoint: u8,
    urb_type: u8,
    flags: UrbFlags,
    stream_id: u32,
}

impl Transfer {
    /// Bulk transfer towards `endpoint` with a `len`-byte payload
    /// buffer (filled with [`Transfer::set_buffer`] for OUT
    /// endpoints).
    pub fn bulk(handle: &DeviceHandle, endpoint: u8, len: usize) -> Transfer {
        Transfer {
            handle: Arc::clone(handle.shared()),
            core: TransferCore::new(0, vec![0; len]),
            endpoint,
            urb_type: usbfs::USBFS_URB_TYPE_BULK,
            flags: UrbFlags::empty(),
            stream_id: 0,
        }
    }

    pub fn interrupt(handle: &DeviceHandle, endpoint: u8, len: usize) -> Transfer {
        Transfer {
            urb_type: usbfs::USBFS_URB_TYPE_INTERRUPT,
            ..Transfer::bulk(handle, endpoint, len)
        }
    }

    /// Device-to-host control transfer requesting `len` bytes.
    pub fn control_in(
        handle: &DeviceHandle,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: u16,
    ) -> Transfer {
        let setup = Setup {
            kind: request_type | 0x80,
            request,
            value,
            index,
            length: len,
        };
        let mut buffer = vec![0u8; CONTROL_SETUP_LEN + usize::from(len)];
        buffer[..CONTROL_SETUP_LEN].copy_from_slice(&setup_bytes(&setup));
        Transfer {
            handle: Arc::clone(handle.shared()),
            core: TransferCore::new(0, buffer),
            endpoint: 0,
            urb_type: usbfs::USBFS_URB_TYPE_CONTROL,
            flags: UrbFlags::empty(),
            stream_id: 0,
        }
    }

    /// Host-to-device control transfer carrying `data`.
    pub fn control_out(
        handle: &DeviceHandle,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<Transfer> {
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidParameter("control payload exceeds 64 KiB"));
        }
        let setup = Setup {
            kind: request_type & !0x80,
            request,
            value,
            index,
            length: data.len() as u16,
        };
        let mut buffer = vec![0u8; CONTROL_SETUP_LEN + data.len()];
        buffer[..CONTROL_SETUP_LEN].copy_from_slice(&setup_bytes(&setup));
        buffer[CONTROL_SETUP_LEN..].copy_from_slice(data);
        Ok(Transfer {
            handle: Arc::clone(handle.shared()),
            core: TransferCore::new(0, buffer),
            endpoint: 0,
            urb_type: usbfs::USBFS_URB_TYPE_CONTROL,
            flags: UrbFlags::empty(),
            stream_id: 0,
        })
    }

    fn data_offset(&self) -> usize {
        if self.urb_type == usbfs::USBFS_URB_TYPE_CONTROL {
            CONTROL_SETUP_LEN
        } else {
            0
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Replaces the payload of a bulk or interrupt transfer (control
    /// transfers carry their setup packet in the buffer and are
    /// rebuilt instead).
    pub fn set_buffer(&mut self, data: &[u8]) -> Result<()> {
        if self.urb_type == usbfs::USBFS_URB_TYPE_CONTROL {
            return Err(Error::InvalidParameter(
                "control transfers take data at construction",
            ));
        }
        if self.core.state.lock().unwrap().submitted {
            return Err(Error::Busy);
        }
        let buffer = unsafe { &mut *self.core.buffer.get() };
        buffer.clear();
        buffer.extend_from_slice(data);
        Ok(())
    }

    /// URB flags for the next submit (e.g. `ZERO_PACKET` for bulk OUT
    /// ending on a packet boundary).
    pub fn set_flags(&mut self, flags: UrbFlags) {
        self.flags = flags;
    }

    /// Targets an allocated bulk stream; takes effect on the next
    /// submit.
    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    /// Hands the transfer to the kernel. The buffer and URB block are
    /// pinned and untouched until the completion comes back.
    pub fn submit(&mut self) -> Result<()> {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.submitted {
                return Err(Error::Busy);
            }
            state.submitted = true;
            state.reaped = false;
            state.status = None;
            state.error = None;
            state.actual_length = 0;
        }

        let urb_ptr = {
            let block = unsafe { &mut *self.core.block.get() };
            let buffer = unsafe { &mut *self.core.buffer.get() };
            let urb = block.urb_mut();
            urb.urb_type = self.urb_type;
            urb.endpoint = self.endpoint;
            urb.status = 0;
            urb.flags = self.flags.bits();
            urb.buffer = buffer.as_mut_ptr() as *mut c_void;
            urb.buffer_length = buffer.len() as i32;
            urb.actual_length = 0;
            urb.start_frame = 0;
            urb.packets_or_stream_id = self.stream_id;
            urb.error_count = 0;
            urb.signr = 0;
            block.as_raw()
        };

        let len = unsafe { (*self.core.buffer.get()).len() };
        let core = Arc::clone(&self.core);
        match self
            .handle
            .submit_urb(urb_ptr, Box::new(move |result| core.complete(result)))
        {
            Ok(()) => {
                trace!("submitted {} bytes to ep {:#04x}", len, self.endpoint);
                Ok(())
            }
            Err(err) => {
                let mut state = self.core.state.lock().unwrap();
                state.submitted = false;
                state.reaped = true;
                Err(err)
            }
        }
    }

    /// Blocks until the completion has been delivered. Returns the
    /// kernel-reported actual length.
    pub fn wait(&self) -> Result<usize> {
        let mut state = self.core.state.lock().unwrap();
        while !state.reaped {
            state = self.core.done.wait(state).unwrap();
        }
        TransferCore::take_result(state)
    }

    /// Like [`Transfer::wait`], but cancels the transfer and returns
    /// `Timeout` once `timeout` elapses. The discarded URB's
    /// completion is still delivered to this transfer's state later,
    /// which stays valid for reuse.
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
            let (guard, _) = self
                .core
                .done
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        TransferCore::take_result(state)
    }

    /// Best-effort cancellation; the URB still completes (with a
    /// non-zero status) through the reaper.
    pub fn cancel(&self) -> Result<()> {
        let state = self.core.state.lock().unwrap();
        if !state.submitted {
            return Ok(());
        }
        let urb = unsafe { (*self.core.block.get()).as_raw() };
        drop(state);
        match unsafe { usbfs::discard_urb(self.handle.raw_fd(), urb) } {
            // EINVAL: already dequeued by the reaper.
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(errno) => Err(Error::from_errno(errno)),
        }
    }

    /// Status of the last completion, `None` before the first one.
    pub fn status(&self) -> Option<TransferStatus> {
        self.core.state.lock().unwrap().status
    }

    pub fn actual_length(&self) -> usize {
        self.core.state.lock().unwrap().actual_length
    }

    /// The received payload of the last completion (empty while the
    /// transfer is in flight).
    pub fn data(&self) -> &[u8] {
        let state = self.core.state.lock().unwrap();
        if state.submitted {
            return &[];
        }
        let actual = state.actual_length;
        drop(state);
        let buffer = unsafe { &*self.core.buffer.get() };
        let start = self.data_offset().min(buffer.len());
        let end = (start + actual).min(buffer.len());
        &buffer[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::open_test_handle;

    #[test]
    fn failed_submit_resets_state_and_leaves_no_trace() {
        let handle = open_test_handle();
        let mut transfer = Transfer::bulk(&handle, 0x81, 64);

        // /dev/null rejects the submit ioctl, so the entry must be
        // gone and the transfer reusable.
        assert!(transfer.submit().is_err());
        assert_eq!(handle.shared().pending.len(), 0);
        assert!(transfer.status().is_none());
        assert!(matches!(
            transfer.wait(),
            Err(Error::InvalidParameter("transfer was never submitted"))
        ));
        // A second attempt is not "Busy".
        assert!(!matches!(transfer.submit(), Err(Error::Busy)));
    }

    #[test]
    fn wait_before_submit_does_not_block() {
        let handle = open_test_handle();
        let transfer = Transfer::interrupt(&handle, 0x83, 8);
        assert!(matches!(
            transfer.wait(),
            Err(Error::InvalidParameter("transfer was never submitted"))
        ));
    }

    #[test]
    fn completion_copies_urb_results() {
        let handle = open_test_handle();
        let transfer = Transfer::bulk(&handle, 0x81, 32);

        {
            let mut state = transfer.core.state.lock().unwrap();
            state.submitted = true;
            state.reaped = false;
        }
        unsafe {
            (*transfer.core.block.get()).urb_mut().actual_length = 12;
        }
        transfer.core.complete(Ok(()));

        assert_eq!(transfer.wait().unwrap(), 12);
        assert_eq!(transfer.status(), Some(TransferStatus::Completed));
        assert_eq!(transfer.actual_length(), 12);
        assert_eq!(transfer.data().len(), 12);
    }

    #[test]
    fn completion_classifies_stall() {
        let handle = open_test_handle();
        let transfer = Transfer::bulk(&handle, 0x02, 16);
        {
            let mut state = transfer.core.state.lock().unwrap();
            state.submitted = true;
            state.reaped = false;
        }
        transfer.core.complete(Err(Error::from_urb_status(-32)));
        assert_eq!(transfer.status(), Some(TransferStatus::Stall));
        assert!(matches!(transfer.wait(), Err(Error::Pipe)));
        // The error was taken by the first wait; later waits still
        // report the stall.
        assert!(matches!(transfer.wait(), Err(Error::Pipe)));
    }

    #[test]
    fn control_buffer_carries_setup_packet() {
        let handle = open_test_handle();
        let transfer = Transfer::control_in(&handle, 0x00, 0x06, 0x0301, 0x0409, 255);
        let buffer = unsafe { &*transfer.core.buffer.get() };
        assert_eq!(buffer.len(), 8 + 255);
        assert_eq!(&buffer[..8], &[0x80, 0x06, 0x01, 0x03, 0x09, 0x04, 0xFF, 0x00]);
    }

    #[test]
    fn control_out_embeds_data() {
        let handle = open_test_handle();
        let transfer =
            Transfer::control_out(&handle, 0x21, 0x09, 0x0200, 0x0000, &[1, 2, 3]).unwrap();
        let buffer = unsafe { &*transfer.core.buffer.get() };
        assert_eq!(&buffer[..8], &[0x21, 0x09, 0x00, 0x02, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(&buffer[8..], &[1, 2, 3]);
    }

    #[test]
    fn set_buffer_rejected_while_submitted() {
        let handle = open_test_handle();
        let mut transfer = Transfer::bulk(&handle, 0x02, 4);
        transfer.core.state.lock().unwrap().submitted = true;
        assert!(matches!(transfer.set_buffer(&[0; 4]), Err(Error::Busy)));
        transfer.core.state.lock().unwrap().submitted = false;
        transfer.set_buffer(&[1, 2]).unwrap();
        assert_eq!(unsafe { &*transfer.core.buffer.get() }.as_slice(), &[1, 2]);
    }
}
