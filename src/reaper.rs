//! Completion multiplexing for asynchronous URBs.
//!
//! usbfs exposes a single completion stream per open fd: a reap call
//! blocks until *any* submitted URB finishes and hands back a pointer
//! to it. One competing reaper per transfer would steal each other's
//! completions, so each handle runs at most one reaper thread and
//! multiplexes it over every outstanding transfer through the pending
//! map below.
//!
//! The map key is a library-assigned id carried in the URB's
//! `usercontext` word, so correctness never depends on the block's
//! address. Entries hold a one-shot callback plus the block address
//! (the latter only so close can discard in-flight URBs).

use std::collections::HashMap;
use std::process;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use libc::c_void;
use log::{debug, error, trace, warn};
use nix::errno::Errno;

use crate::device::HandleShared;
use crate::error::Error;
use crate::usbfs::{self, Urb};

pub(crate) type CompletionFn = Box<dyn FnOnce(Result<(), Error>) + Send>;

pub(crate) struct PendingEntry {
    /// Address of the submitted URB block, for discard at close.
    pub urb: usize,
    pub complete: CompletionFn,
}

struct Pending {
    map: HashMap<u64, PendingEntry>,
    /// Whether a reaper worker is active for this handle.
    reaping: bool,
    /// Set at close, under the map mutex, so no submit can slip in
    /// after the drain.
    closed: bool,
    next_id: u64,
}

/// Per-handle registry of in-flight URBs. Guarded by its own mutex,
/// separate from the handle's rwlock, so the reaper can wake the
/// handle during close without deadlocking.
pub(crate) struct PendingUrbs {
    inner: Mutex<Pending>,
    exited: Condvar,
}

pub(crate) enum SubmitSlot {
    /// Entry registered; `true` when the caller must start the worker.
    Registered { id: u64, start_worker: bool },
    Closed,
}

impl PendingUrbs {
    pub fn new() -> PendingUrbs {
        PendingUrbs {
            inner: Mutex::new(Pending {
                map: HashMap::new(),
                reaping: false,
                closed: false,
                next_id: 1,
            }),
            exited: Condvar::new(),
        }
    }

    /// Registers a completion callback for `urb` and stamps the
    /// assigned id into its `usercontext` word. Must happen before
    /// the submit ioctl.
    pub fn begin_submit(&self, urb: *mut Urb, complete: CompletionFn) -> SubmitSlot {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return SubmitSlot::Closed;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        unsafe { (*urb).usercontext = id as usize as *mut c_void };
        let prev = inner.map.insert(
            id,
            PendingEntry {
                urb: urb as usize,
                complete,
            },
        );
        debug_assert!(prev.is_none());
        let start_worker = !inner.reaping;
        inner.reaping = true;
        SubmitSlot::Registered { id, start_worker }
    }

    /// Registers the close-time wake URB. Unlike [`Self::begin_submit`]
    /// this works on a closed registry (the wake only exists to get a
    /// blocked worker to observe the closed flag), but refuses when no
    /// worker is running.
    fn register_wake(&self, urb: *mut Urb, complete: CompletionFn) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reaping {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        unsafe { (*urb).usercontext = id as usize as *mut c_void };
        inner.map.insert(
            id,
            PendingEntry {
                urb: urb as usize,
                complete,
            },
        );
        Some(id)
    }

    /// Removes an entry; used by the worker on completion and by the
    /// submit path when the submit ioctl fails.
    pub fn remove(&self, id: u64) -> Option<PendingEntry> {
        self.inner.lock().unwrap().map.remove(&id)
    }

    /// Reverts the reaping flag after a worker failed to spawn.
    pub fn cancel_worker(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reaping = false;
        self.exited.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// Atomically takes every pending entry (for a drain).
    fn take_entries(&self) -> Vec<PendingEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.drain().map(|(_, entry)| entry).collect()
    }

    /// Publishes worker exit. Callbacks for drained entries must have
    /// run already: close returns as soon as this flips.
    fn mark_exited(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reaping = false;
        self.exited.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Marks the registry closed and returns the block addresses of
    /// everything still in flight plus whether a worker is running.
    pub fn close(&self) -> (Vec<usize>, bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let urbs = inner.map.values().map(|entry| entry.urb).collect();
        (urbs, inner.reaping)
    }

    /// Blocks until the worker publishes its exit.
    pub fn wait_exited(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.reaping {
            let (guard, timeout) = self
                .exited
                .wait_timeout(inner, Duration::from_secs(1))
                .unwrap();
            inner = guard;
            if timeout.timed_out() && inner.reaping {
                warn!("close: still waiting for the URB reaper to exit");
            }
        }
    }
}

/// The per-handle worker. Blocks in the kernel's reap call and routes
/// every completion to its registered callback, in the order the
/// kernel delivers them. Exits when the handle closes or the reap
/// call fails terminally, after giving every leftover entry exactly
/// one synthetic completion.
pub(crate) fn run(shared: Arc<HandleShared>) {
    let fd = shared.raw_fd();
    trace!("reaper running on fd {}", fd);

    loop {
        if shared.pending.is_closed() {
            drain(&shared.pending, || Error::NoDevice);
            trace!("reaper exited: handle closed");
            return;
        }

        let urb = match usbfs::reap_urb(fd) {
            Ok(urb) => urb,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(errno) => {
                debug!("reap on fd {} failed: {}", fd, errno);
                drain(&shared.pending, || Error::from_errno(errno));
                return;
            }
        };

        // The kernel hands back the address of a block we submitted;
        // the id we stamped into usercontext finds its owner.
        let (id, status) = unsafe { ((*urb).usercontext as usize as u64, (*urb).status) };
        let Some(entry) = shared.pending.remove(id) else {
            // A completion for an unregistered URB means the pending
            // map and the kernel disagree about what is in flight;
            // memory safety is already gone.
            error!("reaped URB {:p} (id {}) with no pending entry", urb, id);
            process::abort();
        };
        debug_assert_eq!(entry.urb, urb as usize);
        trace!("URB id {} completed with status {}", id, status);

        let result = if status == 0 {
            Ok(())
        } else {
            Err(Error::from_urb_status(status))
        };
        // No locks held: the callback may resubmit.
        (entry.complete)(result);
    }
}

fn drain(pending: &PendingUrbs, err: impl Fn() -> Error) {
    let entries = pending.take_entries();
    if !entries.is_empty() {
        debug!("delivering {} synthetic completions", entries.len());
    }
    for entry in entries {
        (entry.complete)(Err(err()));
    }
    pending.mark_exited();
}

/// Close-time wake: a reaper blocked in `REAPURB` with nothing in
/// flight never returns on its own, so close submits a throwaway
/// GET_STATUS URB whose completion (or error) gets it moving again.
pub(crate) struct WakeUrb {
    block: usbfs::UrbBlock,
    buf: Box<[u8; 10]>,
}

unsafe impl Send for WakeUrb {}

impl WakeUrb {
    pub fn submit(shared: &HandleShared) -> bool {
        let mut wake = WakeUrb {
            block: usbfs::UrbBlock::new(0),
            buf: Box::new([0; 10]),
        };
        let setup = crate::usb::Setup::get_status(0, 0);
        wake.buf[..8].copy_from_slice(unsafe {
            std::slice::from_raw_parts(&setup as *const _ as *const u8, 8)
        });
        {
            let urb = wake.block.urb_mut();
            urb.urb_type = usbfs::USBFS_URB_TYPE_CONTROL;
            urb.endpoint = 0;
            urb.buffer = wake.buf.as_mut_ptr() as *mut c_void;
            urb.buffer_length = wake.buf.len() as i32;
        }
        let urb = wake.block.as_raw();
        // The callback owns the block, keeping it pinned until the
        // reaper hands it back (or the drain drops it).
        let Some(id) = shared
            .pending
            .register_wake(urb, Box::new(move |_| drop(wake)))
        else {
            return false;
        };
        match unsafe { usbfs::submit_urb(shared.raw_fd(), urb) } {
            Ok(()) => true,
            Err(errno) => {
                debug!("wake URB submit failed: {}", errno);
                shared.pending.remove(id);
                false
            }
        }
    }
}
