use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by every operation in this crate.
///
/// Transient syscall results (`EINTR`/`EAGAIN` inside internal reap loops)
/// are retried and never reach the caller through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle is closed, or the device disappeared from the bus.
    #[error("no device")]
    NoDevice,

    /// The device node exists but is not accessible.
    #[error("permission denied")]
    PermissionDenied,

    /// Another opener holds the device, or a kernel driver holds the
    /// interface.
    #[error("device or resource busy")]
    Busy,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Kernel failure that does not match a more specific kind.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The running kernel lacks the requested capability.
    #[error("not supported")]
    NotSupported,

    #[error("operation timed out")]
    Timeout,

    /// Endpoint stall.
    #[error("pipe error")]
    Pipe,

    #[error("interrupted")]
    Interrupted,

    /// The kernel reported a short or overrun transfer.
    #[error("overflow")]
    Overflow,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classifies an errno from a usbfs call.
    pub fn from_errno(errno: Errno) -> Error {
        match errno {
            Errno::ENODEV | Errno::ESHUTDOWN | Errno::ENOENT => Error::NoDevice,
            Errno::EACCES | Errno::EPERM => Error::PermissionDenied,
            Errno::EBUSY => Error::Busy,
            Errno::EINVAL => Error::InvalidParameter("rejected by kernel"),
            Errno::ENOTTY | Errno::ENOSYS | Errno::EOPNOTSUPP => Error::NotSupported,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::EPIPE => Error::Pipe,
            Errno::EINTR => Error::Interrupted,
            Errno::EOVERFLOW => Error::Overflow,
            e => Error::Io(io::Error::from_raw_os_error(e as i32)),
        }
    }

    /// Classifies the status word of a completed URB. The kernel stores a
    /// negated errno there; zero means success and never reaches this
    /// function.
    pub fn from_urb_status(status: i32) -> Error {
        match Errno::from_raw(-status) {
            Errno::EPIPE => Error::Pipe,
            Errno::ENODEV | Errno::ESHUTDOWN => Error::NoDevice,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::EOVERFLOW => Error::Overflow,
            Errno::ENOENT | Errno::ECONNRESET => Error::Interrupted,
            _ => Error::Other(format!("URB completed with status {}", status)),
        }
    }
}
