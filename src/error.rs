//! Error types shared by every component of the layout wrapper.

use std::fmt;
use std::io;

/// A raw OS error number, mirroring `errno(3)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Operation not permitted / authentication refused by the data server.
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// Bad file descriptor: I/O attempted on a closed or never-opened handle.
    pub const EBADF: Errno = Errno(libc::EBADF);
    /// Generic I/O error, used when the transport does not report a more
    /// specific errno.
    pub const EIO: Errno = Errno(libc::EIO);
    /// Stale redirect from the metadata master; retried internally.
    pub const STALE_REDIRECT: Errno = Errno(3005);
    /// Sentinel used internally by Restore to signal a peek failure: never
    /// reported by a transport, and never retried regardless of policy.
    pub const RESTORE_ABORT: Errno = Errno(-1);

    /// The raw numeric value.
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }
}

impl From<i32> for Errno {
    fn from(value: i32) -> Self {
        Errno(value)
    }
}

/// The error kinds this crate's public operations can return, per the
/// error-handling design.
#[derive(Debug)]
pub enum WrapperError {
    /// I/O was attempted before the handle completed its open.
    NotOpen,
    /// I/O was attempted after `close` already ran.
    AlreadyClosed,
    /// The data server rejected the open as not-authorized.
    PermissionDenied,
    /// The transport reported a failure outside the cases above.
    Transport(Errno),
    /// The master's redirect response could not be parsed.
    MasterBadResponse,
    /// An inline repair request failed.
    RepairFailed,
    /// Restore was requested but the handle is not eligible.
    RestoreRefused,
    /// Restore ran but did not complete within its retry budget.
    RestoreFailed,
}

impl fmt::Display for WrapperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapperError::NotOpen => write!(f, "operation on a handle that is not open"),
            WrapperError::AlreadyClosed => write!(f, "operation on an already-closed handle"),
            WrapperError::PermissionDenied => write!(f, "permission denied by data server"),
            WrapperError::Transport(errno) => write!(f, "transport failure: {errno}"),
            WrapperError::MasterBadResponse => write!(f, "master returned an unparsable redirect"),
            WrapperError::RepairFailed => write!(f, "inline repair request failed"),
            WrapperError::RestoreRefused => write!(f, "cache entry not eligible for restore"),
            WrapperError::RestoreFailed => write!(f, "restore exhausted its retry budget"),
        }
    }
}

impl std::error::Error for WrapperError {}

impl From<WrapperError> for Errno {
    fn from(err: WrapperError) -> Self {
        match err {
            WrapperError::NotOpen | WrapperError::AlreadyClosed => Errno::EBADF,
            WrapperError::PermissionDenied => Errno::EPERM,
            WrapperError::Transport(errno) => errno,
            WrapperError::MasterBadResponse => Errno::EIO,
            WrapperError::RepairFailed => Errno::EIO,
            WrapperError::RestoreRefused => Errno::EIO,
            WrapperError::RestoreFailed => Errno::EIO,
        }
    }
}
