//! Abstraction of session APIs
//!
//! Sessions provide a way for multiple graphical systems to run in parallel by
//! providing mechanisms to switch between and handle device access and
//! permissions for every running instance. They are crucial to allow
//! unprivileged processes to use graphical or input devices.
//!
//! A process holds at most one session; the DRM backend fails commits fast
//! while the session is inactive and restores state on re-activation.

pub mod libseat;

use std::os::unix::io::OwnedFd;
use std::path::Path;

use rustix::fs::OFlags;

/// General session interface
///
/// Provides a way to open and close devices and change the active vt.
pub trait Session {
    /// Error type of the implementation
    type Error: AsErrno;

    /// Opens a device at the given path with the given flags
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error>;
    /// Close a previously opened file descriptor
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error>;

    /// Change the currently active virtual terminal
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error>;

    /// Check if this session is currently active
    fn is_active(&self) -> bool;
    /// Which seat this session is on
    fn seat(&self) -> String;
}

/// Events generated by a session notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The session lost the seat; device access is revoked until the next
    /// activation and commits fail fast
    PauseSession,
    /// The session regained the seat (e.g. a VT switch back)
    ActivateSession,
}

/// Allows errors to be described by an error number
pub trait AsErrno: ::std::fmt::Debug {
    /// Returns the error number representing this error, if any
    fn as_errno(&self) -> Option<i32>;
}

impl AsErrno for () {
    fn as_errno(&self) -> Option<i32> {
        None
    }
}
