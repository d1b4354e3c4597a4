use std::{io, path::PathBuf};

use drm::control::{connector, crtc};

/// Errors thrown by the DRM backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device doesn't support a mandatory capability
    #[error("The device is missing the {0} capability")]
    MissingCapability(&'static str),
    /// Unable to determine the device id
    #[error("Unable to get the device id")]
    UnableToGetDeviceId(#[source] rustix::io::Errno),
    /// The session is inactive; commits fail fast until re-activation
    #[error("The session is inactive")]
    SessionInactive,
    /// No CRTC could be allocated for the connector
    #[error("No CRTC available for connector {0:?}")]
    NoCrtcForConnector(connector::Handle),
    /// An enabled commit requires a mode, but none is set or listed
    #[error("No mode set for connector {0:?}")]
    NoModeForConnector(connector::Handle),
    /// The kernel rejected the commit or test
    #[error("The kernel rejected the commit: {errmsg}")]
    KmsRejected {
        /// Description of the failed operation
        errmsg: &'static str,
        /// Underlying kernel error
        #[source]
        source: io::Error,
    },
    /// A page-flip is still pending and the commit was non-blocking
    #[error("A page-flip is still pending")]
    FrameInFlight,
    /// Tearing page-flips are not possible for this commit
    #[error("Tearing page-flips are not supported for this commit")]
    TearingUnsupported,
    /// The GPU was removed; the backend destroys itself
    #[error("The GPU was removed")]
    GpuRemoved,
    /// Generic access error while communicating with the kernel
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Logical error classification of a failed commit, driving recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// EBUSY-style failure: retry the commit later
    Transient,
    /// EINVAL-style failure: the configuration is invalid, surface to the caller
    Rejected,
    /// ENODEV/EPERM-style failure: the device is gone, destroy the backend
    Fatal,
}

impl CommitErrorKind {
    /// Classify a kernel error returned by a commit ioctl
    pub fn classify(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR) => CommitErrorKind::Transient,
            Some(libc::ENODEV) | Some(libc::EPERM) | Some(libc::ENXIO) => CommitErrorKind::Fatal,
            _ => CommitErrorKind::Rejected,
        }
    }
}

impl Error {
    /// Classification of this error for commit recovery decisions
    pub fn commit_kind(&self) -> CommitErrorKind {
        match self {
            Error::KmsRejected { source, .. } => CommitErrorKind::classify(source),
            Error::Access(AccessError { source, .. }) => CommitErrorKind::classify(source),
            Error::GpuRemoved => CommitErrorKind::Fatal,
            Error::FrameInFlight => CommitErrorKind::Transient,
            _ => CommitErrorKind::Rejected,
        }
    }
}

/// Failed access to the drm device
#[derive(Debug, thiserror::Error)]
#[error("Failed to access drm device ({errmsg}) on {dev:?}")]
pub struct AccessError {
    /// Description of the failed operation
    pub errmsg: &'static str,
    /// Device the operation was issued on
    pub dev: Option<PathBuf>,
    /// Underlying kernel error
    #[source]
    pub source: io::Error,
}

/// Errors of the framebuffer import cache
#[derive(Debug, thiserror::Error)]
pub enum FramebufferError {
    /// The buffer was previously poisoned; no import was attempted
    #[error("The buffer is poisoned, it cannot be imported into KMS")]
    Poisoned,
    /// Neither the buffer's format nor its opaque substitute is supported by
    /// the target plane
    #[error("Format {fourcc:?} with modifier {modifier:?} cannot be scanned out")]
    FormatUnsupported {
        /// Format of the buffer
        fourcc: crate::backend::allocator::Fourcc,
        /// Modifier of the buffer
        modifier: crate::backend::allocator::Modifier,
    },
    /// Converting the dmabuf file descriptors to GEM handles failed
    #[error("Failed to import dmabuf plane into GEM: {0}")]
    PrimeImport(#[source] io::Error),
    /// The kernel rejected the framebuffer; the buffer has been poisoned
    #[error("The kernel rejected the framebuffer: {0}")]
    KernelRejected(#[source] io::Error),
}

/// A commit affecting a crtc failed
#[derive(Debug, thiserror::Error)]
#[error("Commit on crtc {crtc:?} failed")]
pub struct CrtcCommitError {
    /// The crtc the commit was issued on
    pub crtc: crtc::Handle,
    /// The underlying error
    #[source]
    pub source: io::Error,
}
