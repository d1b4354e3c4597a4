//! Explicit synchronization primitives
//!
//! Two kinds of objects cross the pipeline: DRM syncobj timelines
//! ([`SyncTimeline`]) carrying monotonically increasing points, and sync-file
//! file descriptors ([`SyncPoint`]) representing a single fence. A scene
//! render signals the output's input timeline; its exported sync-file becomes
//! the plane's `IN_FENCE_FD` and the CRTC's out-fence is imported back into a
//! caller-supplied signal timeline.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use drm::control::Device as ControlDevice;

use crate::backend::drm::DrmDeviceFd;

/// A fence backed by a sync-file file descriptor
///
/// An empty sync point is treated as already signalled.
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    fence: Option<Arc<OwnedFd>>,
}

impl SyncPoint {
    /// Create an already-signalled sync point
    pub fn signaled() -> Self {
        Default::default()
    }

    /// Create a sync point from a sync-file file descriptor
    pub fn from_sync_file(fd: OwnedFd) -> Self {
        SyncPoint {
            fence: Some(Arc::new(fd)),
        }
    }

    /// Access the underlying sync-file, if any
    pub fn sync_file(&self) -> Option<BorrowedFd<'_>> {
        self.fence.as_ref().map(|fd| fd.as_fd())
    }

    /// Check whether the fence already signalled without blocking
    pub fn is_reached(&self) -> bool {
        match &self.fence {
            None => true,
            Some(fd) => poll_fence(fd.as_fd(), Some(Duration::ZERO)).unwrap_or(false),
        }
    }

    /// Block until the fence signals or the timeout expires
    ///
    /// Returns `Ok(true)` if the fence signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match &self.fence {
            None => Ok(true),
            Some(fd) => poll_fence(fd.as_fd(), timeout),
        }
    }
}

fn poll_fence(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    use rustix::event::{PollFd, PollFlags};

    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    let timeout_ms: i32 = match timeout {
        Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    };
    let n = rustix::event::poll(&mut fds, timeout_ms)?;
    Ok(n > 0 && fds[0].revents().contains(PollFlags::IN))
}

// Linux dma-buf fence import/export (kernel >= 5.20, ioctl type 'b').
const DMA_BUF_IOCTL_EXPORT_SYNC_FILE: libc::c_ulong = 0xc008_6202; // _IOWR('b', 2, struct dma_buf_export_sync_file)
const DMA_BUF_IOCTL_IMPORT_SYNC_FILE: libc::c_ulong = 0x4008_6203; // _IOW('b', 3, struct dma_buf_import_sync_file)
const DMA_BUF_SYNC_READ: u32 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u32 = 1 << 1;

#[repr(C)]
struct DmaBufSyncFile {
    flags: u32,
    fd: i32,
}

/// Export the implicit read-fences of a dmabuf plane as a sync-file
///
/// Returns `None` when the kernel does not support the ioctl; callers fall
/// back to polling the dmabuf fd.
pub fn dmabuf_export_sync_file(plane: BorrowedFd<'_>, write: bool) -> io::Result<Option<OwnedFd>> {
    let mut arg = DmaBufSyncFile {
        flags: if write { DMA_BUF_SYNC_WRITE } else { DMA_BUF_SYNC_READ },
        fd: -1,
    };
    // SAFETY: the ioctl only writes to `arg.fd` on success
    let ret = unsafe { libc::ioctl(plane.as_raw_fd(), DMA_BUF_IOCTL_EXPORT_SYNC_FILE, &mut arg) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOTTY) | Some(libc::EINVAL) => Ok(None),
            _ => Err(err),
        };
    }
    // SAFETY: on success the kernel handed us a fresh sync-file fd
    Ok(Some(unsafe {
        std::os::unix::io::FromRawFd::from_raw_fd(arg.fd)
    }))
}

/// Attach a sync-file as an implicit write-fence of a dmabuf plane
pub fn dmabuf_import_sync_file(plane: BorrowedFd<'_>, sync_file: BorrowedFd<'_>) -> io::Result<bool> {
    let arg = DmaBufSyncFile {
        flags: DMA_BUF_SYNC_WRITE,
        fd: sync_file.as_raw_fd(),
    };
    // SAFETY: the ioctl only reads `arg`
    let ret = unsafe { libc::ioctl(plane.as_raw_fd(), DMA_BUF_IOCTL_IMPORT_SYNC_FILE, &arg) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOTTY) | Some(libc::EINVAL) => Ok(false),
            _ => Err(err),
        };
    }
    Ok(true)
}

#[derive(Debug)]
struct SyncTimelineInner {
    device: DrmDeviceFd,
    syncobj: drm::control::syncobj::Handle,
}

impl Drop for SyncTimelineInner {
    fn drop(&mut self) {
        let _ = self.device.destroy_syncobj(self.syncobj);
    }
}

/// A DRM syncobj timeline
///
/// The kernel object tracks a monotonically increasing point; individual
/// points can be exported as sync-files for interoperability with implicit
/// sync and plane `IN_FENCE_FD` properties.
#[derive(Debug, Clone)]
pub struct SyncTimeline(Arc<SyncTimelineInner>);

impl PartialEq for SyncTimeline {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for SyncTimeline {}

impl SyncTimeline {
    /// Create a new timeline on the given device
    pub fn new(device: &DrmDeviceFd) -> io::Result<Self> {
        let syncobj = device.create_syncobj(false)?;
        Ok(SyncTimeline(Arc::new(SyncTimelineInner {
            device: device.clone(),
            syncobj,
        })))
    }

    /// Import an existing timeline from a syncobj file descriptor
    pub fn from_fd(device: &DrmDeviceFd, fd: BorrowedFd<'_>) -> io::Result<Self> {
        let syncobj = device.fd_to_syncobj(fd, false)?;
        Ok(SyncTimeline(Arc::new(SyncTimelineInner {
            device: device.clone(),
            syncobj,
        })))
    }

    /// Signal a timeline point directly
    pub fn signal(&self, point: u64) -> io::Result<()> {
        self.0
            .device
            .syncobj_timeline_signal(&[self.0.syncobj], &[point])
    }

    /// Query the last signalled point
    pub fn query_signalled(&self) -> io::Result<u64> {
        let mut points = [0];
        self.0
            .device
            .syncobj_timeline_query(&[self.0.syncobj], &mut points, false)?;
        Ok(points[0])
    }

    /// Check whether a point has signalled without blocking
    pub fn check(&self, point: u64) -> io::Result<bool> {
        Ok(self.query_signalled()? >= point)
    }

    /// Export a single point as a sync-file
    ///
    /// The point has to have materialized already, i.e. a fence must be
    /// attached to it, otherwise the export fails.
    pub fn export_sync_file(&self, point: u64) -> io::Result<OwnedFd> {
        let device = &self.0.device;
        let binary = device.create_syncobj(false)?;
        if let Err(err) = device.syncobj_timeline_transfer(self.0.syncobj, binary, point, 0) {
            let _ = device.destroy_syncobj(binary);
            return Err(err);
        }
        let res = device.syncobj_to_fd(binary, true);
        let _ = device.destroy_syncobj(binary);
        res
    }

    /// Import a sync-file as the fence of a timeline point
    pub fn import_sync_file(&self, point: u64, sync_file: BorrowedFd<'_>) -> io::Result<()> {
        let device = &self.0.device;
        let binary = device.fd_to_syncobj(sync_file, true)?;
        let res = device.syncobj_timeline_transfer(binary, self.0.syncobj, 0, point);
        let _ = device.destroy_syncobj(binary);
        res
    }
}

/// A single point on a [`SyncTimeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelinePoint {
    /// The timeline the point lives on
    pub timeline: SyncTimeline,
    /// The point value
    pub point: u64,
}
