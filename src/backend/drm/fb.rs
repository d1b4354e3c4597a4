//! Framebuffer import cache
//!
//! Client buffers reach the backend as dmabufs and have to be wrapped into
//! KMS framebuffer objects before a plane can scan them out. The import is a
//! syscall chain (PRIME fd → GEM handle → `ADDFB2`) worth caching: each
//! dmabuf gets at most one framebuffer per backend, and a buffer whose import
//! failed is *poisoned* so the cache never retries the syscalls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd};
use std::rc::Rc;

use drm::buffer::{Buffer as DrmBuffer, PlanarBuffer};
use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};

use tracing::{debug, trace, warn};

use crate::backend::allocator::dmabuf::{Dmabuf, WeakDmabuf, MAX_PLANES};
use crate::backend::allocator::format::{get_bpp, get_depth, get_opaque, FormatSet};
use crate::backend::allocator::{Buffer, Format, Fourcc, Modifier};

use super::error::FramebufferError;
use super::fd::DrmDeviceFd;

// DRM_IOCTL_MODE_CLOSEFB, only available on recent kernels.
// Preferred over RMFB because it does not implicitly disable the plane.
const DRM_IOCTL_MODE_CLOSEFB: libc::c_ulong = 0xc008_64d0; // _IOWR('d', 0xD0, struct drm_mode_closefb)

#[repr(C)]
struct DrmModeCloseFb {
    fb_id: u32,
    pad: u32,
}

#[derive(Debug)]
struct DrmFramebufferInner {
    device: DrmDeviceFd,
    handle: framebuffer::Handle,
    format: Format,
    size: (u32, u32),
    buffer: WeakDmabuf,
}

impl Drop for DrmFramebufferInner {
    fn drop(&mut self) {
        let arg = DrmModeCloseFb {
            fb_id: Into::<u32>::into(self.handle),
            pad: 0,
        };
        // SAFETY: the ioctl only reads `arg`
        let ret = unsafe { libc::ioctl(self.device.as_raw_fd(), DRM_IOCTL_MODE_CLOSEFB, &arg) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTTY)) {
                if let Err(err) = self.device.destroy_framebuffer(self.handle) {
                    warn!("Failed to destroy framebuffer: {}", err);
                }
            } else {
                warn!("Failed to close framebuffer: {}", err);
            }
        }
    }
}

/// A KMS framebuffer wrapping an imported dmabuf
///
/// Cloning is cheap; the framebuffer is closed once the last clone drops.
#[derive(Debug, Clone)]
pub struct DrmFramebuffer(Rc<DrmFramebufferInner>);

impl DrmFramebuffer {
    /// The KMS id of this framebuffer
    pub fn handle(&self) -> framebuffer::Handle {
        self.0.handle
    }

    /// The format the framebuffer was imported with
    ///
    /// May differ from the buffer format when the opaque substitute was used.
    pub fn format(&self) -> Format {
        self.0.format
    }

    /// Dimensions of the framebuffer
    pub fn size(&self) -> (u32, u32) {
        self.0.size
    }

    /// The buffer backing this framebuffer, if it is still alive
    pub fn buffer(&self) -> Option<Dmabuf> {
        self.0.buffer.upgrade()
    }
}

impl PartialEq for DrmFramebuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for DrmFramebuffer {}

/// A framebuffer attached to a plane slot, keeping the buffer locked
///
/// The buffer lock is only released when the slot is replaced or dropped,
/// never while the framebuffer may still be scanned out.
#[derive(Debug, Clone)]
pub(crate) struct PlaneFb {
    pub fb: DrmFramebuffer,
    // holds the buffer alive while attached
    pub buffer: Dmabuf,
}

impl PlaneFb {
    pub(crate) fn new(fb: DrmFramebuffer, buffer: Dmabuf) -> Self {
        PlaneFb { fb, buffer }
    }
}

#[derive(Debug)]
enum CacheEntry {
    Imported(DrmFramebuffer),
    Poisoned,
}

/// Per-backend framebuffer cache
#[derive(Debug, Default)]
pub(crate) struct FramebufferCache {
    entries: RefCell<HashMap<WeakDmabuf, CacheEntry>>,
}

impl FramebufferCache {
    /// Import a buffer, or return the cached framebuffer
    ///
    /// When `formats` is given and the buffer's (format, modifier) pair is
    /// absent from it, the format-info table's opaque substitute is tried
    /// before failing. A kernel rejection poisons the buffer.
    pub fn import(
        &self,
        device: &DrmDeviceFd,
        addfb2_modifiers: bool,
        buffer: &Dmabuf,
        formats: Option<&FormatSet>,
    ) -> Result<DrmFramebuffer, FramebufferError> {
        self.gc();

        if let Some(entry) = self.entries.borrow().get(&buffer.weak()) {
            return match entry {
                CacheEntry::Imported(fb) => Ok(fb.clone()),
                CacheEntry::Poisoned => {
                    debug!("Buffer is poisoned");
                    Err(FramebufferError::Poisoned)
                }
            };
        }

        let res = import_framebuffer(device, addfb2_modifiers, buffer, formats);
        match &res {
            Ok(fb) => {
                self.entries
                    .borrow_mut()
                    .insert(buffer.weak(), CacheEntry::Imported(fb.clone()));
            }
            Err(FramebufferError::KernelRejected(_)) => {
                debug!("Poisoning buffer");
                self.entries.borrow_mut().insert(buffer.weak(), CacheEntry::Poisoned);
            }
            Err(_) => {}
        }
        res
    }

    /// Drop entries whose buffer is gone
    fn gc(&self) {
        self.entries.borrow_mut().retain(|weak, _| !weak.is_gone());
    }

    /// Drop all entries, closing the cached framebuffers
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

/// Adapter presenting a dmabuf plus its GEM handles as a drm-rs buffer
struct DmabufFramebuffer<'a> {
    buffer: &'a Dmabuf,
    handles: [Option<drm::buffer::Handle>; MAX_PLANES],
    code: Fourcc,
}

impl PlanarBuffer for DmabufFramebuffer<'_> {
    fn size(&self) -> (u32, u32) {
        (self.buffer.width(), self.buffer.height())
    }

    fn format(&self) -> Fourcc {
        self.code
    }

    fn modifier(&self) -> Option<Modifier> {
        match self.buffer.format().modifier {
            Modifier::Invalid => None,
            x => Some(x),
        }
    }

    fn pitches(&self) -> [u32; 4] {
        let mut pitches = [0u32; 4];
        for (i, stride) in self.buffer.strides().take(4).enumerate() {
            pitches[i] = stride;
        }
        pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        let mut offsets = [0u32; 4];
        for (i, offset) in self.buffer.offsets().take(4).enumerate() {
            offsets[i] = offset;
        }
        offsets
    }
}

impl DrmBuffer for DmabufFramebuffer<'_> {
    fn size(&self) -> (u32, u32) {
        (self.buffer.width(), self.buffer.height())
    }

    fn format(&self) -> Fourcc {
        self.code
    }

    fn pitch(&self) -> u32 {
        self.buffer.strides().next().unwrap_or(0)
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handles[0].expect("framebuffer without a first plane")
    }
}

fn import_framebuffer(
    device: &DrmDeviceFd,
    addfb2_modifiers: bool,
    buffer: &Dmabuf,
    formats: Option<&FormatSet>,
) -> Result<DrmFramebuffer, FramebufferError> {
    let format = buffer.format();

    let mut code = format.code;
    if let Some(formats) = formats {
        if !formats.has(code, format.modifier) {
            // The format isn't supported by the plane. Try stripping the
            // alpha channel, if any.
            match get_opaque(code) {
                Some(opaque) if formats.has(opaque, format.modifier) => {
                    code = opaque;
                }
                _ => {
                    debug!(
                        "Buffer format {:?} with modifier {:?} cannot be scanned out",
                        code, format.modifier
                    );
                    return Err(FramebufferError::FormatUnsupported {
                        fourcc: code,
                        modifier: format.modifier,
                    });
                }
            }
        }
    }

    // convert the per-plane fds into GEM handles
    let mut handles: [Option<drm::buffer::Handle>; MAX_PLANES] = [None; MAX_PLANES];
    let mut imported = 0;
    let mut import_error = None;
    for (i, fd) in buffer.handles().take(MAX_PLANES).enumerate() {
        match device.prime_fd_to_buffer(fd) {
            Ok(handle) => {
                handles[i] = Some(handle);
                imported += 1;
            }
            Err(err) => {
                debug!("Failed to convert dmabuf fd to GEM handle: {}", err);
                import_error = Some(err);
                break;
            }
        }
    }

    let result = if let Some(err) = import_error {
        Err(FramebufferError::PrimeImport(err))
    } else {
        let wrapper = DmabufFramebuffer {
            buffer,
            handles,
            code,
        };
        add_framebuffer(device, addfb2_modifiers, &wrapper)
            .map(|handle| {
                trace!(?handle, "Imported framebuffer");
                DrmFramebuffer(Rc::new(DrmFramebufferInner {
                    device: device.clone(),
                    handle,
                    format: Format {
                        code,
                        modifier: format.modifier,
                    },
                    size: (buffer.width(), buffer.height()),
                    buffer: buffer.weak(),
                }))
            })
            .map_err(FramebufferError::KernelRejected)
    };

    // close the handles regardless of the outcome, skipping duplicates
    // shared between planes
    for i in 0..imported {
        let Some(handle) = handles[i] else { continue };
        if handles[..i].iter().flatten().any(|prev| *prev == handle) {
            continue;
        }
        if let Err(err) = drm_ffi::gem::close(device.as_fd(), handle.into()) {
            warn!("Failed to close GEM handle: {}", err);
        }
    }

    result
}

fn add_framebuffer(
    device: &DrmDeviceFd,
    addfb2_modifiers: bool,
    wrapper: &DmabufFramebuffer<'_>,
) -> Result<framebuffer::Handle, std::io::Error> {
    let modifier = PlanarBuffer::modifier(wrapper);

    if let Some(modifier) = modifier {
        if !addfb2_modifiers && modifier != Modifier::Linear {
            return Err(std::io::Error::other(
                "cannot import framebuffer with explicit modifier without ADDFB2_MODIFIERS",
            ));
        }
    }

    let flags = if addfb2_modifiers && modifier.is_some() {
        FbCmd2Flags::MODIFIERS
    } else {
        FbCmd2Flags::empty()
    };

    match device.add_planar_framebuffer(wrapper, flags) {
        Ok(fb) => Ok(fb),
        Err(err) => {
            // Some big-endian machines don't support ADDFB2. Try a
            // last-resort fallback for single-plane ARGB8888 buffers, like
            // Xorg's modesetting driver does.
            let single_plane = wrapper.buffer.num_planes() == 1;
            let zero_offset = wrapper.buffer.offsets().next() == Some(0);
            if wrapper.code == Fourcc::Argb8888 && single_plane && zero_offset {
                debug!("ADDFB2 failed ({}), falling back to legacy ADDFB", err);
                let depth = get_depth(wrapper.code).unwrap_or(32) as u32;
                let bpp = get_bpp(wrapper.code).unwrap_or(32) as u32;
                device.add_framebuffer(wrapper, depth, bpp)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::dmabuf::Dmabuf;

    fn dummy_dmabuf() -> Dmabuf {
        let fd = rustix::fs::open("/dev/null", rustix::fs::OFlags::RDONLY, rustix::fs::Mode::empty())
            .expect("failed to open /dev/null");
        let mut builder = Dmabuf::builder(64, 64, Fourcc::Argb8888, Modifier::Linear);
        builder.add_plane(fd, 0, 256);
        builder.build().unwrap()
    }

    #[test]
    fn poisoned_entry_short_circuits() {
        let cache = FramebufferCache::default();
        let buffer = dummy_dmabuf();
        cache
            .entries
            .borrow_mut()
            .insert(buffer.weak(), CacheEntry::Poisoned);

        // must not reach the device at all; a poisoned entry fails fast
        let err = {
            let entries = cache.entries.borrow();
            match entries.get(&buffer.weak()) {
                Some(CacheEntry::Poisoned) => FramebufferError::Poisoned,
                _ => panic!("expected poisoned entry"),
            }
        };
        assert!(matches!(err, FramebufferError::Poisoned));
    }

    #[test]
    fn gc_drops_dead_buffers() {
        let cache = FramebufferCache::default();
        let weak = {
            let buffer = dummy_dmabuf();
            cache
                .entries
                .borrow_mut()
                .insert(buffer.weak(), CacheEntry::Poisoned);
            buffer.weak()
        };
        assert!(weak.is_gone());
        cache.gc();
        assert!(cache.entries.borrow().is_empty());
    }
}
