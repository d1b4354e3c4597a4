//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! A dmabuf is the main way buffers cross process and subsystem boundaries on
//! Linux: a set of per-plane file descriptors plus stride/offset/modifier
//! metadata. Client buffers are imported into KMS as framebuffers from this
//! representation and renderers import the same descriptors as textures.

use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Weak};

use super::{Buffer, Format, Fourcc, Modifier};

/// Maximum amount of planes a dmabuf may have
pub const MAX_PLANES: usize = 4;

/// A single plane of a dmabuf
#[derive(Debug)]
pub struct Plane {
    /// The file descriptor backing this plane
    pub fd: OwnedFd,
    /// Offset of this plane into the backing storage
    pub offset: u32,
    /// Stride (pitch) of this plane
    pub stride: u32,
}

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    pub planes: Vec<Plane>,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub modifier: Modifier,
}

/// Strong reference to a dmabuf handle
///
/// Cloning is cheap and keeps the underlying file descriptors open; the
/// descriptors are closed once the last clone is dropped. Holding a clone is
/// how the framebuffer cache and plane state "lock" a buffer.
#[derive(Debug, Clone)]
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

/// Weak reference to a dmabuf handle, usable as a cache key
#[derive(Debug, Clone)]
pub struct WeakDmabuf(pub(crate) Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl PartialEq for WeakDmabuf {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WeakDmabuf {}

impl Hash for Dmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}
impl Hash for WeakDmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state)
    }
}

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        Format {
            code: self.0.format,
            modifier: self.0.modifier,
        }
    }
}

/// Builder for a [`Dmabuf`]
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed dmabuf
    ///
    /// Each dmabuf needs at least one plane; planes beyond [`MAX_PLANES`] are
    /// refused.
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane { fd, offset, stride });
        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }

        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new dmabuf by initializing with values from an existing buffer
    pub fn builder_from_buffer(src: &impl Buffer) -> DmabufBuilder {
        let format = src.format();
        Self::builder(src.width(), src.height(), format.code, format.modifier)
    }

    /// Create a new dmabuf builder
    pub fn builder(width: u32, height: u32, format: Fourcc, modifier: Modifier) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                width,
                height,
                format,
                modifier,
            },
        }
    }

    /// The amount of planes this dmabuf has
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Returns raw handles of the planes of this buffer
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Check if this buffer format has any vendor-specific modifiers set or is implicit/linear
    pub fn has_modifier(&self) -> bool {
        self.0.modifier != Modifier::Invalid && self.0.modifier != Modifier::Linear
    }

    /// Create a weak reference to this dmabuf
    ///
    /// Weak references are used as keys of caches attached to the buffer, so
    /// entries can be evicted once the buffer itself is gone.
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }
}

impl WeakDmabuf {
    /// Try to upgrade to a strong reference of this buffer.
    ///
    /// Fails if no strong references exist anymore and the handles were already closed.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }

    /// Returns true if there are no strong references anymore
    pub fn is_gone(&self) -> bool {
        self.0.strong_count() == 0
    }
}
