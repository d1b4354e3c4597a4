//! Buffer allocation and format handling
//!
//! This module provides the buffer and allocator abstractions the output
//! pipeline is built on. Client buffers reach the backend as [`Dmabuf`]s;
//! the swapchain allocates its own buffers through an [`Allocator`], usually
//! the gbm-based one from [`self::gbm`].

pub mod dmabuf;
pub mod format;
pub mod gbm;
mod swapchain;

pub use swapchain::{Slot, Swapchain, SwapchainError, SLOT_CAP};

pub use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};

use dmabuf::Dmabuf;

/// Common trait describing common properties of most types of buffers
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer including the modifier
    fn format(&self) -> Format;
}

/// Interface to create Buffers
pub trait Allocator: std::fmt::Debug {
    /// Buffer type produced by this allocator
    type Buffer: Buffer;
    /// Error type thrown if allocations fail
    type Error: std::error::Error;

    /// Try to create a buffer with the given dimensions, pixel format and modifier options
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    type Buffer = A::Buffer;
    type Error = A::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error> {
        (**self).create_buffer(width, height, fourcc, modifiers)
    }
}

/// Wrapper around an allocator exporting allocated buffers as dmabufs
///
/// This allows the output pipeline to stay agnostic of the concrete buffer
/// type an allocator produces.
#[derive(Debug, Clone)]
pub struct DmabufAllocator<A>(pub A);

impl<A> Allocator for DmabufAllocator<A>
where
    A: Allocator,
    A::Error: Send + Sync + 'static,
    A::Buffer: AsDmabuf,
    <A::Buffer as AsDmabuf>::Error: std::error::Error + Send + Sync + 'static,
{
    type Buffer = Dmabuf;
    type Error = std::io::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error> {
        let buffer = self
            .0
            .create_buffer(width, height, fourcc, modifiers)
            .map_err(std::io::Error::other)?;
        buffer.export().map_err(std::io::Error::other)
    }
}

/// Object-safe allocator handing out dmabufs, as stored by outputs
pub type DynAllocator = Box<dyn Allocator<Buffer = Dmabuf, Error = std::io::Error>>;

/// Buffers that can be exported as dmabufs
pub trait AsDmabuf {
    /// Error type returned, if exporting fails
    type Error: std::error::Error;

    /// Export this buffer as a new dmabuf
    fn export(&self) -> Result<Dmabuf, Self::Error>;
}

impl AsDmabuf for Dmabuf {
    type Error = std::convert::Infallible;

    fn export(&self) -> Result<Dmabuf, Self::Error> {
        Ok(self.clone())
    }
}
