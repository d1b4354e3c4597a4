//! Rendering contract consumed by the scene graph and the DRM backend
//!
//! A [`Renderer`] turns dmabuf-backed buffers into [`Texture`]s and records
//! draw commands into a [`RenderPass`] targeting another buffer. The scene
//! graph drives this interface when direct scan-out is not possible; the DRM
//! backend drives it for multi-GPU blits.
//!
//! The contract is object-safe on purpose: outputs and scenes store
//! `Box<dyn Renderer>` and never know which implementation (GLES, Vulkan,
//! software) is behind it.

pub mod color;
pub mod sync;

use std::fmt;
use std::time::Duration;

use crate::backend::allocator::{dmabuf::Dmabuf, format::FormatSet};
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Region, Transform};

use color::ColorTransform;
use sync::SyncPoint;

/// A four-component color in premultiplied linear RGBA
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    /// Red component
    pub r: f32,
    /// Green component
    pub g: f32,
    /// Blue component
    pub b: f32,
    /// Alpha component
    pub a: f32,
}

impl Color {
    /// Opaque black
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    /// Fully transparent
    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    /// Create a new color from components
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Color { r, g, b, a }
    }

    /// Whether this color is fully opaque
    pub fn is_opaque(&self) -> bool {
        self.a >= 1.0
    }

    /// Whether this color is fully transparent
    pub fn is_transparent(&self) -> bool {
        self.a == 0.0
    }
}

impl From<[f32; 4]> for Color {
    fn from([r, g, b, a]: [f32; 4]) -> Self {
        Color { r, g, b, a }
    }
}

/// Texture filtering method applied when sampling a scaled texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureFilter {
    /// Bilinear interpolation
    #[default]
    Linear,
    /// Nearest-neighbor sampling
    Nearest,
}

/// Blend behaviour of a textured quad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Premultiplied alpha blending over the existing content
    #[default]
    PremultipliedAlpha,
    /// No blending, the source replaces the destination
    ///
    /// Used when the content is known to be opaque so the renderer can skip
    /// read-modify-write of the destination.
    None,
}

/// A two-dimensional texture usable with a [`Renderer`]
pub trait Texture: fmt::Debug {
    /// Width of the texture in buffer coordinates
    fn width(&self) -> u32;
    /// Height of the texture in buffer coordinates
    fn height(&self) -> u32;
    /// Whether the texture content carries an alpha channel
    fn has_alpha(&self) -> bool;
}

/// Options for a textured-quad draw
#[derive(Debug)]
pub struct TextureOptions<'a> {
    /// Region of the texture to sample, in buffer coordinates
    pub src: Rectangle<f64, BufferCoords>,
    /// Destination box on the target, in physical coordinates
    pub dst: Rectangle<i32, Physical>,
    /// Clip region on the target; nothing is drawn outside it
    pub clip: &'a Region<i32, Physical>,
    /// Transform applied to the texture content
    pub transform: Transform,
    /// Sampling filter
    pub filter: TextureFilter,
    /// Overall opacity in [0, 1]
    pub alpha: f32,
    /// Blend mode for the draw
    pub blend: BlendMode,
    /// Transfer function the texture content is encoded with
    pub transfer_function: color::TransferFunction,
    /// Color primaries of the texture content
    pub primaries: color::Primaries,
    /// Fence to wait for before sampling the texture, if any
    pub wait: Option<SyncPoint>,
}

/// Options for a solid-rect draw
#[derive(Debug)]
pub struct RectOptions<'a> {
    /// Destination box on the target, in physical coordinates
    pub dst: Rectangle<i32, Physical>,
    /// Clip region on the target
    pub clip: &'a Region<i32, Physical>,
    /// Fill color
    pub color: Color,
    /// Blend mode for the draw
    pub blend: BlendMode,
}

/// A render pass targeting a single buffer
///
/// Draw commands are recorded front-to-back or back-to-front at the caller's
/// discretion; the pass only promises that [`submit`](RenderPass::submit)
/// makes all of them visible in the target buffer.
pub trait RenderPass: fmt::Debug {
    /// Record a textured quad
    fn add_texture(&mut self, texture: &dyn Texture, options: TextureOptions<'_>);

    /// Record a solid rectangle
    fn add_rect(&mut self, options: RectOptions<'_>);

    /// Finish the pass, flushing all recorded commands to the target
    ///
    /// Returns a sync point that signals once the rendering completed.
    fn submit(self: Box<Self>) -> Result<SyncPoint, RendererError>;
}

/// Options when starting a render pass
#[derive(Debug, Default)]
pub struct RenderPassOptions {
    /// Color transform applied to all output of the pass
    pub color_transform: Option<ColorTransform>,
    /// Signal timeline point to materialize once the pass completed on the device
    pub signal: Option<sync::TimelinePoint>,
    /// Timer measuring the duration of the pass on the device, if requested
    pub timer: Option<RenderTimer>,
}

/// Handle to a device-side duration measurement of one render pass
///
/// The duration becomes available once the pass finished executing; querying
/// earlier yields `None`.
#[derive(Debug, Clone, Default)]
pub struct RenderTimer {
    result: std::sync::Arc<std::sync::Mutex<Option<Duration>>>,
}

impl RenderTimer {
    /// Create a new unresolved timer
    pub fn new() -> Self {
        Default::default()
    }

    /// Query the measured duration
    pub fn duration(&self) -> Option<Duration> {
        *self.result.lock().unwrap()
    }

    /// Resolve the timer with the measured duration
    ///
    /// Called by renderer implementations when results become available.
    pub fn resolve(&self, duration: Duration) {
        *self.result.lock().unwrap() = Some(duration);
    }
}

/// Errors the renderer contract can produce
#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    /// The buffer could not be used as a texture or pass target
    #[error("Buffer import failed: {0}")]
    ImportFailed(String),
    /// The underlying device was lost; the renderer must be recreated
    #[error("The rendering device was lost")]
    ContextLost,
    /// Explicit synchronization was requested but is unsupported
    #[error("Explicit synchronization is not supported by this renderer")]
    SyncUnsupported,
    /// An implementation-specific error
    #[error("Rendering failed: {0}")]
    Other(String),
}

/// A renderer able to import buffers and record render passes
pub trait Renderer: fmt::Debug {
    /// The (format, modifier) pairs this renderer can sample from
    fn texture_formats(&self) -> &FormatSet;

    /// The (format, modifier) pairs this renderer can render into
    fn render_formats(&self) -> &FormatSet;

    /// Import a dmabuf as a texture
    fn texture_from_buffer(&mut self, buffer: &Dmabuf) -> Result<Box<dyn Texture>, RendererError>;

    /// Begin a render pass targeting the given buffer
    fn begin_pass(
        &mut self,
        buffer: &Dmabuf,
        options: RenderPassOptions,
    ) -> Result<Box<dyn RenderPass + '_>, RendererError>;

    /// Whether this renderer can wait for and signal syncobj timeline points
    ///
    /// Without timeline support, explicit-sync commits are rejected by the
    /// output's basic test and dmabuf fences are awaited by polling.
    fn supports_timelines(&self) -> bool;

    /// The DRM device the renderer executes on, when backed by one
    ///
    /// Used to create syncobj timelines for explicit synchronization.
    fn drm_device(&self) -> Option<crate::backend::drm::DrmDeviceFd> {
        None
    }
}
