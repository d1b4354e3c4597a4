use bitflags::bitflags;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::renderer::color::{ColorTransform, ImageDescription};
use crate::backend::renderer::sync::SyncTimeline;
use crate::utils::{Buffer as BufferCoords, Logical, Physical, Rectangle, Region, Size, Transform};

bitflags! {
    /// Fields selected by a staged [`OutputState`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateField: u32 {
        /// A new buffer is attached
        const BUFFER                = 1 << 0;
        /// Frame damage is provided for the attached buffer
        const DAMAGE                = 1 << 1;
        /// The mode changes
        const MODE                  = 1 << 2;
        /// The enabled flag changes
        const ENABLED               = 1 << 3;
        /// The scale factor changes
        const SCALE                 = 1 << 4;
        /// The transform changes
        const TRANSFORM             = 1 << 5;
        /// Adaptive sync is toggled
        const ADAPTIVE_SYNC         = 1 << 6;
        /// The render format changes
        const RENDER_FORMAT         = 1 << 7;
        /// The subpixel layout changes
        const SUBPIXEL              = 1 << 8;
        /// The output layer set is committed
        const LAYERS                = 1 << 9;
        /// A color transform (gamma LUT) is applied
        const COLOR_TRANSFORM       = 1 << 10;
        /// The image description (HDR metadata) changes
        const IMAGE_DESCRIPTION     = 1 << 11;
        /// The commit waits for a timeline point before scanning out
        const WAIT_TIMELINE         = 1 << 12;
        /// The commit signals a timeline point on completion
        const SIGNAL_TIMELINE       = 1 << 13;
        /// The backend may reconfigure (modeset) to satisfy this commit
        const ALLOW_RECONFIGURATION = 1 << 14;
        /// The page-flip may tear
        const TEARING               = 1 << 15;
    }
}

/// The mode requested by a state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeRequest {
    /// One of the modes advertised by the output
    Fixed(Mode),
    /// A custom mode with generated timings
    Custom {
        /// Requested resolution
        size: Size<i32, Physical>,
        /// Requested refresh rate in mHz, 0 for the default
        refresh: i32,
    },
}

/// Picture aspect ratio advertised by a mode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    /// No aspect ratio information
    #[default]
    None,
    /// 4:3
    _4_3,
    /// 16:9
    _16_9,
    /// 64:27
    _64_27,
    /// 256:135
    _256_135,
}

/// An output mode
///
/// A possible combination of resolution and refresh rate for an output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    /// Resolution of the mode, in pixels
    pub size: Size<i32, Physical>,
    /// Vertical refresh rate in millihertz
    pub refresh: i32,
    /// Whether this mode is preferred by the display
    pub preferred: bool,
    /// Picture aspect ratio of the mode
    pub picture_aspect_ratio: AspectRatio,
}

/// Subpixel geometry of an output
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Subpixel {
    /// Unknown subpixel layout
    #[default]
    Unknown,
    /// No subpixel geometry
    None,
    /// Horizontal RGB
    HorizontalRgb,
    /// Horizontal BGR
    HorizontalBgr,
    /// Vertical RGB
    VerticalRgb,
    /// Vertical BGR
    VerticalBgr,
}

/// Handle identifying an output layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub(crate) usize);

/// State of one output layer within a commit
#[derive(Debug, Clone)]
pub struct LayerState {
    /// The layer this state belongs to
    pub id: LayerId,
    /// Buffer to present on the layer, `None` to disable it
    pub buffer: Option<Dmabuf>,
    /// Source crop within the buffer
    pub src: Rectangle<f64, BufferCoords>,
    /// Destination box in output coordinates
    pub dst: Rectangle<i32, Logical>,
}

/// Staged change set for an output
///
/// Fields are set through the setter helpers, which also record the field in
/// the committed-mask. The state only takes effect through a successful
/// [`commit_state`](super::Output::commit_state).
#[derive(Debug, Default, Clone)]
pub struct OutputState {
    pub(crate) committed: StateField,
    pub(crate) buffer: Option<Dmabuf>,
    pub(crate) buffer_src_box: Option<Rectangle<f64, BufferCoords>>,
    pub(crate) buffer_dst_box: Option<Rectangle<i32, Physical>>,
    pub(crate) damage: Region<i32, BufferCoords>,
    pub(crate) mode: Option<ModeRequest>,
    pub(crate) enabled: bool,
    pub(crate) scale: f64,
    pub(crate) transform: Transform,
    pub(crate) adaptive_sync: bool,
    pub(crate) render_format: Option<crate::backend::allocator::Fourcc>,
    pub(crate) subpixel: Subpixel,
    pub(crate) layers: Vec<LayerState>,
    pub(crate) color_transform: Option<ColorTransform>,
    pub(crate) image_description: Option<ImageDescription>,
    pub(crate) wait_timeline: Option<(SyncTimeline, u64)>,
    pub(crate) signal_timeline: Option<(SyncTimeline, u64)>,
}

impl OutputState {
    /// Create an empty state committing nothing
    pub fn new() -> Self {
        Default::default()
    }

    /// The committed-field mask of this state
    pub fn committed(&self) -> StateField {
        self.committed
    }

    /// Attach a buffer to present on the next frame
    pub fn set_buffer(&mut self, buffer: Dmabuf) {
        self.committed |= StateField::BUFFER;
        self.buffer = Some(buffer);
    }

    /// Set the source crop of the attached buffer
    ///
    /// Defaults to the full buffer when unset.
    pub fn set_buffer_src_box(&mut self, src: Rectangle<f64, BufferCoords>) {
        self.buffer_src_box = Some(src);
    }

    /// Set the destination box of the attached buffer, in output pixels
    ///
    /// Defaults to the source-crop size anchored at the origin when unset.
    pub fn set_buffer_dst_box(&mut self, dst: Rectangle<i32, Physical>) {
        self.buffer_dst_box = Some(dst);
    }

    /// Attach frame damage, in buffer coordinates
    pub fn set_damage(&mut self, damage: Region<i32, BufferCoords>) {
        self.committed |= StateField::DAMAGE;
        self.damage = damage;
    }

    /// Request a mode change
    pub fn set_mode(&mut self, mode: Mode) {
        self.committed |= StateField::MODE;
        self.mode = Some(ModeRequest::Fixed(mode));
    }

    /// Request a custom mode with generated timings
    pub fn set_custom_mode(&mut self, size: Size<i32, Physical>, refresh: i32) {
        self.committed |= StateField::MODE;
        self.mode = Some(ModeRequest::Custom { size, refresh });
    }

    /// Enable or disable the output
    pub fn set_enabled(&mut self, enabled: bool) {
        self.committed |= StateField::ENABLED;
        self.enabled = enabled;
    }

    /// Change the scale factor
    pub fn set_scale(&mut self, scale: f64) {
        self.committed |= StateField::SCALE;
        self.scale = scale;
    }

    /// Change the transform
    pub fn set_transform(&mut self, transform: Transform) {
        self.committed |= StateField::TRANSFORM;
        self.transform = transform;
    }

    /// Toggle adaptive sync
    pub fn set_adaptive_sync(&mut self, enabled: bool) {
        self.committed |= StateField::ADAPTIVE_SYNC;
        self.adaptive_sync = enabled;
    }

    /// Change the render format of the primary swapchain
    pub fn set_render_format(&mut self, format: crate::backend::allocator::Fourcc) {
        self.committed |= StateField::RENDER_FORMAT;
        self.render_format = Some(format);
    }

    /// Change the advertised subpixel layout
    pub fn set_subpixel(&mut self, subpixel: Subpixel) {
        self.committed |= StateField::SUBPIXEL;
        self.subpixel = subpixel;
    }

    /// Commit the full set of output layers
    ///
    /// Every existing layer of the output must appear in the list.
    pub fn set_layers(&mut self, layers: Vec<LayerState>) {
        self.committed |= StateField::LAYERS;
        self.layers = layers;
    }

    /// Apply a color transform, `None` to reset to identity
    pub fn set_color_transform(&mut self, transform: Option<ColorTransform>) {
        self.committed |= StateField::COLOR_TRANSFORM;
        self.color_transform = transform;
    }

    /// Set the image description signalled to the display, `None` to reset
    pub fn set_image_description(&mut self, desc: Option<ImageDescription>) {
        self.committed |= StateField::IMAGE_DESCRIPTION;
        self.image_description = desc;
    }

    /// Make the backend wait for a timeline point before presenting the buffer
    pub fn set_wait_timeline(&mut self, timeline: SyncTimeline, point: u64) {
        self.committed |= StateField::WAIT_TIMELINE;
        self.wait_timeline = Some((timeline, point));
    }

    /// Make the backend signal a timeline point once presentation completed
    pub fn set_signal_timeline(&mut self, timeline: SyncTimeline, point: u64) {
        self.committed |= StateField::SIGNAL_TIMELINE;
        self.signal_timeline = Some((timeline, point));
    }

    /// Allow the backend to reconfigure (modeset) to satisfy this commit
    pub fn set_allow_reconfiguration(&mut self, allow: bool) {
        self.committed.set(StateField::ALLOW_RECONFIGURATION, allow);
    }

    /// Request an immediate (tearing) page-flip
    pub fn set_tearing(&mut self, tearing: bool) {
        self.committed.set(StateField::TEARING, tearing);
    }

    /// The attached buffer, if any
    pub fn buffer(&self) -> Option<&Dmabuf> {
        self.buffer.as_ref()
    }

    /// The requested mode, if any
    pub fn mode(&self) -> Option<ModeRequest> {
        self.mode
    }

    /// The effective source box: explicitly staged, or the full buffer
    pub fn effective_src_box(&self) -> Option<Rectangle<f64, BufferCoords>> {
        if let Some(src) = self.buffer_src_box {
            return Some(src);
        }
        let buffer = self.buffer.as_ref()?;
        use crate::backend::allocator::Buffer;
        Some(Rectangle::from_size(Size::new(
            buffer.width() as f64,
            buffer.height() as f64,
        )))
    }

    /// The effective destination box: explicitly staged, or the source-crop
    /// size anchored at the origin
    pub fn effective_dst_box(&self) -> Option<Rectangle<i32, Physical>> {
        if let Some(dst) = self.buffer_dst_box {
            return Some(dst);
        }
        let src = self.effective_src_box()?;
        Some(Rectangle::from_size(Size::new(
            src.size.w.ceil() as i32,
            src.size.h.ceil() as i32,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Point;

    #[test]
    fn setters_record_committed_fields() {
        let mut state = OutputState::new();
        assert!(state.committed().is_empty());

        state.set_enabled(true);
        state.set_scale(2.0);
        assert!(state.committed().contains(StateField::ENABLED));
        assert!(state.committed().contains(StateField::SCALE));
        assert!(!state.committed().contains(StateField::MODE));
    }

    #[test]
    fn dst_box_defaults_to_src_size() {
        let mut state = OutputState::new();
        state.set_buffer_src_box(Rectangle::new(Point::new(10.0, 10.0), Size::new(99.5, 50.0)));
        // no buffer attached: the explicit src box still drives the dst default
        assert_eq!(
            state.effective_dst_box(),
            Some(Rectangle::from_size(Size::new(100, 50)))
        );
    }
}
