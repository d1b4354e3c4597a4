//! Color spaces and color transforms
//!
//! Buffers carry colorimetry metadata (transfer function, primaries,
//! encoding, range) and outputs may carry an [`ImageDescription`]. Render
//! passes compose these into a single [`ColorTransform`], a reference-counted
//! DAG evaluated by the renderer.

use std::sync::Arc;

/// Transfer functions understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferFunction {
    /// The sRGB piecewise transfer function
    #[default]
    Srgb,
    /// Pure power-law gamma 2.2
    Gamma22,
    /// BT.1886, used by broadcast content
    Bt1886,
    /// SMPTE ST 2084 perceptual quantizer, used by HDR10 content
    St2084Pq,
    /// Linear light with extended range
    ExtLinear,
}

/// Named color primaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Primaries {
    /// sRGB / BT.709 primaries
    #[default]
    Srgb,
    /// BT.2020 wide-gamut primaries
    Bt2020,
}

/// Color encoding of YCbCr-style buffer content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorEncoding {
    /// BT.601 matrix coefficients
    Bt601,
    /// BT.709 matrix coefficients
    Bt709,
    /// BT.2020 matrix coefficients
    Bt2020,
}

/// Quantization range of buffer content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    /// Full range
    Full,
    /// Limited (broadcast) range
    Limited,
}

/// A chromaticity coordinate in CIE 1931 xy space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Chromaticity {
    /// x coordinate
    pub x: f64,
    /// y coordinate
    pub y: f64,
}

/// Chromaticities of the mastering display
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MasteringPrimaries {
    /// Red primary
    pub red: Chromaticity,
    /// Green primary
    pub green: Chromaticity,
    /// Blue primary
    pub blue: Chromaticity,
    /// White point
    pub white: Chromaticity,
}

/// Luminance range of the mastering display, in cd/m²
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MasteringLuminance {
    /// Minimum luminance
    pub min: f64,
    /// Maximum luminance
    pub max: f64,
}

/// Description of the image an output is expected to present
///
/// Committed to an output to drive HDR signalling; converted by the DRM
/// backend into `HDR_OUTPUT_METADATA` and a `Colorspace` connector property.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescription {
    /// Transfer function of the content
    pub transfer_function: TransferFunction,
    /// Primaries of the content
    pub primaries: Primaries,
    /// Mastering display primaries
    pub mastering_display_primaries: MasteringPrimaries,
    /// Mastering display luminance
    pub mastering_luminance: MasteringLuminance,
    /// Maximum content light level, in cd/m²
    pub max_cll: u16,
    /// Maximum frame-average light level, in cd/m²
    pub max_fall: u16,
}

#[derive(Debug)]
enum TransformKind {
    /// A 3x3 matrix in row-major order applied in linear light
    Matrix([f32; 9]),
    /// Application of the inverse of a transfer function (encoding step)
    InverseEotf(TransferFunction),
    /// Decoding from a transfer function to linear light
    Eotf(TransferFunction),
    /// Three independent 1D lookup tables with `dim` entries each,
    /// concatenated as red, green, blue planes
    Lut3x1d { dim: usize, lut: Vec<u16> },
    /// Sequential application of a list of transforms
    Pipeline(Vec<ColorTransform>),
}

/// A reference-counted color transform DAG
///
/// Cheap to clone; comparing with [`ColorTransform::same`] is pointer
/// equality, which the pipeline uses to detect idempotent commits.
#[derive(Debug, Clone)]
pub struct ColorTransform(Arc<TransformKind>);

impl ColorTransform {
    /// A matrix transform applied in linear light
    pub fn matrix(matrix: [f32; 9]) -> Self {
        ColorTransform(Arc::new(TransformKind::Matrix(matrix)))
    }

    /// Decode content with the given transfer function to linear light
    pub fn eotf(tf: TransferFunction) -> Self {
        ColorTransform(Arc::new(TransformKind::Eotf(tf)))
    }

    /// Encode linear light with the inverse of the given transfer function
    pub fn inverse_eotf(tf: TransferFunction) -> Self {
        ColorTransform(Arc::new(TransformKind::InverseEotf(tf)))
    }

    /// A 3x1D lookup table transform
    ///
    /// `lut` holds `3 * dim` entries, the red, green and blue ramps in
    /// sequence. This is the representation a CRTC gamma LUT uses.
    pub fn lut_3x1d(dim: usize, lut: Vec<u16>) -> Option<Self> {
        if lut.len() != dim * 3 {
            return None;
        }
        Some(ColorTransform(Arc::new(TransformKind::Lut3x1d { dim, lut })))
    }

    /// Sequential composition of transforms
    ///
    /// Single-element pipelines collapse to the element itself.
    pub fn pipeline(transforms: impl IntoIterator<Item = ColorTransform>) -> Option<Self> {
        let mut transforms: Vec<_> = transforms.into_iter().collect();
        match transforms.len() {
            0 => None,
            1 => Some(transforms.remove(0)),
            _ => Some(ColorTransform(Arc::new(TransformKind::Pipeline(transforms)))),
        }
    }

    /// Pointer equality of two transforms
    pub fn same(&self, other: &ColorTransform) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// If this transform is a plain 3x1D LUT, return its dimension and table
    ///
    /// The DRM backend uses this to offload a pure LUT transform to the CRTC
    /// `GAMMA_LUT` property instead of rendering it.
    pub fn as_lut_3x1d(&self) -> Option<(usize, &[u16])> {
        match &*self.0 {
            TransformKind::Lut3x1d { dim, lut } => Some((*dim, lut)),
            _ => None,
        }
    }
}

/// The transform decoding an output image description into linear light
/// followed by re-encoding for the output, as used by the scene render pass.
pub fn output_transform(desc: &ImageDescription) -> ColorTransform {
    let mut chain = vec![ColorTransform::eotf(TransferFunction::Srgb)];
    if desc.primaries == Primaries::Bt2020 {
        // sRGB to BT.2020 conversion matrix in linear light
        chain.push(ColorTransform::matrix([
            0.6274, 0.3293, 0.0433, //
            0.0691, 0.9195, 0.0114, //
            0.0164, 0.0880, 0.8956,
        ]));
    }
    chain.push(ColorTransform::inverse_eotf(desc.transfer_function));
    ColorTransform::pipeline(chain).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_requires_three_planes() {
        assert!(ColorTransform::lut_3x1d(256, vec![0; 256 * 3]).is_some());
        assert!(ColorTransform::lut_3x1d(256, vec![0; 256]).is_none());
    }

    #[test]
    fn pipeline_collapses_single_element() {
        let lut = ColorTransform::lut_3x1d(2, vec![0; 6]).unwrap();
        let pipeline = ColorTransform::pipeline([lut.clone()]).unwrap();
        assert!(pipeline.same(&lut));
        assert!(ColorTransform::pipeline([]).is_none());
    }

    #[test]
    fn as_lut_only_matches_luts() {
        let lut = ColorTransform::lut_3x1d(2, vec![1; 6]).unwrap();
        assert_eq!(lut.as_lut_3x1d().unwrap().0, 2);
        assert!(ColorTransform::inverse_eotf(TransferFunction::Gamma22)
            .as_lut_3x1d()
            .is_none());
    }
}
