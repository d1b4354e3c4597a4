//! The commit contract shared by the three KMS drivers
//!
//! The atomic, legacy and plane-composition drivers all take the same
//! [`DeviceState`]: a list of per-connector states prepared from the staged
//! output states. Preparation creates the kernel objects a commit needs
//! (mode blobs, gamma LUT blobs, damage-clip blobs, HDR metadata blobs,
//! in-fences); on success the new blobs replace the CRTC-owned ones, on
//! failure or test they are destroyed again.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};

use tracing::{debug, warn};

use crate::backend::allocator::format::max_bpc_for_format;
use crate::backend::renderer::color::{ImageDescription, Primaries, TransferFunction};
use crate::backend::renderer::sync::SyncTimeline;
use crate::output::StateField;
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Region};

use super::error::Error;
use super::fb::PlaneFb;
use super::fd::DrmDeviceFd;
use super::resources::DrmCrtc;

// Property-blob ioctls, used for modes, gamma LUTs, damage clips and HDR
// metadata alike.
const DRM_IOCTL_MODE_CREATEPROPBLOB: libc::c_ulong = 0xc010_64bd; // _IOWR('d', 0xBD, struct drm_mode_create_blob)
const DRM_IOCTL_MODE_DESTROYPROPBLOB: libc::c_ulong = 0xc004_64be; // _IOWR('d', 0xBE, struct drm_mode_destroy_blob)

#[repr(C)]
struct DrmModeCreateBlob {
    data: u64,
    length: u32,
    blob_id: u32,
}

#[repr(C)]
struct DrmModeDestroyBlob {
    blob_id: u32,
}

/// Create a property blob from raw bytes, returning its id
pub(crate) fn create_blob(dev: &DrmDeviceFd, data: &[u8]) -> io::Result<u32> {
    let mut arg = DrmModeCreateBlob {
        data: data.as_ptr() as u64,
        length: data.len() as u32,
        blob_id: 0,
    };
    // SAFETY: the kernel reads `data.len()` bytes and fills in `blob_id`
    let ret = unsafe { libc::ioctl(dev.as_raw_fd(), DRM_IOCTL_MODE_CREATEPROPBLOB, &mut arg) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(arg.blob_id)
}

/// Destroy a property blob; 0 ids are ignored
pub(crate) fn destroy_blob(dev: &DrmDeviceFd, id: u32) {
    if id == 0 {
        return;
    }
    let arg = DrmModeDestroyBlob { blob_id: id };
    // SAFETY: the ioctl only reads `arg`
    let ret = unsafe { libc::ioctl(dev.as_raw_fd(), DRM_IOCTL_MODE_DESTROYPROPBLOB, &arg) };
    if ret != 0 {
        warn!("Failed to destroy property blob: {}", io::Error::last_os_error());
    }
}

/// Replace a currently committed blob with the next one
pub(crate) fn commit_blob(dev: &DrmDeviceFd, current: &mut u32, next: u32) {
    if *current == next {
        return;
    }
    destroy_blob(dev, *current);
    *current = next;
}

/// Destroy a freshly created blob that did not get committed
pub(crate) fn rollback_blob(dev: &DrmDeviceFd, current: u32, next: u32) {
    if current == next {
        return;
    }
    destroy_blob(dev, next);
}

#[repr(C)]
struct DrmColorLutEntry {
    red: u16,
    green: u16,
    blue: u16,
    reserved: u16,
}

/// Create a `GAMMA_LUT` blob from red/green/blue ramps concatenated in `lut`
pub(crate) fn create_gamma_lut_blob(dev: &DrmDeviceFd, dim: usize, lut: &[u16]) -> Result<u32, Error> {
    if dim == 0 {
        return Ok(0);
    }
    debug_assert_eq!(lut.len(), dim * 3);

    let (r, rest) = lut.split_at(dim);
    let (g, b) = rest.split_at(dim);
    let entries: Vec<DrmColorLutEntry> = (0..dim)
        .map(|i| DrmColorLutEntry {
            red: r[i],
            green: g[i],
            blue: b[i],
            reserved: 0,
        })
        .collect();

    let bytes = unsafe {
        std::slice::from_raw_parts(
            entries.as_ptr() as *const u8,
            entries.len() * std::mem::size_of::<DrmColorLutEntry>(),
        )
    };
    create_blob(dev, bytes).map_err(|source| Error::KmsRejected {
        errmsg: "Unable to create gamma LUT property blob",
        source,
    })
}

#[repr(C)]
struct DrmModeRect {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

/// Create a `FB_DAMAGE_CLIPS` blob from damage clipped to the buffer
pub(crate) fn create_fb_damage_clips_blob(
    dev: &DrmDeviceFd,
    width: i32,
    height: i32,
    damage: &Region<i32, BufferCoords>,
) -> Result<u32, Error> {
    let mut clipped = damage.clone();
    clipped.intersect_rect(Rectangle::from_size((width, height).into()));

    if clipped.is_empty() {
        return Ok(0);
    }

    let rects: Vec<DrmModeRect> = clipped
        .rects()
        .iter()
        .map(|r| DrmModeRect {
            x1: r.loc.x,
            y1: r.loc.y,
            x2: r.loc.x + r.size.w,
            y2: r.loc.y + r.size.h,
        })
        .collect();

    let bytes = unsafe {
        std::slice::from_raw_parts(rects.as_ptr() as *const u8, std::mem::size_of_val(&rects[..]))
    };
    create_blob(dev, bytes).map_err(|source| Error::KmsRejected {
        errmsg: "Failed to create FB_DAMAGE_CLIPS property blob",
        source,
    })
}

// CTA-861.3 HDR metadata, kernel `struct hdr_output_metadata`
#[repr(C)]
struct HdrMetadataInfoframe {
    eotf: u8,
    metadata_type: u8,
    display_primaries: [[u16; 2]; 3],
    white_point: [u16; 2],
    max_display_mastering_luminance: u16,
    min_display_mastering_luminance: u16,
    max_cll: u16,
    max_fall: u16,
}

#[repr(C)]
struct HdrOutputMetadata {
    metadata_type: u32,
    hdmi_metadata_type1: HdrMetadataInfoframe,
}

fn cta861_eotf(tf: TransferFunction) -> u8 {
    match tf {
        // only PQ is signalled through HDR metadata
        TransferFunction::St2084Pq => 2,
        _ => 0,
    }
}

fn cta861_color_coord(v: f64) -> u16 {
    // CTA-861.3 uses 0.00002 units
    (v.clamp(0.0, 1.0) * 50000.0).round() as u16
}

/// Create an `HDR_OUTPUT_METADATA` blob from an image description
pub(crate) fn create_hdr_output_metadata_blob(
    dev: &DrmDeviceFd,
    desc: &ImageDescription,
) -> Result<u32, Error> {
    let metadata = HdrOutputMetadata {
        metadata_type: 0,
        hdmi_metadata_type1: HdrMetadataInfoframe {
            eotf: cta861_eotf(desc.transfer_function),
            metadata_type: 0,
            display_primaries: [
                [
                    cta861_color_coord(desc.mastering_display_primaries.red.x),
                    cta861_color_coord(desc.mastering_display_primaries.red.y),
                ],
                [
                    cta861_color_coord(desc.mastering_display_primaries.green.x),
                    cta861_color_coord(desc.mastering_display_primaries.green.y),
                ],
                [
                    cta861_color_coord(desc.mastering_display_primaries.blue.x),
                    cta861_color_coord(desc.mastering_display_primaries.blue.y),
                ],
            ],
            white_point: [
                cta861_color_coord(desc.mastering_display_primaries.white.x),
                cta861_color_coord(desc.mastering_display_primaries.white.y),
            ],
            max_display_mastering_luminance: desc.mastering_luminance.max as u16,
            // in 0.0001 cd/m² units
            min_display_mastering_luminance: (desc.mastering_luminance.min * 10000.0) as u16,
            max_cll: desc.max_cll,
            max_fall: desc.max_fall,
        },
    };

    let bytes = unsafe {
        std::slice::from_raw_parts(
            &metadata as *const HdrOutputMetadata as *const u8,
            std::mem::size_of::<HdrOutputMetadata>(),
        )
    };
    create_blob(dev, bytes).map_err(|source| Error::KmsRejected {
        errmsg: "Failed to create HDR_OUTPUT_METADATA property blob",
        source,
    })
}

/// The `Colorspace` connector property value for a set of primaries
pub(crate) fn colorspace_for_primaries(primaries: Option<Primaries>) -> u64 {
    match primaries {
        None | Some(Primaries::Srgb) => 0, // Default
        Some(Primaries::Bt2020) => 9,      // BT2020_RGB
    }
}

/// Pick the `max bpc` value: the format's natural depth clamped into the
/// connector's reported bounds
pub(crate) fn pick_max_bpc(bounds: (u64, u64), fb: &PlaneFb) -> u64 {
    let target = max_bpc_for_format(fb.fb.format().code);
    target.clamp(bounds.0, bounds.1)
}

/// State of one output layer within a device commit
#[derive(Debug)]
pub(crate) struct LayerCommit {
    pub id: usize,
    pub fb: Option<PlaneFb>,
    pub src: Rectangle<f64, BufferCoords>,
    pub dst: Rectangle<i32, Physical>,
    /// Filled by the plane-composition driver: mapped to a hardware plane
    pub accepted: bool,
}

/// Per-connector state of a device commit
#[derive(Debug)]
pub(crate) struct ConnectorCommitState {
    pub conn_idx: usize,
    pub crtc_idx: usize,
    pub active: bool,
    pub committed: StateField,

    /// Mode to apply when modesetting while active
    pub mode: Option<drm::control::Mode>,
    pub primary_fb: Option<PlaneFb>,
    pub src_box: Rectangle<f64, BufferCoords>,
    pub dst_box: Rectangle<i32, Physical>,
    pub damage: Region<i32, BufferCoords>,
    pub tearing: bool,
    pub image_description: Option<ImageDescription>,
    /// Gamma ramp from the color transform, `Some(None)` resets to identity
    pub gamma: Option<Option<(usize, Vec<u16>)>>,
    pub wait_timeline: Option<(SyncTimeline, u64)>,
    pub signal_timeline: Option<(SyncTimeline, u64)>,
    pub layers: Vec<LayerCommit>,

    // prepared kernel objects
    pub mode_blob: u32,
    pub gamma_blob: u32,
    pub damage_blob: u32,
    pub hdr_blob: u32,
    pub in_fence: Option<OwnedFd>,
    pub vrr_enabled: bool,
    pub colorspace: u64,
    /// Receives the CRTC out-fence fd; boxed for a stable address during the ioctl
    pub out_fence: Box<i64>,
}

impl ConnectorCommitState {
    /// Destroy blobs that were prepared but not committed and close fds
    pub fn rollback(&mut self, dev: &DrmDeviceFd, crtc: &DrmCrtc, conn_hdr_blob: u32) {
        rollback_blob(dev, crtc.mode_id_blob, self.mode_blob);
        rollback_blob(dev, crtc.gamma_lut_blob, self.gamma_blob);
        rollback_blob(dev, conn_hdr_blob, self.hdr_blob);
        destroy_blob(dev, self.damage_blob);
        self.damage_blob = 0;
        self.in_fence = None;
        if *self.out_fence >= 0 {
            // SAFETY: the fd was handed to us by the kernel and not claimed
            drop(unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(*self.out_fence as i32) });
            *self.out_fence = -1;
        }
    }

    /// Apply the prepared objects after a successful real commit
    ///
    /// Replaces the CRTC-owned blobs, imports the out-fence into the signal
    /// timeline and reports the adaptive-sync transition.
    pub fn apply(&mut self, dev: &DrmDeviceFd, crtc: &mut DrmCrtc, conn_hdr_blob: &mut u32) {
        if !crtc.own_mode_id {
            // don't try to delete a previous master's blobs
            crtc.mode_id_blob = 0;
        }
        crtc.own_mode_id = true;
        commit_blob(dev, &mut crtc.mode_id_blob, self.mode_blob);
        commit_blob(dev, &mut crtc.gamma_lut_blob, self.gamma_blob);
        commit_blob(dev, conn_hdr_blob, self.hdr_blob);

        destroy_blob(dev, self.damage_blob);
        self.damage_blob = 0;
        self.in_fence = None;

        if *self.out_fence >= 0 {
            // SAFETY: fresh fd returned by the kernel through OUT_FENCE_PTR
            let fence = unsafe {
                <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(*self.out_fence as i32)
            };
            if let Some((timeline, point)) = &self.signal_timeline {
                if let Err(err) = timeline.import_sync_file(*point, fence.as_fd()) {
                    warn!("Failed to import out-fence into signal timeline: {}", err);
                }
            }
            *self.out_fence = -1;
        }
    }
}

/// A full device commit: per-connector states plus device-wide flags
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub modeset: bool,
    pub nonblock: bool,
    pub connectors: Vec<ConnectorCommitState>,
}

/// The three interchangeable commit drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrmIface {
    /// Atomic modesetting
    Atomic,
    /// Legacy single-CRTC ioctls
    Legacy,
    /// Atomic modesetting with virtual layer to plane mapping
    PlaneComposition,
}

impl ConnectorCommitState {
    /// Export an in-fence from the wait timeline, if one was committed
    pub fn prepare_in_fence(&mut self) -> Result<(), Error> {
        if let Some((timeline, point)) = &self.wait_timeline {
            let fence = timeline.export_sync_file(*point).map_err(|source| Error::KmsRejected {
                errmsg: "Failed to export in-fence from wait timeline",
                source,
            })?;
            self.in_fence = Some(fence);
        }
        Ok(())
    }

    /// Create the mode blob for a modeset
    pub fn prepare_mode_blob(&mut self, dev: &DrmDeviceFd, crtc: &DrmCrtc) -> Result<(), Error> {
        self.mode_blob = crtc.mode_id_blob;
        if !self.active {
            self.mode_blob = 0;
            return Ok(());
        }
        let Some(mode) = self.mode else {
            return Ok(());
        };
        // `Mode` is a transparent wrapper around the kernel's mode-info
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &mode as *const drm::control::Mode as *const u8,
                std::mem::size_of::<drm::control::Mode>(),
            )
        };
        self.mode_blob = create_blob(dev, bytes).map_err(|source| Error::KmsRejected {
            errmsg: "Unable to create mode property blob",
            source,
        })?;
        Ok(())
    }

    /// Create the gamma blob (or apply legacy gamma when the property is absent)
    pub fn prepare_gamma(&mut self, dev: &DrmDeviceFd, crtc: &DrmCrtc) -> Result<(), Error> {
        self.gamma_blob = crtc.gamma_lut_blob;
        let Some(gamma) = &self.gamma else {
            return Ok(());
        };

        if crtc.props.gamma_lut.is_none() {
            // Fallback to the legacy gamma interface when gamma properties are
            // not available (can happen on older Intel GPUs that support gamma
            // but not degamma).
            let size = crtc.legacy_gamma_size;
            return set_legacy_gamma(dev, crtc, size, gamma.as_ref().map(|(d, l)| (*d, l.as_slice())));
        }

        self.gamma_blob = match gamma {
            Some((dim, lut)) => create_gamma_lut_blob(dev, *dim, lut)?,
            None => 0,
        };
        Ok(())
    }

    /// Create the damage blob for planes supporting `FB_DAMAGE_CLIPS`
    pub fn prepare_damage(&mut self, dev: &DrmDeviceFd, supported: bool) -> Result<(), Error> {
        if !self.committed.contains(StateField::DAMAGE) || !supported {
            return Ok(());
        }
        let Some(fb) = &self.primary_fb else {
            return Ok(());
        };
        let (w, h) = fb.fb.size();
        self.damage_blob = create_fb_damage_clips_blob(dev, w as i32, h as i32, &self.damage)?;
        Ok(())
    }

    /// Convert the image description into kernel state
    pub fn prepare_image_description(&mut self, dev: &DrmDeviceFd, current_colorspace: u64, current_hdr_blob: u32) -> Result<(), Error> {
        self.colorspace = current_colorspace;
        self.hdr_blob = current_hdr_blob;
        if !self.committed.contains(StateField::IMAGE_DESCRIPTION) {
            return Ok(());
        }
        match &self.image_description {
            Some(desc) => {
                self.colorspace = colorspace_for_primaries(Some(desc.primaries));
                self.hdr_blob = create_hdr_output_metadata_blob(dev, desc)?;
            }
            None => {
                self.colorspace = colorspace_for_primaries(None);
                self.hdr_blob = 0;
            }
        }
        Ok(())
    }
}

/// Program a gamma ramp through the legacy ioctl
pub(crate) fn set_legacy_gamma(
    dev: &DrmDeviceFd,
    crtc: &DrmCrtc,
    size: usize,
    gamma: Option<(usize, &[u16])>,
) -> Result<(), Error> {
    let mut red = vec![0u16; size];
    let mut green = vec![0u16; size];
    let mut blue = vec![0u16; size];
    match gamma {
        Some((dim, lut)) if dim == size => {
            red.copy_from_slice(&lut[..size]);
            green.copy_from_slice(&lut[size..2 * size]);
            blue.copy_from_slice(&lut[2 * size..3 * size]);
        }
        Some((dim, lut)) => {
            // resample the ramp to the hardware size
            for i in 0..size {
                let src = i * dim / size;
                red[i] = lut[src];
                green[i] = lut[dim + src];
                blue[i] = lut[2 * dim + src];
            }
        }
        None => {
            // identity ramp
            for (i, (r, (g, b))) in red
                .iter_mut()
                .zip(green.iter_mut().zip(blue.iter_mut()))
                .enumerate()
            {
                let v = ((i as u64 * 0xffff) / (size.max(2) as u64 - 1)) as u16;
                *r = v;
                *g = v;
                *b = v;
            }
        }
    }

    use drm::control::Device as ControlDevice;
    dev.set_gamma(crtc.handle, &red, &green, &blue)
        .map_err(|source| Error::KmsRejected {
            errmsg: "Failed to set legacy gamma",
            source,
        })
}

/// Log-friendly description of device commit flags
pub(crate) fn commit_flags_str(modeset: bool, nonblock: bool, test_only: bool, page_flip_event: bool, async_flip: bool) -> String {
    let mut parts = Vec::new();
    if page_flip_event {
        parts.push("PAGE_FLIP_EVENT");
    }
    if async_flip {
        parts.push("PAGE_FLIP_ASYNC");
    }
    if test_only {
        parts.push("TEST_ONLY");
    }
    if nonblock {
        parts.push("NONBLOCK");
    }
    if modeset {
        parts.push("ALLOW_MODESET");
    }
    if parts.is_empty() {
        "none".into()
    } else {
        parts.join(" | ")
    }
}

pub(crate) fn debug_commit_flags(modeset: bool, nonblock: bool, test_only: bool, page_flip_event: bool, async_flip: bool) {
    debug!(
        "(commit flags: {})",
        commit_flags_str(modeset, nonblock, test_only, page_flip_event, async_flip)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_flags_format() {
        assert_eq!(commit_flags_str(false, false, false, false, false), "none");
        assert_eq!(
            commit_flags_str(true, true, false, true, false),
            "PAGE_FLIP_EVENT | NONBLOCK | ALLOW_MODESET"
        );
        assert_eq!(commit_flags_str(false, false, true, false, true), "PAGE_FLIP_ASYNC | TEST_ONLY");
    }

    #[test]
    fn cta861_coords_clamp_and_scale() {
        assert_eq!(cta861_color_coord(0.0), 0);
        assert_eq!(cta861_color_coord(1.0), 50000);
        assert_eq!(cta861_color_coord(2.0), 50000);
        assert_eq!(cta861_color_coord(0.3127), 15635);
    }

    #[test]
    fn colorspace_mapping() {
        assert_eq!(colorspace_for_primaries(None), 0);
        assert_eq!(colorspace_for_primaries(Some(Primaries::Srgb)), 0);
        assert_eq!(colorspace_for_primaries(Some(Primaries::Bt2020)), 9);
    }
}
