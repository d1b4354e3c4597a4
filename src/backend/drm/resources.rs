//! Enumeration and property introspection of KMS resources
//!
//! At backend construction the CRTC and plane lists are queried once,
//! together with the property ids needed for atomic commits. Connectors are
//! scanned separately (and re-scanned on hotplug) by the backend facade.

use std::os::unix::io::AsFd;

use drm::control::{crtc, plane, property, Device as ControlDevice, PlaneType};
use drm::{Device, DriverCapability};

use tracing::{trace, warn};

use crate::backend::allocator::format::FormatSet;
use crate::backend::allocator::{Fourcc, Modifier};
use crate::utils::{Physical, Size};

use super::error::{AccessError, Error};
use super::fb::PlaneFb;
use super::fd::{DevPath, DrmDeviceFd};

/// Property handles of a connector
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectorProps {
    /// `CRTC_ID`
    pub crtc_id: Option<property::Handle>,
    /// `link-status`
    pub link_status: Option<property::Handle>,
    /// `content type`
    pub content_type: Option<property::Handle>,
    /// `max bpc`
    pub max_bpc: Option<property::Handle>,
    /// `Colorspace`
    pub colorspace: Option<property::Handle>,
    /// `HDR_OUTPUT_METADATA`
    pub hdr_output_metadata: Option<property::Handle>,
    /// `non-desktop`
    pub non_desktop: Option<property::Handle>,
    /// `panel orientation`
    pub panel_orientation: Option<property::Handle>,
    /// `vrr_capable`
    pub vrr_capable: Option<property::Handle>,
    /// `EDID`
    pub edid: Option<property::Handle>,
}

/// Property handles of a CRTC
#[derive(Debug, Default, Clone, Copy)]
pub struct CrtcProps {
    /// `MODE_ID`
    pub mode_id: Option<property::Handle>,
    /// `ACTIVE`
    pub active: Option<property::Handle>,
    /// `GAMMA_LUT`
    pub gamma_lut: Option<property::Handle>,
    /// `GAMMA_LUT_SIZE`
    pub gamma_lut_size: Option<property::Handle>,
    /// `VRR_ENABLED`
    pub vrr_enabled: Option<property::Handle>,
    /// `OUT_FENCE_PTR`
    pub out_fence_ptr: Option<property::Handle>,
}

/// Property handles of a plane
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaneProps {
    /// `FB_ID`
    pub fb_id: Option<property::Handle>,
    /// `CRTC_ID`
    pub crtc_id: Option<property::Handle>,
    /// `SRC_X`
    pub src_x: Option<property::Handle>,
    /// `SRC_Y`
    pub src_y: Option<property::Handle>,
    /// `SRC_W`
    pub src_w: Option<property::Handle>,
    /// `SRC_H`
    pub src_h: Option<property::Handle>,
    /// `CRTC_X`
    pub crtc_x: Option<property::Handle>,
    /// `CRTC_Y`
    pub crtc_y: Option<property::Handle>,
    /// `CRTC_W`
    pub crtc_w: Option<property::Handle>,
    /// `CRTC_H`
    pub crtc_h: Option<property::Handle>,
    /// `IN_FENCE_FD`
    pub in_fence_fd: Option<property::Handle>,
    /// `FB_DAMAGE_CLIPS`
    pub fb_damage_clips: Option<property::Handle>,
    /// `HOTSPOT_X`
    pub hotspot_x: Option<property::Handle>,
    /// `HOTSPOT_Y`
    pub hotspot_y: Option<property::Handle>,
}

/// One introspected property: its handle, info and current raw value
pub(crate) struct PropEntry {
    pub handle: property::Handle,
    pub info: property::Info,
    pub raw: u64,
}

/// Query all properties of a resource as a name-indexed map
pub(crate) fn query_props(
    dev: &DrmDeviceFd,
    handle: impl drm::control::ResourceHandle,
) -> Result<indexmap::IndexMap<String, PropEntry>, Error> {
    let set = dev.get_properties(handle).map_err(|source| AccessError {
        errmsg: "Failed to query properties",
        dev: dev.dev_path(),
        source,
    })?;

    let mut map = indexmap::IndexMap::new();
    let (handles, raw_values) = set.as_props_and_values();
    for (&handle, &raw) in handles.iter().zip(raw_values.iter()) {
        let Ok(info) = dev.get_property(handle) else {
            continue;
        };
        let Ok(name) = info.name().to_str() else {
            continue;
        };
        map.insert(name.to_owned(), PropEntry { handle, info, raw });
    }
    Ok(map)
}

impl ConnectorProps {
    pub(crate) fn from_map(map: &indexmap::IndexMap<String, PropEntry>) -> Self {
        ConnectorProps {
            crtc_id: map.get("CRTC_ID").map(|p| p.handle),
            link_status: map.get("link-status").map(|p| p.handle),
            content_type: map.get("content type").map(|p| p.handle),
            max_bpc: map.get("max bpc").map(|p| p.handle),
            colorspace: map.get("Colorspace").map(|p| p.handle),
            hdr_output_metadata: map.get("HDR_OUTPUT_METADATA").map(|p| p.handle),
            non_desktop: map.get("non-desktop").map(|p| p.handle),
            panel_orientation: map.get("panel orientation").map(|p| p.handle),
            vrr_capable: map.get("vrr_capable").map(|p| p.handle),
            edid: map.get("EDID").map(|p| p.handle),
        }
    }
}

impl CrtcProps {
    pub(crate) fn from_map(map: &indexmap::IndexMap<String, PropEntry>) -> Self {
        CrtcProps {
            mode_id: map.get("MODE_ID").map(|p| p.handle),
            active: map.get("ACTIVE").map(|p| p.handle),
            gamma_lut: map.get("GAMMA_LUT").map(|p| p.handle),
            gamma_lut_size: map.get("GAMMA_LUT_SIZE").map(|p| p.handle),
            vrr_enabled: map.get("VRR_ENABLED").map(|p| p.handle),
            out_fence_ptr: map.get("OUT_FENCE_PTR").map(|p| p.handle),
        }
    }
}

impl PlaneProps {
    pub(crate) fn from_map(map: &indexmap::IndexMap<String, PropEntry>) -> Self {
        PlaneProps {
            fb_id: map.get("FB_ID").map(|p| p.handle),
            crtc_id: map.get("CRTC_ID").map(|p| p.handle),
            src_x: map.get("SRC_X").map(|p| p.handle),
            src_y: map.get("SRC_Y").map(|p| p.handle),
            src_w: map.get("SRC_W").map(|p| p.handle),
            src_h: map.get("SRC_H").map(|p| p.handle),
            crtc_x: map.get("CRTC_X").map(|p| p.handle),
            crtc_y: map.get("CRTC_Y").map(|p| p.handle),
            crtc_w: map.get("CRTC_W").map(|p| p.handle),
            crtc_h: map.get("CRTC_H").map(|p| p.handle),
            in_fence_fd: map.get("IN_FENCE_FD").map(|p| p.handle),
            fb_damage_clips: map.get("FB_DAMAGE_CLIPS").map(|p| p.handle),
            hotspot_x: map.get("HOTSPOT_X").map(|p| p.handle),
            hotspot_y: map.get("HOTSPOT_Y").map(|p| p.handle),
        }
    }
}

/// A hardware plane of the device
#[derive(Debug)]
pub struct DrmPlane {
    /// KMS handle of the plane
    pub handle: plane::Handle,
    /// Type of the plane
    pub kind: PlaneType,
    /// Bitmask of compatible CRTCs, indexed by CRTC position in the backend list
    pub possible_crtcs: u32,
    /// Supported format+modifier pairs
    pub formats: FormatSet,
    /// Property handles
    pub props: PlaneProps,
    /// Framebuffer currently being scanned out
    pub(crate) current_fb: Option<PlaneFb>,
    /// Framebuffer queued by a commit, promoted to current on page-flip
    pub(crate) queued_fb: Option<PlaneFb>,
    /// Accepted cursor sizes published by `SIZE_HINTS` (cursor planes only)
    pub cursor_sizes: Vec<Size<i32, Physical>>,
}

impl DrmPlane {
    /// Promote the queued framebuffer to current, unlocking the previous one
    pub(crate) fn rotate_queued_fb(&mut self) {
        if self.queued_fb.is_some() {
            self.current_fb = self.queued_fb.take();
        }
    }
}

/// A display controller of the device
#[derive(Debug)]
pub struct DrmCrtc {
    /// KMS handle of the CRTC
    pub handle: crtc::Handle,
    /// Property handles
    pub props: CrtcProps,
    /// Size of the legacy gamma ramp
    pub legacy_gamma_size: usize,
    /// Blob id of the currently committed mode, 0 if none
    pub(crate) mode_id_blob: u32,
    /// Whether the mode blob is owned by us (as opposed to a previous master)
    pub(crate) own_mode_id: bool,
    /// Blob id of the currently committed gamma LUT, 0 if none
    pub(crate) gamma_lut_blob: u32,
    /// Index of the primary plane in the backend plane list
    pub primary: usize,
    /// Index of the cursor plane in the backend plane list, if any
    pub cursor: Option<usize>,
    /// Per-layer framebuffers of the output layers on this CRTC
    pub(crate) layers: Vec<CrtcLayer>,
}

/// Framebuffer slots of one output layer on a CRTC
#[derive(Debug, Default)]
pub(crate) struct CrtcLayer {
    pub id: usize,
    pub current_fb: Option<PlaneFb>,
    pub queued_fb: Option<PlaneFb>,
}

/// Parsed `SIZE_HINTS` blob entry layout
#[repr(C)]
struct PlaneSizeHint {
    width: u16,
    height: u16,
}

/// Gamma LUT size of a CRTC: atomic `GAMMA_LUT_SIZE` when present,
/// else the legacy ramp size
pub(crate) fn crtc_gamma_size(dev: &DrmDeviceFd, crtc: &DrmCrtc) -> usize {
    if crtc.props.gamma_lut_size.is_some() {
        if let Ok(map) = query_props(dev, crtc.handle) {
            if let Some(entry) = map.get("GAMMA_LUT_SIZE") {
                return entry.raw as usize;
            }
        }
    }
    crtc.legacy_gamma_size
}

pub(crate) fn init_crtcs(dev: &DrmDeviceFd, crtcs: &[crtc::Handle]) -> Result<Vec<DrmCrtc>, Error> {
    let mut out = Vec::with_capacity(crtcs.len());
    for &handle in crtcs {
        let info = dev.get_crtc(handle).map_err(|source| AccessError {
            errmsg: "Error loading crtc info",
            dev: dev.dev_path(),
            source,
        })?;
        let map = query_props(dev, handle)?;
        out.push(DrmCrtc {
            handle,
            props: CrtcProps::from_map(&map),
            legacy_gamma_size: info.gamma_length() as usize,
            mode_id_blob: 0,
            own_mode_id: false,
            gamma_lut_blob: 0,
            primary: usize::MAX,
            cursor: None,
            layers: Vec::new(),
        });
    }
    Ok(out)
}

pub(crate) fn init_planes(
    dev: &DrmDeviceFd,
    crtcs: &mut [DrmCrtc],
    no_modifiers: bool,
) -> Result<Vec<DrmPlane>, Error> {
    let res_handles = dev.resource_handles().map_err(|source| AccessError {
        errmsg: "Error loading resource handles",
        dev: dev.dev_path(),
        source,
    })?;
    let plane_handles = dev.plane_handles().map_err(|source| AccessError {
        errmsg: "Error loading plane handles",
        dev: dev.dev_path(),
        source,
    })?;

    let mut planes = Vec::new();
    for &handle in plane_handles.planes() {
        let info = dev.get_plane(handle).map_err(|source| AccessError {
            errmsg: "Failed to get plane info",
            dev: dev.dev_path(),
            source,
        })?;

        let map = query_props(dev, handle)?;
        let kind = match map.get("type").map(|p| p.raw) {
            Some(x) if x == PlaneType::Primary as u64 => PlaneType::Primary,
            Some(x) if x == PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };

        // compatibility mask indexed by our crtc positions
        let compatible = res_handles.filter_crtcs(info.possible_crtcs());
        let mut possible_crtcs = 0u32;
        for (idx, crtc) in crtcs.iter().enumerate() {
            if compatible.contains(&crtc.handle) {
                possible_crtcs |= 1 << idx;
            }
        }

        let mut formats = plane_formats(dev, &info, &map, kind, no_modifiers)?;
        if formats.is_empty() {
            formats.add(Fourcc::Argb8888, Modifier::Invalid);
        }

        let cursor_sizes = if kind == PlaneType::Cursor {
            cursor_size_hints(dev, &map)
        } else {
            Vec::new()
        };

        trace!(?handle, ?kind, ?possible_crtcs, "Discovered plane");

        planes.push(DrmPlane {
            handle,
            kind,
            possible_crtcs,
            formats,
            props: PlaneProps::from_map(&map),
            current_fb: None,
            queued_fb: None,
            cursor_sizes,
        });
    }

    // Assign each primary/cursor plane to the first matching CRTC
    for (crtc_idx, crtc) in crtcs.iter_mut().enumerate() {
        for (plane_idx, plane) in planes.iter().enumerate() {
            if plane.possible_crtcs & (1 << crtc_idx) == 0 {
                continue;
            }
            match plane.kind {
                PlaneType::Primary if crtc.primary == usize::MAX => {
                    crtc.primary = plane_idx;
                }
                PlaneType::Cursor if crtc.cursor.is_none() => {
                    crtc.cursor = Some(plane_idx);
                }
                _ => {}
            }
        }
        if crtc.primary == usize::MAX {
            return Err(Error::MissingCapability("primary plane per CRTC"));
        }
    }

    Ok(planes)
}

fn plane_formats(
    dev: &DrmDeviceFd,
    info: &plane::Info,
    map: &indexmap::IndexMap<String, PropEntry>,
    kind: PlaneType,
    no_modifiers: bool,
) -> Result<FormatSet, Error> {
    let mut formats = FormatSet::new();
    for code in info.formats().iter().flat_map(|x| Fourcc::try_from(*x).ok()) {
        formats.add(code, Modifier::Invalid);
    }

    let modifiers_supported =
        !no_modifiers && matches!(dev.get_driver_capability(DriverCapability::AddFB2Modifiers), Ok(1));

    if let (true, Some(entry)) = (modifiers_supported, map.get("IN_FORMATS")) {
        if let property::Value::Blob(blob) = entry.info.value_type().convert_value(entry.raw) {
            let data = dev.get_property_blob(blob).map_err(|source| AccessError {
                errmsg: "Failed to query property blob data",
                dev: dev.dev_path(),
                source,
            })?;
            // be careful here, we have no idea about the alignment inside the blob,
            // so always copy using `read_unaligned`
            unsafe {
                let fmt_mod_blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
                let fmt_mod_blob = &*fmt_mod_blob_ptr;

                let formats_ptr: *const u32 = fmt_mod_blob_ptr
                    .cast::<u8>()
                    .offset(fmt_mod_blob.formats_offset as isize)
                    as *const _;
                let modifiers_ptr: *const drm_ffi::drm_format_modifier = fmt_mod_blob_ptr
                    .cast::<u8>()
                    .offset(fmt_mod_blob.modifiers_offset as isize)
                    as *const _;

                for i in 0..fmt_mod_blob.count_modifiers {
                    let mod_info = modifiers_ptr.offset(i as isize).read_unaligned();
                    for j in 0..64 {
                        if mod_info.formats & (1u64 << j) != 0 {
                            let code = Fourcc::try_from(
                                formats_ptr.offset((j + mod_info.offset) as isize).read_unaligned(),
                            )
                            .ok();
                            let modifier = Modifier::from(mod_info.modifier);
                            if let Some(code) = code {
                                formats.add(code, modifier);
                            }
                        }
                    }
                }
            }
        }
    } else if kind == PlaneType::Cursor {
        // Force a LINEAR layout for the cursor if the driver doesn't support modifiers
        let codes: Vec<_> = formats.codes().collect();
        for code in codes {
            formats.add(code, Modifier::Linear);
        }
    }

    Ok(formats)
}

fn cursor_size_hints(
    dev: &DrmDeviceFd,
    map: &indexmap::IndexMap<String, PropEntry>,
) -> Vec<Size<i32, Physical>> {
    let mut sizes = Vec::new();

    if let Some(entry) = map.get("SIZE_HINTS") {
        if let property::Value::Blob(blob) = entry.info.value_type().convert_value(entry.raw) {
            if let Ok(data) = dev.get_property_blob(blob) {
                let count = data.len() / std::mem::size_of::<PlaneSizeHint>();
                for i in 0..count {
                    // the blob is packed, copy unaligned
                    let hint = unsafe {
                        (data.as_ptr() as *const PlaneSizeHint)
                            .add(i)
                            .read_unaligned()
                    };
                    if hint.width != 0 && hint.height != 0 {
                        sizes.push(Size::new(hint.width as i32, hint.height as i32));
                    }
                }
            }
        }
    }

    if sizes.is_empty() {
        // fall back to the single size advertised through the driver caps
        let w = dev.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(64);
        let h = dev
            .get_driver_capability(DriverCapability::CursorHeight)
            .unwrap_or(64);
        sizes.push(Size::new(w as i32, h as i32));
    }

    sizes
}

/// Capabilities the backend depends on, probed once at construction
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmCaps {
    /// `ADDFB2` with explicit modifiers is supported
    pub addfb2_modifiers: bool,
    /// Legacy `ASYNC_PAGE_FLIP` (tearing) is supported
    pub async_page_flip: bool,
    /// Atomic async page-flips (tearing) are supported
    pub atomic_async_page_flip: bool,
    /// Syncobj timelines are supported
    pub timeline: bool,
}

/// Probe device capabilities, failing on the mandatory ones
///
/// `PRIME` import, universal planes, crtc-in-vblank-event and monotonic
/// timestamps are required; everything else is optional and recorded in
/// [`DrmCaps`].
pub(crate) fn check_features(dev: &DrmDeviceFd, parent: bool) -> Result<DrmCaps, Error> {
    match dev.get_driver_capability(DriverCapability::Prime) {
        Ok(value) if value & drm_ffi::DRM_PRIME_CAP_IMPORT as u64 != 0 => {}
        _ => return Err(Error::MissingCapability("PRIME import")),
    }
    if parent {
        match dev.get_driver_capability(DriverCapability::Prime) {
            Ok(value) if value & drm_ffi::DRM_PRIME_CAP_EXPORT as u64 != 0 => {}
            _ => return Err(Error::MissingCapability("PRIME export")),
        }
    }

    if !matches!(dev.get_driver_capability(DriverCapability::CRTCInVBlankEvent), Ok(1)) {
        return Err(Error::MissingCapability("CRTC_IN_VBLANK_EVENT"));
    }
    if !matches!(dev.get_driver_capability(DriverCapability::MonotonicTimestamp), Ok(1)) {
        return Err(Error::MissingCapability("TIMESTAMP_MONOTONIC"));
    }

    if dev
        .set_client_capability(drm::ClientCapability::UniversalPlanes, true)
        .is_err()
    {
        return Err(Error::MissingCapability("universal planes"));
    }

    // DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP, too new to have a named constant everywhere
    const CAP_ATOMIC_ASYNC_PAGE_FLIP: u64 = 0x15;
    let atomic_async_page_flip = drm_ffi::get_capability(dev.as_fd(), CAP_ATOMIC_ASYNC_PAGE_FLIP)
        .map(|cap| cap.value == 1)
        .unwrap_or(false);

    let caps = DrmCaps {
        addfb2_modifiers: matches!(dev.get_driver_capability(DriverCapability::AddFB2Modifiers), Ok(1)),
        async_page_flip: matches!(dev.get_driver_capability(DriverCapability::ASyncPageFlip), Ok(1)),
        atomic_async_page_flip,
        timeline: matches!(dev.get_driver_capability(DriverCapability::SyncObjTimeline), Ok(1)),
    };

    if !caps.addfb2_modifiers {
        warn!("ADDFB2 with modifiers not supported, falling back to implicit layouts");
    }

    Ok(caps)
}
