//! The atomic commit driver
//!
//! Builds one `drmModeAtomicReq` binding all connector, CRTC and plane
//! properties of a device commit and submits it with a single ioctl. Tests
//! run the same path with `TEST_ONLY`.

use drm::control::atomic::AtomicModeReq;
use drm::control::{property, AtomicCommitFlags, Device as ControlDevice};

use tracing::{debug, trace};

use super::error::Error;
use super::fd::{DevPath, DrmDeviceFd};
use super::iface::{debug_commit_flags, ConnectorCommitState, DeviceState};
use super::resources::{DrmCrtc, DrmPlane, PlaneProps};
use super::{ConnectorSlab, DrmConnector};
use crate::output::StateField;

// Values of the `link-status` and `content type` enum properties
const LINK_STATUS_GOOD: u64 = 0;
const CONTENT_TYPE_GRAPHICS: u64 = 1;

// DRM_MODE_PAGE_FLIP_ASYNC for atomic commits
fn async_flag() -> AtomicCommitFlags {
    AtomicCommitFlags::from_bits_retain(0x2)
}

pub(super) struct Atomic {
    pub(super) req: AtomicModeReq,
    pub(super) failed: Option<&'static str>,
}

impl Atomic {
    pub(super) fn new() -> Self {
        Atomic {
            req: AtomicModeReq::new(),
            failed: None,
        }
    }

    pub(super) fn add<H>(&mut self, handle: H, prop: Option<property::Handle>, value: property::Value<'static>)
    where
        H: Into<drm::control::RawResourceHandle>,
    {
        match prop {
            Some(prop) => self.req.add_property(handle.into(), prop, value),
            None => self.failed = Some("missing a required property"),
        }
    }

    /// Add a property only when the hardware advertises it
    fn add_opt<H>(&mut self, handle: H, prop: Option<property::Handle>, value: property::Value<'static>)
    where
        H: Into<drm::control::RawResourceHandle>,
    {
        if let Some(prop) = prop {
            self.req.add_property(handle.into(), prop, value);
        }
    }
}

pub(super) fn plane_disable(atom: &mut Atomic, plane: &DrmPlane) {
    let props: &PlaneProps = &plane.props;
    atom.add(plane.handle, props.fb_id, property::Value::Framebuffer(None));
    atom.add(plane.handle, props.crtc_id, property::Value::CRTC(None));
}

#[allow(clippy::too_many_arguments)]
pub(super) fn set_plane_props(
    atom: &mut Atomic,
    plane: &DrmPlane,
    fb: drm::control::framebuffer::Handle,
    crtc: drm::control::crtc::Handle,
    src: crate::utils::Rectangle<f64, crate::utils::Buffer>,
    dst: crate::utils::Rectangle<i32, crate::utils::Physical>,
) {
    let props = &plane.props;
    let id = plane.handle;

    // the SRC_* properties are in 16.16 fixed point
    atom.add(
        id,
        props.src_x,
        property::Value::UnsignedRange((src.loc.x * (1 << 16) as f64) as u64),
    );
    atom.add(
        id,
        props.src_y,
        property::Value::UnsignedRange((src.loc.y * (1 << 16) as f64) as u64),
    );
    atom.add(
        id,
        props.src_w,
        property::Value::UnsignedRange((src.size.w * (1 << 16) as f64) as u64),
    );
    atom.add(
        id,
        props.src_h,
        property::Value::UnsignedRange((src.size.h * (1 << 16) as f64) as u64),
    );
    atom.add(id, props.fb_id, property::Value::Framebuffer(Some(fb)));
    atom.add(id, props.crtc_id, property::Value::CRTC(Some(crtc)));
    atom.add(id, props.crtc_x, property::Value::SignedRange(dst.loc.x as i64));
    atom.add(id, props.crtc_y, property::Value::SignedRange(dst.loc.y as i64));
    atom.add(id, props.crtc_w, property::Value::UnsignedRange(dst.size.w as u64));
    atom.add(id, props.crtc_h, property::Value::UnsignedRange(dst.size.h as u64));
}

pub(super) fn atomic_connector_add(
    atom: &mut Atomic,
    conn: &DrmConnector,
    crtc: &DrmCrtc,
    planes: &[DrmPlane],
    st: &ConnectorCommitState,
    modeset: bool,
) {
    let active = st.active;

    atom.add(
        conn.handle,
        conn.props.crtc_id,
        if active {
            property::Value::CRTC(Some(crtc.handle))
        } else {
            property::Value::CRTC(None)
        },
    );
    if modeset && active {
        atom.add_opt(
            conn.handle,
            conn.props.link_status,
            property::Value::Unknown(LINK_STATUS_GOOD),
        );
    }
    if active {
        atom.add_opt(
            conn.handle,
            conn.props.content_type,
            property::Value::Unknown(CONTENT_TYPE_GRAPHICS),
        );
    }
    if modeset && active && conn.max_bpc_bounds.map(|(_, max)| max != 0).unwrap_or(false) {
        if let (Some(bounds), Some(fb)) = (conn.max_bpc_bounds, st.primary_fb.as_ref()) {
            atom.add_opt(
                conn.handle,
                conn.props.max_bpc,
                property::Value::UnsignedRange(super::iface::pick_max_bpc(bounds, fb)),
            );
        }
    }
    atom.add_opt(
        conn.handle,
        conn.props.colorspace,
        property::Value::Unknown(st.colorspace),
    );
    atom.add_opt(
        conn.handle,
        conn.props.hdr_output_metadata,
        property::Value::Blob(st.hdr_blob as u64),
    );

    atom.add(
        crtc.handle,
        crtc.props.mode_id,
        property::Value::Blob(st.mode_blob as u64),
    );
    atom.add(crtc.handle, crtc.props.active, property::Value::Boolean(active));

    let primary = &planes[crtc.primary];
    let cursor = crtc.cursor.map(|idx| &planes[idx]);

    if active {
        atom.add_opt(
            crtc.handle,
            crtc.props.gamma_lut,
            property::Value::Blob(st.gamma_blob as u64),
        );
        atom.add_opt(
            crtc.handle,
            crtc.props.vrr_enabled,
            property::Value::Boolean(st.vrr_enabled),
        );

        match &st.primary_fb {
            Some(fb) => set_plane_props(atom, primary, fb.fb.handle(), crtc.handle, st.src_box, st.dst_box),
            None => atom.failed = Some("active connector without a primary framebuffer"),
        }
        if primary.props.fb_damage_clips.is_some() {
            atom.add_opt(
                primary.handle,
                primary.props.fb_damage_clips,
                property::Value::Blob(st.damage_blob as u64),
            );
        }
        if let Some(fence) = &st.in_fence {
            use std::os::unix::io::AsRawFd;
            match primary.props.in_fence_fd {
                Some(prop) => atom.req.add_property(
                    primary.handle.into(),
                    prop,
                    property::Value::SignedRange(fence.as_raw_fd() as i64),
                ),
                None => atom.failed = Some("plane is missing the IN_FENCE_FD property"),
            }
        }
        if st.committed.contains(StateField::SIGNAL_TIMELINE) {
            match crtc.props.out_fence_ptr {
                Some(prop) => atom.req.add_property(
                    crtc.handle.into(),
                    prop,
                    property::Value::Unknown(&*st.out_fence as *const i64 as u64),
                ),
                None => atom.failed = Some("CRTC is missing the OUT_FENCE_PTR property"),
            }
        }

        if let Some(cursor) = cursor {
            if conn.cursor.visible {
                if let Some(fb) = &conn.cursor.fb {
                    let (w, h) = fb.fb.size();
                    let cursor_src = crate::utils::Rectangle::from_size((w as f64, h as f64).into());
                    let cursor_dst = crate::utils::Rectangle::new(
                        (conn.cursor.x, conn.cursor.y).into(),
                        (w as i32, h as i32).into(),
                    );
                    set_plane_props(atom, cursor, fb.fb.handle(), crtc.handle, cursor_src, cursor_dst);
                    if cursor.props.hotspot_x.is_some() && cursor.props.hotspot_y.is_some() {
                        atom.add(
                            cursor.handle,
                            cursor.props.hotspot_x,
                            property::Value::SignedRange(conn.cursor.hotspot.0 as i64),
                        );
                        atom.add(
                            cursor.handle,
                            cursor.props.hotspot_y,
                            property::Value::SignedRange(conn.cursor.hotspot.1 as i64),
                        );
                    }
                } else {
                    plane_disable(atom, cursor);
                }
            } else {
                plane_disable(atom, cursor);
            }
        }
    } else {
        plane_disable(atom, primary);
        if let Some(cursor) = cursor {
            plane_disable(atom, cursor);
        }
    }
}

/// Submit a device commit through the atomic interface
pub(crate) fn atomic_device_commit(
    dev: &DrmDeviceFd,
    crtcs: &mut [DrmCrtc],
    planes: &[DrmPlane],
    connectors: &mut ConnectorSlab,
    state: &mut DeviceState,
    page_flip_event: bool,
    test_only: bool,
) -> Result<(), Error> {
    let modeset = state.modeset;
    let nonblock = state.nonblock;
    let async_flip = state.connectors.iter().any(|st| st.tearing);

    let mut prepare_result = Ok(());
    for st in &mut state.connectors {
        let crtc = &crtcs[st.crtc_idx];
        let conn = &connectors[st.conn_idx];
        prepare_result = (|| {
            if modeset {
                st.prepare_mode_blob(dev, crtc)?;
            } else {
                st.mode_blob = crtc.mode_id_blob;
            }
            st.prepare_gamma(dev, crtc)?;
            st.prepare_damage(dev, planes[crtc.primary].props.fb_damage_clips.is_some())?;
            st.prepare_in_fence()?;
            st.prepare_image_description(dev, conn.current_colorspace, conn.hdr_metadata_blob)?;
            Ok(())
        })();
        if prepare_result.is_err() {
            break;
        }
    }

    let result = if let Err(err) = prepare_result {
        Err(err)
    } else {
        let mut atom = Atomic::new();
        for st in &state.connectors {
            atomic_connector_add(
                &mut atom,
                &connectors[st.conn_idx],
                &crtcs[st.crtc_idx],
                planes,
                st,
                modeset,
            );
        }

        if let Some(reason) = atom.failed {
            Err(Error::KmsRejected {
                errmsg: reason,
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            })
        } else {
            let mut flags = AtomicCommitFlags::empty();
            if test_only {
                flags |= AtomicCommitFlags::TEST_ONLY;
            }
            if modeset {
                flags |= AtomicCommitFlags::ALLOW_MODESET;
            }
            if nonblock {
                flags |= AtomicCommitFlags::NONBLOCK;
            }
            if page_flip_event {
                flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
            }
            if async_flip {
                flags |= async_flag();
            }

            trace!(?flags, connectors = state.connectors.len(), "Atomic commit");
            dev.atomic_commit(flags, atom.req.clone()).map_err(|source| {
                if test_only {
                    debug!("Atomic test failed: {}", source);
                } else {
                    debug!(dev = ?dev.dev_path(), "Atomic commit failed: {}", source);
                }
                debug_commit_flags(modeset, nonblock, test_only, page_flip_event, async_flip);
                Error::KmsRejected {
                    errmsg: "Atomic commit failed",
                    source,
                }
            })
        }
    };

    let ok = result.is_ok();
    for st in state.connectors.iter_mut() {
        let crtc = &mut crtcs[st.crtc_idx];
        let conn = &mut connectors[st.conn_idx];
        if ok && !test_only {
            st.apply(dev, crtc, &mut conn.hdr_metadata_blob);
            conn.current_colorspace = st.colorspace;
        } else {
            // rolling back an unprepared state is harmless, all ids are zero
            let hdr = conn.hdr_metadata_blob;
            st.rollback(dev, crtc, hdr);
        }
    }

    result
}
