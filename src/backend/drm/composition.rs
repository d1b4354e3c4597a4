//! The plane-composition commit driver
//!
//! Extends the atomic driver with per-CRTC virtual layers: each committed
//! output layer is greedily assigned to a compatible, still unused overlay
//! plane and the combined request is verified with a `TEST_ONLY` commit. A
//! layer whose buffer could not be promoted stays composited and a feedback
//! event advertises the candidate planes' combined format set so clients can
//! reallocate into a promotable format.

use drm::control::{AtomicCommitFlags, Device as ControlDevice, PlaneType};

use tracing::{debug, trace};

use crate::backend::allocator::format::FormatSet;

use super::atomic::{atomic_connector_add, set_plane_props, Atomic};
use super::error::Error;
use super::fd::DrmDeviceFd;
use super::iface::DeviceState;
use super::resources::{DrmCrtc, DrmPlane};
use super::ConnectorSlab;

/// Feedback for a layer that stayed composited
#[derive(Debug, Clone)]
pub struct LayerFeedback {
    /// Id of the layer
    pub layer: usize,
    /// Index of the connector in the backend list
    pub(crate) conn_idx: usize,
    /// Combined format set of the candidate planes
    pub formats: FormatSet,
}

/// Assignment of layers to overlay planes for one commit attempt
#[derive(Debug, Default)]
struct LayerMapping {
    /// (connector state index, layer index, plane index)
    assigned: Vec<(usize, usize, usize)>,
}

fn assign_layers(
    crtcs: &[DrmCrtc],
    planes: &[DrmPlane],
    state: &DeviceState,
) -> LayerMapping {
    let mut mapping = LayerMapping::default();
    let mut used: Vec<usize> = Vec::new();

    for (st_idx, st) in state.connectors.iter().enumerate() {
        if !st.active {
            continue;
        }
        let crtc_idx = st.crtc_idx;
        let crtc = &crtcs[crtc_idx];

        for (layer_idx, layer) in st.layers.iter().enumerate() {
            let Some(fb) = &layer.fb else {
                continue;
            };
            let format = fb.fb.format();

            let candidate = planes.iter().enumerate().find(|(plane_idx, plane)| {
                plane.kind == PlaneType::Overlay
                    && plane.possible_crtcs & (1 << crtc_idx) != 0
                    && !used.contains(plane_idx)
                    && *plane_idx != crtc.primary
                    && Some(*plane_idx) != crtc.cursor
                    && plane.formats.has(format.code, format.modifier)
            });

            if let Some((plane_idx, _)) = candidate {
                used.push(plane_idx);
                mapping.assigned.push((st_idx, layer_idx, plane_idx));
            }
        }
    }

    mapping
}

fn build_request(
    crtcs: &[DrmCrtc],
    planes: &[DrmPlane],
    connectors: &ConnectorSlab,
    state: &DeviceState,
    mapping: &LayerMapping,
    modeset: bool,
) -> Atomic {
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
    for &(st_idx, layer_idx, plane_idx) in &mapping.assigned {
        let st = &state.connectors[st_idx];
        let layer = &st.layers[layer_idx];
        let fb = layer.fb.as_ref().expect("assigned layer without framebuffer");
        set_plane_props(
            &mut atom,
            &planes[plane_idx],
            fb.fb.handle(),
            crtcs[st.crtc_idx].handle,
            layer.src,
            layer.dst,
        );
    }
    atom
}

/// Combined format set of all overlay planes that could serve a CRTC
fn candidate_formats(crtc_idx: usize, crtc: &DrmCrtc, planes: &[DrmPlane]) -> FormatSet {
    let mut formats = FormatSet::new();
    for (plane_idx, plane) in planes.iter().enumerate() {
        if plane.kind != PlaneType::Overlay
            || plane.possible_crtcs & (1 << crtc_idx) == 0
            || plane_idx == crtc.primary
            || Some(plane_idx) == crtc.cursor
        {
            continue;
        }
        formats.union_with(&plane.formats);
    }
    formats
}

/// Submit a device commit, mapping output layers to hardware planes
#[allow(clippy::too_many_arguments)]
pub(crate) fn composition_device_commit(
    dev: &DrmDeviceFd,
    crtcs: &mut [DrmCrtc],
    planes: &[DrmPlane],
    connectors: &mut ConnectorSlab,
    state: &mut DeviceState,
    page_flip_event: bool,
    test_only: bool,
    feedback: &mut Vec<LayerFeedback>,
) -> Result<(), Error> {
    let mut mapping = assign_layers(crtcs, planes, state);

    // verify the mapping; demote everything on rejection rather than
    // searching the exponential assignment space
    if !mapping.assigned.is_empty() {
        let atom = build_request(crtcs, planes, connectors, state, &mapping, state.modeset);
        let test = if atom.failed.is_some() {
            Err(())
        } else {
            dev.atomic_commit(
                AtomicCommitFlags::TEST_ONLY
                    | if state.modeset {
                        AtomicCommitFlags::ALLOW_MODESET
                    } else {
                        AtomicCommitFlags::empty()
                    },
                atom.req.clone(),
            )
            .map_err(|err| {
                trace!("Layer mapping rejected by test: {}", err);
            })
        };
        if test.is_err() {
            debug!(
                layers = mapping.assigned.len(),
                "Demoting layers to composition after failed test"
            );
            mapping.assigned.clear();
        }
    }

    // record the final promotion state and feedback for demoted layers
    for (st_idx, st) in state.connectors.iter_mut().enumerate() {
        let crtc_idx = st.crtc_idx;
        for (layer_idx, layer) in st.layers.iter_mut().enumerate() {
            layer.accepted = mapping
                .assigned
                .iter()
                .any(|&(s, l, _)| s == st_idx && l == layer_idx);
            if !layer.accepted && layer.fb.is_some() && !test_only {
                feedback.push(LayerFeedback {
                    layer: layer.id,
                    conn_idx: st.conn_idx,
                    formats: candidate_formats(crtc_idx, &crtcs[crtc_idx], planes),
                });
            }
        }
    }

    // the base commit follows the plain atomic path; assigned layers are
    // added on top of the same request
    if mapping.assigned.is_empty() {
        return super::atomic::atomic_device_commit(
            dev,
            crtcs,
            planes,
            connectors,
            state,
            page_flip_event,
            test_only,
        );
    }

    atomic_commit_with_layers(
        dev,
        crtcs,
        planes,
        connectors,
        state,
        &mapping,
        page_flip_event,
        test_only,
    )
}

#[allow(clippy::too_many_arguments)]
fn atomic_commit_with_layers(
    dev: &DrmDeviceFd,
    crtcs: &mut [DrmCrtc],
    planes: &[DrmPlane],
    connectors: &mut ConnectorSlab,
    state: &mut DeviceState,
    mapping: &LayerMapping,
    page_flip_event: bool,
    test_only: bool,
) -> Result<(), Error> {
    let modeset = state.modeset;
    let nonblock = state.nonblock;

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
        let atom = build_request(crtcs, planes, connectors, state, mapping, modeset);
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
            dev.atomic_commit(flags, atom.req.clone())
                .map_err(|source| Error::KmsRejected {
                    errmsg: "Atomic commit failed",
                    source,
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
            let hdr = conn.hdr_metadata_blob;
            st.rollback(dev, crtc, hdr);
        }
    }

    result
}
