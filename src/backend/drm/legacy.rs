//! The legacy commit driver
//!
//! Used on devices without atomic modesetting. Only single-CRTC commits are
//! possible: modesets go through `drmModeSetCrtc`, frames through
//! `drmModePageFlip` (with `ASYNC` for tearing when the device advertises the
//! cap). Legacy cannot request page-flip events on disables, so the caller
//! omits disabling connectors from the page-flip record.

use drm::control::{Device as ControlDevice, PageFlipFlags};

use tracing::{debug, trace};

use super::error::Error;
use super::fd::DrmDeviceFd;
use super::iface::{set_legacy_gamma, DeviceState};
use super::resources::{DrmCaps, DrmCrtc};
use super::ConnectorSlab;
use crate::output::StateField;

/// Submit a device commit through the legacy interface
pub(crate) fn legacy_device_commit(
    dev: &DrmDeviceFd,
    caps: &DrmCaps,
    crtcs: &mut [DrmCrtc],
    connectors: &mut ConnectorSlab,
    state: &mut DeviceState,
    page_flip_event: bool,
    test_only: bool,
) -> Result<(), Error> {
    if state.connectors.len() > 1 {
        debug!("Legacy interface cannot commit multiple connectors at once");
        return Err(Error::KmsRejected {
            errmsg: "legacy multi-connector commit",
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        });
    }

    for st in &mut state.connectors {
        let crtc = &crtcs[st.crtc_idx];
        let conn = &connectors[st.conn_idx];

        if st.tearing && !caps.async_page_flip {
            debug!("Tearing requested but ASYNC_PAGE_FLIP is not supported");
            return Err(Error::TearingUnsupported);
        }
        if st.committed.contains(StateField::SIGNAL_TIMELINE)
            || st.committed.contains(StateField::WAIT_TIMELINE)
        {
            return Err(Error::KmsRejected {
                errmsg: "legacy interface does not support timelines",
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            });
        }

        if test_only {
            // there is no legacy test ioctl; accept everything the basic
            // checks allowed and let the real commit fail loudly instead
            trace!(conn = %conn.name, "Legacy test accepted");
            continue;
        }

        if state.modeset {
            if st.active {
                let fb = st
                    .primary_fb
                    .as_ref()
                    .ok_or(Error::NoModeForConnector(conn.handle))?;
                let mode = st.mode;
                dev.set_crtc(
                    crtc.handle,
                    Some(fb.fb.handle()),
                    (0, 0),
                    &[conn.handle],
                    mode,
                )
                .map_err(|source| Error::KmsRejected {
                    errmsg: "drmModeSetCrtc failed",
                    source,
                })?;
            } else {
                dev.set_crtc(crtc.handle, None, (0, 0), &[], None)
                    .map_err(|source| Error::KmsRejected {
                        errmsg: "drmModeSetCrtc (disable) failed",
                        source,
                    })?;
            }
        } else if st.active {
            if let Some(gamma) = &st.gamma {
                set_legacy_gamma(
                    dev,
                    crtc,
                    crtc.legacy_gamma_size,
                    gamma.as_ref().map(|(d, l)| (*d, l.as_slice())),
                )?;
            }

            if let Some(fb) = &st.primary_fb {
                let mut flags = PageFlipFlags::empty();
                if page_flip_event {
                    flags |= PageFlipFlags::EVENT;
                }
                if st.tearing {
                    flags |= PageFlipFlags::ASYNC;
                }
                ControlDevice::page_flip(dev, crtc.handle, fb.fb.handle(), flags, None).map_err(
                    |source| {
                        if source.raw_os_error() == Some(libc::EBUSY) {
                            Error::FrameInFlight
                        } else {
                            Error::KmsRejected {
                                errmsg: "drmModePageFlip failed",
                                source,
                            }
                        }
                    },
                )?;
            }
        }
    }

    if !test_only {
        for st in state.connectors.iter_mut() {
            let conn = &mut connectors[st.conn_idx];
            conn.current_colorspace = st.colorspace;
        }
    }

    Ok(())
}
