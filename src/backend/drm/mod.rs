//! The DRM/KMS backend
//!
//! Drives real GPU display controllers: connectors are mapped to CRTCs,
//! client buffers are imported as KMS framebuffers, commits go through one of
//! three interchangeable drivers (atomic, legacy, plane-composition) and
//! page-flip completions feed presentation feedback.
//!
//! The backend is an event source; insert it into the compositor's event loop
//! so page-flip events are processed. Session pause/activate events must be
//! forwarded through [`DrmBackend::handle_session_event`].

pub(crate) mod atomic;
pub(crate) mod composition;
pub mod error;
mod fb;
mod fd;
pub(crate) mod iface;
pub(crate) mod legacy;
pub mod matcher;
mod page_flip;
pub mod render;
mod resources;

use std::cell::RefCell;
use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use calloop::{EventSource, Interest, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, Device as ControlDevice, Event, ModeTypeFlags, RawResourceHandle};

use tracing::{debug, info, info_span, trace, warn};

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::format::FormatSet;
use crate::backend::session::Event as SessionEvent;
use crate::output::{
    AdaptiveSyncStatus, AspectRatio, ImageDescription, LayerId, Mode, ModeRequest, Output,
    OutputBackend, OutputError, OutputState, PhysicalProperties, PresentEvent, PresentFlags,
    StateField, Subpixel,
};
use crate::utils::env::env_flag;
use crate::utils::{Monotonic, Physical, Rectangle, Signal, Size, Time, Transform};

pub use self::composition::LayerFeedback;
pub use self::error::{CommitErrorKind, Error, FramebufferError};
pub use self::fb::DrmFramebuffer;
pub use self::fd::{DevPath, DeviceFd, DrmDeviceFd};
pub use self::resources::{ConnectorProps, CrtcProps, DrmCaps, DrmCrtc, DrmPlane, PlaneProps};

use self::fb::{FramebufferCache, PlaneFb};
use self::iface::{ConnectorCommitState, DeviceState, DrmIface, LayerCommit};
use self::page_flip::PageFlip;
use self::resources::CrtcLayer;

/// Status of a connector as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// A display is attached
    Connected,
    /// No display is attached
    Disconnected,
    /// The kernel cannot probe the connector state
    Unknown,
}

impl ConnectorStatus {
    fn from_state(state: connector::State) -> Self {
        match state {
            connector::State::Connected => ConnectorStatus::Connected,
            connector::State::Disconnected => ConnectorStatus::Disconnected,
            connector::State::Unknown => ConnectorStatus::Unknown,
        }
    }

    /// Human readable status string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Connected => "connected",
            ConnectorStatus::Disconnected => "disconnected",
            ConnectorStatus::Unknown => "unknown",
        }
    }
}

/// Hardware cursor state of a connector
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    pub x: i32,
    pub y: i32,
    pub hotspot: (i32, i32),
    pub fb: Option<PlaneFb>,
    pub enabled: bool,
    pub visible: bool,
}

#[derive(Debug, Clone)]
struct DrmMode {
    info: drm::control::Mode,
    meta: Mode,
}

/// A connector of the DRM device
///
/// Created on first enumeration and kept across disconnects; only the
/// compositor-facing output is torn down on disconnect. Destroyed on backend
/// teardown or when the kernel stops reporting it.
#[derive(Debug)]
pub struct DrmConnector {
    pub(crate) handle: connector::Handle,
    /// Raw KMS object id
    pub(crate) id: u32,
    /// Human readable name like `HDMI-A-1`
    pub(crate) name: String,
    pub(crate) status: ConnectorStatus,
    pub(crate) props: ConnectorProps,
    /// Compatibility mask over CRTC indices
    pub(crate) possible_crtcs: u32,
    /// Currently assigned CRTC index
    pub(crate) crtc: Option<usize>,
    modes: Vec<DrmMode>,
    physical_size: (i32, i32),
    subpixel: Subpixel,
    non_desktop: bool,
    panel_orientation: Transform,
    pub(crate) max_bpc_bounds: Option<(u64, u64)>,
    pub(crate) current_colorspace: u64,
    pub(crate) hdr_metadata_blob: u32,
    supports_vrr: bool,
    supported_transfer_functions: Vec<crate::backend::renderer::color::TransferFunction>,
    supported_primaries: Vec<crate::backend::renderer::color::Primaries>,
    /// Refresh of the current mode in mHz, for presentation feedback
    refresh: i32,
    pub(crate) cursor: CursorState,
    pending_page_flip: Option<Rc<PageFlip>>,
    lease: Option<NonZeroU32>,
    make: String,
    model: String,
    serial: Option<String>,
    /// Compositor-facing output, present while connected
    output: Option<Output>,
}

impl DrmConnector {
    /// The KMS object id of this connector
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The connector name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection status
    pub fn status(&self) -> ConnectorStatus {
        self.status
    }

    /// The compositor-facing output, while connected
    pub fn output(&self) -> Option<Output> {
        self.output.clone()
    }

    /// Whether the display should not be used for desktop output (VR headsets)
    pub fn is_non_desktop(&self) -> bool {
        self.non_desktop
    }

    /// Orientation of the panel relative to its casing
    pub fn panel_orientation(&self) -> Transform {
        self.panel_orientation
    }

    fn is_enabled(&self) -> bool {
        self.output
            .as_ref()
            .map(|output| output.is_enabled())
            .unwrap_or(false)
    }
}

/// Slab of connectors with stable indices
///
/// Connectors keep their index across disconnects; freed slots stay `None`
/// until backend teardown. Indexing a freed slot is a logic error.
#[derive(Debug, Default)]
pub(crate) struct ConnectorSlab(Vec<Option<DrmConnector>>);

impl ConnectorSlab {
    fn insert(&mut self, conn: DrmConnector) -> usize {
        if let Some(idx) = self.0.iter().position(|slot| slot.is_none()) {
            self.0[idx] = Some(conn);
            idx
        } else {
            self.0.push(Some(conn));
            self.0.len() - 1
        }
    }

    fn remove(&mut self, idx: usize) -> Option<DrmConnector> {
        self.0.get_mut(idx).and_then(|slot| slot.take())
    }

    fn get(&self, idx: usize) -> Option<&DrmConnector> {
        self.0.get(idx).and_then(|slot| slot.as_ref())
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut DrmConnector> {
        self.0.get_mut(idx).and_then(|slot| slot.as_mut())
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &DrmConnector)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|conn| (idx, conn)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut DrmConnector)> {
        self.0
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_mut().map(|conn| (idx, conn)))
    }

    fn find_by_handle(&self, handle: connector::Handle) -> Option<usize> {
        self.iter().find(|(_, conn)| conn.handle == handle).map(|(idx, _)| idx)
    }
}

impl Index<usize> for ConnectorSlab {
    type Output = DrmConnector;
    fn index(&self, idx: usize) -> &DrmConnector {
        self.0[idx].as_ref().expect("stale connector index")
    }
}

impl IndexMut<usize> for ConnectorSlab {
    fn index_mut(&mut self, idx: usize) -> &mut DrmConnector {
        self.0[idx].as_mut().expect("stale connector index")
    }
}

/// A lease of connectors handed to another DRM master
///
/// Dropping the lease revokes it.
#[derive(Debug)]
pub struct DrmLease {
    backend: Weak<RefCell<DrmBackendInner>>,
    lessee_id: NonZeroU32,
    connectors: Vec<usize>,
    fd: Option<OwnedFd>,
}

impl DrmLease {
    /// The lessee id assigned by the kernel
    pub fn lessee_id(&self) -> NonZeroU32 {
        self.lessee_id
    }

    /// Take the lease file descriptor to pass to the lessee
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Drop for DrmLease {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.upgrade() {
            let mut inner = backend.borrow_mut();
            if let Err(err) = inner.fd.revoke_lease(self.lessee_id) {
                warn!("Failed to revoke lease: {}", err);
            }
            for idx in &self.connectors {
                if let Some(conn) = inner.connectors.get_mut(*idx) {
                    conn.lease = None;
                }
            }
        }
    }
}

/// Signals emitted by the DRM backend
#[derive(Debug, Default)]
pub struct DrmBackendEvents {
    /// A connector got connected; carries the new output
    pub new_output: Signal<Output>,
    /// An output layer stayed composited; carries candidate plane formats
    pub layer_feedback: Signal<(Output, LayerId, FormatSet)>,
    /// The device was removed, the backend is destroying itself
    pub destroy: Signal<()>,
}

#[derive(Debug)]
pub(crate) struct DrmBackendInner {
    fd: DrmDeviceFd,
    iface: DrmIface,
    caps: DrmCaps,
    active: bool,
    crtcs: Vec<DrmCrtc>,
    planes: Vec<DrmPlane>,
    connectors: ConnectorSlab,
    fbs: FramebufferCache,
    page_flips: Vec<Rc<PageFlip>>,
    mgpu: Option<render::MultiGpuBlitter>,
    #[allow(dead_code)]
    span: tracing::Span,
}

/// Events delivered by the backend event source
#[derive(Debug)]
pub enum DrmEvent {
    /// A page-flip completed on an output
    PageFlipCompleted(Output),
    /// The connector topology may have changed, rescan recommended
    Error(Error),
}

/// Handle to the DRM backend
#[derive(Debug, Clone)]
pub struct DrmBackend {
    inner: Rc<RefCell<DrmBackendInner>>,
    events: Rc<DrmBackendEvents>,
}

impl DrmBackend {
    /// Create a new backend on an open DRM device fd
    ///
    /// `parent` is set when this device renders through another GPU
    /// (multi-GPU setups); it additionally requires PRIME export support.
    pub fn new(fd: DrmDeviceFd, parent: Option<render::MultiGpuBlitter>) -> Result<DrmBackend, Error> {
        let span = info_span!("backend_drm");
        let _guard = span.enter();
        info!(dev = ?fd.dev_path(), "Initializing DRM backend");

        let caps = resources::check_features(&fd, parent.is_some())?;
        let iface = select_iface(&fd)?;
        info!(?iface, "Using KMS interface");

        let no_modifiers = env_flag("WLR_DRM_NO_MODIFIERS");

        let res_handles = fd.resource_handles().map_err(|source| error::AccessError {
            errmsg: "Error loading resource handles",
            dev: fd.dev_path(),
            source,
        })?;
        let mut crtcs = resources::init_crtcs(&fd, res_handles.crtcs())?;
        let planes = resources::init_planes(&fd, &mut crtcs, no_modifiers)?;

        drop(_guard);
        let backend = DrmBackend {
            inner: Rc::new(RefCell::new(DrmBackendInner {
                fd,
                iface,
                caps,
                active: true,
                crtcs,
                planes,
                connectors: ConnectorSlab::default(),
                fbs: FramebufferCache::default(),
                page_flips: Vec::new(),
                mgpu: parent,
                span,
            })),
            events: Rc::new(DrmBackendEvents::default()),
        };

        backend.scan_connectors();
        Ok(backend)
    }

    /// The signals of this backend
    pub fn events(&self) -> &DrmBackendEvents {
        &self.events
    }

    /// The underlying device fd
    pub fn device_fd(&self) -> DrmDeviceFd {
        self.inner.borrow().fd.clone()
    }

    /// Whether the backend commits through the atomic interface
    pub fn is_atomic(&self) -> bool {
        !matches!(self.inner.borrow().iface, DrmIface::Legacy)
    }

    /// All outputs of currently connected connectors
    pub fn outputs(&self) -> Vec<Output> {
        self.inner
            .borrow()
            .connectors
            .iter()
            .filter_map(|(_, conn)| conn.output.clone())
            .collect()
    }

    /// Forward a session event
    ///
    /// While paused, commits fail fast; on activation the outputs are asked
    /// to render a new frame so the previous contents get restored.
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::PauseSession => {
                self.inner.borrow_mut().active = false;
            }
            SessionEvent::ActivateSession => {
                self.inner.borrow_mut().active = true;
                let outputs = self.outputs();
                for output in outputs {
                    output.schedule_frame();
                }
            }
        }
    }

    /// Re-scan connectors after a hotplug event
    ///
    /// Returns the outputs that appeared. Disconnected connectors have their
    /// output destroyed but stay in the backend list.
    pub fn scan_connectors(&self) -> Vec<Output> {
        let mut new_outputs = Vec::new();

        let (res_connectors, dev) = {
            let inner = self.inner.borrow();
            let res = match inner.fd.resource_handles() {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to get resource handles: {}", err);
                    return new_outputs;
                }
            };
            (res.connectors().to_vec(), inner.fd.clone())
        };

        let mut seen: Vec<usize> = Vec::new();
        for handle in res_connectors {
            let info = match dev.get_connector(handle, true) {
                Ok(info) => info,
                Err(err) => {
                    warn!(?handle, "Failed to get connector info: {}", err);
                    continue;
                }
            };

            let idx = {
                let inner = self.inner.borrow();
                inner.connectors.find_by_handle(handle)
            };
            let idx = match idx {
                Some(idx) => idx,
                None => self.create_connector(handle, &info),
            };
            seen.push(idx);

            let status = ConnectorStatus::from_state(info.state());
            let previous = self.inner.borrow().connectors[idx].status;
            match (previous, status) {
                (ConnectorStatus::Connected, ConnectorStatus::Connected) => {}
                (_, ConnectorStatus::Connected) => {
                    if let Some(output) = self.connect_connector(idx, &info) {
                        new_outputs.push(output);
                    }
                }
                (ConnectorStatus::Connected, _) => {
                    self.disconnect_connector(idx);
                    self.inner.borrow_mut().connectors[idx].status = status;
                }
                _ => {
                    self.inner.borrow_mut().connectors[idx].status = status;
                }
            }
        }

        // destroy connectors that disappeared from the kernel list
        let stale: Vec<usize> = self
            .inner
            .borrow()
            .connectors
            .iter()
            .map(|(idx, _)| idx)
            .filter(|idx| !seen.contains(idx))
            .collect();
        for idx in stale {
            self.disconnect_connector(idx);
            self.inner.borrow_mut().connectors.remove(idx);
        }

        for output in &new_outputs {
            self.events.new_output.emit(output);
        }
        new_outputs
    }

    fn create_connector(&self, handle: connector::Handle, info: &connector::Info) -> usize {
        let mut inner = self.inner.borrow_mut();
        let dev = inner.fd.clone();

        let props = resources::query_props(&dev, handle)
            .map(|map| ConnectorProps::from_map(&map))
            .unwrap_or_default();

        let name = format!(
            "{}-{}",
            connector_type_name(info.interface()),
            info.interface_id()
        );

        // union of the possible CRTCs of all encoders
        let mut possible_crtcs = 0u32;
        if let Ok(res) = dev.resource_handles() {
            for encoder in info.encoders() {
                if let Ok(enc) = dev.get_encoder(*encoder) {
                    let compatible = res.filter_crtcs(enc.possible_crtcs());
                    for (crtc_idx, crtc) in inner.crtcs.iter().enumerate() {
                        if compatible.contains(&crtc.handle) {
                            possible_crtcs |= 1 << crtc_idx;
                        }
                    }
                }
            }
        }

        debug!(name, "Found connector");

        let conn = DrmConnector {
            handle,
            id: u32::from(RawResourceHandle::from(handle)),
            name,
            status: ConnectorStatus::Disconnected,
            props,
            possible_crtcs,
            crtc: None,
            modes: Vec::new(),
            physical_size: (0, 0),
            subpixel: Subpixel::Unknown,
            non_desktop: false,
            panel_orientation: Transform::Normal,
            max_bpc_bounds: None,
            current_colorspace: 0,
            hdr_metadata_blob: 0,
            supports_vrr: false,
            supported_transfer_functions: vec![
                crate::backend::renderer::color::TransferFunction::Srgb,
                crate::backend::renderer::color::TransferFunction::Gamma22,
            ],
            supported_primaries: vec![crate::backend::renderer::color::Primaries::Srgb],
            refresh: 0,
            cursor: CursorState::default(),
            pending_page_flip: None,
            lease: None,
            make: "Unknown".into(),
            model: "Unknown".into(),
            serial: None,
            output: None,
        };
        inner.connectors.insert(conn)
    }

    fn connect_connector(&self, idx: usize, info: &connector::Info) -> Option<Output> {
        let output_backend;
        let name;
        let physical;
        {
            let mut inner = self.inner.borrow_mut();
            let dev = inner.fd.clone();

            let prop_map = resources::query_props(&dev, info.handle()).ok();

            // EDID derived identity
            let (make, model, serial) = prop_map
                .as_ref()
                .and_then(|map| parse_edid(&dev, map))
                .unwrap_or(("Unknown".into(), "Unknown".into(), None));

            let conn = &mut inner.connectors[idx];
            conn.status = ConnectorStatus::Connected;
            conn.make = make;
            conn.model = model;
            conn.serial = serial;
            conn.physical_size = (info.size().unwrap_or((0, 0)).0 as i32, info.size().unwrap_or((0, 0)).1 as i32);
            conn.subpixel = subpixel_from_raw(info.subpixel());
            conn.modes = info
                .modes()
                .iter()
                .map(|mode| DrmMode {
                    info: *mode,
                    meta: mode_meta(mode),
                })
                .collect();

            if let Some(map) = &prop_map {
                conn.non_desktop = map.get("non-desktop").map(|p| p.raw != 0).unwrap_or(false);
                conn.supports_vrr = map.get("vrr_capable").map(|p| p.raw != 0).unwrap_or(false);
                conn.panel_orientation = map
                    .get("panel orientation")
                    .map(|p| match p.raw {
                        1 => Transform::_180,
                        2 => Transform::_90,
                        3 => Transform::_270,
                        _ => Transform::Normal,
                    })
                    .unwrap_or(Transform::Normal);
                conn.max_bpc_bounds = map.get("max bpc").and_then(|p| {
                    match p.info.value_type() {
                        drm::control::property::ValueType::UnsignedRange(min, max) => Some((min, max)),
                        _ => None,
                    }
                });
                if conn.props.colorspace.is_some() {
                    conn.supported_primaries
                        .push(crate::backend::renderer::color::Primaries::Bt2020);
                }
                if conn.props.hdr_output_metadata.is_some() {
                    conn.supported_transfer_functions
                        .push(crate::backend::renderer::color::TransferFunction::St2084Pq);
                }
            }

            info!(
                conn = %conn.name,
                modes = conn.modes.len(),
                "Connector connected"
            );

            name = conn.name.clone();
            physical = PhysicalProperties {
                size: conn.physical_size,
                subpixel: conn.subpixel,
                make: conn.make.clone(),
                model: conn.model.clone(),
                serial: conn.serial.clone(),
            };
            output_backend = DrmOutputBackend {
                backend: Rc::downgrade(&self.inner),
                conn_idx: idx,
                events: Rc::downgrade(&self.events),
            };
        }

        let output = Output::new(name, physical, Box::new(output_backend));
        {
            let inner = self.inner.borrow();
            let conn = &inner.connectors[idx];
            output.set_modes(conn.modes.iter().map(|m| m.meta).collect());
        }
        self.inner.borrow_mut().connectors[idx].output = Some(output.clone());
        Some(output)
    }

    fn disconnect_connector(&self, idx: usize) {
        let output = {
            let mut inner = self.inner.borrow_mut();
            let Some(conn) = inner.connectors.get_mut(idx) else {
                return;
            };
            if conn.status == ConnectorStatus::Disconnected {
                return;
            }
            info!(conn = %conn.name, "Connector disconnected");
            conn.status = ConnectorStatus::Disconnected;
            conn.modes.clear();
            conn.output.take()
        };
        // tear down the compositor-facing output, the connector itself stays
        if let Some(output) = output {
            output.destroy();
        }
        self.inner.borrow_mut().dealloc_crtc_for(idx);
    }

    /// Create a lease for the given outputs
    ///
    /// The CRTC, connector and primary/cursor planes of every output are
    /// bundled into the lease.
    pub fn create_lease(&self, outputs: &[Output]) -> Result<DrmLease, Error> {
        let mut inner = self.inner.borrow_mut();
        let mut objects: Vec<RawResourceHandle> = Vec::new();
        let mut conn_indices = Vec::new();

        for output in outputs {
            let Some((idx, _)) = inner
                .connectors
                .iter()
                .find(|(_, conn)| conn.output.as_ref() == Some(output))
            else {
                continue;
            };

            let conn = &inner.connectors[idx];
            let Some(crtc_idx) = conn.crtc else {
                return Err(Error::NoCrtcForConnector(conn.handle));
            };
            let crtc = &inner.crtcs[crtc_idx];

            objects.push(conn.handle.into());
            objects.push(crtc.handle.into());
            objects.push(inner.planes[crtc.primary].handle.into());
            if let Some(cursor) = crtc.cursor {
                objects.push(inner.planes[cursor].handle.into());
            }
            conn_indices.push(idx);
        }

        if objects.is_empty() {
            return Err(Error::KmsRejected {
                errmsg: "no leasable objects",
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            });
        }

        debug!(?objects, "Creating lease");
        let (lessee_id, fd) = inner
            .fd
            .create_lease(&objects, (rustix::fs::OFlags::CLOEXEC).bits())
            .map_err(|source| Error::KmsRejected {
                errmsg: "drmModeCreateLease failed",
                source,
            })?;

        for idx in &conn_indices {
            inner.connectors[*idx].lease = Some(lessee_id);
        }

        Ok(DrmLease {
            backend: Rc::downgrade(&self.inner),
            lessee_id,
            connectors: conn_indices,
            fd: Some(fd),
        })
    }

    /// Set the hardware cursor of an output
    ///
    /// `buffer` of `None` hides the cursor. Returns false when the cursor
    /// could not be set and software fallback should be used.
    pub fn set_cursor(
        &self,
        output: &Output,
        buffer: Option<&Dmabuf>,
        hotspot: (i32, i32),
    ) -> bool {
        if env_flag("WLR_NO_HARDWARE_CURSORS") {
            return false;
        }

        let mut inner = self.inner.borrow_mut();
        let Some((idx, _)) = inner
            .connectors
            .iter()
            .find(|(_, conn)| conn.output.as_ref() == Some(output))
        else {
            return false;
        };

        let Some(crtc_idx) = inner.connectors[idx].crtc else {
            return false;
        };
        let Some(cursor_plane_idx) = inner.crtcs[crtc_idx].cursor else {
            return false;
        };

        match buffer {
            Some(buffer) => {
                use crate::backend::allocator::Buffer as _;
                let sizes = inner.planes[cursor_plane_idx].cursor_sizes.clone();
                let fits = sizes
                    .iter()
                    .any(|size| size.w as u32 >= buffer.width() && size.h as u32 >= buffer.height());
                if !fits {
                    debug!("Cursor buffer exceeds all accepted cursor sizes");
                    return false;
                }

                let formats = inner.planes[cursor_plane_idx].formats.clone();
                let fb = match inner.import_buffer(buffer, Some(&formats)) {
                    Ok(fb) => fb,
                    Err(err) => {
                        debug!("Failed to import cursor buffer: {}", err);
                        return false;
                    }
                };
                let conn = &mut inner.connectors[idx];
                conn.cursor.fb = Some(fb);
                conn.cursor.hotspot = hotspot;
                conn.cursor.enabled = true;
                conn.cursor.visible = true;
            }
            None => {
                let conn = &mut inner.connectors[idx];
                conn.cursor.fb = None;
                conn.cursor.enabled = false;
                conn.cursor.visible = false;
            }
        }
        true
    }

    /// Move the hardware cursor of an output
    pub fn move_cursor(&self, output: &Output, x: i32, y: i32) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some((idx, _)) = inner
            .connectors
            .iter()
            .find(|(_, conn)| conn.output.as_ref() == Some(output))
        else {
            return false;
        };
        let conn = &mut inner.connectors[idx];
        if !conn.cursor.enabled {
            return false;
        }
        conn.cursor.x = x;
        conn.cursor.y = y;
        conn.cursor.visible = x >= 0 && y >= 0;
        true
    }

    fn handle_page_flip(
        &self,
        crtc: drm::control::crtc::Handle,
        seq: u32,
        duration: Duration,
    ) -> Option<Output> {
        let mut inner = self.inner.borrow_mut();

        let record = inner
            .page_flips
            .iter()
            .find(|flip| flip.covers(crtc))
            .cloned()?;

        let conn_idx = record.pop(crtc);
        if record.is_complete() {
            inner.page_flips.retain(|flip| !Rc::ptr_eq(flip, &record));
        }
        let conn_idx = conn_idx?;

        {
            let conn = inner.connectors.get_mut(conn_idx)?;
            conn.pending_page_flip = None;

            if conn.status != ConnectorStatus::Connected || conn.crtc.is_none() {
                debug!(conn = %conn.name, "Ignoring page-flip event for disabled connector");
                return None;
            }
        }

        let crtc_idx = inner.connectors[conn_idx].crtc.unwrap();
        let (primary, cursor) = {
            let crtc = &inner.crtcs[crtc_idx];
            (crtc.primary, crtc.cursor)
        };
        inner.planes[primary].rotate_queued_fb();
        if let Some(cursor) = cursor {
            inner.planes[cursor].rotate_queued_fb();
        }
        for layer in &mut inner.crtcs[crtc_idx].layers {
            if layer.queued_fb.is_some() {
                layer.current_fb = layer.queued_fb.take();
            }
        }

        let mut flags = PresentFlags::HW_CLOCK | PresentFlags::HW_COMPLETION;
        if !record.async_flip {
            flags |= PresentFlags::VSYNC;
        }
        // Don't report ZERO_COPY in multi-gpu situations, because we had to
        // copy data between the GPUs, even if we were using the direct
        // scanout interface.
        if inner.mgpu.is_none() {
            flags |= PresentFlags::ZERO_COPY;
        }

        let conn = &inner.connectors[conn_idx];
        let output = conn.output.clone()?;
        let refresh = conn.refresh;
        let active = inner.active;
        drop(inner);

        output.send_present(PresentEvent {
            // the DRM backend guarantees that the presentation event is for
            // the last submitted frame
            commit_seq: output.commit_seq(),
            presented: active,
            when: Some(Time::<Monotonic>::from_parts(
                duration.as_secs() as i64,
                duration.subsec_nanos(),
            )),
            seq: seq as u64,
            refresh_ns: mhz_to_nsec(refresh),
            flags,
        });

        if active {
            output.send_frame();
        }

        Some(output)
    }

    /// Destroy the backend, dropping every pending page-flip record
    pub fn destroy(&self) {
        self.events.destroy.emit(&());
        let mut inner = self.inner.borrow_mut();
        inner.page_flips.clear();
        let indices: Vec<usize> = inner.connectors.iter().map(|(idx, _)| idx).collect();
        drop(inner);
        for idx in indices {
            self.disconnect_connector(idx);
            self.inner.borrow_mut().connectors.remove(idx);
        }
        self.inner.borrow().fbs.clear();
    }
}

impl AsRawFd for DrmBackend {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.borrow().fd.as_raw_fd()
    }
}

impl EventSource for DrmBackend {
    type Event = DrmEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(
        &mut self,
        _: Readiness,
        _: Token,
        mut callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let fd = self.inner.borrow().fd.clone();
        match fd.receive_events() {
            Ok(events) => {
                for event in events {
                    if let Event::PageFlip(event) = event {
                        trace!(crtc = ?event.crtc, "Page-flip event");
                        if let Some(output) =
                            self.handle_page_flip(event.crtc, event.frame, event.duration)
                        {
                            callback(DrmEvent::PageFlipCompleted(output), &mut ());
                        }
                    } else {
                        trace!("Unhandled DRM event");
                    }
                }
            }
            Err(source) => {
                callback(
                    DrmEvent::Error(
                        error::AccessError {
                            errmsg: "Error processing drm events",
                            dev: self.inner.borrow().fd.dev_path(),
                            source,
                        }
                        .into(),
                    ),
                    &mut (),
                );
            }
        }

        // deliver idle frame events owed to outputs
        for output in self.outputs() {
            if output.take_idle_frame() {
                output.send_frame();
            }
        }

        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let fd = self.inner.borrow().fd.clone();
        // SAFETY: the backend owns the fd and outlives the registration
        unsafe {
            poll.register(fd.as_fd(), Interest::READ, calloop::Mode::Level, factory.token())
        }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let fd = self.inner.borrow().fd.clone();
        poll.reregister(fd.as_fd(), Interest::READ, calloop::Mode::Level, factory.token())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        let fd = self.inner.borrow().fd.clone();
        poll.unregister(fd.as_fd())
    }
}

impl DrmBackendInner {
    fn import_buffer(
        &self,
        buffer: &Dmabuf,
        formats: Option<&FormatSet>,
    ) -> Result<PlaneFb, FramebufferError> {
        let buffer = match &self.mgpu {
            Some(blitter) => blitter.prepare(buffer)?,
            None => buffer.clone(),
        };
        let fb = self
            .fbs
            .import(&self.fd, self.caps.addfb2_modifiers, &buffer, formats)?;
        Ok(PlaneFb::new(fb, buffer))
    }

    fn dealloc_crtc_for(&mut self, conn_idx: usize) {
        let Some(crtc_idx) = self.connectors.get(conn_idx).and_then(|c| c.crtc) else {
            return;
        };

        let crtc = &mut self.crtcs[crtc_idx];
        let primary = crtc.primary;
        let cursor = crtc.cursor;
        crtc.layers.clear();
        self.planes[primary].current_fb = None;
        self.planes[primary].queued_fb = None;
        if let Some(cursor) = cursor {
            self.planes[cursor].current_fb = None;
            self.planes[cursor].queued_fb = None;
        }

        if let Some(conn) = self.connectors.get_mut(conn_idx) {
            conn.crtc = None;
            conn.cursor.fb = None;
        }
    }

    /// Allocate CRTCs for all connectors wanting one, keeping the previous
    /// assignment wherever possible
    fn realloc_crtcs(&mut self, want_idx: Option<usize>) {
        let num_crtcs = self.crtcs.len();
        if num_crtcs == 0 {
            return;
        }

        debug!("Reallocating CRTCs");

        let slots: Vec<usize> = self.connectors.iter().map(|(idx, _)| idx).collect();
        if slots.is_empty() {
            return;
        }

        let mut previous = vec![None; num_crtcs];
        let mut constraints = vec![0u32; slots.len()];
        for (pos, &idx) in slots.iter().enumerate() {
            let conn = &self.connectors[idx];
            if let Some(crtc) = conn.crtc {
                previous[crtc] = Some(pos);
            }

            // only request a CRTC if the connector is currently enabled or
            // it's the one the caller wants to enable
            let want_crtc = Some(idx) == want_idx || conn.is_enabled();
            constraints[pos] = if conn.status == ConnectorStatus::Connected && want_crtc {
                conn.possible_crtcs
            } else {
                0
            };
        }

        let new_match = matcher::match_connectors_with_crtcs(&constraints, &previous);

        // convert the crtc=>connector result into a connector=>crtc one
        let mut connector_match = vec![None; slots.len()];
        for (crtc_idx, slot) in new_match.iter().enumerate() {
            if let Some(pos) = slot {
                connector_match[*pos] = Some(crtc_idx);
            }
        }

        for (pos, &idx) in slots.iter().enumerate() {
            let conn = &self.connectors[idx];
            trace!(
                conn = %conn.name,
                status = conn.status.as_str(),
                old = ?conn.crtc,
                new = ?connector_match[pos],
                "CRTC assignment"
            );
        }

        // Refuse to remove a CRTC from an enabled connector, and refuse to
        // change the CRTC of an enabled connector.
        for (pos, &idx) in slots.iter().enumerate() {
            let conn = &self.connectors[idx];
            if conn.status != ConnectorStatus::Connected || !conn.is_enabled() {
                continue;
            }
            if connector_match[pos].is_none() {
                debug!("Could not match a CRTC for previously connected output; keeping old configuration");
                return;
            }
            if connector_match[pos] != conn.crtc {
                debug!("Cannot switch CRTC for enabled output; keeping old configuration");
                return;
            }
        }

        // apply the new configuration
        for (pos, &idx) in slots.iter().enumerate() {
            let keep = {
                let conn = &self.connectors[idx];
                conn.crtc.is_some() && conn.crtc == connector_match[pos]
            };
            if keep {
                continue;
            }

            self.dealloc_crtc_for(idx);
            if let Some(crtc_idx) = connector_match[pos] {
                self.connectors[idx].crtc = Some(crtc_idx);
            }
        }
    }

    fn alloc_crtc(&mut self, conn_idx: usize) -> bool {
        if self.connectors[conn_idx].crtc.is_none() {
            self.realloc_crtcs(Some(conn_idx));
        }
        self.connectors[conn_idx].crtc.is_some()
    }

    /// Build the per-connector commit state from a staged output state
    fn connector_state_init(
        &self,
        conn_idx: usize,
        output: &Output,
        state: &OutputState,
    ) -> Result<ConnectorCommitState, Error> {
        let conn = &self.connectors[conn_idx];
        let crtc_idx = conn.crtc.ok_or(Error::NoCrtcForConnector(conn.handle))?;
        let crtc = &self.crtcs[crtc_idx];

        let active = if state.committed().contains(StateField::ENABLED) {
            state.enabled
        } else {
            output.is_enabled()
        };

        let mode = if active {
            match state.mode() {
                Some(ModeRequest::Fixed(meta)) => Some(
                    conn.modes
                        .iter()
                        .find(|m| m.meta.size == meta.size && m.meta.refresh == meta.refresh)
                        .map(|m| m.info)
                        .ok_or(Error::NoModeForConnector(conn.handle))?,
                ),
                Some(ModeRequest::Custom { size, refresh }) => Some(generate_custom_mode(size, refresh)),
                None => conn
                    .modes
                    .iter()
                    .find(|m| Some(m.meta) == output.current_mode())
                    .map(|m| m.info),
            }
        } else {
            None
        };

        let primary_plane = &self.planes[crtc.primary];
        let mut primary_fb = None;
        if state.committed().contains(StateField::BUFFER) {
            let buffer = state.buffer().expect("buffer commit without buffer");
            primary_fb = Some(
                self.import_buffer(buffer, Some(&primary_plane.formats))
                    .map_err(|err| {
                        debug!("Failed to import buffer for scan-out: {}", err);
                        Error::KmsRejected {
                            errmsg: "buffer not scanout-capable",
                            source: std::io::Error::from_raw_os_error(libc::EINVAL),
                        }
                    })?,
            );
        } else if active {
            // keep scanning out the current content
            primary_fb = primary_plane
                .queued_fb
                .clone()
                .or_else(|| primary_plane.current_fb.clone());
        }

        let src_box = state
            .effective_src_box()
            .unwrap_or_else(|| Rectangle::from_size(Size::new(0.0, 0.0)));
        let dst_box: Rectangle<i32, Physical> = state.effective_dst_box().unwrap_or_else(|| {
            let size = output.current_mode().map(|m| m.size).unwrap_or_default();
            Rectangle::from_size(size)
        });

        let vrr_requested = if state.committed().contains(StateField::ADAPTIVE_SYNC) {
            state.adaptive_sync
        } else {
            output.adaptive_sync() == AdaptiveSyncStatus::Enabled
        };

        let gamma = if state.committed().contains(StateField::COLOR_TRANSFORM) {
            match &state.color_transform {
                Some(tf) => match tf.as_lut_3x1d() {
                    Some((dim, lut)) => Some(Some((dim, lut.to_vec()))),
                    None => {
                        return Err(Error::KmsRejected {
                            errmsg: "color transform is not a gamma LUT",
                            source: std::io::Error::from_raw_os_error(libc::EINVAL),
                        })
                    }
                },
                None => Some(None),
            }
        } else {
            None
        };

        let mut layers = Vec::new();
        if state.committed().contains(StateField::LAYERS) {
            for layer in &state.layers {
                let fb = match &layer.buffer {
                    Some(buffer) => Some(self.import_buffer(buffer, None).map_err(|err| {
                        debug!("Failed to import layer buffer: {}", err);
                        Error::KmsRejected {
                            errmsg: "layer buffer not scanout-capable",
                            source: std::io::Error::from_raw_os_error(libc::EINVAL),
                        }
                    })?),
                    None => None,
                };
                layers.push(LayerCommit {
                    id: layer.id.0,
                    fb,
                    src: layer.src,
                    dst: Rectangle::new(
                        (layer.dst.loc.x, layer.dst.loc.y).into(),
                        (layer.dst.size.w, layer.dst.size.h).into(),
                    ),
                    accepted: false,
                });
            }
        }

        Ok(ConnectorCommitState {
            conn_idx,
            crtc_idx,
            active,
            committed: state.committed(),
            mode,
            primary_fb,
            src_box,
            dst_box,
            damage: state.damage.clone(),
            tearing: state.committed().contains(StateField::TEARING),
            image_description: state.image_description.clone(),
            gamma,
            wait_timeline: state.wait_timeline.clone(),
            signal_timeline: state.signal_timeline.clone(),
            layers,
            mode_blob: 0,
            gamma_blob: 0,
            damage_blob: 0,
            hdr_blob: 0,
            in_fence: None,
            vrr_enabled: vrr_requested,
            colorspace: conn.current_colorspace,
            out_fence: Box::new(-1),
        })
    }

    /// Dispatch a device commit to the selected driver
    fn drive_commit(
        &mut self,
        state: &mut DeviceState,
        page_flip_event: bool,
        test_only: bool,
        feedback: &mut Vec<LayerFeedback>,
    ) -> Result<(), Error> {
        if !self.active {
            return Err(Error::SessionInactive);
        }

        let DrmBackendInner {
            fd,
            iface,
            caps,
            crtcs,
            planes,
            connectors,
            ..
        } = self;

        match iface {
            DrmIface::Atomic => atomic::atomic_device_commit(
                fd,
                crtcs,
                planes,
                connectors,
                state,
                page_flip_event,
                test_only,
            ),
            DrmIface::Legacy => legacy::legacy_device_commit(
                fd,
                caps,
                crtcs,
                connectors,
                state,
                page_flip_event,
                test_only,
            ),
            DrmIface::PlaneComposition => composition::composition_device_commit(
                fd,
                crtcs,
                planes,
                connectors,
                state,
                page_flip_event,
                test_only,
                feedback,
            ),
        }
    }

    /// Queue the framebuffers of a successful commit on their planes and
    /// create the page-flip record
    fn apply_commit(&mut self, state: &mut DeviceState, page_flip_event: bool) {
        let legacy = matches!(self.iface, DrmIface::Legacy);
        let mut flip_connectors = Vec::new();

        for st in &mut state.connectors {
            let crtc_idx = st.crtc_idx;
            let crtc_handle = self.crtcs[crtc_idx].handle;

            if st.active {
                if let Some(fb) = st.primary_fb.take() {
                    let primary = self.crtcs[crtc_idx].primary;
                    self.planes[primary].queued_fb = Some(fb);
                }
                if let Some(cursor_idx) = self.crtcs[crtc_idx].cursor {
                    let cursor_fb = self.connectors[st.conn_idx].cursor.fb.clone();
                    if self.connectors[st.conn_idx].cursor.visible {
                        self.planes[cursor_idx].queued_fb = cursor_fb;
                    }
                }
                for layer in &mut st.layers {
                    let slot = self.crtcs[crtc_idx]
                        .layers
                        .iter_mut()
                        .find(|l| l.id == layer.id);
                    let slot = match slot {
                        Some(slot) => slot,
                        None => {
                            self.crtcs[crtc_idx].layers.push(CrtcLayer {
                                id: layer.id,
                                current_fb: None,
                                queued_fb: None,
                            });
                            self.crtcs[crtc_idx].layers.last_mut().unwrap()
                        }
                    };
                    slot.queued_fb = layer.fb.take();
                }

                if let Some(mode) = st.mode {
                    self.connectors[st.conn_idx].refresh = mode_meta(&mode).refresh;
                }
            } else {
                self.dealloc_crtc_for(st.conn_idx);
            }

            // legacy cannot request page-flip events on disables
            let include = page_flip_event && (st.active || !legacy);
            if include {
                flip_connectors.push((st.conn_idx, crtc_handle));
            }
        }

        if !flip_connectors.is_empty() {
            let async_flip = state.connectors.iter().any(|st| st.tearing);
            let record = PageFlip::new(flip_connectors.clone(), async_flip);
            for (conn_idx, _) in &flip_connectors {
                // a blocking modeset may supersede an earlier non-blocking flip
                if let Some(prev) = self.connectors[*conn_idx].pending_page_flip.take() {
                    prev.supersede(*conn_idx);
                }
                self.connectors[*conn_idx].pending_page_flip = Some(record.clone());
            }
            self.page_flips.push(record);
        }
    }

    /// Transition the output-side adaptive-sync status after a commit
    fn apply_output_side(&self, state: &DeviceState) {
        for st in &state.connectors {
            let conn = &self.connectors[st.conn_idx];
            if let Some(output) = &conn.output {
                if st.committed.contains(StateField::ADAPTIVE_SYNC) {
                    output.set_adaptive_sync_status(if st.vrr_enabled {
                        AdaptiveSyncStatus::Enabled
                    } else {
                        AdaptiveSyncStatus::Disabled
                    });
                }
            }
        }
    }
}

/// The [`OutputBackend`] implementation handed to [`Output`]s of this backend
#[derive(Debug)]
struct DrmOutputBackend {
    backend: Weak<RefCell<DrmBackendInner>>,
    events: Weak<DrmBackendEvents>,
    conn_idx: usize,
}

impl DrmOutputBackend {
    fn commit_inner(
        &mut self,
        output: &Output,
        state: &OutputState,
        test_only: bool,
    ) -> Result<(), OutputError> {
        let Some(backend) = self.backend.upgrade() else {
            return Err(OutputError::Rejected("backend destroyed".into()));
        };
        let mut inner = backend.borrow_mut();

        if !inner.active {
            return Err(OutputError::Rejected(Box::new(Error::SessionInactive)));
        }

        let pending_flip = inner.connectors[self.conn_idx].pending_page_flip.is_some();
        let modeset = state.committed().intersects(
            StateField::MODE | StateField::ENABLED | StateField::RENDER_FORMAT,
        ) || state.committed().contains(StateField::ALLOW_RECONFIGURATION);
        let has_buffer = state.committed().contains(StateField::BUFFER);

        // commits on an output are strictly serialised: a second non-blocking
        // commit is refused while a page-flip is pending
        if !test_only && pending_flip && !modeset {
            return Err(OutputError::Busy);
        }

        let enabling = state.committed().contains(StateField::ENABLED) && state.enabled
            || (!state.committed().contains(StateField::ENABLED) && output.is_enabled());
        if enabling && !inner.alloc_crtc(self.conn_idx) {
            debug!("No CRTC available for this connector");
            return Err(OutputError::Rejected(Box::new(Error::NoCrtcForConnector(
                inner.connectors[self.conn_idx].handle,
            ))));
        }

        if state.committed().contains(StateField::ADAPTIVE_SYNC)
            && state.adaptive_sync
            && !inner.connectors[self.conn_idx].supports_vrr
        {
            return Err(OutputError::InvalidState("adaptive sync is not supported"));
        }

        let conn_state = inner
            .connector_state_init(self.conn_idx, output, state)
            .map_err(|err| OutputError::Rejected(Box::new(err)))?;

        let mut device_state = DeviceState {
            modeset,
            nonblock: !test_only && has_buffer && !modeset,
            connectors: vec![conn_state],
        };

        let page_flip_event = !test_only && has_buffer;
        let mut feedback = Vec::new();
        let result = inner.drive_commit(&mut device_state, page_flip_event, test_only, &mut feedback);

        match result {
            Ok(()) => {
                if !test_only {
                    inner.apply_commit(&mut device_state, page_flip_event);
                    inner.apply_output_side(&device_state);
                }
                drop(inner);
                if let Some(events) = self.events.upgrade() {
                    for fb in feedback {
                        events
                            .layer_feedback
                            .emit(&(output.clone(), LayerId(fb.layer), fb.formats));
                    }
                }
                Ok(())
            }
            Err(Error::FrameInFlight) => Err(OutputError::Busy),
            Err(err) => match err.commit_kind() {
                CommitErrorKind::Transient => Err(OutputError::Busy),
                CommitErrorKind::Fatal => {
                    // the GPU is gone, the backend tears itself down
                    drop(inner);
                    if let Some(events) = self.events.upgrade() {
                        events.destroy.emit(&());
                    }
                    Err(OutputError::Rejected(Box::new(Error::GpuRemoved)))
                }
                CommitErrorKind::Rejected => Err(OutputError::Rejected(Box::new(err))),
            },
        }
    }
}

impl OutputBackend for DrmOutputBackend {
    fn test(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        self.commit_inner(output, state, true)
    }

    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        self.commit_inner(output, state, false)
    }

    fn primary_formats(&self) -> FormatSet {
        let Some(backend) = self.backend.upgrade() else {
            return FormatSet::new();
        };
        let inner = backend.borrow();
        let Some(crtc_idx) = inner.connectors.get(self.conn_idx).and_then(|c| c.crtc) else {
            // no CRTC yet: advertise the union of all primary planes
            let mut formats = FormatSet::new();
            for plane in &inner.planes {
                if plane.kind == drm::control::PlaneType::Primary {
                    formats.union_with(&plane.formats);
                }
            }
            return formats;
        };
        inner.planes[inner.crtcs[crtc_idx].primary].formats.clone()
    }

    fn cursor_formats(&self) -> FormatSet {
        let Some(backend) = self.backend.upgrade() else {
            return FormatSet::new();
        };
        let inner = backend.borrow();
        let Some(cursor_idx) = inner
            .connectors
            .get(self.conn_idx)
            .and_then(|c| c.crtc)
            .and_then(|crtc| inner.crtcs[crtc].cursor)
        else {
            return FormatSet::new();
        };
        inner.planes[cursor_idx].formats.clone()
    }

    fn cursor_sizes(&self) -> Vec<Size<i32, Physical>> {
        let Some(backend) = self.backend.upgrade() else {
            return Vec::new();
        };
        let inner = backend.borrow();
        let Some(cursor_idx) = inner
            .connectors
            .get(self.conn_idx)
            .and_then(|c| c.crtc)
            .and_then(|crtc| inner.crtcs[crtc].cursor)
        else {
            return Vec::new();
        };
        inner.planes[cursor_idx].cursor_sizes.clone()
    }

    fn gamma_size(&self) -> usize {
        let Some(backend) = self.backend.upgrade() else {
            return 0;
        };
        let inner = backend.borrow();
        let Some(crtc_idx) = inner.connectors.get(self.conn_idx).and_then(|c| c.crtc) else {
            return 0;
        };
        resources::crtc_gamma_size(&inner.fd, &inner.crtcs[crtc_idx])
    }

    fn supports_adaptive_sync(&self) -> bool {
        self.backend
            .upgrade()
            .map(|backend| {
                backend
                    .borrow()
                    .connectors
                    .get(self.conn_idx)
                    .map(|c| c.supports_vrr)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn supports_timelines(&self) -> bool {
        self.backend
            .upgrade()
            .map(|backend| backend.borrow().caps.timeline)
            .unwrap_or(false)
    }

    fn supports_image_description(&self, desc: &ImageDescription) -> bool {
        self.backend
            .upgrade()
            .map(|backend| {
                let inner = backend.borrow();
                let Some(conn) = inner.connectors.get(self.conn_idx) else {
                    return false;
                };
                conn.supported_primaries.contains(&desc.primaries)
                    && conn
                        .supported_transfer_functions
                        .contains(&desc.transfer_function)
            })
            .unwrap_or(false)
    }

    fn allows_direct_scanout(&self) -> bool {
        self.backend
            .upgrade()
            .map(|backend| backend.borrow().mgpu.is_none())
            .unwrap_or(false)
    }
}

fn select_iface(dev: &DrmDeviceFd) -> Result<DrmIface, Error> {
    if env_flag("WLR_DRM_FORCE_LIBLIFTOFF") {
        info!("WLR_DRM_FORCE_LIBLIFTOFF is set, using the plane-composition interface");
        if dev
            .set_client_capability(drm::ClientCapability::Atomic, true)
            .is_err()
        {
            return Err(Error::MissingCapability("atomic modesetting"));
        }
        return Ok(DrmIface::PlaneComposition);
    }
    if env_flag("WLR_DRM_NO_ATOMIC") {
        info!("WLR_DRM_NO_ATOMIC is set, forcing the legacy interface");
        return Ok(DrmIface::Legacy);
    }
    if dev
        .set_client_capability(drm::ClientCapability::Atomic, true)
        .is_ok()
    {
        Ok(DrmIface::Atomic)
    } else {
        info!("Atomic modesetting unsupported, falling back to the legacy interface");
        Ok(DrmIface::Legacy)
    }
}

fn mhz_to_nsec(mhz: i32) -> u32 {
    if mhz <= 0 {
        return 0;
    }
    (1_000_000_000_000u64 / mhz as u64) as u32
}

/// Derive the output-facing mode description from kernel mode-info
fn mode_meta(mode: &drm::control::Mode) -> Mode {
    // `Mode` is a transparent wrapper around the kernel struct; the raw
    // fields carry data (vscan, aspect-ratio flags) the safe API omits
    let raw: &drm_ffi::drm_mode_modeinfo =
        unsafe { &*(mode as *const drm::control::Mode as *const drm_ffi::drm_mode_modeinfo) };

    let mut refresh = (raw.clock as i64 * 1_000_000 / raw.htotal as i64 + raw.vtotal as i64 / 2)
        / raw.vtotal as i64;

    const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;
    const DRM_MODE_FLAG_DBLSCAN: u32 = 1 << 5;
    if raw.flags & DRM_MODE_FLAG_INTERLACE != 0 {
        refresh *= 2;
    }
    if raw.flags & DRM_MODE_FLAG_DBLSCAN != 0 {
        refresh /= 2;
    }
    if raw.vscan > 1 {
        refresh /= raw.vscan as i64;
    }

    const PIC_AR_MASK: u32 = 0xF << 19;
    let picture_aspect_ratio = match (raw.flags & PIC_AR_MASK) >> 19 {
        1 => AspectRatio::_4_3,
        2 => AspectRatio::_16_9,
        3 => AspectRatio::_64_27,
        4 => AspectRatio::_256_135,
        _ => AspectRatio::None,
    };

    Mode {
        size: Size::new(raw.hdisplay as i32, raw.vdisplay as i32),
        refresh: refresh as i32,
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        picture_aspect_ratio,
    }
}

/// Generate kernel mode-info for a custom mode
///
/// Uses reduced-blanking style timings; displays running custom modes are
/// expected to cope with non-standard blanking.
fn generate_custom_mode(size: Size<i32, Physical>, refresh_mhz: i32) -> drm::control::Mode {
    let refresh = if refresh_mhz > 0 { refresh_mhz } else { 60_000 };
    let hdisplay = size.w as u32;
    let vdisplay = size.h as u32;

    let hsync_start = hdisplay + 48;
    let hsync_end = hdisplay + 80;
    let htotal = hdisplay + 160;
    let vsync_start = vdisplay + 3;
    let vsync_end = vdisplay + 8;
    let vtotal = vdisplay + 35;

    let clock = (htotal as u64 * vtotal as u64 * refresh as u64 / 1_000_000) as u32;

    const DRM_MODE_FLAG_NHSYNC: u32 = 1 << 1;
    const DRM_MODE_FLAG_PVSYNC: u32 = 1 << 2;

    let mut name = [0i8; 32];
    let name_str = format!("{}x{}", hdisplay, vdisplay);
    for (i, byte) in name_str.bytes().take(31).enumerate() {
        name[i] = byte as i8;
    }

    let raw = drm_ffi::drm_mode_modeinfo {
        clock,
        hdisplay: hdisplay as u16,
        hsync_start: hsync_start as u16,
        hsync_end: hsync_end as u16,
        htotal: htotal as u16,
        hskew: 0,
        vdisplay: vdisplay as u16,
        vsync_start: vsync_start as u16,
        vsync_end: vsync_end as u16,
        vtotal: vtotal as u16,
        vscan: 0,
        vrefresh: (refresh / 1000) as u32,
        flags: DRM_MODE_FLAG_NHSYNC | DRM_MODE_FLAG_PVSYNC,
        type_: 0,
        name,
    };

    drm::control::Mode::from(raw)
}

fn subpixel_from_raw(raw: drm::control::connector::SubPixel) -> Subpixel {
    use drm::control::connector::SubPixel;
    match raw {
        SubPixel::HorizontalRgb => Subpixel::HorizontalRgb,
        SubPixel::HorizontalBgr => Subpixel::HorizontalBgr,
        SubPixel::VerticalRgb => Subpixel::VerticalRgb,
        SubPixel::VerticalBgr => Subpixel::VerticalBgr,
        SubPixel::None => Subpixel::None,
        _ => Subpixel::Unknown,
    }
}

fn connector_type_name(kind: connector::Interface) -> &'static str {
    use connector::Interface;
    match kind {
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::DisplayPort => "DP",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::LVDS => "LVDS",
        Interface::VGA => "VGA",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::TV => "TV",
        _ => "Unknown",
    }
}

/// Extract make/model/serial from the connector's EDID property
fn parse_edid(
    dev: &DrmDeviceFd,
    map: &indexmap::IndexMap<String, resources::PropEntry>,
) -> Option<(String, String, Option<String>)> {
    let entry = map.get("EDID")?;
    let blob = match entry.info.value_type().convert_value(entry.raw) {
        drm::control::property::Value::Blob(blob) => blob,
        _ => return None,
    };
    if blob == 0 {
        return None;
    }
    let data = dev.get_property_blob(blob).ok()?;
    let mut reader = std::io::Cursor::new(data);
    let edid = edid_rs::parse(&mut reader).ok()?;

    let id = edid.product.manufacturer_id;
    let make = format!("{}{}{}", id.0, id.1, id.2);

    let mut model = edid.product.product_code.to_string();
    let mut serial = None;
    for desc in &edid.descriptors.0 {
        match desc {
            edid_rs::MonitorDescriptor::MonitorName(name) => model = name.clone(),
            edid_rs::MonitorDescriptor::SerialNumber(sn) => serial = Some(sn.clone()),
            _ => {}
        }
    }

    Some((make, model, serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mhz_to_nsec_sane_values() {
        assert_eq!(mhz_to_nsec(60_000), 16_666_666);
        assert_eq!(mhz_to_nsec(0), 0);
    }

    #[test]
    fn connector_slab_reuses_free_slots() {
        let mut slab = ConnectorSlab::default();
        assert!(slab.iter().next().is_none());
        assert_eq!(slab.find_by_handle(drm::control::from_u32(1).unwrap()), None);
    }

    #[test]
    fn env_flag_parses_truthy_values() {
        assert!(!env_flag("WLR_TEST_FLAG_THAT_DOES_NOT_EXIST"));
    }
}
