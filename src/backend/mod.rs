//! Backends driving the system side of the pipeline
//!
//! The [`autocreate`] routine picks a backend from the environment:
//! an explicit `WLR_BACKENDS` list overrides everything; otherwise a running
//! Wayland or X display selects a nested backend; otherwise a session is
//! opened and one DRM backend per GPU is created, composed into a multi
//! backend when several GPUs are found.

pub mod allocator;
pub mod drm;
pub mod headless;
pub mod renderer;
pub mod session;

use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::output::Output;
use crate::utils::env::{env_flag, env_list};
use crate::utils::Signal;

use self::drm::{DeviceFd, DrmBackend, DrmDeviceFd};
use self::headless::HeadlessBackend;
use self::session::libseat::{LibSeatSession, LibSeatSessionNotifier};
use self::session::Session;

/// Errors during backend creation
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The requested backend is not available in this build
    #[error("the '{0}' backend is not available")]
    Unavailable(&'static str),
    /// An unknown backend name was requested
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    /// Opening the session failed
    #[error("failed to open a session")]
    Session(#[from] session::libseat::Error),
    /// No usable GPU was found
    #[error("no usable GPU found")]
    NoGpu,
    /// The DRM backend failed to initialize
    #[error(transparent)]
    Drm(#[from] drm::Error),
    /// Discovering devices through udev failed
    #[error("udev enumeration failed")]
    Udev(#[source] std::io::Error),
}

/// One backend instance
#[derive(Debug)]
pub enum Backend {
    /// A DRM/KMS backend driving one GPU
    Drm(DrmBackend),
    /// A headless backend with virtual outputs
    Headless(HeadlessBackend),
    /// A composite of several child backends
    Multi(MultiBackend),
}

impl Backend {
    /// All outputs currently exposed by this backend
    pub fn outputs(&self) -> Vec<Output> {
        match self {
            Backend::Drm(drm) => drm.outputs(),
            Backend::Headless(headless) => headless.outputs(),
            Backend::Multi(multi) => multi.outputs(),
        }
    }

    /// The DRM backends contained in this backend
    pub fn drm_backends(&self) -> Vec<&DrmBackend> {
        match self {
            Backend::Drm(drm) => vec![drm],
            Backend::Headless(_) => Vec::new(),
            Backend::Multi(multi) => multi
                .children
                .iter()
                .flat_map(|child| child.drm_backends())
                .collect(),
        }
    }

    /// Forward a session event to all children
    pub fn handle_session_event(&self, event: session::Event) {
        for drm in self.drm_backends() {
            drm.handle_session_event(event);
        }
    }
}

/// A backend composed of children
///
/// Destroying the primary child destroys the composite.
#[derive(Debug)]
pub struct MultiBackend {
    children: Vec<Backend>,
    /// Index of the primary child; its destruction tears down the composite
    primary: Option<usize>,
    /// Emitted when the composite is destroyed
    pub destroy: std::rc::Rc<Signal<()>>,
}

impl MultiBackend {
    /// Create an empty composite
    pub fn new() -> MultiBackend {
        MultiBackend {
            children: Vec::new(),
            primary: None,
            destroy: std::rc::Rc::new(Signal::new()),
        }
    }

    /// Add a child backend
    ///
    /// The first DRM child becomes the primary: when its device disappears,
    /// the whole composite emits `destroy`.
    pub fn add(&mut self, child: Backend) {
        if self.primary.is_none() {
            if let Backend::Drm(drm) = &child {
                self.primary = Some(self.children.len());
                let destroy = self.destroy.clone();
                drm.events().destroy.subscribe(move |_| {
                    destroy.emit(&());
                });
            }
        }
        self.children.push(child);
    }

    /// The child backends
    pub fn children(&self) -> &[Backend] {
        &self.children
    }

    fn outputs(&self) -> Vec<Output> {
        self.children
            .iter()
            .flat_map(|child| child.outputs())
            .collect()
    }
}

impl Default for MultiBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`autocreate`]: the backend plus the session driving it, if any
#[derive(Debug)]
pub struct AutocreateResult {
    /// The created backend
    pub backend: Backend,
    /// The session, present for the DRM path
    pub session: Option<LibSeatSession>,
    /// The session notifier to insert into the event loop
    pub notifier: Option<LibSeatSessionNotifier>,
}

/// Create a backend based on the environment
///
/// `WLR_BACKENDS` (comma-separated) overrides the automatic choice; valid
/// names are `drm`, `headless`, `wayland` and `x11`. Without it, a running
/// Wayland or X display selects the nested backend of that display, and
/// otherwise a session is opened and every usable GPU gets a DRM backend.
pub fn autocreate() -> Result<AutocreateResult, BackendError> {
    if let Some(names) = env_list("WLR_BACKENDS") {
        info!(?names, "Creating backends from WLR_BACKENDS");
        let mut multi = MultiBackend::new();
        let mut session = None;
        let mut notifier = None;
        for name in &names {
            let child = create_named_backend(name, &mut session, &mut notifier)?;
            multi.add(child);
        }
        if multi.children.len() == 1 {
            return Ok(AutocreateResult {
                backend: multi.children.pop().expect("one child"),
                session,
                notifier,
            });
        }
        return Ok(AutocreateResult {
            backend: Backend::Multi(multi),
            session,
            notifier,
        });
    }

    if std::env::var("WAYLAND_DISPLAY").is_ok() || std::env::var("WAYLAND_SOCKET").is_ok() {
        return Err(BackendError::Unavailable("wayland"));
    }
    if std::env::var("DISPLAY").is_ok() {
        return Err(BackendError::Unavailable("x11"));
    }

    let mut session = None;
    let mut notifier = None;
    let backend = create_drm_backends(&mut session, &mut notifier)?;
    Ok(AutocreateResult {
        backend,
        session,
        notifier,
    })
}

fn create_named_backend(
    name: &str,
    session: &mut Option<LibSeatSession>,
    notifier: &mut Option<LibSeatSessionNotifier>,
) -> Result<Backend, BackendError> {
    match name {
        "drm" => create_drm_backends(session, notifier),
        "headless" => {
            let headless = HeadlessBackend::new();
            let count = std::env::var("WLR_HEADLESS_OUTPUTS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(1);
            for _ in 0..count {
                headless.add_output((1280, 720).into());
            }
            Ok(Backend::Headless(headless))
        }
        "wayland" => Err(BackendError::Unavailable("wayland")),
        "x11" => Err(BackendError::Unavailable("x11")),
        other => Err(BackendError::UnknownBackend(other.to_owned())),
    }
}

fn create_drm_backends(
    session_out: &mut Option<LibSeatSession>,
    notifier_out: &mut Option<LibSeatSessionNotifier>,
) -> Result<Backend, BackendError> {
    // exactly one session exists for the DRM path
    let (mut session, notifier) = match session_out.take() {
        Some(session) => (session, None),
        None => {
            let (session, notifier) = LibSeatSession::new()?;
            (session, Some(notifier))
        }
    };

    let devices = match std::env::var("WLR_DRM_DEVICES") {
        Ok(list) => list.split(':').map(PathBuf::from).collect(),
        Err(_) => discover_gpus()?,
    };
    if devices.is_empty() {
        return Err(BackendError::NoGpu);
    }

    let mut backends = Vec::new();
    for path in &devices {
        debug!(?path, "Opening DRM device");
        let fd: OwnedFd = match session.open(path, rustix::fs::OFlags::RDWR | rustix::fs::OFlags::CLOEXEC) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(?path, "Failed to open DRM device: {:?}", err);
                continue;
            }
        };
        let device = DrmDeviceFd::new(DeviceFd::from(fd));
        match DrmBackend::new(device, None) {
            Ok(backend) => backends.push(backend),
            Err(err) => warn!(?path, "Failed to create DRM backend: {}", err),
        }
    }

    if backends.is_empty() {
        return Err(BackendError::NoGpu);
    }

    *session_out = Some(session);
    if notifier.is_some() {
        *notifier_out = notifier;
    }

    if backends.len() == 1 {
        return Ok(Backend::Drm(backends.pop().expect("one backend")));
    }

    let mut multi = MultiBackend::new();
    for backend in backends {
        multi.add(Backend::Drm(backend));
    }
    Ok(Backend::Multi(multi))
}

/// Find GPU device nodes through udev
fn discover_gpus() -> Result<Vec<PathBuf>, BackendError> {
    let mut enumerator = udev::Enumerator::new().map_err(BackendError::Udev)?;
    enumerator
        .match_subsystem("drm")
        .map_err(BackendError::Udev)?;
    enumerator
        .match_sysname("card[0-9]*")
        .map_err(BackendError::Udev)?;

    let mut paths = Vec::new();
    for device in enumerator.scan_devices().map_err(BackendError::Udev)? {
        let Some(devnode) = device.devnode() else {
            continue;
        };
        // boot_vga marks the primary GPU, scan it first
        let is_primary = device
            .parent()
            .and_then(|parent| {
                parent
                    .attribute_value("boot_vga")
                    .map(|v| v.to_string_lossy() == "1")
            })
            .unwrap_or(false);
        if is_primary {
            paths.insert(0, devnode.to_owned());
        } else {
            paths.push(devnode.to_owned());
        }
    }

    // render nodes and ignored flags aside, every card is a candidate
    if env_flag("WLR_RENDERER_FORCE_SOFTWARE") {
        debug!("Software rendering forced, GPU selection unaffected");
    }

    Ok(paths)
}
