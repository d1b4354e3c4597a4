//! Xwayland window-manager glue
//!
//! The subset interfacing the scene graph: X11 windows are mirrored into the
//! scene by the compositor; this module arbitrates the X server's stacking
//! order to match the scene's Z-order and maintains the EWMH client lists.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    AtomEnum, ConfigureWindowAux, ConnectionExt as _, PropMode, StackMode, Window,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use tracing::{debug, trace, warn};

use crate::scene::{RestackArbiter, Scene, SceneBuffer, SceneNode};

x11rb::atom_manager! {
    /// Atoms used by the window manager
    pub Atoms:
    AtomsCookie {
        _NET_CLIENT_LIST,
        _NET_CLIENT_LIST_STACKING,
    }
}

#[derive(Debug)]
struct X11SurfaceInner {
    window: Window,
    override_redirect: bool,
    mapped: Cell<bool>,
}

/// An X11 window known to the window manager
#[derive(Debug, Clone)]
pub struct X11Surface {
    inner: Rc<X11SurfaceInner>,
}

impl PartialEq for X11Surface {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for X11Surface {}

impl X11Surface {
    /// The X11 window id
    pub fn window(&self) -> Window {
        self.inner.window
    }

    /// Whether the window bypasses the window manager
    pub fn is_override_redirect(&self) -> bool {
        self.inner.override_redirect
    }

    /// Whether the window is currently mapped
    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.get()
    }

    /// Attach this surface to the scene node presenting it
    ///
    /// Required for the stacking arbitration to recognize the node.
    pub fn attach_to_node(&self, node: &SceneBuffer) {
        node.set_user_data(Some(Rc::new(self.clone()) as Rc<dyn Any>));
    }
}

#[derive(Debug)]
struct X11WmInner {
    conn: Rc<RustConnection>,
    root: Window,
    atoms: Atoms,
    /// All managed windows in mapping order
    client_list: RefCell<Vec<Window>>,
    /// All managed windows in stacking order, bottom first
    client_list_stacking: RefCell<Vec<Window>>,
    /// The last managed window seen during the current front-to-back pass
    restack_above: RefCell<Option<Window>>,
}

impl X11WmInner {
    fn sync_client_list_properties(&self) {
        let list = self.client_list.borrow();
        let stacking = self.client_list_stacking.borrow();
        if let Err(err) = self.conn.change_property32(
            PropMode::REPLACE,
            self.root,
            self.atoms._NET_CLIENT_LIST,
            AtomEnum::WINDOW,
            &list,
        ) {
            warn!("Failed to update _NET_CLIENT_LIST: {}", err);
        }
        if let Err(err) = self.conn.change_property32(
            PropMode::REPLACE,
            self.root,
            self.atoms._NET_CLIENT_LIST_STACKING,
            AtomEnum::WINDOW,
            &stacking,
        ) {
            warn!("Failed to update _NET_CLIENT_LIST_STACKING: {}", err);
        }
    }

    fn restack(&self, window: Window, sibling: Option<Window>, mode: StackMode) {
        let mut aux = ConfigureWindowAux::new().stack_mode(mode);
        if let Some(sibling) = sibling {
            aux = aux.sibling(sibling);
        }
        if let Err(err) = self.conn.configure_window(window, &aux) {
            warn!(window, "Failed to restack window: {}", err);
            return;
        }

        // mirror the change into the stacking list
        let mut stacking = self.client_list_stacking.borrow_mut();
        let Some(pos) = stacking.iter().position(|w| *w == window) else {
            return;
        };
        let elem = stacking.remove(pos);
        match (mode, sibling) {
            (StackMode::BELOW, Some(sibling)) => {
                let at = stacking.iter().position(|w| *w == sibling).unwrap_or(0);
                stacking.insert(at, elem);
            }
            (StackMode::BELOW, None) => stacking.insert(0, elem),
            _ => stacking.push(elem),
        }
        drop(stacking);
        self.sync_client_list_properties();
    }
}

/// The X11 window manager subset consuming scene stacking order
#[derive(Debug, Clone)]
pub struct X11Wm {
    inner: Rc<X11WmInner>,
}

impl X11Wm {
    /// Create a window manager on an established connection
    pub fn new(conn: Rc<RustConnection>, root: Window) -> Result<X11Wm, x11rb::errors::ReplyError> {
        let atoms = Atoms::new(conn.as_ref())
            .map_err(x11rb::errors::ReplyError::from)?
            .reply()?;
        Ok(X11Wm {
            inner: Rc::new(X11WmInner {
                conn,
                root,
                atoms,
                client_list: RefCell::new(Vec::new()),
                client_list_stacking: RefCell::new(Vec::new()),
                restack_above: RefCell::new(None),
            }),
        })
    }

    /// Install this window manager as the stacking arbiter of a scene
    pub fn attach_to_scene(&self, scene: &Scene) {
        scene.set_restack_arbiter(Box::new(X11WmArbiter {
            wm: Rc::downgrade(&self.inner),
        }));
    }

    /// Register a window, adding it to the client lists
    pub fn manage_window(&self, window: Window, override_redirect: bool) -> X11Surface {
        debug!(window, override_redirect, "Managing X11 window");
        let surface = X11Surface {
            inner: Rc::new(X11SurfaceInner {
                window,
                override_redirect,
                mapped: Cell::new(true),
            }),
        };
        if !override_redirect {
            self.inner.client_list.borrow_mut().push(window);
            self.inner.client_list_stacking.borrow_mut().push(window);
            self.inner.sync_client_list_properties();
        }
        surface
    }

    /// Unregister a window
    ///
    /// Override-redirect windows are restacked to the bottom of their
    /// siblings at dissociation.
    pub fn unmanage_window(&self, surface: &X11Surface) {
        debug!(window = surface.window(), "Unmanaging X11 window");
        surface.inner.mapped.set(false);
        let window = surface.window();
        if surface.is_override_redirect() {
            self.inner.restack(window, None, StackMode::BELOW);
            return;
        }
        self.inner.client_list.borrow_mut().retain(|w| *w != window);
        self.inner
            .client_list_stacking
            .borrow_mut()
            .retain(|w| *w != window);
        self.inner.sync_client_list_properties();
    }

    /// The managed windows in stacking order, bottom first
    pub fn stacking_order(&self) -> Vec<Window> {
        self.inner.client_list_stacking.borrow().clone()
    }
}

/// Scene hook mirroring scene Z-order into the X server
#[derive(Debug)]
struct X11WmArbiter {
    wm: Weak<X11WmInner>,
}

/// The managed X11 surface presented by a node, if any
///
/// Override-redirect windows place themselves and are never arbitrated.
fn managed_surface(node: &SceneNode) -> Option<X11Surface> {
    let data = node.user_data()?;
    let surface = data.downcast_ref::<X11Surface>()?;
    if surface.is_override_redirect() {
        return None;
    }
    Some(surface.clone())
}

impl RestackArbiter for X11WmArbiter {
    fn begin(&self) {
        if let Some(wm) = self.wm.upgrade() {
            *wm.restack_above.borrow_mut() = None;
        }
    }

    fn arbitrate(&self, node: &SceneNode, fully_inside: bool) {
        let Some(wm) = self.wm.upgrade() else { return };
        let Some(surface) = managed_surface(node) else {
            return;
        };
        if !surface.is_mapped() {
            return;
        }

        // Only restack nodes entirely inside the update region; a partial
        // view of the scene cannot order the rest correctly.
        if fully_inside {
            let above = *wm.restack_above.borrow();
            match above {
                Some(above) => {
                    trace!(window = surface.window(), below = above, "Restacking below");
                    wm.restack(surface.window(), Some(above), StackMode::BELOW);
                }
                None => {
                    trace!(window = surface.window(), "Restacking to top");
                    wm.restack(surface.window(), None, StackMode::ABOVE);
                }
            }
        }

        *wm.restack_above.borrow_mut() = Some(surface.window());
    }

    fn node_hidden(&self, node: &SceneNode) {
        let Some(wm) = self.wm.upgrade() else { return };
        let Some(surface) = managed_surface(node) else {
            return;
        };
        wm.restack(surface.window(), None, StackMode::BELOW);
    }
}
