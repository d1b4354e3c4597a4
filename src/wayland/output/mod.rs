//! The `wl_output` global
//!
//! Advertises an [`Output`] to wayland clients: geometry, the current mode,
//! the scale factor (rounded up for fractional scales), name and description,
//! finished with `done`. State changes are forwarded automatically after each
//! successful output commit.
//!
//! Resource user data has to be thread-safe, while outputs live on the
//! event-loop thread; the glue therefore references outputs through ids in a
//! thread-local registry, resolved at dispatch time.

mod handlers;

use std::cell::RefCell;
use std::collections::HashMap;

use wayland_server::backend::GlobalId;
use wayland_server::protocol::wl_output::WlOutput;
use wayland_server::{Dispatch, DisplayHandle, GlobalDispatch, Resource};

use crate::output::{Output, StateField, WeakOutput};

pub use handlers::{OutputGlobalData, OutputUserData};

/// The version of `wl_output` the global is advertised with
const OUTPUT_VERSION: u32 = 4;

struct RegistryEntry {
    output: WeakOutput,
    instances: Vec<WlOutput>,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<u32, RegistryEntry>> = RefCell::new(HashMap::new());
    static NEXT_ID: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// Delegate type for the `wl_output` global
///
/// Compositors forward `Dispatch`/`GlobalDispatch` to this type through
/// [`delegate_wl_output`](crate::delegate_wl_output).
#[derive(Debug)]
pub struct WlOutputState {
    id: u32,
    global: GlobalId,
}

impl WlOutputState {
    /// Create a `wl_output` global for the given output
    ///
    /// The global tracks the output: mode, transform, scale and description
    /// changes are re-sent to bound clients after every commit.
    pub fn create_global<D>(display: &DisplayHandle, output: &Output) -> WlOutputState
    where
        D: GlobalDispatch<WlOutput, OutputGlobalData>,
        D: Dispatch<WlOutput, OutputUserData>,
        D: 'static,
    {
        let id = NEXT_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        REGISTRY.with(|registry| {
            registry.borrow_mut().insert(
                id,
                RegistryEntry {
                    output: output.downgrade(),
                    instances: Vec::new(),
                },
            );
        });

        let global =
            display.create_global::<D, WlOutput, _>(OUTPUT_VERSION, OutputGlobalData { id });

        // keep clients in sync with committed changes
        let update_mask = StateField::MODE
            | StateField::ENABLED
            | StateField::SCALE
            | StateField::TRANSFORM
            | StateField::SUBPIXEL;
        output.events().commit.subscribe(move |event| {
            if event.committed.intersects(update_mask) {
                send_current_state(id);
            }
        });
        let cleanup_id = id;
        output.events().destroy.subscribe(move |_| {
            REGISTRY.with(|registry| {
                registry.borrow_mut().remove(&cleanup_id);
            });
        });

        WlOutputState { id, global }
    }

    /// The id of the created global
    pub fn global(&self) -> GlobalId {
        self.global.clone()
    }

    /// The output advertised by this global, if still alive
    pub fn output(&self) -> Option<Output> {
        with_entry(self.id, |entry| entry.output.upgrade()).flatten()
    }
}

fn with_entry<R>(id: u32, f: impl FnOnce(&mut RegistryEntry) -> R) -> Option<R> {
    REGISTRY.with(|registry| registry.borrow_mut().get_mut(&id).map(f))
}

/// Advertised scale factor: fractional scales are rounded up
fn advertised_scale(output: &Output) -> i32 {
    output.scale().ceil() as i32
}

fn send_state_to(output: &Output, resource: &WlOutput) {
    use wayland_server::protocol::wl_output::{Mode as WMode, Subpixel as WSubpixel, Transform as WTransform};

    let physical = output.physical_properties();
    let subpixel = match output.subpixel() {
        crate::output::Subpixel::Unknown => WSubpixel::Unknown,
        crate::output::Subpixel::None => WSubpixel::None,
        crate::output::Subpixel::HorizontalRgb => WSubpixel::HorizontalRgb,
        crate::output::Subpixel::HorizontalBgr => WSubpixel::HorizontalBgr,
        crate::output::Subpixel::VerticalRgb => WSubpixel::VerticalRgb,
        crate::output::Subpixel::VerticalBgr => WSubpixel::VerticalBgr,
    };
    let transform = match output.transform() {
        crate::utils::Transform::Normal => WTransform::Normal,
        crate::utils::Transform::_90 => WTransform::_90,
        crate::utils::Transform::_180 => WTransform::_180,
        crate::utils::Transform::_270 => WTransform::_270,
        crate::utils::Transform::Flipped => WTransform::Flipped,
        crate::utils::Transform::Flipped90 => WTransform::Flipped90,
        crate::utils::Transform::Flipped180 => WTransform::Flipped180,
        crate::utils::Transform::Flipped270 => WTransform::Flipped270,
    };

    resource.geometry(
        0,
        0,
        physical.size.0,
        physical.size.1,
        subpixel,
        physical.make.clone(),
        physical.model.clone(),
        transform,
    );

    let current = output.current_mode();
    for mode in output.modes() {
        let mut flags = WMode::empty();
        if Some(mode) == current {
            flags |= WMode::Current;
        }
        if mode.preferred {
            flags |= WMode::Preferred;
        }
        resource.mode(flags, mode.size.w, mode.size.h, mode.refresh);
    }
    // a current custom mode is not part of the mode list
    if let Some(mode) = current {
        if !output.modes().contains(&mode) {
            resource.mode(WMode::Current, mode.size.w, mode.size.h, mode.refresh);
        }
    }

    if resource.version() >= 4 {
        resource.name(output.name());
        resource.description(output.description());
    }
    if resource.version() >= 2 {
        resource.scale(advertised_scale(output));
        resource.done();
    }
}

/// Re-send the current state to every bound instance
fn send_current_state(id: u32) {
    let (output, instances) = match with_entry(id, |entry| {
        (entry.output.upgrade(), entry.instances.clone())
    }) {
        Some((Some(output), instances)) => (output, instances),
        _ => return,
    };
    for instance in instances {
        send_state_to(&output, &instance);
    }
}

/// Delegate `wl_output` dispatching to this library
#[macro_export]
macro_rules! delegate_wl_output {
    ($(@<$( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+>)? $ty: ty) => {
        wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty:
            [
                wayland_server::protocol::wl_output::WlOutput: $crate::wayland::output::OutputUserData
            ] => $crate::wayland::output::WlOutputState
        );
        wayland_server::delegate_global_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty:
            [
                wayland_server::protocol::wl_output::WlOutput: $crate::wayland::output::OutputGlobalData
            ] => $crate::wayland::output::WlOutputState
        );
    };
}
