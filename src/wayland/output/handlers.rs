use wayland_server::protocol::wl_output::{self, WlOutput};
use wayland_server::{
    backend::ClientId, Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource,
};

use tracing::trace;

use super::{send_state_to, with_entry, WlOutputState};

/// Global data of a `wl_output` global
#[derive(Debug, Clone)]
pub struct OutputGlobalData {
    pub(super) id: u32,
}

/// Per-resource data of a bound `wl_output`
#[derive(Debug, Clone)]
pub struct OutputUserData {
    pub(super) id: u32,
}

impl<D> GlobalDispatch<WlOutput, OutputGlobalData, D> for WlOutputState
where
    D: GlobalDispatch<WlOutput, OutputGlobalData>,
    D: Dispatch<WlOutput, OutputUserData>,
    D: 'static,
{
    fn bind(
        _state: &mut D,
        _dh: &DisplayHandle,
        _client: &Client,
        resource: New<WlOutput>,
        global_data: &OutputGlobalData,
        data_init: &mut DataInit<'_, D>,
    ) {
        let resource = data_init.init(resource, OutputUserData { id: global_data.id });

        let output = with_entry(global_data.id, |entry| {
            entry.instances.push(resource.clone());
            entry.output.upgrade()
        })
        .flatten();

        if let Some(output) = output {
            trace!(output = %output.name(), "New wl_output bound");
            send_state_to(&output, &resource);
        }
    }
}

impl<D> Dispatch<WlOutput, OutputUserData, D> for WlOutputState
where
    D: Dispatch<WlOutput, OutputUserData>,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &WlOutput,
        request: wl_output::Request,
        _data: &OutputUserData,
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            wl_output::Request::Release => {}
            _ => {}
        }
    }

    fn destroyed(_state: &mut D, _client: ClientId, resource: &WlOutput, data: &OutputUserData) {
        with_entry(data.id, |entry| {
            entry.instances.retain(|o| o.id() != resource.id());
        });
    }
}
