//! Multi-GPU buffer blitting
//!
//! When a backend drives displays on a GPU other than the one clients render
//! on, client buffers cannot be scanned out directly. The blitter copies
//! them into locally allocated buffers through the renderer, trading a copy
//! for cross-device presentation. Presentation feedback on such backends
//! never carries the zero-copy flag.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::backend::allocator::dmabuf::{Dmabuf, WeakDmabuf};
use crate::backend::allocator::{Allocator, Buffer as _, DynAllocator, Modifier};
use crate::backend::renderer::{BlendMode, RenderPassOptions, TextureFilter, TextureOptions};
use crate::output::SharedRenderer;
use crate::utils::{Rectangle, Region, Size, Transform};

use super::error::FramebufferError;

/// Blits client buffers into locally allocated copies for cross-GPU scan-out
#[derive(Debug)]
pub struct MultiGpuBlitter {
    allocator: RefCell<DynAllocator>,
    renderer: SharedRenderer,
    /// per-source-buffer blit target, keyed by the source
    targets: RefCell<HashMap<WeakDmabuf, Dmabuf>>,
}

impl MultiGpuBlitter {
    /// Create a blitter rendering through `renderer` into buffers from `allocator`
    pub fn new(allocator: DynAllocator, renderer: SharedRenderer) -> Self {
        MultiGpuBlitter {
            allocator: RefCell::new(allocator),
            renderer,
            targets: RefCell::new(HashMap::new()),
        }
    }

    /// Copy `buffer` into a local buffer suitable for scan-out on this device
    pub fn prepare(&self, buffer: &Dmabuf) -> Result<Dmabuf, FramebufferError> {
        self.targets.borrow_mut().retain(|weak, _| !weak.is_gone());

        if let Some(target) = self.targets.borrow().get(&buffer.weak()) {
            trace!("Reusing blit target");
            return Ok(target.clone());
        }

        let target = self
            .allocator
            .borrow_mut()
            .create_buffer(
                buffer.width(),
                buffer.height(),
                buffer.format().code,
                &[Modifier::Linear, Modifier::Invalid],
            )
            .map_err(FramebufferError::PrimeImport)?;

        let mut renderer = self.renderer.borrow_mut();
        let texture = renderer
            .texture_from_buffer(buffer)
            .map_err(|err| FramebufferError::PrimeImport(std::io::Error::other(err)))?;

        let full: Rectangle<i32, crate::utils::Physical> =
            Rectangle::from_size(Size::new(buffer.width() as i32, buffer.height() as i32));
        let clip = Region::from_rect(full);

        let mut pass = renderer
            .begin_pass(&target, RenderPassOptions::default())
            .map_err(|err| FramebufferError::PrimeImport(std::io::Error::other(err)))?;
        pass.add_texture(
            texture.as_ref(),
            TextureOptions {
                src: Rectangle::from_size(Size::new(buffer.width() as f64, buffer.height() as f64)),
                dst: full,
                clip: &clip,
                transform: Transform::Normal,
                filter: TextureFilter::Nearest,
                alpha: 1.0,
                blend: BlendMode::None,
                transfer_function: Default::default(),
                primaries: Default::default(),
                wait: None,
            },
        );
        let sync = pass
            .submit()
            .map_err(|err| FramebufferError::PrimeImport(std::io::Error::other(err)))?;
        // the target is handed to KMS right away, wait for the copy
        if let Err(err) = sync.wait(Some(std::time::Duration::from_secs(1))) {
            debug!("Failed to wait for blit completion: {}", err);
        }

        self.targets
            .borrow_mut()
            .insert(buffer.weak(), target.clone());
        Ok(target)
    }
}
