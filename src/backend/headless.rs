//! Headless backend
//!
//! Virtual outputs without any display hardware behind them. Commits always
//! succeed, frames are paced by the compositor. Useful for tests and remote
//! sessions.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::backend::allocator::format::FormatSet;
use crate::backend::allocator::{Fourcc, Modifier};
use crate::output::{
    AspectRatio, Mode, Output, OutputBackend, OutputError, OutputState, PhysicalProperties,
    StateField, Subpixel,
};
use crate::utils::{Physical, Signal, Size};

#[derive(Debug, Default)]
struct HeadlessInner {
    outputs: RefCell<Vec<Output>>,
    counter: std::cell::Cell<usize>,
}

/// A backend exposing virtual outputs
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    inner: Rc<HeadlessInner>,
    /// Emitted for every new virtual output
    pub new_output: Rc<Signal<Output>>,
}

impl HeadlessBackend {
    /// Create a new headless backend without outputs
    pub fn new() -> HeadlessBackend {
        Default::default()
    }

    /// Add a virtual output with the given resolution
    pub fn add_output(&self, size: Size<i32, Physical>) -> Output {
        let index = self.inner.counter.get();
        self.inner.counter.set(index + 1);

        let name = format!("HEADLESS-{}", index + 1);
        info!(name, "New headless output");
        let output = Output::new(
            name,
            PhysicalProperties {
                size: (0, 0),
                subpixel: Subpixel::Unknown,
                make: "Headless".into(),
                model: "Virtual".into(),
                serial: None,
            },
            Box::new(HeadlessOutputBackend),
        );
        output.set_modes(vec![Mode {
            size,
            refresh: 60_000,
            preferred: true,
            picture_aspect_ratio: AspectRatio::None,
        }]);

        self.inner.outputs.borrow_mut().push(output.clone());
        self.new_output.emit(&output);
        output
    }

    /// The virtual outputs of this backend
    pub fn outputs(&self) -> Vec<Output> {
        self.inner.outputs.borrow().clone()
    }
}

#[derive(Debug)]
struct HeadlessOutputBackend;

impl OutputBackend for HeadlessOutputBackend {
    fn test(&mut self, _output: &Output, state: &OutputState) -> Result<(), OutputError> {
        // there is no hardware to reject anything; tearing makes no sense
        if state.committed().contains(StateField::TEARING) {
            return Err(OutputError::InvalidState("tearing on a headless output"));
        }
        Ok(())
    }

    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        self.test(output, state)
    }

    fn primary_formats(&self) -> FormatSet {
        let mut formats = FormatSet::new();
        formats.add(Fourcc::Xrgb8888, Modifier::Linear);
        formats.add(Fourcc::Argb8888, Modifier::Linear);
        formats
    }
}
