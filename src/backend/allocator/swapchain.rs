use std::ops::Deref;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use crate::backend::allocator::{Allocator, Buffer, Fourcc, Modifier};

/// Maximum number of buffers the swapchain will hand out
pub const SLOT_CAP: usize = 4;

/// Swapchain handling a fixed set of re-usable buffers e.g. for scan-out.
///
/// You can access the currently unused buffers through the acquire method.
/// Once a buffer was committed it has to be marked submitted, which rotates
/// the buffer ages used for damage computation. Buffers are returned to the
/// swapchain once their slot is dropped.
#[derive(Debug)]
pub struct Swapchain<A: Allocator> {
    /// Allocator used by the swapchain
    pub allocator: A,

    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,

    slots: [Slot<A::Buffer>; SLOT_CAP],
}

/// Slot of a swapchain containing an allocated buffer and its age
#[derive(Debug)]
pub struct Slot<B: Buffer> {
    buffer: Arc<Option<B>>,
    acquired: Arc<AtomicBool>,
    age: Arc<AtomicU8>,
}

impl<B: Buffer> Slot<B> {
    /// Retrieve the age of the buffer
    ///
    /// The age is the number of frames elapsed since the buffer contents were
    /// last drawn: 1 for the most recently submitted buffer, 0 for a buffer
    /// with no usable contents.
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::SeqCst)
    }
}

impl<B: Buffer> Default for Slot<B> {
    fn default() -> Self {
        Slot {
            buffer: Arc::new(None),
            acquired: Arc::new(AtomicBool::new(false)),
            age: Arc::new(AtomicU8::new(0)),
        }
    }
}

impl<B: Buffer> Clone for Slot<B> {
    fn clone(&self) -> Self {
        Slot {
            buffer: self.buffer.clone(),
            acquired: self.acquired.clone(),
            age: self.age.clone(),
        }
    }
}

impl<B: Buffer> Deref for Slot<B> {
    type Target = B;
    fn deref(&self) -> &B {
        Option::as_ref(&self.buffer).unwrap()
    }
}

impl<B: Buffer> Drop for Slot<B> {
    fn drop(&mut self) {
        self.acquired.store(false, Ordering::SeqCst);
    }
}

/// Error that can happen on acquiring a buffer
#[derive(Debug, thiserror::Error)]
pub enum SwapchainError<E: std::error::Error + 'static> {
    /// The allocator returned an error
    #[error("Failed to allocate a new buffer: {0}")]
    AllocationError(#[source] E),
}

impl<A> Swapchain<A>
where
    A: Allocator,
{
    /// Create a new swapchain with the desired allocator, dimensions and pixel format for the created buffers
    pub fn new(
        allocator: A,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: Vec<Modifier>,
    ) -> Swapchain<A> {
        Swapchain {
            allocator,
            width,
            height,
            fourcc,
            modifiers,
            slots: Default::default(),
        }
    }

    /// Acquire a new slot from the swapchain, if one is still free.
    ///
    /// The swapchain has an internal maximum of four re-usable buffers.
    /// This function returns the first free one.
    pub fn acquire(&mut self) -> Result<Option<Slot<A::Buffer>>, SwapchainError<A::Error>> {
        if let Some(free_slot) = self.slots.iter_mut().find(|s| !s.acquired.load(Ordering::SeqCst)) {
            if free_slot.buffer.is_none() {
                free_slot.buffer = Arc::new(Some(
                    self.allocator
                        .create_buffer(self.width, self.height, self.fourcc, &self.modifiers)
                        .map_err(SwapchainError::AllocationError)?,
                ));
                free_slot.age.store(0, Ordering::SeqCst);
            }

            if !free_slot.acquired.swap(true, Ordering::SeqCst) {
                return Ok(Some(free_slot.clone()));
            }
        }

        // no free slots
        Ok(None)
    }

    /// Mark a given buffer as submitted.
    ///
    /// This resets the age of the newly submitted buffer to 1 and increases
    /// the age of all other buffers with valid contents.
    pub fn submitted(&mut self, slot: &Slot<A::Buffer>) {
        // don't mess up the state, if the slot is not from this swapchain
        if !self.slots.iter().any(|other| Arc::ptr_eq(&slot.buffer, &other.buffer)) {
            return;
        }

        slot.age.store(1, Ordering::SeqCst);
        for other_slot in &mut self.slots {
            if !Arc::ptr_eq(&slot.buffer, &other_slot.buffer) && other_slot.buffer.is_some() {
                let _ = other_slot
                    .age
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |age| {
                        if age > 0 {
                            age.checked_add(1)
                        } else {
                            Some(0)
                        }
                    });
            }
        }
    }

    /// Change the dimensions of newly returned buffers.
    ///
    /// Already obtained buffers are unaffected and will be cleaned up on drop.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }

        self.width = width;
        self.height = height;
        self.slots = Default::default();
    }

    /// Current dimensions of the swapchain
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel format of allocated buffers
    pub fn format(&self) -> Fourcc {
        self.fourcc
    }

    /// Remove all internally cached buffers to e.g. reset age values
    pub fn reset_buffers(&mut self) {
        for slot in &mut self.slots {
            if slot.acquired.load(Ordering::SeqCst) {
                // will be dropped with the user reference
                *slot = Slot::default();
            } else {
                slot.buffer = Arc::new(None);
                slot.age.store(0, Ordering::SeqCst);
            }
        }
    }
}
