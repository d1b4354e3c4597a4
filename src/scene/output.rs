//! Per-output scene state: render list, direct scan-out, render passes
//!
//! A [`SceneOutput`] exclusively binds a scene to an output. Per frame,
//! [`build_state`](SceneOutput::build_state) constructs either a scan-out
//! state (the single visible buffer goes straight to a plane) or a render
//! pass producing a back buffer from the renderer; the caller then commits
//! the resulting state to the output.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use smallvec::SmallVec;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::backend::allocator::Buffer as _;
use crate::backend::renderer::color::{output_transform, ColorTransform, Primaries, TransferFunction};
use crate::backend::renderer::sync::{dmabuf_export_sync_file, SyncPoint, SyncTimeline, TimelinePoint};
use crate::backend::renderer::{
    BlendMode, Color, RectOptions, RenderPassOptions, RenderTimer, Texture, TextureOptions,
};
use crate::output::{Output, OutputError, OutputState, StateField};
use crate::utils::{
    Buffer as BufferCoords, Clock, Logical, Monotonic, Point, Rectangle, Region, Size, Time,
};

use super::{
    buffer_node_size, damage_outputs, node_opaque_region, nodes_in_box, BufferState, DebugDamage,
    NodeInner, NodeKind, Scene, SceneBuffer, SceneInner, SceneNode,
};

/// Frames to wait before flipping the dmabuf-feedback recommendation
/// between scanout-preferred and composition-preferred
const DMABUF_FEEDBACK_DEBOUNCE_FRAMES: u32 = 30;

/// How long highlight-damage stays on screen
const HIGHLIGHT_DAMAGE_DURATION: Duration = Duration::from_millis(250);

/// Number of previous frame damages the ring keeps
const DAMAGE_RING_LEN: usize = 4;

/// Result of a direct scan-out attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutResult {
    /// The node is not a candidate for scan-out
    Ineligible,
    /// The node is a candidate, but currently incompatible (e.g. the test
    /// failed); resolving the incompatibility is worthwhile
    Candidate,
    /// Scan-out succeeded
    Success,
}

/// Data of an `output_sample` event
#[derive(Debug, Clone)]
pub struct OutputSampleEvent {
    /// The sampling output
    pub output: SceneOutput,
    /// Whether the buffer was sampled for direct scan-out
    pub direct_scanout: bool,
}

/// Options for [`SceneOutput::build_state`]
#[derive(Debug, Default)]
pub struct SceneOutputBuildOptions {
    /// Measure the duration of the render pass
    pub timer: Option<RenderTimer>,
}

/// Ring of previous frames' damage in output-local logical coordinates
#[derive(Debug, Default)]
struct DamageRing {
    /// Damage accumulated since the last rendered frame
    current: Region<i32, Logical>,
    /// Damage of up to [`DAMAGE_RING_LEN`] previous frames, most recent first
    previous: VecDeque<Region<i32, Logical>>,
}

impl DamageRing {
    fn add(&mut self, region: &Region<i32, Logical>) {
        self.current.add_region(region);
    }

    /// Damage needed to bring a buffer of the given age up to date
    fn buffer_damage(&self, age: u8, full: Rectangle<i32, Logical>) -> Region<i32, Logical> {
        if age == 0 || age as usize > self.previous.len() + 1 {
            return Region::from_rect(full);
        }
        let mut damage = self.current.clone();
        for prev in self.previous.iter().take(age as usize - 1) {
            damage.add_region(prev);
        }
        damage.intersect_rect(full);
        damage
    }

    /// Finish a frame: the current damage becomes the most recent previous
    fn rotate(&mut self) {
        let current = std::mem::take(&mut self.current);
        self.previous.push_front(current);
        self.previous.truncate(DAMAGE_RING_LEN);
    }
}

#[derive(Debug)]
struct HighlightRegion {
    region: Region<i32, Logical>,
    when: Time<Monotonic>,
}

struct RenderListEntry {
    node: Rc<NodeInner>,
    pos: Point<i32, Logical>,
}

pub(crate) struct SceneOutputInner {
    pub scene: Weak<SceneInner>,
    pub output: Output,
    /// Bit position in the nodes' 64-bit active-output masks
    pub index: usize,
    position: Cell<Point<i32, Logical>>,
    damage_ring: RefCell<DamageRing>,
    /// Damage not yet acknowledged by a commit, in buffer coordinates
    pub pending_commit_damage: RefCell<Region<i32, BufferCoords>>,
    /// Render list storage recycled between frames
    render_list: RefCell<SmallVec<[RenderListEntry; 16]>>,
    in_timeline: RefCell<Option<SyncTimeline>>,
    in_point: Cell<u64>,
    /// Staged gamma ramp; `Some(None)` resets to identity
    gamma: RefCell<Option<Option<(usize, Vec<u16>)>>>,
    prev_scanout: Cell<bool>,
    /// Frames since the last scanout/composition transition
    pub dmabuf_feedback_debounce: Cell<u32>,
    highlights: RefCell<Vec<HighlightRegion>>,
    clock: Clock<Monotonic>,
}

impl std::fmt::Debug for SceneOutputInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneOutput")
            .field("output", &self.output.name())
            .field("index", &self.index)
            .field("position", &self.position.get())
            .finish_non_exhaustive()
    }
}

impl SceneOutputInner {
    /// The output's box in layout coordinates, `None` while disabled
    pub fn logical_box(&self) -> Option<Rectangle<i32, Logical>> {
        let size = self.output.effective_resolution()?;
        Some(Rectangle::new(self.position.get(), size))
    }

    /// Add layout-coordinate damage intersecting this output
    pub fn damage_logical(&self, damage: &Region<i32, Logical>) {
        let Some(bounds) = self.logical_box() else { return };
        let mut local = damage.intersection_rect(bounds);
        if local.is_empty() {
            return;
        }
        local.translate(Point::new(-self.position.get().x, -self.position.get().y));
        self.damage_ring.borrow_mut().add(&local);
        self.pending_commit_damage
            .borrow_mut()
            .add_region(&self.logical_to_buffer(&local));
        self.output.schedule_frame();
    }

    fn damage_whole(&self) {
        let Some(size) = self.output.effective_resolution() else {
            return;
        };
        let mut region = Region::empty();
        region.add_rect(Rectangle::from_size(size));
        self.damage_ring.borrow_mut().add(&region);
        self.pending_commit_damage
            .borrow_mut()
            .add_region(&self.logical_to_buffer(&region));
        self.output.schedule_frame();
    }

    /// Convert output-local logical coordinates into buffer coordinates
    fn logical_to_buffer(&self, region: &Region<i32, Logical>) -> Region<i32, BufferCoords> {
        let Some(mode) = self.output.current_mode() else {
            return Region::empty();
        };
        let scale = self.output.scale();
        let transform = self.output.transform();
        // the logical space is the rotated buffer space divided by scale
        let logical_px = transform.transform_size(mode.size);
        let area: Size<f64, Logical> = Size::new(logical_px.w as f64, logical_px.h as f64);

        region.map(|rect| {
            let scaled: Rectangle<f64, Logical> = Rectangle::new(
                Point::new(rect.loc.x as f64 * scale, rect.loc.y as f64 * scale),
                Size::new(rect.size.w as f64 * scale, rect.size.h as f64 * scale),
            );
            let rotated = transform.invert().transform_rect_in(scaled, &area);
            let out: Rectangle<i32, BufferCoords> = Rectangle::new(
                Point::new(rotated.loc.x.floor() as i32, rotated.loc.y.floor() as i32),
                Size::new(rotated.size.w.ceil() as i32, rotated.size.h.ceil() as i32),
            );
            out
        })
    }
}

/// Binding of a scene to one output
///
/// The binding is exclusive: destroying either side destroys it.
#[derive(Debug, Clone)]
pub struct SceneOutput {
    pub(crate) inner: Rc<SceneOutputInner>,
}

impl PartialEq for SceneOutput {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for SceneOutput {}

impl SceneOutput {
    /// Attach an output to a scene
    ///
    /// At most 64 outputs can be attached to one scene; the per-node output
    /// masks are 64 bits wide by design.
    pub fn create(scene: &Scene, output: &Output) -> Option<SceneOutput> {
        let index = {
            let outputs = scene.inner.outputs.borrow();
            let used: u64 = outputs.iter().fold(0, |acc, o| acc | (1 << o.index));
            (0..64).find(|bit| used & (1u64 << bit) == 0)?
        };

        // explicit sync: a fresh timeline signalled by every render pass
        let in_timeline = (!crate::utils::env::env_flag("WLR_RENDER_NO_EXPLICIT_SYNC"))
            .then(|| output.renderer())
            .flatten()
            .and_then(|renderer| {
                let renderer = renderer.borrow();
                if !renderer.supports_timelines() {
                    return None;
                }
                renderer.drm_device()
            })
            .and_then(|device| SyncTimeline::new(&device).ok());

        let inner = Rc::new(SceneOutputInner {
            scene: Rc::downgrade(&scene.inner),
            output: output.clone(),
            index,
            position: Cell::new(Point::default()),
            damage_ring: RefCell::new(DamageRing::default()),
            pending_commit_damage: RefCell::new(Region::empty()),
            render_list: RefCell::new(SmallVec::new()),
            in_timeline: RefCell::new(in_timeline),
            in_point: Cell::new(0),
            gamma: RefCell::new(None),
            prev_scanout: Cell::new(false),
            dmabuf_feedback_debounce: Cell::new(0),
            highlights: RefCell::new(Vec::new()),
            clock: Clock::new(),
        });

        scene.inner.outputs.borrow_mut().push(inner.clone());

        let scene_output = SceneOutput { inner: inner.clone() };

        // acknowledge damage once a commit carries it out
        let ack = Rc::downgrade(&inner);
        output.events().commit.subscribe(move |event| {
            let Some(inner) = ack.upgrade() else { return };
            if event.committed.contains(StateField::BUFFER) {
                inner
                    .pending_commit_damage
                    .borrow_mut()
                    .subtract_region(&event.damage);
            }
            if event
                .committed
                .intersects(StateField::TRANSFORM | StateField::SCALE | StateField::MODE | StateField::ENABLED)
            {
                inner.damage_whole();
            }
        });

        // drop the binding when the output goes away
        let scene_weak = Rc::downgrade(&scene.inner);
        let self_weak = Rc::downgrade(&inner);
        output.events().destroy.subscribe(move |_| {
            let (Some(scene), Some(inner)) = (scene_weak.upgrade(), self_weak.upgrade()) else {
                return;
            };
            scene.outputs.borrow_mut().retain(|o| !Rc::ptr_eq(o, &inner));
        });

        scene_output.update_geometry();
        Some(scene_output)
    }

    /// The bound output
    pub fn output(&self) -> &Output {
        &self.inner.output
    }

    /// Destroy this binding, leaving scene and output alive
    pub fn destroy(&self) {
        if let Some(scene) = self.inner.scene.upgrade() {
            scene
                .outputs
                .borrow_mut()
                .retain(|o| !Rc::ptr_eq(o, &self.inner));
            // nodes may now have stale membership for this output's bit
            let region = self
                .inner
                .logical_box()
                .map(Region::from_rect)
                .unwrap_or_default();
            damage_outputs(&scene, &region);
        }
    }

    /// Position of the output in the scene layout
    pub fn set_position(&self, pos: Point<i32, Logical>) {
        if self.inner.position.get() == pos {
            return;
        }
        self.inner.position.set(pos);
        self.update_geometry();
    }

    /// The position of the output in the scene layout
    pub fn position(&self) -> Point<i32, Logical> {
        self.inner.position.get()
    }

    fn update_geometry(&self) {
        self.inner.damage_whole();
        if let Some(scene) = self.inner.scene.upgrade() {
            if let Some(bounds) = self.inner.logical_box() {
                super::update_region(&scene, &Region::from_rect(bounds));
            }
        }
    }

    /// Stage a gamma ramp to be applied with the next frame
    ///
    /// `None` resets to identity. The ramp is dropped again if the backend
    /// rejects it.
    pub fn set_gamma(&self, gamma: Option<(usize, Vec<u16>)>) {
        *self.inner.gamma.borrow_mut() = Some(gamma);
        self.inner.output.schedule_frame();
    }

    /// Whether a new frame needs to be committed
    pub fn needs_frame(&self) -> bool {
        self.inner.output.needs_frame()
            || !self.inner.pending_commit_damage.borrow().is_empty()
            || self.inner.gamma.borrow().is_some()
    }

    /// Call `callback` for every buffer node visible on this output
    pub fn for_each_buffer(&self, callback: &mut dyn FnMut(&SceneBuffer, Point<i32, Logical>)) {
        let Some(scene) = self.inner.scene.upgrade() else { return };
        let Some(bounds) = self.inner.logical_box() else { return };
        let Some(root) = scene.root.borrow().clone() else { return };

        nodes_in_box(&root, Point::default(), bounds, &mut |node, pos| {
            if matches!(node.kind, NodeKind::Buffer(_)) {
                callback(&SceneBuffer(SceneNode { inner: node.clone() }), pos);
            }
            false
        });
    }

    /// Send `frame_done` to every buffer whose primary output this is
    pub fn send_frame_done(&self, time: Time<Monotonic>) {
        self.for_each_buffer(&mut |buffer, _| {
            let primary = buffer
                .state()
                .primary_output
                .borrow()
                .as_ref()
                .and_then(|weak| weak.upgrade());
            if let Some(primary) = primary {
                if Rc::ptr_eq(&primary, &self.inner) {
                    buffer.send_frame_done(time);
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn render_list_nodes(&self) -> Vec<SceneNode> {
        self.inner
            .render_list
            .borrow()
            .iter()
            .map(|entry| SceneNode {
                inner: entry.node.clone(),
            })
            .collect()
    }

    /// Construct the render list: all visible, non-transparent nodes
    /// intersecting the output in front-to-back order
    fn build_render_list(&self, scene: &Rc<SceneInner>) -> bool {
        let Some(bounds) = self.inner.logical_box() else {
            return false;
        };
        let Some(root) = scene.root.borrow().clone() else {
            return false;
        };

        let fractional_scale = self.inner.output.scale().fract() != 0.0;
        let calculate_visibility = scene.options.calculate_visibility;

        let mut list = self.inner.render_list.borrow_mut();
        list.clear();

        nodes_in_box(&root, Point::default(), bounds, &mut |node, pos| {
            // invisible nodes contribute nothing
            match &node.kind {
                NodeKind::Tree(_) => return false,
                NodeKind::Rect(rect) => {
                    if rect.color.get().is_transparent() {
                        return false;
                    }
                    // While rendering, the background is always black: below a
                    // fully opaque black rect nothing needs to be composited,
                    // and the rect itself is produced by the clear.
                    if calculate_visibility
                        && (!fractional_scale || list.is_empty())
                        && rect.color.get() == Color::BLACK
                    {
                        return false;
                    }
                }
                NodeKind::Buffer(buffer) => {
                    if buffer.buffer.borrow().is_none() && buffer.texture.borrow().is_none() {
                        return false;
                    }
                    // same special-case for black opaque single-pixel buffers
                    if calculate_visibility && (!fractional_scale || list.is_empty()) {
                        if let Some([0, 0, 0, a]) = buffer.single_pixel_color.get() {
                            if a == u32::MAX && buffer.opacity.get() >= 1.0 {
                                return false;
                            }
                        }
                    }
                }
            }

            if !node.visible.borrow().overlaps(bounds) {
                return false;
            }

            list.push(RenderListEntry {
                node: node.clone(),
                pos,
            });
            false
        });

        true
    }

    /// Attempt to scan the single candidate buffer out directly
    fn try_direct_scanout(
        &self,
        scene: &Rc<SceneInner>,
        entry_node: &Rc<NodeInner>,
        entry_pos: Point<i32, Logical>,
        state: &mut OutputState,
    ) -> ScanoutResult {
        if !scene.options.direct_scanout {
            return ScanoutResult::Ineligible;
        }
        if scene.options.debug_damage == DebugDamage::Highlight {
            return ScanoutResult::Ineligible;
        }
        let NodeKind::Buffer(buffer) = &entry_node.kind else {
            return ScanoutResult::Ineligible;
        };
        // legacy KMS will explode when modesetting with a scanout buffer
        if state
            .committed()
            .intersects(StateField::MODE | StateField::ENABLED | StateField::RENDER_FORMAT)
        {
            return ScanoutResult::Ineligible;
        }
        if state.committed().contains(StateField::COLOR_TRANSFORM) || self.inner.gamma.borrow().is_some()
        {
            return ScanoutResult::Ineligible;
        }
        if !self.inner.output.is_direct_scanout_allowed() {
            return ScanoutResult::Ineligible;
        }
        let Some(dmabuf) = buffer.buffer.borrow().clone() else {
            return ScanoutResult::Ineligible;
        };
        if buffer.transform.get() != self.inner.output.transform() {
            return ScanoutResult::Ineligible;
        }
        if !color_management_scanout_allowed(
            self.inner.output.pending_image_description(state).as_ref(),
            buffer,
        ) {
            return ScanoutResult::Ineligible;
        }
        if buffer.color_encoding.get().is_some() || buffer.color_range.get().is_some() {
            return ScanoutResult::Ineligible;
        }

        // direct scan-out flips per frame; hold back format recommendations
        // until the mode was stable for a while
        if self.inner.dmabuf_feedback_debounce.get() >= DMABUF_FEEDBACK_DEBOUNCE_FRAMES {
            let primary = buffer.primary_output.borrow().as_ref().and_then(|w| w.upgrade());
            if primary.map(|p| Rc::ptr_eq(&p, &self.inner)).unwrap_or(false)
                && buffer.prev_feedback.get() != Some(true)
            {
                buffer.prev_feedback.set(Some(true));
                buffer.events.feedback.emit(&super::FeedbackRecommendation {
                    output: self.clone(),
                    scanout_preferred: true,
                });
            }
        }

        let mut pending = state.clone();

        // the buffer's native size after its transform
        let src = buffer.src_box.get();
        let default_size = buffer
            .transform
            .get()
            .transform_size(Size::<i32, BufferCoords>::new(
                dmabuf.width() as i32,
                dmabuf.height() as i32,
            ));
        if !src.is_empty()
            && src
                != Rectangle::from_size(Size::new(default_size.w as f64, default_size.h as f64))
        {
            pending.set_buffer_src_box(src);
        }

        // translate from scene coordinates into output coordinates
        let node_size = buffer_node_size(buffer);
        pending.set_buffer_dst_box(
            self.to_physical_rect(Rectangle::new(entry_pos - self.inner.position.get(), node_size)),
        );

        pending.set_buffer(dmabuf);
        if let Some((timeline, point)) = buffer.wait_timeline.borrow().clone() {
            pending.set_wait_timeline(timeline, point);
        }

        if self.inner.output.test_state(&pending).is_err() {
            return ScanoutResult::Candidate;
        }

        *state = pending;
        buffer.events.output_sample.emit(&OutputSampleEvent {
            output: self.clone(),
            direct_scanout: true,
        });
        ScanoutResult::Success
    }

    /// Build the output state for the next frame
    ///
    /// Either adopts a direct scan-out configuration or renders the scene
    /// into a swapchain buffer. On success the staged fields of `state` are
    /// filled in and the caller commits it.
    pub fn build_state(
        &self,
        state: &mut OutputState,
        options: SceneOutputBuildOptions,
    ) -> Result<(), OutputError> {
        let Some(scene) = self.inner.scene.upgrade() else {
            return Err(OutputError::InvalidState("scene was destroyed"));
        };

        if scene.options.debug_damage == DebugDamage::Rerender {
            self.inner.damage_whole();
        }

        let now = self.inner.clock.now();
        if scene.options.debug_damage == DebugDamage::Highlight {
            // expire old highlights, re-damaging the area they covered
            let mut highlights = self.inner.highlights.borrow_mut();
            let mut expired = Region::empty();
            highlights.retain(|h| {
                let alive = now.as_nanos().saturating_sub(h.when.as_nanos())
                    < HIGHLIGHT_DAMAGE_DURATION.as_nanos() as u64;
                if !alive {
                    expired.add_region(&h.region);
                }
                alive
            });
            drop(highlights);
            if !expired.is_empty() {
                let mut ring = self.inner.damage_ring.borrow_mut();
                ring.add(&expired);
            }

            let fresh = self.inner.damage_ring.borrow().current.clone();
            if !fresh.is_empty() {
                self.inner.highlights.borrow_mut().push(HighlightRegion {
                    region: fresh,
                    when: now,
                });
            }
        }

        if !self.build_render_list(&scene) {
            return Err(OutputError::InvalidState("output has no mode"));
        }

        // direct scan-out path
        let candidate = {
            let list = self.inner.render_list.borrow();
            if list.len() == 1 {
                Some((list[0].node.clone(), list[0].pos))
            } else {
                None
            }
        };
        let scanout = match candidate {
            Some((node, pos)) => self.try_direct_scanout(&scene, &node, pos, state),
            None => ScanoutResult::Ineligible,
        };

        let scanout_active = scanout == ScanoutResult::Success;
        if self.inner.prev_scanout.get() != scanout_active {
            self.inner.dmabuf_feedback_debounce.set(0);
            self.inner.prev_scanout.set(scanout_active);
            if !scanout_active {
                // the swapchain content is stale after scan-out frames
                self.inner.damage_whole();
            }
        } else if self.inner.dmabuf_feedback_debounce.get() < DMABUF_FEEDBACK_DEBOUNCE_FRAMES {
            self.inner
                .dmabuf_feedback_debounce
                .set(self.inner.dmabuf_feedback_debounce.get() + 1);
        }

        if scanout_active {
            trace!("Direct scan-out");
            return Ok(());
        }

        self.render_frame(&scene, state, options)?;
        self.attempt_gamma(state);
        Ok(())
    }

    /// Render the collected list into a swapchain buffer
    fn render_frame(
        &self,
        scene: &Rc<SceneInner>,
        state: &mut OutputState,
        options: SceneOutputBuildOptions,
    ) -> Result<(), OutputError> {
        let output = &self.inner.output;
        let Some(renderer) = output.renderer() else {
            return Err(OutputError::InvalidState("no renderer attached to the output"));
        };
        let Some(bounds) = self.inner.logical_box() else {
            return Err(OutputError::InvalidState("output has no mode"));
        };
        let local_bounds = Rectangle::from_size(bounds.size);

        let slot = output.acquire_swapchain_slot(state)?;

        let mut damage = self
            .inner
            .damage_ring
            .borrow()
            .buffer_damage(slot.age(), local_bounds);

        if scene.options.debug_damage == DebugDamage::Highlight {
            for highlight in self.inner.highlights.borrow().iter() {
                damage.add_region(&highlight.region);
            }
        }

        let supports_timelines = renderer.borrow().supports_timelines();

        // import textures up front, the renderer is busy once the pass begins
        {
            let list = self.inner.render_list.borrow();
            for entry in list.iter() {
                if let NodeKind::Buffer(buffer) = &entry.node.kind {
                    self.ensure_texture(buffer);
                    self.send_composition_feedback(buffer);
                }
            }
        }

        let signal = if supports_timelines {
            self.inner.in_timeline.borrow().clone().map(|timeline| {
                let point = self.inner.in_point.get() + 1;
                self.inner.in_point.set(point);
                TimelinePoint { timeline, point }
            })
        } else {
            None
        };

        // compose input color space, linearization and the inverse EOTF of
        // the output description into one transform chain
        let color_transform = output
            .pending_image_description(state)
            .as_ref()
            .map(output_transform);

        let mut renderer = renderer.borrow_mut();
        let mut pass = renderer
            .begin_pass(
                &slot,
                RenderPassOptions {
                    color_transform,
                    signal: signal.clone(),
                    timer: options.timer,
                },
            )
            .map_err(|err| OutputError::Rejected(Box::new(err)))?;

        // clear with black everything the nodes leave uncovered
        let mut background = damage.clone();
        if scene.options.calculate_visibility {
            let list = self.inner.render_list.borrow();
            for entry in list.iter() {
                let mut opaque = node_opaque_region(&entry.node, entry.pos);
                opaque.translate(Point::new(
                    -self.inner.position.get().x,
                    -self.inner.position.get().y,
                ));
                background.subtract_region(&opaque);
            }
        }
        pass.add_rect(RectOptions {
            dst: self.to_physical_rect(local_bounds),
            clip: &self.inner.logical_to_physical(&background),
            color: Color::BLACK,
            blend: BlendMode::None,
        });

        // draw back-to-front
        let list = self.inner.render_list.borrow();
        for entry in list.iter().rev() {
            self.render_entry(&mut *pass, entry, &damage, supports_timelines);
        }
        drop(list);

        if scene.options.debug_damage == DebugDamage::Highlight {
            for highlight in self.inner.highlights.borrow().iter() {
                pass.add_rect(RectOptions {
                    dst: self.to_physical_rect(local_bounds),
                    clip: &self.inner.logical_to_physical(&highlight.region),
                    color: Color::new(0.5, 0.0, 0.0, 0.5),
                    blend: BlendMode::PremultipliedAlpha,
                });
            }
        }

        let sync = pass.submit().map_err(|err| OutputError::Rejected(Box::new(err)))?;
        drop(renderer);

        match &signal {
            Some(point) => {
                state.set_wait_timeline(point.timeline.clone(), point.point);
            }
            None => {
                // no explicit sync: block until the render finished
                if let Err(err) = sync.wait(Some(Duration::from_secs(1))) {
                    warn!("Failed to wait for render completion: {}", err);
                }
            }
        }

        state.set_buffer((*slot).clone());
        state.set_damage(self.inner.logical_to_buffer(&damage));
        output.swapchain_submitted(&slot);

        self.inner.damage_ring.borrow_mut().rotate();
        Ok(())
    }

    /// Apply a staged gamma ramp to the state, dropping it when rejected
    fn attempt_gamma(&self, state: &mut OutputState) {
        let staged = self.inner.gamma.borrow_mut().take();
        let Some(gamma) = staged else { return };

        let transform = match &gamma {
            Some((dim, lut)) => match ColorTransform::lut_3x1d(*dim, lut.clone()) {
                Some(tf) => Some(tf),
                None => {
                    warn!("Invalid gamma ramp dimensions");
                    return;
                }
            },
            None => None,
        };

        let mut candidate = state.clone();
        candidate.set_color_transform(transform.clone());
        if self.inner.output.test_state(&candidate).is_ok() {
            state.set_color_transform(transform);
        } else {
            debug!("Gamma ramp rejected by the backend, dropping it");
        }
    }

    fn render_entry(
        &self,
        pass: &mut dyn crate::backend::renderer::RenderPass,
        entry: &RenderListEntry,
        damage: &Region<i32, Logical>,
        supports_timelines: bool,
    ) {
        let mut clip = entry.node.visible.borrow().clone();
        clip.translate(Point::new(
            -self.inner.position.get().x,
            -self.inner.position.get().y,
        ));
        clip.intersect_region(damage);
        if clip.is_empty() {
            return;
        }
        let clip = self.inner.logical_to_physical(&clip);

        let local_pos = entry.pos - self.inner.position.get();
        let size = super::inner_size(&entry.node);
        let dst = self.to_physical_rect(Rectangle::new(local_pos, size));

        match &entry.node.kind {
            NodeKind::Tree(_) => {}
            NodeKind::Rect(rect) => {
                let color = rect.color.get();
                pass.add_rect(RectOptions {
                    dst,
                    clip: &clip,
                    color,
                    blend: if color.is_opaque() {
                        BlendMode::None
                    } else {
                        BlendMode::PremultipliedAlpha
                    },
                });
            }
            NodeKind::Buffer(buffer) => {
                buffer.events.output_sample.emit(&OutputSampleEvent {
                    output: self.clone(),
                    direct_scanout: false,
                });
                self.render_buffer(pass, buffer, dst, &clip, supports_timelines);

                if let Some(scene) = self.inner.scene.upgrade() {
                    if scene.options.highlight_transparent {
                        // overlay the part of the buffer that blends
                        let mut transparent = clip.clone();
                        let mut opaque = node_opaque_region(&entry.node, entry.pos);
                        opaque.translate(Point::new(
                            -self.inner.position.get().x,
                            -self.inner.position.get().y,
                        ));
                        transparent.subtract_region(&self.inner.logical_to_physical(&opaque));
                        if !transparent.is_empty() {
                            pass.add_rect(RectOptions {
                                dst,
                                clip: &transparent,
                                color: Color::new(0.0, 0.15, 0.0, 0.15),
                                blend: BlendMode::PremultipliedAlpha,
                            });
                        }
                    }
                }
            }
        }
    }

    fn render_buffer(
        &self,
        pass: &mut dyn crate::backend::renderer::RenderPass,
        buffer: &BufferState,
        dst: Rectangle<i32, crate::utils::Physical>,
        clip: &Region<i32, crate::utils::Physical>,
        supports_timelines: bool,
    ) {
        let opacity = buffer.opacity.get();

        // single-pixel buffers collapse into a rect draw
        if let Some([r, g, b, a]) = buffer.single_pixel_color.get() {
            let max = u32::MAX as f32;
            let color = Color::new(
                r as f32 / max * opacity,
                g as f32 / max * opacity,
                b as f32 / max * opacity,
                a as f32 / max * opacity,
            );
            pass.add_rect(RectOptions {
                dst,
                clip,
                color,
                blend: if color.is_opaque() {
                    BlendMode::None
                } else {
                    BlendMode::PremultipliedAlpha
                },
            });
            return;
        }

        let texture = match buffer.texture.borrow().clone() {
            Some(texture) => texture,
            None => return,
        };

        let src = buffer.src_box.get();
        let src = if src.is_empty() {
            Rectangle::from_size(Size::new(texture.width() as f64, texture.height() as f64))
        } else {
            src
        };

        // skipping blending lets the renderer avoid a read-modify-write
        let blend = if opacity >= 1.0 && buffer.buffer_is_opaque.get() {
            BlendMode::None
        } else {
            BlendMode::PremultipliedAlpha
        };

        let wait = resolve_wait_fence(buffer, supports_timelines);

        pass.add_texture(
            texture.as_ref(),
            TextureOptions {
                src,
                dst,
                clip,
                transform: buffer.transform.get(),
                filter: buffer.filter.get(),
                alpha: opacity,
                blend,
                transfer_function: buffer.transfer_function.get().unwrap_or(TransferFunction::Srgb),
                // absolute-colorimetric mapping to sRGB for unmanaged content
                primaries: buffer.primaries.get().unwrap_or(Primaries::Srgb),
                wait,
            },
        );
    }

    /// Import the texture for a buffer node, caching it on the node
    fn ensure_texture(&self, buffer: &BufferState) {
        if buffer.texture.borrow().is_some() {
            return;
        }
        let Some(dmabuf) = buffer.buffer.borrow().clone() else {
            return;
        };
        let Some(renderer) = self.inner.output.renderer() else {
            return;
        };
        match renderer.borrow_mut().texture_from_buffer(&dmabuf) {
            Ok(texture) => {
                *buffer.texture.borrow_mut() = Some(Rc::from(texture));
            }
            Err(err) => {
                debug!("Failed to import buffer as texture: {}", err);
            }
        }
    }

    /// Recommend composition-friendly buffer allocation once composition
    /// has been stable for a while
    fn send_composition_feedback(&self, buffer: &BufferState) {
        if self.inner.dmabuf_feedback_debounce.get() < DMABUF_FEEDBACK_DEBOUNCE_FRAMES {
            return;
        }
        let primary = buffer.primary_output.borrow().as_ref().and_then(|w| w.upgrade());
        if !primary.map(|p| Rc::ptr_eq(&p, &self.inner)).unwrap_or(false) {
            return;
        }
        if buffer.prev_feedback.get() == Some(false) {
            return;
        }
        buffer.prev_feedback.set(Some(false));
        buffer.events.feedback.emit(&super::FeedbackRecommendation {
            output: self.clone(),
            scanout_preferred: false,
        });
    }

    fn to_physical_rect(
        &self,
        rect: Rectangle<i32, Logical>,
    ) -> Rectangle<i32, crate::utils::Physical> {
        let scale = self.inner.output.scale();
        Rectangle::new(
            Point::new(
                (rect.loc.x as f64 * scale).round() as i32,
                (rect.loc.y as f64 * scale).round() as i32,
            ),
            Size::new(
                (rect.size.w as f64 * scale).round() as i32,
                (rect.size.h as f64 * scale).round() as i32,
            ),
        )
    }
}

impl SceneOutputInner {
    /// Convert output-local logical coordinates to physical pass coordinates
    fn logical_to_physical(&self, region: &Region<i32, Logical>) -> Region<i32, crate::utils::Physical> {
        let scale = self.output.scale();
        region.map(|rect| {
            Rectangle::new(
                Point::new(
                    (rect.loc.x as f64 * scale).floor() as i32,
                    (rect.loc.y as f64 * scale).floor() as i32,
                ),
                Size::new(
                    (rect.size.w as f64 * scale).ceil() as i32,
                    (rect.size.h as f64 * scale).ceil() as i32,
                ),
            )
        })
    }
}

/// The fence to wait on before sampling a buffer
///
/// Prefers the explicit wait timeline; falls back to exporting the dmabuf's
/// implicit fences, and to a bounded blocking poll when the renderer cannot
/// wait on fences itself.
fn resolve_wait_fence(buffer: &BufferState, supports_timelines: bool) -> Option<SyncPoint> {
    if let Some((timeline, point)) = buffer.wait_timeline.borrow().clone() {
        match timeline.export_sync_file(point) {
            Ok(fd) => {
                let sync = SyncPoint::from_sync_file(fd);
                if supports_timelines {
                    return Some(sync);
                }
                // bounded wait, the fence is usually already signalled
                let _ = sync.wait(Some(Duration::from_secs(1)));
                return None;
            }
            Err(err) => {
                debug!("Failed to export wait-timeline point: {}", err);
                return None;
            }
        }
    }

    let dmabuf = buffer.buffer.borrow().clone()?;
    let plane = dmabuf.handles().next()?;
    match dmabuf_export_sync_file(plane, false) {
        Ok(Some(fd)) => {
            let sync = SyncPoint::from_sync_file(fd);
            if supports_timelines {
                Some(sync)
            } else {
                let _ = sync.wait(Some(Duration::from_secs(1)));
                None
            }
        }
        // kernels without the export ioctl cannot hand out a fence; the
        // implicit fences are honored by the driver at sampling time
        Ok(None) | Err(_) => None,
    }
}

/// Color-management gate for direct scan-out
///
/// Buffers without colorimetry scan out only onto outputs without an image
/// description; buffers with colorimetry must match the output exactly. A
/// partial match is not allowed.
fn color_management_scanout_allowed(
    desc: Option<&crate::output::ImageDescription>,
    buffer: &BufferState,
) -> bool {
    let tf = buffer.transfer_function.get();
    let primaries = buffer.primaries.get();

    if tf.is_none() && primaries.is_none() {
        return desc.is_none();
    }

    if let Some(desc) = desc {
        return tf == Some(desc.transfer_function) && primaries == Some(desc.primaries);
    }

    // without an output description only default colorimetry can scan out
    tf == Some(TransferFunction::Gamma22) && primaries == Some(Primaries::Srgb)
}
