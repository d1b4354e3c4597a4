//! Retained-mode scene graph
//!
//! The compositor mutates a tree of nodes instead of re-issuing draw calls
//! each frame: tree nodes establish Z-order through their child list (the
//! list tail is the front), rect nodes fill an area with a color and buffer
//! nodes show client content. The scene computes per-node visibility, tracks
//! per-output damage, attempts direct scan-out where possible and otherwise
//! builds a render pass through the renderer abstraction.
//!
//! Scene nodes hold their visible region in layout coordinates; per-output
//! damage is maintained by the [`SceneOutput`]s attached to the scene.

mod output;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::format::has_alpha;
use crate::backend::allocator::Buffer as _;
use crate::backend::renderer::color::{ColorEncoding, ColorRange, Primaries, TransferFunction};
use crate::backend::renderer::sync::SyncTimeline;
use crate::backend::renderer::{Color, Texture, TextureFilter};
use crate::utils::env::env_flag;
use crate::utils::{
    Buffer as BufferCoords, Logical, Monotonic, Point, Rectangle, Region, Signal, Size, Time, Transform,
};

pub use self::output::{OutputSampleEvent, SceneOutput, SceneOutputBuildOptions, ScanoutResult};
pub(crate) use self::output::SceneOutputInner;

/// Debug damage visualisation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugDamage {
    /// No debug visualisation
    #[default]
    None,
    /// Damage the whole output every frame
    Rerender,
    /// Draw accumulated damage as translucent red rectangles
    Highlight,
}

/// Hook for window-manager stacking arbitration
///
/// During scene updates the scene walks candidate nodes in front-to-back
/// order and reports them here, so an X11 window manager can mirror the
/// scene stacking order into the X server.
pub trait RestackArbiter {
    /// A new update pass begins
    fn begin(&self);
    /// `node` is next in front-to-back order; `fully_inside` tells whether
    /// its whole box lies inside the update region
    fn arbitrate(&self, node: &SceneNode, fully_inside: bool);
    /// `node` became invisible (disabled or removed)
    fn node_hidden(&self, node: &SceneNode);
}

#[derive(Debug)]
pub(crate) struct SceneOptions {
    pub calculate_visibility: bool,
    pub direct_scanout: bool,
    pub debug_damage: DebugDamage,
    pub highlight_transparent: bool,
}

impl SceneOptions {
    fn from_env() -> Self {
        let debug_damage = match crate::utils::env::env_choice(
            "WLR_SCENE_DEBUG_DAMAGE",
            &["none", "rerender", "highlight"],
            0,
        ) {
            1 => DebugDamage::Rerender,
            2 => DebugDamage::Highlight,
            _ => DebugDamage::None,
        };
        SceneOptions {
            calculate_visibility: !env_flag("WLR_SCENE_DISABLE_VISIBILITY"),
            direct_scanout: !env_flag("WLR_SCENE_DISABLE_DIRECT_SCANOUT"),
            debug_damage,
            highlight_transparent: env_flag("WLR_SCENE_HIGHLIGHT_TRANSPARENT_REGION"),
        }
    }
}

pub(crate) struct SceneInner {
    root: RefCell<Option<Rc<NodeInner>>>,
    pub(crate) outputs: RefCell<Vec<Rc<SceneOutputInner>>>,
    pub(crate) options: SceneOptions,
    arbiter: RefCell<Option<Box<dyn RestackArbiter>>>,
}

impl std::fmt::Debug for SceneInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneInner")
            .field("outputs", &self.outputs.borrow().len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The retained composition tree
#[derive(Debug, Clone)]
pub struct Scene {
    pub(crate) inner: Rc<SceneInner>,
}

impl Scene {
    /// Create a new scene
    ///
    /// Debug options are read from the environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Scene {
        let inner = Rc::new(SceneInner {
            root: RefCell::new(None),
            outputs: RefCell::new(Vec::new()),
            options: SceneOptions::from_env(),
            arbiter: RefCell::new(None),
        });

        let root = Rc::new(NodeInner {
            kind: NodeKind::Tree(TreeState {
                children: RefCell::new(Vec::new()),
            }),
            parent: RefCell::new(None),
            position: Cell::new(Point::default()),
            enabled: Cell::new(true),
            visible: RefCell::new(Region::empty()),
            scene: RefCell::new(Rc::downgrade(&inner)),
            events: NodeEvents::default(),
            data: RefCell::new(None),
        });
        *inner.root.borrow_mut() = Some(root);

        Scene { inner }
    }

    /// The root tree of the scene
    pub fn tree(&self) -> SceneTree {
        SceneTree(SceneNode {
            inner: self.inner.root.borrow().clone().expect("scene root"),
        })
    }

    /// Install the stacking arbitration hook
    pub fn set_restack_arbiter(&self, arbiter: Box<dyn RestackArbiter>) {
        *self.inner.arbiter.borrow_mut() = Some(arbiter);
    }

    /// All scene outputs attached to this scene
    pub fn outputs(&self) -> Vec<SceneOutput> {
        self.inner
            .outputs
            .borrow()
            .iter()
            .map(|inner| SceneOutput {
                inner: inner.clone(),
            })
            .collect()
    }

    /// The scene output bound to the given output, if any
    pub fn scene_output_for(&self, needle: &crate::output::Output) -> Option<SceneOutput> {
        self.inner
            .outputs
            .borrow()
            .iter()
            .find(|so| so.output == *needle)
            .map(|inner| SceneOutput {
                inner: inner.clone(),
            })
    }
}

#[derive(Default)]
pub(crate) struct NodeEvents {
    pub destroy: Signal<()>,
}

pub(crate) struct TreeState {
    pub children: RefCell<Vec<Rc<NodeInner>>>,
}

pub(crate) struct RectState {
    pub size: Cell<Size<i32, Logical>>,
    pub color: Cell<Color>,
}

#[derive(Debug, Default)]
pub struct BufferEvents {
    /// The buffer entered an output
    pub output_enter: Signal<SceneOutput>,
    /// The buffer left an output
    pub output_leave: Signal<SceneOutput>,
    /// The set of outputs showing the buffer changed
    pub outputs_update: Signal<Vec<SceneOutput>>,
    /// The buffer was sampled for presentation on an output
    pub output_sample: Signal<OutputSampleEvent>,
    /// A frame was presented; clients throttling on frame callbacks continue
    pub frame_done: Signal<Time<Monotonic>>,
    /// The preferred buffer allocation changed (scan-out vs composition)
    pub feedback: Signal<FeedbackRecommendation>,
}

/// A dmabuf-feedback recommendation for a buffer
#[derive(Debug, Clone)]
pub struct FeedbackRecommendation {
    /// The output driving the recommendation
    pub output: SceneOutput,
    /// Whether buffers should be allocated for direct scan-out
    pub scanout_preferred: bool,
}

pub(crate) struct BufferState {
    pub buffer: RefCell<Option<Dmabuf>>,
    pub texture: RefCell<Option<Rc<dyn Texture>>>,
    /// Cached color of single-pixel buffers, as advertised by the committer
    pub single_pixel_color: Cell<Option<[u32; 4]>>,
    pub src_box: Cell<Rectangle<f64, BufferCoords>>,
    pub dest_size: Cell<Option<Size<i32, Logical>>>,
    pub transform: Cell<Transform>,
    pub opacity: Cell<f32>,
    pub filter: Cell<TextureFilter>,
    pub opaque_region: RefCell<Option<Region<i32, Logical>>>,
    /// Whether the committer marked the whole buffer opaque
    pub buffer_is_opaque: Cell<bool>,
    pub transfer_function: Cell<Option<TransferFunction>>,
    pub primaries: Cell<Option<Primaries>>,
    pub color_encoding: Cell<Option<ColorEncoding>>,
    pub color_range: Cell<Option<ColorRange>>,
    pub wait_timeline: RefCell<Option<(SyncTimeline, u64)>>,
    /// Output with the largest visible overlap
    pub primary_output: RefCell<Option<Weak<SceneOutputInner>>>,
    /// 64-bit mask of outputs the node is active on
    pub active_outputs: Cell<u64>,
    /// Last dmabuf-feedback recommendation, to suppress duplicates:
    /// `Some(true)` scanout-preferred, `Some(false)` composition-preferred
    pub prev_feedback: Cell<Option<bool>>,
    pub events: BufferEvents,
}

impl Default for BufferState {
    fn default() -> Self {
        BufferState {
            buffer: RefCell::new(None),
            texture: RefCell::new(None),
            single_pixel_color: Cell::new(None),
            src_box: Cell::new(Rectangle::default()),
            dest_size: Cell::new(None),
            transform: Cell::new(Transform::Normal),
            opacity: Cell::new(1.0),
            filter: Cell::new(TextureFilter::Linear),
            opaque_region: RefCell::new(None),
            buffer_is_opaque: Cell::new(false),
            transfer_function: Cell::new(None),
            primaries: Cell::new(None),
            color_encoding: Cell::new(None),
            color_range: Cell::new(None),
            wait_timeline: RefCell::new(None),
            primary_output: RefCell::new(None),
            active_outputs: Cell::new(0),
            prev_feedback: Cell::new(None),
            events: BufferEvents::default(),
        }
    }
}

pub(crate) enum NodeKind {
    Tree(TreeState),
    Rect(RectState),
    Buffer(BufferState),
}

pub(crate) struct NodeInner {
    pub kind: NodeKind,
    pub parent: RefCell<Option<Weak<NodeInner>>>,
    pub position: Cell<Point<i32, Logical>>,
    pub enabled: Cell<bool>,
    /// Visible region in layout coordinates; always a subset of the node's
    /// own bounds
    pub visible: RefCell<Region<i32, Logical>>,
    pub scene: RefCell<Weak<SceneInner>>,
    pub events: NodeEvents,
    pub data: RefCell<Option<Rc<dyn Any>>>,
}

impl std::fmt::Debug for NodeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            NodeKind::Tree(_) => "tree",
            NodeKind::Rect(_) => "rect",
            NodeKind::Buffer(_) => "buffer",
        };
        f.debug_struct("SceneNode")
            .field("kind", &kind)
            .field("enabled", &self.enabled.get())
            .field("position", &self.position.get())
            .finish_non_exhaustive()
    }
}

/// Handle to a node of the scene graph
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub(crate) inner: Rc<NodeInner>,
}

impl PartialEq for SceneNode {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for SceneNode {}

/// A tree node, grouping children and establishing Z-order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneTree(pub(crate) SceneNode);

/// A solid-color rectangle node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneRect(pub(crate) SceneNode);

/// A node presenting a buffer or texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneBuffer(pub(crate) SceneNode);

impl std::ops::Deref for SceneTree {
    type Target = SceneNode;
    fn deref(&self) -> &SceneNode {
        &self.0
    }
}
impl std::ops::Deref for SceneRect {
    type Target = SceneNode;
    fn deref(&self) -> &SceneNode {
        &self.0
    }
}
impl std::ops::Deref for SceneBuffer {
    type Target = SceneNode;
    fn deref(&self) -> &SceneNode {
        &self.0
    }
}

/// Options for [`SceneBuffer::set_buffer_with_options`]
#[derive(Debug, Default)]
pub struct SceneBufferOptions {
    /// Damage in buffer-local coordinates; `None` damages everything
    pub damage: Option<Region<i32, BufferCoords>>,
    /// The buffer is known to be a single-pixel buffer of this color
    /// (RGBA, 32 bit per channel)
    pub single_pixel_color: Option<[u32; 4]>,
    /// The committer marked the whole buffer opaque
    pub opaque: bool,
    /// Fence to wait for before sampling the buffer
    pub wait_timeline: Option<(SyncTimeline, u64)>,
}

impl SceneNode {
    fn scene(&self) -> Option<Rc<SceneInner>> {
        self.inner.scene.borrow().upgrade()
    }

    /// The destroy signal of this node
    pub fn destroy_events(&self) -> &Signal<()> {
        &self.inner.events.destroy
    }

    /// Attach arbitrary data to this node
    pub fn set_user_data(&self, data: Option<Rc<dyn Any>>) {
        *self.inner.data.borrow_mut() = data;
    }

    /// Retrieve previously attached data
    pub fn user_data(&self) -> Option<Rc<dyn Any>> {
        self.inner.data.borrow().clone()
    }

    /// Try to interpret this node as a tree
    pub fn as_tree(&self) -> Option<SceneTree> {
        matches!(self.inner.kind, NodeKind::Tree(_)).then(|| SceneTree(self.clone()))
    }

    /// Try to interpret this node as a rect
    pub fn as_rect(&self) -> Option<SceneRect> {
        matches!(self.inner.kind, NodeKind::Rect(_)).then(|| SceneRect(self.clone()))
    }

    /// Try to interpret this node as a buffer
    pub fn as_buffer(&self) -> Option<SceneBuffer> {
        matches!(self.inner.kind, NodeKind::Buffer(_)).then(|| SceneBuffer(self.clone()))
    }

    /// Whether the node (and all its ancestors) is enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    /// Position relative to the parent
    pub fn position(&self) -> Point<i32, Logical> {
        self.inner.position.get()
    }

    /// The parent tree, if the node is attached
    pub fn parent(&self) -> Option<SceneTree> {
        self.inner
            .parent
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|inner| SceneTree(SceneNode { inner }))
    }

    /// Layout coordinates of the node
    ///
    /// Returns `None` when the node or any ancestor is disabled or detached
    /// from a scene root.
    pub fn coords(&self) -> Option<Point<i32, Logical>> {
        let mut position = Point::default();
        let mut node = self.inner.clone();
        loop {
            if !node.enabled.get() {
                return None;
            }
            position += node.position.get();
            let parent = node.parent.borrow().as_ref().and_then(|weak| weak.upgrade());
            match parent {
                Some(parent) => node = parent,
                None => {
                    // only the scene root has no parent
                    let scene = node.scene.borrow().upgrade()?;
                    let is_root = scene
                        .root
                        .borrow()
                        .as_ref()
                        .map(|root| Rc::ptr_eq(root, &node))
                        .unwrap_or(false);
                    return is_root.then_some(position);
                }
            }
        }
    }

    /// Size of the node itself (trees have none)
    pub fn size(&self) -> Size<i32, Logical> {
        inner_size(&self.inner)
    }

    /// The visible region of the node in layout coordinates
    pub fn visible(&self) -> Region<i32, Logical> {
        self.inner.visible.borrow().clone()
    }

    /// Enable or disable the node (and thereby its subtree)
    pub fn set_enabled(&self, enabled: bool) {
        if self.inner.enabled.get() == enabled {
            return;
        }

        // capture what is on screen before the flag flips
        let lost = self.visible_subtree();
        self.inner.enabled.set(enabled);
        scene_node_update(&self.inner, Some(lost));
    }

    /// Move the node relative to its parent
    pub fn set_position(&self, x: i32, y: i32) {
        let position = Point::new(x, y);
        if self.inner.position.get() == position {
            return;
        }

        let lost = self.visible_subtree();
        self.inner.position.set(position);
        scene_node_update(&self.inner, Some(lost));
    }

    /// Move this node right above `sibling` in the Z-order
    pub fn place_above(&self, sibling: &SceneNode) {
        self.restack(sibling, true);
    }

    /// Move this node right below `sibling` in the Z-order
    pub fn place_below(&self, sibling: &SceneNode) {
        self.restack(sibling, false);
    }

    fn restack(&self, sibling: &SceneNode, above: bool) {
        let Some(parent) = self.parent() else { return };
        if parent != sibling.parent().unwrap_or_else(|| parent.clone()) {
            return;
        }
        {
            let tree = match &parent.0.inner.kind {
                NodeKind::Tree(tree) => tree,
                _ => unreachable!("parent is always a tree"),
            };
            let mut children = tree.children.borrow_mut();
            let Some(my_pos) = children.iter().position(|c| Rc::ptr_eq(c, &self.inner)) else {
                return;
            };
            let node = children.remove(my_pos);
            let Some(sib_pos) = children.iter().position(|c| Rc::ptr_eq(c, &sibling.inner)) else {
                children.insert(my_pos, node);
                return;
            };
            // the child list is back-to-front: "above" means after the sibling
            let insert_at = if above { sib_pos + 1 } else { sib_pos };
            children.insert(insert_at, node);
        }
        scene_node_update(&self.inner, None);
    }

    /// Move the node to the top of its siblings
    pub fn raise_to_top(&self) {
        let Some(parent) = self.parent() else { return };
        {
            let tree = match &parent.0.inner.kind {
                NodeKind::Tree(tree) => tree,
                _ => unreachable!(),
            };
            let mut children = tree.children.borrow_mut();
            let Some(pos) = children.iter().position(|c| Rc::ptr_eq(c, &self.inner)) else {
                return;
            };
            if pos + 1 == children.len() {
                return;
            }
            let node = children.remove(pos);
            children.push(node);
        }
        scene_node_update(&self.inner, None);
    }

    /// Move the node to the bottom of its siblings
    pub fn lower_to_bottom(&self) {
        let Some(parent) = self.parent() else { return };
        {
            let tree = match &parent.0.inner.kind {
                NodeKind::Tree(tree) => tree,
                _ => unreachable!(),
            };
            let mut children = tree.children.borrow_mut();
            let Some(pos) = children.iter().position(|c| Rc::ptr_eq(c, &self.inner)) else {
                return;
            };
            if pos == 0 {
                return;
            }
            let node = children.remove(pos);
            children.insert(0, node);
        }
        scene_node_update(&self.inner, None);
    }

    /// Move the node into another tree, keeping its relative position
    pub fn reparent(&self, new_parent: &SceneTree) {
        if self
            .parent()
            .map(|p| p == *new_parent)
            .unwrap_or(false)
        {
            return;
        }

        let lost = self.visible_subtree();
        self.detach();
        if let NodeKind::Tree(tree) = &new_parent.0.inner.kind {
            tree.children.borrow_mut().push(self.inner.clone());
        }
        *self.inner.parent.borrow_mut() = Some(Rc::downgrade(&new_parent.0.inner));
        *self.inner.scene.borrow_mut() = new_parent.0.inner.scene.borrow().clone();
        scene_node_update(&self.inner, Some(lost));
    }

    fn detach(&self) {
        if let Some(parent) = self.parent() {
            if let NodeKind::Tree(tree) = &parent.0.inner.kind {
                tree.children
                    .borrow_mut()
                    .retain(|c| !Rc::ptr_eq(c, &self.inner));
            }
        }
        *self.inner.parent.borrow_mut() = None;
    }

    /// Destroy the node, removing it from the scene
    pub fn destroy(&self) {
        self.inner.events.destroy.emit(&());

        // destroy children of trees depth-first
        if let NodeKind::Tree(tree) = &self.inner.kind {
            let children: Vec<_> = tree.children.borrow().clone();
            for child in children {
                SceneNode { inner: child }.destroy();
            }
        }

        let lost = self.visible_subtree();
        self.inner.enabled.set(false);
        self.detach();
        scene_node_update(&self.inner, Some(lost));
    }

    /// Union of the visible regions of the node's enabled descendants
    fn visible_subtree(&self) -> Region<i32, Logical> {
        let mut region = Region::empty();
        collect_visibility(&self.inner, &mut region);
        region
    }

    /// Find the topmost node containing the given layout position
    ///
    /// Returns the node and the position relative to it.
    pub fn node_at(&self, pos: Point<f64, Logical>) -> Option<(SceneNode, Point<f64, Logical>)> {
        if !self.inner.enabled.get() {
            return None;
        }

        match &self.inner.kind {
            NodeKind::Tree(tree) => {
                // front-to-back: the child list tail is the front
                for child in tree.children.borrow().iter().rev() {
                    let node = SceneNode { inner: child.clone() };
                    let offset = node.position().to_f64();
                    if let Some(found) = node.node_at(pos - offset) {
                        return Some(found);
                    }
                }
                None
            }
            _ => {
                let size = self.size().to_f64();
                let bounds = Rectangle::from_size(size);
                bounds.contains(pos).then(|| (self.clone(), pos))
            }
        }
    }
}

impl SceneTree {
    /// Create a new tree node under `parent`
    pub fn create(parent: &SceneTree) -> SceneTree {
        let node = create_node(
            parent,
            NodeKind::Tree(TreeState {
                children: RefCell::new(Vec::new()),
            }),
        );
        SceneTree(node)
    }

    /// The children of this tree in back-to-front order
    pub fn children(&self) -> Vec<SceneNode> {
        match &self.0.inner.kind {
            NodeKind::Tree(tree) => tree
                .children
                .borrow()
                .iter()
                .map(|inner| SceneNode { inner: inner.clone() })
                .collect(),
            _ => unreachable!(),
        }
    }
}

impl SceneRect {
    /// Create a new rectangle node under `parent`
    pub fn create(parent: &SceneTree, size: Size<i32, Logical>, color: Color) -> SceneRect {
        let node = create_node(
            parent,
            NodeKind::Rect(RectState {
                size: Cell::new(size),
                color: Cell::new(color),
            }),
        );
        scene_node_update(&node.inner, None);
        SceneRect(node)
    }

    /// Change the size of the rectangle
    pub fn set_size(&self, size: Size<i32, Logical>) {
        let rect = self.rect_state();
        if rect.size.get() == size {
            return;
        }
        rect.size.set(size);
        scene_node_update(&self.0.inner, None);
    }

    /// Change the color of the rectangle
    pub fn set_color(&self, color: Color) {
        let rect = self.rect_state();
        if rect.color.get() == color {
            return;
        }
        let opacity_changed = (rect.color.get().a >= 1.0) != (color.a >= 1.0);
        rect.color.set(color);
        if opacity_changed {
            // opacity transitions change the opaque region below this node
            scene_node_update(&self.0.inner, None);
        } else {
            damage_node(&self.0);
        }
    }

    /// The current color
    pub fn color(&self) -> Color {
        self.rect_state().color.get()
    }

    fn rect_state(&self) -> &RectState {
        match &self.0.inner.kind {
            NodeKind::Rect(rect) => rect,
            _ => unreachable!(),
        }
    }
}

impl SceneBuffer {
    /// Create a new buffer node under `parent`
    pub fn create(parent: &SceneTree, buffer: Option<Dmabuf>) -> SceneBuffer {
        let state = BufferState::default();
        if let Some(buffer) = &buffer {
            state
                .buffer_is_opaque
                .set(!has_alpha(buffer.format().code));
        }
        *state.buffer.borrow_mut() = buffer;
        let node = create_node(parent, NodeKind::Buffer(state));
        scene_node_update(&node.inner, None);
        SceneBuffer(node)
    }

    pub(crate) fn state(&self) -> &BufferState {
        match &self.0.inner.kind {
            NodeKind::Buffer(buffer) => buffer,
            _ => unreachable!(),
        }
    }

    /// The buffer events
    pub fn events(&self) -> &BufferEvents {
        &self.state().events
    }

    /// The current buffer, if any
    pub fn buffer(&self) -> Option<Dmabuf> {
        self.state().buffer.borrow().clone()
    }

    /// Attach a new buffer, damaging everything
    pub fn set_buffer(&self, buffer: Option<Dmabuf>) {
        self.set_buffer_with_options(buffer, SceneBufferOptions::default());
    }

    /// Attach a new buffer with damage and metadata
    pub fn set_buffer_with_options(&self, buffer: Option<Dmabuf>, options: SceneBufferOptions) {
        let state = self.state();

        let same_buffer = match (&buffer, &*state.buffer.borrow()) {
            (Some(new), Some(old)) => new == old,
            (None, None) => true,
            _ => false,
        };
        let size_changed = match (&buffer, &*state.buffer.borrow()) {
            (Some(new), Some(old)) => new.width() != old.width() || new.height() != old.height(),
            _ => true,
        };

        state.single_pixel_color.set(options.single_pixel_color);
        state.buffer_is_opaque.set(
            options.opaque
                || buffer
                    .as_ref()
                    .map(|b| !has_alpha(b.format().code))
                    .unwrap_or(false),
        );
        *state.wait_timeline.borrow_mut() = options.wait_timeline;
        *state.texture.borrow_mut() = None;
        *state.buffer.borrow_mut() = buffer;

        if same_buffer && !size_changed {
            // only content changed: damage the committed region on the
            // outputs instead of recomputing visibility
            if let Some(damage) = options.damage {
                damage_buffer_region(self, &damage);
                return;
            }
        }

        scene_node_update(&self.0.inner, None);
    }

    /// Set a pre-imported texture instead of a buffer
    pub fn set_texture(&self, texture: Option<Rc<dyn Texture>>) {
        let state = self.state();
        *state.texture.borrow_mut() = texture;
        scene_node_update(&self.0.inner, None);
    }

    pub(crate) fn texture(&self) -> Option<Rc<dyn Texture>> {
        self.state().texture.borrow().clone()
    }

    /// Advertise the region of the buffer known to be opaque
    pub fn set_opaque_region(&self, region: Option<Region<i32, Logical>>) {
        *self.state().opaque_region.borrow_mut() = region;
        scene_node_update(&self.0.inner, None);
    }

    /// Set the source crop within the buffer
    pub fn set_source_box(&self, src: Rectangle<f64, BufferCoords>) {
        let state = self.state();
        if state.src_box.get() == src {
            return;
        }
        state.src_box.set(src);
        scene_node_update(&self.0.inner, None);
    }

    /// Set the size the buffer content is scaled to
    pub fn set_dest_size(&self, size: Option<Size<i32, Logical>>) {
        let state = self.state();
        if state.dest_size.get() == size {
            return;
        }
        state.dest_size.set(size);
        scene_node_update(&self.0.inner, None);
    }

    /// Set the transform the content is committed with
    pub fn set_transform(&self, transform: Transform) {
        let state = self.state();
        if state.transform.get() == transform {
            return;
        }
        state.transform.set(transform);
        scene_node_update(&self.0.inner, None);
    }

    /// Set the opacity applied when compositing
    pub fn set_opacity(&self, opacity: f32) {
        let state = self.state();
        if state.opacity.get() == opacity {
            return;
        }
        let was_opaque = state.opacity.get() >= 1.0;
        state.opacity.set(opacity);
        if was_opaque != (opacity >= 1.0) {
            scene_node_update(&self.0.inner, None);
        } else {
            damage_node(&self.0);
        }
    }

    /// Set the sampling filter
    pub fn set_filter_mode(&self, filter: TextureFilter) {
        let state = self.state();
        if state.filter.get() == filter {
            return;
        }
        state.filter.set(filter);
        damage_node(&self.0);
    }

    /// Set the transfer function of the content
    pub fn set_transfer_function(&self, tf: Option<TransferFunction>) {
        let state = self.state();
        if state.transfer_function.get() == tf {
            return;
        }
        state.transfer_function.set(tf);
        damage_node(&self.0);
    }

    /// Set the primaries of the content
    pub fn set_primaries(&self, primaries: Option<Primaries>) {
        let state = self.state();
        if state.primaries.get() == primaries {
            return;
        }
        state.primaries.set(primaries);
        damage_node(&self.0);
    }

    /// Set the color encoding of the content
    pub fn set_color_encoding(&self, encoding: Option<ColorEncoding>) {
        let state = self.state();
        if state.color_encoding.get() == encoding {
            return;
        }
        state.color_encoding.set(encoding);
        damage_node(&self.0);
    }

    /// Set the quantization range of the content
    pub fn set_color_range(&self, range: Option<ColorRange>) {
        let state = self.state();
        if state.color_range.get() == range {
            return;
        }
        state.color_range.set(range);
        damage_node(&self.0);
    }

    /// The output with the largest visible overlap, if any
    pub fn primary_output(&self) -> Option<SceneOutput> {
        self.state()
            .primary_output
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|inner| SceneOutput { inner })
    }

    /// Send `frame_done` to this buffer
    pub fn send_frame_done(&self, time: Time<Monotonic>) {
        self.state().events.frame_done.emit(&time);
    }
}

fn create_node(parent: &SceneTree, kind: NodeKind) -> SceneNode {
    let inner = Rc::new(NodeInner {
        kind,
        parent: RefCell::new(Some(Rc::downgrade(&parent.0.inner))),
        position: Cell::new(Point::default()),
        enabled: Cell::new(true),
        visible: RefCell::new(Region::empty()),
        scene: RefCell::new(parent.0.inner.scene.borrow().clone()),
        events: NodeEvents::default(),
        data: RefCell::new(None),
    });
    if let NodeKind::Tree(tree) = &parent.0.inner.kind {
        tree.children.borrow_mut().push(inner.clone());
    }
    SceneNode { inner }
}

pub(crate) fn buffer_node_size(state: &BufferState) -> Size<i32, Logical> {
    if let Some(size) = state.dest_size.get() {
        return size;
    }
    let src = state.src_box.get();
    if !src.is_empty() {
        return Size::new(src.size.w.round() as i32, src.size.h.round() as i32);
    }
    let buffer_size = if let Some(buffer) = &*state.buffer.borrow() {
        Size::new(buffer.width() as i32, buffer.height() as i32)
    } else if let Some(texture) = &*state.texture.borrow() {
        Size::new(texture.width() as i32, texture.height() as i32)
    } else {
        Size::default()
    };
    let transformed: Size<i32, Logical> = Size::new(buffer_size.w, buffer_size.h);
    state.transform.get().transform_size(transformed)
}

/// Size of a node independent of a handle
pub(crate) fn inner_size(node: &NodeInner) -> Size<i32, Logical> {
    match &node.kind {
        NodeKind::Tree(_) => Size::default(),
        NodeKind::Rect(rect) => rect.size.get(),
        NodeKind::Buffer(buffer) => buffer_node_size(buffer),
    }
}

/// The opaque region a node contributes at position (x, y)
pub(crate) fn node_opaque_region(node: &NodeInner, pos: Point<i32, Logical>) -> Region<i32, Logical> {
    let size = inner_size(node);
    match &node.kind {
        NodeKind::Tree(_) => Region::empty(),
        NodeKind::Rect(rect) => {
            if rect.color.get().a >= 1.0 {
                Region::from_rect(Rectangle::new(pos, size))
            } else {
                Region::empty()
            }
        }
        NodeKind::Buffer(buffer) => {
            if buffer.opacity.get() < 1.0 {
                return Region::empty();
            }
            if buffer.buffer_is_opaque.get() {
                return Region::from_rect(Rectangle::new(pos, size));
            }
            match &*buffer.opaque_region.borrow() {
                Some(region) => {
                    let mut region = region.clone();
                    region.intersect_rect(Rectangle::from_size(size));
                    region.translate(pos);
                    region
                }
                None => Region::empty(),
            }
        }
    }
}

fn collect_visibility(node: &Rc<NodeInner>, region: &mut Region<i32, Logical>) {
    if !node.enabled.get() {
        return;
    }
    if let NodeKind::Tree(tree) = &node.kind {
        for child in tree.children.borrow().iter() {
            collect_visibility(child, region);
        }
        return;
    }
    region.add_region(&node.visible.borrow());
}

fn node_bounds(node: &Rc<NodeInner>, pos: Point<i32, Logical>, region: &mut Region<i32, Logical>) {
    if !node.enabled.get() {
        return;
    }
    if let NodeKind::Tree(tree) = &node.kind {
        for child in tree.children.borrow().iter() {
            node_bounds(child, pos + child.position.get(), region);
        }
        return;
    }
    let size = inner_size(node);
    region.add_rect(Rectangle::new(pos, size));
}

/// Visit all leaf nodes intersecting `bounds` in front-to-back order
///
/// The callback returns true to stop the traversal.
pub(crate) fn nodes_in_box(
    node: &Rc<NodeInner>,
    pos: Point<i32, Logical>,
    bounds: Rectangle<i32, Logical>,
    callback: &mut dyn FnMut(&Rc<NodeInner>, Point<i32, Logical>) -> bool,
) -> bool {
    if !node.enabled.get() {
        return false;
    }

    match &node.kind {
        NodeKind::Tree(tree) => {
            // front-to-back: iterate the child list in reverse
            let children: Vec<_> = tree.children.borrow().clone();
            for child in children.iter().rev() {
                if nodes_in_box(child, pos + child.position.get(), bounds, callback) {
                    return true;
                }
            }
            false
        }
        _ => {
            let size = inner_size(node);
            let rect = Rectangle::new(pos, size);
            if rect.overlaps(bounds) {
                return callback(node, pos);
            }
            false
        }
    }
}

/// Damage the currently visible region of a node on all outputs
pub(crate) fn damage_node(node: &SceneNode) {
    let Some(scene) = node.scene() else { return };
    let damage = node.inner.visible.borrow().clone();
    damage_outputs(&scene, &damage);
}

/// Damage the given buffer-local region of a buffer node
fn damage_buffer_region(buffer: &SceneBuffer, damage: &Region<i32, BufferCoords>) {
    let Some(scene) = buffer.scene() else { return };
    let Some(pos) = buffer.coords() else { return };
    let state = buffer.state();

    // map buffer-local damage through src crop, transform and dest scale
    // into layout coordinates
    let node_size = buffer_node_size(state);
    let buffer_size = state
        .buffer
        .borrow()
        .as_ref()
        .map(|b| Size::new(b.width() as i32, b.height() as i32))
        .unwrap_or_default();
    if buffer_size.is_empty() || node_size.is_empty() {
        return;
    }

    let transform = state.transform.get().invert();
    let src = state.src_box.get();
    let (src_origin, src_size) = if src.is_empty() {
        (
            Point::new(0.0, 0.0),
            Size::new(buffer_size.w as f64, buffer_size.h as f64),
        )
    } else {
        (src.loc, src.size)
    };

    let mut logical = Region::empty();
    for rect in damage.rects() {
        let rect: Rectangle<f64, BufferCoords> = rect.to_f64();
        let transformed = transform.transform_rect_in(
            rect,
            &Size::new(buffer_size.w as f64, buffer_size.h as f64),
        );
        // into source-crop relative coordinates
        let cropped = Rectangle::new(
            Point::new(transformed.loc.x - src_origin.x, transformed.loc.y - src_origin.y),
            transformed.size,
        );
        // scale to node size
        let scale_x = node_size.w as f64 / src_size.w;
        let scale_y = node_size.h as f64 / src_size.h;
        let scaled: Rectangle<f64, Logical> = Rectangle::new(
            Point::new(cropped.loc.x * scale_x, cropped.loc.y * scale_y),
            Size::new(cropped.size.w * scale_x, cropped.size.h * scale_y),
        );
        let mut rect = scaled.to_i32_up();
        rect.loc += pos;
        logical.add_rect(rect);
    }

    logical.intersect_region(&buffer.inner.visible.borrow());
    damage_outputs(&scene, &logical);
}

/// Push layout-coordinate damage to every intersecting output
pub(crate) fn damage_outputs(scene: &Rc<SceneInner>, damage: &Region<i32, Logical>) {
    if damage.is_empty() {
        return;
    }
    for scene_output in scene.outputs.borrow().iter() {
        scene_output.damage_logical(damage);
    }
}

struct UpdateData {
    /// Remaining visible region while walking front-to-back
    visible: Region<i32, Logical>,
    update_region: Region<i32, Logical>,
    update_box: Rectangle<i32, Logical>,
    calculate_visibility: bool,
}

/// Recompute visibility and output membership inside `update_region`
pub(crate) fn update_region(scene: &Rc<SceneInner>, region: &Region<i32, Logical>) {
    let update_box = region.extents();
    let mut data = UpdateData {
        visible: region.clone(),
        update_region: region.clone(),
        update_box,
        calculate_visibility: scene.options.calculate_visibility,
    };

    if let Some(arbiter) = &*scene.arbiter.borrow() {
        arbiter.begin();
    }

    let Some(root) = scene.root.borrow().clone() else { return };
    nodes_in_box(&root, Point::default(), update_box, &mut |node, pos| {
        let bounds = Rectangle::new(pos, inner_size(node));

        {
            let mut visible = node.visible.borrow_mut();
            visible.subtract_region(&data.update_region);
            let mut gained = data.visible.clone();
            gained.intersect_rect(bounds);
            visible.add_region(&gained);
            visible.intersect_rect(bounds);
        }

        if data.calculate_visibility {
            let opaque = node_opaque_region(node, pos);
            data.visible.subtract_region(&opaque);
        }

        update_node_outputs(scene, node, None);

        if let Some(arbiter) = &*scene.arbiter.borrow() {
            if matches!(node.kind, NodeKind::Buffer(_)) {
                let fully_inside = data.update_box.contains_rect(bounds);
                arbiter.arbitrate(&SceneNode { inner: node.clone() }, fully_inside);
            }
        }

        false
    });
}

/// Recompute per-output membership of a buffer node
///
/// An output counts when it holds at least 10% of the node's visible area;
/// the output with the largest overlap becomes the primary output.
pub(crate) fn update_node_outputs(
    scene: &Rc<SceneInner>,
    node: &Rc<NodeInner>,
    ignore: Option<&Rc<SceneOutputInner>>,
) {
    let NodeKind::Buffer(buffer) = &node.kind else {
        return;
    };

    let visible = node.visible.borrow();
    let visible_area = visible.area();

    let old_primary = buffer.primary_output.borrow().as_ref().and_then(|w| w.upgrade());
    let old_active = buffer.active_outputs.get();

    let mut primary: Option<Rc<SceneOutputInner>> = None;
    let mut largest_overlap = 0u64;
    let mut active_outputs = 0u64;
    let mut active_list = Vec::new();

    // update in two steps, the primary output first, so that the
    // enter/leave handlers observe a settled primary output
    for scene_output in scene.outputs.borrow().iter() {
        if let Some(ignore) = ignore {
            if Rc::ptr_eq(scene_output, ignore) {
                continue;
            }
        }
        if !scene_output.output.is_enabled() {
            continue;
        }

        let Some(output_box) = scene_output.logical_box() else {
            continue;
        };
        let overlap = visible.intersection_rect(output_box).area();

        // ignore outputs holding less than 10% of the visible node area
        if overlap * 10 >= visible_area && overlap > 0 {
            if overlap >= largest_overlap {
                largest_overlap = overlap;
                primary = Some(scene_output.clone());
            }
            active_outputs |= 1u64 << scene_output.index;
            active_list.push(scene_output.clone());
        }
    }
    drop(visible);

    let primary_changed = match (&old_primary, &primary) {
        (Some(old), Some(new)) => !Rc::ptr_eq(old, new),
        (None, None) => false,
        _ => true,
    };
    if primary_changed {
        buffer.prev_feedback.set(None);
    }
    *buffer.primary_output.borrow_mut() = primary.as_ref().map(Rc::downgrade);
    buffer.active_outputs.set(active_outputs);

    for scene_output in scene.outputs.borrow().iter() {
        let mask = 1u64 << scene_output.index;
        let intersects = active_outputs & mask != 0;
        let intersected = old_active & mask != 0;
        if intersects && !intersected {
            buffer.events.output_enter.emit(&SceneOutput {
                inner: scene_output.clone(),
            });
        } else if !intersects && intersected {
            buffer.events.output_leave.emit(&SceneOutput {
                inner: scene_output.clone(),
            });
        }
    }

    // skip the update event if nothing changed
    if old_active == active_outputs && !primary_changed {
        return;
    }

    trace!(active = active_list.len(), "Buffer output membership changed");
    buffer.events.outputs_update.emit(
        &active_list
            .into_iter()
            .map(|inner| SceneOutput { inner })
            .collect(),
    );
}

/// Central update entry: recompute visibility around a mutated node
///
/// `lost` carries the node's previous visible region when content
/// disappeared (disable, move, destroy); `None` means the node gained
/// content in place.
pub(crate) fn scene_node_update(node: &Rc<NodeInner>, lost: Option<Region<i32, Logical>>) {
    let Some(scene) = node.scene.borrow().upgrade() else {
        return;
    };

    let handle = SceneNode { inner: node.clone() };
    match handle.coords() {
        None => {
            // the node is hidden
            if let Some(arbiter) = &*scene.arbiter.borrow() {
                notify_hidden(arbiter.as_ref(), node);
            }
            if let Some(damage) = lost {
                update_region(&scene, &damage);
                damage_outputs(&scene, &damage);
            }
        }
        Some(pos) => {
            let mut damage = lost.unwrap_or_default();

            let mut update = damage.clone();
            node_bounds(node, pos, &mut update);

            update_region(&scene, &update);

            collect_visibility(node, &mut damage);
            damage_outputs(&scene, &damage);
        }
    }
}

fn notify_hidden(arbiter: &dyn RestackArbiter, node: &Rc<NodeInner>) {
    if let NodeKind::Tree(tree) = &node.kind {
        for child in tree.children.borrow().iter() {
            notify_hidden(arbiter, child);
        }
        return;
    }
    if matches!(node.kind, NodeKind::Buffer(_)) {
        arbiter.node_hidden(&SceneNode { inner: node.clone() });
    }
}

#[cfg(test)]
mod tests;
