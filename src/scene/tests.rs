use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::format::FormatSet;
use crate::backend::allocator::{Allocator, Fourcc, Modifier};
use crate::backend::renderer::sync::SyncPoint;
use crate::backend::renderer::{
    Color, RectOptions, RenderPass, RenderPassOptions, Renderer, RendererError, Texture,
    TextureOptions,
};
use crate::output::{
    AspectRatio, Mode, Output, OutputBackend, OutputError, OutputState, PhysicalProperties,
    StateField, Subpixel,
};
use crate::utils::{Point, Rectangle, Region, Size};

use super::*;

fn dmabuf(width: u32, height: u32, fourcc: Fourcc) -> Dmabuf {
    let fd = rustix::fs::open("/dev/null", rustix::fs::OFlags::RDONLY, rustix::fs::Mode::empty())
        .expect("failed to open /dev/null");
    let mut builder = Dmabuf::builder(width, height, fourcc, Modifier::Linear);
    builder.add_plane(fd, 0, width * 4);
    builder.build().unwrap()
}

#[derive(Debug)]
struct TestAllocator;

impl Allocator for TestAllocator {
    type Buffer = Dmabuf;
    type Error = std::io::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        _modifiers: &[Modifier],
    ) -> Result<Dmabuf, Self::Error> {
        Ok(dmabuf(width, height, fourcc))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Rect { clip_area: u64, color: Color },
    Texture { clip_area: u64 },
}

#[derive(Debug)]
struct TestPass {
    ops: Rc<RefCell<Vec<Op>>>,
}

impl RenderPass for TestPass {
    fn add_texture(&mut self, _texture: &dyn Texture, options: TextureOptions<'_>) {
        self.ops.borrow_mut().push(Op::Texture {
            clip_area: options.clip.area(),
        });
    }

    fn add_rect(&mut self, options: RectOptions<'_>) {
        self.ops.borrow_mut().push(Op::Rect {
            clip_area: options.clip.area(),
            color: options.color,
        });
    }

    fn submit(self: Box<Self>) -> Result<SyncPoint, RendererError> {
        Ok(SyncPoint::signaled())
    }
}

#[derive(Debug)]
struct TestTexture {
    width: u32,
    height: u32,
}

impl Texture for TestTexture {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn has_alpha(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct TestRenderer {
    formats: FormatSet,
    ops: Rc<RefCell<Vec<Op>>>,
}

impl TestRenderer {
    fn new(ops: Rc<RefCell<Vec<Op>>>) -> Self {
        let mut formats = FormatSet::new();
        formats.add(Fourcc::Xrgb8888, Modifier::Linear);
        formats.add(Fourcc::Argb8888, Modifier::Linear);
        TestRenderer { formats, ops }
    }
}

impl Renderer for TestRenderer {
    fn texture_formats(&self) -> &FormatSet {
        &self.formats
    }

    fn render_formats(&self) -> &FormatSet {
        &self.formats
    }

    fn texture_from_buffer(&mut self, buffer: &Dmabuf) -> Result<Box<dyn Texture>, RendererError> {
        use crate::backend::allocator::Buffer as _;
        Ok(Box::new(TestTexture {
            width: buffer.width(),
            height: buffer.height(),
        }))
    }

    fn begin_pass(
        &mut self,
        _buffer: &Dmabuf,
        _options: RenderPassOptions,
    ) -> Result<Box<dyn RenderPass + '_>, RendererError> {
        Ok(Box::new(TestPass {
            ops: self.ops.clone(),
        }))
    }

    fn supports_timelines(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct TestOutputBackend;

impl OutputBackend for TestOutputBackend {
    fn test(&mut self, _output: &Output, _state: &OutputState) -> Result<(), OutputError> {
        Ok(())
    }

    fn commit(&mut self, _output: &Output, _state: &OutputState) -> Result<(), OutputError> {
        Ok(())
    }

    fn primary_formats(&self) -> FormatSet {
        let mut formats = FormatSet::new();
        formats.add(Fourcc::Xrgb8888, Modifier::Linear);
        formats.add(Fourcc::Argb8888, Modifier::Linear);
        formats
    }
}

fn test_output(ops: &Rc<RefCell<Vec<Op>>>) -> Output {
    let output = Output::new(
        "TEST-1".into(),
        PhysicalProperties {
            size: (520, 290),
            subpixel: Subpixel::Unknown,
            make: "Screens Inc".into(),
            model: "Monitor Ultra".into(),
            serial: None,
        },
        Box::new(TestOutputBackend),
    );
    let mode = Mode {
        size: Size::new(1920, 1080),
        refresh: 60_000,
        preferred: true,
        picture_aspect_ratio: AspectRatio::None,
    };
    output.set_modes(vec![mode]);
    output.init_render(
        Box::new(TestAllocator),
        Rc::new(RefCell::new(Box::new(TestRenderer::new(ops.clone())) as Box<dyn Renderer>)),
    );

    let mut state = OutputState::new();
    state.set_mode(mode);
    state.set_enabled(true);
    output.commit_state(&state).expect("failed to enable test output");
    output
}

fn black_single_pixel(parent: &SceneTree, size: Size<i32, crate::utils::Logical>) -> SceneBuffer {
    let buffer = SceneBuffer::create(parent, Some(dmabuf(1, 1, Fourcc::Argb8888)));
    buffer.set_buffer_with_options(
        Some(dmabuf(1, 1, Fourcc::Argb8888)),
        SceneBufferOptions {
            single_pixel_color: Some([0, 0, 0, u32::MAX]),
            opaque: true,
            ..Default::default()
        },
    );
    buffer.set_dest_size(Some(size));
    buffer
}

#[test]
fn visible_is_subset_of_bounds() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let _so = SceneOutput::create(&scene, &output).unwrap();

    let rect = SceneRect::create(&scene.tree(), Size::new(400, 300), Color::new(1.0, 0.0, 0.0, 1.0));
    rect.set_position(50, 60);

    let bounds = Rectangle::new(Point::new(50, 60), Size::new(400, 300));
    for r in rect.visible().rects() {
        assert!(bounds.contains_rect(*r), "{r:?} outside {bounds:?}");
    }
    assert_eq!(rect.visible().area(), 400 * 300);
}

#[test]
fn opaque_node_occludes_nodes_below() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let _so = SceneOutput::create(&scene, &output).unwrap();

    let below = SceneRect::create(&scene.tree(), Size::new(200, 200), Color::new(0.0, 1.0, 0.0, 1.0));
    below.set_position(0, 0);
    let above = SceneRect::create(&scene.tree(), Size::new(200, 200), Color::new(1.0, 0.0, 0.0, 1.0));
    above.set_position(0, 0);

    assert_eq!(above.visible().area(), 200 * 200);
    assert_eq!(below.visible().area(), 0);

    // a translucent occluder does not hide what is below
    above.set_color(Color::new(1.0, 0.0, 0.0, 0.5));
    assert_eq!(below.visible().area(), 200 * 200);
}

#[test]
fn single_pixel_background_cull() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    // child A: black opaque single-pixel buffer stretched over the output
    let background = black_single_pixel(&scene.tree(), Size::new(1920, 1080));
    background.set_position(0, 0);

    // child B: textured buffer at (100, 100), 200x200, opaque
    let client = SceneBuffer::create(&scene.tree(), Some(dmabuf(200, 200, Fourcc::Xrgb8888)));
    client.set_position(100, 100);

    ops.borrow_mut().clear();
    let mut state = OutputState::new();
    scene_output
        .build_state(&mut state, SceneOutputBuildOptions::default())
        .unwrap();

    // the render list must contain only B
    let list = scene_output.render_list_nodes();
    assert_eq!(list.len(), 1);
    assert!(list[0] == *client);

    // the clear step must cover output ∖ B-visible
    let recorded = ops.borrow();
    let clear = recorded
        .iter()
        .find(|op| matches!(op, Op::Rect { color, .. } if *color == Color::BLACK))
        .expect("no clear rect recorded");
    if let Op::Rect { clip_area, .. } = clear {
        assert_eq!(*clip_area, 1920 * 1080 - 200 * 200);
    }
    // and B must have been drawn as a texture over its visible region
    let texture = recorded
        .iter()
        .find(|op| matches!(op, Op::Texture { .. }))
        .expect("no texture draw recorded");
    if let Op::Texture { clip_area } = texture {
        assert_eq!(*clip_area, 200 * 200);
    }
}

#[test]
fn damage_subtraction_across_commits() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let _background = {
        let rect = SceneRect::create(&scene.tree(), Size::new(1920, 1080), Color::new(0.2, 0.2, 0.2, 1.0));
        rect.set_position(0, 0);
        rect
    };

    // first frame: two damage rects
    let mut damage = Region::empty();
    damage.add_rect(Rectangle::new(Point::new(0, 0), Size::new(800, 600)));
    damage.add_rect(Rectangle::new(Point::new(1000, 0), Size::new(400, 400)));
    scene_output.inner.damage_logical(&damage);

    let mut state = OutputState::new();
    scene_output
        .build_state(&mut state, SceneOutputBuildOptions::default())
        .unwrap();
    output.commit_state(&state).unwrap();

    // the commit acknowledged everything
    assert_eq!(scene_output.inner.pending_commit_damage.borrow().area(), 0);

    // second frame: only the first rect is dirty again
    let mut damage = Region::empty();
    damage.add_rect(Rectangle::new(Point::new(0, 0), Size::new(800, 600)));
    scene_output.inner.damage_logical(&damage);

    assert_eq!(
        scene_output.inner.pending_commit_damage.borrow().area(),
        800 * 600
    );
}

#[test]
fn scanout_refused_with_software_cursor() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let buffer = dmabuf(1920, 1080, Fourcc::Xrgb8888);
    let client = SceneBuffer::create(&scene.tree(), Some(buffer.clone()));
    client.set_position(0, 0);

    // without locks the single fullscreen buffer is scanned out directly
    let mut state = OutputState::new();
    scene_output
        .build_state(&mut state, SceneOutputBuildOptions::default())
        .unwrap();
    assert_eq!(state.buffer(), Some(&buffer));

    // a software cursor lock forces composition
    output.lock_software_cursors();
    let mut state = OutputState::new();
    ops.borrow_mut().clear();
    scene_output
        .build_state(&mut state, SceneOutputBuildOptions::default())
        .unwrap();
    assert!(state.committed().contains(StateField::BUFFER));
    assert_ne!(state.buffer(), Some(&buffer));
    assert!(!ops.borrow().is_empty(), "composition pass expected");
    output.unlock_software_cursors();
}

#[test]
fn output_enter_and_leave_signals() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let _so = SceneOutput::create(&scene, &output).unwrap();

    let client = SceneBuffer::create(&scene.tree(), Some(dmabuf(200, 200, Fourcc::Xrgb8888)));

    let entered = Rc::new(std::cell::Cell::new(0));
    let left = Rc::new(std::cell::Cell::new(0));
    let e = entered.clone();
    client.events().output_enter.subscribe(move |_| e.set(e.get() + 1));
    let l = left.clone();
    client.events().output_leave.subscribe(move |_| l.set(l.get() + 1));

    // creation already entered the output; move fully off it first
    client.set_position(5000, 5000);
    assert_eq!(left.get(), 1);
    assert_eq!(entered.get(), 0);

    client.set_position(100, 100);
    assert_eq!(entered.get(), 1);

    // 200x200 node with less than 10% of its area on the output
    client.set_position(1920 - 10, 1080 - 10);
    assert_eq!(left.get(), 2);
}

#[test]
fn node_at_respects_z_order() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let _so = SceneOutput::create(&scene, &output).unwrap();

    let below = SceneRect::create(&scene.tree(), Size::new(100, 100), Color::new(0.0, 1.0, 0.0, 1.0));
    below.set_position(0, 0);
    let above = SceneRect::create(&scene.tree(), Size::new(100, 100), Color::new(1.0, 0.0, 0.0, 1.0));
    above.set_position(50, 50);

    let tree = scene.tree();
    let (hit, _) = tree.node_at(Point::new(75.0, 75.0)).unwrap();
    assert!(hit == *above);
    let (hit, _) = tree.node_at(Point::new(25.0, 25.0)).unwrap();
    assert!(hit == *below);
    assert!(tree.node_at(Point::new(500.0, 500.0)).is_none());

    above.lower_to_bottom();
    let (hit, _) = tree.node_at(Point::new(75.0, 75.0)).unwrap();
    assert!(hit == *below);
}

#[test]
fn disabled_nodes_are_skipped() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let rect = SceneRect::create(&scene.tree(), Size::new(100, 100), Color::new(1.0, 1.0, 1.0, 1.0));
    rect.set_position(0, 0);
    assert_eq!(rect.visible().area(), 100 * 100);

    rect.set_enabled(false);
    let mut state = OutputState::new();
    scene_output
        .build_state(&mut state, SceneOutputBuildOptions::default())
        .unwrap();
    assert!(scene_output.render_list_nodes().is_empty());
}

#[test]
fn reparent_keeps_scene_membership() {
    let ops = Rc::new(RefCell::new(Vec::new()));
    let scene = Scene::new();
    let output = test_output(&ops);
    let _so = SceneOutput::create(&scene, &output).unwrap();

    let group_a = SceneTree::create(&scene.tree());
    let group_b = SceneTree::create(&scene.tree());
    group_b.set_position(500, 0);

    let rect = SceneRect::create(&group_a, Size::new(50, 50), Color::new(1.0, 0.0, 1.0, 1.0));
    assert_eq!(rect.coords(), Some(Point::new(0, 0)));

    rect.reparent(&group_b);
    assert_eq!(rect.coords(), Some(Point::new(500, 0)));
    assert!(rect.parent().unwrap() == group_b);
}
