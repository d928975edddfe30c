use super::*;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use model::{Rect, UpdateFlags};
use scheduler::{
    JobContext, JobError, SchedulerConfig, SchedulerEvent, StrokeJob, StrokeStatus,
};
use tiles::{MemoryConfig, MemoryManager, TILE_SIZE};

const CLEAR: [u8; 4] = [0, 0, 0, 0];
const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn rgba_image(width: i32, height: i32) -> Image {
    let memory = MemoryManager::new(MemoryConfig::default()).expect("default memory config");
    Image::new(
        width,
        height,
        4,
        &CLEAR,
        memory,
        SchedulerConfig {
            worker_threads: 2,
            ..SchedulerConfig::default()
        },
    )
    .expect("create image")
}

fn paint(image: &Image, layer: NodeId, rect: Rect, pixel: &[u8]) {
    image
        .paint_device(layer)
        .expect("paint layer")
        .fill(rect, pixel);
    image.request_projection_update(layer, rect, UpdateFlags::empty());
}

fn stroke_events(image: &Image) -> Vec<StrokeStatus> {
    image
        .events()
        .try_iter()
        .filter_map(|event| match event {
            SchedulerEvent::StrokeCompleted { status, .. } => Some(status),
            SchedulerEvent::UpdateCompleted { .. } => None,
        })
        .collect()
}

/// Blocks its worker until released through the returned sender.
struct GateJob {
    started: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl StrokeJob for GateJob {
    fn region(&self) -> Option<Rect> {
        Some(Rect::new(0, 0, 8, 8))
    }

    fn run(&mut self, _context: &JobContext) -> Result<(), JobError> {
        self.started.send(()).expect("report start");
        self.release.recv().expect("wait for release");
        Ok(())
    }
}

#[test]
fn projection_shows_topmost_painted_pixels() {
    let image = rgba_image(256, 256);
    let root = image.root();
    let bottom = image.add_paint_layer(root, "bottom").expect("add bottom");
    let top = image.add_paint_layer(root, "top").expect("add top");
    assert_eq!(image.children(root).expect("root children"), vec![bottom, top]);

    paint(&image, bottom, Rect::new(0, 0, 64, 64), &RED);
    paint(&image, top, Rect::new(32, 0, 64, 64), &BLUE);
    image.wait_for_done();

    let projection = image.projection();
    assert_eq!(projection.read_pixel(10, 10), RED);
    assert_eq!(projection.read_pixel(40, 10), BLUE);
    assert_eq!(projection.read_pixel(80, 10), BLUE);
    assert_eq!(projection.read_pixel(120, 10), CLEAR);
    assert_eq!(projection.read_pixel(10, 100), CLEAR);
}

#[test]
fn nested_group_updates_reach_the_root() {
    let image = rgba_image(300, 300);
    let group = image.add_group(image.root(), "group").expect("add group");
    let layer = image.add_paint_layer(group, "layer").expect("add layer");
    assert_eq!(image.parent(layer).expect("layer parent"), Some(group));
    assert_eq!(image.node_kind(group).expect("group kind"), NodeKind::Group);
    assert_eq!(image.node_name(layer).expect("layer name"), "layer");

    paint(&image, layer, Rect::new(100, 100, 150, 150), &BLUE);
    image.wait_for_done();

    let group_projection = image.device(group).expect("group device");
    assert_eq!(group_projection.read_pixel(120, 120), BLUE);
    assert_eq!(image.projection().read_pixel(249, 249), BLUE);
    assert_eq!(image.projection().read_pixel(250, 250), CLEAR);
    assert!(image.filthy_regions(layer).is_empty());
}

#[test]
fn fill_stroke_commits_and_reports_completion() {
    let image = rgba_image(128, 128);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");
    let stroke = FillStroke::new(&image, layer).expect("fill stroke");
    assert_eq!(stroke.layer(), layer);

    let id = image.start_stroke(stroke.clone());
    image
        .add_job(id, stroke.job(Rect::new(0, 0, 16, 16), &RED))
        .expect("add first job");
    image
        .add_job(id, stroke.job(Rect::new(8, 8, 16, 16), &BLUE))
        .expect("add second job");
    image.end_stroke(id).expect("end stroke");
    image.wait_for_done();

    let projection = image.projection();
    assert_eq!(projection.read_pixel(2, 2), RED);
    assert_eq!(projection.read_pixel(12, 12), BLUE);
    assert_eq!(projection.read_pixel(30, 30), CLEAR);
    assert_eq!(stroke_events(&image), vec![StrokeStatus::Completed]);
}

#[test]
fn cancelled_fill_stroke_restores_the_layer() {
    let image = rgba_image(128, 128);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");
    paint(&image, layer, Rect::new(0, 0, 32, 32), &RED);
    image.wait_for_done();

    let stroke = FillStroke::new(&image, layer).expect("fill stroke");
    let id = image.start_stroke(stroke.clone());
    image
        .add_job(id, stroke.job(Rect::new(16, 16, 64, 64), &BLUE))
        .expect("add job");
    image.wait_for_done();
    assert_eq!(image.projection().read_pixel(40, 40), BLUE);

    image.cancel_stroke(id).expect("cancel stroke");
    image.wait_for_done();

    let content = image.paint_device(layer).expect("paint layer");
    assert_eq!(content.read_pixel(20, 20), RED);
    assert_eq!(content.read_pixel(40, 40), CLEAR);
    assert_eq!(image.projection().read_pixel(20, 20), RED);
    assert_eq!(image.projection().read_pixel(40, 40), CLEAR);
    assert_eq!(stroke_events(&image), vec![StrokeStatus::Cancelled]);
    assert!(matches!(
        image.add_job(id, stroke.job(Rect::new(0, 0, 4, 4), &BLUE)),
        Err(DocumentError::Stroke(_))
    ));
}

#[test]
fn fill_with_wrong_pixel_size_fails_the_job() {
    let image = rgba_image(64, 64);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");
    let stroke = FillStroke::new(&image, layer).expect("fill stroke");
    let id = image.start_stroke(stroke.clone());
    image
        .add_job(id, stroke.job(Rect::new(0, 0, 4, 4), &[1, 2, 3]))
        .expect("add job");
    image.end_stroke(id).expect("end stroke");
    image.wait_for_done();

    assert_eq!(image.scheduler().stats().failed, 1);
    assert_eq!(image.projection().read_pixel(1, 1), CLEAR);
}

#[test]
fn fill_stroke_needs_a_paint_layer() {
    let image = rgba_image(64, 64);
    let group = image.add_group(image.root(), "group").expect("add group");
    assert!(matches!(
        FillStroke::new(&image, group),
        Err(DocumentError::NotAPaintLayer(node)) if node == group
    ));
}

#[test]
fn disabled_dirty_requests_are_dropped() {
    let image = rgba_image(128, 128);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");

    let cookie = image.disable_dirty_requests();
    paint(&image, layer, Rect::new(0, 0, 16, 16), &RED);
    image.wait_for_done();
    assert_eq!(image.projection().read_pixel(4, 4), CLEAR);
    assert!(image.take_frame_invalidations().is_empty());
    assert!(image.filthy_regions(layer).is_empty());

    image.enable_dirty_requests(cookie);
    image.request_projection_update(layer, Rect::new(0, 0, 16, 16), UpdateFlags::empty());
    image.wait_for_done();
    assert_eq!(image.projection().read_pixel(4, 4), RED);
}

#[test]
fn custom_filter_sees_every_request() {
    let image = rgba_image(128, 128);
    let hidden = image.add_paint_layer(image.root(), "hidden").expect("add hidden");
    let shown = image.add_paint_layer(image.root(), "shown").expect("add shown");

    let filter: Arc<dyn ProjectionUpdatesFilter> =
        Arc::new(move |node: NodeId, _rect: Rect, _flags: UpdateFlags| node == hidden);
    let cookie = image.add_projection_updates_filter(filter);
    paint(&image, hidden, Rect::new(0, 0, 8, 8), &RED);
    paint(&image, shown, Rect::new(64, 64, 8, 8), &BLUE);
    image.wait_for_done();

    assert_eq!(image.projection().read_pixel(1, 1), CLEAR);
    assert_eq!(image.projection().read_pixel(65, 65), BLUE);

    image.remove_projection_updates_filter(cookie);
    image.request_projection_update(hidden, Rect::new(0, 0, 8, 8), UpdateFlags::empty());
    image.wait_for_done();
    assert_eq!(image.projection().read_pixel(1, 1), RED);
}

#[test]
#[should_panic(expected = "removed out of order")]
fn filters_are_removed_innermost_first() {
    let image = rgba_image(16, 16);
    let outer = image.disable_dirty_requests();
    let _inner = image.disable_dirty_requests();
    image.enable_dirty_requests(outer);
}

#[test]
fn update_flags_control_filthy_and_frame_tracking() {
    let image = rgba_image(128, 128);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");
    let first = Rect::new(0, 0, 16, 16);
    let second = Rect::new(32, 32, 16, 16);
    let third = Rect::new(64, 64, 16, 16);

    image.scheduler().block_updates();
    image.request_projection_update(layer, first, UpdateFlags::NO_FILTHY);
    image.request_projection_update(layer, second, UpdateFlags::empty());
    image.request_projection_update(layer, third, UpdateFlags::DONT_INVALIDATE_FRAMES);
    assert_eq!(image.filthy_regions(layer), vec![second, third]);
    assert_eq!(image.take_frame_invalidations(), vec![first, second]);
    assert!(image.take_frame_invalidations().is_empty());

    image.scheduler().unblock_updates();
    image.wait_for_done();
    assert!(image.filthy_regions(layer).is_empty());
}

#[test]
fn requests_are_clipped_to_the_image() {
    let image = rgba_image(100, 100);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");

    image.request_projection_update(layer, Rect::new(200, 200, 10, 10), UpdateFlags::empty());
    image.request_projection_update(layer, Rect::new(90, 90, 20, 20), UpdateFlags::empty());
    image.wait_for_done();
    assert_eq!(image.take_frame_invalidations(), vec![Rect::new(90, 90, 10, 10)]);
}

#[test]
fn removing_a_node_recomposites_its_area() {
    let image = rgba_image(128, 128);
    let group = image.add_group(image.root(), "group").expect("add group");
    let layer = image.add_paint_layer(group, "layer").expect("add layer");
    paint(&image, layer, Rect::new(0, 0, 32, 32), &RED);
    image.wait_for_done();
    assert_eq!(image.projection().read_pixel(8, 8), RED);

    image.remove_node(group).expect("remove group");
    image.wait_for_done();
    assert!(!image.contains(group));
    assert!(!image.contains(layer));
    assert!(image.children(image.root()).expect("root children").is_empty());
    assert_eq!(image.projection().read_pixel(8, 8), CLEAR);
}

#[test]
fn structural_errors_are_reported() {
    let image = rgba_image(64, 64);
    let root = image.root();
    let layer = image.add_paint_layer(root, "layer").expect("add layer");
    let group = image.add_group(root, "group").expect("add group");

    assert!(matches!(image.remove_node(root), Err(DocumentError::RootRemoval)));
    assert!(matches!(
        image.add_paint_layer(layer, "child"),
        Err(DocumentError::NotAGroup(node)) if node == layer
    ));
    assert!(matches!(
        image.paint_device(group),
        Err(DocumentError::NotAPaintLayer(node)) if node == group
    ));
    image.remove_node(layer).expect("remove layer");
    assert!(matches!(
        image.remove_node(layer),
        Err(DocumentError::UnknownNode(node)) if node == layer
    ));
    assert!(matches!(image.node_kind(layer), Err(DocumentError::UnknownNode(_))));
}

#[test]
fn structural_edits_wait_for_running_jobs() {
    let image = rgba_image(64, 64);
    let layer = image.add_paint_layer(image.root(), "layer").expect("add layer");
    let stroke = FillStroke::new(&image, layer).expect("fill stroke");
    let id = image.start_stroke(stroke);

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    image
        .add_job(
            id,
            Box::new(GateJob {
                started: started_tx,
                release: release_rx,
            }),
        )
        .expect("add gate job");
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("gate job started");

    std::thread::scope(|scope| {
        let (added_tx, added_rx) = mpsc::channel();
        let image = &image;
        scope.spawn(move || {
            let group = image.add_group(image.root(), "group").expect("add group");
            added_tx.send(group).expect("report group");
        });
        assert!(added_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).expect("release gate job");
        let group = added_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("group added after the job finished");
        assert!(image.contains(group));
    });
    image.end_stroke(id).expect("end stroke");
    image.wait_for_done();
}

#[test]
fn image_size_and_default_pixel_are_validated() {
    let memory = MemoryManager::new(MemoryConfig::default()).expect("default memory config");
    let config = SchedulerConfig {
        worker_threads: 1,
        ..SchedulerConfig::default()
    };
    assert!(matches!(
        Image::new(64, 64, 4, &[0, 0, 0], memory.clone(), config),
        Err(DocumentError::DefaultPixelSize {
            expected: 4,
            found: 3
        })
    ));
    assert!(matches!(
        Image::new(0, 64, 4, &CLEAR, memory, config),
        Err(DocumentError::EmptyImage {
            width: 0,
            height: 64
        })
    ));

    let tiny = MemoryManager::new(MemoryConfig {
        soft_limit_bytes: 1000,
        hard_limit_bytes: 1000,
        ..MemoryConfig::default()
    })
    .expect("limits alone are valid");
    assert!(matches!(
        Image::new(64, 64, 4, &CLEAR, tiny, config),
        Err(DocumentError::Memory(
            tiles::ConfigError::TileExceedsHardLimit { hard: 1000, .. }
        ))
    ));
}

#[test]
fn image_from_config_uses_both_sections() {
    let config = CoreConfig::from_toml(
        r#"
        [memory]
        pool_limit = 2

        [scheduler]
        worker_threads = 3
        patch_size = 128
        "#,
    )
    .expect("parse config");
    let image = Image::from_config(64, 32, 1, &[0], &config).expect("create image");

    assert_eq!(image.bounds(), Rect::new(0, 0, 64, 32));
    assert_eq!(image.pixel_size(), 1);
    assert_eq!(image.default_pixel(), &[0]);
    assert_eq!(image.scheduler().config().worker_threads, 3);
    assert_eq!(image.scheduler().config().patch_size, 128);
    assert_eq!(image.memory().config().pool_limit, 2);
}

#[test]
fn swapped_out_tiles_composite_correctly() {
    let swap_dir = tempfile::tempdir().expect("create swap dir");
    let tile_bytes = (TILE_SIZE * TILE_SIZE) as usize;
    let memory = MemoryManager::new(MemoryConfig {
        soft_limit_bytes: 4 * tile_bytes,
        hard_limit_bytes: 64 * tile_bytes,
        pool_limit: 2,
        swap_directory: Some(swap_dir.path().to_path_buf()),
    })
    .expect("small memory config");
    let image = Image::new(
        256,
        256,
        1,
        &[0],
        memory.clone(),
        SchedulerConfig {
            worker_threads: 2,
            patch_size: 128,
            merge_updates: true,
        },
    )
    .expect("create image");
    let bottom = image.add_paint_layer(image.root(), "bottom").expect("add bottom");
    let top = image.add_paint_layer(image.root(), "top").expect("add top");

    for (index, x) in (0..256).step_by(32).enumerate() {
        paint(&image, bottom, Rect::new(x, 0, 32, 256), &[index as u8 + 1]);
    }
    paint(&image, top, Rect::new(100, 100, 50, 50), &[200]);
    memory.swap().inject_write_failures(1);
    image.wait_for_done();

    let projection = image.projection();
    assert_eq!(projection.read_pixel(5, 5), vec![1]);
    assert_eq!(projection.read_pixel(250, 10), vec![8]);
    assert_eq!(projection.read_pixel(120, 120), vec![200]);
    assert_eq!(projection.read_pixel(99, 120), vec![4]);

    let stats = memory.stats();
    assert!(stats.evictions > 0);
    assert!(stats.swap_ins > 0);
    assert!(stats.resident_bytes <= 64 * tile_bytes);
}
