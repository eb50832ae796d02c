use glam::{Mat4, Vec3};

use super::*;
use crate::camera::Projection;
use crate::gpu::{
    BindingResource, BindingWrite, GpuError, HeadlessDevice,
};
use crate::options::TlasRebuildPolicy;
use crate::renderer::uniforms::MISS_COLOR;
use crate::renderer::RtBinding;
use crate::scene::assets::demo_scene;
use crate::scene::Scene;

const SMALL_WINDOW: Extent2d = Extent2d::new(64, 48);

fn options() -> Options {
    let mut options = Options::default();
    options.shaders.directory =
        concat!(env!("CARGO_MANIFEST_DIR"), "/shaders").into();
    options.ray_tracing.seed = Some(7);
    options
}

fn camera() -> CameraState {
    CameraState::look_at(
        Vec3::new(0.0, 2.0, 8.0),
        Vec3::ZERO,
        SMALL_WINDOW.width as f32 / SMALL_WINDOW.height as f32,
        Projection::default(),
    )
}

fn renderer_with(
    device: HeadlessDevice,
    options: Options,
    cubes: usize,
) -> (HybridRenderer<HeadlessDevice>, Scene) {
    let mut ctx = GpuContext::new(device);
    let scene = demo_scene(&mut ctx, cubes).unwrap();
    let renderer = HybridRenderer::new(ctx, options, &scene).unwrap();
    (renderer, scene)
}

fn small_renderer(cubes: usize) -> (HybridRenderer<HeadlessDevice>, Scene) {
    renderer_with(HeadlessDevice::with_window(SMALL_WINDOW), options(), cubes)
}

fn finish(renderer: HybridRenderer<HeadlessDevice>, scene: Scene) {
    let mut ctx = renderer.shutdown();
    scene.destroy(&mut ctx);
    assert_eq!(ctx.device.live_objects(), 0);
    assert!(ctx.allocator.leaked_labels().is_empty());
    assert!(
        ctx.device.validation_errors().is_empty(),
        "{:?}",
        ctx.device.validation_errors()
    );
}

fn table(renderer: &HybridRenderer<HeadlessDevice>) -> Vec<BindingWrite> {
    renderer
        .device()
        .binding_table_contents(renderer.ray_tracing_table())
        .unwrap()
}

fn slot(writes: &[BindingWrite], binding: RtBinding) -> &BindingResource {
    &writes
        .iter()
        .find(|w| w.slot == binding.slot())
        .unwrap()
        .resource
}

fn close(a: [f32; 4], b: [f32; 4]) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1.0 / 255.0)
}

#[test]
fn frames_in_flight_never_touch_busy_slots() {
    let (mut renderer, scene) = small_renderer(2);
    let exit = run_frames(&mut renderer, &scene, &camera(), 6);
    assert!(matches!(exit, LoopExit::Completed { frames: 6 }));
    assert_eq!(renderer.stats().presented, 6);
    assert!(renderer.device().pending_submissions() <= crate::frame::FRAMES_IN_FLIGHT);
    assert!(renderer.device().validation_errors().is_empty());
    finish(renderer, scene);
}

#[test]
fn tlas_records_match_instances() {
    let (mut renderer, scene) = small_renderer(3);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    let records = renderer.tlas().last_records();
    assert_eq!(records.len(), scene.instances().len());
    for (index, (record, instance)) in
        records.iter().zip(scene.instances()).enumerate()
    {
        let model = scene.model_of(instance).unwrap();
        assert_eq!(record.blas_address, model.blas.address());
        assert_eq!(record.custom_index() as usize, index);
    }
    let built = renderer
        .device()
        .top_level_instances(renderer.tlas().tlas())
        .unwrap();
    assert_eq!(built, records);
    finish(renderer, scene);
}

#[test]
fn two_frames_wait_on_two_fences_and_chain_history() {
    let (mut renderer, scene) = small_renderer(2);
    assert_eq!(scene.instances().len(), 3);
    for _ in 0..2 {
        let _ = renderer.render_frame(&scene, &camera()).unwrap();
    }
    let device = renderer.device();
    assert_eq!(device.stats().fence_waits.len(), 2);
    assert!(device.stats().fence_waits.values().all(|&waits| waits == 1));
    let log = device.trace_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].previous_digest, log[0].output_digest);
    assert_eq!(log[0].instance_count, 3);
    finish(renderer, scene);
}

#[test]
fn accumulation_chains_previous_and_current() {
    let (mut renderer, scene) = small_renderer(1);
    for _ in 0..4 {
        let _ = renderer.render_frame(&scene, &camera()).unwrap();
    }
    let log = renderer.device().trace_log();
    let counters: Vec<u32> = log.iter().map(|t| t.accumulated).collect();
    assert_eq!(counters, vec![0, 1, 2, 3]);
    for pair in log.windows(2) {
        assert_eq!(pair[1].previous_digest, pair[0].output_digest);
        assert_ne!(pair[1].seed, pair[0].seed);
    }
    assert_eq!(renderer.accumulated_frames(), 4);
    finish(renderer, scene);
}

#[test]
fn camera_motion_restarts_accumulation() {
    let (mut renderer, scene) = small_renderer(1);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let moved = CameraState::look_at(
        Vec3::new(3.0, 2.0, 8.0),
        Vec3::ZERO,
        1.0,
        Projection::default(),
    );
    let _ = renderer.render_frame(&scene, &moved).unwrap();
    let counters: Vec<(u32, u32)> = renderer
        .device()
        .trace_log()
        .iter()
        .map(|t| (t.frame_counter, t.accumulated))
        .collect();
    assert_eq!(counters, vec![(0, 0), (1, 1), (2, 0)]);
    finish(renderer, scene);
}

#[test]
fn empty_scene_traces_only_misses() {
    let ctx = GpuContext::new(HeadlessDevice::with_window(SMALL_WINDOW));
    let scene = Scene::new();
    let mut renderer = HybridRenderer::new(ctx, options(), &scene).unwrap();
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    let trace = &renderer.device().trace_log()[0];
    assert_eq!(trace.instance_count, 0);
    assert_eq!(trace.hit_pixels, 0);
    let shown = renderer.device().present_log()[0].center_texel;
    assert!(close(shown, MISS_COLOR), "{shown:?}");
    finish(renderer, scene);
}

#[test]
fn resize_sizes_every_image_binding() {
    let (mut renderer, scene) = renderer_with(HeadlessDevice::new(), options(), 2);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let before = table(&renderer);

    let new_extent = Extent2d::new(1200, 800);
    renderer.device_mut().set_window_extent(new_extent);
    renderer.resize(new_extent).unwrap();

    let after = table(&renderer);
    let gbuffer = renderer.gbuffer();
    for image in [gbuffer.depth(), gbuffer.normal(), gbuffer.albedo()] {
        assert_eq!(renderer.device().image_extent(image), Some(new_extent));
    }
    assert_eq!(renderer.outputs().extent(), new_extent);
    for binding in RtBinding::RESOLUTION_IMAGES {
        let images = slot(&after, binding).images();
        assert_eq!(images.len(), 1);
        assert_eq!(renderer.device().image_extent(images[0]), Some(new_extent));
    }
    for binding in [
        RtBinding::Tlas,
        RtBinding::SceneUniform,
        RtBinding::Vertices,
        RtBinding::Indices,
        RtBinding::SubMeshes,
        RtBinding::Instances,
        RtBinding::AlbedoTextures,
        RtBinding::AuxTextures,
    ] {
        assert_eq!(slot(&after, binding), slot(&before, binding), "{binding:?}");
    }

    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(renderer.device().trace_log().last().unwrap().extent, new_extent);
    assert_eq!(renderer.device().present_log().last().unwrap().extent, new_extent);
    assert_eq!(renderer.stats().resizes, 1);
    finish(renderer, scene);
}

#[test]
fn scaled_resize_sizes_bindings_and_keeps_history() {
    let mut scaled = options();
    scaled.render.render_scale = 0.5;
    let (mut renderer, scene) = renderer_with(HeadlessDevice::new(), scaled, 2);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();

    let window = Extent2d::new(1200, 800);
    let internal = Extent2d::new(600, 400);
    renderer.device_mut().set_window_extent(window);
    renderer.resize(window).unwrap();
    assert_eq!(renderer.swapchain().extent, window);
    assert_eq!(renderer.render_extent(), internal);
    assert_eq!(renderer.outputs().extent(), internal);
    let gbuffer = renderer.gbuffer();
    for image in [gbuffer.depth(), gbuffer.normal(), gbuffer.albedo()] {
        assert_eq!(renderer.device().image_extent(image), Some(internal));
    }
    let after = table(&renderer);
    for binding in RtBinding::RESOLUTION_IMAGES {
        let images = slot(&after, binding).images();
        assert_eq!(images.len(), 1);
        assert_eq!(
            renderer.device().image_extent(images[0]),
            Some(internal),
            "{binding:?}"
        );
    }
    let _ = renderer.render_frame(&scene, &camera()).unwrap();

    let mut raster = renderer.options().clone();
    raster.render.ray_tracing = false;
    renderer.set_options(raster).unwrap();
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let mut traced = renderer.options().clone();
    traced.render.ray_tracing = true;
    renderer.set_options(traced).unwrap();
    let _ = renderer.render_frame(&scene, &camera()).unwrap();

    let log = renderer.device().trace_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[2].extent, internal);
    assert_eq!(log[2].accumulated, 0);
    assert_eq!(log[2].previous_digest, log[1].output_digest);
    assert_eq!(renderer.device().present_log().last().unwrap().extent, window);
    assert_eq!(renderer.stats().resizes, 1);
    finish(renderer, scene);
}

#[test]
fn repeated_resize_is_idempotent() {
    let (mut renderer, scene) = small_renderer(1);
    let extent = Extent2d::new(80, 60);
    renderer.device_mut().set_window_extent(extent);
    renderer.resize(extent).unwrap();
    let once = table(&renderer);
    let gbuffer_once = renderer.gbuffer().depth();
    renderer.resize(extent).unwrap();
    assert_eq!(table(&renderer), once);
    assert_eq!(renderer.gbuffer().depth(), gbuffer_once);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    finish(renderer, scene);
}

#[test]
fn render_scale_changes_internal_resolution_only() {
    let mut scaled = options();
    scaled.render.render_scale = 0.5;
    let (mut renderer, scene) =
        renderer_with(HeadlessDevice::with_window(SMALL_WINDOW), scaled, 1);
    assert_eq!(renderer.render_extent(), Extent2d::new(32, 24));
    assert_eq!(renderer.swapchain().extent, SMALL_WINDOW);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    assert_eq!(
        renderer.device().trace_log()[0].extent,
        Extent2d::new(32, 24)
    );
    assert_eq!(renderer.device().present_log()[0].extent, SMALL_WINDOW);

    renderer.set_options(options()).unwrap();
    assert_eq!(renderer.render_extent(), SMALL_WINDOW);
    assert_eq!(renderer.outputs().extent(), SMALL_WINDOW);
    assert_eq!(renderer.stats().resizes, 1);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    finish(renderer, scene);
}

#[test]
fn scene_over_capacity_is_rejected_at_construction() {
    let mut ctx = GpuContext::new(HeadlessDevice::with_window(SMALL_WINDOW));
    let scene = demo_scene(&mut ctx, 3).unwrap();
    let mut limited = options();
    limited.ray_tracing.max_meshes = 2;
    match HybridRenderer::new(ctx, limited, &scene) {
        Err(PrismError::CapacityExceeded {
            what,
            requested,
            capacity,
        }) => {
            assert_eq!(what, "sub-meshes");
            assert_eq!(requested, 4);
            assert_eq!(capacity, 2);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[test]
fn missing_shader_directory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut bad = options();
    bad.shaders.directory = dir.path().to_path_buf();
    let ctx = GpuContext::new(HeadlessDevice::with_window(SMALL_WINDOW));
    assert!(matches!(
        HybridRenderer::new(ctx, bad, &Scene::new()),
        Err(PrismError::ShaderLoad { .. })
    ));
}

#[test]
fn failed_submit_ends_the_loop() {
    let (mut renderer, scene) = small_renderer(1);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    renderer.device_mut().inject_submit_failure();
    match run_frames(&mut renderer, &scene, &camera(), 5) {
        LoopExit::Fatal(PrismError::Gpu(GpuError::DeviceLost)) => {}
        other => panic!("expected a fatal device loss, got {other:?}"),
    }
    assert_eq!(renderer.stats().presented, 1);
    finish(renderer, scene);
}

#[test]
fn raster_composite_when_ray_tracing_is_off() {
    let mut raster = options();
    raster.render.ray_tracing = false;
    let (mut renderer, scene) =
        renderer_with(HeadlessDevice::with_window(SMALL_WINDOW), raster, 1);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    assert!(renderer.device().trace_log().is_empty());
    assert_eq!(renderer.stats().tlas_builds, 0);
    let shown = renderer.device().present_log()[0].center_texel;
    assert!(!close(shown, MISS_COLOR));
    assert!(!close(shown, renderer.options().render.clear_color));

    let mut traced = renderer.options().clone();
    traced.render.ray_tracing = true;
    renderer.set_options(traced).unwrap();
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    assert_eq!(renderer.device().trace_log().len(), 1);
    assert_eq!(renderer.stats().resizes, 0);
    finish(renderer, scene);
}

#[test]
fn out_of_date_acquire_drops_the_frame() {
    let (mut renderer, scene) = small_renderer(1);
    renderer.device_mut().inject_out_of_date_acquires(1);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Dropped
    );
    let stats = renderer.stats();
    assert_eq!((stats.dropped, stats.resizes, stats.presented), (1, 1, 0));
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    finish(renderer, scene);
}

#[test]
fn window_change_is_picked_up_at_acquire() {
    let (mut renderer, scene) = small_renderer(1);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let bigger = Extent2d::new(96, 64);
    renderer.device_mut().set_window_extent(bigger);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Dropped
    );
    assert_eq!(renderer.swapchain().extent, bigger);
    assert_eq!(renderer.render_extent(), bigger);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    finish(renderer, scene);
}

#[test]
fn suboptimal_present_resizes_after_showing_the_frame() {
    let (mut renderer, scene) = small_renderer(1);
    renderer.device_mut().inject_suboptimal_presents(1);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Resized
    );
    let stats = renderer.stats();
    assert_eq!((stats.presented, stats.resizes), (1, 1));
    finish(renderer, scene);
}

#[test]
fn minimized_window_skips_the_frame() {
    let (mut renderer, scene) = small_renderer(1);
    renderer.device_mut().set_window_extent(Extent2d::new(0, 0));
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Minimized
    );
    assert!(renderer.device().trace_log().is_empty());
    renderer.device_mut().set_window_extent(SMALL_WINDOW);
    assert_eq!(
        renderer.render_frame(&scene, &camera()).unwrap(),
        FrameOutcome::Presented
    );
    finish(renderer, scene);
}

#[test]
fn scene_changes_rebuild_global_buffers() {
    let (mut renderer, mut scene) = small_renderer(1);
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    let model = scene.instances()[1].model;
    let _ = scene.add_instance(model, Mat4::from_translation(Vec3::X * 2.0));
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    assert_eq!(renderer.stats().scene_rebuilds, 1);
    assert_eq!(renderer.tlas().last_records().len(), 3);
    let log = renderer.device().trace_log();
    assert_eq!(log[1].instance_count, 3);
    assert_eq!(log[1].accumulated, 0);
    finish(renderer, scene);
}

#[test]
fn on_change_policy_skips_unchanged_frames() {
    let mut lazy = options();
    lazy.ray_tracing.tlas_rebuild = TlasRebuildPolicy::OnChange;
    let (mut renderer, mut scene) =
        renderer_with(HeadlessDevice::with_window(SMALL_WINDOW), lazy, 2);
    for _ in 0..3 {
        let _ = renderer.render_frame(&scene, &camera()).unwrap();
    }
    assert_eq!((renderer.stats().tlas_builds, renderer.stats().tlas_skips), (1, 2));

    let moved = scene.instances()[1].id;
    assert!(scene.set_transform(moved, Mat4::from_translation(Vec3::Y)));
    let _ = renderer.render_frame(&scene, &camera()).unwrap();
    assert_eq!(renderer.stats().tlas_builds, 2);
    finish(renderer, scene);
}

#[test]
fn shutdown_releases_every_object() {
    let (mut renderer, scene) = small_renderer(2);
    let _ = run_frames(&mut renderer, &scene, &camera(), 3);
    let mut ctx = renderer.shutdown();
    assert_eq!(ctx.device.pending_submissions(), 0);
    scene.destroy(&mut ctx);
    assert_eq!(ctx.device.live_objects(), 0);
    assert_eq!(ctx.allocator.live_buffers(), 0);
    assert_eq!(ctx.allocator.live_images(), 0);
    assert!(ctx.device.validation_errors().is_empty());
}
