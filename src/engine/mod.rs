//! The hybrid renderer: owns every pass and drives one frame at a time.
//!
//! [`HybridRenderer::render_frame`] walks the frame slot through wait,
//! acquire, record, submit and present. Stale surfaces run the resize
//! protocol in `resize.rs`; `frame_loop.rs` drives many frames.

mod accessors;
mod frame_loop;
mod resize;
#[cfg(test)]
mod tests;

pub use frame_loop::{run_frames, FrameStats, LoopExit};

use crate::camera::CameraState;
use crate::error::PrismError;
use crate::frame::FrameSlotManager;
use crate::gpu::{
    Buffer, BufferDesc, BufferUsage, Extent2d, GpuContext, GpuDevice,
    GpuError, LayoutTracker, MemoryLocation, PresentOutcome, ShaderLibrary,
    SwapchainInfo,
};
use crate::options::Options;
use crate::renderer::uniforms::{LightingPushConstants, SceneUniform};
use crate::renderer::{
    CompositeSource, Compositor, FrameAccumulator, GeometryPass,
    RayTracingPass,
};
use crate::scene::SceneProvider;

/// Surface size used when the window system reports none.
const FALLBACK_SURFACE_EXTENT: Extent2d = Extent2d::new(800, 600);

/// What happened to one call of [`HybridRenderer::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the surface.
    Presented,
    /// The frame was submitted, then the surface turned out stale and was
    /// rebuilt.
    Resized,
    /// The surface was out of date at acquire; it was rebuilt and nothing
    /// was recorded.
    Dropped,
    /// The window has no area; nothing was done.
    Minimized,
}

/// The hybrid frame pipeline: G-buffer raster pass, ray-traced lighting
/// with temporal accumulation, and composition onto the surface.
///
/// Owns the [`GpuContext`] and every GPU object it creates. Scenes are
/// passed in per frame; their assets stay owned by the caller.
#[derive(Debug)]
pub struct HybridRenderer<D: GpuDevice> {
    ctx: GpuContext<D>,
    library: ShaderLibrary,
    options: Options,
    tracker: LayoutTracker,
    slots: FrameSlotManager,
    swapchain: SwapchainInfo,
    scene_uniform: Buffer,
    geometry: GeometryPass,
    raytrace: RayTracingPass,
    accumulator: FrameAccumulator,
    compositor: Compositor,
    stats: FrameStats,
    last_camera: Option<CameraState>,
    mesh_set_version: u64,
    transform_version: u64,
}

impl<D: GpuDevice> HybridRenderer<D> {
    /// Configure the surface and build every pass for `scene`.
    ///
    /// # Errors
    ///
    /// Every failure is fatal: missing shader programs, a scene exceeding
    /// `ray_tracing.max_meshes`, or device failure.
    pub fn new<S: SceneProvider + ?Sized>(
        mut ctx: GpuContext<D>,
        options: Options,
        scene: &S,
    ) -> Result<Self, PrismError> {
        let library =
            ShaderLibrary::load_pipeline_programs(&options.shaders.directory)?;
        let window = ctx
            .device
            .current_surface_extent()
            .filter(|extent| !extent.is_empty())
            .unwrap_or(FALLBACK_SURFACE_EXTENT);
        let swapchain = ctx.device.configure_surface(window)?;
        let slots = FrameSlotManager::new(&mut ctx.device, swapchain.images.len())?;
        let scene_uniform = ctx.create_buffer(&BufferDesc {
            label: "scene uniform",
            size: SceneUniform::SIZE,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })?;

        let render_extent = window.scaled(options.render.render_scale);
        let mut tracker = LayoutTracker::new();
        let geometry =
            GeometryPass::new(&mut ctx, &library, scene_uniform.id(), render_extent)?;
        let raytrace = RayTracingPass::new(
            &mut ctx,
            &library,
            &mut tracker,
            &options.ray_tracing,
            scene,
            scene_uniform.id(),
            geometry.gbuffer(),
        )?;
        let compositor = Compositor::new(
            &mut ctx,
            &library,
            swapchain.format,
            swapchain.extent,
            scene_uniform.id(),
            geometry.gbuffer(),
        )?;

        log::info!(
            "renderer created: surface {} {:?}, render {}, ray tracing {}",
            swapchain.extent,
            swapchain.format,
            render_extent,
            if options.render.ray_tracing { "on" } else { "off" }
        );
        Ok(Self {
            ctx,
            library,
            options,
            tracker,
            slots,
            swapchain,
            scene_uniform,
            geometry,
            raytrace,
            accumulator: FrameAccumulator::new(),
            compositor,
            stats: FrameStats::default(),
            last_camera: None,
            mesh_set_version: scene.mesh_set_version(),
            transform_version: scene.transform_version(),
        })
    }

    /// Record, submit and present one frame of `scene` seen from
    /// `camera`.
    ///
    /// Stale surfaces are handled here by running the resize protocol;
    /// they are reported through the [`FrameOutcome`], never as errors.
    ///
    /// # Errors
    ///
    /// Fatal failures only (device loss, validation, capacity). The
    /// renderer should be shut down afterwards.
    pub fn render_frame<S: SceneProvider + ?Sized>(
        &mut self,
        scene: &S,
        camera: &CameraState,
    ) -> Result<FrameOutcome, PrismError> {
        if self
            .ctx
            .device
            .current_surface_extent()
            .is_some_and(Extent2d::is_empty)
        {
            return Ok(FrameOutcome::Minimized);
        }
        self.sync_scene(scene)?;
        if self.last_camera.as_ref() != Some(camera) {
            self.accumulator.reset();
            self.last_camera = Some(*camera);
        }

        self.slots.begin_frame(&mut self.ctx.device)?;
        let Some(image_index) = self.slots.acquire_target(&mut self.ctx.device)?
        else {
            self.stats.dropped += 1;
            self.resize_to_window()?;
            return Ok(FrameOutcome::Dropped);
        };
        self.record_frame(scene, camera, image_index)?;
        self.slots.submit(&mut self.ctx.device)?;
        let outcome = self.slots.present(&mut self.ctx.device)?;

        if outcome != PresentOutcome::OutOfDate {
            self.stats.presented += 1;
        }
        if outcome.needs_resize() {
            self.resize_to_window()?;
            return Ok(FrameOutcome::Resized);
        }
        Ok(FrameOutcome::Presented)
    }

    /// Apply new runtime toggles.
    ///
    /// A render-scale change runs the resize protocol. Toggling ray
    /// tracing only switches the composite source. Texture capacity, seed
    /// and shader directory are read at construction and ignored here.
    ///
    /// # Errors
    ///
    /// Failure of the resize protocol.
    pub fn set_options(&mut self, options: Options) -> Result<(), PrismError> {
        let previous = std::mem::replace(&mut self.options, options);
        let current = &self.options;
        if previous.render.ray_tracing != current.render.ray_tracing {
            log::info!(
                "ray tracing {}",
                if current.render.ray_tracing { "on" } else { "off" }
            );
            self.accumulator.reset();
        }
        if previous.render.samples_per_pixel != current.render.samples_per_pixel
            || previous.ray_tracing.max_recursion_depth
                != current.ray_tracing.max_recursion_depth
        {
            self.accumulator.reset();
        }
        if previous.ray_tracing.tlas_rebuild != current.ray_tracing.tlas_rebuild {
            self.raytrace
                .tlas_mut()
                .set_policy(current.ray_tracing.tlas_rebuild);
        }
        if previous.ray_tracing.max_meshes != current.ray_tracing.max_meshes
            || previous.ray_tracing.seed != current.ray_tracing.seed
            || previous.shaders != current.shaders
        {
            log::warn!(
                "texture capacity, seed and shader directory apply to the next \
                 renderer only"
            );
        }
        if (previous.render.render_scale - current.render.render_scale).abs()
            > f32::EPSILON
        {
            self.resize(self.swapchain.extent)?;
        }
        Ok(())
    }

    /// Wait for the GPU and release every object the renderer created,
    /// in reverse creation order. Returns the context so the caller can
    /// release the scene assets it owns.
    #[must_use]
    pub fn shutdown(self) -> GpuContext<D> {
        let Self {
            mut ctx,
            mut tracker,
            slots,
            scene_uniform,
            geometry,
            raytrace,
            compositor,
            stats,
            ..
        } = self;
        if let Err(e) = ctx.device.wait_idle() {
            log::error!("wait for idle at shutdown failed: {e}");
        }
        compositor.destroy(&mut ctx);
        raytrace.destroy(&mut ctx, &mut tracker);
        geometry.destroy(&mut ctx, &mut tracker);
        ctx.destroy_buffer(scene_uniform);
        slots.destroy(&mut ctx.device);
        log::info!(
            "renderer shut down after {} presented frames, {} resizes",
            stats.presented,
            stats.resizes
        );
        ctx
    }

    fn sync_scene<S: SceneProvider + ?Sized>(
        &mut self,
        scene: &S,
    ) -> Result<(), PrismError> {
        let mesh_set_version = scene.mesh_set_version();
        if mesh_set_version != self.mesh_set_version {
            self.ctx.device.wait_idle()?;
            self.raytrace.rebuild_scene(&mut self.ctx, scene)?;
            self.mesh_set_version = mesh_set_version;
            self.stats.scene_rebuilds += 1;
            self.accumulator.reset();
            log::info!(
                "scene rebuilt: {} meshes, {} instances",
                scene.meshes().len(),
                scene.instances().len()
            );
        }
        let transform_version = scene.transform_version();
        if transform_version != self.transform_version {
            self.transform_version = transform_version;
            self.accumulator.reset();
        }
        Ok(())
    }

    fn record_frame<S: SceneProvider + ?Sized>(
        &mut self,
        scene: &S,
        camera: &CameraState,
        image_index: u32,
    ) -> Result<(), PrismError> {
        let slot = self.slots.slot_index();
        let frame_counter = self.slots.frame_counter() as u32;
        let target = self
            .swapchain
            .images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidHandle(format!("swapchain image {image_index}"))
            })?;
        let uniform = SceneUniform::new(
            camera,
            self.options.ray_tracing.max_recursion_depth,
            self.options.render.samples_per_pixel,
        );
        let scene_uniform = self.scene_uniform.id();

        let commands = self.slots.commands_mut()?;
        commands.update_buffer(scene_uniform, 0, bytemuck::bytes_of(&uniform));
        self.geometry.record(
            &mut self.ctx,
            commands,
            &mut self.tracker,
            scene,
            frame_counter,
        )?;
        let source = if self.options.render.ray_tracing {
            self.raytrace.record(
                &mut self.ctx,
                commands,
                &mut self.tracker,
                scene,
                slot,
                frame_counter,
                self.accumulator.frames(),
            )?;
            let current = self.raytrace.outputs().current();
            let previous = self.raytrace.outputs().previous();
            self.accumulator
                .record(commands, &mut self.tracker, current, previous);
            CompositeSource::RayTraced(current)
        } else {
            CompositeSource::Rasterized
        };
        self.compositor.record(
            commands,
            &mut self.tracker,
            target,
            source,
            LightingPushConstants::new(
                frame_counter,
                self.options.render.clear_color,
            ),
        );
        Ok(())
    }
}
