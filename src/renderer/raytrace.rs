//! Ray tracing pass: owns the binding table, the shader binding table, the
//! output image pair and the acceleration-structure and scene-buffer
//! state the trace reads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::acceleration::TlasBuilder;
use super::binding_table::{self, ImageBindings, SceneBindings};
use super::gbuffer::GBuffer;
use super::sbt::ShaderBindingTable;
use super::scene_buffers::{SceneBuffers, SceneLayout};
use super::uniforms::TracePushConstants;
use crate::error::PrismError;
use crate::gpu::shader_library::RAYTRACE_PASS;
use crate::gpu::{
    BindingLayout, BindingTableId, BufferId, Command, CommandList, Extent2d,
    GpuContext, GpuDevice, Image, ImageDesc, ImageFormat, ImageId,
    ImageLayout, ImageUsage, LayoutTracker, PipelineDesc, PipelineId,
    ShaderLibrary, ShaderStage,
};
use crate::options::RayTracingOptions;
use crate::scene::assets::solid_texture;
use crate::scene::SceneProvider;

/// Format of the output pair.
pub const OUTPUT_FORMAT: ImageFormat = ImageFormat::Rgba16Float;

/// Ping-pong output images at render resolution.
#[derive(Debug)]
pub struct OutputPair {
    current: Image,
    previous: Image,
}

impl OutputPair {
    fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
        extent: Extent2d,
    ) -> Result<Self, PrismError> {
        let desc = |label: &'static str| ImageDesc {
            label,
            extent,
            format: OUTPUT_FORMAT,
            usage: ImageUsage::STORAGE
                | ImageUsage::SAMPLED
                | ImageUsage::TRANSFER_SRC
                | ImageUsage::TRANSFER_DST,
        };
        let current = ctx.create_image(&desc("trace output"))?;
        let previous = ctx.create_image(&desc("previous frame"))?;
        let pair = Self { current, previous };

        let (current, previous) = (pair.current(), pair.previous());
        let mut init = CommandList::new();
        tracker.discard(&mut init, previous, ImageLayout::TransferDst);
        init.push(Command::ClearImage {
            image: previous,
            color: [0.0; 4],
        });
        let _ = tracker.transition(&mut init, previous, ImageLayout::ShaderReadOnly);
        tracker.discard(&mut init, current, ImageLayout::General);
        ctx.one_shot(|commands| commands.extend(init.iter().cloned()))?;
        Ok(pair)
    }

    /// Image the trace writes.
    #[must_use]
    pub fn current(&self) -> ImageId {
        self.current.id()
    }

    /// Image the trace reads as the accumulated history.
    #[must_use]
    pub fn previous(&self) -> ImageId {
        self.previous.id()
    }

    /// Render resolution.
    #[must_use]
    pub fn extent(&self) -> Extent2d {
        self.current.extent()
    }

    fn destroy<D: GpuDevice>(
        self,
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
    ) {
        for image in [self.previous, self.current] {
            tracker.forget(image.id());
            ctx.destroy_image(image);
        }
    }
}

/// The trace dispatch and everything it binds.
#[derive(Debug)]
pub struct RayTracingPass {
    pipeline: PipelineId,
    layout: BindingLayout,
    table: BindingTableId,
    sbt: ShaderBindingTable,
    outputs: OutputPair,
    tlas: TlasBuilder,
    scene_buffers: SceneBuffers,
    fallback: Image,
    scene_uniform: BufferId,
    max_meshes: u32,
    rng: StdRng,
}

impl RayTracingPass {
    /// Build the pipeline, tables, outputs and scene buffers, and write
    /// every binding.
    ///
    /// # Errors
    ///
    /// Missing programs, capacity or device failure.
    pub fn new<D: GpuDevice, S: SceneProvider + ?Sized>(
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        tracker: &mut LayoutTracker,
        options: &RayTracingOptions,
        scene: &S,
        scene_uniform: BufferId,
        gbuffer: &GBuffer,
    ) -> Result<Self, PrismError> {
        let layout = binding_table::layout(options.max_meshes);
        let pipeline = ctx.device.create_pipeline(&PipelineDesc::RayTracing {
            label: "raytrace",
            raygen: library.get(RAYTRACE_PASS, ShaderStage::RayGeneration)?,
            miss: library.get(RAYTRACE_PASS, ShaderStage::Miss)?,
            closest_hit: library.get(RAYTRACE_PASS, ShaderStage::ClosestHit)?,
            max_recursion_depth: options.max_recursion_depth,
            bindings: &layout,
            push_constant_size: size_of::<TracePushConstants>() as u32,
        })?;
        let sbt = ShaderBindingTable::new(ctx, pipeline)?;
        let fallback = solid_texture(ctx, [1.0; 4], "fallback texture")?;
        let tlas = TlasBuilder::new(ctx, options.tlas_rebuild)?;
        let scene_buffers = SceneBuffers::new(ctx, scene, options.max_meshes)?;
        let outputs = OutputPair::new(ctx, tracker, gbuffer.extent())?;
        let table = ctx.device.create_binding_table(&layout)?;
        let rng = options
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        let pass = Self {
            pipeline,
            layout,
            table,
            sbt,
            outputs,
            tlas,
            scene_buffers,
            fallback,
            scene_uniform,
            max_meshes: options.max_meshes,
            rng,
        };
        let mut writes = pass.scene_bindings().writes();
        writes.extend(pass.image_bindings(gbuffer).writes());
        ctx.device.update_binding_table(pass.table, &writes)?;
        log::info!(
            "ray tracing pass: {} texture slots, output {}",
            pass.max_meshes,
            pass.outputs.extent()
        );
        Ok(pass)
    }

    /// Output pair.
    #[must_use]
    pub const fn outputs(&self) -> &OutputPair {
        &self.outputs
    }

    /// Binding table of the trace.
    #[must_use]
    pub const fn table(&self) -> BindingTableId {
        self.table
    }

    /// Binding layout of the trace.
    #[must_use]
    pub const fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    /// TLAS state.
    #[must_use]
    pub const fn tlas(&self) -> &TlasBuilder {
        &self.tlas
    }

    /// TLAS state, for policy changes.
    pub fn tlas_mut(&mut self) -> &mut TlasBuilder {
        &mut self.tlas
    }

    /// Global scene buffers.
    #[must_use]
    pub const fn scene_buffers(&self) -> &SceneBuffers {
        &self.scene_buffers
    }

    /// Record the TLAS refresh and the trace dispatch.
    ///
    /// `frame_counter` counts every frame since startup. `accumulated` is
    /// the number of frames already blended into the previous image; 0
    /// restarts accumulation.
    ///
    /// # Errors
    ///
    /// TLAS refresh or binding-table rewrite failure.
    pub fn record<D: GpuDevice, S: SceneProvider + ?Sized>(
        &mut self,
        ctx: &mut GpuContext<D>,
        commands: &mut CommandList,
        tracker: &mut LayoutTracker,
        scene: &S,
        slot: usize,
        frame_counter: u32,
        accumulated: u32,
    ) -> Result<(), PrismError> {
        self.scene_buffers.record_instance_update(commands, scene);
        let update = self.tlas.record(ctx, commands, scene, slot)?;
        if update.reallocated {
            ctx.device.update_binding_table(
                self.table,
                &[binding_table::tlas_write(self.tlas.tlas())],
            )?;
        }

        let _ = tracker.transition(commands, self.outputs.current(), ImageLayout::General);
        let _ = tracker.transition(
            commands,
            self.outputs.previous(),
            ImageLayout::ShaderReadOnly,
        );
        commands.push(Command::BindPipeline(self.pipeline));
        commands.push(Command::BindBindingTable(self.table));
        let push =
            TracePushConstants::new(frame_counter, accumulated, self.rng.random());
        commands.push_constants(bytemuck::bytes_of(&push));
        commands.push(Command::TraceRays {
            regions: self.sbt.regions(),
            extent: self.outputs.extent(),
        });
        Ok(())
    }

    /// Recreate the output pair at the G-buffer's resolution and rewrite
    /// the image-valued bindings. The queue must be idle.
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn resize<D: GpuDevice>(
        &mut self,
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
        gbuffer: &GBuffer,
    ) -> Result<(), PrismError> {
        let outputs = OutputPair::new(ctx, tracker, gbuffer.extent())?;
        std::mem::replace(&mut self.outputs, outputs).destroy(ctx, tracker);
        ctx.device
            .update_binding_table(self.table, &self.image_bindings(gbuffer).writes())?;
        Ok(())
    }

    /// Rebuild the global scene buffers for a changed mesh set and rewrite
    /// the scene bindings. The queue must be idle.
    ///
    /// # Errors
    ///
    /// Capacity, scene or device failure.
    pub fn rebuild_scene<D: GpuDevice, S: SceneProvider + ?Sized>(
        &mut self,
        ctx: &mut GpuContext<D>,
        scene: &S,
    ) -> Result<(), PrismError> {
        let buffers = SceneBuffers::new(ctx, scene, self.max_meshes)?;
        std::mem::replace(&mut self.scene_buffers, buffers).destroy(ctx);
        self.tlas.invalidate();
        ctx.device
            .update_binding_table(self.table, &self.scene_bindings().writes())?;
        Ok(())
    }

    /// Release every object in reverse creation order.
    pub fn destroy<D: GpuDevice>(
        self,
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
    ) {
        ctx.device.destroy_binding_table(self.table);
        self.outputs.destroy(ctx, tracker);
        self.scene_buffers.destroy(ctx);
        self.tlas.destroy(ctx);
        ctx.destroy_image(self.fallback);
        self.sbt.destroy(ctx);
        ctx.device.destroy_pipeline(self.pipeline);
    }

    fn scene_bindings(&self) -> SceneBindings {
        let layout = self.scene_buffers.layout();
        let fallback = self.fallback.id();
        SceneBindings {
            tlas: self.tlas.tlas(),
            scene_uniform: self.scene_uniform,
            vertices: self.scene_buffers.vertices().id(),
            indices: self.scene_buffers.indices().id(),
            sub_meshes: self.scene_buffers.sub_meshes().id(),
            instances: self.scene_buffers.instances().id(),
            albedo_textures: SceneLayout::texture_array(
                &layout.albedo,
                self.max_meshes,
                fallback,
            ),
            aux_textures: SceneLayout::texture_array(
                &layout.aux,
                self.max_meshes,
                fallback,
            ),
        }
    }

    fn image_bindings(&self, gbuffer: &GBuffer) -> ImageBindings {
        ImageBindings {
            output: self.outputs.current(),
            depth: gbuffer.depth(),
            normal: gbuffer.normal(),
            albedo: gbuffer.albedo(),
            previous: self.outputs.previous(),
        }
    }
}
