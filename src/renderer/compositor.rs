//! Final composition onto the swapchain image.
//!
//! With ray tracing on, the trace output is blitted onto the surface. With
//! it off, a full-screen lighting pass reads the G-buffer and writes the
//! surface directly.

use super::gbuffer::GBuffer;
use super::uniforms::LightingPushConstants;
use crate::error::PrismError;
use crate::gpu::shader_library::LIGHTING_PASS;
use crate::gpu::{
    BindingKind, BindingLayout, BindingLayoutEntry, BindingResource,
    BindingTableId, BindingWrite, BufferId, ColorTarget, Command, CommandList,
    Extent2d, Filter, GpuContext, GpuDevice, ImageFormat, ImageId,
    ImageLayout, LayoutTracker, PipelineDesc, PipelineId, ShaderLibrary,
    ShaderStage,
};

/// Slots of the lighting composite's binding table.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightingBinding {
    /// G-buffer depth.
    Depth = 0,
    /// G-buffer normal.
    Normal = 1,
    /// G-buffer albedo.
    Albedo = 2,
    /// Per-frame scene uniform.
    SceneUniform = 3,
}

/// What the compositor presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeSource {
    /// Blit the trace output.
    RayTraced(ImageId),
    /// Run the lighting composite over the G-buffer.
    Rasterized,
}

/// Writes the presentable surface image.
#[derive(Debug)]
pub struct Compositor {
    pipeline: PipelineId,
    layout: BindingLayout,
    table: BindingTableId,
    surface_format: ImageFormat,
    extent: Extent2d,
    scene_uniform: BufferId,
}

impl Compositor {
    /// Create the lighting pipeline for a surface.
    ///
    /// # Errors
    ///
    /// Missing programs or device failure.
    pub fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        surface_format: ImageFormat,
        extent: Extent2d,
        scene_uniform: BufferId,
        gbuffer: &GBuffer,
    ) -> Result<Self, PrismError> {
        let sampled = |binding: LightingBinding| BindingLayoutEntry {
            slot: binding as u32,
            kind: BindingKind::SampledImage,
            count: 1,
        };
        let layout = BindingLayout {
            entries: vec![
                sampled(LightingBinding::Depth),
                sampled(LightingBinding::Normal),
                sampled(LightingBinding::Albedo),
                BindingLayoutEntry {
                    slot: LightingBinding::SceneUniform as u32,
                    kind: BindingKind::UniformBuffer,
                    count: 1,
                },
            ],
        };
        let pipeline =
            Self::create_pipeline(ctx, library, &layout, surface_format, extent)?;
        let table = ctx.device.create_binding_table(&layout)?;
        let compositor = Self {
            pipeline,
            layout,
            table,
            surface_format,
            extent,
            scene_uniform,
        };
        ctx.device.update_binding_table(table, &[BindingWrite {
            slot: LightingBinding::SceneUniform as u32,
            resource: BindingResource::UniformBuffer(scene_uniform),
        }])?;
        compositor.rebind(ctx, gbuffer)?;
        Ok(compositor)
    }

    /// Surface extent the pipeline was built for.
    #[must_use]
    pub const fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Record the composite into `target` and leave it ready to present.
    pub fn record(
        &self,
        commands: &mut CommandList,
        tracker: &mut LayoutTracker,
        target: ImageId,
        source: CompositeSource,
        push: LightingPushConstants,
    ) {
        match source {
            CompositeSource::RayTraced(current) => {
                let _ = tracker.transition(commands, current, ImageLayout::TransferSrc);
                commands.image_barrier(
                    target,
                    ImageLayout::Undefined,
                    ImageLayout::TransferDst,
                );
                commands.push(Command::BlitImage {
                    src: current,
                    dst: target,
                    filter: Filter::Linear,
                });
                commands.image_barrier(
                    target,
                    ImageLayout::TransferDst,
                    ImageLayout::PresentSrc,
                );
            }
            CompositeSource::Rasterized => {
                commands.image_barrier(
                    target,
                    ImageLayout::Undefined,
                    ImageLayout::ColorAttachment,
                );
                commands.push(Command::BeginRenderPass {
                    color: vec![ColorTarget {
                        image: target,
                        clear: Some(push.clear_color),
                    }],
                    depth: None,
                    extent: self.extent,
                });
                commands.push(Command::BindPipeline(self.pipeline));
                commands.push(Command::BindBindingTable(self.table));
                commands.push_constants(bytemuck::bytes_of(&push));
                commands.push(Command::DrawFullscreen);
                commands.push(Command::EndRenderPass);
                commands.image_barrier(
                    target,
                    ImageLayout::ColorAttachment,
                    ImageLayout::PresentSrc,
                );
            }
        }
    }

    /// Point the lighting table at a (re)created G-buffer. The queue must
    /// be idle.
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn rebind<D: GpuDevice>(
        &self,
        ctx: &mut GpuContext<D>,
        gbuffer: &GBuffer,
    ) -> Result<(), PrismError> {
        let sampled = |binding: LightingBinding, image| BindingWrite {
            slot: binding as u32,
            resource: BindingResource::SampledImage {
                image,
                filter: Filter::Nearest,
            },
        };
        ctx.device.update_binding_table(self.table, &[
            sampled(LightingBinding::Depth, gbuffer.depth()),
            sampled(LightingBinding::Normal, gbuffer.normal()),
            sampled(LightingBinding::Albedo, gbuffer.albedo()),
        ])?;
        Ok(())
    }

    /// Rebuild the extent-sized pipeline for a new surface. The queue must
    /// be idle.
    ///
    /// # Errors
    ///
    /// Missing programs or device failure.
    pub fn resize<D: GpuDevice>(
        &mut self,
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        surface_format: ImageFormat,
        extent: Extent2d,
    ) -> Result<(), PrismError> {
        ctx.device.destroy_pipeline(self.pipeline);
        self.pipeline =
            Self::create_pipeline(ctx, library, &self.layout, surface_format, extent)?;
        self.surface_format = surface_format;
        self.extent = extent;
        log::debug!("compositor rebuilt for {extent} {surface_format:?}");
        Ok(())
    }

    /// Surface format the pipeline writes.
    #[must_use]
    pub const fn surface_format(&self) -> ImageFormat {
        self.surface_format
    }

    /// Scene uniform bound into the lighting table.
    #[must_use]
    pub const fn scene_uniform(&self) -> BufferId {
        self.scene_uniform
    }

    /// Release the pipeline and table.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut GpuContext<D>) {
        ctx.device.destroy_binding_table(self.table);
        ctx.device.destroy_pipeline(self.pipeline);
    }

    fn create_pipeline<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        layout: &BindingLayout,
        surface_format: ImageFormat,
        extent: Extent2d,
    ) -> Result<PipelineId, PrismError> {
        Ok(ctx.device.create_pipeline(&PipelineDesc::Graphics {
            label: "lighting",
            vertex: library.get(LIGHTING_PASS, ShaderStage::Vertex)?,
            fragment: library.get(LIGHTING_PASS, ShaderStage::Fragment)?,
            color_formats: vec![surface_format],
            depth_format: None,
            extent,
            bindings: layout,
            push_constant_size: size_of::<LightingPushConstants>()
                as u32,
        })?)
    }
}
