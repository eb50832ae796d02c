//! Geometry pass: rasterizes every instance into the G-buffer.

use glam::Mat4;

use super::uniforms::DrawPushConstants;
use crate::error::PrismError;
use crate::gpu::shader_library::GEOMETRY_PASS;
use crate::gpu::{
    BindingKind, BindingLayout, BindingLayoutEntry, BindingResource,
    BindingTableId, BindingWrite, Buffer, BufferDesc, BufferId, BufferUsage,
    ColorTarget, Command, CommandList, DepthTarget, Extent2d, GpuContext,
    GpuDevice, Image, ImageDesc, ImageFormat, ImageId, ImageLayout,
    ImageUsage, LayoutTracker, MemoryLocation, PipelineDesc, PipelineId,
    ShaderLibrary, ShaderStage,
};
use crate::scene::SceneProvider;

/// Depth format of the G-buffer.
pub const DEPTH_FORMAT: ImageFormat = ImageFormat::Depth32Float;
/// Normal format of the G-buffer.
pub const NORMAL_FORMAT: ImageFormat = ImageFormat::Rgba16Float;
/// Albedo format of the G-buffer.
pub const ALBEDO_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;

const SCENE_UNIFORM_SLOT: u32 = 0;
const TRANSFORMS_SLOT: u32 = 1;
const MIN_TRANSFORMS: u32 = 16;
const TRANSFORM_SIZE: u64 = size_of::<Mat4>() as u64;

/// Depth, normal and albedo targets at render resolution.
#[derive(Debug)]
pub struct GBuffer {
    depth: Image,
    normal: Image,
    albedo: Image,
}

impl GBuffer {
    fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        extent: Extent2d,
    ) -> Result<Self, PrismError> {
        let target = |format: ImageFormat| ImageDesc {
            label: "g-buffer",
            extent,
            format,
            usage: if format.is_depth() {
                ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED
            } else {
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED
            },
        };
        let depth = ctx.create_image(&target(DEPTH_FORMAT))?;
        let normal = ctx.create_image(&target(NORMAL_FORMAT))?;
        let albedo = ctx.create_image(&target(ALBEDO_FORMAT))?;
        Ok(Self {
            depth,
            normal,
            albedo,
        })
    }

    /// Render resolution.
    #[must_use]
    pub fn extent(&self) -> Extent2d {
        self.depth.extent()
    }

    /// Depth target.
    #[must_use]
    pub fn depth(&self) -> ImageId {
        self.depth.id()
    }

    /// Normal target.
    #[must_use]
    pub fn normal(&self) -> ImageId {
        self.normal.id()
    }

    /// Albedo target.
    #[must_use]
    pub fn albedo(&self) -> ImageId {
        self.albedo.id()
    }

    fn destroy<D: GpuDevice>(
        self,
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
    ) {
        for image in [self.albedo, self.normal, self.depth] {
            tracker.forget(image.id());
            ctx.destroy_image(image);
        }
    }
}

/// Rasterizes the scene into a [`GBuffer`].
#[derive(Debug)]
pub struct GeometryPass {
    gbuffer: GBuffer,
    pipeline: PipelineId,
    layout: BindingLayout,
    table: BindingTableId,
    scene_uniform: BufferId,
    transforms: Buffer,
    transform_capacity: u32,
}

impl GeometryPass {
    /// Create targets, pipeline and binding table.
    ///
    /// # Errors
    ///
    /// Missing programs or device failure.
    pub fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        scene_uniform: BufferId,
        extent: Extent2d,
    ) -> Result<Self, PrismError> {
        let layout = BindingLayout {
            entries: vec![
                BindingLayoutEntry {
                    slot: SCENE_UNIFORM_SLOT,
                    kind: BindingKind::UniformBuffer,
                    count: 1,
                },
                BindingLayoutEntry {
                    slot: TRANSFORMS_SLOT,
                    kind: BindingKind::StorageBuffer,
                    count: 1,
                },
            ],
        };
        let gbuffer = GBuffer::new(ctx, extent)?;
        let pipeline = Self::create_pipeline(ctx, library, &layout, extent)?;
        let transforms = Self::allocate_transforms(ctx, MIN_TRANSFORMS)?;
        let table = ctx.device.create_binding_table(&layout)?;
        let pass = Self {
            gbuffer,
            pipeline,
            layout,
            table,
            scene_uniform,
            transforms,
            transform_capacity: MIN_TRANSFORMS,
        };
        pass.write_table(ctx)?;
        Ok(pass)
    }

    /// The G-buffer targets.
    #[must_use]
    pub const fn gbuffer(&self) -> &GBuffer {
        &self.gbuffer
    }

    /// Render resolution.
    #[must_use]
    pub fn extent(&self) -> Extent2d {
        self.gbuffer.extent()
    }

    /// Record the pass. Afterwards every G-buffer image is shader-readable.
    ///
    /// # Errors
    ///
    /// [`PrismError::InvalidScene`] if an instance names an unknown model or
    /// a part names an unknown mesh or material; nothing is recorded then.
    /// Otherwise device failure while growing the transform buffer.
    pub fn record<D: GpuDevice, S: SceneProvider + ?Sized>(
        &mut self,
        ctx: &mut GpuContext<D>,
        commands: &mut CommandList,
        tracker: &mut LayoutTracker,
        scene: &S,
        frame_counter: u32,
    ) -> Result<(), PrismError> {
        let instances = scene.instances();
        let mut draws = Vec::new();
        for (index, instance) in instances.iter().enumerate() {
            let model = scene.model_of(instance).ok_or_else(|| {
                PrismError::InvalidScene(format!(
                    "instance {:?} uses unknown model {:?}",
                    instance.id, instance.model
                ))
            })?;
            for part in &model.parts {
                let mesh = scene.meshes().get(part.mesh.0 as usize);
                let material = scene.materials().get(part.material.0 as usize);
                let (Some(mesh), Some(material)) = (mesh, material) else {
                    return Err(PrismError::InvalidScene(format!(
                        "model part {part:?} references an unknown asset"
                    )));
                };
                draws.push((index as u32, mesh, material.base_color));
            }
        }
        if instances.len() as u32 > self.transform_capacity {
            self.grow_transforms(ctx, instances.len() as u32)?;
        }
        if !instances.is_empty() {
            let transforms: Vec<[[f32; 4]; 4]> = instances
                .iter()
                .map(|i| i.transform.to_cols_array_2d())
                .collect();
            commands.update_buffer(
                self.transforms.id(),
                0,
                bytemuck::cast_slice(&transforms),
            );
        }

        let gb = &self.gbuffer;
        tracker.discard(commands, gb.depth(), ImageLayout::DepthAttachment);
        tracker.discard(commands, gb.normal(), ImageLayout::ColorAttachment);
        tracker.discard(commands, gb.albedo(), ImageLayout::ColorAttachment);
        commands.push(Command::BeginRenderPass {
            color: vec![
                ColorTarget {
                    image: gb.normal(),
                    clear: Some([0.0; 4]),
                },
                ColorTarget {
                    image: gb.albedo(),
                    clear: Some([0.0; 4]),
                },
            ],
            depth: Some(DepthTarget {
                image: gb.depth(),
                clear: Some(1.0),
            }),
            extent: gb.extent(),
        });
        commands.push(Command::BindPipeline(self.pipeline));
        commands.push(Command::BindBindingTable(self.table));
        for (index, mesh, base_color) in draws {
            let push = DrawPushConstants::new(frame_counter, index, base_color);
            commands.push_constants(bytemuck::bytes_of(&push));
            commands.push(Command::Draw {
                vertex_buffer: mesh.vertex_buffer(),
                index_buffer: mesh.index_buffer(),
                index_count: mesh.index_count(),
            });
        }
        commands.push(Command::EndRenderPass);
        for image in [gb.depth(), gb.normal(), gb.albedo()] {
            let _ = tracker.transition(commands, image, ImageLayout::ShaderReadOnly);
        }
        Ok(())
    }

    /// Rebuild the targets and the extent-sized pipeline. The queue must be
    /// idle.
    ///
    /// # Errors
    ///
    /// Missing programs or device failure.
    pub fn resize<D: GpuDevice>(
        &mut self,
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        tracker: &mut LayoutTracker,
        extent: Extent2d,
    ) -> Result<(), PrismError> {
        ctx.device.destroy_pipeline(self.pipeline);
        let gbuffer = GBuffer::new(ctx, extent)?;
        std::mem::replace(&mut self.gbuffer, gbuffer).destroy(ctx, tracker);
        self.pipeline = Self::create_pipeline(ctx, library, &self.layout, extent)?;
        Ok(())
    }

    /// Release every object.
    pub fn destroy<D: GpuDevice>(
        self,
        ctx: &mut GpuContext<D>,
        tracker: &mut LayoutTracker,
    ) {
        ctx.device.destroy_binding_table(self.table);
        ctx.destroy_buffer(self.transforms);
        ctx.device.destroy_pipeline(self.pipeline);
        self.gbuffer.destroy(ctx, tracker);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn create_pipeline<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        library: &ShaderLibrary,
        layout: &BindingLayout,
        extent: Extent2d,
    ) -> Result<PipelineId, PrismError> {
        Ok(ctx.device.create_pipeline(&PipelineDesc::Graphics {
            label: "geometry",
            vertex: library.get(GEOMETRY_PASS, ShaderStage::Vertex)?,
            fragment: library.get(GEOMETRY_PASS, ShaderStage::Fragment)?,
            color_formats: vec![NORMAL_FORMAT, ALBEDO_FORMAT],
            depth_format: Some(DEPTH_FORMAT),
            extent,
            bindings: layout,
            push_constant_size: size_of::<DrawPushConstants>() as u32,
        })?)
    }

    fn allocate_transforms<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        capacity: u32,
    ) -> Result<Buffer, PrismError> {
        Ok(ctx.create_buffer(&BufferDesc {
            label: "instance transforms",
            size: u64::from(capacity) * TRANSFORM_SIZE,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })?)
    }

    fn grow_transforms<D: GpuDevice>(
        &mut self,
        ctx: &mut GpuContext<D>,
        needed: u32,
    ) -> Result<(), PrismError> {
        let capacity = needed.next_power_of_two().max(MIN_TRANSFORMS);
        log::debug!(
            "transform buffer {} -> {capacity} instances",
            self.transform_capacity
        );
        ctx.device.wait_idle()?;
        let grown = Self::allocate_transforms(ctx, capacity)?;
        ctx.destroy_buffer(std::mem::replace(&mut self.transforms, grown));
        self.transform_capacity = capacity;
        self.write_table(ctx)
    }

    fn write_table<D: GpuDevice>(
        &self,
        ctx: &mut GpuContext<D>,
    ) -> Result<(), PrismError> {
        ctx.device.update_binding_table(
            self.table,
            &[
                BindingWrite {
                    slot: SCENE_UNIFORM_SLOT,
                    resource: BindingResource::UniformBuffer(self.scene_uniform),
                },
                BindingWrite {
                    slot: TRANSFORMS_SLOT,
                    resource: BindingResource::StorageBuffer(self.transforms.id()),
                },
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::scene::assets::demo_scene;
    use crate::scene::ModelId;

    fn library() -> ShaderLibrary {
        ShaderLibrary::load_pipeline_programs(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/shaders"
        ))
        .unwrap()
    }

    fn uniform(ctx: &mut GpuContext<HeadlessDevice>) -> Buffer {
        ctx.create_buffer(&BufferDesc {
            label: "scene uniform",
            size: 288,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })
        .unwrap()
    }

    #[test]
    fn draws_cover_the_gbuffer() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut tracker = LayoutTracker::new();
        let scene = demo_scene(&mut ctx, 1).unwrap();
        let uniform = uniform(&mut ctx);
        let mut pass =
            GeometryPass::new(&mut ctx, &library(), uniform.id(), Extent2d::new(8, 4))
                .unwrap();
        let mut commands = CommandList::new();
        pass.record(&mut ctx, &mut commands, &mut tracker, &scene, 0)
            .unwrap();
        ctx.one_shot(|c| c.extend(commands.iter().cloned())).unwrap();

        let gb = pass.gbuffer();
        let depth = ctx.device.image_texels(gb.depth()).unwrap();
        assert!(depth.iter().all(|t| t[0] == 0.5));
        let albedo = ctx.device.image_texels(gb.albedo()).unwrap();
        assert!(albedo[0][3] > 0.0);
        for image in [gb.depth(), gb.normal(), gb.albedo()] {
            assert_eq!(
                ctx.device.image_layout(image),
                Some(ImageLayout::ShaderReadOnly)
            );
        }
        pass.destroy(&mut ctx, &mut tracker);
        ctx.destroy_buffer(uniform);
        scene.destroy(&mut ctx);
        assert!(ctx.device.validation_errors().is_empty());
    }

    #[test]
    fn unknown_model_fails_without_recording() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut tracker = LayoutTracker::new();
        let mut scene = demo_scene(&mut ctx, 1).unwrap();
        let _ = scene.add_instance(ModelId(99), Mat4::IDENTITY);
        let uniform = uniform(&mut ctx);
        let mut pass =
            GeometryPass::new(&mut ctx, &library(), uniform.id(), Extent2d::new(4, 4))
                .unwrap();
        let mut commands = CommandList::new();
        let result = pass.record(&mut ctx, &mut commands, &mut tracker, &scene, 0);
        assert!(matches!(result, Err(PrismError::InvalidScene(_))));
        assert!(commands.is_empty());
        assert_eq!(
            tracker.layout(pass.gbuffer().depth()),
            ImageLayout::Undefined
        );
        pass.destroy(&mut ctx, &mut tracker);
        ctx.destroy_buffer(uniform);
        scene.destroy(&mut ctx);
    }

    #[test]
    fn resize_recreates_targets() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut tracker = LayoutTracker::new();
        let library = library();
        let uniform = uniform(&mut ctx);
        let mut pass =
            GeometryPass::new(&mut ctx, &library, uniform.id(), Extent2d::new(8, 4))
                .unwrap();
        let old = pass.gbuffer().depth();
        pass.resize(&mut ctx, &library, &mut tracker, Extent2d::new(16, 8))
            .unwrap();
        assert_eq!(pass.extent(), Extent2d::new(16, 8));
        assert_eq!(ctx.device.image_extent(old), None);
        pass.destroy(&mut ctx, &mut tracker);
        ctx.destroy_buffer(uniform);
        assert_eq!(ctx.device.live_objects(), 0);
    }

    #[test]
    fn transform_buffer_grows_with_the_scene() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut tracker = LayoutTracker::new();
        let mut scene = demo_scene(&mut ctx, 1).unwrap();
        let model = scene.instances()[1].model;
        for _ in 0..40 {
            let _ = scene.add_instance(model, Mat4::IDENTITY);
        }
        let uniform = uniform(&mut ctx);
        let mut pass =
            GeometryPass::new(&mut ctx, &library(), uniform.id(), Extent2d::new(4, 4))
                .unwrap();
        let mut commands = CommandList::new();
        pass.record(&mut ctx, &mut commands, &mut tracker, &scene, 0)
            .unwrap();
        assert_eq!(pass.transform_capacity, 64);
        ctx.one_shot(|c| c.extend(commands.iter().cloned())).unwrap();
        pass.destroy(&mut ctx, &mut tracker);
        ctx.destroy_buffer(uniform);
        scene.destroy(&mut ctx);
        assert!(ctx.device.validation_errors().is_empty());
    }
}
