//! Command replay and program emulation for [`HeadlessDevice`].

use bytemuck::Pod;

use super::{
    digest, HeadlessDevice, ImageState, PipelineState, Program,
    StructureState, TraceRecord,
};
use crate::gpu::command::{
    ColorTarget, Command, CommandList, DepthTarget, TraceRegions,
};
use crate::gpu::device::{GpuDevice as _, GpuError};
use crate::gpu::types::{
    AccelerationInstance, AccelerationStructureId, BindingKind, BindingResource, BindingTableId,
    BufferId, BufferUsage, Extent2d, ImageFormat, ImageId, ImageLayout,
    ImageUsage, PipelineId,
};
use crate::renderer::compositor::LightingBinding;
use crate::renderer::uniforms::{
    DrawPushConstants, LightingPushConstants, TracePushConstants, MISS_COLOR,
};
use crate::renderer::RtBinding;

/// Depth the emulated geometry program writes.
const GEOMETRY_DEPTH: f32 = 0.5;
/// Ambient term of the emulated lighting.
const AMBIENT: f32 = 0.1;

#[derive(Debug)]
struct RenderPass {
    color: Vec<ColorTarget>,
    depth: Option<DepthTarget>,
}

#[derive(Debug, Default)]
struct ExecState {
    pipeline: Option<PipelineId>,
    table: Option<BindingTableId>,
    push: Vec<u8>,
    pass: Option<RenderPass>,
}

fn validation(message: String) -> GpuError {
    GpuError::Validation(message)
}

/// Round a color to what `format` can store.
pub(super) fn quantize(format: ImageFormat, color: [f32; 4]) -> [f32; 4] {
    match format {
        ImageFormat::Rgba8Unorm | ImageFormat::Bgra8Unorm => {
            color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0)
        }
        ImageFormat::Rgba16Float => {
            color.map(|c| half::f16::from_f32(c).to_f32())
        }
        ImageFormat::Rgba32Float => color,
        ImageFormat::Depth32Float => [color[0], 0.0, 0.0, 0.0],
    }
}

/// Lambert term against a light along +Z.
fn shade(albedo: [f32; 4], normal: [f32; 4]) -> [f32; 4] {
    let lit = normal[2].clamp(0.0, 1.0);
    let factor = lit + AMBIENT * (1.0 - lit);
    [albedo[0] * factor, albedo[1] * factor, albedo[2] * factor, 1.0]
}

/// Nearest texel of `src` for pixel `(x, y)` of an image sized `dst`.
fn sample_nearest(
    texels: &[[f32; 4]],
    src: Extent2d,
    dst: Extent2d,
    x: u32,
    y: u32,
) -> [f32; 4] {
    let sx = (u64::from(x) * u64::from(src.width) / u64::from(dst.width)) as u32;
    let sy =
        (u64::from(y) * u64::from(src.height) / u64::from(dst.height)) as u32;
    texels[(sy * src.width + sx) as usize]
}

fn read_push<T: Pod>(push: &[u8]) -> Result<T, GpuError> {
    let size = size_of::<T>();
    if push.len() < size {
        return Err(validation(format!(
            "push constants hold {} bytes, program reads {size}",
            push.len()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(&push[..size]))
}

impl HeadlessDevice {
    /// Replay a submitted list.
    pub(super) fn execute(
        &mut self,
        commands: &CommandList,
    ) -> Result<(), GpuError> {
        let mut state = ExecState::default();
        for command in commands {
            self.execute_one(&mut state, command)?;
        }
        if state.pass.is_some() {
            return Err(validation(
                "command list ends inside a render pass".into(),
            ));
        }
        Ok(())
    }

    fn execute_one(
        &mut self,
        state: &mut ExecState,
        command: &Command,
    ) -> Result<(), GpuError> {
        let in_pass = state.pass.is_some();
        let pass_only = matches!(
            command,
            Command::Draw { .. } | Command::DrawFullscreen | Command::EndRenderPass
        );
        if pass_only != in_pass
            && !matches!(
                command,
                Command::BindPipeline(_)
                    | Command::BindBindingTable(_)
                    | Command::PushConstants { .. }
            )
        {
            return Err(validation(format!(
                "{command:?} {} a render pass",
                if in_pass { "inside" } else { "outside" }
            )));
        }
        match command {
            Command::ImageBarrier { image, from, to } => {
                self.barrier(*image, *from, *to)
            }
            Command::AccelerationStructureBarrier => {
                for structure in self.structures.values_mut() {
                    if let StructureState::Top {
                        awaiting_barrier, ..
                    } = structure
                    {
                        *awaiting_barrier = false;
                    }
                }
                Ok(())
            }
            Command::ClearImage { image, color } => {
                let target = self.image_mut(*image)?;
                if !matches!(
                    target.layout,
                    ImageLayout::TransferDst | ImageLayout::General
                ) {
                    return Err(validation(format!(
                        "clear of {image:?} in layout {:?}",
                        target.layout
                    )));
                }
                let value = quantize(target.format, *color);
                target.texels.fill(value);
                Ok(())
            }
            Command::UpdateBuffer {
                buffer,
                offset,
                data,
            } => self.update_buffer(*buffer, *offset, data),
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => self.copy_buffer(*src, *src_offset, *dst, *dst_offset, *size),
            Command::BeginRenderPass {
                color,
                depth,
                extent,
            } => self.begin_render_pass(state, color, *depth, *extent),
            Command::BindPipeline(pipeline) => {
                if !self.pipelines.contains_key(pipeline) {
                    return Err(GpuError::InvalidHandle(format!("{pipeline:?}")));
                }
                state.pipeline = Some(*pipeline);
                state.push.clear();
                Ok(())
            }
            Command::BindBindingTable(table) => {
                let pipeline = self.bound_pipeline(state)?;
                let layout = &self
                    .tables
                    .get(table)
                    .ok_or_else(|| GpuError::InvalidHandle(format!("{table:?}")))?
                    .layout;
                if layout != pipeline.bindings() {
                    return Err(validation(format!(
                        "{table:?} does not match the bound pipeline layout"
                    )));
                }
                state.table = Some(*table);
                Ok(())
            }
            Command::PushConstants { offset, data } => {
                let size = self.bound_pipeline(state)?.push_constant_size();
                let end = *offset as usize + data.len();
                if end > size as usize {
                    return Err(validation(format!(
                        "push constants end at {end}, block is {size} bytes"
                    )));
                }
                state.push.resize(size as usize, 0);
                state.push[*offset as usize..end].copy_from_slice(data);
                Ok(())
            }
            Command::Draw {
                vertex_buffer,
                index_buffer,
                index_count,
            } => self.draw(state, *vertex_buffer, *index_buffer, *index_count),
            Command::DrawFullscreen => self.draw_fullscreen(state),
            Command::EndRenderPass => {
                state.pass = None;
                Ok(())
            }
            Command::BuildTopLevel {
                tlas,
                instances,
                instance_count,
                scratch,
            } => self.build_top_level(*tlas, *instances, *instance_count, *scratch),
            Command::TraceRays { regions, extent } => {
                self.trace_rays(state, regions, *extent)
            }
            Command::BlitImage { src, dst, .. } => self.blit(*src, *dst),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn image(&self, image: ImageId) -> Result<&ImageState, GpuError> {
        self.images
            .get(&image)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{image:?}")))
    }

    fn image_mut(&mut self, image: ImageId) -> Result<&mut ImageState, GpuError> {
        self.images
            .get_mut(&image)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{image:?}")))
    }

    fn expect_image(
        &self,
        image: ImageId,
        layout: ImageLayout,
        usage: ImageUsage,
    ) -> Result<&ImageState, GpuError> {
        let state = self.image(image)?;
        if state.layout != layout {
            return Err(validation(format!(
                "{image:?} used as {layout:?} but is in {:?}",
                state.layout
            )));
        }
        if !state.usage.contains(usage) {
            return Err(validation(format!(
                "{image:?} lacks usage {usage:?}"
            )));
        }
        Ok(state)
    }

    fn expect_buffer(
        &self,
        buffer: BufferId,
        usage: BufferUsage,
        end: u64,
    ) -> Result<(), GpuError> {
        let state = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if !state.usage.contains(usage) {
            return Err(validation(format!("{buffer:?} lacks usage {usage:?}")));
        }
        if end > state.size {
            return Err(validation(format!(
                "access up to byte {end} overflows {buffer:?} ({} bytes)",
                state.size
            )));
        }
        Ok(())
    }

    fn bound_pipeline(
        &self,
        state: &ExecState,
    ) -> Result<&PipelineState, GpuError> {
        let id = state
            .pipeline
            .ok_or_else(|| validation("no pipeline bound".into()))?;
        self.pipelines
            .get(&id)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{id:?}")))
    }

    pub(super) fn check_resource_alive(
        &self,
        resource: &BindingResource,
    ) -> Result<(), GpuError> {
        if let BindingResource::AccelerationStructure(s) = resource {
            if !self.structures.contains_key(s) {
                return Err(GpuError::InvalidHandle(format!("{s:?}")));
            }
        }
        if let Some(buffer) = resource.buffer() {
            if !self.buffers.contains_key(&buffer) {
                return Err(GpuError::InvalidHandle(format!("{buffer:?}")));
            }
        }
        for image in resource.images() {
            if !self.images.contains_key(&image) {
                return Err(GpuError::InvalidHandle(format!("{image:?}")));
            }
        }
        Ok(())
    }

    /// Every slot written, every resource alive and in the layout its
    /// binding kind reads it in.
    fn check_table_ready(&self, state: &ExecState) -> Result<BindingTableId, GpuError> {
        let id = state
            .table
            .ok_or_else(|| validation("no binding table bound".into()))?;
        let table = self
            .tables
            .get(&id)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{id:?}")))?;
        for entry in &table.layout.entries {
            let resource = table.slots.get(&entry.slot).ok_or_else(|| {
                validation(format!("{id:?} slot {} was never written", entry.slot))
            })?;
            self.check_resource_alive(resource)?;
            let layout = match entry.kind {
                BindingKind::StorageImage => ImageLayout::General,
                BindingKind::SampledImage => ImageLayout::ShaderReadOnly,
                _ => continue,
            };
            for image in resource.images() {
                let current = self.image(image)?.layout;
                if current != layout {
                    return Err(validation(format!(
                        "{id:?} slot {} reads {image:?} in {current:?}",
                        entry.slot
                    )));
                }
            }
        }
        Ok(id)
    }

    fn table_image(&self, table: BindingTableId, slot: u32) -> Result<ImageId, GpuError> {
        let resource = self
            .tables
            .get(&table)
            .and_then(|t| t.slots.get(&slot))
            .ok_or_else(|| validation(format!("{table:?} slot {slot} unset")))?;
        match resource {
            BindingResource::StorageImage(image)
            | BindingResource::SampledImage { image, .. } => Ok(*image),
            other => Err(validation(format!(
                "{table:?} slot {slot} holds {other:?}, not an image"
            ))),
        }
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    fn barrier(
        &mut self,
        image: ImageId,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Result<(), GpuError> {
        let state = self.image_mut(image)?;
        if to == ImageLayout::Undefined {
            return Err(validation(format!(
                "barrier moves {image:?} into the undefined layout"
            )));
        }
        if from == ImageLayout::Undefined {
            state.texels.fill([0.0; 4]);
        } else if from != state.layout {
            return Err(validation(format!(
                "barrier on {image:?} from {from:?} but it is in {:?}",
                state.layout
            )));
        }
        state.layout = to;
        Ok(())
    }

    fn update_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let end = offset + data.len() as u64;
        self.expect_buffer(buffer, BufferUsage::TRANSFER_DST, end)?;
        if let Some(state) = self.buffers.get_mut(&buffer) {
            state.data[offset as usize..end as usize].copy_from_slice(data);
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), GpuError> {
        if src == dst {
            return Err(validation(format!("copy from {src:?} onto itself")));
        }
        self.expect_buffer(src, BufferUsage::TRANSFER_SRC, src_offset + size)?;
        self.expect_buffer(dst, BufferUsage::TRANSFER_DST, dst_offset + size)?;
        let bytes = self
            .buffers
            .get(&src)
            .map(|b| b.data[src_offset as usize..(src_offset + size) as usize].to_vec())
            .unwrap_or_default();
        if let Some(state) = self.buffers.get_mut(&dst) {
            state.data[dst_offset as usize..(dst_offset + size) as usize]
                .copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn blit(&mut self, src: ImageId, dst: ImageId) -> Result<(), GpuError> {
        if src == dst {
            return Err(validation(format!("blit from {src:?} onto itself")));
        }
        let source = self.expect_image(
            src,
            ImageLayout::TransferSrc,
            ImageUsage::TRANSFER_SRC,
        )?;
        let (src_extent, src_texels) = (source.extent, source.texels.clone());
        let target = self.expect_image(
            dst,
            ImageLayout::TransferDst,
            ImageUsage::TRANSFER_DST,
        )?;
        let (dst_extent, format) = (target.extent, target.format);
        let mut texels = Vec::with_capacity(dst_extent.pixel_count());
        for y in 0..dst_extent.height {
            for x in 0..dst_extent.width {
                let texel =
                    sample_nearest(&src_texels, src_extent, dst_extent, x, y);
                texels.push(quantize(format, texel));
            }
        }
        self.image_mut(dst)?.texels = texels;
        Ok(())
    }

    // =========================================================================
    // Raster
    // =========================================================================

    fn begin_render_pass(
        &mut self,
        state: &mut ExecState,
        color: &[ColorTarget],
        depth: Option<DepthTarget>,
        extent: Extent2d,
    ) -> Result<(), GpuError> {
        for target in color {
            let image = self.expect_image(
                target.image,
                ImageLayout::ColorAttachment,
                ImageUsage::COLOR_ATTACHMENT,
            )?;
            if image.extent != extent {
                return Err(validation(format!(
                    "color target {:?} is {} but the pass is {extent}",
                    target.image, image.extent
                )));
            }
        }
        if let Some(target) = depth {
            let image = self.expect_image(
                target.image,
                ImageLayout::DepthAttachment,
                ImageUsage::DEPTH_ATTACHMENT,
            )?;
            if image.extent != extent {
                return Err(validation(format!(
                    "depth target {:?} is {} but the pass is {extent}",
                    target.image, image.extent
                )));
            }
        }
        for target in color {
            if let Some(clear) = target.clear {
                let image = self.image_mut(target.image)?;
                let value = quantize(image.format, clear);
                image.texels.fill(value);
            }
        }
        if let Some(DepthTarget {
            image,
            clear: Some(clear),
        }) = depth
        {
            self.image_mut(image)?.texels.fill([clear, 0.0, 0.0, 0.0]);
        }
        state.pass = Some(RenderPass {
            color: color.to_vec(),
            depth,
        });
        Ok(())
    }

    fn draw(
        &mut self,
        state: &ExecState,
        vertex_buffer: BufferId,
        index_buffer: BufferId,
        index_count: u32,
    ) -> Result<(), GpuError> {
        if !matches!(
            self.bound_pipeline(state)?,
            PipelineState::Graphics {
                program: Program::Geometry | Program::Other,
                ..
            }
        ) {
            return Err(validation("indexed draw without a raster pipeline".into()));
        }
        let _ = self.check_table_ready(state)?;
        self.expect_buffer(vertex_buffer, BufferUsage::VERTEX, 0)?;
        self.expect_buffer(
            index_buffer,
            BufferUsage::INDEX,
            u64::from(index_count) * 4,
        )?;
        let push: DrawPushConstants = read_push(&state.push)?;
        let pass = state
            .pass
            .as_ref()
            .ok_or_else(|| validation("draw outside a render pass".into()))?;
        let (Some(depth), [normal, albedo, ..]) = (pass.depth, pass.color.as_slice())
        else {
            return Err(validation(
                "geometry program needs depth, normal and albedo targets".into(),
            ));
        };
        let covered: Vec<bool> = self
            .image(depth.image)?
            .texels
            .iter()
            .map(|t| GEOMETRY_DEPTH < t[0])
            .collect();
        let writes = [
            (depth.image, [GEOMETRY_DEPTH, 0.0, 0.0, 0.0]),
            (normal.image, [0.0, 0.0, 1.0, 0.0]),
            (albedo.image, push.base_color),
        ];
        for (image, value) in writes {
            let target = self.image_mut(image)?;
            let value = quantize(target.format, value);
            for (texel, hit) in target.texels.iter_mut().zip(&covered) {
                if *hit {
                    *texel = value;
                }
            }
        }
        Ok(())
    }

    fn draw_fullscreen(&mut self, state: &ExecState) -> Result<(), GpuError> {
        if !matches!(
            self.bound_pipeline(state)?,
            PipelineState::Graphics {
                program: Program::Lighting,
                ..
            }
        ) {
            return Err(validation(
                "full-screen draw without the lighting pipeline".into(),
            ));
        }
        let table = self.check_table_ready(state)?;
        let push: LightingPushConstants = read_push(&state.push)?;
        let read = |slot: LightingBinding| -> Result<(Extent2d, Vec<[f32; 4]>), GpuError> {
            let image = self.image(self.table_image(table, slot as u32)?)?;
            Ok((image.extent, image.texels.clone()))
        };
        let (src_extent, depth) = read(LightingBinding::Depth)?;
        let (_, normal) = read(LightingBinding::Normal)?;
        let (_, albedo) = read(LightingBinding::Albedo)?;
        let target = state
            .pass
            .as_ref()
            .and_then(|p| p.color.first())
            .ok_or_else(|| validation("lighting pass has no color target".into()))?
            .image;
        let output = self.image_mut(target)?;
        let (extent, format) = (output.extent, output.format);
        for y in 0..extent.height {
            for x in 0..extent.width {
                let d = sample_nearest(&depth, src_extent, extent, x, y);
                let color = if d[0] < 1.0 {
                    shade(
                        sample_nearest(&albedo, src_extent, extent, x, y),
                        sample_nearest(&normal, src_extent, extent, x, y),
                    )
                } else {
                    push.clear_color
                };
                output.texels[(y * extent.width + x) as usize] =
                    quantize(format, color);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Ray tracing
    // =========================================================================

    fn build_top_level(
        &mut self,
        tlas: AccelerationStructureId,
        instances: BufferId,
        instance_count: u32,
        scratch: BufferId,
    ) -> Result<(), GpuError> {
        let count = u64::from(instance_count);
        self.expect_buffer(
            instances,
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            count * AccelerationInstance::SIZE,
        )?;
        self.expect_buffer(
            scratch,
            BufferUsage::STORAGE,
            self.top_level_sizes(instance_count).scratch_size,
        )?;
        let records: Vec<AccelerationInstance> = self
            .buffers
            .get(&instances)
            .map(|b| {
                b.data
                    .chunks_exact(AccelerationInstance::SIZE as usize)
                    .take(instance_count as usize)
                    .map(bytemuck::pod_read_unaligned)
                    .collect()
            })
            .unwrap_or_default();
        for (index, record) in records.iter().enumerate() {
            if self.structure_by_address(record.blas_address).is_none() {
                return Err(validation(format!(
                    "instance {index} references unknown BLAS address {:#x}",
                    record.blas_address
                )));
            }
        }
        match self.structures.get_mut(&tlas) {
            Some(StructureState::Top {
                max_instances,
                built,
                awaiting_barrier,
                instances: stored,
                ..
            }) => {
                if instance_count > *max_instances {
                    return Err(validation(format!(
                        "{instance_count} instances exceed {tlas:?} capacity \
                         {max_instances}"
                    )));
                }
                *built = true;
                *awaiting_barrier = true;
                *stored = records;
            }
            _ => return Err(GpuError::InvalidHandle(format!("{tlas:?}"))),
        }
        self.stats.tlas_builds += 1;
        Ok(())
    }

    fn check_regions(
        &self,
        pipeline: PipelineId,
        regions: &TraceRegions,
    ) -> Result<(), GpuError> {
        let buffer = self.buffers.get(&regions.buffer).ok_or_else(|| {
            GpuError::InvalidHandle(format!("{:?}", regions.buffer))
        })?;
        if !buffer.usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
            return Err(validation(format!(
                "{:?} is not a shader binding table",
                regions.buffer
            )));
        }
        let props = self.properties;
        let handle_size = u64::from(props.shader_group_handle_size);
        let named = [
            ("raygen", regions.raygen),
            ("miss", regions.miss),
            ("hit", regions.hit),
        ];
        for (group, (name, region)) in named.into_iter().enumerate() {
            if region.offset % u64::from(props.shader_group_base_alignment) != 0 {
                return Err(validation(format!(
                    "{name} region offset {} is not base-aligned",
                    region.offset
                )));
            }
            if region.stride % u64::from(props.shader_group_handle_alignment) != 0
            {
                return Err(validation(format!(
                    "{name} region stride {} is not handle-aligned",
                    region.stride
                )));
            }
            if region.size < handle_size || region.offset + region.size > buffer.size
            {
                return Err(validation(format!(
                    "{name} region {}+{} does not fit the table",
                    region.offset, region.size
                )));
            }
            let start = region.offset as usize;
            let stored = &buffer.data[start..start + handle_size as usize];
            if stored != self.group_handle(pipeline, group as u32).as_slice() {
                return Err(validation(format!(
                    "{name} region does not hold group {group} of {pipeline:?}"
                )));
            }
        }
        if regions.raygen.size != regions.raygen.stride {
            return Err(validation(
                "raygen region size must equal its stride".into(),
            ));
        }
        Ok(())
    }

    fn trace_rays(
        &mut self,
        state: &ExecState,
        regions: &TraceRegions,
        extent: Extent2d,
    ) -> Result<(), GpuError> {
        let pipeline = state
            .pipeline
            .ok_or_else(|| validation("trace without a pipeline".into()))?;
        if !matches!(self.bound_pipeline(state)?, PipelineState::RayTracing { .. }) {
            return Err(validation("trace with a raster pipeline bound".into()));
        }
        let table = self.check_table_ready(state)?;
        self.check_regions(pipeline, regions)?;
        let push: TracePushConstants = read_push(&state.push)?;

        let tlas = match self
            .tables
            .get(&table)
            .and_then(|t| t.slots.get(&(RtBinding::Tlas as u32)))
        {
            Some(BindingResource::AccelerationStructure(id)) => *id,
            other => {
                return Err(validation(format!("TLAS slot holds {other:?}")))
            }
        };
        let instance_count = match self.structures.get(&tlas) {
            Some(StructureState::Top {
                built: true,
                awaiting_barrier: false,
                instances,
                ..
            }) => instances.len(),
            Some(StructureState::Top { built: false, .. }) => {
                return Err(validation(format!("trace reads unbuilt {tlas:?}")))
            }
            Some(StructureState::Top { .. }) => {
                return Err(validation(format!(
                    "trace reads {tlas:?} before its build is visible"
                )))
            }
            _ => return Err(validation(format!("{tlas:?} is not a TLAS"))),
        };

        let output = self.table_image(table, RtBinding::Output as u32)?;
        let previous = self.table_image(table, RtBinding::PreviousFrame as u32)?;
        let read = |slot: RtBinding| -> Result<(Extent2d, Vec<[f32; 4]>), GpuError> {
            let image = self.image(self.table_image(table, slot as u32)?)?;
            Ok((image.extent, image.texels.clone()))
        };
        let (g_extent, depth) = read(RtBinding::GBufferDepth)?;
        let (_, normal) = read(RtBinding::GBufferNormal)?;
        let (_, albedo) = read(RtBinding::GBufferAlbedo)?;
        let (prev_extent, prev) = read(RtBinding::PreviousFrame)?;
        let previous_digest = digest(&prev);

        let target = self.image_mut(output)?;
        if target.extent != extent {
            return Err(validation(format!(
                "trace over {extent} into a {} output",
                target.extent
            )));
        }
        let format = target.format;
        let n = push.accumulated as f32;
        let mut hit_pixels = 0;
        for y in 0..extent.height {
            for x in 0..extent.width {
                let d = sample_nearest(&depth, g_extent, extent, x, y);
                let shaded = if instance_count > 0 && d[0] < 1.0 {
                    hit_pixels += 1;
                    shade(
                        sample_nearest(&albedo, g_extent, extent, x, y),
                        sample_nearest(&normal, g_extent, extent, x, y),
                    )
                } else {
                    MISS_COLOR
                };
                let before = sample_nearest(&prev, prev_extent, extent, x, y);
                let blended: [f32; 4] = std::array::from_fn(|c| {
                    (before[c] * n + shaded[c]) / (n + 1.0)
                });
                target.texels[(y * extent.width + x) as usize] =
                    quantize(format, blended);
            }
        }
        let output_digest = digest(&target.texels);
        self.stats.traces += 1;
        self.trace_log.push(TraceRecord {
            frame_counter: push.frame_counter,
            accumulated: push.accumulated,
            seed: push.seed,
            extent,
            instance_count,
            hit_pixels,
            previous,
            previous_digest,
            output,
            output_digest,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_matches_storage_precision() {
        let c = [0.5, 1.5, -0.25, 0.333];
        let unorm = quantize(ImageFormat::Rgba8Unorm, c);
        assert_eq!(unorm[0], 128.0 / 255.0);
        assert_eq!(unorm[1], 1.0);
        assert_eq!(unorm[2], 0.0);
        let half = quantize(ImageFormat::Rgba16Float, c);
        assert_eq!(half[2], -0.25);
        assert_eq!(quantize(ImageFormat::Rgba16Float, half), half);
        assert_eq!(quantize(ImageFormat::Rgba32Float, c), c);
    }

    #[test]
    fn nearest_sampling_scales_coordinates() {
        let texels: Vec<[f32; 4]> =
            (0..4).map(|i| [i as f32, 0.0, 0.0, 0.0]).collect();
        let src = Extent2d::new(2, 2);
        let dst = Extent2d::new(4, 4);
        assert_eq!(sample_nearest(&texels, src, dst, 0, 0)[0], 0.0);
        assert_eq!(sample_nearest(&texels, src, dst, 3, 0)[0], 1.0);
        assert_eq!(sample_nearest(&texels, src, dst, 3, 3)[0], 3.0);
    }

    #[test]
    fn shading_faces_the_light() {
        let albedo = [0.8, 0.4, 0.2, 1.0];
        assert_eq!(shade(albedo, [0.0, 0.0, 1.0, 0.0]), albedo);
        let side = shade(albedo, [1.0, 0.0, 0.0, 0.0]);
        assert!((side[0] - 0.08).abs() < 1e-6);
    }
}
