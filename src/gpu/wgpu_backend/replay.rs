//! Replay of recorded [`Command`]s onto a wgpu command encoder.
//!
//! Replay runs in two steps. [`WgpuDevice::prepare`] needs the device
//! mutably: it builds stale bind groups, fills TLAS instance slots from
//! the host-written instance buffers and creates missing blit pipelines.
//! [`WgpuDevice::encode`] then walks the list again and records it.
//! Layout transitions are implicit in wgpu and replay as nothing.

use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;

use super::convert::{extent_3d, filter_mode, texture_format};
use super::{PipelineState, StructureState, WgpuDevice};
use crate::gpu::{
    AccelerationInstance, AccelerationStructureId, BindingResource,
    BindingTableId, BufferId, ColorTarget, Command, CommandList, DepthTarget,
    Extent2d, Filter, GpuError, ImageId, PipelineId, TraceRegions,
};

/// Workgroup edge of the trace dispatch.
const TRACE_TILE: u32 = 8;

fn validation(message: impl Into<String>) -> GpuError {
    GpuError::Validation(message.into())
}

const fn clear_color(c: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: c[0] as f64,
        g: c[1] as f64,
        b: c[2] as f64,
        a: c[3] as f64,
    }
}

/// Bind state outside render passes, read by trace dispatches.
#[derive(Debug, Default)]
struct ReplayState {
    pipeline: Option<PipelineId>,
    table: Option<BindingTableId>,
    push: Option<(u32, Vec<u8>)>,
}

/// Full-screen pipelines for scaled copies, one per destination format.
#[derive(Debug)]
pub(super) struct Blitter {
    module: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    nearest: wgpu::Sampler,
    linear: wgpu::Sampler,
    pipelines: FxHashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl Blitter {
    pub(super) fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit"),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(
                include_str!("blit.wgsl"),
            )),
        });
        let layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("blit"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float {
                                filterable: true,
                            },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(
                            wgpu::SamplerBindingType::Filtering,
                        ),
                        count: None,
                    },
                ],
            });
        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("blit"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let sampler = |filter: Filter| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("blit"),
                mag_filter: filter_mode(filter),
                min_filter: filter_mode(filter),
                ..Default::default()
            })
        };
        Self {
            nearest: sampler(Filter::Nearest),
            linear: sampler(Filter::Linear),
            module,
            layout,
            pipeline_layout,
            pipelines: FxHashMap::default(),
        }
    }

    fn ensure_pipeline(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
    ) {
        if self.pipelines.contains_key(&format) {
            return;
        }
        let pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("blit"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &self.module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            });
        let _ = self.pipelines.insert(format, pipeline);
    }

    const fn sampler(&self, filter: Filter) -> &wgpu::Sampler {
        match filter {
            Filter::Nearest => &self.nearest,
            Filter::Linear => &self.linear,
        }
    }
}

impl WgpuDevice {
    // =========================================================================
    // Preparation
    // =========================================================================

    pub(super) fn prepare(&mut self, commands: &CommandList) -> Result<(), GpuError> {
        for command in commands {
            match command {
                Command::BindBindingTable(table) => self.ensure_bind_group(*table)?,
                Command::BuildTopLevel {
                    tlas,
                    instances,
                    instance_count,
                    ..
                } => self.fill_top_level(*tlas, *instances, *instance_count)?,
                Command::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => self.update_shadow(*buffer, *offset, data)?,
                Command::BlitImage { src, dst, .. } => {
                    if !self.copies_directly(*src, *dst)? {
                        let (_, format) = self.image_info(*dst)?;
                        self.blitter
                            .ensure_pipeline(&self.device, texture_format(format));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn ensure_bind_group(&mut self, table: BindingTableId) -> Result<(), GpuError> {
        let state = self
            .tables
            .get(&table)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{table:?}")))?;
        if state.group.is_some() {
            return Ok(());
        }

        let mut arrays: Vec<Vec<&wgpu::TextureView>> = Vec::new();
        for entry in &state.layout.entries {
            if let Some(BindingResource::SampledImageArray(images)) =
                state.slots.get(&entry.slot)
            {
                arrays.push(
                    images
                        .iter()
                        .map(|image| self.view(*image))
                        .collect::<Result<_, _>>()?,
                );
            }
        }
        let mut next_array = arrays.iter();
        let mut entries = Vec::with_capacity(state.layout.entries.len());
        for entry in &state.layout.entries {
            let resource = state.slots.get(&entry.slot).ok_or_else(|| {
                validation(format!("{table:?} slot {} was never written", entry.slot))
            })?;
            let resource = match resource {
                BindingResource::AccelerationStructure(id) => {
                    wgpu::BindingResource::AccelerationStructure(self.top_level(*id)?)
                }
                BindingResource::StorageImage(image)
                | BindingResource::SampledImage { image, .. } => {
                    wgpu::BindingResource::TextureView(self.view(*image)?)
                }
                BindingResource::UniformBuffer(buffer)
                | BindingResource::StorageBuffer(buffer) => {
                    self.buffer(*buffer)?.buffer.as_entire_binding()
                }
                BindingResource::SampledImageArray(_) => {
                    let views = next_array
                        .next()
                        .ok_or_else(|| validation("texture array went missing"))?;
                    wgpu::BindingResource::TextureViewArray(views.as_slice())
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: entry.slot,
                resource,
            });
        }
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("binding table"),
            layout: &state.bind_group_layout,
            entries: &entries,
        });
        if let Some(state) = self.tables.get_mut(&table) {
            state.group = Some(group);
        }
        Ok(())
    }

    fn fill_top_level(
        &mut self,
        tlas: AccelerationStructureId,
        instances: BufferId,
        count: u32,
    ) -> Result<(), GpuError> {
        let bytes = self
            .buffer(instances)?
            .shadow
            .as_deref()
            .ok_or_else(|| validation(format!("{instances:?} is not host-visible")))?;
        let needed = count as usize * AccelerationInstance::SIZE as usize;
        let records = bytes
            .get(..needed)
            .ok_or_else(|| validation(format!("{instances:?} holds fewer than {count} records")))?;

        let mut built = Vec::with_capacity(count as usize);
        for chunk in records.chunks_exact(AccelerationInstance::SIZE as usize) {
            let record: AccelerationInstance = bytemuck::pod_read_unaligned(chunk);
            let blas = self
                .blas_by_address
                .get(&record.blas_address)
                .and_then(|id| match self.structures.get(id) {
                    Some(StructureState::Bottom { blas }) => Some(blas),
                    _ => None,
                })
                .ok_or_else(|| {
                    validation(format!(
                        "instance references unknown BLAS address {:#x}",
                        record.blas_address
                    ))
                })?;
            let transform: [f32; 12] = bytemuck::cast(record.transform);
            built.push(wgpu::TlasInstance::new(
                blas,
                transform,
                record.custom_index(),
                record.mask(),
            ));
        }

        let Some(StructureState::Top {
            tlas: structure,
            max_instances,
        }) = self.structures.get_mut(&tlas)
        else {
            return Err(validation(format!("{tlas:?} is not a TLAS")));
        };
        if count > *max_instances {
            return Err(validation(format!(
                "{count} instances exceed TLAS capacity {max_instances}"
            )));
        }
        let filled = built.len();
        for (index, instance) in built.into_iter().enumerate() {
            structure[index] = Some(instance);
        }
        for index in filled..*max_instances as usize {
            structure[index] = None;
        }
        Ok(())
    }

    fn update_shadow(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let state = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if let Some(shadow) = state.shadow.as_mut() {
            let start = offset as usize;
            let range = shadow
                .get_mut(start..start + data.len())
                .ok_or_else(|| validation(format!("update past the end of {buffer:?}")))?;
            range.copy_from_slice(data);
        }
        Ok(())
    }

    /// Equal size and format between two owned images: a plain texture
    /// copy suffices.
    fn copies_directly(&self, src: ImageId, dst: ImageId) -> Result<bool, GpuError> {
        Ok(self.image_info(src)? == self.image_info(dst)?
            && self.images.contains_key(&src)
            && self.images.contains_key(&dst))
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    pub(super) fn encode(
        &self,
        commands: &[Command],
    ) -> Result<wgpu::CommandBuffer, GpuError> {
        let mut encoder =
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("prism commands"),
                });
        let mut state = ReplayState::default();
        let mut index = 0;
        while let Some(command) = commands.get(index) {
            match command {
                Command::BeginRenderPass {
                    color,
                    depth,
                    extent,
                } => {
                    let end = commands[index..]
                        .iter()
                        .position(|c| matches!(c, Command::EndRenderPass))
                        .map(|offset| index + offset)
                        .ok_or_else(|| validation("render pass is never ended"))?;
                    self.encode_render_pass(
                        &mut encoder,
                        color,
                        *depth,
                        *extent,
                        &commands[index + 1..end],
                    )?;
                    index = end + 1;
                    continue;
                }
                Command::EndRenderPass => {
                    return Err(validation("render pass ended twice"))
                }
                Command::Draw { .. } | Command::DrawFullscreen => {
                    return Err(validation("draw outside a render pass"))
                }
                Command::ImageBarrier { .. } | Command::AccelerationStructureBarrier => {}
                Command::ClearImage { image, color } => {
                    let view = self.view(*image)?;
                    let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("clear"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(clear_color(*color)),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                Command::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    let mut padded = data.clone();
                    padded.resize(data.len().next_multiple_of(4), 0);
                    let staging =
                        self.device
                            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                label: Some("update staging"),
                                contents: &padded,
                                usage: wgpu::BufferUsages::COPY_SRC,
                            });
                    encoder.copy_buffer_to_buffer(
                        &staging,
                        0,
                        &self.buffer(*buffer)?.buffer,
                        *offset,
                        padded.len() as u64,
                    );
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => encoder.copy_buffer_to_buffer(
                    &self.buffer(*src)?.buffer,
                    *src_offset,
                    &self.buffer(*dst)?.buffer,
                    *dst_offset,
                    *size,
                ),
                Command::BindPipeline(pipeline) => state.pipeline = Some(*pipeline),
                Command::BindBindingTable(table) => state.table = Some(*table),
                Command::PushConstants { offset, data } => {
                    state.push = Some((*offset, data.clone()));
                }
                Command::BuildTopLevel { tlas, .. } => {
                    encoder.build_acceleration_structures(None, Some(self.top_level(*tlas)?));
                }
                Command::TraceRays { regions, extent } => {
                    self.encode_trace(&mut encoder, &state, regions, *extent)?;
                }
                Command::BlitImage { src, dst, filter } => {
                    self.encode_blit(&mut encoder, *src, *dst, *filter)?;
                }
            }
            index += 1;
        }
        Ok(encoder.finish())
    }

    fn encode_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        color: &[ColorTarget],
        depth: Option<DepthTarget>,
        extent: Extent2d,
        body: &[Command],
    ) -> Result<(), GpuError> {
        let mut color_attachments = Vec::with_capacity(color.len());
        for target in color {
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: self.view(target.image)?,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: target
                        .clear
                        .map_or(wgpu::LoadOp::Load, |c| wgpu::LoadOp::Clear(clear_color(c))),
                    store: wgpu::StoreOp::Store,
                },
            }));
        }
        let depth_stencil_attachment = match depth {
            Some(target) => Some(wgpu::RenderPassDepthStencilAttachment {
                view: self.view(target.image)?,
                depth_ops: Some(wgpu::Operations {
                    load: target.clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            None => None,
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("prism render pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        for command in body {
            match command {
                Command::BindPipeline(id) => {
                    let Some(PipelineState::Render { pipeline, .. }) =
                        self.pipelines.get(id)
                    else {
                        return Err(validation(format!("{id:?} is not a raster pipeline")));
                    };
                    pass.set_pipeline(pipeline);
                    pass.set_viewport(
                        0.0,
                        0.0,
                        extent.width as f32,
                        extent.height as f32,
                        0.0,
                        1.0,
                    );
                }
                Command::BindBindingTable(table) => {
                    pass.set_bind_group(0, self.bind_group(*table)?, &[]);
                }
                Command::PushConstants { offset, data } => {
                    pass.set_push_constants(wgpu::ShaderStages::VERTEX_FRAGMENT, *offset, data);
                }
                Command::Draw {
                    vertex_buffer,
                    index_buffer,
                    index_count,
                } => {
                    pass.set_vertex_buffer(0, self.buffer(*vertex_buffer)?.buffer.slice(..));
                    pass.set_index_buffer(
                        self.buffer(*index_buffer)?.buffer.slice(..),
                        wgpu::IndexFormat::Uint32,
                    );
                    pass.draw_indexed(0..*index_count, 0, 0..1);
                }
                Command::DrawFullscreen => pass.draw(0..3, 0..1),
                other => {
                    return Err(validation(format!("{other:?} inside a render pass")))
                }
            }
        }
        Ok(())
    }

    /// The ray tracing pipeline is a compute program issuing ray queries;
    /// the binding-table regions only have to name a live buffer.
    fn encode_trace(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &ReplayState,
        regions: &TraceRegions,
        extent: Extent2d,
    ) -> Result<(), GpuError> {
        let _ = self.buffer(regions.buffer)?;
        let Some(PipelineState::Trace { pipeline }) =
            state.pipeline.and_then(|id| self.pipelines.get(&id))
        else {
            return Err(validation("trace without a ray tracing pipeline"));
        };
        let table = state
            .table
            .ok_or_else(|| validation("trace without a binding table"))?;

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("trace"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, self.bind_group(table)?, &[]);
        if let Some((offset, data)) = &state.push {
            pass.set_push_constants(*offset, data);
        }
        let (x, y) = extent.tiles(TRACE_TILE);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }

    fn encode_blit(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: ImageId,
        dst: ImageId,
        filter: Filter,
    ) -> Result<(), GpuError> {
        if self.copies_directly(src, dst)? {
            let (extent, _) = self.image_info(src)?;
            if let (Some(from), Some(to)) = (self.images.get(&src), self.images.get(&dst)) {
                encoder.copy_texture_to_texture(
                    from.texture.as_image_copy(),
                    to.texture.as_image_copy(),
                    extent_3d(extent),
                );
            }
            return Ok(());
        }

        let (_, format) = self.image_info(dst)?;
        let pipeline = self
            .blitter
            .pipelines
            .get(&texture_format(format))
            .ok_or_else(|| validation(format!("no blit pipeline for {format:?}")))?;
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit"),
            layout: &self.blitter.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(self.view(src)?),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(self.blitter.sampler(filter)),
                },
            ],
        });
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("blit"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.view(dst)?,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }
}
