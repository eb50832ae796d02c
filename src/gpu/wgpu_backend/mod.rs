//! [`GpuDevice`] on wgpu with experimental ray queries.
//!
//! The explicit-API surface maps onto wgpu as follows:
//!
//! - fences are submission indices, waited on with `Device::poll`;
//! - semaphores are ordering tokens (one queue, submission order);
//! - layout transitions are implicit;
//! - the ray tracing pipeline is a compute program assembled from the
//!   ray-generation, miss and closest-hit sources, tracing with ray
//!   queries; shader-group handles are synthetic;
//! - host-visible buffers keep a CPU shadow so TLAS builds can read the
//!   instance records the renderer wrote.

mod convert;
mod replay;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};

use self::convert::{
    buffer_usages, extent_3d, layout_entries, surface_format,
    texture_array_length, texture_format, texture_usages,
};
use self::replay::Blitter;
use super::device::{GpuDevice, GpuError, SubmitInfo};
use super::shader_library::GEOMETRY_PASS;
use super::types::{
    AccelerationStructureId, AccelerationStructureSizes, AcquireOutcome,
    BindingLayout, BindingResource, BindingTableId, BindingWrite,
    BottomLevelDesc, BufferDesc, BufferId, Extent2d, FenceId, ImageDesc,
    ImageFormat, ImageId, MemoryType, PipelineDesc, PipelineId,
    PresentOutcome, RayTracingProperties, SemaphoreId, ShaderModule,
    SwapchainInfo,
};
use crate::scene::assets::Vertex;

/// Features the pipeline cannot run without.
const REQUIRED_FEATURES: wgpu::Features = wgpu::Features::EXPERIMENTAL_RAY_QUERY
    .union(wgpu::Features::PUSH_CONSTANTS)
    .union(wgpu::Features::TEXTURE_BINDING_ARRAY)
    .union(
        wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING,
    );

/// Presentable images reported per surface configuration.
const SWAPCHAIN_IMAGE_COUNT: u32 = 3;

/// Synthetic shader-group handle size.
const HANDLE_SIZE: u32 = 32;

/// Bytes per TLAS instance, used for the reported sizes.
const INSTANCE_BYTES: u64 = 64;

const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];

struct BufferState {
    buffer: wgpu::Buffer,
    size: u64,
    shadow: Option<Vec<u8>>,
}

struct ImageState {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent2d,
    format: ImageFormat,
}

struct FenceState {
    signaled: bool,
    submission: Option<wgpu::SubmissionIndex>,
    done: Arc<AtomicBool>,
}

enum PipelineState {
    Render { pipeline: wgpu::RenderPipeline },
    Trace { pipeline: wgpu::ComputePipeline },
}

struct TableState {
    layout: BindingLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    slots: FxHashMap<u32, BindingResource>,
    group: Option<wgpu::BindGroup>,
}

enum StructureState {
    Bottom { blas: wgpu::Blas },
    Top { tlas: wgpu::Tlas, max_instances: u32 },
}

struct Surface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    format: ImageFormat,
    images: Vec<ImageId>,
    configured: bool,
}

struct AcquiredImage {
    image_index: u32,
    frame: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

/// wgpu-backed device presenting to one window surface.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: Surface,
    window_extent: Option<Extent2d>,
    next_id: u64,
    next_image: u32,
    buffers: FxHashMap<BufferId, BufferState>,
    images: FxHashMap<ImageId, ImageState>,
    fences: FxHashMap<FenceId, FenceState>,
    semaphores: FxHashSet<SemaphoreId>,
    pipelines: FxHashMap<PipelineId, PipelineState>,
    tables: FxHashMap<BindingTableId, TableState>,
    bind_group_layouts: FxHashMap<BindingLayout, wgpu::BindGroupLayout>,
    structures: FxHashMap<AccelerationStructureId, StructureState>,
    blas_by_address: FxHashMap<u64, AccelerationStructureId>,
    acquired: Option<AcquiredImage>,
    blitter: Blitter,
    errors: Arc<Mutex<Vec<String>>>,
    lost: Arc<AtomicBool>,
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("surface_format", &self.surface.format)
            .field("window_extent", &self.window_extent)
            .field("buffers", &self.buffers.len())
            .field("images", &self.images.len())
            .field("pipelines", &self.pipelines.len())
            .field("structures", &self.structures.len())
            .finish_non_exhaustive()
    }
}

impl WgpuDevice {
    /// Open an adapter and device able to present to `target` and trace
    /// rays. The surface is configured by the first
    /// [`GpuDevice::configure_surface`] call.
    ///
    /// # Errors
    ///
    /// [`GpuError::ObjectCreation`] if the surface cannot be created,
    /// [`GpuError::Unsupported`] if no adapter offers ray queries or an
    /// 8-bit surface format.
    pub async fn new(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        window: Extent2d,
    ) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(target)
            .map_err(|e| GpuError::ObjectCreation(format!("surface: {e}")))?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                compatible_surface: Some(&surface),
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| GpuError::Unsupported(format!("no compatible adapter: {e}")))?;
        let missing = REQUIRED_FEATURES.difference(adapter.features());
        if !missing.is_empty() {
            return Err(GpuError::Unsupported(format!(
                "adapter {} lacks {missing:?}",
                adapter.get_info().name
            )));
        }
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("prism device"),
                required_features: REQUIRED_FEATURES,
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|e| GpuError::Unsupported(format!("device request failed: {e}")))?;

        let caps = surface.get_capabilities(&adapter);
        let (native_format, format) = caps
            .formats
            .iter()
            .find_map(|f| surface_format(*f).map(|ours| (*f, ours)))
            .ok_or_else(|| {
                GpuError::Unsupported("no 8-bit unorm surface format".into())
            })?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: native_format,
            width: window.width.max(1),
            height: window.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: SWAPCHAIN_IMAGE_COUNT - 1,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        device.on_uncaptured_error(Box::new(move |error| {
            log::error!("wgpu: {error}");
            if let Ok(mut errors) = sink.lock() {
                errors.push(error.to_string());
            }
        }));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            log::error!("device lost ({reason:?}): {message}");
            flag.store(true, Ordering::Release);
        });

        let info = adapter.get_info();
        log::info!(
            "wgpu device: {} ({:?}), surface {native_format:?}",
            info.name,
            info.backend
        );
        let blitter = Blitter::new(&device);
        Ok(Self {
            device,
            queue,
            surface: Surface {
                surface,
                config,
                format,
                images: Vec::new(),
                configured: false,
            },
            window_extent: (!window.is_empty()).then_some(window),
            next_id: 1,
            next_image: 0,
            buffers: FxHashMap::default(),
            images: FxHashMap::default(),
            fences: FxHashMap::default(),
            semaphores: FxHashSet::default(),
            pipelines: FxHashMap::default(),
            tables: FxHashMap::default(),
            bind_group_layouts: FxHashMap::default(),
            structures: FxHashMap::default(),
            blas_by_address: FxHashMap::default(),
            acquired: None,
            blitter,
            errors,
            lost,
        })
    }

    /// Blocking [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn new_blocking(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        window: Extent2d,
    ) -> Result<Self, GpuError> {
        pollster::block_on(Self::new(target, window))
    }

    /// Record the window's current inner size. Acquire and present report
    /// out-of-date while it differs from the configured surface.
    pub fn set_window_extent(&mut self, extent: Extent2d) {
        self.window_extent = Some(extent);
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, buffer: BufferId) -> Result<&BufferState, GpuError> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))
    }

    fn acquired_view(&self, image: ImageId) -> Option<&wgpu::TextureView> {
        self.acquired
            .as_ref()
            .filter(|a| self.surface.images.get(a.image_index as usize) == Some(&image))
            .map(|a| &a.view)
    }

    /// View of an owned image or of the currently acquired surface image.
    fn view(&self, image: ImageId) -> Result<&wgpu::TextureView, GpuError> {
        self.images
            .get(&image)
            .map(|state| &state.view)
            .or_else(|| self.acquired_view(image))
            .ok_or_else(|| GpuError::InvalidHandle(format!("{image:?}")))
    }

    fn image_info(&self, image: ImageId) -> Result<(Extent2d, ImageFormat), GpuError> {
        if let Some(state) = self.images.get(&image) {
            return Ok((state.extent, state.format));
        }
        if self.surface.images.contains(&image) {
            let extent = Extent2d::new(self.surface.config.width, self.surface.config.height);
            return Ok((extent, self.surface.format));
        }
        Err(GpuError::InvalidHandle(format!("{image:?}")))
    }

    fn top_level(&self, id: AccelerationStructureId) -> Result<&wgpu::Tlas, GpuError> {
        match self.structures.get(&id) {
            Some(StructureState::Top { tlas, .. }) => Ok(tlas),
            _ => Err(GpuError::InvalidHandle(format!("{id:?} is not a TLAS"))),
        }
    }

    fn bind_group(&self, table: BindingTableId) -> Result<&wgpu::BindGroup, GpuError> {
        self.tables
            .get(&table)
            .and_then(|state| state.group.as_ref())
            .ok_or_else(|| GpuError::Validation(format!("{table:?} is not ready")))
    }

    fn bind_group_layout(&mut self, layout: &BindingLayout) -> wgpu::BindGroupLayout {
        if let Some(existing) = self.bind_group_layouts.get(layout) {
            return existing.clone();
        }
        let created = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("binding table"),
                entries: &layout_entries(layout),
            });
        let _ = self
            .bind_group_layouts
            .insert(layout.clone(), created.clone());
        created
    }

    const fn address_of(id: AccelerationStructureId) -> u64 {
        id.raw() << 12
    }

    fn surface_extent(&self) -> Extent2d {
        Extent2d::new(self.surface.config.width, self.surface.config.height)
    }

    fn window_changed(&self) -> bool {
        self.window_extent
            .is_some_and(|window| window != self.surface_extent())
    }

    // =========================================================================
    // Errors
    // =========================================================================

    fn check_health(&self) -> Result<(), GpuError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost);
        }
        let reported = self
            .errors
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default();
        match reported.first() {
            Some(first) => Err(GpuError::Validation(first.clone())),
            None => Ok(()),
        }
    }

    fn scoped<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(GpuError::ObjectCreation(error.to_string())),
            None => Ok(value),
        }
    }

    fn poll(&self, poll: wgpu::PollType) -> Result<(), GpuError> {
        match self.device.poll(poll) {
            Ok(_) => self.check_health(),
            Err(wgpu::PollError::Timeout) => Err(GpuError::Timeout),
            Err(other) => Err(GpuError::Validation(other.to_string())),
        }
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    fn shader_source<'a>(module: &'a ShaderModule) -> Result<&'a str, GpuError> {
        std::str::from_utf8(&module.code).map_err(|e| {
            GpuError::ObjectCreation(format!(
                "{} {:?} program is not UTF-8: {e}",
                module.pass, module.stage
            ))
        })
    }

    fn compile(&self, label: &str, source: String) -> Result<wgpu::ShaderModule, GpuError> {
        self.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        })
    }

    fn push_constant_ranges(
        stages: wgpu::ShaderStages,
        size: u32,
    ) -> Vec<wgpu::PushConstantRange> {
        if size == 0 {
            Vec::new()
        } else {
            vec![wgpu::PushConstantRange {
                stages,
                range: 0..size,
            }]
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_render_pipeline(
        &mut self,
        label: &str,
        vertex: &ShaderModule,
        fragment: &ShaderModule,
        color_formats: &[ImageFormat],
        depth_format: Option<ImageFormat>,
        bindings: &BindingLayout,
        push_constant_size: u32,
    ) -> Result<PipelineState, GpuError> {
        let vertex_module =
            self.compile(label, Self::shader_source(vertex)?.to_owned())?;
        let fragment_module =
            self.compile(label, Self::shader_source(fragment)?.to_owned())?;
        let bind_group_layout = self.bind_group_layout(bindings);
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &Self::push_constant_ranges(
                    wgpu::ShaderStages::VERTEX_FRAGMENT,
                    push_constant_size,
                ),
            });
        let mesh_input = vertex.pass == GEOMETRY_PASS;
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: Vertex::SIZE,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &MESH_ATTRIBUTES,
        }];
        let targets: Vec<Option<wgpu::ColorTargetState>> = color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: texture_format(*format),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let pipeline = self.scoped(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vertex_module,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    buffers: if mesh_input { &vertex_buffers[..] } else { &[] },
                },
                primitive: wgpu::PrimitiveState {
                    cull_mode: mesh_input.then_some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: depth_format.map(|format| wgpu::DepthStencilState {
                    format: texture_format(format),
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment_module,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                multiview: None,
                cache: None,
            })
        })?;
        Ok(PipelineState::Render { pipeline })
    }

    fn create_trace_pipeline(
        &mut self,
        label: &str,
        stages: [&ShaderModule; 3],
        bindings: &BindingLayout,
        push_constant_size: u32,
    ) -> Result<PipelineState, GpuError> {
        let mut source = format!(
            "const TEXTURE_ARRAY_LENGTH: u32 = {}u;\n",
            texture_array_length(bindings)
        );
        for stage in stages {
            source.push_str(Self::shader_source(stage)?);
            source.push('\n');
        }
        let module = self.compile(label, source)?;
        let bind_group_layout = self.bind_group_layout(bindings);
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &Self::push_constant_ranges(
                    wgpu::ShaderStages::COMPUTE,
                    push_constant_size,
                ),
            });
        let pipeline = self.scoped(|device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;
        Ok(PipelineState::Trace { pipeline })
    }
}

impl GpuDevice for WgpuDevice {
    fn memory_types(&self) -> &[MemoryType] {
        const TYPES: [MemoryType; 2] = [
            MemoryType {
                device_local: true,
                host_visible: false,
                host_coherent: false,
            },
            MemoryType {
                device_local: false,
                host_visible: true,
                host_coherent: true,
            },
        ];
        &TYPES
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: HANDLE_SIZE,
            shader_group_base_alignment: 64,
            shader_group_handle_alignment: HANDLE_SIZE,
            max_ray_recursion_depth: 31,
        }
    }

    // -- Buffers ---------------------------------------------------------

    fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
        memory_type: u32,
    ) -> Result<BufferId, GpuError> {
        let host_visible = self
            .memory_types()
            .get(memory_type as usize)
            .ok_or_else(|| GpuError::OutOfMemory(format!("memory type {memory_type}")))?
            .host_visible;
        let size = desc.size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.scoped(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage: buffer_usages(desc.usage),
                mapped_at_creation: false,
            })
        })?;
        let id = BufferId::from_raw(self.allocate_id());
        let _ = self.buffers.insert(
            id,
            BufferState {
                buffer,
                size: desc.size,
                shadow: host_visible.then(|| vec![0; size as usize]),
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let _ = self.buffers.remove(&buffer);
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let state = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if offset + data.len() as u64 > state.size {
            return Err(GpuError::Validation(format!(
                "write of {} bytes at {offset} past the end of {buffer:?}",
                data.len()
            )));
        }
        let Some(shadow) = state.shadow.as_mut() else {
            return Err(GpuError::Validation(format!(
                "{buffer:?} is not host-visible"
            )));
        };
        let start = offset as usize;
        shadow[start..start + data.len()].copy_from_slice(data);
        let end = (start + data.len()).next_multiple_of(4).min(shadow.len());
        self.queue
            .write_buffer(&state.buffer, offset, &shadow[start..end]);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferId) -> Result<u64, GpuError> {
        let _ = self.buffer(buffer)?;
        Ok(buffer.raw() << 16)
    }

    // -- Images ----------------------------------------------------------

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageId, GpuError> {
        let texture = self.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: extent_3d(desc.extent),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(desc.format),
                usage: texture_usages(desc.usage),
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = ImageId::from_raw(self.allocate_id());
        let _ = self.images.insert(
            id,
            ImageState {
                texture,
                view,
                extent: desc.extent,
                format: desc.format,
            },
        );
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        let _ = self.images.remove(&image);
    }

    // -- Synchronization -------------------------------------------------

    fn create_fence(&mut self, signaled: bool) -> Result<FenceId, GpuError> {
        let id = FenceId::from_raw(self.allocate_id());
        let _ = self.fences.insert(
            id,
            FenceState {
                signaled,
                submission: None,
                done: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(id)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        let _ = self.fences.remove(&fence);
    }

    fn wait_fence(&mut self, fence: FenceId) -> Result<(), GpuError> {
        let state = self
            .fences
            .get(&fence)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))?;
        if state.signaled {
            return Ok(());
        }
        let Some(submission) = state.submission.clone() else {
            return Err(GpuError::Validation(format!(
                "{fence:?} is unsignalled with no submission pending"
            )));
        };
        self.poll(wgpu::PollType::WaitForSubmissionIndex(submission))?;
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = true;
            state.submission = None;
        }
        Ok(())
    }

    fn fence_signaled(&mut self, fence: FenceId) -> Result<bool, GpuError> {
        self.poll(wgpu::PollType::Poll)?;
        let state = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))?;
        if state.submission.is_some() && state.done.load(Ordering::Acquire) {
            state.signaled = true;
            state.submission = None;
        }
        Ok(state.signaled)
    }

    fn reset_fence(&mut self, fence: FenceId) -> Result<(), GpuError> {
        if !self.fence_signaled(fence)? {
            let pending = self
                .fences
                .get(&fence)
                .is_some_and(|state| state.submission.is_some());
            if pending {
                return Err(GpuError::Validation(format!(
                    "{fence:?} reset while queued work will signal it"
                )));
            }
        }
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = false;
        }
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId, GpuError> {
        let id = SemaphoreId::from_raw(self.allocate_id());
        let _ = self.semaphores.insert(id);
        Ok(id)
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        let _ = self.semaphores.remove(&semaphore);
    }

    // -- Pipelines and bindings ------------------------------------------

    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> Result<PipelineId, GpuError> {
        let state = match desc {
            PipelineDesc::Graphics {
                label,
                vertex,
                fragment,
                color_formats,
                depth_format,
                bindings,
                push_constant_size,
                ..
            } => self.create_render_pipeline(
                label,
                vertex,
                fragment,
                color_formats,
                *depth_format,
                bindings,
                *push_constant_size,
            )?,
            PipelineDesc::RayTracing {
                label,
                raygen,
                miss,
                closest_hit,
                bindings,
                push_constant_size,
                ..
            } => self.create_trace_pipeline(
                label,
                [raygen, miss, closest_hit],
                bindings,
                *push_constant_size,
            )?,
        };
        let id = PipelineId::from_raw(self.allocate_id());
        let _ = self.pipelines.insert(id, state);
        log::debug!("created pipeline '{}' as {id:?}", desc.label());
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        let _ = self.pipelines.remove(&pipeline);
    }

    fn shader_group_handles(
        &self,
        pipeline: PipelineId,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>, GpuError> {
        if !matches!(self.pipelines.get(&pipeline), Some(PipelineState::Trace { .. }))
            || first_group + group_count > 3
        {
            return Err(GpuError::InvalidHandle(format!(
                "{pipeline:?} groups {first_group}..{}",
                first_group + group_count
            )));
        }
        let mut handles = Vec::with_capacity((HANDLE_SIZE * group_count) as usize);
        for group in first_group..first_group + group_count {
            let mut handle = [0u8; HANDLE_SIZE as usize];
            handle[..8].copy_from_slice(&pipeline.raw().to_le_bytes());
            handle[8..12].copy_from_slice(&group.to_le_bytes());
            handles.extend_from_slice(&handle);
        }
        Ok(handles)
    }

    fn create_binding_table(
        &mut self,
        layout: &BindingLayout,
    ) -> Result<BindingTableId, GpuError> {
        let bind_group_layout = self.bind_group_layout(layout);
        let id = BindingTableId::from_raw(self.allocate_id());
        let _ = self.tables.insert(
            id,
            TableState {
                layout: layout.clone(),
                bind_group_layout,
                slots: FxHashMap::default(),
                group: None,
            },
        );
        Ok(id)
    }

    fn update_binding_table(
        &mut self,
        table: BindingTableId,
        writes: &[BindingWrite],
    ) -> Result<(), GpuError> {
        let state = self
            .tables
            .get_mut(&table)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{table:?}")))?;
        for write in writes {
            let entry = state.layout.entry(write.slot).ok_or_else(|| {
                GpuError::Validation(format!("{table:?} has no slot {}", write.slot))
            })?;
            if entry.kind != write.resource.kind() || entry.count != write.resource.count() {
                return Err(GpuError::Validation(format!(
                    "{:?} x{} written into {:?} x{} slot {}",
                    write.resource.kind(),
                    write.resource.count(),
                    entry.kind,
                    entry.count,
                    write.slot
                )));
            }
            let _ = state.slots.insert(write.slot, write.resource.clone());
        }
        state.group = None;
        Ok(())
    }

    fn destroy_binding_table(&mut self, table: BindingTableId) {
        let _ = self.tables.remove(&table);
    }

    // -- Acceleration structures -----------------------------------------

    fn create_bottom_level(
        &mut self,
        desc: &BottomLevelDesc<'_>,
    ) -> Result<AccelerationStructureId, GpuError> {
        let sizes: Vec<wgpu::BlasTriangleGeometrySizeDescriptor> = desc
            .geometries
            .iter()
            .map(|g| wgpu::BlasTriangleGeometrySizeDescriptor {
                vertex_format: wgpu::VertexFormat::Float32x3,
                vertex_count: g.vertex_count,
                index_format: Some(wgpu::IndexFormat::Uint32),
                index_count: Some(g.index_count),
                flags: wgpu::AccelerationStructureGeometryFlags::OPAQUE,
            })
            .collect();
        let blas = self.device.create_blas(
            &wgpu::CreateBlasDescriptor {
                label: Some(desc.label),
                flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
                update_mode: wgpu::AccelerationStructureUpdateMode::Build,
            },
            wgpu::BlasGeometrySizeDescriptors::Triangles {
                descriptors: sizes.clone(),
            },
        );
        let mut triangles = Vec::with_capacity(sizes.len());
        for (geometry, size) in desc.geometries.iter().zip(&sizes) {
            triangles.push(wgpu::BlasTriangleGeometry {
                size,
                vertex_buffer: &self.buffer(geometry.vertex_buffer)?.buffer,
                first_vertex: 0,
                vertex_stride: geometry.vertex_stride,
                index_buffer: Some(&self.buffer(geometry.index_buffer)?.buffer),
                first_index: Some(0),
                transform_buffer: None,
                transform_buffer_offset: None,
            });
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("BLAS build"),
            });
        encoder.build_acceleration_structures(
            Some(&wgpu::BlasBuildEntry {
                blas: &blas,
                geometry: wgpu::BlasGeometries::TriangleGeometries(triangles),
            }),
            None,
        );
        let submission = self.queue.submit(Some(encoder.finish()));
        self.poll(wgpu::PollType::WaitForSubmissionIndex(submission))?;

        let id = AccelerationStructureId::from_raw(self.allocate_id());
        let _ = self.blas_by_address.insert(Self::address_of(id), id);
        let _ = self.structures.insert(id, StructureState::Bottom { blas });
        log::debug!(
            "built BLAS '{}' with {} geometries",
            desc.label,
            desc.geometries.len()
        );
        Ok(id)
    }

    fn top_level_sizes(&self, instance_count: u32) -> AccelerationStructureSizes {
        let instances = u64::from(instance_count.max(1));
        AccelerationStructureSizes {
            storage_size: instances * INSTANCE_BYTES * 2,
            scratch_size: instances * INSTANCE_BYTES,
        }
    }

    fn create_top_level(
        &mut self,
        storage: BufferId,
        sizes: AccelerationStructureSizes,
        max_instances: u32,
    ) -> Result<AccelerationStructureId, GpuError> {
        let backing = self.buffer(storage)?;
        if backing.size < sizes.storage_size {
            return Err(GpuError::Validation(format!(
                "{storage:?} holds {} bytes, TLAS needs {}",
                backing.size, sizes.storage_size
            )));
        }
        let tlas = self.device.create_tlas(&wgpu::CreateTlasDescriptor {
            label: Some("scene TLAS"),
            max_instances,
            flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
            update_mode: wgpu::AccelerationStructureUpdateMode::Build,
        });
        let id = AccelerationStructureId::from_raw(self.allocate_id());
        let _ = self.structures.insert(
            id,
            StructureState::Top {
                tlas,
                max_instances,
            },
        );
        Ok(id)
    }

    fn acceleration_structure_address(
        &self,
        structure: AccelerationStructureId,
    ) -> Result<u64, GpuError> {
        if self.structures.contains_key(&structure) {
            Ok(Self::address_of(structure))
        } else {
            Err(GpuError::InvalidHandle(format!("{structure:?}")))
        }
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureId) {
        let _ = self.blas_by_address.remove(&Self::address_of(structure));
        let _ = self.structures.remove(&structure);
    }

    // -- Surface and queue -----------------------------------------------

    fn configure_surface(&mut self, extent: Extent2d) -> Result<SwapchainInfo, GpuError> {
        if extent.is_empty() {
            return Err(GpuError::Unsupported(format!("surface extent {extent}")));
        }
        self.acquired = None;
        self.surface.config.width = extent.width;
        self.surface.config.height = extent.height;
        self.surface
            .surface
            .configure(&self.device, &self.surface.config);
        self.surface.configured = true;
        let images: Vec<ImageId> = (0..SWAPCHAIN_IMAGE_COUNT)
            .map(|_| ImageId::from_raw(self.allocate_id()))
            .collect();
        self.surface.images.clone_from(&images);
        self.next_image = 0;
        log::debug!("surface configured at {extent}");
        Ok(SwapchainInfo {
            extent,
            format: self.surface.format,
            images,
        })
    }

    fn current_surface_extent(&self) -> Option<Extent2d> {
        self.window_extent
    }

    fn acquire_next_image(
        &mut self,
        signal: SemaphoreId,
    ) -> Result<AcquireOutcome, GpuError> {
        if !self.semaphores.contains(&signal) {
            return Err(GpuError::InvalidHandle(format!("{signal:?}")));
        }
        if !self.surface.configured {
            return Err(GpuError::Validation("acquire before configure".into()));
        }
        if self.acquired.is_some() {
            return Err(GpuError::Validation(
                "acquire while the previous image is unpresented".into(),
            ));
        }
        if self.window_changed() {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let frame = match self.surface.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                return Ok(AcquireOutcome::OutOfDate)
            }
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("surface acquire timed out");
                return Ok(AcquireOutcome::OutOfDate);
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(GpuError::OutOfMemory("surface acquire".into()))
            }
            Err(other) => {
                log::error!("surface acquire failed: {other}");
                return Err(GpuError::DeviceLost);
            }
        };
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % SWAPCHAIN_IMAGE_COUNT;
        let suboptimal = frame.suboptimal;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.acquired = Some(AcquiredImage {
            image_index,
            frame,
            view,
        });
        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal,
        })
    }

    fn submit(&mut self, submit: &SubmitInfo<'_>) -> Result<(), GpuError> {
        self.check_health()?;
        if let Some(missing) = submit
            .wait
            .iter()
            .chain(submit.signal)
            .find(|s| !self.semaphores.contains(*s))
        {
            return Err(GpuError::InvalidHandle(format!("{missing:?}")));
        }
        if let Some(fence) = submit.fence {
            match self.fences.get(&fence) {
                None => return Err(GpuError::InvalidHandle(format!("{fence:?}"))),
                Some(state) if state.signaled || state.submission.is_some() => {
                    return Err(GpuError::Validation(format!(
                        "submit signals {fence:?}, which was not reset"
                    )))
                }
                Some(_) => {}
            }
        }

        self.prepare(submit.commands)?;
        let commands = self.encode(submit.commands.as_slice())?;
        let submission = self.queue.submit(Some(commands));
        if let Some(state) = submit.fence.and_then(|f| self.fences.get_mut(&f)) {
            let done = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&done);
            self.queue
                .on_submitted_work_done(move || flag.store(true, Ordering::Release));
            state.submission = Some(submission);
            state.done = done;
        }
        Ok(())
    }

    fn present(
        &mut self,
        image_index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentOutcome, GpuError> {
        if !self.semaphores.contains(&wait) {
            return Err(GpuError::InvalidHandle(format!("{wait:?}")));
        }
        let acquired = self
            .acquired
            .take()
            .filter(|a| a.image_index == image_index)
            .ok_or_else(|| {
                GpuError::Validation(format!("present of unacquired image {image_index}"))
            })?;
        if self.window_changed() {
            return Ok(PresentOutcome::OutOfDate);
        }
        let suboptimal = acquired.frame.suboptimal;
        acquired.frame.present();
        Ok(if suboptimal {
            PresentOutcome::Suboptimal
        } else {
            PresentOutcome::Presented
        })
    }

    fn wait_idle(&mut self) -> Result<(), GpuError> {
        self.poll(wgpu::PollType::Wait)?;
        for state in self.fences.values_mut() {
            if state.submission.take().is_some() {
                state.signaled = true;
            }
        }
        Ok(())
    }
}
