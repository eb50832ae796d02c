//! Deterministic software implementation of [`GpuDevice`].
//!
//! Work is executed when it is submitted, but a submission only *completes*
//! (signals its fence, releases the resources it references) once the CPU
//! waits on its fence or on the whole queue. Everything an explicit API
//! forbids while work is in flight is therefore observable: writing or
//! destroying a resource queued work still references, rewriting a binding
//! table that is in use, resetting a fence that will still signal.
//!
//! Violations that a driver would report through validation layers are
//! returned as [`GpuError::Validation`] when they can be detected at the
//! call site, and collected in [`HeadlessDevice::validation_errors`]
//! otherwise (destroy calls have no error channel).
//!
//! The bundled pass programs are emulated on the CPU so that image
//! contents can be inspected in tests:
//! - geometry: covers the targets with depth `0.5`, normal `+Z` and the
//!   draw's base color;
//! - ray tracing: miss color where the TLAS is empty or the G-buffer depth
//!   is `1.0`, otherwise the lit G-buffer albedo, blended with the previous
//!   image by `1 / (accumulated + 1)`;
//! - lighting: lit G-buffer albedo, clear color where nothing was drawn;
//! - blits: nearest sampling with conversion to the destination format.

mod execute;

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

use super::command::{Command, CommandList};
use super::device::{GpuDevice, GpuError, SubmitInfo};
use super::types::{
    AccelerationInstance, AccelerationStructureId, AccelerationStructureSizes,
    AcquireOutcome, BindingLayout, BindingResource, BindingTableId,
    BindingWrite, BottomLevelDesc, BufferDesc, BufferId, BufferUsage,
    Extent2d, FenceId, ImageDesc, ImageFormat, ImageId, ImageLayout,
    ImageUsage, MemoryType, PipelineDesc, PipelineId, PresentOutcome,
    RayTracingProperties, SemaphoreId, ShaderStage, SwapchainInfo,
};
use crate::gpu::shader_library::{GEOMETRY_PASS, LIGHTING_PASS};

const SWAPCHAIN_IMAGE_COUNT: usize = 3;
const BUFFER_ADDRESS_BASE: u64 = 0x1000_0000;
const STRUCTURE_ADDRESS_BASE: u64 = 0x0100_0000_0000;

/// Counters of device activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Queue submissions accepted.
    pub submissions: usize,
    /// Images acquired.
    pub acquires: usize,
    /// Present requests (including out-of-date ones).
    pub presents: usize,
    /// Blocking waits per fence.
    pub fence_waits: FxHashMap<FenceId, usize>,
    /// Queue drains.
    pub idle_waits: usize,
    /// Top-level builds executed.
    pub tlas_builds: usize,
    /// Trace dispatches executed.
    pub traces: usize,
    /// Surface (re)configurations.
    pub surface_configurations: usize,
}

/// What one trace dispatch read and wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Frame counter push constant.
    pub frame_counter: u32,
    /// Accumulated-frame push constant.
    pub accumulated: u32,
    /// Random seed push constant.
    pub seed: u32,
    /// Launch size.
    pub extent: Extent2d,
    /// Records in the traced TLAS.
    pub instance_count: usize,
    /// Pixels whose primary ray hit geometry.
    pub hit_pixels: usize,
    /// Image bound as the previous frame.
    pub previous: ImageId,
    /// Digest of the previous-frame image as read.
    pub previous_digest: u64,
    /// Image bound as the output.
    pub output: ImageId,
    /// Digest of the output image as written.
    pub output_digest: u64,
}

/// What one successful present showed.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentRecord {
    /// Swapchain image index.
    pub image_index: u32,
    /// Surface size.
    pub extent: Extent2d,
    /// Texel at the center of the image.
    pub center_texel: [f32; 4],
    /// Digest of the whole image.
    pub digest: u64,
}

#[derive(Debug)]
struct BufferState {
    size: u64,
    usage: BufferUsage,
    host_visible: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ImageState {
    extent: Extent2d,
    format: ImageFormat,
    usage: ImageUsage,
    layout: ImageLayout,
    texels: Vec<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    Geometry,
    Lighting,
    Other,
}

#[derive(Debug)]
enum PipelineState {
    Graphics {
        program: Program,
        bindings: BindingLayout,
        push_constant_size: u32,
    },
    RayTracing {
        bindings: BindingLayout,
        push_constant_size: u32,
    },
}

impl PipelineState {
    fn bindings(&self) -> &BindingLayout {
        match self {
            Self::Graphics { bindings, .. } | Self::RayTracing { bindings, .. } => {
                bindings
            }
        }
    }

    fn push_constant_size(&self) -> u32 {
        match self {
            Self::Graphics {
                push_constant_size, ..
            }
            | Self::RayTracing {
                push_constant_size, ..
            } => *push_constant_size,
        }
    }
}

#[derive(Debug)]
struct TableState {
    layout: BindingLayout,
    slots: FxHashMap<u32, BindingResource>,
}

#[derive(Debug)]
enum StructureState {
    Bottom,
    Top {
        storage: BufferId,
        max_instances: u32,
        built: bool,
        awaiting_barrier: bool,
        instances: Vec<AccelerationInstance>,
    },
}

#[derive(Debug)]
struct Swapchain {
    extent: Extent2d,
    images: Vec<ImageId>,
    next: usize,
    acquired: FxHashSet<u32>,
}

/// One submitted, not yet completed batch of work.
#[derive(Debug)]
struct Pending {
    fence: Option<FenceId>,
    images: FxHashSet<ImageId>,
    buffers: FxHashSet<BufferId>,
    tables: FxHashSet<BindingTableId>,
    structures: FxHashSet<AccelerationStructureId>,
}

/// Software [`GpuDevice`] for tests and validation.
#[derive(Debug)]
pub struct HeadlessDevice {
    next_id: u64,
    memory_types: Vec<MemoryType>,
    properties: RayTracingProperties,
    buffers: FxHashMap<BufferId, BufferState>,
    images: FxHashMap<ImageId, ImageState>,
    fences: FxHashMap<FenceId, bool>,
    semaphores: FxHashMap<SemaphoreId, bool>,
    pipelines: FxHashMap<PipelineId, PipelineState>,
    tables: FxHashMap<BindingTableId, TableState>,
    structures: FxHashMap<AccelerationStructureId, StructureState>,
    swapchain: Option<Swapchain>,
    window_extent: Extent2d,
    pending: Vec<Pending>,
    stats: HeadlessStats,
    trace_log: Vec<TraceRecord>,
    present_log: Vec<PresentRecord>,
    validation_errors: Vec<String>,
    inject_out_of_date: usize,
    inject_suboptimal: usize,
    inject_submit_failure: bool,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Device with an 800×600 window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(Extent2d::new(800, 600))
    }

    /// Device whose window reports `extent`.
    #[must_use]
    pub fn with_window(extent: Extent2d) -> Self {
        Self {
            next_id: 1,
            memory_types: vec![
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
            ],
            properties: RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_base_alignment: 64,
                shader_group_handle_alignment: 32,
                max_ray_recursion_depth: 31,
            },
            buffers: FxHashMap::default(),
            images: FxHashMap::default(),
            fences: FxHashMap::default(),
            semaphores: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            tables: FxHashMap::default(),
            structures: FxHashMap::default(),
            swapchain: None,
            window_extent: extent,
            pending: Vec::new(),
            stats: HeadlessStats::default(),
            trace_log: Vec::new(),
            present_log: Vec::new(),
            validation_errors: Vec::new(),
            inject_out_of_date: 0,
            inject_suboptimal: 0,
            inject_submit_failure: false,
        }
    }

    /// Override the reported ray tracing limits.
    #[must_use]
    pub const fn with_ray_tracing_properties(
        mut self,
        properties: RayTracingProperties,
    ) -> Self {
        self.properties = properties;
        self
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Simulate a window resize. Acquire and present report out-of-date
    /// until the surface is reconfigured at this extent.
    pub fn set_window_extent(&mut self, extent: Extent2d) {
        self.window_extent = extent;
    }

    /// The next `count` acquires report out-of-date.
    pub fn inject_out_of_date_acquires(&mut self, count: usize) {
        self.inject_out_of_date = count;
    }

    /// The next `count` successful presents report suboptimal.
    pub fn inject_suboptimal_presents(&mut self, count: usize) {
        self.inject_suboptimal = count;
    }

    /// The next submit fails with [`GpuError::DeviceLost`].
    pub fn inject_submit_failure(&mut self) {
        self.inject_submit_failure = true;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> &HeadlessStats {
        &self.stats
    }

    /// Every trace dispatch executed, in order.
    #[must_use]
    pub fn trace_log(&self) -> &[TraceRecord] {
        &self.trace_log
    }

    /// Every successful present, in order.
    #[must_use]
    pub fn present_log(&self) -> &[PresentRecord] {
        &self.present_log
    }

    /// Violations found outside of a fallible call.
    #[must_use]
    pub fn validation_errors(&self) -> &[String] {
        &self.validation_errors
    }

    /// Submissions that have not completed yet.
    #[must_use]
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Contents of a live buffer.
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    /// Texels of a live image, row-major.
    #[must_use]
    pub fn image_texels(&self, image: ImageId) -> Option<&[[f32; 4]]> {
        self.images.get(&image).map(|i| i.texels.as_slice())
    }

    /// Current layout of a live image.
    #[must_use]
    pub fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
        self.images.get(&image).map(|i| i.layout)
    }

    /// Extent of a live image.
    #[must_use]
    pub fn image_extent(&self, image: ImageId) -> Option<Extent2d> {
        self.images.get(&image).map(|i| i.extent)
    }

    /// Digest of a live image's texels.
    #[must_use]
    pub fn image_digest(&self, image: ImageId) -> Option<u64> {
        self.images.get(&image).map(|i| digest(&i.texels))
    }

    /// Slot contents of a binding table, ordered by slot.
    #[must_use]
    pub fn binding_table_contents(
        &self,
        table: BindingTableId,
    ) -> Option<Vec<BindingWrite>> {
        self.tables.get(&table).map(|t| {
            let mut writes: Vec<BindingWrite> = t
                .slots
                .iter()
                .map(|(slot, resource)| BindingWrite {
                    slot: *slot,
                    resource: resource.clone(),
                })
                .collect();
            writes.sort_by_key(|w| w.slot);
            writes
        })
    }

    /// Instance records of the last build of a top-level structure.
    #[must_use]
    pub fn top_level_instances(
        &self,
        structure: AccelerationStructureId,
    ) -> Option<&[AccelerationInstance]> {
        match self.structures.get(&structure) {
            Some(StructureState::Top { instances, .. }) => Some(instances),
            _ => None,
        }
    }

    /// Number of live objects of every kind (swapchain images excluded).
    #[must_use]
    pub fn live_objects(&self) -> usize {
        let swapchain_images =
            self.swapchain.as_ref().map_or(0, |s| s.images.len());
        self.buffers.len()
            + self.images.len().saturating_sub(swapchain_images)
            + self.fences.len()
            + self.semaphores.len()
            + self.pipelines.len()
            + self.tables.len()
            + self.structures.len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record_violation(&mut self, message: String) {
        log::warn!("headless validation: {message}");
        self.validation_errors.push(message);
    }

    fn buffer_address(buffer: BufferId) -> u64 {
        BUFFER_ADDRESS_BASE + (buffer.raw() << 16)
    }

    fn structure_address(structure: AccelerationStructureId) -> u64 {
        STRUCTURE_ADDRESS_BASE + (structure.raw() << 12)
    }

    fn structure_by_address(
        &self,
        address: u64,
    ) -> Option<AccelerationStructureId> {
        if address < STRUCTURE_ADDRESS_BASE {
            return None;
        }
        let id = AccelerationStructureId::from_raw(
            (address - STRUCTURE_ADDRESS_BASE) >> 12,
        );
        matches!(self.structures.get(&id), Some(StructureState::Bottom))
            .then_some(id)
    }

    fn group_handle(&self, pipeline: PipelineId, group: u32) -> Vec<u8> {
        let mut handle = vec![0; self.properties.shader_group_handle_size as usize];
        let tag = (pipeline.raw() << 8) | u64::from(group + 1);
        let bytes = tag.to_le_bytes();
        let n = bytes.len().min(handle.len());
        handle[..n].copy_from_slice(&bytes[..n]);
        handle
    }

    fn image_in_use(&self, image: ImageId) -> bool {
        self.pending.iter().any(|p| p.images.contains(&image))
    }

    fn buffer_in_use(&self, buffer: BufferId) -> bool {
        self.pending.iter().any(|p| p.buffers.contains(&buffer))
    }

    fn table_in_use(&self, table: BindingTableId) -> bool {
        self.pending.iter().any(|p| p.tables.contains(&table))
    }

    fn structure_in_use(&self, structure: AccelerationStructureId) -> bool {
        self.pending.iter().any(|p| p.structures.contains(&structure))
    }

    /// Resources a submission keeps alive until it completes.
    fn collect_references(
        &self,
        commands: &CommandList,
        fence: Option<FenceId>,
    ) -> Pending {
        let mut pending = Pending {
            fence,
            images: FxHashSet::default(),
            buffers: FxHashSet::default(),
            tables: FxHashSet::default(),
            structures: FxHashSet::default(),
        };
        for command in commands {
            pending.images.extend(command.images());
            pending.buffers.extend(command.buffers());
            match command {
                Command::BindBindingTable(table) => {
                    let _ = pending.tables.insert(*table);
                    if let Some(state) = self.tables.get(table) {
                        for resource in state.slots.values() {
                            pending.images.extend(resource.images());
                            pending.buffers.extend(resource.buffer());
                            if let BindingResource::AccelerationStructure(s) =
                                resource
                            {
                                let _ = pending.structures.insert(*s);
                            }
                        }
                    }
                }
                Command::BuildTopLevel { tlas, .. } => {
                    let _ = pending.structures.insert(*tlas);
                }
                _ => {}
            }
        }
        pending
    }

    /// Complete the oldest `count` pending submissions.
    fn retire(&mut self, count: usize) {
        for pending in self.pending.drain(..count) {
            if let Some(fence) = pending.fence {
                if let Some(signaled) = self.fences.get_mut(&fence) {
                    *signaled = true;
                }
            }
        }
    }

    fn check_semaphores(&self, submit: &SubmitInfo<'_>) -> Result<(), GpuError> {
        for wait in submit.wait {
            match self.semaphores.get(wait) {
                Some(true) => {}
                Some(false) => {
                    return Err(GpuError::Validation(format!(
                        "submit waits on {wait:?} which nothing signals"
                    )))
                }
                None => {
                    return Err(GpuError::InvalidHandle(format!("{wait:?}")))
                }
            }
        }
        for signal in submit.signal {
            match self.semaphores.get(signal) {
                Some(false) => {}
                Some(true) => {
                    return Err(GpuError::Validation(format!(
                        "submit signals {signal:?} which is already signaled"
                    )))
                }
                None => {
                    return Err(GpuError::InvalidHandle(format!("{signal:?}")))
                }
            }
        }
        Ok(())
    }
}

fn digest(texels: &[[f32; 4]]) -> u64 {
    let mut hasher = FxHasher::default();
    for texel in texels {
        for channel in texel {
            channel.to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

impl GpuDevice for HeadlessDevice {
    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
        memory_type: u32,
    ) -> Result<BufferId, GpuError> {
        let ty = self
            .memory_types
            .get(memory_type as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::OutOfMemory(format!("memory type {memory_type}"))
            })?;
        if desc.size == 0 {
            return Err(GpuError::ObjectCreation(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        let id = BufferId::from_raw(self.allocate_id());
        let _ = self.buffers.insert(
            id,
            BufferState {
                size: desc.size,
                usage: desc.usage,
                host_visible: ty.host_visible,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffer_in_use(buffer) {
            self.record_violation(format!(
                "{buffer:?} destroyed while queued work uses it"
            ));
        }
        let backs_structure = self.structures.values().any(|s| {
            matches!(s, StructureState::Top { storage, .. } if *storage == buffer)
        });
        if backs_structure {
            self.record_violation(format!(
                "{buffer:?} destroyed before the acceleration structure it \
                 stores"
            ));
        }
        if self.buffers.remove(&buffer).is_none() {
            self.record_violation(format!("{buffer:?} destroyed twice"));
        }
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        if self.buffer_in_use(buffer) {
            return Err(GpuError::Validation(format!(
                "host write to {buffer:?} while queued work uses it"
            )));
        }
        let state = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if !state.host_visible {
            return Err(GpuError::Validation(format!(
                "host write to device-local {buffer:?}"
            )));
        }
        let end = offset + data.len() as u64;
        if end > state.size {
            return Err(GpuError::Validation(format!(
                "host write of {end} bytes overflows {buffer:?} ({} bytes)",
                state.size
            )));
        }
        state.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferId) -> Result<u64, GpuError> {
        let state = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if !state.usage.contains(BufferUsage::DEVICE_ADDRESS) {
            return Err(GpuError::Validation(format!(
                "{buffer:?} was created without device-address usage"
            )));
        }
        Ok(Self::buffer_address(buffer))
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageId, GpuError> {
        if desc.extent.is_empty() {
            return Err(GpuError::ObjectCreation(format!(
                "image '{}' has empty extent {}",
                desc.label, desc.extent
            )));
        }
        let id = ImageId::from_raw(self.allocate_id());
        let _ = self.images.insert(
            id,
            ImageState {
                extent: desc.extent,
                format: desc.format,
                usage: desc.usage,
                layout: ImageLayout::Undefined,
                texels: vec![[0.0; 4]; desc.extent.pixel_count()],
            },
        );
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        if self.image_in_use(image) {
            self.record_violation(format!(
                "{image:?} destroyed while queued work uses it"
            ));
        }
        let is_swapchain = self
            .swapchain
            .as_ref()
            .is_some_and(|s| s.images.contains(&image));
        if is_swapchain {
            self.record_violation(format!(
                "{image:?} is owned by the swapchain"
            ));
            return;
        }
        if self.images.remove(&image).is_none() {
            self.record_violation(format!("{image:?} destroyed twice"));
        }
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceId, GpuError> {
        let id = FenceId::from_raw(self.allocate_id());
        let _ = self.fences.insert(id, signaled);
        Ok(id)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        if self.pending.iter().any(|p| p.fence == Some(fence)) {
            self.record_violation(format!(
                "{fence:?} destroyed while a submission will signal it"
            ));
        }
        if self.fences.remove(&fence).is_none() {
            self.record_violation(format!("{fence:?} destroyed twice"));
        }
    }

    fn wait_fence(&mut self, fence: FenceId) -> Result<(), GpuError> {
        let signaled = *self
            .fences
            .get(&fence)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))?;
        *self.stats.fence_waits.entry(fence).or_insert(0) += 1;
        if signaled {
            return Ok(());
        }
        let position = self
            .pending
            .iter()
            .rposition(|p| p.fence == Some(fence))
            .ok_or_else(|| {
                GpuError::Validation(format!(
                    "wait on {fence:?} which no queued work will signal"
                ))
            })?;
        self.retire(position + 1);
        Ok(())
    }

    fn fence_signaled(&mut self, fence: FenceId) -> Result<bool, GpuError> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))
    }

    fn reset_fence(&mut self, fence: FenceId) -> Result<(), GpuError> {
        if self.pending.iter().any(|p| p.fence == Some(fence)) {
            return Err(GpuError::Validation(format!(
                "reset of {fence:?} while a submission will signal it"
            )));
        }
        let signaled = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId, GpuError> {
        let id = SemaphoreId::from_raw(self.allocate_id());
        let _ = self.semaphores.insert(id, false);
        Ok(id)
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        if !self.pending.is_empty() {
            self.record_violation(format!(
                "{semaphore:?} destroyed while the queue is busy"
            ));
        }
        if self.semaphores.remove(&semaphore).is_none() {
            self.record_violation(format!("{semaphore:?} destroyed twice"));
        }
    }

    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> Result<PipelineId, GpuError> {
        let state = match desc {
            PipelineDesc::Graphics {
                label,
                vertex,
                fragment,
                extent,
                bindings,
                push_constant_size,
                ..
            } => {
                if vertex.stage != ShaderStage::Vertex
                    || fragment.stage != ShaderStage::Fragment
                {
                    return Err(GpuError::ObjectCreation(format!(
                        "pipeline '{label}' has mismatched shader stages"
                    )));
                }
                if vertex.code.is_empty() || fragment.code.is_empty() {
                    return Err(GpuError::ObjectCreation(format!(
                        "pipeline '{label}' has an empty program"
                    )));
                }
                if extent.is_empty() {
                    return Err(GpuError::ObjectCreation(format!(
                        "pipeline '{label}' has empty viewport {extent}"
                    )));
                }
                let program = match vertex.pass {
                    GEOMETRY_PASS => Program::Geometry,
                    LIGHTING_PASS => Program::Lighting,
                    _ => Program::Other,
                };
                PipelineState::Graphics {
                    program,
                    bindings: (*bindings).clone(),
                    push_constant_size: *push_constant_size,
                }
            }
            PipelineDesc::RayTracing {
                label,
                raygen,
                miss,
                closest_hit,
                max_recursion_depth,
                bindings,
                push_constant_size,
            } => {
                let stages = [
                    (raygen.stage, ShaderStage::RayGeneration),
                    (miss.stage, ShaderStage::Miss),
                    (closest_hit.stage, ShaderStage::ClosestHit),
                ];
                if stages.iter().any(|(got, want)| got != want) {
                    return Err(GpuError::ObjectCreation(format!(
                        "pipeline '{label}' has mismatched shader stages"
                    )));
                }
                if *max_recursion_depth > self.properties.max_ray_recursion_depth
                {
                    return Err(GpuError::Unsupported(format!(
                        "recursion depth {max_recursion_depth} exceeds {}",
                        self.properties.max_ray_recursion_depth
                    )));
                }
                PipelineState::RayTracing {
                    bindings: (*bindings).clone(),
                    push_constant_size: *push_constant_size,
                }
            }
        };
        let id = PipelineId::from_raw(self.allocate_id());
        let _ = self.pipelines.insert(id, state);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if !self.pending.is_empty() {
            self.record_violation(format!(
                "{pipeline:?} destroyed while the queue is busy"
            ));
        }
        if self.pipelines.remove(&pipeline).is_none() {
            self.record_violation(format!("{pipeline:?} destroyed twice"));
        }
    }

    fn shader_group_handles(
        &self,
        pipeline: PipelineId,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>, GpuError> {
        match self.pipelines.get(&pipeline) {
            Some(PipelineState::RayTracing { .. })
                if first_group + group_count <= 3 => {}
            _ => {
                return Err(GpuError::InvalidHandle(format!(
                    "{pipeline:?} has no groups {first_group}..{}",
                    first_group + group_count
                )))
            }
        }
        Ok((first_group..first_group + group_count)
            .flat_map(|group| self.group_handle(pipeline, group))
            .collect())
    }

    fn create_binding_table(
        &mut self,
        layout: &BindingLayout,
    ) -> Result<BindingTableId, GpuError> {
        let id = BindingTableId::from_raw(self.allocate_id());
        let _ = self.tables.insert(
            id,
            TableState {
                layout: layout.clone(),
                slots: FxHashMap::default(),
            },
        );
        Ok(id)
    }

    fn update_binding_table(
        &mut self,
        table: BindingTableId,
        writes: &[BindingWrite],
    ) -> Result<(), GpuError> {
        if self.table_in_use(table) {
            return Err(GpuError::Validation(format!(
                "{table:?} rewritten while queued work uses it"
            )));
        }
        for write in writes {
            self.check_resource_alive(&write.resource)?;
        }
        let state = self
            .tables
            .get_mut(&table)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{table:?}")))?;
        for write in writes {
            let entry = state.layout.entry(write.slot).ok_or_else(|| {
                GpuError::Validation(format!(
                    "{table:?} has no slot {}",
                    write.slot
                ))
            })?;
            if entry.kind != write.resource.kind()
                || entry.count != write.resource.count()
            {
                return Err(GpuError::Validation(format!(
                    "slot {} expects {} x {:?}, got {} x {:?}",
                    write.slot,
                    entry.count,
                    entry.kind,
                    write.resource.count(),
                    write.resource.kind()
                )));
            }
            let _ = state.slots.insert(write.slot, write.resource.clone());
        }
        Ok(())
    }

    fn destroy_binding_table(&mut self, table: BindingTableId) {
        if self.table_in_use(table) {
            self.record_violation(format!(
                "{table:?} destroyed while queued work uses it"
            ));
        }
        if self.tables.remove(&table).is_none() {
            self.record_violation(format!("{table:?} destroyed twice"));
        }
    }

    fn create_bottom_level(
        &mut self,
        desc: &BottomLevelDesc<'_>,
    ) -> Result<AccelerationStructureId, GpuError> {
        for geometry in &desc.geometries {
            let vertices = self.buffers.get(&geometry.vertex_buffer).ok_or_else(
                || GpuError::InvalidHandle(format!("{:?}", geometry.vertex_buffer)),
            )?;
            let indices = self.buffers.get(&geometry.index_buffer).ok_or_else(
                || GpuError::InvalidHandle(format!("{:?}", geometry.index_buffer)),
            )?;
            if u64::from(geometry.vertex_count) * geometry.vertex_stride
                > vertices.size
                || u64::from(geometry.index_count) * 4 > indices.size
                || geometry.index_count % 3 != 0
            {
                return Err(GpuError::Validation(format!(
                    "BLAS '{}' geometry exceeds its buffers",
                    desc.label
                )));
            }
        }
        let id = AccelerationStructureId::from_raw(self.allocate_id());
        let _ = self.structures.insert(id, StructureState::Bottom);
        Ok(id)
    }

    fn top_level_sizes(&self, instance_count: u32) -> AccelerationStructureSizes {
        AccelerationStructureSizes {
            storage_size: 1024 + 128 * u64::from(instance_count),
            scratch_size: 512 + 64 * u64::from(instance_count),
        }
    }

    fn create_top_level(
        &mut self,
        storage: BufferId,
        sizes: AccelerationStructureSizes,
        max_instances: u32,
    ) -> Result<AccelerationStructureId, GpuError> {
        let buffer = self
            .buffers
            .get(&storage)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{storage:?}")))?;
        if !buffer
            .usage
            .contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE)
            || buffer.size < sizes.storage_size
            || self.top_level_sizes(max_instances).storage_size
                > sizes.storage_size
        {
            return Err(GpuError::Validation(format!(
                "{storage:?} cannot hold a TLAS of {max_instances} instances"
            )));
        }
        let id = AccelerationStructureId::from_raw(self.allocate_id());
        let _ = self.structures.insert(
            id,
            StructureState::Top {
                storage,
                max_instances,
                built: false,
                awaiting_barrier: false,
                instances: Vec::new(),
            },
        );
        Ok(id)
    }

    fn acceleration_structure_address(
        &self,
        structure: AccelerationStructureId,
    ) -> Result<u64, GpuError> {
        if self.structures.contains_key(&structure) {
            Ok(Self::structure_address(structure))
        } else {
            Err(GpuError::InvalidHandle(format!("{structure:?}")))
        }
    }

    fn destroy_acceleration_structure(
        &mut self,
        structure: AccelerationStructureId,
    ) {
        if self.structure_in_use(structure) {
            self.record_violation(format!(
                "{structure:?} destroyed while queued work uses it"
            ));
        }
        if self.structures.remove(&structure).is_none() {
            self.record_violation(format!("{structure:?} destroyed twice"));
        }
    }

    fn configure_surface(
        &mut self,
        extent: Extent2d,
    ) -> Result<SwapchainInfo, GpuError> {
        if extent.is_empty() {
            return Err(GpuError::Unsupported(format!(
                "surface extent {extent}"
            )));
        }
        if let Some(old) = self.swapchain.take() {
            for image in old.images {
                if self.image_in_use(image) {
                    self.record_violation(format!(
                        "swapchain {image:?} retired while queued work uses it"
                    ));
                }
                let _ = self.images.remove(&image);
            }
        }
        let mut images = Vec::with_capacity(SWAPCHAIN_IMAGE_COUNT);
        for _ in 0..SWAPCHAIN_IMAGE_COUNT {
            images.push(self.create_image(&ImageDesc {
                label: "swapchain",
                extent,
                format: ImageFormat::Bgra8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::COLOR_ATTACHMENT,
            })?);
        }
        self.swapchain = Some(Swapchain {
            extent,
            images: images.clone(),
            next: 0,
            acquired: FxHashSet::default(),
        });
        self.stats.surface_configurations += 1;
        Ok(SwapchainInfo {
            extent,
            format: ImageFormat::Bgra8Unorm,
            images,
        })
    }

    fn current_surface_extent(&self) -> Option<Extent2d> {
        Some(self.window_extent)
    }

    fn acquire_next_image(
        &mut self,
        signal: SemaphoreId,
    ) -> Result<AcquireOutcome, GpuError> {
        match self.semaphores.get(&signal) {
            Some(false) => {}
            Some(true) => {
                return Err(GpuError::Validation(format!(
                    "acquire signals {signal:?} which is already signaled"
                )))
            }
            None => return Err(GpuError::InvalidHandle(format!("{signal:?}"))),
        }
        if self.inject_out_of_date > 0 {
            self.inject_out_of_date -= 1;
            return Ok(AcquireOutcome::OutOfDate);
        }
        let window = self.window_extent;
        let swapchain = self.swapchain.as_mut().ok_or_else(|| {
            GpuError::Validation("acquire before the surface is configured".into())
        })?;
        if swapchain.extent != window {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let image_index = swapchain.next as u32;
        swapchain.next = (swapchain.next + 1) % swapchain.images.len();
        if !swapchain.acquired.insert(image_index) {
            return Err(GpuError::Validation(format!(
                "swapchain image {image_index} acquired twice"
            )));
        }
        let _ = self.semaphores.insert(signal, true);
        self.stats.acquires += 1;
        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal: false,
        })
    }

    fn submit(&mut self, submit: &SubmitInfo<'_>) -> Result<(), GpuError> {
        if self.inject_submit_failure {
            self.inject_submit_failure = false;
            return Err(GpuError::DeviceLost);
        }
        if let Some(fence) = submit.fence {
            match self.fences.get(&fence) {
                Some(false)
                    if !self.pending.iter().any(|p| p.fence == Some(fence)) => {}
                Some(_) => {
                    return Err(GpuError::Validation(format!(
                        "submit with {fence:?} that is signaled or in use"
                    )))
                }
                None => {
                    return Err(GpuError::InvalidHandle(format!("{fence:?}")))
                }
            }
        }
        self.check_semaphores(submit)?;
        self.execute(submit.commands)?;
        for wait in submit.wait {
            let _ = self.semaphores.insert(*wait, false);
        }
        for signal in submit.signal {
            let _ = self.semaphores.insert(*signal, true);
        }
        let pending = self.collect_references(submit.commands, submit.fence);
        self.pending.push(pending);
        self.stats.submissions += 1;
        Ok(())
    }

    fn present(
        &mut self,
        image_index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentOutcome, GpuError> {
        match self.semaphores.get(&wait) {
            Some(true) => {}
            Some(false) => {
                return Err(GpuError::Validation(format!(
                    "present waits on {wait:?} which nothing signals"
                )))
            }
            None => return Err(GpuError::InvalidHandle(format!("{wait:?}"))),
        }
        let _ = self.semaphores.insert(wait, false);
        self.stats.presents += 1;
        let window = self.window_extent;
        let swapchain = self.swapchain.as_mut().ok_or_else(|| {
            GpuError::Validation("present before the surface is configured".into())
        })?;
        if !swapchain.acquired.remove(&image_index) {
            return Err(GpuError::Validation(format!(
                "present of swapchain image {image_index} that was not acquired"
            )));
        }
        let extent = swapchain.extent;
        let image = swapchain.images[image_index as usize];
        if extent != window {
            return Ok(PresentOutcome::OutOfDate);
        }
        let state = self
            .images
            .get(&image)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{image:?}")))?;
        if state.layout != ImageLayout::PresentSrc {
            return Err(GpuError::Validation(format!(
                "present of {image:?} in layout {:?}",
                state.layout
            )));
        }
        let center = (extent.height / 2 * extent.width + extent.width / 2) as usize;
        self.present_log.push(PresentRecord {
            image_index,
            extent,
            center_texel: state.texels[center],
            digest: digest(&state.texels),
        });
        if self.inject_suboptimal > 0 {
            self.inject_suboptimal -= 1;
            return Ok(PresentOutcome::Suboptimal);
        }
        Ok(PresentOutcome::Presented)
    }

    fn wait_idle(&mut self) -> Result<(), GpuError> {
        self.stats.idle_waits += 1;
        let count = self.pending.len();
        self.retire(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semaphore_pair(device: &mut HeadlessDevice) -> (SemaphoreId, SemaphoreId) {
        (
            device.create_semaphore().unwrap(),
            device.create_semaphore().unwrap(),
        )
    }

    #[test]
    fn completion_is_deferred_until_fence_wait() {
        let mut device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let commands = CommandList::new();
        device
            .submit(&SubmitInfo {
                commands: &commands,
                wait: &[],
                signal: &[],
                fence: Some(fence),
            })
            .unwrap();
        assert!(!device.fence_signaled(fence).unwrap());
        assert_eq!(device.pending_submissions(), 1);
        device.wait_fence(fence).unwrap();
        assert!(device.fence_signaled(fence).unwrap());
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.stats().fence_waits[&fence], 1);
    }

    #[test]
    fn waiting_on_an_orphan_fence_is_a_deadlock() {
        let mut device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(
            device.wait_fence(fence),
            Err(GpuError::Validation(_))
        ));
    }

    #[test]
    fn host_write_to_buffer_in_flight_is_rejected() {
        let mut device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    label: "b",
                    size: 16,
                    usage: BufferUsage::TRANSFER_DST,
                    location: crate::gpu::MemoryLocation::HostVisible,
                },
                1,
            )
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        let mut commands = CommandList::new();
        commands.update_buffer(buffer, 0, &[1, 2, 3, 4]);
        device
            .submit(&SubmitInfo {
                commands: &commands,
                wait: &[],
                signal: &[],
                fence: Some(fence),
            })
            .unwrap();
        assert!(device.write_buffer(buffer, 0, &[9; 4]).is_err());
        device.wait_fence(fence).unwrap();
        device.write_buffer(buffer, 4, &[9; 4]).unwrap();
        assert_eq!(
            device.buffer_contents(buffer).unwrap()[..8],
            [1, 2, 3, 4, 9, 9, 9, 9]
        );
    }

    #[test]
    fn semaphores_follow_acquire_submit_present() {
        let mut device = HeadlessDevice::new();
        let info = device.configure_surface(Extent2d::new(800, 600)).unwrap();
        let (acquired, finished) = semaphore_pair(&mut device);
        let AcquireOutcome::Ready { image_index, .. } =
            device.acquire_next_image(acquired).unwrap()
        else {
            panic!("expected an image");
        };
        let target = info.images[image_index as usize];
        let mut commands = CommandList::new();
        commands.image_barrier(
            target,
            ImageLayout::Undefined,
            ImageLayout::PresentSrc,
        );
        device
            .submit(&SubmitInfo {
                commands: &commands,
                wait: &[acquired],
                signal: &[finished],
                fence: None,
            })
            .unwrap();
        assert_eq!(
            device.present(image_index, finished).unwrap(),
            PresentOutcome::Presented
        );
        // The render-finished signal was consumed by the present.
        assert!(device.present(image_index, finished).is_err());
    }

    #[test]
    fn window_resize_makes_surface_out_of_date() {
        let mut device = HeadlessDevice::new();
        let _ = device.configure_surface(Extent2d::new(800, 600)).unwrap();
        let (acquired, _) = semaphore_pair(&mut device);
        device.set_window_extent(Extent2d::new(1200, 800));
        assert_eq!(
            device.acquire_next_image(acquired).unwrap(),
            AcquireOutcome::OutOfDate
        );
        let _ = device.configure_surface(Extent2d::new(1200, 800)).unwrap();
        assert!(matches!(
            device.acquire_next_image(acquired).unwrap(),
            AcquireOutcome::Ready { .. }
        ));
    }

    #[test]
    fn destroy_while_queued_is_recorded() {
        let mut device = HeadlessDevice::new();
        let image = device
            .create_image(&ImageDesc {
                label: "i",
                extent: Extent2d::new(2, 2),
                format: ImageFormat::Rgba8Unorm,
                usage: ImageUsage::TRANSFER_DST,
            })
            .unwrap();
        let mut commands = CommandList::new();
        commands.image_barrier(image, ImageLayout::Undefined, ImageLayout::TransferDst);
        device
            .submit(&SubmitInfo {
                commands: &commands,
                wait: &[],
                signal: &[],
                fence: None,
            })
            .unwrap();
        device.destroy_image(image);
        assert_eq!(device.validation_errors().len(), 1);
        device.wait_idle().unwrap();
        device.destroy_image(image);
        assert_eq!(device.validation_errors().len(), 2);
    }

    #[test]
    fn injected_submit_failure_is_device_lost() {
        let mut device = HeadlessDevice::new();
        device.inject_submit_failure();
        let commands = CommandList::new();
        let submit = SubmitInfo {
            commands: &commands,
            wait: &[],
            signal: &[],
            fence: None,
        };
        assert_eq!(device.submit(&submit), Err(GpuError::DeviceLost));
        assert!(device.submit(&submit).is_ok());
    }
}
