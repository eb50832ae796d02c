use std::fmt;

use super::command::CommandList;
use super::types::{
    AccelerationStructureId, AccelerationStructureSizes, AcquireOutcome,
    BindingLayout, BindingTableId, BindingWrite, BottomLevelDesc, BufferDesc,
    BufferId, Extent2d, FenceId, ImageDesc, ImageId, MemoryType,
    PipelineDesc, PipelineId, PresentOutcome, RayTracingProperties,
    SemaphoreId, SwapchainInfo,
};

/// Errors reported by a [`GpuDevice`] backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// No memory type satisfies the request, or the heap is exhausted.
    OutOfMemory(String),
    /// Object creation was rejected by the driver.
    ObjectCreation(String),
    /// The device was lost; nothing further will complete.
    DeviceLost,
    /// A wait exceeded its deadline.
    Timeout,
    /// A handle that does not name a live object of that kind.
    InvalidHandle(String),
    /// The call or the recorded work broke a usage rule.
    Validation(String),
    /// The device lacks a required feature.
    Unsupported(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory(what) => write!(f, "out of device memory: {what}"),
            Self::ObjectCreation(what) => {
                write!(f, "object creation failed: {what}")
            }
            Self::DeviceLost => write!(f, "device lost"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::InvalidHandle(what) => write!(f, "invalid handle: {what}"),
            Self::Validation(what) => write!(f, "validation error: {what}"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    /// Recorded work.
    pub commands: &'a CommandList,
    /// Semaphores waited on before the work starts.
    pub wait: &'a [SemaphoreId],
    /// Semaphores signalled when the work completes.
    pub signal: &'a [SemaphoreId],
    /// Fence signalled when the work completes.
    pub fence: Option<FenceId>,
}

/// The device surface the frame pipeline runs on.
///
/// Shaped after an explicit API: the caller owns synchronization (fences,
/// semaphores, layout transitions) and object lifetimes. Destroy calls
/// take ids by value and must only be made once the GPU no longer uses the
/// object.
pub trait GpuDevice {
    /// Memory types, indexed by the `memory_type` argument of
    /// [`create_buffer`](Self::create_buffer).
    fn memory_types(&self) -> &[MemoryType];

    /// Ray tracing limits.
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    // -- Buffers ---------------------------------------------------------

    /// Create a buffer in the given memory type.
    ///
    /// # Errors
    ///
    /// [`GpuError::OutOfMemory`] or [`GpuError::ObjectCreation`].
    fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
        memory_type: u32,
    ) -> Result<BufferId, GpuError>;

    /// Destroy a buffer.
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// CPU write into a host-visible buffer.
    ///
    /// # Errors
    ///
    /// [`GpuError::Validation`] if the buffer is not host-visible, the
    /// range is out of bounds, or queued work still reads the buffer.
    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError>;

    /// Device address of a buffer.
    ///
    /// # Errors
    ///
    /// [`GpuError::InvalidHandle`] for unknown buffers.
    fn buffer_device_address(&self, buffer: BufferId) -> Result<u64, GpuError>;

    // -- Images ----------------------------------------------------------

    /// Create an image in the undefined layout.
    ///
    /// # Errors
    ///
    /// [`GpuError::OutOfMemory`] or [`GpuError::ObjectCreation`].
    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageId, GpuError>;

    /// Destroy an image.
    fn destroy_image(&mut self, image: ImageId);

    // -- Synchronization -------------------------------------------------

    /// Create a fence, optionally already signalled.
    ///
    /// # Errors
    ///
    /// [`GpuError::ObjectCreation`].
    fn create_fence(&mut self, signaled: bool) -> Result<FenceId, GpuError>;

    /// Destroy a fence.
    fn destroy_fence(&mut self, fence: FenceId);

    /// Block until the fence is signalled. No timeout.
    ///
    /// # Errors
    ///
    /// [`GpuError::DeviceLost`], or [`GpuError::Validation`] if the fence
    /// can never signal.
    fn wait_fence(&mut self, fence: FenceId) -> Result<(), GpuError>;

    /// Non-blocking fence status.
    ///
    /// # Errors
    ///
    /// [`GpuError::InvalidHandle`] for unknown fences.
    fn fence_signaled(&mut self, fence: FenceId) -> Result<bool, GpuError>;

    /// Return a signalled fence to the unsignalled state.
    ///
    /// # Errors
    ///
    /// [`GpuError::Validation`] if queued work will still signal it.
    fn reset_fence(&mut self, fence: FenceId) -> Result<(), GpuError>;

    /// Create a binary semaphore.
    ///
    /// # Errors
    ///
    /// [`GpuError::ObjectCreation`].
    fn create_semaphore(&mut self) -> Result<SemaphoreId, GpuError>;

    /// Destroy a semaphore.
    fn destroy_semaphore(&mut self, semaphore: SemaphoreId);

    // -- Pipelines and bindings ------------------------------------------

    /// Compile a pipeline.
    ///
    /// # Errors
    ///
    /// [`GpuError::ObjectCreation`] if the programs do not compile or link.
    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> Result<PipelineId, GpuError>;

    /// Destroy a pipeline.
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    /// Opaque shader-group handles of a ray tracing pipeline, each
    /// `shader_group_handle_size` bytes, in group order.
    ///
    /// # Errors
    ///
    /// [`GpuError::InvalidHandle`] if `pipeline` is not a ray tracing
    /// pipeline with that many groups.
    fn shader_group_handles(
        &self,
        pipeline: PipelineId,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>, GpuError>;

    /// Create a binding table with every slot unwritten.
    ///
    /// # Errors
    ///
    /// [`GpuError::ObjectCreation`].
    fn create_binding_table(
        &mut self,
        layout: &BindingLayout,
    ) -> Result<BindingTableId, GpuError>;

    /// Write resources into slots.
    ///
    /// # Errors
    ///
    /// [`GpuError::Validation`] if a write does not match its slot.
    fn update_binding_table(
        &mut self,
        table: BindingTableId,
        writes: &[BindingWrite],
    ) -> Result<(), GpuError>;

    /// Destroy a binding table.
    fn destroy_binding_table(&mut self, table: BindingTableId);

    // -- Acceleration structures -----------------------------------------

    /// Create and synchronously build a bottom-level structure.
    ///
    /// # Errors
    ///
    /// [`GpuError::InvalidHandle`] for unknown geometry buffers.
    fn create_bottom_level(
        &mut self,
        desc: &BottomLevelDesc<'_>,
    ) -> Result<AccelerationStructureId, GpuError>;

    /// Storage and scratch bytes needed for a top-level structure of
    /// `instance_count` instances.
    fn top_level_sizes(&self, instance_count: u32) -> AccelerationStructureSizes;

    /// Create an (unbuilt) top-level structure placed in `storage`.
    ///
    /// # Errors
    ///
    /// [`GpuError::Validation`] if `storage` is too small or lacks
    /// acceleration-structure storage usage.
    fn create_top_level(
        &mut self,
        storage: BufferId,
        sizes: AccelerationStructureSizes,
        max_instances: u32,
    ) -> Result<AccelerationStructureId, GpuError>;

    /// Device address of an acceleration structure.
    ///
    /// # Errors
    ///
    /// [`GpuError::InvalidHandle`] for unknown structures.
    fn acceleration_structure_address(
        &self,
        structure: AccelerationStructureId,
    ) -> Result<u64, GpuError>;

    /// Destroy an acceleration structure (its storage buffer is separate).
    fn destroy_acceleration_structure(
        &mut self,
        structure: AccelerationStructureId,
    );

    // -- Surface and queue -----------------------------------------------

    /// (Re)create the swapchain at `extent`. Old swapchain images become
    /// invalid.
    ///
    /// # Errors
    ///
    /// [`GpuError::Unsupported`] if the surface rejects the extent.
    fn configure_surface(
        &mut self,
        extent: Extent2d,
    ) -> Result<SwapchainInfo, GpuError>;

    /// Size the window system currently reports for the surface.
    fn current_surface_extent(&self) -> Option<Extent2d>;

    /// Request the next presentable image; `signal` fires once it may be
    /// written.
    ///
    /// # Errors
    ///
    /// Fatal failures only; staleness is an [`AcquireOutcome`].
    fn acquire_next_image(
        &mut self,
        signal: SemaphoreId,
    ) -> Result<AcquireOutcome, GpuError>;

    /// Queue recorded work.
    ///
    /// # Errors
    ///
    /// [`GpuError::Validation`] for semaphore/fence misuse,
    /// [`GpuError::DeviceLost`].
    fn submit(&mut self, submit: &SubmitInfo<'_>) -> Result<(), GpuError>;

    /// Present a swapchain image once `wait` signals.
    ///
    /// # Errors
    ///
    /// Fatal failures only; staleness is a [`PresentOutcome`].
    fn present(
        &mut self,
        image_index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentOutcome, GpuError>;

    /// Block until every submission completed.
    ///
    /// # Errors
    ///
    /// [`GpuError::DeviceLost`] or a deferred validation failure.
    fn wait_idle(&mut self) -> Result<(), GpuError>;
}
