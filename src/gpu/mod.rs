//! GPU device abstraction and resource management.
//!
//! The frame pipeline talks to a [`GpuDevice`]: an explicit, Vulkan-shaped
//! device surface (fences, semaphores, layouts, acceleration structures,
//! binding tables) driven by recorded [`CommandList`]s. Two backends
//! implement it: [`HeadlessDevice`], a deterministic software device that
//! validates the synchronization protocol, and (feature `gpu`)
//! `wgpu_backend::WgpuDevice`.

/// Buffer and image allocation bookkeeping.
pub mod allocator;
/// Recorded commands.
pub mod command;
/// Device plus allocator, single-time commands.
pub mod context;
/// The backend trait and its error type.
pub mod device;
/// Deterministic software backend.
pub mod headless;
/// Record-time image layout tracking.
pub mod layout_tracker;
/// Pass program registry.
pub mod shader_library;
/// Plain-data types shared by every backend.
pub mod types;
/// wgpu implementation of the device trait.
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use allocator::{Allocator, Buffer, Image};
pub use command::{
    ColorTarget, Command, CommandList, DepthTarget, StridedRegion,
    TraceRegions,
};
pub use context::GpuContext;
pub use device::{GpuDevice, GpuError, SubmitInfo};
pub use headless::{HeadlessDevice, HeadlessStats, PresentRecord, TraceRecord};
pub use layout_tracker::LayoutTracker;
pub use shader_library::ShaderLibrary;
pub use types::{
    AccelerationInstance, AccelerationStructureId, AccelerationStructureSizes,
    AcquireOutcome, BindingKind, BindingLayout, BindingLayoutEntry,
    BindingResource, BindingTableId, BindingWrite, BottomLevelDesc,
    BottomLevelGeometry, BufferDesc, BufferId, BufferUsage, Extent2d, FenceId,
    Filter, ImageDesc, ImageFormat, ImageId, ImageLayout, ImageUsage,
    InstanceFlags, MemoryLocation, MemoryType, PipelineDesc, PipelineId,
    PresentOutcome, RayTracingProperties, SemaphoreId, ShaderModule,
    ShaderStage, SwapchainInfo,
};
