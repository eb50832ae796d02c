//! Plain value types shared by every [`GpuDevice`](super::GpuDevice)
//! backend: object ids, extents, formats, layouts, usage flags and the
//! descriptors passed to object creation.

use std::ops::BitOr;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

macro_rules! gpu_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a backend-assigned raw id.
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The backend-assigned raw id.
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_id!(
    /// A device buffer.
    BufferId
);
gpu_id!(
    /// A device image (texture).
    ImageId
);
gpu_id!(
    /// A CPU-waitable completion fence.
    FenceId
);
gpu_id!(
    /// A GPU-side binary semaphore.
    SemaphoreId
);
gpu_id!(
    /// A compiled graphics or ray tracing pipeline.
    PipelineId
);
gpu_id!(
    /// A resource binding table (descriptor set).
    BindingTableId
);
gpu_id!(
    /// A bottom- or top-level acceleration structure.
    AccelerationStructureId
);

// =============================================================================
// Extents and formats
// =============================================================================

/// Width/height of a 2D image or surface, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent2d {
    /// Extent of `width` × `height` pixels.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Either dimension is zero (minimized window).
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Extent multiplied by a render-scale factor, rounded to the nearest
    /// pixel and never smaller than 1×1.
    #[must_use]
    pub fn scaled(self, scale: f32) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        Self {
            width: ((self.width as f32 * scale).round() as u32).max(1),
            height: ((self.height as f32 * scale).round() as u32).max(1),
        }
    }

    /// Workgroup count covering this extent with `tile`-sized groups.
    #[must_use]
    pub const fn tiles(self, tile: u32) -> (u32, u32) {
        (self.width.div_ceil(tile), self.height.div_ceil(tile))
    }
}

impl std::fmt::Display for Extent2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Texel formats used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit normalized RGBA.
    Rgba8Unorm,
    /// 8-bit normalized BGRA (typical surface format).
    Bgra8Unorm,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// 32-bit float depth.
    Depth32Float,
}

impl ImageFormat {
    /// Depth formats are attached as depth-stencil, never as color.
    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    /// Size of one texel in bytes.
    #[must_use]
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Layout an image is in from the GPU's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    /// Contents undefined; valid only as a transition source.
    #[default]
    Undefined,
    /// Storage-image read/write access.
    General,
    /// Color render target.
    ColorAttachment,
    /// Depth render target.
    DepthAttachment,
    /// Sampled read access.
    ShaderReadOnly,
    /// Copy/blit source.
    TransferSrc,
    /// Copy/blit/clear destination.
    TransferDst,
    /// Handed to the display engine.
    PresentSrc,
}

/// Sampler filtering applied when an image binding is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    /// Nearest texel.
    #[default]
    Nearest,
    /// Bilinear.
    Linear,
}

// =============================================================================
// Usage flags
// =============================================================================

macro_rules! usage_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)*

            /// No usage.
            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            /// All bits of `other` are set in `self`.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

usage_flags!(
    /// How a buffer will be used.
    BufferUsage {
        /// Copy source.
        TRANSFER_SRC = 1,
        /// Copy / update destination.
        TRANSFER_DST = 1 << 1,
        /// Uniform buffer binding.
        UNIFORM = 1 << 2,
        /// Storage buffer binding.
        STORAGE = 1 << 3,
        /// Vertex input.
        VERTEX = 1 << 4,
        /// Index input.
        INDEX = 1 << 5,
        /// Read by acceleration-structure builds (instances, geometry).
        ACCELERATION_STRUCTURE_INPUT = 1 << 6,
        /// Backing storage of an acceleration structure.
        ACCELERATION_STRUCTURE_STORAGE = 1 << 7,
        /// Holds shader-group handles.
        SHADER_BINDING_TABLE = 1 << 8,
        /// Device address may be queried.
        DEVICE_ADDRESS = 1 << 9,
    }
);

usage_flags!(
    /// How an image will be used.
    ImageUsage {
        /// Copy/blit source.
        TRANSFER_SRC = 1,
        /// Copy/blit/clear destination.
        TRANSFER_DST = 1 << 1,
        /// Sampled in shaders.
        SAMPLED = 1 << 2,
        /// Storage image read/write.
        STORAGE = 1 << 3,
        /// Color render target.
        COLOR_ATTACHMENT = 1 << 4,
        /// Depth render target.
        DEPTH_ATTACHMENT = 1 << 5,
    }
);

// =============================================================================
// Memory
// =============================================================================

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Fast device memory, not CPU-visible.
    DeviceLocal,
    /// CPU-writable memory the GPU can read.
    HostVisible,
}

/// Property flags of one device memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Backed by device-local memory.
    pub device_local: bool,
    /// Mappable by the CPU.
    pub host_visible: bool,
    /// CPU writes need no explicit flush.
    pub host_coherent: bool,
}

// =============================================================================
// Descriptors
// =============================================================================

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Debug label.
    pub label: &'a str,
    /// Size in bytes.
    pub size: u64,
    /// Intended usage.
    pub usage: BufferUsage,
    /// Requested memory location.
    pub location: MemoryLocation,
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    /// Debug label.
    pub label: &'a str,
    /// Size in pixels.
    pub extent: Extent2d,
    /// Texel format.
    pub format: ImageFormat,
    /// Intended usage.
    pub usage: ImageUsage,
}

/// Storage and scratch requirements of an acceleration-structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructureSizes {
    /// Bytes of the structure's backing storage.
    pub storage_size: u64,
    /// Bytes of build-time working memory.
    pub scratch_size: u64,
}

/// Device limits relevant to ray tracing pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size of one opaque shader-group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each shader-binding-table region start.
    pub shader_group_base_alignment: u32,
    /// Required alignment of each handle within a region.
    pub shader_group_handle_alignment: u32,
    /// Maximum trace recursion depth.
    pub max_ray_recursion_depth: u32,
}

/// One triangle geometry of a bottom-level structure.
#[derive(Debug, Clone, Copy)]
pub struct BottomLevelGeometry {
    /// Vertex positions (first 12 bytes of each vertex).
    pub vertex_buffer: BufferId,
    /// Vertex count.
    pub vertex_count: u32,
    /// Bytes between consecutive vertices.
    pub vertex_stride: u64,
    /// `u32` triangle-list indices.
    pub index_buffer: BufferId,
    /// Index count (multiple of three).
    pub index_count: u32,
}

/// Bottom-level acceleration-structure creation parameters.
#[derive(Debug, Clone)]
pub struct BottomLevelDesc<'a> {
    /// Debug label.
    pub label: &'a str,
    /// One geometry per (mesh, material) pair of the model.
    pub geometries: Vec<BottomLevelGeometry>,
}

/// Instance flag bits of a top-level instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstanceFlags(u8);

impl InstanceFlags {
    /// Disable back-face culling for this instance.
    pub const TRIANGLE_FACING_CULL_DISABLE: Self = Self(0x1);
    /// Treat every geometry as opaque.
    pub const FORCE_OPAQUE: Self = Self(0x4);

    /// No flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for InstanceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Top-level instance record, laid out exactly as the device consumes it
/// (64 bytes: row-major 3×4 transform, 24-bit custom index + 8-bit mask,
/// 24-bit hit-group offset + 8-bit flags, bottom-level device address).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelerationInstance {
    /// Row-major 3×4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit-group record offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub blas_address: u64,
}

impl AccelerationInstance {
    /// Byte size of one record.
    pub const SIZE: u64 = size_of::<Self>() as u64;

    /// The 24-bit custom index.
    #[must_use]
    pub const fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    /// The 8-bit visibility mask.
    #[must_use]
    pub const fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// The instance flags.
    #[must_use]
    pub const fn flags(&self) -> InstanceFlags {
        InstanceFlags((self.sbt_offset_and_flags >> 24) as u8)
    }
}

/// Swapchain state after (re)configuring the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Surface size.
    pub extent: Extent2d,
    /// Surface texel format.
    pub format: ImageFormat,
    /// Presentable images, indexed by acquire's `image_index`.
    pub images: Vec<ImageId>,
}

/// Result of requesting the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready once the acquire semaphore signals.
    Ready {
        /// Index into [`SwapchainInfo::images`].
        image_index: u32,
        /// The surface still works but no longer matches optimally.
        suboptimal: bool,
    },
    /// The surface changed; nothing was acquired.
    OutOfDate,
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Queued for display.
    Presented,
    /// Displayed, but the surface should be reconfigured.
    Suboptimal,
    /// The surface changed and the image was not displayed.
    OutOfDate,
}

impl PresentOutcome {
    /// The resize protocol should run.
    #[must_use]
    pub const fn needs_resize(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

// =============================================================================
// Shaders and pipelines
// =============================================================================

/// Programmable stage a shader module targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage.
    Vertex,
    /// Fragment stage.
    Fragment,
    /// Ray generation.
    RayGeneration,
    /// Miss.
    Miss,
    /// Triangle closest hit.
    ClosestHit,
}

impl ShaderStage {
    /// File-name infix of the stage (`<pass>.<infix>.wgsl`).
    #[must_use]
    pub const fn file_infix(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::RayGeneration => "rgen",
            Self::Miss => "rmiss",
            Self::ClosestHit => "rchit",
        }
    }
}

/// Loaded shader program code for one stage of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModule {
    /// Pass the module belongs to (`geometry`, `lighting`, `raytrace`).
    pub pass: &'static str,
    /// Stage.
    pub stage: ShaderStage,
    /// Program bytes exactly as loaded.
    pub code: Arc<[u8]>,
}

/// Kind of resource a binding slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Top-level acceleration structure.
    AccelerationStructure,
    /// Read-write storage image.
    StorageImage,
    /// Uniform buffer.
    UniformBuffer,
    /// Read-only storage buffer.
    StorageBuffer,
    /// Sampled image (or array of them when `count > 1`).
    SampledImage,
}

/// One slot of a binding layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    /// Shader-visible slot number.
    pub slot: u32,
    /// Resource kind.
    pub kind: BindingKind,
    /// Array length (1 for non-arrays).
    pub count: u32,
}

/// Declarative shape of a binding table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingLayout {
    /// Slots in ascending order.
    pub entries: Vec<BindingLayoutEntry>,
}

impl BindingLayout {
    /// Entry describing `slot`, if present.
    #[must_use]
    pub fn entry(&self, slot: u32) -> Option<&BindingLayoutEntry> {
        self.entries.iter().find(|e| e.slot == slot)
    }
}

/// A resource bound into one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingResource {
    /// Top-level acceleration structure.
    AccelerationStructure(AccelerationStructureId),
    /// Storage image.
    StorageImage(ImageId),
    /// Uniform buffer.
    UniformBuffer(BufferId),
    /// Storage buffer.
    StorageBuffer(BufferId),
    /// Single sampled image.
    SampledImage {
        /// The image.
        image: ImageId,
        /// Filtering used when sampling.
        filter: Filter,
    },
    /// Fixed-length array of sampled images.
    SampledImageArray(Vec<ImageId>),
}

impl BindingResource {
    /// Kind of slot this resource fits.
    #[must_use]
    pub const fn kind(&self) -> BindingKind {
        match self {
            Self::AccelerationStructure(_) => BindingKind::AccelerationStructure,
            Self::StorageImage(_) => BindingKind::StorageImage,
            Self::UniformBuffer(_) => BindingKind::UniformBuffer,
            Self::StorageBuffer(_) => BindingKind::StorageBuffer,
            Self::SampledImage { .. } | Self::SampledImageArray(_) => {
                BindingKind::SampledImage
            }
        }
    }

    /// Number of array elements this resource provides.
    #[must_use]
    pub fn count(&self) -> u32 {
        match self {
            Self::SampledImageArray(images) => images.len() as u32,
            _ => 1,
        }
    }

    /// Images referenced by this binding.
    #[must_use]
    pub fn images(&self) -> Vec<ImageId> {
        match self {
            Self::StorageImage(image) | Self::SampledImage { image, .. } => {
                vec![*image]
            }
            Self::SampledImageArray(images) => images.clone(),
            _ => Vec::new(),
        }
    }

    /// Buffer referenced by this binding.
    #[must_use]
    pub const fn buffer(&self) -> Option<BufferId> {
        match self {
            Self::UniformBuffer(buffer) | Self::StorageBuffer(buffer) => {
                Some(*buffer)
            }
            _ => None,
        }
    }
}

/// Write of one resource into one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingWrite {
    /// Target slot.
    pub slot: u32,
    /// Resource.
    pub resource: BindingResource,
}

/// Pipeline creation parameters.
#[derive(Debug, Clone)]
pub enum PipelineDesc<'a> {
    /// Rasterization pipeline with fixed viewport.
    Graphics {
        /// Debug label.
        label: &'a str,
        /// Vertex program.
        vertex: &'a ShaderModule,
        /// Fragment program.
        fragment: &'a ShaderModule,
        /// Color attachment formats, in attachment order.
        color_formats: Vec<ImageFormat>,
        /// Depth attachment format.
        depth_format: Option<ImageFormat>,
        /// Viewport extent baked into the pipeline.
        extent: Extent2d,
        /// Resources visible to both stages.
        bindings: &'a BindingLayout,
        /// Push-constant block size in bytes.
        push_constant_size: u32,
    },
    /// Ray tracing pipeline with one ray-gen, one miss and one triangle
    /// closest-hit group (group order: ray-gen, miss, hit).
    RayTracing {
        /// Debug label.
        label: &'a str,
        /// Ray generation program.
        raygen: &'a ShaderModule,
        /// Miss program.
        miss: &'a ShaderModule,
        /// Closest-hit program shared by all geometry.
        closest_hit: &'a ShaderModule,
        /// Maximum trace recursion depth.
        max_recursion_depth: u32,
        /// Resources visible to all stages.
        bindings: &'a BindingLayout,
        /// Push-constant block size in bytes.
        push_constant_size: u32,
    },
}

impl PipelineDesc<'_> {
    /// Debug label.
    #[must_use]
    pub const fn label(&self) -> &str {
        match self {
            Self::Graphics { label, .. } | Self::RayTracing { label, .. } => {
                label
            }
        }
    }

    /// Number of shader groups (ray tracing pipelines only).
    #[must_use]
    pub const fn group_count(&self) -> u32 {
        match self {
            Self::Graphics { .. } => 0,
            Self::RayTracing { .. } => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_scaling_rounds_and_clamps() {
        let e = Extent2d::new(1200, 800);
        assert_eq!(e.scaled(0.5), Extent2d::new(600, 400));
        assert_eq!(e.scaled(1.0), e);
        assert_eq!(Extent2d::new(1, 1).scaled(0.1), Extent2d::new(1, 1));
        assert_eq!(e.scaled(f32::NAN), e);
        assert_eq!(e.scaled(-2.0), e);
    }

    #[test]
    fn instance_record_is_device_sized() {
        assert_eq!(AccelerationInstance::SIZE, 64);
        let record = AccelerationInstance {
            transform: [[0.0; 4]; 3],
            custom_index_and_mask: 7 | (0xff << 24),
            sbt_offset_and_flags: u32::from(InstanceFlags::FORCE_OPAQUE.bits())
                << 24,
            blas_address: 0xdead_0000,
        };
        assert_eq!(record.custom_index(), 7);
        assert_eq!(record.mask(), 0xff);
        assert_eq!(record.flags(), InstanceFlags::FORCE_OPAQUE);
    }

    #[test]
    fn usage_flags_combine() {
        let usage = BufferUsage::STORAGE | BufferUsage::TRANSFER_DST;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(!usage.contains(BufferUsage::UNIFORM));
        assert!(usage.contains(BufferUsage::empty()));
    }

    #[test]
    fn binding_resource_reports_kind_and_count() {
        let array = BindingResource::SampledImageArray(vec![
            ImageId::from_raw(1),
            ImageId::from_raw(2),
        ]);
        assert_eq!(array.kind(), BindingKind::SampledImage);
        assert_eq!(array.count(), 2);
        assert_eq!(array.images().len(), 2);
        let uniform = BindingResource::UniformBuffer(BufferId::from_raw(9));
        assert_eq!(uniform.buffer(), Some(BufferId::from_raw(9)));
        assert!(uniform.images().is_empty());
    }
}
