//! Buffer and image allocation with explicit memory-type selection.
//!
//! The allocator only keeps bookkeeping: which objects are alive, where
//! they live and how many bytes they take. Each object is returned as an
//! owning, non-`Clone` handle whose single destruction path is
//! [`Allocator::destroy_buffer`] / [`Allocator::destroy_image`].

use rustc_hash::FxHashMap;

use super::device::{GpuDevice, GpuError};
use super::types::{
    BufferDesc, BufferId, BufferUsage, Extent2d, ImageDesc, ImageFormat,
    ImageId, ImageUsage, MemoryLocation, MemoryType,
};

/// Owning handle to a device buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    id: BufferId,
    size: u64,
    usage: BufferUsage,
    location: MemoryLocation,
}

impl Buffer {
    /// Device id.
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Usage the buffer was created with.
    #[must_use]
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory the buffer lives in.
    #[must_use]
    pub const fn location(&self) -> MemoryLocation {
        self.location
    }
}

/// Owning handle to a device image.
#[derive(Debug, PartialEq, Eq)]
pub struct Image {
    id: ImageId,
    extent: Extent2d,
    format: ImageFormat,
    usage: ImageUsage,
}

impl Image {
    /// Device id.
    #[must_use]
    pub const fn id(&self) -> ImageId {
        self.id
    }

    /// Size in pixels.
    #[must_use]
    pub const fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Texel format.
    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    /// Usage the image was created with.
    #[must_use]
    pub const fn usage(&self) -> ImageUsage {
        self.usage
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    label: String,
    bytes: u64,
    memory_type: u32,
}

/// Bookkeeping for live buffers and images.
#[derive(Debug, Default)]
pub struct Allocator {
    memory_types: Vec<MemoryType>,
    buffers: FxHashMap<BufferId, Allocation>,
    images: FxHashMap<ImageId, (Allocation, Extent2d)>,
}

impl Allocator {
    /// Allocator for a device exposing `memory_types`.
    #[must_use]
    pub fn new(memory_types: &[MemoryType]) -> Self {
        Self {
            memory_types: memory_types.to_vec(),
            ..Self::default()
        }
    }

    /// Index of the first memory type suitable for `location`.
    ///
    /// Host-visible requests require coherent memory so CPU writes never
    /// need an explicit flush.
    ///
    /// # Errors
    ///
    /// [`GpuError::OutOfMemory`] if no type matches.
    pub fn find_memory_type(
        &self,
        location: MemoryLocation,
    ) -> Result<u32, GpuError> {
        self.memory_types
            .iter()
            .position(|ty| match location {
                MemoryLocation::DeviceLocal => ty.device_local,
                MemoryLocation::HostVisible => {
                    ty.host_visible && ty.host_coherent
                }
            })
            .map(|index| index as u32)
            .ok_or_else(|| {
                GpuError::OutOfMemory(format!(
                    "no memory type for {location:?}"
                ))
            })
    }

    /// Create a buffer.
    ///
    /// # Errors
    ///
    /// Memory-type selection or device failure.
    pub fn create_buffer<D: GpuDevice>(
        &mut self,
        device: &mut D,
        desc: &BufferDesc<'_>,
    ) -> Result<Buffer, GpuError> {
        let memory_type = self.find_memory_type(desc.location)?;
        let id = device.create_buffer(desc, memory_type)?;
        log::debug!(
            "allocated buffer '{}' ({} bytes, memory type {memory_type})",
            desc.label,
            desc.size
        );
        let _ = self.buffers.insert(
            id,
            Allocation {
                label: desc.label.to_owned(),
                bytes: desc.size,
                memory_type,
            },
        );
        Ok(Buffer {
            id,
            size: desc.size,
            usage: desc.usage,
            location: desc.location,
        })
    }

    /// Create an image in device-local memory.
    ///
    /// # Errors
    ///
    /// Memory-type selection or device failure.
    pub fn create_image<D: GpuDevice>(
        &mut self,
        device: &mut D,
        desc: &ImageDesc<'_>,
    ) -> Result<Image, GpuError> {
        let memory_type = self.find_memory_type(MemoryLocation::DeviceLocal)?;
        let id = device.create_image(desc)?;
        let bytes = desc.extent.pixel_count() as u64
            * u64::from(desc.format.bytes_per_texel());
        let _ = self.images.insert(
            id,
            (
                Allocation {
                    label: desc.label.to_owned(),
                    bytes,
                    memory_type,
                },
                desc.extent,
            ),
        );
        Ok(Image {
            id,
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
        })
    }

    /// Destroy a buffer and drop its bookkeeping.
    pub fn destroy_buffer<D: GpuDevice>(&mut self, device: &mut D, buffer: Buffer) {
        if self.buffers.remove(&buffer.id).is_none() {
            log::warn!("destroying untracked buffer {:?}", buffer.id);
        }
        device.destroy_buffer(buffer.id);
    }

    /// Destroy an image and drop its bookkeeping.
    pub fn destroy_image<D: GpuDevice>(&mut self, device: &mut D, image: Image) {
        if self.images.remove(&image.id).is_none() {
            log::warn!("destroying untracked image {:?}", image.id);
        }
        device.destroy_image(image.id);
    }

    /// Number of live buffers.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live images.
    #[must_use]
    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    /// Total bytes held by live objects.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.buffers.values().map(|a| a.bytes).sum::<u64>()
            + self.images.values().map(|(a, _)| a.bytes).sum::<u64>()
    }

    /// Extent of a live image.
    #[must_use]
    pub fn image_extent(&self, image: ImageId) -> Option<Extent2d> {
        self.images.get(&image).map(|(_, extent)| *extent)
    }

    /// Labels of every object still alive, sorted.
    #[must_use]
    pub fn leaked_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .buffers
            .values()
            .chain(self.images.values().map(|(a, _)| a))
            .map(|a| format!("{} (memory type {})", a.label, a.memory_type))
            .collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn buffer_desc(location: MemoryLocation) -> BufferDesc<'static> {
        BufferDesc {
            label: "test",
            size: 256,
            usage: BufferUsage::STORAGE,
            location,
        }
    }

    #[test]
    fn selects_matching_memory_types() {
        let allocator = Allocator::new(&[
            MemoryType {
                device_local: true,
                host_visible: false,
                host_coherent: false,
            },
            MemoryType {
                device_local: false,
                host_visible: true,
                host_coherent: false,
            },
            MemoryType {
                device_local: false,
                host_visible: true,
                host_coherent: true,
            },
        ]);
        assert_eq!(
            allocator.find_memory_type(MemoryLocation::DeviceLocal).unwrap(),
            0
        );
        assert_eq!(
            allocator.find_memory_type(MemoryLocation::HostVisible).unwrap(),
            2
        );
    }

    #[test]
    fn missing_memory_type_is_out_of_memory() {
        let allocator = Allocator::new(&[]);
        assert!(matches!(
            allocator.find_memory_type(MemoryLocation::HostVisible),
            Err(GpuError::OutOfMemory(_))
        ));
    }

    #[test]
    fn bookkeeping_follows_create_and_destroy() {
        let mut device = HeadlessDevice::new();
        let mut allocator = Allocator::new(device.memory_types());
        let buffer = allocator
            .create_buffer(&mut device, &buffer_desc(MemoryLocation::HostVisible))
            .unwrap();
        let image = allocator
            .create_image(
                &mut device,
                &ImageDesc {
                    label: "img",
                    extent: Extent2d::new(4, 2),
                    format: ImageFormat::Rgba16Float,
                    usage: ImageUsage::STORAGE,
                },
            )
            .unwrap();
        assert_eq!(allocator.live_buffers(), 1);
        assert_eq!(allocator.allocated_bytes(), 256 + 4 * 2 * 8);
        assert_eq!(allocator.image_extent(image.id()), Some(Extent2d::new(4, 2)));
        assert_eq!(allocator.leaked_labels().len(), 2);

        allocator.destroy_buffer(&mut device, buffer);
        allocator.destroy_image(&mut device, image);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.live_images(), 0);
        assert!(allocator.leaked_labels().is_empty());
        assert!(device.validation_errors().is_empty());
    }
}
