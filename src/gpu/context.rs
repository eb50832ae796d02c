use super::allocator::{Allocator, Buffer, Image};
use super::command::{Command, CommandList};
use super::device::{GpuDevice, GpuError, SubmitInfo};
use super::types::{BufferDesc, BufferUsage, ImageDesc, MemoryLocation};

/// The device plus the allocator bookkeeping that goes with it.
///
/// Owned by the renderer; there is no global device.
#[derive(Debug)]
pub struct GpuContext<D: GpuDevice> {
    /// The backend device.
    pub device: D,
    /// Allocation bookkeeping.
    pub allocator: Allocator,
}

impl<D: GpuDevice> GpuContext<D> {
    /// Wrap a device.
    pub fn new(device: D) -> Self {
        let allocator = Allocator::new(device.memory_types());
        Self { device, allocator }
    }

    /// Create a buffer.
    ///
    /// # Errors
    ///
    /// Device or memory-type failure.
    pub fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
    ) -> Result<Buffer, GpuError> {
        self.allocator.create_buffer(&mut self.device, desc)
    }

    /// Create an image.
    ///
    /// # Errors
    ///
    /// Device or memory-type failure.
    pub fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<Image, GpuError> {
        self.allocator.create_image(&mut self.device, desc)
    }

    /// Destroy a buffer.
    pub fn destroy_buffer(&mut self, buffer: Buffer) {
        self.allocator.destroy_buffer(&mut self.device, buffer);
    }

    /// Destroy an image.
    pub fn destroy_image(&mut self, image: Image) {
        self.allocator.destroy_image(&mut self.device, image);
    }

    /// Create a buffer holding `data`.
    ///
    /// Host-visible buffers are written directly. Device-local buffers are
    /// filled through a temporary staging buffer and a one-shot copy.
    ///
    /// # Errors
    ///
    /// Allocation, write or submission failure.
    pub fn upload_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
        data: &[u8],
    ) -> Result<Buffer, GpuError> {
        let size = desc.size.max(data.len() as u64);
        match desc.location {
            MemoryLocation::HostVisible => {
                let buffer = self.create_buffer(&BufferDesc { size, ..*desc })?;
                self.device.write_buffer(buffer.id(), 0, data)?;
                Ok(buffer)
            }
            MemoryLocation::DeviceLocal => {
                let buffer = self.create_buffer(&BufferDesc {
                    size,
                    usage: desc.usage | BufferUsage::TRANSFER_DST,
                    ..*desc
                })?;
                if data.is_empty() {
                    return Ok(buffer);
                }
                let staging = self.create_buffer(&BufferDesc {
                    label: "staging",
                    size: data.len() as u64,
                    usage: BufferUsage::TRANSFER_SRC,
                    location: MemoryLocation::HostVisible,
                })?;
                let copied = self
                    .device
                    .write_buffer(staging.id(), 0, data)
                    .and_then(|()| {
                        self.one_shot(|commands| {
                            commands.push(Command::CopyBuffer {
                                src: staging.id(),
                                src_offset: 0,
                                dst: buffer.id(),
                                dst_offset: 0,
                                size: data.len() as u64,
                            });
                        })
                    });
                self.destroy_buffer(staging);
                match copied {
                    Ok(()) => Ok(buffer),
                    Err(e) => {
                        self.destroy_buffer(buffer);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Record with `record`, submit without synchronization objects and
    /// wait for the queue to drain.
    ///
    /// Used for setup uploads, layout initialisation and scene rebuilds.
    ///
    /// # Errors
    ///
    /// Submission or wait failure.
    pub fn one_shot(
        &mut self,
        record: impl FnOnce(&mut CommandList),
    ) -> Result<(), GpuError> {
        let mut commands = CommandList::new();
        record(&mut commands);
        self.device.submit(&SubmitInfo {
            commands: &commands,
            wait: &[],
            signal: &[],
            fence: None,
        })?;
        self.device.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn device_local_upload_goes_through_staging() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let data: Vec<u8> = (0..64).collect();
        let buffer = ctx
            .upload_buffer(
                &BufferDesc {
                    label: "vertices",
                    size: 0,
                    usage: BufferUsage::STORAGE,
                    location: MemoryLocation::DeviceLocal,
                },
                &data,
            )
            .unwrap();
        assert_eq!(buffer.size(), 64);
        assert_eq!(ctx.device.buffer_contents(buffer.id()).unwrap(), &data[..]);
        // Staging buffer is gone again.
        assert_eq!(ctx.allocator.live_buffers(), 1);
        assert_eq!(ctx.device.stats().submissions, 1);
        ctx.destroy_buffer(buffer);
        assert!(ctx.device.validation_errors().is_empty());
    }

    #[test]
    fn host_visible_upload_is_written_in_place() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let buffer = ctx
            .upload_buffer(
                &BufferDesc {
                    label: "instances",
                    size: 128,
                    usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                    location: MemoryLocation::HostVisible,
                },
                &[7; 16],
            )
            .unwrap();
        assert_eq!(buffer.size(), 128);
        assert_eq!(&ctx.device.buffer_contents(buffer.id()).unwrap()[..16], &[7; 16]);
        assert_eq!(ctx.device.stats().submissions, 0);
        ctx.destroy_buffer(buffer);
    }
}
