//! Shader binding table: one record per shader group (ray-gen, miss,
//! closest-hit), each padded to the device's base alignment.

use crate::gpu::{
    Buffer, BufferDesc, BufferUsage, GpuContext, GpuDevice, GpuError,
    MemoryLocation, PipelineId, RayTracingProperties, StridedRegion,
    TraceRegions,
};

/// Shader groups in table order.
pub const GROUP_COUNT: u32 = 3;

/// Round `value` up to a multiple of `alignment`.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Region placement derived from the device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Bytes of a handle as returned by the device.
    pub handle_size: u64,
    /// Bytes of one padded record.
    pub entry_size: u64,
    /// Ray generation region (size equals stride).
    pub raygen: StridedRegion,
    /// Miss region.
    pub miss: StridedRegion,
    /// Hit-group region (stride 0: every instance uses the one record).
    pub hit: StridedRegion,
}

impl SbtLayout {
    /// Layout for a device.
    #[must_use]
    pub const fn new(properties: &RayTracingProperties) -> Self {
        let handle_size = properties.shader_group_handle_size as u64;
        let aligned =
            align_up(handle_size, properties.shader_group_handle_alignment as u64);
        let entry_size =
            align_up(aligned, properties.shader_group_base_alignment as u64);
        Self {
            handle_size,
            entry_size,
            raygen: StridedRegion {
                offset: 0,
                stride: entry_size,
                size: entry_size,
            },
            miss: StridedRegion {
                offset: entry_size,
                stride: entry_size,
                size: entry_size,
            },
            hit: StridedRegion {
                offset: 2 * entry_size,
                stride: 0,
                size: entry_size,
            },
        }
    }

    /// Total table size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.entry_size * GROUP_COUNT as u64
    }

    /// Table contents for the concatenated `handles` of every group.
    #[must_use]
    pub fn pack(&self, handles: &[u8]) -> Vec<u8> {
        let mut data = vec![0; self.size() as usize];
        let handle = self.handle_size as usize;
        for (group, bytes) in handles.chunks_exact(handle).enumerate() {
            let start = group * self.entry_size as usize;
            data[start..start + handle].copy_from_slice(bytes);
        }
        data
    }
}

/// Device-visible shader binding table of one ray tracing pipeline.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: SbtLayout,
}

impl ShaderBindingTable {
    /// Query the group handles of `pipeline` and upload them.
    ///
    /// # Errors
    ///
    /// Handle query, allocation or write failure.
    pub fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        pipeline: PipelineId,
    ) -> Result<Self, GpuError> {
        let layout = SbtLayout::new(&ctx.device.ray_tracing_properties());
        let handles = ctx.device.shader_group_handles(pipeline, 0, GROUP_COUNT)?;
        let buffer = ctx.upload_buffer(
            &BufferDesc {
                label: "shader binding table",
                size: layout.size(),
                usage: BufferUsage::SHADER_BINDING_TABLE
                    | BufferUsage::DEVICE_ADDRESS,
                location: MemoryLocation::HostVisible,
            },
            &layout.pack(&handles),
        )?;
        log::debug!(
            "shader binding table: {} groups, {} byte records",
            GROUP_COUNT,
            layout.entry_size
        );
        Ok(Self { buffer, layout })
    }

    /// Regions for a trace dispatch.
    #[must_use]
    pub fn regions(&self) -> TraceRegions {
        TraceRegions {
            buffer: self.buffer.id(),
            raygen: self.layout.raygen,
            miss: self.layout.miss,
            hit: self.layout.hit,
        }
    }

    /// Region placement.
    #[must_use]
    pub const fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Release the table buffer.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut GpuContext<D>) {
        ctx.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(handle: u32, base: u32, align: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: handle,
            shader_group_base_alignment: base,
            shader_group_handle_alignment: align,
            max_ray_recursion_depth: 1,
        }
    }

    #[test]
    fn entries_are_padded_to_base_alignment() {
        let layout = SbtLayout::new(&props(32, 64, 32));
        assert_eq!(layout.entry_size, 64);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.hit.stride, 0);
        assert_eq!(layout.raygen.size, layout.raygen.stride);
        assert_eq!(layout.size(), 192);

        let odd = SbtLayout::new(&props(40, 64, 32));
        assert_eq!(odd.entry_size, 64);
        let big = SbtLayout::new(&props(96, 64, 32));
        assert_eq!(big.entry_size, 128);
    }

    #[test]
    fn pack_places_each_handle_at_its_record() {
        let layout = SbtLayout::new(&props(4, 8, 4));
        let data = layout.pack(&[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(data, [
            1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0, 3, 3, 3, 3, 0, 0,
            0, 0
        ]);
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(7, 0), 7);
    }
}
