//! Mapping of backend-neutral types onto wgpu.

use crate::gpu::{
    BindingKind, BindingLayout, BufferUsage, Extent2d, Filter, ImageFormat,
    ImageUsage,
};

/// Storage-image format of every writable image the pipeline binds.
pub(super) const STORAGE_IMAGE_FORMAT: wgpu::TextureFormat =
    wgpu::TextureFormat::Rgba16Float;

pub(super) const fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format {
        ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ImageFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        ImageFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

/// Surface formats the pipeline can write, in order of preference.
pub(super) fn surface_format(format: wgpu::TextureFormat) -> Option<ImageFormat> {
    match format {
        wgpu::TextureFormat::Bgra8Unorm => Some(ImageFormat::Bgra8Unorm),
        wgpu::TextureFormat::Rgba8Unorm => Some(ImageFormat::Rgba8Unorm),
        _ => None,
    }
}

/// Host-visible buffers are written through the queue, so every buffer
/// can be a copy destination.
pub(super) fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST;
    let table = [
        (BufferUsage::TRANSFER_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            wgpu::BufferUsages::BLAS_INPUT,
        ),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

/// Clears and scaled blits are render passes, and blit sources are
/// sampled.
pub(super) fn texture_usages(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    let table = [
        (
            ImageUsage::TRANSFER_SRC,
            wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::TEXTURE_BINDING,
        ),
        (
            ImageUsage::TRANSFER_DST,
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::RENDER_ATTACHMENT,
        ),
        (ImageUsage::SAMPLED, wgpu::TextureUsages::TEXTURE_BINDING),
        (ImageUsage::STORAGE, wgpu::TextureUsages::STORAGE_BINDING),
        (
            ImageUsage::COLOR_ATTACHMENT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        ),
        (
            ImageUsage::DEPTH_ATTACHMENT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        ),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

pub(super) const fn extent_3d(extent: Extent2d) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: extent.width,
        height: extent.height,
        depth_or_array_layers: 1,
    }
}

pub(super) const fn filter_mode(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

/// One bind group layout entry per slot. Images are read with
/// `textureLoad`, so sampled slots take unfilterable floats (which also
/// admits depth images) and need no sampler.
pub(super) fn layout_entries(
    layout: &BindingLayout,
) -> Vec<wgpu::BindGroupLayoutEntry> {
    layout
        .entries
        .iter()
        .map(|entry| {
            let (ty, visibility) = match entry.kind {
                BindingKind::AccelerationStructure => (
                    wgpu::BindingType::AccelerationStructure {
                        vertex_return: false,
                    },
                    wgpu::ShaderStages::COMPUTE,
                ),
                BindingKind::StorageImage => (
                    wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: STORAGE_IMAGE_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                ),
                BindingKind::UniformBuffer => (
                    wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    all_stages(),
                ),
                BindingKind::StorageBuffer => (
                    wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    all_stages(),
                ),
                BindingKind::SampledImage => (
                    wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float {
                            filterable: false,
                        },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    all_stages(),
                ),
            };
            wgpu::BindGroupLayoutEntry {
                binding: entry.slot,
                visibility,
                ty,
                count: if entry.count > 1 {
                    std::num::NonZeroU32::new(entry.count)
                } else {
                    None
                },
            }
        })
        .collect()
}

fn all_stages() -> wgpu::ShaderStages {
    wgpu::ShaderStages::VERTEX_FRAGMENT | wgpu::ShaderStages::COMPUTE
}

/// Length of the texture arrays in a layout (1 without arrays).
pub(super) fn texture_array_length(layout: &BindingLayout) -> u32 {
    layout
        .entries
        .iter()
        .filter(|e| e.kind == BindingKind::SampledImage)
        .map(|e| e.count)
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BindingLayoutEntry;

    #[test]
    fn every_buffer_is_writable_through_the_queue() {
        let usages = buffer_usages(BufferUsage::UNIFORM);
        assert!(usages.contains(wgpu::BufferUsages::COPY_DST));
        assert!(usages.contains(wgpu::BufferUsages::UNIFORM));
        assert!(!usages.contains(wgpu::BufferUsages::STORAGE));
    }

    #[test]
    fn blit_sources_are_sampled() {
        let usages = texture_usages(ImageUsage::TRANSFER_SRC);
        assert!(usages.contains(wgpu::TextureUsages::TEXTURE_BINDING));
    }

    #[test]
    fn texture_arrays_set_the_program_constant() {
        let layout = BindingLayout {
            entries: vec![
                BindingLayoutEntry {
                    slot: 0,
                    kind: BindingKind::UniformBuffer,
                    count: 1,
                },
                BindingLayoutEntry {
                    slot: 7,
                    kind: BindingKind::SampledImage,
                    count: 64,
                },
            ],
        };
        assert_eq!(texture_array_length(&layout), 64);
        let entries = layout_entries(&layout);
        assert_eq!(entries[1].count.map(std::num::NonZeroU32::get), Some(64));
        assert!(entries[0].count.is_none());
    }
}
