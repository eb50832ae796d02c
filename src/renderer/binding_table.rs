//! Slot map of the ray tracing pass.
//!
//! Thirteen shader-visible slots. Texture arrays are sized for a fixed
//! `max_meshes` and always fully written (unused entries hold the fallback
//! texture), so the table never has an undefined entry.

use crate::gpu::{
    AccelerationStructureId, BindingKind, BindingLayout, BindingLayoutEntry,
    BindingResource, BindingWrite, BufferId, Filter, ImageId,
};

/// Shader-visible slots of the ray tracing binding table.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtBinding {
    /// Top-level acceleration structure.
    Tlas = 0,
    /// Current output image (read-write).
    Output = 1,
    /// Per-frame scene uniform.
    SceneUniform = 2,
    /// Concatenated vertices of every mesh.
    Vertices = 3,
    /// Concatenated indices of every mesh.
    Indices = 4,
    /// Per-sub-mesh records.
    SubMeshes = 5,
    /// Per-instance records.
    Instances = 6,
    /// Albedo textures, one per sub-mesh.
    AlbedoTextures = 7,
    /// Auxiliary textures, one per sub-mesh.
    AuxTextures = 8,
    /// G-buffer depth.
    GBufferDepth = 9,
    /// G-buffer normal.
    GBufferNormal = 10,
    /// G-buffer albedo.
    GBufferAlbedo = 11,
    /// Previous accumulated frame (read-only, linear filtering).
    PreviousFrame = 12,
}

impl RtBinding {
    /// Every slot in ascending order.
    pub const ALL: [Self; 13] = [
        Self::Tlas,
        Self::Output,
        Self::SceneUniform,
        Self::Vertices,
        Self::Indices,
        Self::SubMeshes,
        Self::Instances,
        Self::AlbedoTextures,
        Self::AuxTextures,
        Self::GBufferDepth,
        Self::GBufferNormal,
        Self::GBufferAlbedo,
        Self::PreviousFrame,
    ];

    /// Slots holding render-resolution images, rewritten on resize.
    pub const RESOLUTION_IMAGES: [Self; 5] = [
        Self::Output,
        Self::GBufferDepth,
        Self::GBufferNormal,
        Self::GBufferAlbedo,
        Self::PreviousFrame,
    ];

    /// Slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self as u32
    }

    /// Resource kind the slot holds.
    #[must_use]
    pub const fn kind(self) -> BindingKind {
        match self {
            Self::Tlas => BindingKind::AccelerationStructure,
            Self::Output => BindingKind::StorageImage,
            Self::SceneUniform => BindingKind::UniformBuffer,
            Self::Vertices | Self::Indices | Self::SubMeshes | Self::Instances => {
                BindingKind::StorageBuffer
            }
            Self::AlbedoTextures
            | Self::AuxTextures
            | Self::GBufferDepth
            | Self::GBufferNormal
            | Self::GBufferAlbedo
            | Self::PreviousFrame => BindingKind::SampledImage,
        }
    }
}

/// Layout of the ray tracing table for `max_meshes` texture entries.
#[must_use]
pub fn layout(max_meshes: u32) -> BindingLayout {
    BindingLayout {
        entries: RtBinding::ALL
            .iter()
            .map(|binding| BindingLayoutEntry {
                slot: binding.slot(),
                kind: binding.kind(),
                count: match binding {
                    RtBinding::AlbedoTextures | RtBinding::AuxTextures => {
                        max_meshes
                    }
                    _ => 1,
                },
            })
            .collect(),
    }
}

/// Render-resolution images bound into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBindings {
    /// Output image written by the trace.
    pub output: ImageId,
    /// G-buffer depth.
    pub depth: ImageId,
    /// G-buffer normal.
    pub normal: ImageId,
    /// G-buffer albedo.
    pub albedo: ImageId,
    /// Previous accumulated frame.
    pub previous: ImageId,
}

impl ImageBindings {
    /// Writes for the image-valued slots only.
    #[must_use]
    pub fn writes(&self) -> Vec<BindingWrite> {
        let sampled = |image| BindingResource::SampledImage {
            image,
            filter: Filter::Nearest,
        };
        vec![
            write(RtBinding::Output, BindingResource::StorageImage(self.output)),
            write(RtBinding::GBufferDepth, sampled(self.depth)),
            write(RtBinding::GBufferNormal, sampled(self.normal)),
            write(RtBinding::GBufferAlbedo, sampled(self.albedo)),
            write(
                RtBinding::PreviousFrame,
                BindingResource::SampledImage {
                    image: self.previous,
                    filter: Filter::Linear,
                },
            ),
        ]
    }
}

/// Scene-dependent resources bound into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneBindings {
    /// Top-level acceleration structure.
    pub tlas: AccelerationStructureId,
    /// Per-frame scene uniform.
    pub scene_uniform: BufferId,
    /// Concatenated vertices.
    pub vertices: BufferId,
    /// Concatenated indices.
    pub indices: BufferId,
    /// Sub-mesh records.
    pub sub_meshes: BufferId,
    /// Instance records.
    pub instances: BufferId,
    /// Exactly `max_meshes` albedo textures.
    pub albedo_textures: Vec<ImageId>,
    /// Exactly `max_meshes` auxiliary textures.
    pub aux_textures: Vec<ImageId>,
}

impl SceneBindings {
    /// Writes for every non-image slot plus the texture arrays.
    #[must_use]
    pub fn writes(&self) -> Vec<BindingWrite> {
        vec![
            tlas_write(self.tlas),
            write(
                RtBinding::SceneUniform,
                BindingResource::UniformBuffer(self.scene_uniform),
            ),
            write(RtBinding::Vertices, BindingResource::StorageBuffer(self.vertices)),
            write(RtBinding::Indices, BindingResource::StorageBuffer(self.indices)),
            write(
                RtBinding::SubMeshes,
                BindingResource::StorageBuffer(self.sub_meshes),
            ),
            write(
                RtBinding::Instances,
                BindingResource::StorageBuffer(self.instances),
            ),
            write(
                RtBinding::AlbedoTextures,
                BindingResource::SampledImageArray(self.albedo_textures.clone()),
            ),
            write(
                RtBinding::AuxTextures,
                BindingResource::SampledImageArray(self.aux_textures.clone()),
            ),
        ]
    }
}

/// Write of the TLAS slot alone (after the TLAS was reallocated).
#[must_use]
pub fn tlas_write(tlas: AccelerationStructureId) -> BindingWrite {
    write(RtBinding::Tlas, BindingResource::AccelerationStructure(tlas))
}

fn write(binding: RtBinding, resource: BindingResource) -> BindingWrite {
    BindingWrite {
        slot: binding.slot(),
        resource,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_thirteen_slots_in_order() {
        let layout = layout(8);
        assert_eq!(layout.entries.len(), 13);
        for (i, entry) in layout.entries.iter().enumerate() {
            assert_eq!(entry.slot, i as u32);
        }
        assert_eq!(layout.entry(7).unwrap().count, 8);
        assert_eq!(layout.entry(8).unwrap().count, 8);
        assert_eq!(layout.entry(12).unwrap().kind, BindingKind::SampledImage);
        assert_eq!(layout.entry(1).unwrap().kind, BindingKind::StorageImage);
    }

    #[test]
    fn image_writes_touch_only_resolution_slots() {
        let id = ImageId::from_raw;
        let writes = ImageBindings {
            output: id(1),
            depth: id(2),
            normal: id(3),
            albedo: id(4),
            previous: id(5),
        }
        .writes();
        let slots: Vec<u32> = writes.iter().map(|w| w.slot).collect();
        let expected: Vec<u32> =
            RtBinding::RESOLUTION_IMAGES.iter().map(|b| b.slot()).collect();
        assert_eq!(slots, expected);
        assert!(matches!(
            writes.last().unwrap().resource,
            BindingResource::SampledImage {
                filter: Filter::Linear,
                ..
            }
        ));
    }

    #[test]
    fn writes_match_layout_kinds() {
        let layout = layout(2);
        let scene = SceneBindings {
            tlas: AccelerationStructureId::from_raw(1),
            scene_uniform: BufferId::from_raw(2),
            vertices: BufferId::from_raw(3),
            indices: BufferId::from_raw(4),
            sub_meshes: BufferId::from_raw(5),
            instances: BufferId::from_raw(6),
            albedo_textures: vec![ImageId::from_raw(7); 2],
            aux_textures: vec![ImageId::from_raw(8); 2],
        };
        let images = ImageBindings {
            output: ImageId::from_raw(9),
            depth: ImageId::from_raw(10),
            normal: ImageId::from_raw(11),
            albedo: ImageId::from_raw(12),
            previous: ImageId::from_raw(13),
        };
        let mut writes = scene.writes();
        writes.extend(images.writes());
        writes.sort_by_key(|w| w.slot);
        assert_eq!(writes.len(), 13);
        for (entry, write) in layout.entries.iter().zip(&writes) {
            assert_eq!(entry.slot, write.slot);
            assert_eq!(entry.kind, write.resource.kind());
            assert_eq!(entry.count, write.resource.count());
        }
    }
}
