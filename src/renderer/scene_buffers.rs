//! Global scene buffers read by the closest-hit program.
//!
//! Every mesh referenced by an instance is concatenated (in first-use
//! instance order) into one vertex and one index buffer. Each (instance,
//! part) pair gets a sub-mesh record pointing into the concatenation, and
//! each instance a record with its normal matrix and first sub-mesh. The
//! sub-mesh index doubles as the texture-array index.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use rustc_hash::FxHashMap;

use crate::error::PrismError;
use crate::gpu::{
    Buffer, BufferDesc, BufferUsage, Command, CommandList, GpuContext,
    GpuDevice, ImageId, MemoryLocation,
};
use crate::scene::assets::Vertex;
use crate::scene::{MeshId, SceneProvider};

/// Size used for buffers of an empty scene.
const EMPTY_BUFFER_SIZE: u64 = 256;

/// Per-sub-mesh record.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct SubMeshRecord {
    /// First vertex in the global vertex buffer.
    pub vertex_offset: u32,
    /// First index in the global index buffer.
    pub index_offset: u32,
    /// Indices of this sub-mesh.
    pub index_count: u32,
    /// Entry in the albedo/aux texture arrays.
    pub texture_index: u32,
    /// Material base color.
    pub base_color: [f32; 4],
}

/// Per-instance record.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Inverse-transpose of the instance transform.
    pub normal_matrix: [[f32; 4]; 4],
    /// First sub-mesh of the instance.
    pub sub_mesh_offset: u32,
    /// Sub-meshes of the instance.
    pub sub_mesh_count: u32,
    /// Padding for GPU alignment.
    pub(crate) _pad: [u32; 2],
}

/// Placement of one mesh in the concatenated buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRange {
    /// Mesh placed.
    pub mesh: MeshId,
    /// First vertex.
    pub vertex_offset: u32,
    /// First index.
    pub index_offset: u32,
}

/// CPU-side plan of the global buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneLayout {
    /// Concatenation order of the meshes.
    pub meshes: Vec<MeshRange>,
    /// Total vertices.
    pub vertex_count: u32,
    /// Total indices.
    pub index_count: u32,
    /// One record per (instance, part).
    pub sub_meshes: Vec<SubMeshRecord>,
    /// `(first sub-mesh, count)` per instance.
    pub instance_ranges: Vec<(u32, u32)>,
    /// Albedo texture per sub-mesh (`None` = fallback).
    pub albedo: Vec<Option<ImageId>>,
    /// Auxiliary texture per sub-mesh (`None` = fallback).
    pub aux: Vec<Option<ImageId>>,
}

impl SceneLayout {
    /// Plan the buffers for `scene`.
    ///
    /// # Errors
    ///
    /// [`PrismError::CapacityExceeded`] when the scene has more sub-meshes
    /// than `max_meshes`, [`PrismError::InvalidScene`] for dangling ids.
    pub fn compute<S: SceneProvider + ?Sized>(
        scene: &S,
        max_meshes: u32,
    ) -> Result<Self, PrismError> {
        let mut placed: FxHashMap<MeshId, MeshRange> = FxHashMap::default();
        let mut layout = Self {
            meshes: Vec::new(),
            vertex_count: 0,
            index_count: 0,
            sub_meshes: Vec::new(),
            instance_ranges: Vec::with_capacity(scene.instances().len()),
            albedo: Vec::new(),
            aux: Vec::new(),
        };
        for instance in scene.instances() {
            let model = scene.model_of(instance).ok_or_else(|| {
                PrismError::InvalidScene(format!(
                    "instance {:?} uses unknown model {:?}",
                    instance.id, instance.model
                ))
            })?;
            let first = layout.sub_meshes.len() as u32;
            for part in &model.parts {
                let mesh = scene.meshes().get(part.mesh.0 as usize);
                let material = scene.materials().get(part.material.0 as usize);
                let (Some(mesh), Some(material)) = (mesh, material) else {
                    return Err(PrismError::InvalidScene(format!(
                        "part {part:?} references an unknown asset"
                    )));
                };
                let range = *placed.entry(part.mesh).or_insert_with(|| {
                    let range = MeshRange {
                        mesh: part.mesh,
                        vertex_offset: layout.vertex_count,
                        index_offset: layout.index_count,
                    };
                    layout.vertex_count += mesh.vertex_count();
                    layout.index_count += mesh.index_count();
                    layout.meshes.push(range);
                    range
                });
                layout.sub_meshes.push(SubMeshRecord {
                    vertex_offset: range.vertex_offset,
                    index_offset: range.index_offset,
                    index_count: mesh.index_count(),
                    texture_index: layout.sub_meshes.len() as u32,
                    base_color: material.base_color,
                });
                layout.albedo.push(material.albedo);
                layout.aux.push(material.aux);
            }
            layout
                .instance_ranges
                .push((first, layout.sub_meshes.len() as u32 - first));
        }
        if layout.sub_meshes.len() > max_meshes as usize {
            return Err(PrismError::CapacityExceeded {
                what: "sub-meshes",
                requested: layout.sub_meshes.len(),
                capacity: max_meshes as usize,
            });
        }
        Ok(layout)
    }

    /// Texture array of exactly `max_meshes` entries.
    #[must_use]
    pub fn texture_array(
        textures: &[Option<ImageId>],
        max_meshes: u32,
        fallback: ImageId,
    ) -> Vec<ImageId> {
        (0..max_meshes as usize)
            .map(|i| textures.get(i).copied().flatten().unwrap_or(fallback))
            .collect()
    }

    /// Instance records for the current transforms.
    #[must_use]
    pub fn instance_records<S: SceneProvider + ?Sized>(
        &self,
        scene: &S,
    ) -> Vec<InstanceRecord> {
        scene
            .instances()
            .iter()
            .zip(&self.instance_ranges)
            .map(|(instance, &(offset, count))| InstanceRecord {
                normal_matrix: normal_matrix(&instance.transform)
                    .to_cols_array_2d(),
                sub_mesh_offset: offset,
                sub_mesh_count: count,
                _pad: [0; 2],
            })
            .collect()
    }
}

/// Inverse-transpose of the upper 3×3, as a 4×4.
#[must_use]
pub fn normal_matrix(transform: &Mat4) -> Mat4 {
    let inverse = transform.inverse();
    if !inverse.is_finite() {
        return Mat4::IDENTITY;
    }
    let mut m = inverse.transpose();
    m.w_axis = glam::Vec4::W;
    m.x_axis.w = 0.0;
    m.y_axis.w = 0.0;
    m.z_axis.w = 0.0;
    m
}

/// Device-local global buffers of one mesh set.
#[derive(Debug)]
pub struct SceneBuffers {
    layout: SceneLayout,
    vertices: Buffer,
    indices: Buffer,
    sub_meshes: Buffer,
    instances: Buffer,
    /// Mesh-set version the buffers were built from.
    version: u64,
}

impl SceneBuffers {
    /// Build the buffers with single-time copies.
    ///
    /// # Errors
    ///
    /// Capacity, scene or device failure.
    pub fn new<D: GpuDevice, S: SceneProvider + ?Sized>(
        ctx: &mut GpuContext<D>,
        scene: &S,
        max_meshes: u32,
    ) -> Result<Self, PrismError> {
        let layout = SceneLayout::compute(scene, max_meshes)?;
        let usage = BufferUsage::STORAGE
            | BufferUsage::TRANSFER_DST
            | BufferUsage::DEVICE_ADDRESS;
        let sized = |bytes: u64| bytes.max(EMPTY_BUFFER_SIZE);

        let vertices = ctx.create_buffer(&BufferDesc {
            label: "scene vertices",
            size: sized(u64::from(layout.vertex_count) * Vertex::SIZE),
            usage,
            location: MemoryLocation::DeviceLocal,
        })?;
        let indices = ctx.create_buffer(&BufferDesc {
            label: "scene indices",
            size: sized(u64::from(layout.index_count) * 4),
            usage,
            location: MemoryLocation::DeviceLocal,
        })?;
        let sub_meshes = ctx.upload_buffer(
            &BufferDesc {
                label: "scene sub-meshes",
                size: EMPTY_BUFFER_SIZE,
                usage,
                location: MemoryLocation::DeviceLocal,
            },
            bytemuck::cast_slice(&layout.sub_meshes),
        )?;
        let instances = ctx.create_buffer(&BufferDesc {
            label: "scene instances",
            size: sized(
                layout.instance_ranges.len() as u64
                    * size_of::<InstanceRecord>() as u64,
            ),
            usage,
            location: MemoryLocation::DeviceLocal,
        })?;
        let buffers = Self {
            layout,
            vertices,
            indices,
            sub_meshes,
            instances,
            version: scene.mesh_set_version(),
        };

        let mut copies = Vec::with_capacity(buffers.layout.meshes.len() * 2);
        for range in &buffers.layout.meshes {
            let Some(mesh) = scene.meshes().get(range.mesh.0 as usize) else {
                continue;
            };
            copies.push(Command::CopyBuffer {
                src: mesh.vertex_buffer(),
                src_offset: 0,
                dst: buffers.vertices.id(),
                dst_offset: u64::from(range.vertex_offset) * Vertex::SIZE,
                size: u64::from(mesh.vertex_count()) * Vertex::SIZE,
            });
            copies.push(Command::CopyBuffer {
                src: mesh.index_buffer(),
                src_offset: 0,
                dst: buffers.indices.id(),
                dst_offset: u64::from(range.index_offset) * 4,
                size: u64::from(mesh.index_count()) * 4,
            });
        }
        let records = buffers.layout.instance_records(scene);
        let copied = ctx.one_shot(|commands| {
            commands.extend(copies);
            if !records.is_empty() {
                commands.update_buffer(
                    buffers.instances.id(),
                    0,
                    bytemuck::cast_slice(&records),
                );
            }
        });
        if let Err(e) = copied {
            buffers.destroy(ctx);
            return Err(e.into());
        }
        log::info!(
            "scene buffers: {} meshes, {} vertices, {} sub-meshes, {} instances",
            buffers.layout.meshes.len(),
            buffers.layout.vertex_count,
            buffers.layout.sub_meshes.len(),
            buffers.layout.instance_ranges.len()
        );
        Ok(buffers)
    }

    /// Record the per-frame instance-record refresh.
    pub fn record_instance_update<S: SceneProvider + ?Sized>(
        &self,
        commands: &mut CommandList,
        scene: &S,
    ) {
        let records = self.layout.instance_records(scene);
        if !records.is_empty() {
            commands.update_buffer(
                self.instances.id(),
                0,
                bytemuck::cast_slice(&records),
            );
        }
    }

    /// Buffer plan.
    #[must_use]
    pub const fn layout(&self) -> &SceneLayout {
        &self.layout
    }

    /// Mesh-set version the buffers reflect.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Concatenated vertices.
    #[must_use]
    pub fn vertices(&self) -> &Buffer {
        &self.vertices
    }

    /// Concatenated indices.
    #[must_use]
    pub fn indices(&self) -> &Buffer {
        &self.indices
    }

    /// Sub-mesh records.
    #[must_use]
    pub fn sub_meshes(&self) -> &Buffer {
        &self.sub_meshes
    }

    /// Instance records.
    #[must_use]
    pub fn instances(&self) -> &Buffer {
        &self.instances
    }

    /// Release the buffers.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut GpuContext<D>) {
        ctx.destroy_buffer(self.instances);
        ctx.destroy_buffer(self.sub_meshes);
        ctx.destroy_buffer(self.indices);
        ctx.destroy_buffer(self.vertices);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::scene::assets::{cube, demo_scene};
    use crate::scene::Scene;

    #[test]
    fn record_sizes_match_program_layouts() {
        assert_eq!(size_of::<SubMeshRecord>(), 32);
        assert_eq!(size_of::<InstanceRecord>(), 80);
    }

    #[test]
    fn shared_meshes_are_concatenated_once() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut scene = demo_scene(&mut ctx, 2).unwrap();
        let model = scene.instances()[1].model;
        let _ = scene.add_instance(model, Mat4::from_translation(Vec3::X));
        let layout = SceneLayout::compute(&scene, 16).unwrap();
        // Plane + two cubes, the re-used cube is not duplicated.
        assert_eq!(layout.meshes.len(), 3);
        assert_eq!(layout.vertex_count, 4 + 24 + 24);
        assert_eq!(layout.sub_meshes.len(), 4);
        assert_eq!(layout.sub_meshes[3].vertex_offset, layout.sub_meshes[1].vertex_offset);
        assert_eq!(layout.instance_ranges, vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        assert_eq!(layout.sub_meshes[2].index_offset, 6 + 36);
        scene.destroy(&mut ctx);
    }

    #[test]
    fn missing_textures_fall_back() {
        let fallback = ImageId::from_raw(99);
        let tex = ImageId::from_raw(5);
        let array = SceneLayout::texture_array(&[None, Some(tex)], 4, fallback);
        assert_eq!(array, vec![fallback, tex, fallback, fallback]);
    }

    #[test]
    fn too_many_sub_meshes_is_a_hard_error() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = demo_scene(&mut ctx, 3).unwrap();
        match SceneLayout::compute(&scene, 2) {
            Err(PrismError::CapacityExceeded {
                requested, capacity, ..
            }) => assert_eq!((requested, capacity), (4, 2)),
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
        scene.destroy(&mut ctx);
    }

    #[test]
    fn global_buffers_hold_mesh_bytes() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = demo_scene(&mut ctx, 1).unwrap();
        let buffers = SceneBuffers::new(&mut ctx, &scene, 8).unwrap();
        let mesh = cube(0.5);
        let cube_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let vertices = ctx.device.buffer_contents(buffers.vertices().id()).unwrap();
        let start = 4 * Vertex::SIZE as usize;
        assert_eq!(&vertices[start..start + cube_bytes.len()], cube_bytes);
        let instances = ctx.device.buffer_contents(buffers.instances().id()).unwrap();
        let first: InstanceRecord =
            bytemuck::pod_read_unaligned(&instances[..80]);
        assert_eq!(first.sub_mesh_count, 1);
        buffers.destroy(&mut ctx);
        scene.destroy(&mut ctx);
        assert!(ctx.device.validation_errors().is_empty());
    }

    #[test]
    fn empty_scene_still_gets_buffers() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = Scene::new();
        let buffers = SceneBuffers::new(&mut ctx, &scene, 8).unwrap();
        assert_eq!(buffers.vertices().size(), EMPTY_BUFFER_SIZE);
        assert!(buffers.layout().sub_meshes.is_empty());
        buffers.destroy(&mut ctx);
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let m = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let n = normal_matrix(&m);
        assert!((n.x_axis.x - 0.5).abs() < 1e-6);
        assert_eq!(n.w_axis, glam::Vec4::W);
    }
}
