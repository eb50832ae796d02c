//! Asset loading stand-in: procedural meshes, mesh upload, model BLAS
//! builds and solid-color textures.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use super::{Blas, GpuMesh, Material, MeshPart, ModelId, Scene, SceneProvider};
use crate::error::PrismError;
use crate::gpu::{
    BottomLevelDesc, BottomLevelGeometry, BufferDesc, BufferUsage, Command,
    Extent2d, GpuContext, GpuDevice, GpuError, Image, ImageDesc, ImageFormat,
    ImageLayout, ImageUsage, MemoryLocation,
};

/// Vertex layout shared by the raster and trace programs.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position.
    pub position: [f32; 3],
    /// Object-space unit normal.
    pub normal: [f32; 3],
    /// Texture coordinate.
    pub uv: [f32; 2],
}

impl Vertex {
    /// Byte stride of one vertex.
    pub const SIZE: u64 = size_of::<Self>() as u64;
}

/// CPU-side triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertices.
    pub vertices: Vec<Vertex>,
    /// Triangle-list indices.
    pub indices: Vec<u32>,
}

impl MeshData {
    fn push_quad(&mut self, corners: [Vec3; 4], normal: Vec3) {
        let base = self.vertices.len() as u32;
        let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        for (corner, uv) in corners.into_iter().zip(uvs) {
            self.vertices.push(Vertex {
                position: corner.to_array(),
                normal: normal.to_array(),
                uv,
            });
        }
        self.indices
            .extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

/// Axis-aligned cube centred on the origin, 4 vertices per face.
#[must_use]
pub fn cube(half_extent: f32) -> MeshData {
    let h = half_extent;
    let mut mesh = MeshData::default();
    for axis in [Vec3::X, Vec3::Y, Vec3::Z] {
        for sign in [1.0, -1.0] {
            let n = axis * sign;
            // Two tangents with u × v == n so faces wind counter-clockwise.
            let tangent = if axis == Vec3::Y { Vec3::Z } else { Vec3::Y };
            let u = tangent.cross(n);
            let v = n.cross(u);
            let c = n * h;
            mesh.push_quad(
                [
                    c - u * h - v * h,
                    c + u * h - v * h,
                    c + u * h + v * h,
                    c - u * h + v * h,
                ],
                n,
            );
        }
    }
    mesh
}

/// Square in the XZ plane facing +Y.
#[must_use]
pub fn plane(size: f32) -> MeshData {
    let h = size * 0.5;
    let mut mesh = MeshData::default();
    mesh.push_quad(
        [
            Vec3::new(-h, 0.0, h),
            Vec3::new(h, 0.0, h),
            Vec3::new(h, 0.0, -h),
            Vec3::new(-h, 0.0, -h),
        ],
        Vec3::Y,
    );
    mesh
}

/// Upload a mesh into device-local vertex and index buffers.
///
/// # Errors
///
/// Allocation or upload failure.
pub fn upload_mesh<D: GpuDevice>(
    ctx: &mut GpuContext<D>,
    mesh: &MeshData,
) -> Result<GpuMesh, GpuError> {
    let usage = BufferUsage::VERTEX
        | BufferUsage::INDEX
        | BufferUsage::STORAGE
        | BufferUsage::ACCELERATION_STRUCTURE_INPUT
        | BufferUsage::TRANSFER_SRC
        | BufferUsage::DEVICE_ADDRESS;
    let vertices = ctx.upload_buffer(
        &BufferDesc {
            label: "mesh vertices",
            size: 0,
            usage,
            location: MemoryLocation::DeviceLocal,
        },
        bytemuck::cast_slice(&mesh.vertices),
    )?;
    let indices = match ctx.upload_buffer(
        &BufferDesc {
            label: "mesh indices",
            size: 0,
            usage,
            location: MemoryLocation::DeviceLocal,
        },
        bytemuck::cast_slice(&mesh.indices),
    ) {
        Ok(indices) => indices,
        Err(e) => {
            ctx.destroy_buffer(vertices);
            return Err(e);
        }
    };
    Ok(GpuMesh {
        vertices,
        indices,
        vertex_count: mesh.vertices.len() as u32,
        index_count: mesh.indices.len() as u32,
    })
}

/// Build the BLAS of a model: one triangle geometry per part.
///
/// # Errors
///
/// [`PrismError::InvalidScene`] for an unknown mesh, otherwise device
/// failure.
pub fn build_model_blas<D: GpuDevice>(
    ctx: &mut GpuContext<D>,
    scene: &Scene,
    parts: &[MeshPart],
    label: &str,
) -> Result<Blas, PrismError> {
    let meshes = scene.meshes();
    let geometries = parts
        .iter()
        .map(|part| {
            let mesh = meshes.get(part.mesh.0 as usize).ok_or_else(|| {
                PrismError::InvalidScene(format!("unknown mesh {:?}", part.mesh))
            })?;
            Ok(BottomLevelGeometry {
                vertex_buffer: mesh.vertex_buffer(),
                vertex_count: mesh.vertex_count(),
                vertex_stride: Vertex::SIZE,
                index_buffer: mesh.index_buffer(),
                index_count: mesh.index_count(),
            })
        })
        .collect::<Result<Vec<_>, PrismError>>()?;
    let id = ctx
        .device
        .create_bottom_level(&BottomLevelDesc { label, geometries })?;
    let address = match ctx.device.acceleration_structure_address(id) {
        Ok(address) => address,
        Err(e) => {
            ctx.device.destroy_acceleration_structure(id);
            return Err(e.into());
        }
    };
    Ok(Blas { id, address })
}

/// 1×1 texture filled with `color`, left shader-readable.
///
/// # Errors
///
/// Allocation or submission failure.
pub fn solid_texture<D: GpuDevice>(
    ctx: &mut GpuContext<D>,
    color: [f32; 4],
    label: &str,
) -> Result<Image, GpuError> {
    let image = ctx.create_image(&ImageDesc {
        label,
        extent: Extent2d::new(1, 1),
        format: ImageFormat::Rgba8Unorm,
        usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
    })?;
    let id = image.id();
    let filled = ctx.one_shot(|commands| {
        commands.image_barrier(id, ImageLayout::Undefined, ImageLayout::TransferDst);
        commands.push(Command::ClearImage { image: id, color });
        commands.image_barrier(
            id,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        );
    });
    match filled {
        Ok(()) => Ok(image),
        Err(e) => {
            ctx.destroy_image(image);
            Err(e)
        }
    }
}

/// Upload `mesh` and register a single-part model using `material`.
///
/// # Errors
///
/// Upload, BLAS build or registration failure.
pub fn add_single_part_model<D: GpuDevice>(
    ctx: &mut GpuContext<D>,
    scene: &mut Scene,
    mesh: &MeshData,
    material: Material,
    label: &str,
) -> Result<ModelId, PrismError> {
    let mesh = scene.add_mesh(upload_mesh(ctx, mesh)?);
    let material = scene.add_material(material);
    let parts = vec![MeshPart { mesh, material }];
    let blas = build_model_blas(ctx, scene, &parts, label)?;
    scene.add_model(parts, blas)
}

/// Ground plane plus `cubes` colored cubes in a row.
///
/// # Errors
///
/// Any asset creation failure.
pub fn demo_scene<D: GpuDevice>(
    ctx: &mut GpuContext<D>,
    cubes: usize,
) -> Result<Scene, PrismError> {
    const PALETTE: [[f32; 4]; 4] = [
        [0.85, 0.25, 0.2, 1.0],
        [0.25, 0.7, 0.3, 1.0],
        [0.2, 0.4, 0.85, 1.0],
        [0.9, 0.75, 0.2, 1.0],
    ];

    let mut scene = Scene::new();
    let white = solid_texture(ctx, [1.0; 4], "demo white")?;
    let white = scene.add_texture(white);
    let ground = add_single_part_model(
        ctx,
        &mut scene,
        &plane(20.0),
        Material {
            base_color: [0.7, 0.7, 0.7, 1.0],
            albedo: Some(white),
            aux: None,
        },
        "ground",
    )?;
    let _ = scene.add_instance(ground, Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)));

    let cube_mesh = cube(0.5);
    for (i, color) in PALETTE.iter().cycle().take(cubes).enumerate() {
        let model = add_single_part_model(
            ctx,
            &mut scene,
            &cube_mesh,
            Material::solid(*color),
            "cube",
        )?;
        let x = i as f32 * 1.5 - (cubes.saturating_sub(1)) as f32 * 0.75;
        let _ = scene.add_instance(model, Mat4::from_translation(Vec3::new(x, -0.5, 0.0)));
    }
    log::info!(
        "demo scene: {} models, {} instances",
        scene.models().len(),
        scene.instances().len()
    );
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::scene::{MaterialId, MeshId};

    #[test]
    fn cube_faces_point_outwards() {
        let mesh = cube(1.0);
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]]
                .map(|i| Vec3::from(mesh.vertices[i as usize].position));
            let n = Vec3::from(mesh.vertices[tri[0] as usize].normal);
            assert!((b - a).cross(c - a).dot(n) > 0.0);
            assert!(a.dot(n) > 0.0);
        }
    }

    #[test]
    fn plane_faces_up() {
        let mesh = plane(2.0);
        let [a, b, c] = [0, 1, 2].map(|i| Vec3::from(mesh.vertices[i].position));
        assert!((b - a).cross(c - a).y > 0.0);
    }

    #[test]
    fn uploaded_mesh_matches_source_bytes() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let data = cube(0.5);
        let mesh = upload_mesh(&mut ctx, &data).unwrap();
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(
            ctx.device.buffer_contents(mesh.vertex_buffer()).unwrap(),
            bytemuck::cast_slice::<Vertex, u8>(&data.vertices)
        );
        assert_eq!(Vertex::SIZE, 32);
    }

    #[test]
    fn solid_texture_is_shader_readable() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let image = solid_texture(&mut ctx, [1.0, 0.0, 0.0, 1.0], "red").unwrap();
        assert_eq!(
            ctx.device.image_layout(image.id()),
            Some(ImageLayout::ShaderReadOnly)
        );
        assert_eq!(
            ctx.device.image_texels(image.id()).unwrap()[0],
            [1.0, 0.0, 0.0, 1.0]
        );
        ctx.destroy_image(image);
    }

    #[test]
    fn demo_scene_has_distinct_blas_per_model() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = demo_scene(&mut ctx, 3).unwrap();
        assert_eq!(scene.instances().len(), 4);
        let mut addresses: Vec<u64> =
            scene.models().iter().map(|m| m.blas.address()).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), 4);
        scene.destroy(&mut ctx);
        assert_eq!(ctx.device.live_objects(), 0);
        assert!(ctx.device.validation_errors().is_empty());
    }

    #[test]
    fn scene_versions_track_changes() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut scene = demo_scene(&mut ctx, 1).unwrap();
        let (mesh_v, xform_v) = (scene.mesh_set_version(), scene.transform_version());
        let id = scene.instances()[1].id;
        assert!(scene.set_transform(id, Mat4::IDENTITY));
        assert_eq!(scene.mesh_set_version(), mesh_v);
        assert_eq!(scene.transform_version(), xform_v + 1);
        assert!(scene.remove_instance(id));
        assert!(!scene.remove_instance(id));
        assert_eq!(scene.mesh_set_version(), mesh_v + 1);
        scene.destroy(&mut ctx);
    }

    #[test]
    fn model_with_unknown_mesh_is_rejected() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = Scene::new();
        let parts = [MeshPart {
            mesh: MeshId(3),
            material: MaterialId(0),
        }];
        assert!(matches!(
            build_model_blas(&mut ctx, &scene, &parts, "bad"),
            Err(PrismError::InvalidScene(_))
        ));
    }
}
