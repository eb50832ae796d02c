//! Scene collaborators: what the frame pipeline renders.
//!
//! The renderer reads the scene through [`SceneProvider`]: GPU-resident
//! meshes, materials, models (one BLAS per model, one geometry per
//! (mesh, material) part) and ordered model instances. [`Scene`] is the
//! owned implementation used by the viewer and the tests. Two version
//! counters tell the renderer what changed: `mesh_set_version` for anything
//! that changes the global scene buffers (meshes, models, instance
//! membership) and `transform_version` for instance transforms.

pub mod assets;

use glam::Mat4;

pub use crate::camera::CameraState;

use crate::error::PrismError;
use crate::gpu::{
    AccelerationStructureId, Buffer, BufferId, GpuContext, GpuDevice, Image,
    ImageId,
};

/// Index of a mesh in [`SceneProvider::meshes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// Index of a material in [`SceneProvider::materials`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

/// Index of a model in [`SceneProvider::models`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

/// Stable handle of a model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

/// Device-resident vertex and index buffers of one mesh.
#[derive(Debug)]
pub struct GpuMesh {
    pub(crate) vertices: Buffer,
    pub(crate) indices: Buffer,
    pub(crate) vertex_count: u32,
    pub(crate) index_count: u32,
}

impl GpuMesh {
    /// Vertex buffer ([`assets::Vertex`] records).
    #[must_use]
    pub fn vertex_buffer(&self) -> BufferId {
        self.vertices.id()
    }

    /// `u32` triangle-list index buffer.
    #[must_use]
    pub fn index_buffer(&self) -> BufferId {
        self.indices.id()
    }

    /// Number of vertices.
    #[must_use]
    pub const fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices.
    #[must_use]
    pub const fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Surface description of one part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    /// Base color, multiplied with the albedo texture.
    pub base_color: [f32; 4],
    /// Albedo texture; `None` when absent or failed to load.
    pub albedo: Option<ImageId>,
    /// Auxiliary (roughness/metalness) texture.
    pub aux: Option<ImageId>,
}

impl Material {
    /// Untextured material.
    #[must_use]
    pub const fn solid(base_color: [f32; 4]) -> Self {
        Self {
            base_color,
            albedo: None,
            aux: None,
        }
    }
}

/// One (mesh, material) pair of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPart {
    /// Geometry.
    pub mesh: MeshId,
    /// Surface.
    pub material: MaterialId,
}

/// A precomputed bottom-level acceleration structure.
#[derive(Debug, PartialEq, Eq)]
pub struct Blas {
    pub(crate) id: AccelerationStructureId,
    pub(crate) address: u64,
}

impl Blas {
    /// Device id.
    #[must_use]
    pub const fn id(&self) -> AccelerationStructureId {
        self.id
    }

    /// Device address referenced by TLAS instance records.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }
}

/// Parts sharing one BLAS.
#[derive(Debug)]
pub struct Model {
    /// Parts in BLAS geometry order.
    pub parts: Vec<MeshPart>,
    /// The model's BLAS.
    pub blas: Blas,
}

/// A placed model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInstance {
    /// Stable handle.
    pub id: InstanceId,
    /// Model drawn.
    pub model: ModelId,
    /// Object-to-world transform.
    pub transform: Mat4,
}

/// Read-only view of a scene, as consumed by the renderer.
pub trait SceneProvider {
    /// Meshes, indexed by [`MeshId`].
    fn meshes(&self) -> &[GpuMesh];
    /// Materials, indexed by [`MaterialId`].
    fn materials(&self) -> &[Material];
    /// Models, indexed by [`ModelId`].
    fn models(&self) -> &[Model];
    /// Instances in draw order. The position of an instance is its TLAS
    /// custom index.
    fn instances(&self) -> &[ModelInstance];
    /// Bumped when meshes, models or instance membership change.
    fn mesh_set_version(&self) -> u64;
    /// Bumped when any instance transform changes.
    fn transform_version(&self) -> u64;

    /// Model of an instance.
    fn model_of(&self, instance: &ModelInstance) -> Option<&Model> {
        self.models().get(instance.model.0 as usize)
    }
}

/// Owned scene with version counters.
#[derive(Debug, Default)]
pub struct Scene {
    meshes: Vec<GpuMesh>,
    textures: Vec<Image>,
    materials: Vec<Material>,
    models: Vec<Model>,
    instances: Vec<ModelInstance>,
    next_instance: u32,
    mesh_set_version: u64,
    transform_version: u64,
}

impl Scene {
    /// Empty scene.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a mesh.
    pub fn add_mesh(&mut self, mesh: GpuMesh) -> MeshId {
        self.meshes.push(mesh);
        self.mesh_set_version += 1;
        MeshId(self.meshes.len() as u32 - 1)
    }

    /// Take ownership of a texture image (must already be shader-readable).
    pub fn add_texture(&mut self, image: Image) -> ImageId {
        let id = image.id();
        self.textures.push(image);
        id
    }

    /// Register a material.
    pub fn add_material(&mut self, material: Material) -> MaterialId {
        self.materials.push(material);
        self.mesh_set_version += 1;
        MaterialId(self.materials.len() as u32 - 1)
    }

    /// Register a model.
    ///
    /// # Errors
    ///
    /// [`PrismError::InvalidScene`] if a part names an unknown mesh or
    /// material.
    pub fn add_model(
        &mut self,
        parts: Vec<MeshPart>,
        blas: Blas,
    ) -> Result<ModelId, PrismError> {
        let unknown = parts.iter().find(|p| {
            p.mesh.0 as usize >= self.meshes.len()
                || p.material.0 as usize >= self.materials.len()
        });
        if let Some(part) = unknown {
            return Err(PrismError::InvalidScene(format!(
                "model part {part:?} references an unknown asset"
            )));
        }
        self.models.push(Model { parts, blas });
        self.mesh_set_version += 1;
        Ok(ModelId(self.models.len() as u32 - 1))
    }

    /// Place a model.
    pub fn add_instance(&mut self, model: ModelId, transform: Mat4) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        self.instances.push(ModelInstance {
            id,
            model,
            transform,
        });
        self.mesh_set_version += 1;
        id
    }

    /// Move an instance. Returns `false` for unknown instances.
    pub fn set_transform(&mut self, id: InstanceId, transform: Mat4) -> bool {
        let Some(instance) = self.instances.iter_mut().find(|i| i.id == id)
        else {
            return false;
        };
        instance.transform = transform;
        self.transform_version += 1;
        true
    }

    /// Remove an instance. Returns `false` for unknown instances.
    pub fn remove_instance(&mut self, id: InstanceId) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| i.id != id);
        let removed = self.instances.len() != before;
        if removed {
            self.mesh_set_version += 1;
        }
        removed
    }

    /// Destroy every GPU object the scene owns. Call only once the GPU no
    /// longer reads them (after the renderer shut down or waited idle).
    pub fn destroy<D: GpuDevice>(self, ctx: &mut GpuContext<D>) {
        for model in self.models.into_iter().rev() {
            ctx.device.destroy_acceleration_structure(model.blas.id);
        }
        for mesh in self.meshes.into_iter().rev() {
            ctx.destroy_buffer(mesh.indices);
            ctx.destroy_buffer(mesh.vertices);
        }
        for texture in self.textures.into_iter().rev() {
            ctx.destroy_image(texture);
        }
    }
}

impl SceneProvider for Scene {
    fn meshes(&self) -> &[GpuMesh] {
        &self.meshes
    }

    fn materials(&self) -> &[Material] {
        &self.materials
    }

    fn models(&self) -> &[Model] {
        &self.models
    }

    fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    fn mesh_set_version(&self) -> u64 {
        self.mesh_set_version
    }

    fn transform_version(&self) -> u64 {
        self.transform_version
    }
}
