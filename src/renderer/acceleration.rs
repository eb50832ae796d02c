//! Top-level acceleration structure builder.
//!
//! Each frame slot owns a host-visible instance buffer; the storage and
//! scratch buffers and the TLAS itself are shared and sized in power-of-two
//! size classes so that most frames reuse them. Growing past the current
//! class waits for the queue to drain before the old objects go away.

use glam::Mat4;

use crate::error::PrismError;
use crate::frame::FRAMES_IN_FLIGHT;
use crate::gpu::{
    AccelerationInstance, AccelerationStructureId, Buffer, BufferDesc,
    BufferUsage, Command, CommandList, GpuContext, GpuDevice, InstanceFlags,
    MemoryLocation,
};
use crate::options::TlasRebuildPolicy;
use crate::scene::SceneProvider;

/// Smallest instance capacity allocated.
pub const MIN_CAPACITY: u32 = 16;

/// Visibility mask of every record (all ray types).
const FULL_MASK: u32 = 0xff;

/// Instance capacity of the size class holding `count` instances.
#[must_use]
pub fn size_class(count: u32) -> u32 {
    count.max(1).next_power_of_two().max(MIN_CAPACITY)
}

/// Row-major 3×4 form of an affine transform.
#[must_use]
pub fn row_major_3x4(transform: &Mat4) -> [[f32; 4]; 3] {
    let rows = transform.transpose();
    [
        rows.x_axis.to_array(),
        rows.y_axis.to_array(),
        rows.z_axis.to_array(),
    ]
}

/// One record per instance, in scene order. The custom index is the
/// instance's position.
///
/// # Errors
///
/// [`PrismError::InvalidScene`] if an instance names an unknown model.
pub fn records_for<S: SceneProvider + ?Sized>(
    scene: &S,
) -> Result<Vec<AccelerationInstance>, PrismError> {
    let flags = (InstanceFlags::FORCE_OPAQUE
        | InstanceFlags::TRIANGLE_FACING_CULL_DISABLE)
        .bits();
    scene
        .instances()
        .iter()
        .enumerate()
        .map(|(index, instance)| {
            let model = scene.model_of(instance).ok_or_else(|| {
                PrismError::InvalidScene(format!(
                    "instance {:?} uses unknown model {:?}",
                    instance.id, instance.model
                ))
            })?;
            Ok(AccelerationInstance {
                transform: row_major_3x4(&instance.transform),
                custom_index_and_mask: (index as u32 & 0x00ff_ffff)
                    | (FULL_MASK << 24),
                sbt_offset_and_flags: u32::from(flags) << 24,
                blas_address: model.blas.address(),
            })
        })
        .collect()
}

/// What [`TlasBuilder::record`] did this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlasUpdate {
    /// A build was recorded.
    pub built: bool,
    /// The TLAS object changed and must be rebound.
    pub reallocated: bool,
}

#[derive(Debug)]
struct Storage {
    tlas: AccelerationStructureId,
    storage: Buffer,
    scratch: Buffer,
    capacity: u32,
}

/// Per-frame TLAS refresh.
#[derive(Debug)]
pub struct TlasBuilder {
    instance_buffers: Vec<Buffer>,
    storage: Storage,
    policy: TlasRebuildPolicy,
    /// `(mesh_set_version, transform_version)` of the last build.
    built_versions: Option<(u64, u64)>,
    last_records: Vec<AccelerationInstance>,
    builds: usize,
    skips: usize,
}

impl TlasBuilder {
    /// Allocate the smallest size class.
    ///
    /// # Errors
    ///
    /// Allocation failure.
    pub fn new<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        policy: TlasRebuildPolicy,
    ) -> Result<Self, PrismError> {
        let storage = Self::allocate_storage(ctx, MIN_CAPACITY)?;
        let mut instance_buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            instance_buffers.push(Self::allocate_instances(ctx, MIN_CAPACITY)?);
        }
        Ok(Self {
            instance_buffers,
            storage,
            policy,
            built_versions: None,
            last_records: Vec::new(),
            builds: 0,
            skips: 0,
        })
    }

    /// The TLAS bound into the ray tracing table.
    #[must_use]
    pub const fn tlas(&self) -> AccelerationStructureId {
        self.storage.tlas
    }

    /// Instances the current size class holds.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.storage.capacity
    }

    /// Records of the most recent build.
    #[must_use]
    pub fn last_records(&self) -> &[AccelerationInstance] {
        &self.last_records
    }

    /// Builds recorded so far.
    #[must_use]
    pub const fn builds(&self) -> usize {
        self.builds
    }

    /// Frames that reused the previous build.
    #[must_use]
    pub const fn skips(&self) -> usize {
        self.skips
    }

    /// Change the rebuild policy.
    pub fn set_policy(&mut self, policy: TlasRebuildPolicy) {
        self.policy = policy;
    }

    /// Emit the frame's records and record a build into `commands`,
    /// followed by the barrier that makes it visible to traces.
    ///
    /// `slot` selects the instance buffer; its previous use must have
    /// completed.
    ///
    /// # Errors
    ///
    /// Unknown models, allocation or host-write failure.
    pub fn record<D: GpuDevice, S: SceneProvider + ?Sized>(
        &mut self,
        ctx: &mut GpuContext<D>,
        commands: &mut CommandList,
        scene: &S,
        slot: usize,
    ) -> Result<TlasUpdate, PrismError> {
        let versions = (scene.mesh_set_version(), scene.transform_version());
        if self.policy == TlasRebuildPolicy::OnChange
            && self.built_versions == Some(versions)
        {
            self.skips += 1;
            return Ok(TlasUpdate {
                built: false,
                reallocated: false,
            });
        }

        let records = records_for(scene)?;
        let count = records.len() as u32;
        let reallocated = count > self.storage.capacity;
        if reallocated {
            self.grow(ctx, size_class(count))?;
        }

        let instances = &self.instance_buffers[slot % FRAMES_IN_FLIGHT];
        ctx.device
            .write_buffer(instances.id(), 0, bytemuck::cast_slice(&records))?;
        commands.push(Command::BuildTopLevel {
            tlas: self.storage.tlas,
            instances: instances.id(),
            instance_count: count,
            scratch: self.storage.scratch.id(),
        });
        commands.push(Command::AccelerationStructureBarrier);

        log::debug!(
            "TLAS build: {count} instances (capacity {})",
            self.storage.capacity
        );
        self.builds += 1;
        self.built_versions = Some(versions);
        self.last_records = records;
        Ok(TlasUpdate {
            built: true,
            reallocated,
        })
    }

    /// Force the next [`record`](Self::record) to build.
    pub fn invalidate(&mut self) {
        self.built_versions = None;
    }

    /// Release every object, TLAS before the buffer storing it.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut GpuContext<D>) {
        Self::destroy_storage(ctx, self.storage);
        for buffer in self.instance_buffers.into_iter().rev() {
            ctx.destroy_buffer(buffer);
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn grow<D: GpuDevice>(
        &mut self,
        ctx: &mut GpuContext<D>,
        capacity: u32,
    ) -> Result<(), PrismError> {
        log::info!(
            "TLAS capacity {} -> {capacity} instances",
            self.storage.capacity
        );
        ctx.device.wait_idle()?;
        let storage = Self::allocate_storage(ctx, capacity)?;
        let old = std::mem::replace(&mut self.storage, storage);
        Self::destroy_storage(ctx, old);
        for buffer in &mut self.instance_buffers {
            let grown = Self::allocate_instances(ctx, capacity)?;
            let old = std::mem::replace(buffer, grown);
            ctx.destroy_buffer(old);
        }
        Ok(())
    }

    fn allocate_storage<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        capacity: u32,
    ) -> Result<Storage, PrismError> {
        let sizes = ctx.device.top_level_sizes(capacity);
        let storage = ctx.create_buffer(&BufferDesc {
            label: "TLAS storage",
            size: sizes.storage_size,
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE
                | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
        })?;
        let scratch = match ctx.create_buffer(&BufferDesc {
            label: "TLAS scratch",
            size: sizes.scratch_size,
            usage: BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
        }) {
            Ok(scratch) => scratch,
            Err(e) => {
                ctx.destroy_buffer(storage);
                return Err(e.into());
            }
        };
        match ctx.device.create_top_level(storage.id(), sizes, capacity) {
            Ok(tlas) => Ok(Storage {
                tlas,
                storage,
                scratch,
                capacity,
            }),
            Err(e) => {
                ctx.destroy_buffer(scratch);
                ctx.destroy_buffer(storage);
                Err(e.into())
            }
        }
    }

    fn allocate_instances<D: GpuDevice>(
        ctx: &mut GpuContext<D>,
        capacity: u32,
    ) -> Result<Buffer, PrismError> {
        Ok(ctx.create_buffer(&BufferDesc {
            label: "TLAS instances",
            size: u64::from(capacity) * AccelerationInstance::SIZE,
            usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT
                | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::HostVisible,
        })?)
    }

    fn destroy_storage<D: GpuDevice>(ctx: &mut GpuContext<D>, storage: Storage) {
        ctx.device.destroy_acceleration_structure(storage.tlas);
        ctx.destroy_buffer(storage.scratch);
        ctx.destroy_buffer(storage.storage);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::scene::assets::demo_scene;

    #[test]
    fn size_classes_are_powers_of_two() {
        assert_eq!(size_class(0), 16);
        assert_eq!(size_class(16), 16);
        assert_eq!(size_class(17), 32);
        assert_eq!(size_class(100), 128);
    }

    #[test]
    fn transforms_are_stored_row_major() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = row_major_3x4(&m);
        assert_eq!(rows[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(rows[2], [0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn one_record_per_instance_with_model_address() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = demo_scene(&mut ctx, 3).unwrap();
        let records = records_for(&scene).unwrap();
        assert_eq!(records.len(), scene.instances().len());
        for (i, (record, instance)) in
            records.iter().zip(scene.instances()).enumerate()
        {
            let model = scene.model_of(instance).unwrap();
            assert_eq!(record.blas_address, model.blas.address());
            assert_eq!(record.custom_index(), i as u32);
            assert_eq!(record.mask(), 0xff);
            assert!(record.flags() == (InstanceFlags::FORCE_OPAQUE
                | InstanceFlags::TRIANGLE_FACING_CULL_DISABLE));
        }
        scene.destroy(&mut ctx);
    }

    #[test]
    fn build_lands_in_the_device_structure() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let scene = demo_scene(&mut ctx, 2).unwrap();
        let mut builder =
            TlasBuilder::new(&mut ctx, TlasRebuildPolicy::EveryFrame).unwrap();
        let mut commands = CommandList::new();
        let update = builder.record(&mut ctx, &mut commands, &scene, 0).unwrap();
        assert!(update.built && !update.reallocated);
        ctx.one_shot(|c| c.extend(commands.iter().cloned())).unwrap();
        let stored = ctx.device.top_level_instances(builder.tlas()).unwrap();
        assert_eq!(stored, builder.last_records());
        assert_eq!(ctx.device.stats().tlas_builds, 1);
        builder.destroy(&mut ctx);
        scene.destroy(&mut ctx);
        assert!(ctx.device.validation_errors().is_empty());
        assert_eq!(ctx.device.live_objects(), 0);
    }

    #[test]
    fn on_change_policy_skips_unchanged_scenes() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut scene = demo_scene(&mut ctx, 1).unwrap();
        let mut builder =
            TlasBuilder::new(&mut ctx, TlasRebuildPolicy::OnChange).unwrap();
        let mut commands = CommandList::new();
        assert!(builder.record(&mut ctx, &mut commands, &scene, 0).unwrap().built);
        assert!(!builder.record(&mut ctx, &mut commands, &scene, 1).unwrap().built);
        let id = scene.instances()[0].id;
        let _ = scene.set_transform(id, Mat4::from_scale(Vec3::splat(2.0)));
        assert!(builder.record(&mut ctx, &mut commands, &scene, 0).unwrap().built);
        assert_eq!((builder.builds(), builder.skips()), (2, 1));
        builder.destroy(&mut ctx);
        scene.destroy(&mut ctx);
    }

    #[test]
    fn growing_past_the_size_class_reallocates() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut scene = demo_scene(&mut ctx, 1).unwrap();
        let model = scene.instances()[1].model;
        for i in 0..20 {
            let _ = scene.add_instance(
                model,
                Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
            );
        }
        let mut builder =
            TlasBuilder::new(&mut ctx, TlasRebuildPolicy::EveryFrame).unwrap();
        let before = builder.tlas();
        let mut commands = CommandList::new();
        let update = builder.record(&mut ctx, &mut commands, &scene, 0).unwrap();
        assert!(update.reallocated);
        assert_ne!(builder.tlas(), before);
        assert_eq!(builder.capacity(), 32);
        ctx.one_shot(|c| c.extend(commands.iter().cloned())).unwrap();
        assert_eq!(
            ctx.device.top_level_instances(builder.tlas()).unwrap().len(),
            22
        );
        builder.destroy(&mut ctx);
        scene.destroy(&mut ctx);
        assert!(ctx.device.validation_errors().is_empty());
    }
}
