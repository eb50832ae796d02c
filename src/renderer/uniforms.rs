//! GPU-visible uniform and push-constant blocks shared by the passes and
//! their programs.

use bytemuck::{Pod, Zeroable};

use crate::camera::CameraState;

/// Color the miss program writes for rays that leave the scene.
pub const MISS_COLOR: [f32; 4] = [0.53, 0.68, 0.92, 1.0];

/// Per-frame scene uniform read by every pass.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct SceneUniform {
    /// World-to-view transform.
    pub view: [[f32; 4]; 4],
    /// View-to-clip transform.
    pub projection: [[f32; 4]; 4],
    /// Inverse of `view`.
    pub inverse_view: [[f32; 4]; 4],
    /// Inverse of `projection`.
    pub inverse_projection: [[f32; 4]; 4],
    /// Eye position (w = 1).
    pub camera_position: [f32; 4],
    /// Maximum trace recursion depth.
    pub max_depth: u32,
    /// Near clipping plane distance.
    pub near: f32,
    /// Far clipping plane distance.
    pub far: f32,
    /// Samples traced per pixel per frame.
    pub samples_per_pixel: u32,
}

impl SceneUniform {
    /// Byte size of the block.
    pub const SIZE: u64 = size_of::<Self>() as u64;

    /// Uniform for `camera` with the given trace parameters.
    #[must_use]
    pub fn new(camera: &CameraState, max_depth: u32, samples_per_pixel: u32) -> Self {
        Self {
            view: camera.view.to_cols_array_2d(),
            projection: camera.projection.to_cols_array_2d(),
            inverse_view: camera.view.inverse().to_cols_array_2d(),
            inverse_projection: camera.projection.inverse().to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
            max_depth,
            near: camera.near,
            far: camera.far,
            samples_per_pixel,
        }
    }
}

/// Push constants of one geometry-pass draw.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct DrawPushConstants {
    /// Frames rendered since startup.
    pub frame_counter: u32,
    /// Index into the per-instance transform buffer.
    pub instance_index: u32,
    /// Padding for GPU alignment.
    pub(crate) _pad: [u32; 2],
    /// Material base color (multiplied with the albedo texture).
    pub base_color: [f32; 4],
}

impl DrawPushConstants {
    /// Block for one (instance, material) draw.
    #[must_use]
    pub const fn new(
        frame_counter: u32,
        instance_index: u32,
        base_color: [f32; 4],
    ) -> Self {
        Self {
            frame_counter,
            instance_index,
            _pad: [0; 2],
            base_color,
        }
    }
}

/// Push constants of the full-screen lighting composite.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct LightingPushConstants {
    /// Frames rendered since startup.
    pub frame_counter: u32,
    /// Padding for GPU alignment.
    pub(crate) _pad: [u32; 3],
    /// Color of pixels no geometry covers.
    pub clear_color: [f32; 4],
}

impl LightingPushConstants {
    /// Block for one composite.
    #[must_use]
    pub const fn new(frame_counter: u32, clear_color: [f32; 4]) -> Self {
        Self {
            frame_counter,
            _pad: [0; 3],
            clear_color,
        }
    }
}

/// Push constants of one trace dispatch.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct TracePushConstants {
    /// Frames rendered since startup; never resets.
    pub frame_counter: u32,
    /// Frames accumulated into the previous image (0 restarts
    /// accumulation).
    pub accumulated: u32,
    /// Fresh random seed for this dispatch.
    pub seed: u32,
    /// Padding for GPU alignment.
    pub(crate) _pad: u32,
}

impl TracePushConstants {
    /// Block for one dispatch.
    #[must_use]
    pub const fn new(frame_counter: u32, accumulated: u32, seed: u32) -> Self {
        Self {
            frame_counter,
            accumulated,
            seed,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;

    #[test]
    fn block_sizes_match_program_layouts() {
        assert_eq!(SceneUniform::SIZE, 288);
        assert_eq!(size_of::<DrawPushConstants>(), 32);
        assert_eq!(size_of::<LightingPushConstants>(), 32);
        assert_eq!(size_of::<TracePushConstants>(), 16);
    }

    #[test]
    fn scene_uniform_carries_inverses() {
        let camera = CameraState {
            view: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            projection: Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0),
            position: Vec3::new(-1.0, -2.0, -3.0),
            near: 0.1,
            far: 100.0,
        };
        let uniform = SceneUniform::new(&camera, 4, 2);
        let round_trip = Mat4::from_cols_array_2d(&uniform.view)
            * Mat4::from_cols_array_2d(&uniform.inverse_view);
        assert!(round_trip.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert_eq!(uniform.camera_position, [-1.0, -2.0, -3.0, 1.0]);
        assert_eq!(uniform.max_depth, 4);
        assert_eq!(uniform.samples_per_pixel, 2);
    }
}
