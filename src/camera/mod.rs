//! Camera control and the per-frame camera state consumed by the renderer.
//!
//! [`CameraControl`] is the input-facing side (orbit around a focus point or
//! free flight); [`CameraState`] is the resolved view/projection the frame
//! pipeline uploads into the scene uniform.

use glam::{Mat4, Quat, Vec2, Vec3};

/// Perspective projection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Vertical field of view in degrees.
    pub fovy: f32,
    /// Near clipping plane distance.
    pub znear: f32,
    /// Far clipping plane distance.
    pub zfar: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fovy: 45.0,
            znear: 0.1,
            zfar: 1000.0,
        }
    }
}

/// Resolved camera for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// World-to-view transform.
    pub view: Mat4,
    /// View-to-clip transform ([0, 1] depth range).
    pub projection: Mat4,
    /// Eye position in world space.
    pub position: Vec3,
    /// Near clipping plane distance.
    pub near: f32,
    /// Far clipping plane distance.
    pub far: f32,
}

impl CameraState {
    /// Camera at `eye` looking at `target`.
    #[must_use]
    pub fn look_at(
        eye: Vec3,
        target: Vec3,
        aspect: f32,
        projection: Projection,
    ) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            // perspective_rh already uses [0,1] depth range
            projection: Mat4::perspective_rh(
                projection.fovy.to_radians(),
                aspect,
                projection.znear,
                projection.zfar,
            ),
            position: eye,
            near: projection.znear,
            far: projection.zfar,
        }
    }
}

/// How user input moves the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraControl {
    /// Orbit at `distance` around `focus`.
    Orbit {
        /// Rotation of the eye offset around the focus point.
        orientation: Quat,
        /// Eye-to-focus distance.
        distance: f32,
        /// Point orbited and looked at.
        focus: Vec3,
    },
    /// Free flight.
    Fly {
        /// Eye position.
        position: Vec3,
        /// Rotation about +Y in radians.
        yaw: f32,
        /// Rotation about the local X axis in radians.
        pitch: f32,
    },
}

impl CameraControl {
    const ROTATE_SPEED: f32 = 0.01;
    const PAN_SPEED: f32 = 0.1;
    const ZOOM_SPEED: f32 = 0.05;

    /// Orbit camera looking at `focus` from `distance` along +Z.
    #[must_use]
    pub const fn orbit(focus: Vec3, distance: f32) -> Self {
        Self::Orbit {
            orientation: Quat::IDENTITY,
            distance,
            focus,
        }
    }

    /// Eye position.
    #[must_use]
    pub fn eye(&self) -> Vec3 {
        match *self {
            Self::Orbit {
                orientation,
                distance,
                focus,
            } => focus + orientation * Vec3::Z * distance,
            Self::Fly { position, .. } => position,
        }
    }

    /// Unit view direction.
    #[must_use]
    pub fn forward(&self) -> Vec3 {
        match *self {
            Self::Orbit { orientation, .. } => orientation * -Vec3::Z,
            Self::Fly { yaw, pitch, .. } => {
                Quat::from_euler(glam::EulerRot::YXZ, yaw, pitch, 0.0)
                    * -Vec3::Z
            }
        }
    }

    /// Drag-rotate by a pointer delta in pixels.
    pub fn rotate(&mut self, delta: Vec2) {
        match self {
            Self::Orbit { orientation, .. } => {
                let up = *orientation * Vec3::Y;
                *orientation = Quat::from_axis_angle(
                    up,
                    -delta.x * Self::ROTATE_SPEED,
                ) * *orientation;
                let right = *orientation * Vec3::X;
                *orientation = Quat::from_axis_angle(
                    right,
                    -delta.y * Self::ROTATE_SPEED,
                ) * *orientation;
            }
            Self::Fly { yaw, pitch, .. } => {
                *yaw -= delta.x * Self::ROTATE_SPEED;
                *pitch = (*pitch - delta.y * Self::ROTATE_SPEED)
                    .clamp(-1.5, 1.5);
            }
        }
    }

    /// Translate sideways/up by a pointer delta in pixels.
    pub fn pan(&mut self, delta: Vec2) {
        let right = self.forward().cross(Vec3::Y).normalize_or_zero();
        let up = right.cross(self.forward());
        let translation = right * (-delta.x * Self::PAN_SPEED)
            + up * (delta.y * Self::PAN_SPEED);
        match self {
            Self::Orbit { focus, .. } => *focus += translation,
            Self::Fly { position, .. } => *position += translation,
        }
    }

    /// Dolly toward (positive) or away from the view direction.
    pub fn zoom(&mut self, delta: f32) {
        let forward = self.forward();
        match self {
            Self::Orbit { distance, .. } => {
                *distance = (*distance * (1.0 - delta * Self::ZOOM_SPEED))
                    .clamp(1.0, 1000.0);
            }
            Self::Fly { position, .. } => *position += forward * delta,
        }
    }

    /// Resolve the view and projection for a viewport of `aspect`.
    #[must_use]
    pub fn state(&self, aspect: f32, projection: Projection) -> CameraState {
        let eye = self.eye();
        CameraState::look_at(eye, eye + self.forward(), aspect, projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orbit_looks_at_focus() {
        let control = CameraControl::orbit(Vec3::new(1.0, 2.0, 3.0), 10.0);
        assert!((control.eye() - Vec3::new(1.0, 2.0, 13.0)).length() < 1e-5);
        let state = control.state(1.5, Projection::default());
        let focus_in_view = state.view.transform_point3(Vec3::new(1.0, 2.0, 3.0));
        assert!(focus_in_view.x.abs() < 1e-4 && focus_in_view.y.abs() < 1e-4);
        assert!(focus_in_view.z < 0.0);
    }

    #[test]
    fn orbit_rotation_keeps_distance() {
        let mut control = CameraControl::orbit(Vec3::ZERO, 5.0);
        control.rotate(Vec2::new(40.0, -25.0));
        assert!((control.eye().length() - 5.0).abs() < 1e-4);
    }

    #[test]
    fn zoom_is_clamped() {
        let mut control = CameraControl::orbit(Vec3::ZERO, 2.0);
        control.zoom(100.0);
        assert!(matches!(control, CameraControl::Orbit { distance, .. } if distance == 1.0));
    }

    #[test]
    fn fly_moves_along_view_direction() {
        let mut control = CameraControl::Fly {
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
        };
        control.zoom(2.0);
        assert!((control.eye() - Vec3::new(0.0, 0.0, -2.0)).length() < 1e-5);
    }
}
