// SPDX-License-Identifier: CEPL-1.0
//! Model/view/projection helpers for the per-frame transform uniform.

use bytemuck::{Pod, Zeroable};
pub use glam::{Mat4, Vec2, Vec3};

pub const EYE: Vec3 = Vec3::new(2.0, 2.0, 2.0);
pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 10.0;
pub const SPIN_DEGREES_PER_SEC: f32 = 90.0;

/// How far (in model units) a pointer at the window edge pushes the model.
pub const NUDGE_SCALE: f32 = 0.5;

/// std140-compatible layout of `binding = 0` in `quad.vert`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Transforms {
    /// Spin about +Z at [`SPIN_DEGREES_PER_SEC`], seen from [`EYE`].
    /// `nudge` is a pointer position in NDC (see [`pointer_to_ndc`]).
    pub fn orbit(seconds: f32, aspect: f32, nudge: Vec2) -> Self {
        let spin = (seconds * SPIN_DEGREES_PER_SEC).to_radians();
        let offset = nudge * NUDGE_SCALE;
        let model = Mat4::from_translation(Vec3::new(offset.x, offset.y, 0.0))
            * Mat4::from_rotation_z(spin);
        let view = Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Z);
        let proj = vulkan_perspective(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
        Self { model, view, proj }
    }

    pub fn to_uniform(&self) -> UniformBlock {
        UniformBlock {
            model: self.model.to_cols_array_2d(),
            view: self.view.to_cols_array_2d(),
            proj: self.proj.to_cols_array_2d(),
        }
    }
}

/// Right-handed perspective with Vulkan's clip space: depth 0..1 and Y pointing down.
pub fn vulkan_perspective(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y_radians, aspect, near, far);
    proj.y_axis.y *= -1.0;
    proj
}

pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    if width == 0 || height == 0 {
        1.0
    } else {
        width as f32 / height as f32
    }
}

/// Window pixel coordinates → NDC, +Y up. Degenerate windows map to the origin.
pub fn pointer_to_ndc(x: f32, y: f32, width: u32, height: u32) -> Vec2 {
    if width == 0 || height == 0 {
        return Vec2::ZERO;
    }
    let nx = (x / width as f32) * 2.0 - 1.0;
    let ny = 1.0 - (y / height as f32) * 2.0;
    Vec2::new(nx.clamp(-1.0, 1.0), ny.clamp(-1.0, 1.0))
}
