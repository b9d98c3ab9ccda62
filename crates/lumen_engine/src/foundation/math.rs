//! Math utilities and types
//!
//! nalgebra aliases used across the renderer, plus conversions into the
//! plain column-major arrays that GPU-visible structs store.

pub use nalgebra::{Matrix3, Matrix4, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Column-major array form of a 4x4 matrix, matching GLSL `mat4` layout
pub fn mat4_to_cols(m: &Mat4) -> [[f32; 4]; 4] {
    let mut cols = [[0.0; 4]; 4];
    for (c, col) in cols.iter_mut().enumerate() {
        for (r, value) in col.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    cols
}

/// Widen a 3x3 matrix into the upper-left of a 4x4 one (std140 `mat3` padding)
pub fn mat3_to_mat4(m: &Mat3) -> Mat4 {
    let mut out = Mat4::identity();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(m);
    out
}

/// Pack a vector and a scalar into a `vec4`
pub fn vec4_from(v: &Vec3, w: f32) -> [f32; 4] {
    [v.x, v.y, v.z, w]
}
