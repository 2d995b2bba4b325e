//! Matrix helpers for stereo rendering.
//!
//! Matrices are column-major `[f32; 16]`, laid out the way OpenGL's
//! `glLoadMatrixf` expects: element `m[col * 4 + row]`.

use serde::{Deserialize, Serialize};

pub type Mat4 = [f32; 16];

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `radians` around the +Y axis.
    pub fn from_yaw(radians: f32) -> Self {
        let half = radians * 0.5;
        Self::new(0.0, half.sin(), 0.0, half.cos())
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub const fn new(orientation: Quat, position: Vec3) -> Self {
        Self {
            orientation,
            position,
        }
    }
}

/// Field of view as four half-angles in radians. Left and down are
/// negative for a view centred on the optical axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn symmetric(horizontal_half: f32, vertical_half: f32) -> Self {
        Self {
            angle_left: -horizontal_half,
            angle_right: horizontal_half,
            angle_up: vertical_half,
            angle_down: -vertical_half,
        }
    }
}

pub fn identity() -> Mat4 {
    [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// `a * b` in column-major order.
pub fn multiply(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    out
}

/// Inverts a rigid transform (orthonormal rotation plus translation).
/// The rotation block is transposed and the translation is re-expressed
/// along each rotation axis, so no general inverse is needed.
pub fn invert_affine(m: &Mat4) -> Mat4 {
    let (tx, ty, tz) = (m[12], m[13], m[14]);
    [
        m[0],
        m[4],
        m[8],
        0.0,
        m[1],
        m[5],
        m[9],
        0.0,
        m[2],
        m[6],
        m[10],
        0.0,
        -(m[0] * tx + m[1] * ty + m[2] * tz),
        -(m[4] * tx + m[5] * ty + m[6] * tz),
        -(m[8] * tx + m[9] * ty + m[10] * tz),
        1.0,
    ]
}

pub fn translation(position: Vec3) -> Mat4 {
    let mut m = identity();
    m[12] = position.x;
    m[13] = position.y;
    m[14] = position.z;
    m
}

/// Rotation matrix from a unit quaternion.
pub fn rotation(q: Quat) -> Mat4 {
    let x2 = q.x + q.x;
    let y2 = q.y + q.y;
    let z2 = q.z + q.z;

    let xx2 = q.x * x2;
    let yy2 = q.y * y2;
    let zz2 = q.z * z2;

    let yz2 = q.y * z2;
    let wx2 = q.w * x2;
    let xy2 = q.x * y2;
    let wz2 = q.w * z2;
    let xz2 = q.x * z2;
    let wy2 = q.w * y2;

    [
        1.0 - yy2 - zz2,
        xy2 + wz2,
        xz2 - wy2,
        0.0,
        xy2 - wz2,
        1.0 - xx2 - zz2,
        yz2 + wx2,
        0.0,
        xz2 + wy2,
        yz2 - wx2,
        1.0 - xx2 - yy2,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
    ]
}

/// Asymmetric-frustum projection from tangent half-angles.
///
/// The depth row is the infinite-far-plane form (`m[10] = -1`,
/// `m[14] = -2 * near`); `far` is accepted for API symmetry and ignored.
pub fn projection_from_fov(fov: &Fov, near: f32, _far: f32) -> Mat4 {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let tan_width = tan_right - tan_left;
    let tan_height = tan_up - tan_down;

    let mut m = [0.0; 16];
    m[0] = 2.0 / tan_width;
    m[5] = 2.0 / tan_height;
    m[8] = (tan_right + tan_left) / tan_width;
    m[9] = (tan_up + tan_down) / tan_height;
    m[10] = -1.0;
    m[11] = -1.0;
    m[14] = -(near + near);
    m
}

/// World transform of a tracked pose: `translation * rotation`.
pub fn model_from_pose(pose: &Pose) -> Mat4 {
    multiply(&translation(pose.position), &rotation(pose.orientation))
}

/// Camera matrix for an eye pose, the inverse of [`model_from_pose`].
pub fn view_from_pose(pose: &Pose) -> Mat4 {
    invert_affine(&model_from_pose(pose))
}
