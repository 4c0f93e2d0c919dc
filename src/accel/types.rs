//! GPU-layout types for acceleration structures.

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec3};

/// Axis-aligned bounding box, GPU compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub _pad0: f32,
    pub max: [f32; 3],
    pub _pad1: f32,
}

impl Aabb {
    /// Empty box (inverted bounds for union operations).
    pub fn empty() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            _pad0: 0.0,
            max: [f32::NEG_INFINITY; 3],
            _pad1: 0.0,
        }
    }

    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            min,
            _pad0: 0.0,
            max,
            _pad1: 0.0,
        }
    }

    pub fn grow_point(&mut self, p: Vec3) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Inflate uniformly, used to cover curve segment radius.
    pub fn grow_radius(&mut self, r: f32) {
        for i in 0..3 {
            self.min[i] -= r;
            self.max[i] += r;
        }
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.min[i] <= self.max[i])
    }
}

/// Opaque accelerator-side reference to a built structure, substituted into
/// shader-visible constant data before traversal launches.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TraversableHandle(pub u64);

impl TraversableHandle {
    pub const NULL: TraversableHandle = TraversableHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Primitive classes that get dedicated bottom-level structures. Curves are
/// built before triangles for each mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveClass {
    Curves,
    Triangles,
}

/// Ray visibility masks. The volume mask is a strict superset of the default
/// so traversal can selectively include or exclude volume objects.
pub const VISIBILITY_DEFAULT: u32 = 0x01;
pub const VISIBILITY_VOLUME: u32 = 0x03;

/// Instance transform is superseded (baked into vertices, or replaced by a
/// motion transform sub-structure).
pub const INSTANCE_FLAG_TRANSFORM_DISABLED: u32 = 0x1;

pub const NON_INSTANCED_BIT: u32 = 1 << 31;

/// Shading-visible identity of an instance.
///
/// Non-instanced objects bake their transform into vertex data; shading
/// lookups need to distinguish them, so the encoded id carries an explicit
/// marker bit. The tag lives only at this serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceId {
    pub device_index: u32,
    pub non_instanced: bool,
}

impl InstanceId {
    pub fn encode(&self) -> u32 {
        debug_assert!(self.device_index < NON_INSTANCED_BIT);
        if self.non_instanced {
            self.device_index | NON_INSTANCED_BIT
        } else {
            self.device_index
        }
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            device_index: raw & !NON_INSTANCED_BIT,
            non_instanced: raw & NON_INSTANCED_BIT != 0,
        }
    }
}

/// One top-level instance record submitted to the TLAS build.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// World-space bounds copied from the object.
    pub bounds: Aabb,
    /// Object-to-world transform, rows of a 3x4 affine matrix.
    pub transform: [[f32; 4]; 3],
    /// Bottom-level structure this instance references.
    pub blas: TraversableHandle,
    /// Motion transform sub-structure, or null for static instances.
    pub motion: TraversableHandle,
    /// Encoded [`InstanceId`].
    pub instance_id: u32,
    pub visibility_mask: u32,
    pub flags: u32,
    pub _pad: u32,
}

impl InstanceRecord {
    pub fn transform_disabled(&self) -> bool {
        self.flags & INSTANCE_FLAG_TRANSFORM_DISABLED != 0
    }
}

/// Rows of a 3x4 affine matrix from a `glam` transform.
pub fn transform_rows(t: &Affine3A) -> [[f32; 4]; 3] {
    let m = glam::Mat4::from(*t);
    let cols = m.to_cols_array_2d();
    let mut rows = [[0.0f32; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for c in 0..4 {
            row[c] = cols[c][r];
        }
    }
    rows
}

pub fn identity_transform_rows() -> [[f32; 4]; 3] {
    transform_rows(&Affine3A::IDENTITY)
}

/// One decomposed motion key: scale / rotation / translation, re-composed by
/// the accelerator when interpolating instance motion.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MotionTransformKey {
    pub scale: [f32; 3],
    pub _pad0: f32,
    /// Rotation quaternion (x, y, z, w).
    pub rotation: [f32; 4],
    pub translation: [f32; 3],
    pub _pad1: f32,
}

impl MotionTransformKey {
    /// Decompose one motion sample.
    pub fn from_transform(t: &Affine3A) -> Self {
        let (scale, rotation, translation) = glam::Mat4::from(*t).to_scale_rotation_translation();
        Self {
            scale: scale.to_array(),
            _pad0: 0.0,
            rotation: rotation.to_array(),
            translation: translation.to_array(),
            _pad1: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn instance_id_round_trip() {
        for &(index, tag) in &[(0u32, false), (42, true), (7, false), ((1 << 31) - 1, true)] {
            let id = InstanceId {
                device_index: index,
                non_instanced: tag,
            };
            let decoded = InstanceId::decode(id.encode());
            assert_eq!(decoded, id);
        }
    }

    #[test]
    fn aabb_grow_covers_radius() {
        let mut b = Aabb::empty();
        b.grow_point(Vec3::new(1.0, 2.0, 3.0));
        b.grow_point(Vec3::new(-1.0, 0.0, 1.0));
        b.grow_radius(0.5);
        assert_eq!(b.min, [-1.5, -0.5, 0.5]);
        assert_eq!(b.max, [1.5, 2.5, 3.5]);
        assert!(b.is_valid());
    }

    #[test]
    fn transform_rows_match_point_transform() {
        let t = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 2.0, 2.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            Vec3::new(1.0, 0.0, -1.0),
        );
        let rows = transform_rows(&t);
        let p = Vec3::new(1.0, 1.0, 1.0);
        let expected = t.transform_point3(p);
        for i in 0..3 {
            let got =
                rows[i][0] * p.x + rows[i][1] * p.y + rows[i][2] * p.z + rows[i][3];
            assert!((got - expected[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn motion_key_decomposition() {
        let t = Affine3A::from_scale_rotation_translation(
            Vec3::splat(3.0),
            Quat::from_rotation_z(0.7),
            Vec3::new(5.0, -2.0, 0.5),
        );
        let key = MotionTransformKey::from_transform(&t);
        assert!((key.scale[0] - 3.0).abs() < 1e-5);
        assert_eq!(key.translation, [5.0, -2.0, 0.5]);
        let q = Quat::from_array(key.rotation);
        assert!(q.is_normalized());
    }
}
