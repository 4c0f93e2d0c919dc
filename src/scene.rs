//! Geometry snapshot consumed by the acceleration structure builder.
//!
//! Meshes are identified by index into the snapshot, never by pointer, so an
//! identity survives mesh reallocation between rebuilds.

use glam::{Affine3A, Vec3, Vec4};

use crate::accel::types::Aabb;

/// Index identity of a mesh within one [`GeometrySnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(pub usize);

/// Source of one motion step's positions.
///
/// The center step reads the base attribute; all other steps read the motion
/// attribute at an index that skips the implicit center step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSource {
    Center,
    Motion(usize),
}

/// Map a motion step to its attribute source.
pub fn motion_step_source(step: usize, num_steps: usize) -> StepSource {
    debug_assert!(step < num_steps);
    let center = num_steps / 2;
    if step == center {
        StepSource::Center
    } else if step < center {
        StepSource::Motion(step)
    } else {
        StepSource::Motion(step - 1)
    }
}

/// One curve: a span of keys in the mesh's curve key array. A curve with `n`
/// keys has `n - 1` segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    pub first_key: usize,
    pub num_keys: usize,
}

impl Curve {
    pub fn num_segments(&self) -> usize {
        self.num_keys.saturating_sub(1)
    }
}

/// Triangle and curve geometry of one mesh, with optional per-step motion
/// overlays laid out step-major and excluding the center step.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub name: String,
    /// Base (center step) vertex positions.
    pub positions: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
    /// Curve keys: xyz position, w radius.
    pub curve_keys: Vec<Vec4>,
    pub curves: Vec<Curve>,
    /// Number of motion steps when deformation blur is used; 1 otherwise.
    pub motion_steps: usize,
    /// `(motion_steps - 1) * positions.len()` entries, step-major.
    pub motion_positions: Option<Vec<Vec3>>,
    /// `(motion_steps - 1) * curve_keys.len()` entries, step-major.
    pub motion_curve_keys: Option<Vec<Vec4>>,
    /// Whether the mesh carries volume shaders; widens the visibility mask.
    pub has_volume: bool,
}

impl Mesh {
    pub fn has_triangles(&self) -> bool {
        !self.triangles.is_empty()
    }

    pub fn has_curves(&self) -> bool {
        !self.curves.is_empty()
    }

    /// Effective motion step count for a BLAS build: 1 unless motion blur is
    /// globally enabled, the mesh carries a motion attribute, and the object
    /// requests motion blur.
    pub fn build_motion_steps(&self, motion_blur: bool, object_motion: bool) -> usize {
        let has_motion_attribute =
            self.motion_positions.is_some() || self.motion_curve_keys.is_some();
        if motion_blur && object_motion && has_motion_attribute {
            self.motion_steps.max(1)
        } else {
            1
        }
    }

    /// Vertex positions for one motion step.
    pub fn step_positions(&self, step: usize, num_steps: usize) -> Vec<Vec3> {
        match motion_step_source(step, num_steps) {
            StepSource::Center => self.positions.clone(),
            StepSource::Motion(index) => {
                let n = self.positions.len();
                let overlay = self
                    .motion_positions
                    .as_ref()
                    .expect("motion step requested without motion attribute");
                overlay[index * n..(index + 1) * n].to_vec()
            }
        }
    }

    /// Curve keys for one motion step.
    pub fn step_curve_keys(&self, step: usize, num_steps: usize) -> Vec<Vec4> {
        match motion_step_source(step, num_steps) {
            StepSource::Center => self.curve_keys.clone(),
            StepSource::Motion(index) => {
                let n = self.curve_keys.len();
                let overlay = self
                    .motion_curve_keys
                    .as_ref()
                    .expect("motion step requested without curve motion attribute");
                overlay[index * n..(index + 1) * n].to_vec()
            }
        }
    }
}

/// One object in the active scene.
#[derive(Debug, Clone)]
pub struct ObjectInstance {
    pub mesh: MeshId,
    pub transform: Affine3A,
    /// World-space bounds, copied onto the TLAS instance record.
    pub bounds: Aabb,
    /// Per-frame motion transform samples; empty for static objects.
    pub motion: Vec<Affine3A>,
    /// Non-traceable objects are skipped during TLAS assembly.
    pub traceable: bool,
    /// Shading-visible object index on this device.
    pub device_index: u32,
    /// Per-object motion blur request.
    pub use_motion_blur: bool,
    /// Transform already baked into vertex data (non-instanced case).
    pub baked_transform: bool,
}

/// The scene as seen by one device context at rebuild time.
#[derive(Debug, Clone, Default)]
pub struct GeometrySnapshot {
    pub meshes: Vec<Mesh>,
    pub objects: Vec<ObjectInstance>,
}

impl GeometrySnapshot {
    pub fn mesh(&self, id: MeshId) -> &Mesh {
        &self.meshes[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_step_round_trip() {
        // Every step visited exactly once: the center maps to the base
        // attribute, the rest cover motion indices 0..num_steps-1 without
        // duplicates or gaps.
        for num_steps in [1usize, 3, 5, 7] {
            let mut motion_seen = vec![false; num_steps - 1];
            let mut center_seen = false;
            for step in 0..num_steps {
                match motion_step_source(step, num_steps) {
                    StepSource::Center => {
                        assert!(!center_seen);
                        center_seen = true;
                    }
                    StepSource::Motion(i) => {
                        assert!(!motion_seen[i], "motion index {} visited twice", i);
                        motion_seen[i] = true;
                    }
                }
            }
            assert!(center_seen);
            assert!(motion_seen.iter().all(|&seen| seen));
        }
    }

    #[test]
    fn step_positions_select_overlay() {
        let mesh = Mesh {
            positions: vec![Vec3::ZERO, Vec3::ONE],
            motion_steps: 3,
            motion_positions: Some(vec![
                Vec3::splat(-1.0),
                Vec3::splat(-2.0),
                Vec3::splat(10.0),
                Vec3::splat(20.0),
            ]),
            ..Default::default()
        };
        assert_eq!(mesh.step_positions(1, 3), vec![Vec3::ZERO, Vec3::ONE]);
        assert_eq!(
            mesh.step_positions(0, 3),
            vec![Vec3::splat(-1.0), Vec3::splat(-2.0)]
        );
        assert_eq!(
            mesh.step_positions(2, 3),
            vec![Vec3::splat(10.0), Vec3::splat(20.0)]
        );
    }

    #[test]
    fn build_motion_steps_requires_all_three_conditions() {
        let mut mesh = Mesh {
            motion_steps: 3,
            ..Default::default()
        };
        assert_eq!(mesh.build_motion_steps(true, true), 1); // no attribute
        mesh.motion_positions = Some(Vec::new());
        assert_eq!(mesh.build_motion_steps(false, true), 1); // blur disabled
        assert_eq!(mesh.build_motion_steps(true, false), 1); // object opts out
        assert_eq!(mesh.build_motion_steps(true, true), 3);
    }
}
