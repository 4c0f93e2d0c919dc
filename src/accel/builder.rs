//! Full scene rebuild: one bottom-level structure per unique mesh and
//! primitive class, one top-level instance list over them.
//!
//! A rebuild constructs a complete new generation of structures before any
//! old handle is released. On failure the new generation is rolled back and
//! the previously built traversable stays active.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Affine3A;
use log::{debug, info};

use crate::accel::types::{
    transform_rows, Aabb, InstanceId, InstanceRecord, MotionTransformKey, PrimitiveClass,
    TraversableHandle, INSTANCE_FLAG_TRANSFORM_DISABLED, VISIBILITY_DEFAULT, VISIBILITY_VOLUME,
};
use crate::backend::{BlasBuildInput, BlasGeometry, DeviceBackend, MotionOptions, MotionTransformDesc};
use crate::error::{DeviceResult, ErrorState};
use crate::scene::{GeometrySnapshot, Mesh, MeshId};

/// Bottom-level handles built for one mesh, in build order (curves first).
#[derive(Debug, Clone, Default)]
struct MeshBlas {
    handles: Vec<(PrimitiveClass, TraversableHandle)>,
}

/// One fully built structure set. Dropped wholesale on rollback or when a
/// newer generation replaces it.
#[derive(Default)]
struct Generation {
    blas: HashMap<MeshId, MeshBlas>,
    motion_transforms: Vec<TraversableHandle>,
    tlas: TraversableHandle,
}

impl Generation {
    fn all_handles(&self) -> Vec<TraversableHandle> {
        let mut handles: Vec<TraversableHandle> = self
            .blas
            .values()
            .flat_map(|m| m.handles.iter().map(|(_, h)| *h))
            .collect();
        handles.extend_from_slice(&self.motion_transforms);
        if !self.tlas.is_null() {
            handles.push(self.tlas);
        }
        handles
    }
}

pub struct AccelBuilder {
    backend: Arc<dyn DeviceBackend>,
    error: ErrorState,
    current: Generation,
}

impl AccelBuilder {
    pub fn new(backend: Arc<dyn DeviceBackend>, error: ErrorState) -> Self {
        Self {
            backend,
            error,
            current: Generation::default(),
        }
    }

    /// Active scene traversable, NULL before the first successful rebuild.
    pub fn traversable(&self) -> TraversableHandle {
        self.current.tlas
    }

    /// Number of live bottom-level structures, shared meshes counted once.
    pub fn blas_count(&self) -> usize {
        self.current.blas.values().map(|m| m.handles.len()).sum()
    }

    /// Rebuild everything from the snapshot. Keeps the previous traversable
    /// on failure.
    pub fn rebuild(&mut self, scene: &GeometrySnapshot, motion_blur: bool) -> DeviceResult<()> {
        self.error.check()?;

        let mut next = Generation::default();
        let result = self.build_generation(scene, motion_blur, &mut next);
        match result {
            Ok(()) => {
                let old = std::mem::replace(&mut self.current, next);
                self.release(old);
                info!(
                    "scene rebuild complete: {} bottom-level structures, {} objects",
                    self.blas_count(),
                    scene.objects.len()
                );
                Ok(())
            }
            Err(err) => {
                self.release(next);
                self.error.raise(err.clone());
                Err(err)
            }
        }
    }

    /// Free all built structures. The traversable becomes NULL.
    pub fn clear(&mut self) {
        let old = std::mem::take(&mut self.current);
        self.release(old);
    }

    fn release(&self, generation: Generation) {
        for handle in generation.all_handles() {
            // Teardown path, a free failure is not worth surfacing.
            let _ = self.backend.free_accel(handle);
        }
    }

    fn build_generation(
        &self,
        scene: &GeometrySnapshot,
        motion_blur: bool,
        next: &mut Generation,
    ) -> DeviceResult<()> {
        // Bottom level: one pass over objects, each unique mesh built once.
        for object in &scene.objects {
            if next.blas.contains_key(&object.mesh) {
                continue;
            }
            let mesh = scene.mesh(object.mesh);
            let object_motion = scene
                .objects
                .iter()
                .any(|o| o.mesh == object.mesh && o.use_motion_blur);
            let built = self.build_mesh_blas(mesh, motion_blur, object_motion)?;
            next.blas.insert(object.mesh, built);
        }

        // Top level: one instance per traceable object per bottom-level
        // handle of its mesh.
        let mut instances = Vec::new();
        for object in &scene.objects {
            if !object.traceable {
                continue;
            }
            let mesh = scene.mesh(object.mesh);
            let blas = &next.blas[&object.mesh];
            for &(_, handle) in &blas.handles {
                let mut record = InstanceRecord {
                    bounds: object.bounds,
                    transform: transform_rows(&object.transform),
                    blas: handle,
                    motion: TraversableHandle::NULL,
                    instance_id: InstanceId {
                        device_index: object.device_index,
                        non_instanced: object.baked_transform,
                    }
                    .encode(),
                    visibility_mask: if mesh.has_volume {
                        VISIBILITY_VOLUME
                    } else {
                        VISIBILITY_DEFAULT
                    },
                    flags: 0,
                    _pad: 0,
                };
                if object.baked_transform {
                    // Vertices already carry the world transform.
                    record.flags |= INSTANCE_FLAG_TRANSFORM_DISABLED;
                    record.transform = crate::accel::types::identity_transform_rows();
                }
                if motion_blur && object.use_motion_blur && object.motion.len() >= 2 {
                    let handle = self.build_motion_transform(&object.motion)?;
                    next.motion_transforms.push(handle);
                    record.motion = handle;
                    record.flags |= INSTANCE_FLAG_TRANSFORM_DISABLED;
                }
                instances.push(record);
            }
        }

        next.tlas = self.backend.build_tlas(&instances)?;
        debug!("top level built over {} instances", instances.len());
        Ok(())
    }

    fn build_mesh_blas(
        &self,
        mesh: &Mesh,
        motion_blur: bool,
        object_motion: bool,
    ) -> DeviceResult<MeshBlas> {
        let num_steps = mesh.build_motion_steps(motion_blur, object_motion);
        let motion = if num_steps > 1 {
            MotionOptions {
                num_keys: num_steps as u32,
                time_begin: 0.0,
                time_end: 1.0,
                start_vanish: true,
                end_vanish: true,
            }
        } else {
            MotionOptions::none()
        };

        let mut built = MeshBlas::default();

        if mesh.has_curves() {
            let mut aabb_steps = Vec::with_capacity(num_steps);
            for step in 0..num_steps {
                aabb_steps.push(curve_segment_bounds(mesh, step, num_steps));
            }
            let handle = self.backend.build_blas(&BlasBuildInput {
                name: &mesh.name,
                geometry: BlasGeometry::CurveAabbs {
                    aabb_steps: &aabb_steps,
                },
                motion,
                // Curve visibility is resolved during intersection, the
                // any-hit stage would double-count it.
                disable_anyhit: true,
            })?;
            built.handles.push((PrimitiveClass::Curves, handle));
        }

        if mesh.has_triangles() {
            let mut vertex_steps = Vec::with_capacity(num_steps);
            for step in 0..num_steps {
                vertex_steps.push(mesh.step_positions(step, num_steps));
            }
            let handle = self.backend.build_blas(&BlasBuildInput {
                name: &mesh.name,
                geometry: BlasGeometry::Triangles {
                    vertex_steps: &vertex_steps,
                    indices: &mesh.triangles,
                },
                motion,
                disable_anyhit: false,
            })?;
            built.handles.push((PrimitiveClass::Triangles, handle));
        }

        // A mesh without primitives builds nothing; it simply contributes no
        // instances to the top level.
        Ok(built)
    }

    fn build_motion_transform(&self, motion: &[Affine3A]) -> DeviceResult<TraversableHandle> {
        let keys: Vec<MotionTransformKey> =
            motion.iter().map(MotionTransformKey::from_transform).collect();
        self.backend.build_motion_transform(&MotionTransformDesc {
            keys: &keys,
            time_begin: 0.0,
            time_end: 1.0,
        })
    }
}

/// One inflated box per curve segment for the given motion step.
fn curve_segment_bounds(mesh: &Mesh, step: usize, num_steps: usize) -> Vec<Aabb> {
    let keys = mesh.step_curve_keys(step, num_steps);
    let mut bounds = Vec::new();
    for curve in &mesh.curves {
        for segment in 0..curve.num_segments() {
            let k0 = keys[curve.first_key + segment];
            let k1 = keys[curve.first_key + segment + 1];
            let mut aabb = Aabb::empty();
            aabb.grow_point(k0.truncate());
            aabb.grow_point(k1.truncate());
            aabb.grow_radius(k0.w.max(k1.w));
            bounds.push(aabb);
        }
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareBackend, SoftwareConfig};
    use crate::scene::{Curve, ObjectInstance};
    use glam::{Vec3, Vec4};

    fn triangle_mesh(name: &str) -> Mesh {
        Mesh {
            name: name.to_string(),
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            triangles: vec![[0, 1, 2]],
            curve_keys: Vec::new(),
            curves: Vec::new(),
            motion_steps: 3,
            motion_positions: None,
            motion_curve_keys: None,
            has_volume: false,
        }
    }

    fn object(mesh: MeshId, device_index: u32) -> ObjectInstance {
        ObjectInstance {
            mesh,
            transform: Affine3A::IDENTITY,
            bounds: Aabb::new([0.0; 3], [1.0; 3]),
            motion: Vec::new(),
            traceable: true,
            device_index,
            use_motion_blur: false,
            baked_transform: false,
        }
    }

    #[test]
    fn shared_mesh_builds_one_blas() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let mut builder = AccelBuilder::new(backend.clone(), ErrorState::new());

        let scene = GeometrySnapshot {
            meshes: vec![triangle_mesh("shared")],
            objects: vec![object(MeshId(0), 0), object(MeshId(0), 1)],
        };
        builder.rebuild(&scene, false).unwrap();

        assert_eq!(backend.blas_builds().len(), 1);
        assert_eq!(backend.tlas_instances().len(), 2);
        assert!(!builder.traversable().is_null());
    }

    #[test]
    fn curve_segment_boxes_cover_radius() {
        let mesh = Mesh {
            name: "hair".to_string(),
            positions: Vec::new(),
            triangles: Vec::new(),
            curve_keys: vec![
                Vec4::new(0.0, 0.0, 0.0, 0.1),
                Vec4::new(1.0, 0.0, 0.0, 0.2),
                Vec4::new(2.0, 0.0, 0.0, 0.1),
            ],
            curves: vec![Curve {
                first_key: 0,
                num_keys: 3,
            }],
            motion_steps: 1,
            motion_positions: None,
            motion_curve_keys: None,
            has_volume: false,
        };
        let bounds = curve_segment_bounds(&mesh, 0, 1);
        assert_eq!(bounds.len(), 2);
        // Second segment spans x [1,2] inflated by the larger radius 0.2.
        assert!((bounds[1].min[0] - 0.8).abs() < 1e-6);
        assert!((bounds[1].max[0] - 2.2).abs() < 1e-6);
    }

    fn empty_mesh(name: &str) -> Mesh {
        Mesh {
            name: name.to_string(),
            positions: Vec::new(),
            triangles: Vec::new(),
            curve_keys: Vec::new(),
            curves: Vec::new(),
            motion_steps: 1,
            motion_positions: None,
            motion_curve_keys: None,
            has_volume: false,
        }
    }

    #[test]
    fn meshes_without_primitives_build_nothing() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let error = ErrorState::new();
        let mut builder = AccelBuilder::new(backend.clone(), error.clone());

        let mut placeholder_object = object(MeshId(1), 1);
        placeholder_object.traceable = false;
        let scene = GeometrySnapshot {
            meshes: vec![triangle_mesh("solid"), empty_mesh("placeholder")],
            objects: vec![object(MeshId(0), 0), placeholder_object],
        };
        builder.rebuild(&scene, false).unwrap();

        assert!(!error.has_error());
        assert_eq!(backend.blas_builds().len(), 1);
        assert_eq!(backend.tlas_instances().len(), 1);
        assert!(!builder.traversable().is_null());

        // A traceable object over an empty mesh contributes no instances
        // either.
        let scene = GeometrySnapshot {
            meshes: vec![triangle_mesh("solid"), empty_mesh("placeholder")],
            objects: vec![object(MeshId(0), 0), object(MeshId(1), 1)],
        };
        builder.rebuild(&scene, false).unwrap();
        assert!(!error.has_error());
        assert_eq!(backend.tlas_instances().len(), 1);
    }

    #[test]
    fn failed_rebuild_keeps_previous_traversable() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let error = ErrorState::new();
        let mut builder = AccelBuilder::new(backend.clone(), error.clone());

        let scene = GeometrySnapshot {
            meshes: vec![triangle_mesh("a")],
            objects: vec![object(MeshId(0), 0)],
        };
        builder.rebuild(&scene, false).unwrap();
        let first = builder.traversable();

        backend.set_fail_builds(true);
        assert!(builder.rebuild(&scene, false).is_err());
        assert_eq!(builder.traversable(), first);
        assert!(error.has_error());
    }

    #[test]
    fn volume_mesh_widens_visibility() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let mut builder = AccelBuilder::new(backend.clone(), ErrorState::new());

        let mut mesh = triangle_mesh("fog");
        mesh.has_volume = true;
        let scene = GeometrySnapshot {
            meshes: vec![mesh],
            objects: vec![object(MeshId(0), 7)],
        };
        builder.rebuild(&scene, false).unwrap();

        let instances = backend.tlas_instances();
        assert_eq!(instances[0].visibility_mask, VISIBILITY_VOLUME);
        assert_eq!(InstanceId::decode(instances[0].instance_id).device_index, 7);
    }

    #[test]
    fn motion_objects_reference_transform_substructure() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let mut builder = AccelBuilder::new(backend.clone(), ErrorState::new());

        let mut obj = object(MeshId(0), 0);
        obj.use_motion_blur = true;
        obj.motion = vec![
            Affine3A::IDENTITY,
            Affine3A::from_translation(Vec3::new(1.0, 0.0, 0.0)),
        ];
        let scene = GeometrySnapshot {
            meshes: vec![triangle_mesh("mover")],
            objects: vec![obj],
        };
        builder.rebuild(&scene, true).unwrap();

        assert_eq!(backend.motion_transform_builds(), 1);
        let instances = backend.tlas_instances();
        assert!(!instances[0].motion.is_null());
        assert!(instances[0].flags & INSTANCE_FLAG_TRANSFORM_DISABLED != 0);
    }
}
