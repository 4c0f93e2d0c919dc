//! Compiled kernel contract.
//!
//! Kernels are compiled by an offline step and loaded by name; this module
//! owns the entry-point names and the feature set that selects which
//! pipelines a device requests. Nothing here compiles anything.

pub mod cache;

pub use cache::DeviceKey;

use serde::{Deserialize, Serialize};

/// Path tracing pipeline.
pub const KERNEL_PATH_TRACE: &str = "kernel_path_trace";
pub const KERNEL_BAKE: &str = "kernel_bake";

/// Shader evaluation kernels.
pub const KERNEL_DISPLACE: &str = "kernel_displace";
pub const KERNEL_BACKGROUND: &str = "kernel_background";

/// Film conversion kernels.
pub const KERNEL_CONVERT_TO_BYTE: &str = "kernel_convert_to_byte";
pub const KERNEL_CONVERT_TO_HALF_FLOAT: &str = "kernel_convert_to_half_float";

/// Denoise filter kernels.
pub const KERNEL_FILTER_NLM_CALC_DIFFERENCE: &str = "kernel_filter_nlm_calc_difference";
pub const KERNEL_FILTER_NLM_BLUR: &str = "kernel_filter_nlm_blur";
pub const KERNEL_FILTER_NLM_CALC_WEIGHT: &str = "kernel_filter_nlm_calc_weight";
pub const KERNEL_FILTER_NLM_UPDATE_OUTPUT: &str = "kernel_filter_nlm_update_output";
pub const KERNEL_FILTER_NLM_NORMALIZE: &str = "kernel_filter_nlm_normalize";
pub const KERNEL_FILTER_NLM_CONSTRUCT_GRAMIAN: &str = "kernel_filter_nlm_construct_gramian";
pub const KERNEL_FILTER_CONSTRUCT_TRANSFORM: &str = "kernel_filter_construct_transform";
pub const KERNEL_FILTER_FINALIZE: &str = "kernel_filter_finalize";
pub const KERNEL_FILTER_COMBINE_HALVES: &str = "kernel_filter_combine_halves";
pub const KERNEL_FILTER_DIVIDE_SHADOW: &str = "kernel_filter_divide_shadow";
pub const KERNEL_FILTER_GET_FEATURE: &str = "kernel_filter_get_feature";
pub const KERNEL_FILTER_WRITE_FEATURE: &str = "kernel_filter_write_feature";
pub const KERNEL_FILTER_DETECT_OUTLIERS: &str = "kernel_filter_detect_outliers";

/// Ray-tracing program groups expected from the compiled pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramGroup {
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Exception,
}

/// Feature switches that select which kernel sets a device loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelFeatures {
    pub motion_blur: bool,
    pub curves: bool,
    pub denoising: bool,
    pub bake: bool,
}

impl KernelFeatures {
    /// Stable cache key for this feature combination.
    pub fn cache_key(&self) -> String {
        format!(
            "mb{}_cv{}_dn{}_bk{}",
            self.motion_blur as u8, self.curves as u8, self.denoising as u8, self.bake as u8
        )
    }

    /// Program groups the compiled pipeline must provide. Curve primitives
    /// add a custom intersection program; everything else traces built-in
    /// triangles.
    pub fn program_groups(&self) -> Vec<ProgramGroup> {
        let mut groups = vec![
            ProgramGroup::RayGen,
            ProgramGroup::Miss,
            ProgramGroup::ClosestHit,
            ProgramGroup::AnyHit,
            ProgramGroup::Exception,
        ];
        if self.curves {
            groups.push(ProgramGroup::Intersection);
        }
        groups
    }
}

/// A kernel load request passed to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KernelRequest {
    pub features: KernelFeatures,
}

/// Opaque handle to a loaded kernel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSetHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_distinguishes_features() {
        let a = KernelFeatures {
            motion_blur: true,
            ..Default::default()
        };
        let b = KernelFeatures {
            curves: true,
            ..Default::default()
        };
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), a.cache_key());
    }

    #[test]
    fn curves_require_an_intersection_program() {
        let flat = KernelFeatures::default().program_groups();
        assert!(!flat.contains(&ProgramGroup::Intersection));

        let curved = KernelFeatures {
            curves: true,
            ..Default::default()
        }
        .program_groups();
        assert!(curved.contains(&ProgramGroup::Intersection));
        assert_eq!(curved.len(), flat.len() + 1);
    }
}
