//! Per-tile denoise working state.

use crate::backend::DevicePtr;

/// Buffer layout and rectangle parameters shared by every denoise stage.
///
/// `rect` is the padded region the filter reads (xmin, ymin, xmax, ymax) and
/// `filter_area` the inner rectangle it writes (x, y, w, h). `pass_stride`
/// is the float count of one image plane inside the temporary buffers;
/// `frame_stride` offsets between contributing frames in multi-frame input.
#[derive(Debug, Clone)]
pub struct DenoiseTask {
    pub rect: [i32; 4],
    pub filter_area: [i32; 4],
    pub stride: i32,
    pub pass_stride: i32,
    pub frame_stride: i32,
    /// Contributing frame indices, 0 is the current frame.
    pub frames: Vec<i32>,
    pub sample: i32,
    pub buffer_pass_stride: i32,
    pub buffer_denoising_offset: i32,
}

impl DenoiseTask {
    pub fn width(&self) -> i32 {
        self.rect[2] - self.rect[0]
    }

    pub fn height(&self) -> i32 {
        self.rect[3] - self.rect[1]
    }

    /// Floats per plane in the temporary buffers.
    pub fn plane(&self) -> i32 {
        self.stride * self.height()
    }
}

/// Search radius and falloff parameters of one non-local-means pass.
#[derive(Debug, Clone, Copy)]
pub struct NlmParams {
    /// Pixel search radius; the shift set is the (2r+1)^2 window.
    pub r: i32,
    /// Patch radius for the blur passes.
    pub f: i32,
    /// Difference normalization.
    pub a: f32,
    /// Noise scale.
    pub k_2: f32,
}

impl NlmParams {
    pub fn num_shifts(&self) -> i32 {
        let span = 2 * self.r + 1;
        span * span
    }
}

/// Layout of the shared temporary arena: three equally sized sections,
/// difference, blurred difference, weight accumulator.
#[derive(Debug, Clone, Copy)]
pub struct NlmTempLayout {
    pub section_bytes: u64,
}

impl NlmTempLayout {
    pub fn new(task: &DenoiseTask, params: &NlmParams) -> Self {
        let floats = task.plane() as u64 * params.num_shifts() as u64;
        Self {
            section_bytes: floats * std::mem::size_of::<f32>() as u64,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        3 * self.section_bytes
    }

    pub fn difference(&self, base: DevicePtr) -> DevicePtr {
        base
    }

    pub fn blur_difference(&self, base: DevicePtr) -> DevicePtr {
        base.offset(self.section_bytes)
    }

    pub fn weight_accum(&self, base: DevicePtr) -> DevicePtr {
        base.offset(2 * self.section_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DenoiseTask {
        DenoiseTask {
            rect: [0, 0, 8, 6],
            filter_area: [0, 0, 8, 6],
            stride: 8,
            pass_stride: 48,
            frame_stride: 0,
            frames: vec![0],
            sample: 16,
            buffer_pass_stride: 0,
            buffer_denoising_offset: 0,
        }
    }

    #[test]
    fn zero_radius_has_one_shift() {
        let params = NlmParams {
            r: 0,
            f: 0,
            a: 1.0,
            k_2: 1.0,
        };
        assert_eq!(params.num_shifts(), 1);
    }

    #[test]
    fn temp_sections_do_not_overlap() {
        let params = NlmParams {
            r: 2,
            f: 1,
            a: 1.0,
            k_2: 1.0,
        };
        let layout = NlmTempLayout::new(&task(), &params);
        // 25 shifts over a 48-float plane.
        assert_eq!(layout.section_bytes, 25 * 48 * 4);
        let base = DevicePtr(0x1000);
        assert_eq!(
            layout.blur_difference(base).0 - layout.difference(base).0,
            layout.section_bytes
        );
        assert_eq!(layout.total_bytes(), 3 * layout.section_bytes);
    }
}
