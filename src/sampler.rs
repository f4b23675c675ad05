use nalgebra::{Point3, Vector3};
use ndarray::ArrayView2;

use crate::volume::Volume;

/// Points this close outside the voxel-center lattice still count as inside.
const BOUNDS_TOLERANCE: f64 = 1e-9;

/// Pure interpolation kernels over a [`Volume`].
///
/// Voxel centers are the integer indices `(i, j, k)`. A point is inside the
/// field when each continuous index lies in `[0, dim - 1]`; anything else is
/// answered with the volume's background value.
pub struct Sampler;

impl Sampler {
    pub(crate) fn isotropic_dimensions(
        spacing: (f64, f64, f64),
        original_dim: (usize, usize, usize),
    ) -> (u32, u32, u32) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let min_spacing = x_spacing.min(y_spacing).min(z_spacing);
        let inv_min_spacing = 1.0 / min_spacing; // Multiply instead of divide

        // original_dim is (depth, height, width) corresponding to (z, y, x)
        let new_x = (original_dim.2 as f64 * x_spacing * inv_min_spacing) as u32;
        let new_y = (original_dim.1 as f64 * y_spacing * inv_min_spacing) as u32;
        let new_z = (original_dim.0 as f64 * z_spacing * inv_min_spacing) as u32;

        (new_z, new_y, new_x)
    }

    /// Trilinear sample at a world point, or the background value outside.
    #[inline]
    pub fn sample(volume: &Volume, point: &Point3<f64>) -> f32 {
        Self::try_sample(volume, point).unwrap_or(volume.background())
    }

    /// Trilinear sample at a world point, `None` outside the field.
    #[inline]
    pub fn try_sample(volume: &Volume, point: &Point3<f64>) -> Option<f32> {
        let index = volume.world_to_voxel(point);
        Self::sample_voxel(volume, &index)
    }

    /// Trilinear sample at a continuous voxel index `(x, y, z)`.
    pub fn sample_voxel(volume: &Volume, index: &Vector3<f64>) -> Option<f32> {
        let extent = volume.extent();
        let (x0, x1, fx) = Self::cell(index.x, extent.x)?;
        let (y0, y1, fy) = Self::cell(index.y, extent.y)?;
        let (z0, z1, fz) = Self::cell(index.z, extent.z)?;

        let d = volume.data();
        let c00 = lerp(d[[z0, y0, x0]], d[[z0, y0, x1]], fx);
        let c10 = lerp(d[[z0, y1, x0]], d[[z0, y1, x1]], fx);
        let c01 = lerp(d[[z1, y0, x0]], d[[z1, y0, x1]], fx);
        let c11 = lerp(d[[z1, y1, x0]], d[[z1, y1, x1]], fx);

        let c0 = lerp(c00, c10, fy);
        let c1 = lerp(c01, c11, fy);

        Some(lerp(c0, c1, fz))
    }

    /// Central-difference gradient in intensity per world unit. Steps are one
    /// voxel spacing, clamped into the field so faces get one-sided
    /// differences. Zero outside the field.
    pub fn sample_gradient(volume: &Volume, point: &Point3<f64>) -> Vector3<f64> {
        let index = volume.world_to_voxel(point);
        if Self::sample_voxel(volume, &index).is_none() {
            return Vector3::zeros();
        }
        let extent = volume.extent();
        let spacing = volume.spacing();
        let mut gradient = Vector3::zeros();
        for axis in 0..3 {
            let max = (extent[axis] - 1) as f64;
            let lo = (index[axis] - 1.0).clamp(0.0, max);
            let hi = (index[axis] + 1.0).clamp(0.0, max);
            if hi <= lo {
                continue;
            }
            let mut below = index;
            below[axis] = lo;
            let mut above = index;
            above[axis] = hi;
            let (Some(a), Some(b)) = (
                Self::sample_voxel(volume, &below),
                Self::sample_voxel(volume, &above),
            ) else {
                continue;
            };
            gradient[axis] = f64::from(b - a) / ((hi - lo) * spacing[axis]);
        }
        gradient
    }

    /// Lower voxel, upper voxel and weight of the upper one along an axis.
    /// The lower index is clamped to `[0, len - 2]`, so a query on the last
    /// voxel center resolves to weight 1 on that voxel.
    #[inline]
    fn cell(coord: f64, len: usize) -> Option<(usize, usize, f32)> {
        let max = (len - 1) as f64;
        if !(coord >= -BOUNDS_TOLERANCE && coord <= max + BOUNDS_TOLERANCE) {
            return None;
        }
        if len < 2 {
            return Some((0, 0, 0.0));
        }
        let coord = coord.clamp(0.0, max);
        let i0 = (coord.floor() as usize).min(len - 2);
        Some((i0, i0 + 1, (coord - i0 as f64) as f32))
    }

    #[inline]
    pub fn bilinear(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;

        let v0 = lerp(slice[[y0, x0]], slice[[y0, x1]], dx);
        let v1 = lerp(slice[[y1, x0]], slice[[y1, x1]], dx);

        lerp(v0, v1, dy)
    }
}

/// `a * (1 - t) + b * t`, exact at `t == 0` and `t == 1`.
#[inline]
pub(crate) fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a.mul_add(1.0 - t, b * t)
}
