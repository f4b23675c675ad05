//! Resampling of a [`Volume`] into 2D images.
//!
//! Orthogonal modes read voxels directly and only blend along the depth axis.
//! Curve modes unroll a surface swept by a [`Curve`]: the image's X axis
//! follows arc length and the Y axis follows depth (curved, panoramic) or the
//! lateral offset from the curve (curved planar).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::{ImageBuffer, Luma};
use nalgebra::{Point3, Vector3};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use tracing::debug;
use web_time::Instant;

use crate::cache::fingerprint::{CACHE_FORMAT_VERSION, Fingerprint, FingerprintHasher};
use crate::curve::{CURVE_BASIS_TAG, Curve};
use crate::enums::{LateralCombine, LateralThickness, Orientation, ReconstructionMode};
use crate::error::{CurveError, ReconstructionError, ValidationError};
use crate::sampler::{Sampler, lerp};
use crate::volume::{FieldIdentity, Volume};

/// Slack allowed when checking depths against the field extent.
const DEPTH_TOLERANCE: f64 = 1e-9;

/// Depth interval in world units. Orthogonal modes take an absolute position
/// along the plane normal; curve modes take an offset from the curve along
/// the depth axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub start: f64,
    pub end: f64,
}

impl DepthRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn at(position: f64) -> Self {
        Self {
            start: position,
            end: position,
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Level `i` of `count` levels spread evenly from start to end.
    fn level(&self, i: usize, count: usize) -> f64 {
        if count < 2 {
            return self.start;
        }
        self.start + (self.end - self.start) * i as f64 / (count - 1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSize {
    pub width: usize,
    pub height: usize,
}

impl OutputSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// Everything that determines a reconstructed image. Immutable once built;
/// the curve is held by value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionRequest {
    field: FieldIdentity,
    curve: Option<Curve>,
    depth: DepthRange,
    output: OutputSize,
    mode: ReconstructionMode,
    depth_axis: Orientation,
}

impl ReconstructionRequest {
    /// Fixed plane at `position`, a world coordinate along the plane normal.
    pub fn orthogonal(
        field: FieldIdentity,
        orientation: Orientation,
        position: f64,
        output: OutputSize,
    ) -> Self {
        Self {
            field,
            curve: None,
            depth: DepthRange::at(position),
            output,
            mode: orientation.into(),
            depth_axis: orientation,
        }
    }

    /// `output.width` samples along the curve by `output.height` depth levels.
    pub fn curved(
        field: FieldIdentity,
        curve: &Curve,
        depth: DepthRange,
        output: OutputSize,
    ) -> Self {
        Self {
            field,
            curve: Some(curve.clone()),
            depth,
            output,
            mode: ReconstructionMode::Curved,
            depth_axis: Orientation::Axial,
        }
    }

    pub fn panoramic(
        field: FieldIdentity,
        curve: &Curve,
        depth: DepthRange,
        output: OutputSize,
        thickness: LateralThickness,
    ) -> Self {
        Self {
            mode: ReconstructionMode::Panoramic(thickness),
            ..Self::curved(field, curve, depth, output)
        }
    }

    /// `output.width` samples along the curve by `output.height` lateral
    /// offsets spanning `[-half_width, half_width]`, at one depth offset.
    pub fn curved_planar(
        field: FieldIdentity,
        curve: &Curve,
        depth_offset: f64,
        half_width: f64,
        output: OutputSize,
    ) -> Self {
        Self {
            mode: ReconstructionMode::CurvedPlanar { half_width },
            ..Self::curved(field, curve, DepthRange::at(depth_offset), output)
        }
    }

    /// Axis the curve modes sweep along. Defaults to the axial normal.
    pub fn with_depth_axis(mut self, axis: Orientation) -> Self {
        if self.mode.needs_curve() {
            self.depth_axis = axis;
        }
        self
    }

    /// Same request at another depth. Single-depth modes move to
    /// `depth.start`.
    pub fn with_depth(mut self, depth: DepthRange) -> Self {
        self.depth = if self.mode.single_depth() {
            DepthRange::at(depth.start)
        } else {
            depth
        };
        self
    }

    pub fn field(&self) -> &FieldIdentity {
        &self.field
    }

    pub fn curve(&self) -> Option<&Curve> {
        self.curve.as_ref()
    }

    pub fn depth(&self) -> DepthRange {
        self.depth
    }

    pub fn output(&self) -> OutputSize {
        self.output
    }

    pub fn mode(&self) -> ReconstructionMode {
        self.mode
    }

    pub fn depth_axis(&self) -> Orientation {
        self.depth_axis
    }

    /// Check the request against the volume it will be run on.
    pub fn validate(&self, volume: &Volume) -> Result<(), ValidationError> {
        if &self.field != volume.identity() {
            return Err(ValidationError::FieldMismatch {
                requested: self.field.clone(),
                actual: volume.identity().clone(),
            });
        }
        let OutputSize { width, height } = self.output;
        if width == 0 || height == 0 {
            return Err(ValidationError::EmptyOutput { width, height });
        }

        let DepthRange { start, end } = self.depth;
        if self.mode.single_depth() && !self.depth.is_single() {
            return Err(ValidationError::DepthNotSingle { start, end });
        }
        let extent = volume.physical_extent(self.depth_axis);
        let out_of_range = |limit: f64| ValidationError::DepthOutOfRange { start, end, limit };
        if !(start.is_finite() && end.is_finite()) || start > end {
            return Err(out_of_range(extent));
        }

        match self.mode.orientation() {
            Some(orientation) => {
                let axis = orientation.axis_index();
                let index = (start - volume.origin()[axis]) / volume.spacing()[axis];
                let max = (volume.extent()[axis] - 1) as f64;
                if index < -DEPTH_TOLERANCE || index > max + DEPTH_TOLERANCE {
                    return Err(out_of_range(extent));
                }
            }
            None => {
                let curve = self
                    .curve
                    .as_ref()
                    .ok_or(CurveError::Undefined { distinct: 0 })?;
                curve.length()?;
                if start.abs().max(end.abs()) > extent + DEPTH_TOLERANCE {
                    return Err(out_of_range(extent));
                }
            }
        }

        match self.mode {
            ReconstructionMode::Panoramic(thickness) => {
                if thickness.samples == 0 {
                    return Err(ValidationError::InvalidThickness {
                        reason: "at least one lateral sample is required".into(),
                    });
                }
                validate_half_width(thickness.half_width)
            }
            ReconstructionMode::CurvedPlanar { half_width } => validate_half_width(half_width),
            _ => Ok(()),
        }
    }

    /// Deterministic cache key over every field, the curve basis and the
    /// cache format version.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FingerprintHasher::new();
        hasher.write_u32(CACHE_FORMAT_VERSION);
        hasher.write_str(CURVE_BASIS_TAG);
        hasher.write_str(self.field.as_str());
        hasher.write_u8(self.mode.tag());
        match self.mode {
            ReconstructionMode::Panoramic(thickness) => {
                hasher.write_f64(thickness.half_width);
                hasher.write_u32(thickness.samples);
                hasher.write_u8(thickness.combine.tag());
            }
            ReconstructionMode::CurvedPlanar { half_width } => hasher.write_f64(half_width),
            _ => {}
        }
        hasher.write_u8(self.depth_axis.tag());
        hasher.write_f64(self.depth.start);
        hasher.write_f64(self.depth.end);
        hasher.write_u64(self.output.width as u64);
        hasher.write_u64(self.output.height as u64);
        let knots = self.curve.as_ref().map(Curve::knots).unwrap_or_default();
        hasher.write_u64(knots.len() as u64);
        for knot in knots {
            hasher.write_f64(knot.x);
            hasher.write_f64(knot.y);
            hasher.write_f64(knot.z);
        }
        hasher.finish()
    }
}

fn validate_half_width(half_width: f64) -> Result<(), ValidationError> {
    if half_width.is_finite() && half_width >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidThickness {
            reason: format!("half width must be finite and non-negative, got {half_width}"),
        })
    }
}

/// Resampled intensities plus the request that produced them. The grid is
/// `(width, height)` and indexed `[[x, y]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionResult {
    request: ReconstructionRequest,
    pixels: Array2<f32>,
}

impl ReconstructionResult {
    pub(crate) fn new(request: ReconstructionRequest, pixels: Array2<f32>) -> Self {
        Self { request, pixels }
    }

    pub fn request(&self) -> &ReconstructionRequest {
        &self.request
    }

    pub fn pixels(&self) -> &Array2<f32> {
        &self.pixels
    }

    /// `(width, height)`
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    /// Bytes of pixel data, as counted against the cache budget.
    pub fn byte_size(&self) -> u64 {
        (self.pixels.len() * std::mem::size_of::<f32>()) as u64
    }

    #[inline]
    fn normalize_to_u8(value: f32, min: f32, range: f32) -> u8 {
        if range <= 0.0 || !value.is_finite() {
            return 0;
        }
        (((value - min) / range) * 255.0).clamp(0.0, 255.0) as u8
    }

    fn intensity_bounds(&self) -> (f32, f32) {
        let (min, max) = self
            .pixels
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min.is_finite() { (min, max - min) } else { (0.0, 0.0) }
    }

    /// 8-bit grayscale image, min-max normalized. A flat result is black.
    pub fn to_image(&self) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (width, height) = self.dim();
        let (min, range) = self.intensity_bounds();
        // Row-major (y, x) for the image buffer.
        let rows = self.pixels.t().as_standard_layout().into_owned();
        let pixel_data: Vec<u8> = rows
            .as_slice()?
            .par_iter()
            .map(|&v| Self::normalize_to_u8(v, min, range))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Like [`Self::to_image`], bilinearly resized to `width` x `height`,
    /// e.g. to [`Volume::display_size`] for an aspect-correct orthogonal view.
    pub fn to_display_image(
        &self,
        width: u32,
        height: u32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        if width == 0 || height == 0 {
            return None;
        }
        let (min, range) = self.intensity_bounds();
        let slice: ArrayView2<'_, f32> = self.pixels.t();
        let (slice_height, slice_width) = slice.dim();

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                let slice = &slice;
                (0..width).map(move |x| {
                    // Normalized coordinates with half-pixel offset
                    let norm_x = (x as f32 + 0.5) / width as f32;
                    let norm_y = (y as f32 + 0.5) / height as f32;

                    // Convert back to source coordinates
                    let src_x = norm_x * slice_width as f32 - 0.5;
                    let src_y = norm_y * slice_height as f32 - 0.5;

                    // Clamp to valid range
                    let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
                    let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

                    let value = Sampler::bilinear(slice, src_y, src_x);
                    Self::normalize_to_u8(value, min, range)
                })
            })
            .collect();

        ImageBuffer::from_raw(width, height, pixel_data)
    }
}

/// Cooperative cancellation flag shared between a caller and a running
/// reconstruction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Seam between the cache and the resampling code.
pub trait Reconstruct: Send + Sync {
    fn reconstruct(
        &self,
        volume: &Volume,
        request: &ReconstructionRequest,
        cancel: &CancelToken,
    ) -> Result<ReconstructionResult, ReconstructionError>;
}

/// CPU reconstruction, parallel over output columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Engine;

impl Reconstruct for Engine {
    fn reconstruct(
        &self,
        volume: &Volume,
        request: &ReconstructionRequest,
        cancel: &CancelToken,
    ) -> Result<ReconstructionResult, ReconstructionError> {
        request.validate(volume)?;
        let started = Instant::now();

        let pixels = match request.mode.orientation() {
            Some(orientation) => Self::orthogonal(volume, request, orientation, cancel)?,
            None => Self::along_curve(volume, request, cancel)?,
        };

        debug!(
            mode = ?request.mode,
            width = request.output.width,
            height = request.output.height,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Reconstructed"
        );
        Ok(ReconstructionResult::new(request.clone(), pixels))
    }
}

/// Reconstruct without cancellation.
pub fn reconstruct(
    volume: &Volume,
    request: &ReconstructionRequest,
) -> Result<ReconstructionResult, ReconstructionError> {
    Engine.reconstruct(volume, request, &CancelToken::new())
}

impl Engine {
    /// Fill a `(width, height)` grid column by column in parallel, checking
    /// for cancellation before each column.
    fn fill<F>(
        output: OutputSize,
        cancel: &CancelToken,
        pixel: F,
    ) -> Result<Array2<f32>, ReconstructionError>
    where
        F: Fn(usize, usize) -> f32 + Sync,
    {
        let OutputSize { width, height } = output;
        let columns: Vec<Vec<f32>> = (0..width)
            .into_par_iter()
            .map(|x| {
                if cancel.is_cancelled() {
                    return Err(ReconstructionError::Cancelled);
                }
                Ok((0..height).map(|y| pixel(x, y)).collect())
            })
            .collect::<Result<_, _>>()?;

        let mut pixels = Array2::<f32>::zeros((width, height));
        for (mut row, column) in pixels.outer_iter_mut().zip(columns) {
            row.iter_mut().zip(column).for_each(|(dst, v)| *dst = v);
        }
        Ok(pixels)
    }

    fn orthogonal(
        volume: &Volume,
        request: &ReconstructionRequest,
        orientation: Orientation,
        cancel: &CancelToken,
    ) -> Result<Array2<f32>, ReconstructionError> {
        let axis = orientation.axis_index();
        let count = volume.extent()[axis];
        let index = ((request.depth.start - volume.origin()[axis]) / volume.spacing()[axis])
            .clamp(0.0, (count - 1) as f64);
        let (lower, upper, weight) = if count < 2 {
            (0, 0, 0.0)
        } else {
            let lower = (index.floor() as usize).min(count - 2);
            (lower, lower + 1, (index - lower as f64) as f32)
        };

        let below = volume
            .get_slice_from_axis(lower, &orientation)
            .ok_or(ValidationError::DepthOutOfRange {
                start: request.depth.start,
                end: request.depth.end,
                limit: volume.physical_extent(orientation),
            })?;
        let above = volume.get_slice_from_axis(upper, &orientation).unwrap_or(below);
        let (native_width, native_height) = volume.native_slice_size(orientation);
        let OutputSize { width, height } = request.output;

        // Slices come out as [[row, column]] with the plane's height axis first.
        Self::fill(request.output, cancel, |x, y| {
            let src_x = x * native_width / width;
            let src_y = y * native_height / height;
            let a = below[[src_y, src_x]];
            if weight == 0.0 {
                a
            } else {
                lerp(a, above[[src_y, src_x]], weight)
            }
        })
    }

    fn along_curve(
        volume: &Volume,
        request: &ReconstructionRequest,
        cancel: &CancelToken,
    ) -> Result<Array2<f32>, ReconstructionError> {
        let curve = request
            .curve
            .as_ref()
            .ok_or(CurveError::Undefined { distinct: 0 })?;
        let OutputSize { width, height } = request.output;
        let frames = curve.resample_frames(width)?;
        let axis = request.depth_axis.normal();
        let depth = request.depth;

        match request.mode {
            ReconstructionMode::Panoramic(thickness) => {
                let offsets = lateral_offsets(thickness.half_width, thickness.samples as usize);
                Self::fill(request.output, cancel, |x, y| {
                    let (point, tangent) = &frames[x];
                    let normal = lateral_normal(&axis, tangent);
                    let center = point + axis * depth.level(y, height);
                    combine(
                        thickness.combine,
                        offsets
                            .iter()
                            .map(|&offset| Sampler::sample(volume, &(center + normal * offset))),
                    )
                })
            }
            ReconstructionMode::CurvedPlanar { half_width } => {
                let offsets = lateral_offsets(half_width, height);
                Self::fill(request.output, cancel, |x, y| {
                    let (point, tangent) = &frames[x];
                    let normal = lateral_normal(&axis, tangent);
                    let sample_point: Point3<f64> = point + axis * depth.start + normal * offsets[y];
                    Sampler::sample(volume, &sample_point)
                })
            }
            _ => Self::fill(request.output, cancel, |x, y| {
                let (point, _) = &frames[x];
                Sampler::sample(volume, &(point + axis * depth.level(y, height)))
            }),
        }
    }
}

/// `count` offsets spread evenly over `[-half_width, half_width]`; a single
/// offset sits on the curve.
fn lateral_offsets(half_width: f64, count: usize) -> Vec<f64> {
    if count < 2 {
        return vec![0.0; count];
    }
    (0..count)
        .map(|i| -half_width + 2.0 * half_width * i as f64 / (count - 1) as f64)
        .collect()
}

/// In-plane unit normal to the curve, perpendicular to the depth axis.
fn lateral_normal(axis: &Vector3<f64>, tangent: &Vector3<f64>) -> Vector3<f64> {
    let normal = axis.cross(tangent);
    let norm = normal.norm();
    if norm > 1e-9 {
        normal / norm
    } else {
        // Curve runs along the depth axis here; any perpendicular will do.
        let fallback = if axis.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        axis.cross(&fallback).normalize()
    }
}

fn combine(rule: LateralCombine, values: impl Iterator<Item = f32>) -> f32 {
    match rule {
        LateralCombine::Max => values.fold(f32::NEG_INFINITY, f32::max),
        LateralCombine::Mean => {
            let (sum, count) = values.fold((0.0f64, 0usize), |(sum, count), v| {
                (sum + f64::from(v), count + 1)
            });
            if count == 0 { 0.0 } else { (sum / count as f64) as f32 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn ramp_volume() -> Volume {
        // f(x, y, z) = x + 10y + 100z on a 10^3 grid
        let data = Array3::from_shape_fn((10, 10, 10), |(z, y, x)| {
            x as f32 + 10.0 * y as f32 + 100.0 * z as f32
        });
        Volume::new(data, (1.0, 1.0, 1.0), FieldIdentity::new("ramp").unwrap()).unwrap()
    }

    fn line_curve() -> Curve {
        Curve::fit([Point3::new(1.0, 2.0, 0.0), Point3::new(8.0, 2.0, 0.0)])
    }

    fn field() -> FieldIdentity {
        FieldIdentity::new("ramp").unwrap()
    }

    #[test]
    fn test_axial_is_direct_read() {
        let volume = ramp_volume();
        let request =
            ReconstructionRequest::orthogonal(field(), Orientation::Axial, 3.0, OutputSize::new(10, 10));
        let result = reconstruct(&volume, &request).unwrap();
        assert_eq!(result.dim(), (10, 10));
        assert_eq!(result.pixels()[[4, 7]], volume.data()[[3, 7, 4]]);
    }

    #[test]
    fn test_orthogonal_blends_sub_voxel_depth() {
        let volume = ramp_volume();
        let request = ReconstructionRequest::orthogonal(
            field(),
            Orientation::Coronal,
            2.25,
            OutputSize::new(10, 10),
        );
        let result = reconstruct(&volume, &request).unwrap();
        // Coronal: x along width, z along height, blended between y = 2 and 3.
        assert_relative_eq!(result.pixels()[[5, 4]], 5.0 + 22.5 + 400.0, epsilon = 1e-3);
    }

    #[test]
    fn test_orthogonal_maps_to_smaller_output() {
        let volume = ramp_volume();
        let request = ReconstructionRequest::orthogonal(
            field(),
            Orientation::Sagittal,
            9.0,
            OutputSize::new(5, 2),
        );
        let result = reconstruct(&volume, &request).unwrap();
        assert_eq!(result.dim(), (5, 2));
        // Sagittal: y along width, z along height.
        assert_eq!(result.pixels()[[3, 1]], volume.data()[[5, 6, 9]]);
    }

    #[test]
    fn test_orthogonal_rejects_out_of_range_depth() {
        let volume = ramp_volume();
        let request =
            ReconstructionRequest::orthogonal(field(), Orientation::Axial, 9.5, OutputSize::new(4, 4));
        assert!(matches!(
            reconstruct(&volume, &request),
            Err(ReconstructionError::Validation(ValidationError::DepthOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_curved_columns_follow_curve() {
        let volume = ramp_volume();
        let curve = line_curve();
        let request = ReconstructionRequest::curved(
            field(),
            &curve,
            DepthRange::new(0.0, 4.0),
            OutputSize::new(8, 5),
        );
        let result = reconstruct(&volume, &request).unwrap();
        assert_eq!(result.dim(), (8, 5));
        for (x, point) in curve.resample(8).unwrap().iter().enumerate() {
            for y in 0..5 {
                let expected = Sampler::sample(&volume, &(point + Vector3::z() * y as f64));
                assert_eq!(result.pixels()[[x, y]], expected);
            }
        }
    }

    #[test]
    fn test_depth_axis_override() {
        let volume = ramp_volume();
        let curve = Curve::fit([Point3::new(1.0, 0.0, 2.0), Point3::new(8.0, 0.0, 2.0)]);
        let request = ReconstructionRequest::curved(
            field(),
            &curve,
            DepthRange::new(0.0, 3.0),
            OutputSize::new(2, 4),
        )
        .with_depth_axis(Orientation::Coronal);
        let result = reconstruct(&volume, &request).unwrap();
        assert_relative_eq!(result.pixels()[[0, 3]], 1.0 + 30.0 + 200.0, epsilon = 1e-3);
    }

    #[test]
    fn test_panoramic_max_and_mean() {
        let volume = ramp_volume();
        let curve = line_curve();
        let depth = DepthRange::new(0.0, 2.0);
        let output = OutputSize::new(4, 3);
        let max = reconstruct(
            &volume,
            &ReconstructionRequest::panoramic(
                field(),
                &curve,
                depth,
                output,
                LateralThickness::new(1.0, 3, LateralCombine::Max),
            ),
        )
        .unwrap();
        let mean = reconstruct(
            &volume,
            &ReconstructionRequest::panoramic(
                field(),
                &curve,
                depth,
                output,
                LateralThickness::new(1.0, 3, LateralCombine::Mean),
            ),
        )
        .unwrap();
        // Curve runs along +x at y = 2; the lateral normal is +/-y.
        assert_relative_eq!(max.pixels()[[0, 0]], 1.0 + 30.0, epsilon = 1e-3);
        assert_relative_eq!(mean.pixels()[[0, 0]], 1.0 + 20.0, epsilon = 1e-3);
    }

    #[test]
    fn test_single_lateral_sample_equals_curved() {
        let volume = ramp_volume();
        let curve = line_curve();
        let depth = DepthRange::new(0.0, 3.0);
        let output = OutputSize::new(6, 4);
        let curved = reconstruct(
            &volume,
            &ReconstructionRequest::curved(field(), &curve, depth, output),
        )
        .unwrap();
        let slab = reconstruct(
            &volume,
            &ReconstructionRequest::panoramic(
                field(),
                &curve,
                depth,
                output,
                LateralThickness::new(4.0, 1, LateralCombine::Max),
            ),
        )
        .unwrap();
        assert_eq!(curved.pixels(), slab.pixels());
    }

    #[test]
    fn test_curved_planar_spans_lateral_offsets() {
        let volume = ramp_volume();
        let curve = line_curve();
        let request =
            ReconstructionRequest::curved_planar(field(), &curve, 1.0, 2.0, OutputSize::new(3, 5));
        let result = reconstruct(&volume, &request).unwrap();
        // Plane z = 1; the lateral normal is +y, so y runs 0..=4 around y = 2.
        let expected = [101.0, 111.0, 121.0, 131.0, 141.0];
        for (y, value) in expected.into_iter().enumerate() {
            assert_relative_eq!(result.pixels()[[0, y]], value, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_validation_fails_fast() {
        let volume = ramp_volume();
        let curve = line_curve();
        let undefined = Curve::fit([Point3::origin()]);
        let depth = DepthRange::new(0.0, 2.0);

        let cases = [
            ReconstructionRequest::curved(field(), &undefined, depth, OutputSize::new(4, 4)),
            ReconstructionRequest::curved(field(), &curve, depth, OutputSize::new(0, 4)),
            ReconstructionRequest::curved(field(), &curve, DepthRange::new(0.0, 50.0), OutputSize::new(4, 4)),
            ReconstructionRequest::curved(field(), &curve, DepthRange::new(2.0, 0.0), OutputSize::new(4, 4)),
            ReconstructionRequest::curved(
                FieldIdentity::new("other").unwrap(),
                &curve,
                depth,
                OutputSize::new(4, 4),
            ),
            ReconstructionRequest::panoramic(
                field(),
                &curve,
                depth,
                OutputSize::new(4, 4),
                LateralThickness::new(1.0, 0, LateralCombine::Max),
            ),
            ReconstructionRequest::curved_planar(field(), &curve, 0.0, f64::NAN, OutputSize::new(4, 4)),
        ];
        for request in cases {
            let err = reconstruct(&volume, &request).unwrap_err();
            assert!(!err.is_cancelled(), "{err}");
        }

        let err = reconstruct(
            &volume,
            &ReconstructionRequest::curved(field(), &undefined, depth, OutputSize::new(4, 4)),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReconstructionError::Validation(ValidationError::Curve(CurveError::Undefined {
                distinct: 1
            }))
        );
    }

    #[test]
    fn test_non_finite_curve_is_rejected() {
        let volume = ramp_volume();
        let overflow = Curve::fit([Point3::new(-1e308, 2.0, 0.0), Point3::new(1e308, 2.0, 0.0)]);
        let err = reconstruct(
            &volume,
            &ReconstructionRequest::curved(field(), &overflow, DepthRange::new(0.0, 2.0), OutputSize::new(4, 4)),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReconstructionError::Validation(ValidationError::Curve(CurveError::NonFiniteLength))
        );
    }

    #[test]
    fn test_cancelled_returns_no_image() {
        let volume = ramp_volume();
        let request = ReconstructionRequest::curved(
            field(),
            &line_curve(),
            DepthRange::new(0.0, 2.0),
            OutputSize::new(16, 16),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Engine.reconstruct(&volume, &request, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_fingerprint_tracks_every_field() {
        let curve = line_curve();
        let base = ReconstructionRequest::curved(
            field(),
            &curve,
            DepthRange::new(0.0, 2.0),
            OutputSize::new(4, 4),
        );
        let same = ReconstructionRequest::curved(
            field(),
            &line_curve(),
            DepthRange::new(-0.0, 2.0),
            OutputSize::new(4, 4),
        );
        assert_eq!(base.fingerprint(), same.fingerprint());

        let variants = [
            base.clone().with_depth_axis(Orientation::Coronal),
            ReconstructionRequest::curved(field(), &curve, DepthRange::new(0.0, 3.0), OutputSize::new(4, 4)),
            ReconstructionRequest::curved(field(), &curve, DepthRange::new(0.0, 2.0), OutputSize::new(4, 5)),
            ReconstructionRequest::panoramic(
                field(),
                &curve,
                DepthRange::new(0.0, 2.0),
                OutputSize::new(4, 4),
                LateralThickness::default(),
            ),
            ReconstructionRequest::curved(
                FieldIdentity::new("other").unwrap(),
                &curve,
                DepthRange::new(0.0, 2.0),
                OutputSize::new(4, 4),
            ),
        ];
        for variant in variants {
            assert_ne!(variant.fingerprint(), base.fingerprint());
        }
    }

    #[test]
    fn test_images() {
        let volume = ramp_volume();
        let request =
            ReconstructionRequest::orthogonal(field(), Orientation::Axial, 0.0, OutputSize::new(10, 10));
        let result = reconstruct(&volume, &request).unwrap();
        let image = result.to_image().unwrap();
        assert_eq!(image.dimensions(), (10, 10));
        assert_eq!(image.get_pixel(0, 0).0, [0]);
        assert_eq!(image.get_pixel(9, 9).0, [255]);
        // x grows along the image row, y down the column
        assert!(image.get_pixel(9, 0).0[0] < image.get_pixel(0, 9).0[0]);

        let resized = result.to_display_image(20, 5).unwrap();
        assert_eq!(resized.dimensions(), (20, 5));
        assert!(result.to_display_image(0, 5).is_none());
    }
}
