use crate::cache::fingerprint::FingerprintHasher;
use crate::enums::Orientation;
use crate::error::ValidationError;
use crate::sampler::Sampler;

use nalgebra::{Point3, Vector3};
use ndarray::{Array3, ArrayView2, s};
use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Stable identity of a volume's content, used to namespace cached results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldIdentity(String);

impl FieldIdentity {
    pub fn new(identity: impl Into<String>) -> Result<Self, ValidationError> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        Ok(Self(identity))
    }

    /// Identity derived from the voxel values and dimensions. Values are
    /// hashed little-endian in logical `[[z, y, x]]` order, so the identity
    /// does not depend on host byte order or memory layout.
    pub fn from_content(data: &Array3<f32>) -> Self {
        let mut hasher = FingerprintHasher::new();
        let (depth, height, width) = data.dim();
        hasher.write_u64(depth as u64);
        hasher.write_u64(height as u64);
        hasher.write_u64(width as u64);
        data.iter()
            .for_each(|v| hasher.write_bytes(&v.to_le_bytes()));
        Self(format!("content-{}", hasher.finish()))
    }

    /// Identity derived from a source file's path, modification time and size.
    /// The file is not read.
    pub fn from_file_metadata(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = FingerprintHasher::new();
        hasher.write_str(&path.to_string_lossy());
        hasher.write_u64(modified as u64);
        hasher.write_u64(metadata.len());
        Ok(Self(format!("file-{}", hasher.finish())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name for this identity's namespace.
    pub(crate) fn namespace_key(&self) -> String {
        let mut hasher = FingerprintHasher::new();
        hasher.write_str(&self.0);
        hasher.finish().to_string()
    }
}

impl fmt::Display for FieldIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable scalar volume with axis-aligned geometry.
///
/// Voxels are stored `[[z, y, x]]`, voxel centers sit at integer indices and
/// map to world space as `origin + index * spacing`.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    spacing: Vector3<f64>,
    origin: Point3<f64>,
    identity: FieldIdentity,
    background: f32,
}

impl Volume {
    /// # Arguments
    ///
    /// * `data` - Voxels indexed `[[z, y, x]]`
    /// * `spacing` - Voxel spacing `(x, y, z)` in world units
    /// * `identity` - Content identity from the loader
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero or the spacing is not positive
    pub fn new(
        data: Array3<f32>,
        spacing: (f64, f64, f64),
        identity: FieldIdentity,
    ) -> Result<Self, ValidationError> {
        let dim = data.dim();
        if dim.0 == 0 || dim.1 == 0 || dim.2 == 0 {
            return Err(ValidationError::EmptyVolume(dim));
        }
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !(valid(spacing.0) && valid(spacing.1) && valid(spacing.2)) {
            return Err(ValidationError::InvalidSpacing(spacing));
        }
        let background = data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f32::INFINITY, f32::min);
        Ok(Self {
            data,
            spacing: Vector3::new(spacing.0, spacing.1, spacing.2),
            origin: Point3::origin(),
            identity,
            background: if background.is_finite() { background } else { 0.0 },
        })
    }

    /// Build from raw unsigned 16-bit scanner values.
    pub fn from_u16(
        data: &Array3<u16>,
        spacing: (f64, f64, f64),
        identity: FieldIdentity,
    ) -> Result<Self, ValidationError> {
        Self::new(data.mapv(f32::from), spacing, identity)
    }

    /// World position of voxel `(0, 0, 0)`.
    pub fn with_origin(mut self, origin: Point3<f64>) -> Result<Self, ValidationError> {
        if !origin.coords.iter().all(|c| c.is_finite()) {
            return Err(ValidationError::InvalidOrigin);
        }
        self.origin = origin;
        Ok(self)
    }

    /// Value returned for samples outside the field. Defaults to the volume
    /// minimum.
    pub fn with_background(mut self, background: f32) -> Self {
        self.background = background;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> Vector3<f64> {
        self.spacing
    }

    pub fn origin(&self) -> Point3<f64> {
        self.origin
    }

    pub fn identity(&self) -> &FieldIdentity {
        &self.identity
    }

    pub fn background(&self) -> f32 {
        self.background
    }

    /// Voxel counts in `(x, y, z)` order.
    pub(crate) fn extent(&self) -> Vector3<usize> {
        let (depth, height, width) = self.dim();
        Vector3::new(width, height, depth)
    }

    /// Continuous voxel index `(x, y, z)` of a world point.
    #[inline]
    pub fn world_to_voxel(&self, point: &Point3<f64>) -> Vector3<f64> {
        (point - self.origin).component_div(&self.spacing)
    }

    #[inline]
    pub fn voxel_to_world(&self, index: &Vector3<f64>) -> Point3<f64> {
        self.origin + index.component_mul(&self.spacing)
    }

    /// Physical distance between the first and last voxel centers along an
    /// axis.
    pub fn physical_extent(&self, orientation: Orientation) -> f64 {
        let axis = orientation.axis_index();
        (self.extent()[axis] - 1) as f64 * self.spacing[axis]
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    /// Native `(width, height)` of a plane in voxels.
    pub fn native_slice_size(&self, orientation: Orientation) -> (usize, usize) {
        let (depth, height, width) = self.dim();
        match orientation {
            // Looking down Z-axis: X is width, Y is height
            Orientation::Axial => (width, height),
            // Looking down Y-axis: X is width, Z is height
            Orientation::Coronal => (width, depth),
            // Looking down X-axis: Y is width, Z is height
            Orientation::Sagittal => (height, depth),
        }
    }

    /// Aspect-correct `(width, height)` of a plane after resampling to
    /// isotropic spacing.
    pub fn display_size(&self, orientation: Orientation) -> (u32, u32) {
        let (z, y, x) = Sampler::isotropic_dimensions(
            (self.spacing.x, self.spacing.y, self.spacing.z),
            self.dim(),
        );
        match orientation {
            Orientation::Axial => (x, y),
            Orientation::Coronal => (x, z),
            Orientation::Sagittal => (y, z),
        }
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        index < self.extent()[orientation.axis_index()]
    }
}
