use nalgebra::Vector3;

/// The three medical axes of an axis-aligned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    /// Unit normal of the plane in world space (axial looks down Z).
    pub fn normal(&self) -> Vector3<f64> {
        match self {
            Orientation::Axial => Vector3::z(),
            Orientation::Coronal => Vector3::y(),
            Orientation::Sagittal => Vector3::x(),
        }
    }

    /// Index of the normal axis in `(x, y, z)` order.
    pub(crate) fn axis_index(&self) -> usize {
        match self {
            Orientation::Axial => 2,
            Orientation::Coronal => 1,
            Orientation::Sagittal => 0,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Orientation::Axial => 0,
            Orientation::Coronal => 1,
            Orientation::Sagittal => 2,
        }
    }
}

/// How the parallel offset curves of a panoramic slab are merged into one
/// pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LateralCombine {
    /// Maximum intensity projection across the slab.
    #[default]
    Max,
    /// Arithmetic mean across the slab.
    Mean,
}

impl LateralCombine {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            LateralCombine::Max => 0,
            LateralCombine::Mean => 1,
        }
    }
}

/// Lateral slab integrated by the panoramic mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LateralThickness {
    /// Distance from the curve to the outermost offset curve, world units.
    pub half_width: f64,
    /// Number of offset curves, spread evenly over `[-half_width, half_width]`.
    pub samples: u32,
    pub combine: LateralCombine,
}

impl Default for LateralThickness {
    fn default() -> Self {
        Self {
            half_width: 5.0,
            samples: 9,
            combine: LateralCombine::Max,
        }
    }
}

impl LateralThickness {
    pub fn new(half_width: f64, samples: u32, combine: LateralCombine) -> Self {
        Self {
            half_width,
            samples,
            combine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconstructionMode {
    Axial,
    Coronal,
    Sagittal,
    /// Arc length along the curve by depth along the depth axis.
    Curved,
    /// Curved, integrated over a lateral slab.
    Panoramic(LateralThickness),
    /// Arc length along the curve by lateral offset, at a single depth.
    CurvedPlanar { half_width: f64 },
}

impl ReconstructionMode {
    /// The fixed plane for orthogonal modes, `None` for curve modes.
    pub fn orientation(&self) -> Option<Orientation> {
        match self {
            ReconstructionMode::Axial => Some(Orientation::Axial),
            ReconstructionMode::Coronal => Some(Orientation::Coronal),
            ReconstructionMode::Sagittal => Some(Orientation::Sagittal),
            _ => None,
        }
    }

    pub fn needs_curve(&self) -> bool {
        self.orientation().is_none()
    }

    /// Modes whose depth range must collapse to a single position.
    pub(crate) fn single_depth(&self) -> bool {
        !matches!(
            self,
            ReconstructionMode::Curved | ReconstructionMode::Panoramic(_)
        )
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            ReconstructionMode::Axial => 0,
            ReconstructionMode::Coronal => 1,
            ReconstructionMode::Sagittal => 2,
            ReconstructionMode::Curved => 3,
            ReconstructionMode::Panoramic(_) => 4,
            ReconstructionMode::CurvedPlanar { .. } => 5,
        }
    }
}

impl From<Orientation> for ReconstructionMode {
    fn from(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Axial => ReconstructionMode::Axial,
            Orientation::Coronal => ReconstructionMode::Coronal,
            Orientation::Sagittal => ReconstructionMode::Sagittal,
        }
    }
}
