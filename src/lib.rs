//! # MPR-volume library
//!
//! This crate reconstructs 2D images from a scalar volume along the three
//! medical axes and along user-drawn curves, and keeps the results in a
//! persistent cache.
//!
//! A [`Volume`] holds voxels on a regular grid with per-axis spacing. The
//! [`Sampler`] evaluates it at arbitrary world positions with trilinear
//! interpolation. The following reconstruction modes are supported:
//!  - Axial, Coronal and Sagittal planes
//!  - Curved: the surface swept by a [`Curve`] along a depth axis
//!  - Panoramic: a curved reconstruction integrating a lateral slab
//!  - Curved planar: the band of lateral offsets around a curve
//!
//!  Reconstruction runs in parallel over output columns using rayon and can
//!  be cancelled cooperatively with a [`CancelToken`]. Results are stored by
//!  [`ReconstructionCache`] under a fingerprint of the request, namespaced by
//!  the [`FieldIdentity`] of the volume, so loading another volume never
//!  reuses stale images. A [`Timeline`] turns a curve into a camera
//!  fly-through queried by elapsed time.
//!
//!  Curves are centripetal Catmull-Rom splines through their control points.
//!  The panoramic slab defaults to a maximum intensity projection. Both are
//!  part of every fingerprint.
//!
//! # Roadmap
//!
//!  - GPU processor for reconstruction using WGPU and compute shaders
//!  - Cubic interpolation
//!  - Oblique planes
//!
//! # Examples
//!
//! ## Panoramic reconstruction through the cache
//!
//! Fit a curve through three points in the axial plane, reconstruct a
//! panoramic view 10 units deep and save it as an image.
//!
//! ```no_run
//! # use mpr_volume::*;
//! # use nalgebra::Point3;
//! # use ndarray::Array3;
//! let data = Array3::<f32>::zeros((64, 128, 128));
//! let identity = FieldIdentity::from_content(&data);
//! let volume = Volume::new(data, (0.5, 0.5, 1.0), identity.clone())
//!     .expect("should have built a volume");
//!
//! let curve = Curve::fit([
//!     Point3::new(10.0, 30.0, 20.0),
//!     Point3::new(32.0, 50.0, 20.0),
//!     Point3::new(54.0, 30.0, 20.0),
//! ]);
//! let request = ReconstructionRequest::panoramic(
//!     identity,
//!     &curve,
//!     DepthRange::new(0.0, 10.0),
//!     OutputSize::new(512, 128),
//!     LateralThickness::default(),
//! );
//!
//! let cache = ReconstructionCache::open(CacheConfig::default(), Engine)
//!     .expect("should have opened the cache");
//! let result = cache
//!     .get(&volume, &request, &CancelToken::new())
//!     .expect("should have reconstructed the panoramic view");
//! result
//!     .to_image()
//!     .expect("should have converted to an image")
//!     .save("panoramic.png");
//! ```

pub mod animator;
pub mod cache;
pub mod config;
pub mod curve;
pub mod enums;
pub mod error;
pub mod frame_loader;
pub mod reconstruction;
pub mod sampler;
pub mod volume;

pub use animator::{CameraPose, Playback, PlaybackClock, Timeline};
pub use cache::{CACHE_FORMAT_VERSION, Fingerprint, ReconstructionCache};
pub use config::CacheConfig;
pub use curve::{CURVE_BASIS_TAG, ControlPath, ControlPoint, Curve};
pub use enums::{LateralCombine, LateralThickness, Orientation, ReconstructionMode};
pub use error::{CacheError, CurveError, ReconstructionError, ValidationError};
pub use frame_loader::{FramePrefetcher, ReassemblyBuffer, prefetch_depth_sweep};
pub use reconstruction::{
    CancelToken, DepthRange, Engine, OutputSize, Reconstruct, ReconstructionRequest,
    ReconstructionResult, reconstruct,
};
pub use sampler::Sampler;
pub use volume::{FieldIdentity, Volume};
