use std::path::PathBuf;

use thiserror::Error;

use crate::volume::FieldIdentity;

/// Queries against a curve that could not be fitted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CurveError {
    /// Fewer than two distinct finite control points.
    #[error("curve undefined: need at least 2 distinct finite control points, got {distinct}")]
    Undefined { distinct: usize },

    #[error("curve undefined: control points span a non-finite length")]
    NonFiniteLength,
}

/// Invalid input, always rejected before any computation starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("volume dimensions must be non-zero, got {0:?}")]
    EmptyVolume((usize, usize, usize)),

    #[error("voxel spacing must be finite and positive, got {0:?}")]
    InvalidSpacing((f64, f64, f64)),

    #[error("volume origin must be finite")]
    InvalidOrigin,

    #[error("field identity must not be empty")]
    EmptyIdentity,

    #[error("request targets field {requested} but volume is {actual}")]
    FieldMismatch {
        requested: FieldIdentity,
        actual: FieldIdentity,
    },

    #[error("output grid {width}x{height} has zero area")]
    EmptyOutput { width: usize, height: usize },

    #[error("depth range [{start}, {end}] is outside the field (limit {limit})")]
    DepthOutOfRange { start: f64, end: f64, limit: f64 },

    #[error("mode takes a single depth position, got range [{start}, {end}]")]
    DepthNotSingle { start: f64, end: f64 },

    #[error("invalid lateral thickness: {reason}")]
    InvalidThickness { reason: String },

    #[error("playback speed must be finite and positive, got {0}")]
    InvalidSpeed(f64),

    #[error(transparent)]
    Curve(#[from] CurveError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconstructionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The caller abandoned the request. A normal outcome, not a failure.
    #[error("reconstruction cancelled")]
    Cancelled,
}

impl ReconstructionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconstructionError::Cancelled)
    }
}

impl From<CurveError> for ReconstructionError {
    fn from(err: CurveError) -> Self {
        ReconstructionError::Validation(err.into())
    }
}

/// Failures inside the persistent store. Apart from opening the cache these
/// never reach callers: they are logged and treated as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("cache format version {found} does not match {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("index error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CacheError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
