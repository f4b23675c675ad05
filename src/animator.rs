//! Camera fly-through along a [`Curve`].
//!
//! Poses are queried by elapsed time rather than frame count, so playback
//! speed does not depend on how fast frames are rendered.

use std::time::Duration;

use nalgebra::{Point3, Vector3};
use tracing::debug;
use web_time::Instant;

use crate::curve::Curve;
use crate::error::ValidationError;

/// Beyond this |cos| between forward and world-up the pair is treated as
/// parallel.
const UP_PARALLEL_COS: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Point3<f64>,
    /// Unit look direction.
    pub forward: Vector3<f64>,
    /// Unit, orthogonal to `forward`.
    pub up: Vector3<f64>,
    /// Arc-length position on the curve.
    pub distance: f64,
}

impl CameraPose {
    /// Point `distance` ahead of the camera, e.g. a look-at target.
    pub fn focal_point(&self, distance: f64) -> Point3<f64> {
        self.position + self.forward * distance
    }

    pub fn right(&self) -> Vector3<f64> {
        self.forward.cross(&self.up)
    }
}

/// Unit component of `v` orthogonal to `forward`, if there is one.
fn orthonormalize(v: &Vector3<f64>, forward: &Vector3<f64>) -> Option<Vector3<f64>> {
    let u = v - forward * v.dot(forward);
    let norm = u.norm();
    (norm > 1e-9).then(|| u / norm)
}

fn any_perpendicular(forward: &Vector3<f64>) -> Vector3<f64> {
    let axis = if forward.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    forward.cross(&axis).normalize()
}

fn up_vector(
    forward: &Vector3<f64>,
    world_up: &Vector3<f64>,
    previous: Option<&Vector3<f64>>,
) -> Vector3<f64> {
    if forward.dot(world_up).abs() <= UP_PARALLEL_COS {
        if let Some(up) = orthonormalize(world_up, forward) {
            return up;
        }
    }
    previous
        .and_then(|prev| orthonormalize(prev, forward))
        .unwrap_or_else(|| any_perpendicular(forward))
}

/// Speed and wrap policy over a snapshot of a curve.
#[derive(Debug, Clone)]
pub struct Timeline {
    curve: Curve,
    length: f64,
    speed: f64,
    looping: bool,
    smoothing: f64,
    world_up: Vector3<f64>,
}

impl Timeline {
    /// # Arguments
    ///
    /// * `curve` - Path to follow, captured by value
    /// * `speed` - World units per second
    /// * `looping` - Wrap around at the end instead of finishing
    ///
    /// # Errors
    ///
    /// Returns error if the speed is not finite and positive, one pass would
    /// take longer than a [`Duration`] can hold, or the curve is undefined
    pub fn build(curve: &Curve, speed: f64, looping: bool) -> Result<Self, ValidationError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(ValidationError::InvalidSpeed(speed));
        }
        let length = curve.length()?;
        if Duration::try_from_secs_f64(length / speed).is_err() {
            return Err(ValidationError::InvalidSpeed(speed));
        }
        Ok(Self {
            curve: curve.clone(),
            length,
            speed,
            looping,
            smoothing: 0.0,
            world_up: Vector3::z(),
        })
    }

    /// Average the look direction over `window` world units centred on the
    /// camera. Zero disables smoothing.
    pub fn with_smoothing(mut self, window: f64) -> Self {
        self.smoothing = if window.is_finite() { window.max(0.0) } else { 0.0 };
        self
    }

    /// Preferred up direction. A zero vector is ignored.
    pub fn with_world_up(mut self, up: Vector3<f64>) -> Self {
        if let Some(up) = up.try_normalize(1e-12) {
            self.world_up = up;
        }
        self
    }

    pub fn curve(&self) -> &Curve {
        &self.curve
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Time for one pass over the curve.
    pub fn duration(&self) -> Duration {
        // build() checked that one pass fits.
        Duration::try_from_secs_f64(self.length / self.speed).unwrap_or(Duration::MAX)
    }

    /// Arc-length position after `elapsed`, or `None` once a non-looping
    /// timeline has run past the end.
    pub fn distance_at(&self, elapsed: Duration) -> Option<f64> {
        let distance = self.speed * elapsed.as_secs_f64();
        if self.looping {
            Some(distance.rem_euclid(self.length))
        } else if distance <= self.length {
            Some(distance)
        } else {
            None
        }
    }

    /// Pose after `elapsed` without any frame history. Use [`Self::playback`]
    /// for sequential frames so the up vector stays continuous.
    pub fn pose_at(&self, elapsed: Duration) -> Option<CameraPose> {
        let distance = self.distance_at(elapsed)?;
        Some(self.frame(distance, None))
    }

    pub fn playback(&self) -> Playback {
        Playback {
            timeline: self.clone(),
            previous_up: None,
            finished: false,
        }
    }

    fn wrap(&self, distance: f64) -> f64 {
        if self.looping {
            distance.rem_euclid(self.length)
        } else {
            distance.clamp(0.0, self.length)
        }
    }

    fn tangent(&self, distance: f64) -> Vector3<f64> {
        // The curve is defined; build() checked it.
        self.curve
            .tangent_at_distance(distance)
            .unwrap_or_else(|_| Vector3::x())
    }

    fn forward_at(&self, distance: f64) -> Vector3<f64> {
        let tangent = self.tangent(distance);
        if self.smoothing <= 0.0 {
            return tangent;
        }
        let half = self.smoothing / 2.0;
        let sum = self.tangent(self.wrap(distance - half))
            + tangent
            + self.tangent(self.wrap(distance + half));
        sum.try_normalize(1e-9).unwrap_or(tangent)
    }

    fn frame(&self, distance: f64, previous_up: Option<&Vector3<f64>>) -> CameraPose {
        let position = self
            .curve
            .point_at_distance(distance)
            .unwrap_or_else(|_| Point3::origin());
        let forward = self.forward_at(distance);
        CameraPose {
            position,
            forward,
            up: up_vector(&forward, &self.world_up, previous_up),
            distance,
        }
    }
}

/// Restartable cursor over a [`Timeline`] that carries the previous up
/// vector between frames.
#[derive(Debug, Clone)]
pub struct Playback {
    timeline: Timeline,
    previous_up: Option<Vector3<f64>>,
    finished: bool,
}

impl Playback {
    /// Pose after `elapsed`, or `None` once playback has finished.
    pub fn pose_at(&mut self, elapsed: Duration) -> Option<CameraPose> {
        if self.finished {
            return None;
        }
        let Some(distance) = self.timeline.distance_at(elapsed) else {
            self.finished = true;
            debug!(length = self.timeline.length, "Playback finished");
            return None;
        };
        let pose = self.timeline.frame(distance, self.previous_up.as_ref());
        self.previous_up = Some(pose.up);
        Some(pose)
    }

    pub fn restart(&mut self) {
        self.previous_up = None;
        self.finished = false;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

/// Wall-clock source of elapsed time for a render loop, with pause.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    started: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    /// Running time since start, excluding pauses.
    pub fn elapsed(&self) -> Duration {
        let now = self.paused_at.unwrap_or_else(Instant::now);
        now.duration_since(self.started)
            .saturating_sub(self.paused_total)
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn restart(&mut self) {
        *self = Self::new();
    }
}
