//! Control points and the smooth curve fitted through them.
//!
//! A [`ControlPath`] is the mutable, ordered list of clicks. Fitting it
//! produces a [`Curve`], an immutable value that requests and timelines keep
//! by value, so later edits to the path never reach work already in flight.
//!
//! The basis is a centripetal Catmull-Rom spline (alpha = 0.5) evaluated as
//! cubic Hermite segments, with reflected ghost points at both ends. Queries
//! are parameterized by arc length, measured by fixed-step chord integration.
//! Resampling places points at equal straight-line spacing, found by walking
//! the curve with a fixed chord and bisecting on the chord until the walk
//! ends on the last control point.

use std::sync::Arc;

use nalgebra::{Point2, Point3, Vector3};

use crate::error::CurveError;

/// Consecutive control points closer than this are merged.
const DEDUP_EPSILON: f64 = 1e-9;
const ALPHA: f64 = 0.5;
const STEPS_PER_SEGMENT: usize = 128;
/// Bisection rounds for the resampling chord and for each step along it.
const CHORD_ITERATIONS: usize = 52;
const STEP_ITERATIONS: usize = 40;

/// Identifies the spline basis and integration scheme. Part of every cache
/// fingerprint, so changing either invalidates old entries.
pub const CURVE_BASIS_TAG: &str = "centripetal-catmull-rom/alpha=0.5/steps=128/equal-chord";

/// A user click in world space and the order it was inserted in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub position: Point3<f64>,
    pub index: usize,
}

/// Ordered control points as edited by the user.
#[derive(Debug, Clone, Default)]
pub struct ControlPath {
    points: Vec<ControlPoint>,
    next_index: usize,
}

impl ControlPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point and return its insertion index.
    pub fn push(&mut self, position: Point3<f64>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.points.push(ControlPoint { position, index });
        index
    }

    /// Append an image-space click lying in the `z = 0` plane.
    pub fn push_planar(&mut self, position: Point2<f64>) -> usize {
        self.push(Point3::new(position.x, position.y, 0.0))
    }

    /// Remove the point with the given insertion index.
    pub fn remove(&mut self, index: usize) -> Option<ControlPoint> {
        let position = self.points.iter().position(|p| p.index == index)?;
        Some(self.points.remove(position))
    }

    /// Move the point with the given insertion index. Order is unchanged.
    pub fn move_point(&mut self, index: usize, position: Point3<f64>) -> bool {
        match self.points.iter_mut().find(|p| p.index == index) {
            Some(point) => {
                point.position = position;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn points(&self) -> &[ControlPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Fit a curve through a snapshot of the current points.
    pub fn fit(&self) -> Curve {
        Curve::fit(self.points.iter().map(|p| p.position))
    }
}

/// Smooth interpolating curve, or the undefined curve when fewer than two
/// distinct finite points were given. Cloning is cheap and shares the fitted
/// data.
#[derive(Debug, Clone)]
pub struct Curve {
    spline: Result<Arc<Spline>, CurveError>,
}

impl PartialEq for Curve {
    fn eq(&self, other: &Self) -> bool {
        self.knots() == other.knots()
    }
}

impl Curve {
    /// Non-finite points are skipped. The curve is undefined when fewer than
    /// two distinct points remain or their span overflows.
    pub fn fit(points: impl IntoIterator<Item = Point3<f64>>) -> Self {
        let mut knots: Vec<Point3<f64>> = Vec::new();
        for point in points {
            if !point.coords.iter().all(|c| c.is_finite()) {
                continue;
            }
            if knots
                .last()
                .is_none_or(|last| (point - last).norm() > DEDUP_EPSILON)
            {
                knots.push(point);
            }
        }
        let distinct = knots.len();
        if distinct < 2 {
            return Self {
                spline: Err(CurveError::Undefined { distinct }),
            };
        }
        let spline = Spline::new(knots);
        if !spline.length().is_finite() {
            return Self {
                spline: Err(CurveError::NonFiniteLength),
            };
        }
        Self {
            spline: Ok(Arc::new(spline)),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.spline.is_ok()
    }

    /// The de-duplicated control points the curve interpolates.
    pub fn knots(&self) -> &[Point3<f64>] {
        match &self.spline {
            Ok(spline) => &spline.knots,
            Err(_) => &[],
        }
    }

    fn spline(&self) -> Result<&Spline, CurveError> {
        self.spline.as_deref().map_err(Clone::clone)
    }

    /// Approximate arc length.
    pub fn length(&self) -> Result<f64, CurveError> {
        Ok(self.spline()?.length())
    }

    /// Position at fraction `t` of the arc length. `t` is clamped to `[0, 1]`.
    pub fn point_at(&self, t: f64) -> Result<Point3<f64>, CurveError> {
        let spline = self.spline()?;
        Ok(spline.point(spline.param_at_fraction(t)))
    }

    /// Unit tangent at fraction `t` of the arc length.
    pub fn tangent_at(&self, t: f64) -> Result<Vector3<f64>, CurveError> {
        let spline = self.spline()?;
        Ok(spline.tangent(spline.param_at_fraction(t)))
    }

    /// Position at arc-length distance `s` from the start, clamped to the
    /// curve.
    pub fn point_at_distance(&self, s: f64) -> Result<Point3<f64>, CurveError> {
        let spline = self.spline()?;
        Ok(spline.point(spline.param_at_distance(s)))
    }

    pub fn tangent_at_distance(&self, s: f64) -> Result<Vector3<f64>, CurveError> {
        let spline = self.spline()?;
        Ok(spline.tangent(spline.param_at_distance(s)))
    }

    /// `n` points along the curve with equal straight-line distance between
    /// neighbours, first and last on the curve's endpoints.
    pub fn resample(&self, n: usize) -> Result<Vec<Point3<f64>>, CurveError> {
        Ok(self
            .resample_frames(n)?
            .into_iter()
            .map(|(point, _)| point)
            .collect())
    }

    /// Like [`Curve::resample`], with the unit tangent at each point.
    pub fn resample_frames(
        &self,
        n: usize,
    ) -> Result<Vec<(Point3<f64>, Vector3<f64>)>, CurveError> {
        let spline = self.spline()?;
        Ok(spline
            .equal_chord_params(n)
            .into_iter()
            .map(|u| (spline.point(u), spline.tangent(u)))
            .collect())
    }
}

/// One Hermite segment between two knots.
#[derive(Debug, Clone, Copy)]
struct Segment {
    p1: Point3<f64>,
    p2: Point3<f64>,
    m1: Vector3<f64>,
    m2: Vector3<f64>,
}

impl Segment {
    /// Centripetal Catmull-Rom segment from `p1` to `p2`, with tangents
    /// rescaled to the local parameter `s ∈ [0, 1]`.
    fn centripetal(p0: Point3<f64>, p1: Point3<f64>, p2: Point3<f64>, p3: Point3<f64>) -> Self {
        let d0 = knot_interval(&p0, &p1);
        let d1 = knot_interval(&p1, &p2);
        let d2 = knot_interval(&p2, &p3);

        let m1 = ((p1 - p0) / d0 - (p2 - p0) / (d0 + d1) + (p2 - p1) / d1) * d1;
        let m2 = ((p2 - p1) / d1 - (p3 - p1) / (d1 + d2) + (p3 - p2) / d2) * d1;

        Self { p1, p2, m1, m2 }
    }

    #[inline]
    fn point(&self, s: f64) -> Point3<f64> {
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        Point3::from(self.p1.coords * h00 + self.m1 * h10 + self.p2.coords * h01 + self.m2 * h11)
    }

    #[inline]
    fn derivative(&self, s: f64) -> Vector3<f64> {
        let s2 = s * s;
        let h00 = 6.0 * s2 - 6.0 * s;
        let h10 = 3.0 * s2 - 4.0 * s + 1.0;
        let h01 = -6.0 * s2 + 6.0 * s;
        let h11 = 3.0 * s2 - 2.0 * s;
        self.p1.coords * h00 + self.m1 * h10 + self.p2.coords * h01 + self.m2 * h11
    }
}

fn knot_interval(a: &Point3<f64>, b: &Point3<f64>) -> f64 {
    (b - a).norm().powf(ALPHA)
}

#[derive(Debug)]
struct Spline {
    knots: Vec<Point3<f64>>,
    segments: Vec<Segment>,
    /// Cumulative `(parameter, arc length)` pairs, parameter in
    /// `[0, segments.len()]`.
    table: Vec<(f64, f64)>,
    /// Curve position at each table entry.
    samples: Vec<Point3<f64>>,
}

impl Spline {
    /// Requires at least two knots with no consecutive duplicates.
    fn new(knots: Vec<Point3<f64>>) -> Self {
        let n = knots.len();
        let head = knots[0] + (knots[0] - knots[1]);
        let tail = knots[n - 1] + (knots[n - 1] - knots[n - 2]);

        let mut extended = Vec::with_capacity(n + 2);
        extended.push(head);
        extended.extend_from_slice(&knots);
        extended.push(tail);

        let segments: Vec<Segment> = extended
            .windows(4)
            .map(|w| Segment::centripetal(w[0], w[1], w[2], w[3]))
            .collect();

        let mut table = Vec::with_capacity(segments.len() * STEPS_PER_SEGMENT + 1);
        let mut samples = Vec::with_capacity(table.capacity());
        table.push((0.0, 0.0));
        samples.push(segments[0].p1);
        let mut previous = segments[0].p1;
        let mut total = 0.0;
        for (i, segment) in segments.iter().enumerate() {
            for step in 1..=STEPS_PER_SEGMENT {
                let s = step as f64 / STEPS_PER_SEGMENT as f64;
                let point = segment.point(s);
                total += (point - previous).norm();
                previous = point;
                table.push((i as f64 + s, total));
                samples.push(point);
            }
        }

        Self {
            knots,
            segments,
            table,
            samples,
        }
    }

    fn length(&self) -> f64 {
        self.table.last().map_or(0.0, |&(_, s)| s)
    }

    fn param_at_fraction(&self, t: f64) -> f64 {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        if t >= 1.0 {
            return self.segments.len() as f64;
        }
        self.param_at_distance(t * self.length())
    }

    fn param_at_distance(&self, s: f64) -> f64 {
        let length = self.length();
        if s.is_nan() || s <= 0.0 {
            return 0.0;
        }
        if s >= length {
            return self.segments.len() as f64;
        }
        let idx = self.table.partition_point(|&(_, acc)| acc < s);
        let (u0, s0) = self.table[idx - 1];
        let (u1, s1) = self.table[idx];
        if s1 - s0 <= f64::EPSILON {
            return u1;
        }
        u0 + (u1 - u0) * (s - s0) / (s1 - s0)
    }

    fn distance_at_param(&self, u: f64) -> f64 {
        let idx = self.table.partition_point(|&(p, _)| p < u);
        if idx == 0 {
            return 0.0;
        }
        let Some(&(u1, s1)) = self.table.get(idx) else {
            return self.length();
        };
        let (u0, s0) = self.table[idx - 1];
        s0 + (s1 - s0) * (u - u0) / (u1 - u0)
    }

    /// Walk from the start in steps of straight-line length `chord`, taking
    /// the first point at that distance each time. Returns the parameters
    /// reached and the arc length left after the last one, negative when the
    /// walk ran off the end before placing `count` points.
    fn chord_walk(&self, count: usize, chord: f64) -> (Vec<f64>, f64) {
        let mut params = Vec::with_capacity(count);
        let mut u = 0.0;
        let mut anchor = self.samples[0];
        let mut cursor = 1;
        params.push(u);
        for placed in 1..count {
            while cursor < self.samples.len() && (self.samples[cursor] - anchor).norm() < chord {
                cursor += 1;
            }
            if cursor == self.samples.len() {
                return (params, -chord * (count - placed) as f64);
            }
            let mut lo = self.table[cursor - 1].0.max(u);
            let mut hi = self.table[cursor].0;
            for _ in 0..STEP_ITERATIONS {
                let mid = 0.5 * (lo + hi);
                if (self.point(mid) - anchor).norm() < chord {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            u = hi;
            anchor = self.point(u);
            params.push(u);
        }
        (params, self.length() - self.distance_at_param(u))
    }

    /// Parameters of `count` points with equal straight-line spacing, the
    /// first and last on the curve's endpoints.
    fn equal_chord_params(&self, count: usize) -> Vec<f64> {
        let end = self.segments.len() as f64;
        match count {
            0 => return Vec::new(),
            1 => return vec![0.0],
            2 => return vec![0.0, end],
            _ => {}
        }
        // A chord never exceeds the arc it spans, so the arc spacing
        // overshoots and a zero chord falls short.
        let mut lo = 0.0;
        let mut hi = self.length() / (count - 1) as f64;
        let mut best = self.chord_walk(count, lo).0;
        for _ in 0..CHORD_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            let (params, remaining) = self.chord_walk(count, mid);
            if remaining >= 0.0 {
                lo = mid;
                best = params;
            } else {
                hi = mid;
            }
        }
        if best.len() == count {
            best[count - 1] = end;
        }
        best
    }

    fn locate(&self, u: f64) -> (&Segment, f64) {
        let last = self.segments.len() - 1;
        let index = (u.floor().max(0.0) as usize).min(last);
        (&self.segments[index], (u - index as f64).clamp(0.0, 1.0))
    }

    fn point(&self, u: f64) -> Point3<f64> {
        let (segment, s) = self.locate(u);
        segment.point(s)
    }

    fn tangent(&self, u: f64) -> Vector3<f64> {
        let (segment, s) = self.locate(u);
        let derivative = segment.derivative(s);
        let norm = derivative.norm();
        if norm > 1e-12 {
            derivative / norm
        } else {
            (segment.p2 - segment.p1).normalize()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn arch() -> Curve {
        Curve::fit([
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 3.0, 0.0),
            Point3::new(7.0, 4.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
        ])
    }

    #[test]
    fn test_undefined_with_fewer_than_two_points() {
        let empty = Curve::fit([]);
        assert!(!empty.is_valid());
        assert_eq!(empty.point_at(0.5), Err(CurveError::Undefined { distinct: 0 }));

        let single = Curve::fit([Point3::new(1.0, 2.0, 3.0)]);
        assert!(single.length().is_err());
        assert!(single.resample(4).is_err());

        let coincident = Curve::fit([Point3::new(1.0, 1.0, 1.0); 3]);
        assert_eq!(
            coincident.tangent_at(0.0),
            Err(CurveError::Undefined { distinct: 1 })
        );
    }

    #[test]
    fn test_interpolates_endpoints_and_knots() {
        let curve = arch();
        assert_eq!(curve.point_at(0.0).unwrap(), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(curve.point_at(1.0).unwrap(), Point3::new(10.0, 0.0, 0.0));
        assert_eq!(curve.point_at(2.0).unwrap(), Point3::new(10.0, 0.0, 0.0));
        assert_eq!(curve.point_at(f64::NAN).unwrap(), Point3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_straight_line_length_and_midpoint() {
        let curve = Curve::fit([Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)]);
        assert_relative_eq!(curve.length().unwrap(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(
            curve.point_at(0.5).unwrap(),
            Point3::new(5.0, 0.0, 0.0),
            epsilon = 1e-9
        );
        assert_relative_eq!(curve.tangent_at(0.3).unwrap(), Vector3::x(), epsilon = 1e-9);
    }

    #[test]
    fn test_duplicates_are_removed_without_nan() {
        let curve = Curve::fit([
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(5.0, 5.0, 0.0),
        ]);
        assert_eq!(curve.knots().len(), 3);
        for (point, tangent) in curve.resample_frames(50).unwrap() {
            assert!(point.coords.iter().all(|c| c.is_finite()));
            assert_relative_eq!(tangent.norm(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_resample_is_equidistant_for_uneven_clicks() {
        let curve = arch();
        for n in [3, 5, 40] {
            let points = curve.resample(n).unwrap();
            assert_eq!(points.len(), n);
            assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
            assert_relative_eq!(points[n - 1], Point3::new(10.0, 0.0, 0.0), epsilon = 1e-12);
            let gaps: Vec<f64> = points.windows(2).map(|w| (w[1] - w[0]).norm()).collect();
            // Chords are never longer than the arc they cut.
            assert!(gaps[0] <= curve.length().unwrap() / (n - 1) as f64 + 1e-9);
            for gap in &gaps {
                assert_relative_eq!(*gap, gaps[0], max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn test_resample_straight_line_matches_arc_spacing() {
        let curve = Curve::fit([Point3::new(0.0, 0.0, 0.0), Point3::new(9.0, 0.0, 0.0)]);
        let points = curve.resample(4).unwrap();
        for (i, point) in points.iter().enumerate() {
            assert_relative_eq!(point.x, 3.0 * i as f64, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_non_finite_points_are_skipped() {
        let curve = Curve::fit([Point3::origin(), Point3::new(f64::INFINITY, 0.0, 0.0)]);
        assert!(!curve.is_valid());
        assert_eq!(curve.length(), Err(CurveError::Undefined { distinct: 1 }));

        let curve = Curve::fit([
            Point3::origin(),
            Point3::new(f64::NAN, 1.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
        ]);
        assert_eq!(curve.knots().len(), 2);
        assert_relative_eq!(curve.length().unwrap(), 4.0, epsilon = 1e-9);

        let overflow = Curve::fit([
            Point3::new(-1e308, 0.0, 0.0),
            Point3::new(1e308, 0.0, 0.0),
        ]);
        assert!(!overflow.is_valid());
        assert_eq!(overflow.point_at(0.5), Err(CurveError::NonFiniteLength));
    }

    #[test]
    fn test_resample_edge_counts() {
        let curve = arch();
        assert!(curve.resample(0).unwrap().is_empty());
        assert_eq!(curve.resample(1).unwrap(), vec![Point3::new(0.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_tangent_is_continuous_across_knots() {
        let curve = arch();
        let spline = curve.spline().unwrap();
        for knot in 1..spline.segments.len() {
            let u = knot as f64;
            let before = spline.segments[knot - 1].derivative(1.0).normalize();
            let after = spline.segments[knot].derivative(0.0).normalize();
            assert_relative_eq!(before, after, epsilon = 1e-9);
            assert_relative_eq!(spline.point(u), spline.segments[knot].p1, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_control_path_edits() {
        let mut path = ControlPath::new();
        let a = path.push_planar(Point2::new(0.0, 0.0));
        let b = path.push_planar(Point2::new(5.0, 0.0));
        let c = path.push_planar(Point2::new(10.0, 0.0));
        assert_eq!((a, b, c), (0, 1, 2));

        let snapshot = path.fit();
        assert!(path.move_point(b, Point3::new(5.0, 3.0, 0.0)));
        assert_eq!(snapshot.knots()[1], Point3::new(5.0, 0.0, 0.0));
        assert_eq!(path.fit().knots()[1], Point3::new(5.0, 3.0, 0.0));

        assert_eq!(path.remove(a).map(|p| p.index), Some(0));
        assert!(path.remove(a).is_none());
        assert_eq!(path.push(Point3::origin()), 3);
        let order: Vec<usize> = path.points().iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 2, 3]);
        path.clear();
        assert!(path.is_empty());
        assert!(!path.fit().is_valid());
    }
}
