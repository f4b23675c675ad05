use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use approx::assert_relative_eq;
use mpr_volume::*;
use nalgebra::{Point3, Vector3};
use ndarray::Array3;

/// Real engine with a call counter and an optional delay to widen races.
#[derive(Default)]
struct CountingEngine {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingEngine {
    fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reconstruct for CountingEngine {
    fn reconstruct(
        &self,
        volume: &Volume,
        request: &ReconstructionRequest,
        cancel: &CancelToken,
    ) -> Result<ReconstructionResult, ReconstructionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Engine.reconstruct(volume, request, cancel)
    }
}

fn grid(name: &str, n: usize) -> Volume {
    let data = Array3::from_shape_fn((n, n, n), |(z, y, x)| {
        (x as f32).sin() * 50.0 + y as f32 * 3.0 + z as f32 * 7.0
    });
    Volume::new(data, (1.0, 1.0, 1.0), FieldIdentity::new(name).unwrap()).unwrap()
}

fn arch() -> Curve {
    Curve::fit([
        Point3::new(1.0, 1.0, 2.0),
        Point3::new(3.0, 6.0, 2.0),
        Point3::new(8.0, 7.0, 2.0),
        Point3::new(11.0, 2.0, 2.0),
    ])
}

fn curved(volume: &Volume, curve: &Curve, output: OutputSize) -> ReconstructionRequest {
    ReconstructionRequest::curved(
        volume.identity().clone(),
        curve,
        DepthRange::new(0.0, 4.0),
        output,
    )
}

fn axial(volume: &Volume, position: f64) -> ReconstructionRequest {
    ReconstructionRequest::orthogonal(
        volume.identity().clone(),
        Orientation::Axial,
        position,
        OutputSize::new(8, 8),
    )
}

fn open(root: &Path, engine: CountingEngine) -> ReconstructionCache<CountingEngine> {
    ReconstructionCache::open(CacheConfig::new(root), engine).unwrap()
}

fn entry_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        // Trash directories may vanish while we walk.
        let Ok(read_dir) = fs::read_dir(&dir) else {
            continue;
        };
        for item in read_dir.flatten() {
            let path = item.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "bin") {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn reconstruction_is_deterministic() {
    let volume = grid("det", 16);
    let request = ReconstructionRequest::panoramic(
        volume.identity().clone(),
        &arch(),
        DepthRange::new(0.0, 6.0),
        OutputSize::new(48, 12),
        LateralThickness::default(),
    );
    let again = ReconstructionRequest::panoramic(
        volume.identity().clone(),
        &arch(),
        DepthRange::new(0.0, 6.0),
        OutputSize::new(48, 12),
        LateralThickness::default(),
    );
    assert_eq!(request, again);
    assert_eq!(request.fingerprint(), again.fingerprint());

    let first = reconstruct(&volume, &request).unwrap();
    let second = reconstruct(&volume, &again).unwrap();
    assert_eq!(first.pixels(), second.pixels());
}

#[test]
fn cache_round_trip_computes_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::default());
    let volume = grid("round-trip", 12);
    let request = curved(&volume, &arch(), OutputSize::new(32, 8));
    let cancel = CancelToken::new();

    let first = cache.get(&volume, &request, &cancel).unwrap();
    let second = cache.get(&volume, &request, &cancel).unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.engine().calls(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_bytes(), 32 * 8 * 4);
}

#[test]
fn curve_validity_and_endpoints() {
    assert!(!Curve::fit(Vec::<Point3<f64>>::new()).is_valid());
    assert!(!Curve::fit([Point3::new(1.0, 2.0, 3.0)]).is_valid());
    assert!(!Curve::fit([Point3::new(1.0, 2.0, 3.0); 3]).is_valid());
    assert!(matches!(
        Curve::fit([Point3::origin()]).point_at(0.5),
        Err(CurveError::Undefined { distinct: 1 })
    ));

    let curve = arch();
    assert!(curve.is_valid());
    assert_relative_eq!(curve.point_at(0.0).unwrap(), Point3::new(1.0, 1.0, 2.0), epsilon = 1e-9);
    assert_relative_eq!(curve.point_at(1.0).unwrap(), Point3::new(11.0, 2.0, 2.0), epsilon = 1e-9);
}

#[test]
fn resampling_is_equidistant() {
    // Uneven click spacing.
    let curve = Curve::fit([
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(0.5, 0.4, 0.0),
        Point3::new(6.0, 5.0, 0.0),
        Point3::new(7.0, 5.2, 0.0),
        Point3::new(12.0, 1.0, 0.0),
    ]);
    for n in [5, 17, 40] {
        let points = curve.resample(n).unwrap();
        assert_eq!(points.len(), n);
        assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
        assert_relative_eq!(points[n - 1], Point3::new(12.0, 1.0, 0.0), epsilon = 1e-9);
        let gaps: Vec<f64> = points.windows(2).map(|w| (w[1] - w[0]).norm()).collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        for gap in gaps {
            assert!((gap - mean).abs() <= mean * 1e-4, "gap {gap} vs mean {mean}");
        }
    }
}

#[test]
fn sampler_is_exact_on_the_last_voxel() {
    let volume = grid("edge", 10)
        .with_origin(Point3::new(-4.5, 2.0, 10.0))
        .unwrap();
    let last = volume.voxel_to_world(&Vector3::new(9.0, 9.0, 9.0));
    assert_eq!(Sampler::sample(&volume, &last), volume.data()[[9, 9, 9]]);
    assert_eq!(Sampler::try_sample(&volume, &(last + Vector3::x())), None);
    assert_eq!(
        Sampler::sample(&volume, &(last + Vector3::x())),
        volume.background()
    );
}

#[test]
fn invalidate_drops_one_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::default());
    let (a, b) = (grid("field-a", 8), grid("field-b", 8));
    let cancel = CancelToken::new();

    cache.get(&a, &axial(&a, 1.0), &cancel).unwrap();
    cache.get(&a, &axial(&a, 2.0), &cancel).unwrap();
    let kept = cache.get(&b, &axial(&b, 1.0), &cancel).unwrap();

    assert_eq!(cache.invalidate(a.identity()), 2);
    assert!(!cache.contains(&axial(&a, 1.0)));
    assert!(!cache.contains(&axial(&a, 2.0)));
    assert!(cache.contains(&axial(&b, 1.0)));

    let again = cache.get(&b, &axial(&b, 1.0), &cancel).unwrap();
    assert!(Arc::ptr_eq(&kept, &again));
    assert_eq!(cache.engine().calls(), 3);
}

#[test]
fn curved_scenario_on_a_small_grid() {
    let data = Array3::from_shape_fn((10, 10, 10), |(z, y, x)| {
        1.0 + x as f32 + 10.0 * y as f32 + 100.0 * z as f32
    });
    let volume = Volume::new(data, (1.0, 1.0, 1.0), FieldIdentity::new("scenario").unwrap()).unwrap();
    let mut path = ControlPath::new();
    for x in [0.0, 5.0, 10.0] {
        path.push_planar(nalgebra::Point2::new(x, 0.0));
    }
    let curve = path.fit();
    let request = ReconstructionRequest::curved(
        volume.identity().clone(),
        &curve,
        DepthRange::new(0.0, 5.0),
        OutputSize::new(64, 16),
    );

    let result = reconstruct(&volume, &request).unwrap();
    assert_eq!(result.dim(), (64, 16));
    assert!(result.pixels().iter().all(|v| v.is_finite()));

    let start = curve.point_at(0.0).unwrap();
    for y in 0..16 {
        let depth = 5.0 * y as f64 / 15.0;
        let expected = Sampler::sample(&volume, &(start + Vector3::z() * depth));
        assert_relative_eq!(result.pixels()[[0, y]], expected, epsilon = 1e-4);
    }
}

#[test]
fn camera_loops_over_the_curve() {
    let curve = Curve::fit([
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(10.0, 0.0, 0.0),
    ]);
    assert_relative_eq!(curve.length().unwrap(), 10.0, epsilon = 1e-6);
    let timeline = Timeline::build(&curve, 1.0, true).unwrap();
    let mut playback = timeline.playback();
    let pose = playback.pose_at(Duration::from_secs(25)).unwrap();
    assert_relative_eq!(pose.position, curve.point_at_distance(5.0).unwrap(), epsilon = 1e-6);
    assert_relative_eq!(pose.position.x, 5.0, epsilon = 1e-6);
    assert!(!playback.is_finished());
}

#[test]
fn concurrent_identical_requests_compute_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::slow(Duration::from_millis(50)));
    let volume = grid("concurrent", 12);
    let request = curved(&volume, &arch(), OutputSize::new(24, 6));

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| scope.spawn(|| cache.get(&volume, &request, &CancelToken::new()).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(cache.engine().calls(), 1);
    for result in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], result));
    }
}

#[test]
fn cancelled_computation_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::default());
    let volume = grid("cancel", 12);
    let request = curved(&volume, &arch(), OutputSize::new(24, 6));

    let cancelled = CancelToken::new();
    cancelled.cancel();
    let err = cache.get(&volume, &request, &cancelled).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!cache.contains(&request));
    assert!(entry_files(dir.path()).is_empty());

    // The next caller computes it.
    cache.get(&volume, &request, &CancelToken::new()).unwrap();
    assert!(cache.contains(&request));
}

#[test]
fn waiter_recomputes_after_the_first_caller_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::slow(Duration::from_millis(150)));
    let volume = grid("cancel-mid", 12);
    let request = curved(&volume, &arch(), OutputSize::new(24, 6));
    let first_token = CancelToken::new();

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| cache.get(&volume, &request, &first_token));
        std::thread::sleep(Duration::from_millis(30));
        // Blocks on the key lock held by the first caller.
        let second = scope.spawn(|| cache.get(&volume, &request, &CancelToken::new()));
        std::thread::sleep(Duration::from_millis(30));
        first_token.cancel();
        (first.join().unwrap(), second.join().unwrap())
    });

    assert!(first.unwrap_err().is_cancelled());
    let second = second.unwrap();
    assert_eq!(cache.engine().calls(), 2);
    assert_eq!(second.pixels(), reconstruct(&volume, &request).unwrap().pixels());
    assert!(cache.contains(&request));
    assert_eq!(cache.len(), 1);
    assert_eq!(entry_files(dir.path()).len(), 1);
}

#[test]
fn invalidate_during_computation_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::slow(Duration::from_millis(150)));
    let volume = grid("invalidate-mid", 12);
    let request = curved(&volume, &arch(), OutputSize::new(24, 6));

    let result = std::thread::scope(|scope| {
        let running = scope.spawn(|| cache.get(&volume, &request, &CancelToken::new()));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.invalidate(volume.identity()), 0);
        running.join().unwrap()
    });

    // The caller still gets its image; the store keeps nothing.
    assert_eq!(result.unwrap().dim(), (24, 6));
    assert!(!cache.contains(&request));
    assert_eq!(cache.total_bytes(), 0);
    assert!(entry_files(dir.path()).is_empty());

    cache.get(&volume, &request, &CancelToken::new()).unwrap();
    assert_eq!(cache.engine().calls(), 2);
    assert!(cache.contains(&request));
}

#[test]
fn invalid_request_never_reaches_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), CountingEngine::default());
    let volume = grid("invalid", 8);
    let request = curved(&volume, &Curve::fit([Point3::origin()]), OutputSize::new(4, 4));
    assert!(matches!(
        cache.get(&volume, &request, &CancelToken::new()),
        Err(ReconstructionError::Validation(ValidationError::Curve(_)))
    ));
    assert_eq!(cache.engine().calls(), 0);
}

#[test]
fn entries_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let volume = grid("persist", 12);
    let request = curved(&volume, &arch(), OutputSize::new(20, 5));
    let original = {
        let cache = open(dir.path(), CountingEngine::default());
        cache.get(&volume, &request, &CancelToken::new()).unwrap()
    };

    let reopened = open(dir.path(), CountingEngine::default());
    assert!(reopened.contains(&request));
    let loaded = reopened.get(&volume, &request, &CancelToken::new()).unwrap();
    assert_eq!(reopened.engine().calls(), 0);
    assert_eq!(loaded.pixels(), original.pixels());
}

#[test]
fn corrupt_entry_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let volume = grid("corrupt", 12);
    let request = curved(&volume, &arch(), OutputSize::new(20, 5));
    let original = {
        let cache = open(dir.path(), CountingEngine::default());
        cache.get(&volume, &request, &CancelToken::new()).unwrap()
    };

    let files = entry_files(dir.path());
    assert_eq!(files.len(), 1);
    let len = fs::metadata(&files[0]).unwrap().len() as usize;
    fs::write(&files[0], vec![0xAB; len]).unwrap();

    let reopened = open(dir.path(), CountingEngine::default());
    let recomputed = reopened.get(&volume, &request, &CancelToken::new()).unwrap();
    assert_eq!(reopened.engine().calls(), 1);
    assert_eq!(recomputed.pixels(), original.pixels());
}

#[test]
fn size_bound_evicts_least_recently_used() {
    let dir = tempfile::tempdir().unwrap();
    let entry_bytes = 8 * 8 * 4;
    let cache = ReconstructionCache::open(
        CacheConfig::new(dir.path()).with_max_bytes(3 * entry_bytes),
        CountingEngine::default(),
    )
    .unwrap();
    let volume = grid("lru", 10);
    let cancel = CancelToken::new();

    for position in 0..8 {
        cache.get(&volume, &axial(&volume, position as f64), &cancel).unwrap();
        assert!(cache.total_bytes() <= 3 * entry_bytes);
    }
    assert_eq!(cache.len(), 3);
    for position in 5..8 {
        assert!(cache.contains(&axial(&volume, position as f64)));
    }
    assert_eq!(entry_files(dir.path()).len(), 3);
}

#[test]
fn stale_format_version_is_purged() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join(format!("v{}", CACHE_FORMAT_VERSION + 1));
    fs::create_dir_all(stale.join("0123")).unwrap();
    fs::write(stale.join("0123").join("index.json"), b"{}").unwrap();

    let _cache = open(dir.path(), CountingEngine::default());
    assert!(!stale.exists());
}

#[test]
fn depth_sweep_arrives_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(open(dir.path(), CountingEngine::default()));
    let volume = Arc::new(grid("sweep", 10));
    let request = axial(&volume, 0.0);

    let frames: Vec<_> =
        prefetch_depth_sweep(&cache, &volume, &request, (0..10).map(f64::from)).collect();
    assert_eq!(frames.len(), 10);
    for (position, frame) in frames.into_iter().enumerate() {
        let frame = frame.unwrap();
        assert_eq!(frame.request().depth(), DepthRange::at(position as f64));
    }
    assert_eq!(cache.len(), 10);
    assert_eq!(cache.engine().calls(), 10);
}

#[tokio::test]
async fn async_get_shares_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(open(dir.path(), CountingEngine::default()));
    let volume = Arc::new(grid("async", 10));
    let request = axial(&volume, 4.0);

    let first = Arc::clone(&cache)
        .get_async(Arc::clone(&volume), request.clone(), CancelToken::new())
        .await
        .unwrap();
    let second = cache.get(&volume, &request, &CancelToken::new()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.engine().calls(), 1);
}
