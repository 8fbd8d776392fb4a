//! End-to-end generation pipeline behaviour against scripted backends

use kiln_core::Vec3;
use kiln_gen::{
    AssetRequest, AssetStatus, BackendSelector, GenerationCoordinator, KilnConfig, MockBackend,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn workspace() -> PathBuf {
    std::env::temp_dir().join(format!("kiln_pipeline_test_{}", uuid::Uuid::new_v4()))
}

fn write_png(dir: &Path, name: &str, shade: u8) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    image::RgbaImage::from_pixel(8, 8, image::Rgba([shade, 80, 40, 255]))
        .save(&path)
        .unwrap();
    path
}

async fn coordinator(
    root: &Path,
    max_parallel: usize,
    backends: Vec<(MockBackend, i32)>,
) -> Arc<GenerationCoordinator> {
    let mut config = KilnConfig::default();
    config.workspace_root = root.to_path_buf();
    config.generation.max_parallel = max_parallel;

    let selector = Arc::new(BackendSelector::new());
    for (backend, priority) in backends {
        selector.register(Arc::new(backend), priority);
    }
    selector.probe().await;
    Arc::new(GenerationCoordinator::new(config, selector))
}

#[tokio::test]
async fn test_second_request_is_cached_with_identical_content() {
    let root = workspace();
    let image = write_png(&root.join("inputs"), "chair.png", 120);
    let mock = MockBackend::new();
    let calls = mock.clone();
    let coord = coordinator(&root, 4, vec![(mock, 10)]).await;

    let request = AssetRequest::from_image("chair", &image)
        .in_session("s1")
        .with_param("texture_resolution", 512i64);

    let first = coord.generate(request.clone()).await;
    assert_eq!(first.status, AssetStatus::Success, "{:?}", first.message);
    let second = coord.generate(request).await;
    assert_eq!(second.status, AssetStatus::Cached);

    let generated = std::fs::read(first.artifact_path().unwrap()).unwrap();
    let cached = std::fs::read(second.artifact_path().unwrap()).unwrap();
    assert_eq!(generated, cached);
    assert_eq!(calls.calls(), 1);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_param_order_does_not_change_key() {
    let root = workspace();
    let image = write_png(&root.join("inputs"), "lamp.png", 30);
    let mock = MockBackend::new();
    let calls = mock.clone();
    let coord = coordinator(&root, 4, vec![(mock, 10)]).await;

    let forward = AssetRequest::from_image("a", &image)
        .with_param("remesh", "quad")
        .with_param("foreground_ratio", 0.9)
        .with_param("texture_resolution", 2048i64);
    let reversed = AssetRequest::from_image("b", &image)
        .with_param("texture_resolution", 2048i64)
        .with_param("foreground_ratio", 0.9)
        .with_param("remesh", "quad");

    assert_eq!(coord.generate(forward).await.status, AssetStatus::Success);
    assert_eq!(coord.generate(reversed).await.status, AssetStatus::Cached);
    assert_eq!(calls.calls(), 1);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_missing_artifact_triggers_regeneration() {
    let root = workspace();
    let image = write_png(&root.join("inputs"), "rock.png", 200);
    let mock = MockBackend::new();
    let calls = mock.clone();
    let coord = coordinator(&root, 4, vec![(mock, 10)]).await;

    let request = AssetRequest::from_image("rock", &image).in_session("s1");
    assert_eq!(coord.generate(request.clone()).await.status, AssetStatus::Success);

    let hit = coord.generate(request.clone()).await;
    assert_eq!(hit.status, AssetStatus::Cached);

    // Index entries survive, artifacts vanish
    std::fs::remove_file(hit.artifact_path().unwrap()).unwrap();
    for entry in std::fs::read_dir(coord.cache().global_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "glb") {
            std::fs::remove_file(path).unwrap();
        }
    }

    let regenerated = coord.generate(request.clone()).await;
    assert_eq!(regenerated.status, AssetStatus::Success, "{:?}", regenerated.message);
    assert_eq!(calls.calls(), 2);
    assert_eq!(coord.generate(request).await.status, AssetStatus::Cached);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_fallback_skips_unavailable_and_failed_backends() {
    let root = workspace();
    let a = MockBackend::new().named("a").unavailable();
    let b = MockBackend::new().named("b").failing("service overloaded");
    let c = MockBackend::new().named("c");
    let (a_calls, b_calls, c_calls) = (a.clone(), b.clone(), c.clone());
    let coord = coordinator(&root, 4, vec![(a, 100), (b, 50), (c, 10)]).await;

    let result = coord
        .generate(AssetRequest::from_prompt("stool", "a three-legged stool"))
        .await;

    assert_eq!(result.status, AssetStatus::Success, "{:?}", result.message);
    assert_eq!(result.metadata.as_ref().unwrap().backend, "c");
    let tried: Vec<&str> = result.attempts.iter().map(|a| a.backend.as_str()).collect();
    assert_eq!(tried, vec!["b", "c"]);
    assert!(result.attempts[0]
        .message
        .as_deref()
        .unwrap()
        .contains("service overloaded"));

    assert_eq!(a_calls.calls(), 0);
    assert_eq!(b_calls.calls(), 1);
    assert_eq!(c_calls.calls(), 1);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_exhausted_chain_reports_every_error() {
    let root = workspace();
    let coord = coordinator(
        &root,
        4,
        vec![
            (MockBackend::new().named("first").failing("quota exceeded"), 20),
            (MockBackend::new().named("second").failing("server offline"), 10),
        ],
    )
    .await;

    let result = coord
        .generate(AssetRequest::from_prompt("vase", "a blue vase"))
        .await;

    assert_eq!(result.status, AssetStatus::Failed);
    let message = result.message.unwrap();
    assert!(message.contains("quota exceeded"));
    assert!(message.contains("server offline"));
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(coord.generation_stats().failed_generations, 1);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_never_exceeds_max_parallel() {
    let root = workspace();
    let mock = MockBackend::new().with_delay(Duration::from_millis(40));
    let tracker = mock.clone();
    let coord = coordinator(&root, 4, vec![(mock, 10)]).await;

    let requests: Vec<AssetRequest> = (0..20)
        .map(|i| AssetRequest::from_prompt(format!("item{}", i), format!("crate number {}", i)))
        .collect();
    let result = coord.generate_batch(requests, 20, None).await;

    assert_eq!(result.total, 20);
    assert_eq!(result.successes.len(), 20, "{:?}", result.failures);
    assert_eq!(result.success_rate, 1.0);
    assert!(tracker.peak_concurrency() <= 4, "peak {}", tracker.peak_concurrency());
    assert!(coord.jobs().peak_running() <= 4);
    assert!(coord.jobs().peak_running() >= 1);
    assert_eq!(coord.jobs().running_count(), 0);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_limit_below_coordinator_limit_is_honoured() {
    let root = workspace();
    let mock = MockBackend::new().with_delay(Duration::from_millis(40));
    let tracker = mock.clone();
    let coord = coordinator(&root, 8, vec![(mock, 10)]).await;

    let requests: Vec<AssetRequest> = (0..20)
        .map(|i| AssetRequest::from_prompt(format!("bolt{}", i), format!("bolt size {}", i)))
        .collect();
    let result = coord.generate_batch(requests, 4, None).await;

    assert_eq!(result.successes.len(), 20, "{:?}", result.failures);
    assert!(tracker.peak_concurrency() <= 4, "peak {}", tracker.peak_concurrency());
    assert!(coord.jobs().peak_running() <= 4);
    assert_eq!(coord.jobs().running_count(), 0);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_invalid_artifact_is_never_cached() {
    let root = workspace();
    let junk = MockBackend::new().named("junk").producing(b"glTF\x02\x00\x00\x00".to_vec());
    let coord = coordinator(&root, 2, vec![(junk, 90), (MockBackend::new(), 10)]).await;

    let request = AssetRequest::from_prompt("vase", "a tall vase").in_session("s2");
    let first = coord.generate(request.clone()).await;
    assert_eq!(first.status, AssetStatus::Success, "{:?}", first.message);
    assert_eq!(first.attempts[0].backend, "junk");
    assert_ne!(first.attempts[0].outcome, kiln_gen::AttemptOutcome::Succeeded);
    assert_eq!(first.metadata.as_ref().unwrap().backend, "mock");

    let second = coord.generate(request).await;
    assert_eq!(second.status, AssetStatus::Cached);
    let report = kiln_mesh::validate_mesh(second.artifact_path().unwrap());
    assert!(report.valid, "{:?}", report.errors);
    assert_eq!(report.triangle_count, 12);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_batch_mixes_hits_generations_and_failures() {
    let root = workspace();
    let inputs = root.join("inputs");
    let table = write_png(&inputs, "table.png", 10);
    let shelf = write_png(&inputs, "shelf.png", 250);
    let coord = coordinator(&root, 2, vec![(MockBackend::new(), 10)]).await;

    // Warm the cache for one item
    let warm = coord.generate(AssetRequest::from_image("warm", &table)).await;
    assert_eq!(warm.status, AssetStatus::Success);

    let requests = vec![
        AssetRequest::from_image("table", &table),
        AssetRequest::from_image("shelf", &shelf).with_target_size(Vec3::new(1.0, 2.0, 0.5)),
        AssetRequest::from_image("ghost", inputs.join("missing.png")),
    ];
    let result = coord.generate_batch(requests, 3, None).await;

    assert_eq!(result.cache_hit_count, 1);
    assert_eq!(result.new_generation_count, 1);
    assert_eq!(result.failed_ids(), vec!["ghost"]);
    assert!((result.success_rate - 2.0 / 3.0).abs() < 1e-9);

    let shelf_result = result
        .successes
        .iter()
        .find(|r| r.asset_id == "shelf")
        .unwrap();
    let [min, max] = shelf_result.metadata.as_ref().unwrap().bounds.unwrap();
    // unit box fitted uniformly into 1 x 2 x 0.5
    for axis in 0..3 {
        assert!((max[axis] - min[axis] - 0.5).abs() < 1e-4);
    }

    std::fs::remove_dir_all(&root).ok();
}
