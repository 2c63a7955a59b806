//! Image cache behaviour under concurrent first requests.
//!
//! Every test gets its own `ImageCache` so results do not depend on which
//! tests ran earlier in the same binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fixture_dock::testing::FakeEngine;
use fixture_dock::{FixtureDescriptor, ImageCache, ImageProvider, ImageSource, ProbeKind};

fn context(dir: &Path, name: &str, dockerfile: &str) -> FixtureDescriptor {
    let context_dir = dir.join(name);
    std::fs::create_dir_all(&context_dir).unwrap();
    std::fs::write(context_dir.join("Dockerfile"), dockerfile).unwrap();
    FixtureDescriptor::new(name, ImageSource::build(context_dir), ProbeKind::Tcp { port: 7 }).expose(7)
}

fn provider(engine: &Arc<FakeEngine>) -> Arc<ImageProvider> {
    Arc::new(ImageProvider::new(engine.clone(), Arc::new(ImageCache::new())))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_build_once() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = Arc::new(context(dir.path(), "sshd", "FROM ubuntu:24.04\n"));
    let engine = Arc::new(FakeEngine::new());
    engine.set_build_delay(Duration::from_millis(100));
    let provider = provider(&engine);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let provider = Arc::clone(&provider);
        let descriptor = Arc::clone(&descriptor);
        tasks.push(tokio::spawn(async move { provider.resolve(&descriptor).await }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }

    assert_eq!(engine.builds(), 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_images_build_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let sshd = context(dir.path(), "sshd", "FROM ubuntu:24.04\n");
    let echo = context(dir.path(), "echo-server", "FROM alpine:3.20\n");
    let engine = Arc::new(FakeEngine::new());
    engine.set_build_delay(Duration::from_millis(400));
    let provider = provider(&engine);

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(provider.resolve(&sshd), provider.resolve(&echo));
    a.unwrap();
    b.unwrap();

    assert_eq!(engine.builds(), 2);
    // Serialized builds would take at least 800ms.
    assert!(started.elapsed() < Duration::from_millis(750));
}

#[tokio::test]
async fn edited_context_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(&engine);

    let before = provider
        .resolve(&context(dir.path(), "sshd", "FROM ubuntu:22.04\n"))
        .await
        .unwrap();
    let after = provider
        .resolve(&context(dir.path(), "sshd", "FROM ubuntu:24.04\n"))
        .await
        .unwrap();

    assert_ne!(before.key, after.key);
    assert_eq!(engine.builds(), 2);
    assert_eq!(provider.cache().len().await, 2);
}

#[tokio::test]
async fn image_from_earlier_process_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = context(dir.path(), "sshd", "FROM ubuntu:24.04\n");
    let key = fixture_dock::image::image_key(&descriptor).await.unwrap();

    let engine = Arc::new(FakeEngine::new());
    let existing = engine.add_image(&key);
    let provider = provider(&engine);

    let image = provider.resolve(&descriptor).await.unwrap();
    assert_eq!(image.id, existing);
    assert_eq!(engine.builds(), 0);
}

#[tokio::test]
async fn failed_build_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = context(dir.path(), "sshd", "FROM ubuntu:24.04\n");
    let engine = Arc::new(FakeEngine::new());
    engine.set_failing_builds(true);
    let provider = provider(&engine);

    let (a, b) = tokio::join!(provider.resolve(&descriptor), provider.resolve(&descriptor));
    assert!(a.is_err());
    assert!(b.is_err());
    assert!(provider.cache().is_empty().await);
    assert_eq!(engine.builds(), 2);

    engine.set_failing_builds(false);
    provider.resolve(&descriptor).await.unwrap();
    assert_eq!(engine.builds(), 3);
}
