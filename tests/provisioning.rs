//! End-to-end provisioning through the public API, backed by `FakeEngine`.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fixture_dock::testing::{ContainerBehaviour, FakeEngine};
use fixture_dock::{
    FixtureDescriptor, FixtureEnvironment, FixtureError, FixtureRegistry, FixtureSettings,
    ImageCache, ImageSource, LifecycleController, LifecycleState, ProbeKind,
};

fn echo_descriptor() -> FixtureDescriptor {
    FixtureDescriptor::new(
        "echo-server",
        ImageSource::registry("example/echo:1"),
        ProbeKind::Tcp { port: 7 },
    )
    .expose(7)
}

fn controller(engine: &Arc<FakeEngine>, settings: FixtureSettings) -> LifecycleController {
    LifecycleController::new(engine.clone(), Arc::new(ImageCache::new()), settings)
}

#[tokio::test]
async fn echo_server_is_usable_when_provision_returns() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller(&engine, FixtureSettings::for_tests());

    let mut instance = controller
        .provision(Arc::new(echo_descriptor()))
        .await
        .unwrap();
    let handle = instance.handle().unwrap();

    let mut stream = tokio::net::TcpStream::connect((handle.ip_address(), handle.resolved_port(7).unwrap()))
        .await
        .unwrap();
    stream.write_all(b"hello fixture").await.unwrap();
    let mut echoed = vec![0u8; 13];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"hello fixture");

    controller.teardown(&mut instance).await.unwrap();
    assert!(!engine.exists(handle.container_id()));
}

#[tokio::test]
async fn sequential_provisions_yield_different_containers() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller(&engine, FixtureSettings::for_tests());
    let descriptor = Arc::new(echo_descriptor());

    let mut first = controller.provision(Arc::clone(&descriptor)).await.unwrap();
    controller.teardown(&mut first).await.unwrap();
    let mut second = controller.provision(descriptor).await.unwrap();
    controller.teardown(&mut second).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(engine.created(), 2);
}

#[tokio::test]
async fn teardown_twice_is_harmless() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller(&engine, FixtureSettings::for_tests());
    let mut instance = controller
        .provision(Arc::new(echo_descriptor()))
        .await
        .unwrap();

    assert!(controller.teardown(&mut instance).await.is_ok());
    assert!(controller.teardown(&mut instance).await.is_ok());
    assert_eq!(instance.state(), LifecycleState::Removed);
}

#[tokio::test]
async fn probe_that_never_passes_fails_after_teardown() {
    let engine = Arc::new(FakeEngine::new());
    engine.set_behaviour("echo-server", ContainerBehaviour::Unresponsive);
    let settings = FixtureSettings {
        startup_timeout: Duration::from_millis(250),
        ..FixtureSettings::for_tests()
    };
    let controller = controller(&engine, settings);

    let err = controller
        .provision(Arc::new(echo_descriptor()))
        .await
        .unwrap_err();

    let FixtureError::Provision(failure) = err else {
        panic!("expected provision failure");
    };
    assert_eq!(failure.fixture, "echo-server");
    assert_eq!(failure.image, "example/echo:1");
    assert_eq!(failure.logs, vec!["waiting for configuration...".to_string()]);
    assert_eq!(engine.created(), 1);
    assert_eq!(engine.removed(), 1);
    assert!(failure.to_string().contains("--- container output ---"));
}

#[tokio::test]
async fn fixtures_from_definitions_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixtures.toml");
    std::fs::write(
        &path,
        r#"
[[fixture]]
name = "redis"
exposed_ports = [6379]
image = { kind = "registry", reference = "redis:7-alpine" }
probe = { kind = "log_line", pattern = "listening on port 6379" }
env = { REDIS_ARGS = "--save ''" }
"#,
    )
    .unwrap();

    let settings = FixtureSettings {
        definitions: Some(path),
        context_root: dir.path().join("contexts"),
        ..FixtureSettings::for_tests()
    };
    let registry = FixtureRegistry::from_settings(&settings).unwrap();
    let engine = Arc::new(FakeEngine::new());
    let env = FixtureEnvironment::with_cache(
        engine.clone(),
        settings,
        registry,
        Arc::new(ImageCache::new()),
    );

    let port = env
        .scope(async |fixtures| {
            let redis = fixtures.get("redis").await.unwrap();
            redis.resolved_port(6379)
        })
        .await;

    assert!(port.is_some());
    assert_eq!(engine.pulls(), 1);
    assert_eq!(engine.running(), 0);
}

#[tokio::test]
async fn handle_serializes_coordinates() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller(&engine, FixtureSettings::for_tests());
    let descriptor = echo_descriptor().credentials("test", "test");
    let mut instance = controller.provision(Arc::new(descriptor)).await.unwrap();
    let handle = instance.handle().unwrap();

    let json = serde_json::to_value(&handle).unwrap();
    let port = handle.resolved_port(7).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "fixture": "echo-server",
            "container_id": handle.container_id(),
            "ip_address": "127.0.0.1",
            "ports": { "7": port },
            "credentials": { "username": "test", "password": "test" },
        })
    );

    controller.teardown(&mut instance).await.unwrap();
}
