//! `list`, `build` and `up` commands.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::FixtureSettings;
use crate::engine::DockerEngine;
use crate::environment::FixtureEnvironment;
use crate::fixture::{FixtureDescriptor, FixtureRegistry, ImageSource, ProbeKind};

fn load_settings(definitions: Option<PathBuf>) -> anyhow::Result<FixtureSettings> {
    let mut settings = FixtureSettings::from_env()?;
    if definitions.is_some() {
        settings.definitions = definitions;
    }
    Ok(settings)
}

async fn connect(definitions: Option<PathBuf>) -> anyhow::Result<Arc<FixtureEnvironment>> {
    let settings = load_settings(definitions)?;
    let registry = FixtureRegistry::from_settings(&settings)?;
    let engine = DockerEngine::connect().await?;
    Ok(FixtureEnvironment::new(Arc::new(engine), settings, registry))
}

/// Print the registered fixtures.
pub fn run_list_command(definitions: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = load_settings(definitions)?;
    let registry = FixtureRegistry::from_settings(&settings)?;

    println!("{:<16} {:<12} {:<28} IMAGE", "NAME", "PORTS", "PROBE");
    println!("{}", "-".repeat(80));
    for descriptor in registry.iter() {
        println!(
            "{:<16} {:<12} {:<28} {}",
            descriptor.name,
            ports_column(descriptor),
            probe_column(&descriptor.probe),
            image_column(&descriptor.image)
        );
    }
    Ok(())
}

/// Resolve (build or pull) the image of one fixture.
pub async fn run_build_command(fixture: &str, definitions: Option<PathBuf>) -> anyhow::Result<()> {
    let env = connect(definitions).await?;
    let descriptor = env.registry().lookup(fixture)?;

    println!("Resolving image for '{}'...", descriptor.name);
    let image = env.controller().images().resolve(&descriptor).await?;
    println!("  {} ({})", image.key, image.id);
    Ok(())
}

/// Provision one fixture, print where it is and wait for Ctrl-C.
pub async fn run_up_command(
    fixture: &str,
    json: bool,
    definitions: Option<PathBuf>,
) -> anyhow::Result<()> {
    let env = connect(definitions).await?;
    let holder = env.holder();
    let handle = tokio::select! {
        result = holder.get(fixture) => result?,
        _ = tokio::signal::ctrl_c() => {
            // The cancelled get removes its container in the background.
            env.controller().finish_background_teardowns().await;
            anyhow::bail!("interrupted while starting '{fixture}'");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
    } else {
        println!("{} is ready", handle.fixture_name());
        println!("  container: {}", handle.container_id());
        for (container_port, host_port) in handle.ports() {
            println!(
                "  port {:<6} -> {}:{}",
                container_port,
                handle.ip_address(),
                host_port
            );
        }
        if let Some(credentials) = handle.credentials() {
            println!("  login:     {} / {}", credentials.username, credentials.password);
        }
        println!();
        println!("Press Ctrl-C to stop.");
    }

    let waited = tokio::signal::ctrl_c().await;
    let report = holder.release_all().await;
    env.controller().finish_background_teardowns().await;
    waited?;

    for failure in &report.failures {
        eprintln!("warning: {failure}");
    }
    if !json {
        println!("Removed {}.", report.released.join(", "));
    }
    Ok(())
}

fn ports_column(descriptor: &FixtureDescriptor) -> String {
    descriptor
        .exposed_ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn probe_column(probe: &ProbeKind) -> String {
    match probe {
        ProbeKind::Tcp { port } => format!("tcp:{port}"),
        ProbeKind::SshBanner { port } => format!("ssh-banner:{port}"),
        ProbeKind::LogLine { pattern } => format!("log:{pattern}"),
        ProbeKind::Http { port, path } => format!("http:{port}{path}"),
    }
}

fn image_column(image: &ImageSource) -> String {
    match image {
        ImageSource::Registry { reference } => reference.clone(),
        ImageSource::Build { context_dir, .. } => format!("build {}", context_dir.display()),
    }
}
