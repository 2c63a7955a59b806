//! `doctor` command: checks whether fixtures can run on this machine.

use std::path::PathBuf;

use crate::config::FixtureSettings;
use crate::engine::detect::check_docker;
use crate::fixture::{FixtureRegistry, ImageSource};

/// Outcome of one check.
#[derive(Debug, PartialEq, Eq)]
enum Check {
    Pass(String),
    Fail(String),
}

impl Check {
    fn print(&self) {
        match self {
            Check::Pass(msg) => println!("  [pass] {msg}"),
            Check::Fail(msg) => println!("  [FAIL] {msg}"),
        }
    }

    fn failed(&self) -> bool {
        matches!(self, Check::Fail(_))
    }
}

/// Run all checks and fail if any of them did.
pub async fn run_doctor_command(definitions: Option<PathBuf>) -> anyhow::Result<()> {
    println!("fixture-dock doctor");
    println!();

    let mut checks = Vec::new();

    let detection = check_docker().await;
    checks.push(if detection.status.is_ok() {
        Check::Pass("Docker daemon answers".to_string())
    } else {
        Check::Fail(detection.to_string())
    });

    match FixtureSettings::from_env() {
        Ok(mut settings) => {
            if definitions.is_some() {
                settings.definitions = definitions;
            }
            checks.push(Check::Pass("Settings are valid".to_string()));
            checks.extend(registry_checks(&settings));
        }
        Err(e) => checks.push(Check::Fail(e.to_string())),
    }

    for check in &checks {
        check.print();
    }
    println!();

    let failed = checks.iter().filter(|c| c.failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    println!("All checks passed.");
    Ok(())
}

/// Definitions load and every build context has its Dockerfile.
fn registry_checks(settings: &FixtureSettings) -> Vec<Check> {
    let registry = match FixtureRegistry::from_settings(settings) {
        Ok(registry) => registry,
        Err(e) => return vec![Check::Fail(e.to_string())],
    };

    let mut checks = vec![Check::Pass(format!("{} fixtures registered", registry.len()))];
    for descriptor in registry.iter() {
        if let ImageSource::Build {
            context_dir,
            dockerfile,
        } = &descriptor.image
        {
            let path = context_dir.join(dockerfile);
            checks.push(if path.is_file() {
                Check::Pass(format!("{}: {}", descriptor.name, path.display()))
            } else {
                Check::Fail(format!("{}: missing {}", descriptor.name, path.display()))
            });
        }
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_build_contexts_fail() {
        let dir = tempfile::tempdir().unwrap();
        let settings = FixtureSettings {
            context_root: dir.path().to_path_buf(),
            ..FixtureSettings::for_tests()
        };

        let checks = registry_checks(&settings);
        assert_eq!(checks[0], Check::Pass("3 fixtures registered".to_string()));
        assert_eq!(checks.iter().filter(|c| c.failed()).count(), 3);
    }

    #[test]
    fn test_present_build_context_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("echo-server")).unwrap();
        std::fs::write(dir.path().join("echo-server/Dockerfile"), "FROM alpine:3.20\n").unwrap();
        let settings = FixtureSettings {
            context_root: dir.path().to_path_buf(),
            ..FixtureSettings::for_tests()
        };

        let checks = registry_checks(&settings);
        assert_eq!(checks.iter().filter(|c| c.failed()).count(), 2);
    }

    #[test]
    fn test_broken_definitions_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.toml");
        std::fs::write(&path, "[[fixture]]\nname = 42\n").unwrap();
        let settings = FixtureSettings {
            definitions: Some(path),
            ..FixtureSettings::for_tests()
        };

        let checks = registry_checks(&settings);
        assert_eq!(checks.len(), 1);
        assert!(checks[0].failed());
    }
}
